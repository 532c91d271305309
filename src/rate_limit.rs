//! Sliding-window rate limiter — `spec.md` §4.G.
//!
//! Replaces the teacher's per-IP token bucket (`api/rate_limit.rs`) with a
//! two-window (60s, 3600s) sliding log backed by the external `KvStore`,
//! grounded directly on
//! `original_source/backend/app/services/rate_limiter.py`: trim+count, then
//! (if allowed) insert+expire, issued as two phases rather than one atomic
//! check-and-set — occasional single-request overshoot under concurrency is
//! accepted, persistent bypass is not.

use std::sync::Arc;

use uuid::Uuid;

use crate::kv::KvStore;

const MINUTE_WINDOW_SECONDS: i64 = 60;
const HOUR_WINDOW_SECONDS: i64 = 3600;

#[derive(Debug, Clone, PartialEq)]
pub struct RateDecision {
    pub allowed: bool,
    pub minute_remaining: i64,
    pub hour_remaining: i64,
    pub minute_reset: i64,
    pub hour_reset: i64,
}

pub struct RateLimiter {
    store: Arc<KvStore>,
}

impl RateLimiter {
    pub fn new(store: Arc<KvStore>) -> Self {
        Self { store }
    }

    /// `now` is injected (unix seconds) so callers/tests control the clock;
    /// production call sites pass `chrono::Utc::now().timestamp()`.
    pub async fn check(&self, connector_id: &str, per_minute: u32, per_hour: u32, now: i64) -> anyhow::Result<RateDecision> {
        let minute_key = format!("ratelimit:{connector_id}:minute");
        let hour_key = format!("ratelimit:{connector_id}:hour");

        // Phase 1: trim each window, then count what remains.
        self.store
            .zremrangebyscore(&minute_key, f64::MIN, (now - MINUTE_WINDOW_SECONDS) as f64)
            .await?;
        self.store
            .zremrangebyscore(&hour_key, f64::MIN, (now - HOUR_WINDOW_SECONDS) as f64)
            .await?;
        let minute_count = self.store.zcard(&minute_key).await?;
        let hour_count = self.store.zcard(&hour_key).await?;

        let allowed = minute_count < per_minute as i64 && hour_count < per_hour as i64;

        if allowed {
            // Phase 2: insert this request, refresh TTLs to 2x the window.
            let member = Uuid::new_v4().to_string();
            self.store.zadd(&minute_key, &member, now as f64).await?;
            self.store.zadd(&hour_key, &member, now as f64).await?;
            self.store.expire(&minute_key, MINUTE_WINDOW_SECONDS * 2).await?;
            self.store.expire(&hour_key, HOUR_WINDOW_SECONDS * 2).await?;
        }

        Ok(RateDecision {
            allowed,
            minute_remaining: (per_minute as i64 - minute_count - 1).max(-1),
            hour_remaining: (per_hour as i64 - hour_count - 1).max(-1),
            minute_reset: now + MINUTE_WINDOW_SECONDS,
            hour_reset: now + HOUR_WINDOW_SECONDS,
        })
    }
}
