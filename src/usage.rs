//! Usage recording — the fire-and-forget external collaborator from
//! `spec.md` §6: `record(connector_id, model, provider, node_id?, tokens_in,
//! tokens_out, latency_ms, status, error?)`.
//!
//! Persistent usage aggregation and billing are explicitly out of scope
//! (`spec.md` §1) and live behind a service this gateway doesn't own. What
//! the core guarantees is the call contract: every completed request emits
//! one usage event, off the response's critical path. Realized here as a
//! structured `tracing` event (the teacher already depends on `tracing` for
//! every other ambient concern) rather than a `dyn Trait` — there is exactly
//! one implementation in this repo, and the call site in `router.rs` spawns
//! it the same way `TrafficLog::push` is non-blocking.

use serde_json::Value;

/// One usage observation for a completed (successful or failed) request.
#[derive(Debug, Clone)]
pub struct UsageEvent {
    pub connector_id: String,
    pub model: String,
    pub provider: String,
    pub node_id: Option<String>,
    pub tokens_in: Option<u64>,
    pub tokens_out: Option<u64>,
    pub latency_ms: u64,
    pub status: &'static str,
    pub error: Option<String>,
}

/// Pulls `usage.prompt_tokens`/`usage.completion_tokens` out of an
/// upstream's (already-normalized) response body, if present. Upstreams that
/// omit `usage` entirely simply yield `None` — the core never synthesizes
/// token counts it wasn't told.
pub fn extract_token_counts(response: &Value) -> (Option<u64>, Option<u64>) {
    let usage = response.get("usage");
    let tokens_in = usage.and_then(|u| u.get("prompt_tokens")).and_then(Value::as_u64);
    let tokens_out = usage.and_then(|u| u.get("completion_tokens")).and_then(Value::as_u64);
    (tokens_in, tokens_out)
}

/// Records [`UsageEvent`]s as structured log lines. Stateless and cheap to
/// construct — held behind an `Arc` on [`crate::router::RouterState`] purely
/// so it can be swapped for a real aggregation backend without touching call
/// sites, should one ever replace this external collaborator.
#[derive(Debug, Default, Clone, Copy)]
pub struct UsageRecorder;

impl UsageRecorder {
    pub fn new() -> Self {
        Self
    }

    /// Emits `event` as a `tracing::info!` record on a spawned task, so the
    /// caller's response is never held up waiting on it — matching the
    /// "must never block the reply on the caller's critical path" contract.
    pub fn record(&self, event: UsageEvent) {
        tokio::spawn(async move {
            tracing::info!(
                target: "fleetgate::usage",
                connector_id = %event.connector_id,
                model = %event.model,
                provider = %event.provider,
                node_id = event.node_id.as_deref(),
                tokens_in = event.tokens_in,
                tokens_out = event.tokens_out,
                latency_ms = event.latency_ms,
                status = event.status,
                error = event.error.as_deref(),
                "usage recorded"
            );
        });
    }
}
