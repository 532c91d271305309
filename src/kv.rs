//! External key-value store abstraction.
//!
//! `spec.md` §6 documents one external collaborator — a store supporting
//! "hash set/get-all/delete with TTL; ordered-set zadd/zremrangebyscore/
//! zcard/zcount; key expiry; pipelining" — used by two different callers: the
//! registry mirror (§4.A, hash ops) and the rate limiter (§4.G, sorted-set
//! ops). Both are realized here as one `KvStore`.
//!
//! Rather than a `dyn Trait` behind `async-trait` (a dependency the teacher
//! never reaches for), this follows the teacher's own idiom from
//! `backends/mod.rs::BackendClient` — an enum dispatching over concrete
//! backing stores, each with native `async fn`s.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use redis::{aio::ConnectionManager, AsyncCommands};

/// A key-value store backing the registry mirror and the rate limiter.
pub enum KvStore {
    /// Production / multi-replica backing store.
    Redis(RedisStore),
    /// Single-replica / dev / test stand-in — no external process required.
    InMemory(InMemoryStore),
}

impl KvStore {
    pub async fn connect_redis(url: &str) -> anyhow::Result<Self> {
        Ok(Self::Redis(RedisStore::connect(url).await?))
    }

    pub fn in_memory() -> Self {
        Self::InMemory(InMemoryStore::new())
    }

    pub async fn zadd(&self, key: &str, member: &str, score: f64) -> anyhow::Result<()> {
        match self {
            Self::Redis(s) => s.zadd(key, member, score).await,
            Self::InMemory(s) => s.zadd(key, member, score),
        }
    }

    pub async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> anyhow::Result<()> {
        match self {
            Self::Redis(s) => s.zremrangebyscore(key, min, max).await,
            Self::InMemory(s) => s.zremrangebyscore(key, min, max),
        }
    }

    pub async fn zcard(&self, key: &str) -> anyhow::Result<i64> {
        match self {
            Self::Redis(s) => s.zcard(key).await,
            Self::InMemory(s) => s.zcard(key),
        }
    }

    pub async fn expire(&self, key: &str, seconds: i64) -> anyhow::Result<()> {
        match self {
            Self::Redis(s) => s.expire(key, seconds).await,
            Self::InMemory(s) => s.expire(key, seconds),
        }
    }

    pub async fn hash_set(
        &self,
        key: &str,
        fields: HashMap<String, String>,
        ttl_seconds: i64,
    ) -> anyhow::Result<()> {
        match self {
            Self::Redis(s) => s.hash_set(key, fields, ttl_seconds).await,
            Self::InMemory(s) => s.hash_set(key, fields, ttl_seconds),
        }
    }

    pub async fn hash_get_all(&self, key: &str) -> anyhow::Result<Option<HashMap<String, String>>> {
        match self {
            Self::Redis(s) => s.hash_get_all(key).await,
            Self::InMemory(s) => s.hash_get_all(key),
        }
    }

    pub async fn hash_delete(&self, key: &str) -> anyhow::Result<()> {
        match self {
            Self::Redis(s) => s.hash_delete(key).await,
            Self::InMemory(s) => s.hash_delete(key),
        }
    }
}

/// Redis-backed store. Uses `ConnectionManager` so a dropped connection is
/// transparently re-established — the same "one long-lived, pooled client"
/// posture the teacher's `reqwest::Client` has for HTTP.
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        conn.zadd::<_, _, _, ()>(key, member, score).await?;
        Ok(())
    }

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        conn.zrembyscore::<_, _, _, ()>(key, min, max).await?;
        Ok(())
    }

    async fn zcard(&self, key: &str) -> anyhow::Result<i64> {
        let mut conn = self.conn.clone();
        Ok(conn.zcard(key).await?)
    }

    async fn expire(&self, key: &str, seconds: i64) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        conn.expire::<_, ()>(key, seconds).await?;
        Ok(())
    }

    async fn hash_set(
        &self,
        key: &str,
        fields: HashMap<String, String>,
        ttl_seconds: i64,
    ) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let pairs: Vec<(String, String)> = fields.into_iter().collect();
        conn.hset_multiple::<_, _, _, ()>(key, &pairs).await?;
        conn.expire::<_, ()>(key, ttl_seconds).await?;
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> anyhow::Result<Option<HashMap<String, String>>> {
        let mut conn = self.conn.clone();
        let map: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(if map.is_empty() { None } else { Some(map) })
    }

    async fn hash_delete(&self, key: &str) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }
}

/// Sorted-set entry: member name paired with its score.
type SortedSet = Vec<(String, f64)>;

/// In-memory stand-in for [`RedisStore`], used when no `redis_url` is
/// configured (single-replica/dev) and in tests. Same semantics: sorted sets
/// score-ordered for range trims, hashes with lazily-evaluated TTL.
pub struct InMemoryStore {
    sets: DashMap<String, SortedSet>,
    hashes: DashMap<String, (HashMap<String, String>, Instant)>,
    set_expiry: DashMap<String, Instant>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            sets: DashMap::new(),
            hashes: DashMap::new(),
            set_expiry: DashMap::new(),
        }
    }

    fn zadd(&self, key: &str, member: &str, score: f64) -> anyhow::Result<()> {
        let mut set = self.sets.entry(key.to_string()).or_default();
        set.retain(|(m, _)| m != member);
        set.push((member.to_string(), score));
        Ok(())
    }

    fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> anyhow::Result<()> {
        if let Some(mut set) = self.sets.get_mut(key) {
            set.retain(|(_, score)| *score < min || *score > max);
        }
        Ok(())
    }

    fn zcard(&self, key: &str) -> anyhow::Result<i64> {
        if self.is_expired(key) {
            return Ok(0);
        }
        Ok(self.sets.get(key).map(|s| s.len() as i64).unwrap_or(0))
    }

    fn expire(&self, key: &str, seconds: i64) -> anyhow::Result<()> {
        self.set_expiry.insert(
            key.to_string(),
            Instant::now() + Duration::from_secs(seconds.max(0) as u64),
        );
        Ok(())
    }

    fn is_expired(&self, key: &str) -> bool {
        match self.set_expiry.get(key) {
            Some(deadline) if Instant::now() > *deadline => {
                self.sets.remove(key);
                self.set_expiry.remove(key);
                true
            }
            _ => false,
        }
    }

    fn hash_set(
        &self,
        key: &str,
        fields: HashMap<String, String>,
        ttl_seconds: i64,
    ) -> anyhow::Result<()> {
        let deadline = Instant::now() + Duration::from_secs(ttl_seconds.max(0) as u64);
        self.hashes.insert(key.to_string(), (fields, deadline));
        Ok(())
    }

    fn hash_get_all(&self, key: &str) -> anyhow::Result<Option<HashMap<String, String>>> {
        match self.hashes.get(key) {
            Some(entry) if Instant::now() <= entry.1 => Ok(Some(entry.0.clone())),
            Some(_) => {
                self.hashes.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn hash_delete(&self, key: &str) -> anyhow::Result<()> {
        self.hashes.remove(key);
        Ok(())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zadd_then_zcard_reflects_member_count() {
        let store = InMemoryStore::new();
        store.zadd("k", "a", 1.0).unwrap();
        store.zadd("k", "b", 2.0).unwrap();
        assert_eq!(store.zcard("k").unwrap(), 2);
    }

    #[test]
    fn zremrangebyscore_trims_out_of_window_entries() {
        let store = InMemoryStore::new();
        store.zadd("k", "old", 1.0).unwrap();
        store.zadd("k", "new", 100.0).unwrap();
        store.zremrangebyscore("k", 50.0, f64::MAX).unwrap();
        assert_eq!(store.zcard("k").unwrap(), 1);
    }

    #[test]
    fn trimming_twice_with_no_insert_is_idempotent() {
        let store = InMemoryStore::new();
        store.zadd("k", "a", 10.0).unwrap();
        store.zremrangebyscore("k", 0.0, 5.0).unwrap();
        let first = store.zcard("k").unwrap();
        store.zremrangebyscore("k", 0.0, 5.0).unwrap();
        let second = store.zcard("k").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn zadd_with_same_member_replaces_score() {
        let store = InMemoryStore::new();
        store.zadd("k", "a", 1.0).unwrap();
        store.zadd("k", "a", 2.0).unwrap();
        assert_eq!(store.zcard("k").unwrap(), 1);
    }

    #[test]
    fn hash_roundtrips_fields() {
        let store = InMemoryStore::new();
        let mut fields = HashMap::new();
        fields.insert("status".to_string(), "online".to_string());
        store.hash_set("node:n1", fields, 90).unwrap();
        let got = store.hash_get_all("node:n1").unwrap().unwrap();
        assert_eq!(got.get("status"), Some(&"online".to_string()));
    }

    #[test]
    fn hash_delete_removes_key() {
        let store = InMemoryStore::new();
        store.hash_set("node:n1", HashMap::new(), 90).unwrap();
        store.hash_delete("node:n1").unwrap();
        assert!(store.hash_get_all("node:n1").unwrap().is_none());
    }

    #[test]
    fn deleting_twice_is_a_noop_second_time() {
        let store = InMemoryStore::new();
        store.hash_set("node:n1", HashMap::new(), 90).unwrap();
        store.hash_delete("node:n1").unwrap();
        // Second delete: no panic, state unchanged (still absent).
        store.hash_delete("node:n1").unwrap();
        assert!(store.hash_get_all("node:n1").unwrap().is_none());
    }
}
