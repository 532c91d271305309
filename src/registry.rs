//! Node registry — the ephemeral, TTL-keyed view of the self-registered
//! inference fleet.
//!
//! Single-writer discipline: every mutation takes the same
//! `tokio::sync::Mutex`, so `active_jobs` is an exact monotone counter and no
//! caller ever observes a partially-applied heartbeat. Read snapshots are
//! deep-cloned out from under the lock before use, per the Design Notes in
//! `spec.md` §9 ("avoid singletons at module scope — inject").

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::kv::KvStore;

/// One named way to reach a node, in fixed dispatch priority order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Reachability {
    pub tunnel_url: Option<String>,
    pub ipv4: Option<String>,
    pub ipv6: Option<String>,
}

impl Reachability {
    pub fn is_empty(&self) -> bool {
        self.tunnel_url.is_none() && self.ipv4.is_none() && self.ipv6.is_none()
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Load {
    pub cpu: Option<f64>,
    pub memory: Option<f64>,
}

impl Load {
    /// Missing fields are treated as `1.0` for scheduling — pessimistic, so
    /// an unreported resource never makes a node look more attractive than it is.
    pub fn cpu_or_pessimistic(&self) -> f64 {
        self.cpu.unwrap_or(1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Online,
    Degraded,
    Offline,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Online => "online",
            Self::Degraded => "degraded",
            Self::Offline => "offline",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    pub node_id: String,
    pub reachability: Reachability,
    pub port: u16,
    pub models: std::collections::HashSet<String>,
    pub load: Load,
    pub status: NodeStatus,
    pub last_seen: DateTime<Utc>,
    pub active_jobs: u32,
    pub failure_count: u32,
}

impl NodeState {
    /// Whether `model` is advertised by this node (`"*"` means any model).
    pub fn serves(&self, model: &str) -> bool {
        self.models.contains("*") || self.models.contains(model)
    }
}

/// Shared, lock-guarded map of `node_id` → [`NodeState`].
///
/// Optionally write-through to a [`KvStore`] mirror so other gateway
/// replicas (receiving heartbeats of their own) converge on the same view.
pub struct NodeRegistry {
    nodes: Mutex<HashMap<String, NodeState>>,
    mirror: Option<Arc<KvStore>>,
    liveness_ttl: Duration,
    offline_evict_delta: Duration,
    max_consecutive_failures: u32,
}

impl NodeRegistry {
    pub fn new(
        mirror: Option<Arc<KvStore>>,
        liveness_ttl: Duration,
        offline_evict_delta: Duration,
        max_consecutive_failures: u32,
    ) -> Self {
        Self {
            nodes: Mutex::new(HashMap::new()),
            mirror,
            liveness_ttl,
            offline_evict_delta,
            max_consecutive_failures,
        }
    }

    /// Insert a brand-new node, or refresh an existing one: status forced to
    /// `online`, `failure_count` reset to 0, `last_seen` updated.
    pub async fn upsert(&self, node_id: &str, reachability: Reachability, port: u16, models: std::collections::HashSet<String>, load: Load) {
        let now = Utc::now();
        let mut nodes = self.nodes.lock().await;
        let entry = nodes.entry(node_id.to_string()).or_insert_with(|| NodeState {
            node_id: node_id.to_string(),
            reachability: reachability.clone(),
            port,
            models: models.clone(),
            load,
            status: NodeStatus::Online,
            last_seen: now,
            active_jobs: 0,
            failure_count: 0,
        });
        entry.reachability = reachability;
        entry.port = port;
        entry.models = models;
        entry.load = load;
        entry.status = NodeStatus::Online;
        entry.failure_count = 0;
        entry.last_seen = now;

        if let Some(mirror) = &self.mirror {
            let snapshot = entry.clone();
            let mirror = Arc::clone(mirror);
            let ttl = self.liveness_ttl.as_secs() as i64;
            tokio::spawn(async move {
                if let Err(e) = mirror_write(&mirror, &snapshot, ttl).await {
                    tracing::warn!(error = %e, node_id = %snapshot.node_id, "registry mirror write failed");
                }
            });
        }
    }

    /// Deep-cloned view of every currently-known node.
    pub async fn snapshot(&self) -> Vec<NodeState> {
        self.nodes.lock().await.values().cloned().collect()
    }

    pub async fn get(&self, node_id: &str) -> Option<NodeState> {
        self.nodes.lock().await.get(node_id).cloned()
    }

    pub async fn evict(&self, node_id: &str) -> bool {
        let removed = self.nodes.lock().await.remove(node_id).is_some();
        if removed {
            if let Some(mirror) = &self.mirror {
                let key = format!("node:{node_id}");
                let mirror = Arc::clone(mirror);
                tokio::spawn(async move {
                    let _ = mirror.hash_delete(&key).await;
                });
            }
        }
        removed
    }

    /// Mark the beginning of a dispatch attempt: increments `active_jobs`.
    /// Called once per strategy attempt (`spec.md` §4.E step 2), not once
    /// per `dispatch_to` call.
    pub async fn begin_job(&self, node_id: &str) {
        let mut nodes = self.nodes.lock().await;
        if let Some(node) = nodes.get_mut(node_id) {
            node.active_jobs += 1;
        }
    }

    /// Mark the end of one strategy attempt: decrements `active_jobs` only.
    /// `active_jobs` never decrements below zero. Paired 1:1 with
    /// `begin_job` around every individual strategy attempt — `spec.md`
    /// §4.E's "`active_jobs` accounting is per-attempt and balanced",
    /// distinct from `failure_count`'s once-per-dispatch-call granularity.
    pub async fn end_attempt(&self, node_id: &str) {
        let mut nodes = self.nodes.lock().await;
        if let Some(node) = nodes.get_mut(node_id) {
            node.active_jobs = node.active_jobs.saturating_sub(1);
        }
    }

    /// Record the outcome of one whole `dispatch_to` call (all strategies
    /// tried), at most once per call. On success, `failure_count` resets and
    /// a `degraded` node returns to `online`. On failure, `failure_count`
    /// increments exactly once and a node crossing `max_consecutive_failures`
    /// becomes `degraded` — the REDESIGN FLAG correction in `spec.md` §4.E's
    /// closing paragraph and §9's design note over per-strategy-attempt
    /// counting.
    pub async fn record_dispatch_outcome(&self, node_id: &str, any_failure: bool) {
        let mut nodes = self.nodes.lock().await;
        if let Some(node) = nodes.get_mut(node_id) {
            if any_failure {
                node.failure_count += 1;
                if node.failure_count >= self.max_consecutive_failures {
                    node.status = NodeStatus::Degraded;
                }
            } else {
                node.failure_count = 0;
                if node.status == NodeStatus::Degraded {
                    node.status = NodeStatus::Online;
                }
            }
        }
    }

    /// One liveness sweep: evict past `offline_evict_delta`, else mark
    /// `offline` past `liveness_ttl`. Holds the lock for exactly one pass.
    pub async fn sweep(&self) {
        let now = Utc::now();
        let mut nodes = self.nodes.lock().await;
        let mut evicted = Vec::new();
        nodes.retain(|node_id, node| {
            let age = now.signed_duration_since(node.last_seen);
            if age > chrono::Duration::from_std(self.offline_evict_delta).unwrap_or_default() {
                evicted.push(node_id.clone());
                false
            } else {
                if age > chrono::Duration::from_std(self.liveness_ttl).unwrap_or_default()
                    && node.status != NodeStatus::Offline
                {
                    node.status = NodeStatus::Offline;
                }
                true
            }
        });
        drop(nodes);

        if let Some(mirror) = &self.mirror {
            for node_id in evicted {
                let key = format!("node:{node_id}");
                let mirror = Arc::clone(mirror);
                tokio::spawn(async move {
                    let _ = mirror.hash_delete(&key).await;
                });
            }
        }
    }
}

async fn mirror_write(mirror: &KvStore, node: &NodeState, ttl_seconds: i64) -> anyhow::Result<()> {
    let mut fields = HashMap::new();
    fields.insert("node_id".to_string(), node.node_id.clone());
    fields.insert(
        "tunnel_url".to_string(),
        node.reachability.tunnel_url.clone().unwrap_or_default(),
    );
    fields.insert("ipv4".to_string(), node.reachability.ipv4.clone().unwrap_or_default());
    fields.insert("ipv6".to_string(), node.reachability.ipv6.clone().unwrap_or_default());
    fields.insert("port".to_string(), node.port.to_string());
    fields.insert(
        "models".to_string(),
        serde_json::to_string(&node.models).unwrap_or_else(|_| "[]".to_string()),
    );
    fields.insert("cpu_load".to_string(), node.load.cpu_or_pessimistic().to_string());
    fields.insert(
        "memory_load".to_string(),
        node.load.memory.unwrap_or(1.0).to_string(),
    );
    fields.insert("status".to_string(), node.status.to_string());
    fields.insert("last_seen".to_string(), node.last_seen.to_rfc3339());
    fields.insert("active_jobs".to_string(), node.active_jobs.to_string());
    fields.insert("failure_count".to_string(), node.failure_count.to_string());

    mirror
        .hash_set(&format!("node:{}", node.node_id), fields, ttl_seconds)
        .await
}

/// Background task: sweeps liveness every `liveness_ttl / 2`. Spawned once
/// from `main`, the same way the teacher spawns its config-file watcher.
pub async fn spawn_liveness_sweeper(registry: Arc<NodeRegistry>, liveness_ttl: Duration) {
    let period = liveness_ttl / 2;
    let mut interval = tokio::time::interval(period.max(Duration::from_secs(1)));
    loop {
        interval.tick().await;
        registry.sweep().await;
    }
}
