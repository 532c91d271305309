//! Candidate selection and multi-strategy dispatch to a local node.
//!
//! Two separate concerns, kept in separate functions the way the teacher
//! keeps `backends::select` and `backends::dispatch` apart: (1) a pure,
//! synchronous ranking of online nodes (`select_candidates`), and (2) the
//! actual network attempt against a chosen node, tried in
//! `tunnel_url → ipv4 → ipv6` order (`Dispatcher::dispatch_to`).

use std::{sync::Arc, time::Duration};

use serde_json::Value;

use crate::{
    error::GatewayError,
    registry::{NodeRegistry, NodeState},
    upstream::UpstreamClient,
};

/// Rank online nodes that serve `model`, most attractive first.
///
/// Sort key: `(active_jobs - 0.1 * priority, cpu_load, failure_count)` —
/// fewer active jobs wins, a connector's priority nudges its own jobs to the
/// front of an otherwise tied queue, cpu load and failure history break
/// remaining ties. Pure function: no I/O, no locking, easy to unit-test in
/// isolation from the registry it reads from.
pub fn select_candidates(nodes: &[NodeState], model: &str, connector_priority: u8) -> Vec<NodeState> {
    let mut candidates: Vec<NodeState> = nodes
        .iter()
        .filter(|n| n.status == crate::registry::NodeStatus::Online && n.serves(model))
        .cloned()
        .collect();

    let bias = 0.1 * connector_priority as f64;
    candidates.sort_by(|a, b| {
        let key_a = (a.active_jobs as f64 - bias, a.load.cpu_or_pessimistic(), a.failure_count);
        let key_b = (b.active_jobs as f64 - bias, b.load.cpu_or_pessimistic(), b.failure_count);
        key_a
            .0
            .partial_cmp(&key_b.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(key_a.1.partial_cmp(&key_b.1).unwrap_or(std::cmp::Ordering::Equal))
            .then(key_a.2.cmp(&key_b.2))
    });
    candidates
}

/// One reachable endpoint to try, paired with a label used in logs/errors.
struct Attempt {
    label: &'static str,
    base_url: String,
}

fn build_attempts(node: &NodeState) -> Vec<Attempt> {
    let mut attempts = Vec::with_capacity(3);
    if let Some(tunnel) = &node.reachability.tunnel_url {
        let trimmed = tunnel.trim_end_matches('/');
        let with_scheme = if trimmed.contains("://") {
            trimmed.to_string()
        } else {
            format!("http://{trimmed}")
        };
        attempts.push(Attempt {
            label: "tunnel_url",
            base_url: with_scheme,
        });
    }
    if let Some(ipv4) = &node.reachability.ipv4 {
        attempts.push(Attempt {
            label: "ipv4",
            base_url: format!("http://{}:{}", ipv4, node.port),
        });
    }
    if let Some(ipv6) = &node.reachability.ipv6 {
        attempts.push(Attempt {
            label: "ipv6",
            base_url: format!("http://[{}]:{}", ipv6, node.port),
        });
    }
    attempts
}

/// Tries every reachable address of a node, in fixed priority order,
/// recomputed fresh on each call (a node's tunnel may come and go between
/// dispatches — nothing here is cached).
pub struct Dispatcher {
    client: UpstreamClient,
    registry: Arc<NodeRegistry>,
}

impl Dispatcher {
    pub fn new(client: UpstreamClient, registry: Arc<NodeRegistry>) -> Self {
        Self { client, registry }
    }

    /// Send `body` to `node`, trying `tunnel_url`, then `ipv4`, then `ipv6`.
    /// Each address tried is its own `active_jobs` attempt (incremented and
    /// decremented around that one call), but the whole call counts as at
    /// most one failure against the node's `failure_count` — trying three
    /// addresses for one logical request is not three strikes.
    pub async fn dispatch_to(&self, node: &NodeState, path: &str, body: Value) -> Result<Value, GatewayError> {
        let attempts = build_attempts(node);
        if attempts.is_empty() {
            return Err(GatewayError::NodeUnreachable {
                node_id: node.node_id.clone(),
                last_status: None,
            });
        }

        let mut last_status: Option<u16> = None;

        for attempt in &attempts {
            self.registry.begin_job(&node.node_id).await;
            let result = self.client.post_json(&attempt.base_url, path, &body, None).await;
            self.registry.end_attempt(&node.node_id).await;

            match result {
                Ok(value) => {
                    self.registry.record_dispatch_outcome(&node.node_id, false).await;
                    return Ok(value);
                }
                Err(GatewayError::UpstreamBadResponse(status)) => {
                    last_status = Some(status);
                    tracing::debug!(node_id = %node.node_id, strategy = attempt.label, status, "dispatch attempt failed");
                }
                Err(e) => {
                    tracing::debug!(node_id = %node.node_id, strategy = attempt.label, error = %e, "dispatch attempt failed");
                }
            }
        }

        self.registry.record_dispatch_outcome(&node.node_id, true).await;
        Err(GatewayError::NodeUnreachable {
            node_id: node.node_id.clone(),
            last_status,
        })
    }
}

/// Default per-upstream-call timeout when a caller doesn't override it.
pub const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(120);
