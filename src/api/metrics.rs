//! Prometheus-compatible `/metrics` endpoint.
//!
//! All metrics are derived from the in-memory ring-buffer window, same as
//! the teacher's implementation. Because the buffer has a fixed capacity,
//! values represent a **sliding window** of recent requests rather than
//! lifetime counters — `TYPE gauge` throughout for semantic accuracy, values
//! may decrease as old entries rotate out.
//!
//! Metric families:
//! - `fleetgate_window_size`        — entries currently in the ring buffer
//! - `fleetgate_requests`           — per-connector/provider/outcome request counts
//! - `fleetgate_latency_ms_sum`     — sum of latencies per connector/provider (for avg)
//! - `fleetgate_latency_ms_count`   — denominator matching the sum above
//! - `fleetgate_errors_total`       — requests that returned an error
//! - `fleetgate_nodes_online`       — currently online/degraded/offline node counts

use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
};

use crate::{registry::NodeStatus, router::RouterState};

/// `GET /metrics` — renders Prometheus text format.
pub async fn metrics(State(state): State<Arc<RouterState>>) -> impl IntoResponse {
    let entries = state.traffic.recent(usize::MAX).await;

    let window_size = entries.len();
    let mut errors: u64 = 0;

    // (connector_id, provider, success) → count
    let mut request_counts: HashMap<(String, String, bool), u64> = HashMap::new();
    // (connector_id, provider) → (latency_sum_ms, count)
    let mut latency: HashMap<(String, String), (u64, u64)> = HashMap::new();

    for e in &entries {
        if !e.success {
            errors += 1;
        }

        *request_counts.entry((e.connector_id.clone(), e.provider.clone(), e.success)).or_default() += 1;

        let lat = latency.entry((e.connector_id.clone(), e.provider.clone())).or_default();
        lat.0 += e.latency_ms;
        lat.1 += 1;
    }

    let mut node_status_counts: HashMap<NodeStatus, u64> = HashMap::new();
    for node in state.registry.snapshot().await {
        *node_status_counts.entry(node.status).or_default() += 1;
    }

    let mut out = String::with_capacity(1024);

    out.push_str("# HELP fleetgate_window_size Number of requests currently held in the ring-buffer window.\n");
    out.push_str("# TYPE fleetgate_window_size gauge\n");
    out.push_str(&format!("fleetgate_window_size {window_size}\n\n"));

    out.push_str("# HELP fleetgate_requests Request count in the current window, labelled by connector, provider, and outcome.\n");
    out.push_str("# TYPE fleetgate_requests gauge\n");
    let mut req_rows: Vec<_> = request_counts.iter().collect();
    req_rows.sort_by(|a, b| a.0.cmp(b.0));
    for ((connector_id, provider, success), count) in req_rows {
        let success_str = if *success { "true" } else { "false" };
        out.push_str(&format!(
            "fleetgate_requests{{connector=\"{connector_id}\",provider=\"{provider}\",success=\"{success_str}\"}} {count}\n"
        ));
    }
    out.push('\n');

    out.push_str("# HELP fleetgate_latency_ms_sum Sum of request latency (ms) in the current window, grouped by connector and provider.\n");
    out.push_str("# TYPE fleetgate_latency_ms_sum gauge\n");
    out.push_str("# HELP fleetgate_latency_ms_count Number of observations for the latency sum above.\n");
    out.push_str("# TYPE fleetgate_latency_ms_count gauge\n");
    let mut lat_rows: Vec<_> = latency.iter().collect();
    lat_rows.sort_by(|a, b| a.0.cmp(b.0));
    for ((connector_id, provider), (sum, count)) in lat_rows {
        out.push_str(&format!("fleetgate_latency_ms_sum{{connector=\"{connector_id}\",provider=\"{provider}\"}} {sum}\n"));
        out.push_str(&format!("fleetgate_latency_ms_count{{connector=\"{connector_id}\",provider=\"{provider}\"}} {count}\n"));
    }
    out.push('\n');

    out.push_str("# HELP fleetgate_errors_total Requests that returned an error in the current window.\n");
    out.push_str("# TYPE fleetgate_errors_total gauge\n");
    out.push_str(&format!("fleetgate_errors_total {errors}\n\n"));

    out.push_str("# HELP fleetgate_nodes_online Registered nodes by liveness status.\n");
    out.push_str("# TYPE fleetgate_nodes_online gauge\n");
    for status in [NodeStatus::Online, NodeStatus::Degraded, NodeStatus::Offline] {
        let count = node_status_counts.get(&status).copied().unwrap_or(0);
        out.push_str(&format!("fleetgate_nodes_online{{status=\"{status}\"}} {count}\n"));
    }

    (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")], out)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::traffic::{TrafficEntry, TrafficLog};

    fn mock_log() -> Arc<TrafficLog> {
        let log = Arc::new(TrafficLog::new(100));
        log.push(TrafficEntry::new("c1".into(), "llama3".into(), "local".into(), Some("n1".into()), 120, true));
        log.push(TrafficEntry::new("c1".into(), "llama3".into(), "local".into(), Some("n1".into()), 95, true));
        log.push(TrafficEntry::new("c2".into(), "gpt-4o".into(), "cloud".into(), None, 430, true));
        log.push(TrafficEntry::new("c1".into(), "llama3".into(), "local".into(), Some("n1".into()), 80, false).with_error("upstream 500"));
        log
    }

    #[tokio::test]
    async fn window_size_equals_entry_count() {
        let log = mock_log();
        let entries = log.recent(usize::MAX).await;
        assert_eq!(entries.len(), 4);
    }

    #[tokio::test]
    async fn error_count_is_accurate() {
        let log = mock_log();
        let entries = log.recent(usize::MAX).await;
        let errors = entries.iter().filter(|e| !e.success).count();
        assert_eq!(errors, 1);
    }

    #[tokio::test]
    async fn latency_sum_is_accurate_per_connector_and_provider() {
        let log = mock_log();
        let entries = log.recent(usize::MAX).await;
        let sum: u64 = entries.iter().filter(|e| e.connector_id == "c1" && e.provider == "local").map(|e| e.latency_ms).sum();
        // 120 + 95 + 80 = 295
        assert_eq!(sum, 295);
    }
}
