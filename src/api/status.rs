//! Public status endpoint (`GET /status`, client port).
//!
//! Safe to expose publicly without authentication, matching the teacher's
//! `/status` design intent: liveness and aggregate metrics only, never
//! connector ids, node ids, or routing configuration.

use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, Json};
use serde_json::json;

use crate::{registry::NodeStatus, router::RouterState};

/// `GET /status` — public liveness and aggregate metrics.
///
/// Example response:
/// ```json
/// {
///   "status": "ok",
///   "uptime_secs": 3600,
///   "nodes_online": 2,
///   "requests": {
///     "total": 1024,
///     "errors": 3,
///     "error_rate": 0.003,
///     "avg_latency_ms": 87.4
///   }
/// }
/// ```
pub async fn status(State(state): State<Arc<RouterState>>) -> impl IntoResponse {
    let uptime_secs = state.started_at.elapsed().as_secs();
    let stats = state.traffic.stats().await;
    let error_rate = if stats.total_requests == 0 {
        0.0_f64
    } else {
        stats.error_count as f64 / stats.total_requests as f64
    };

    let nodes_online = state.registry.snapshot().await.iter().filter(|n| n.status == NodeStatus::Online).count();

    Json(json!({
        "status": "ok",
        "uptime_secs": uptime_secs,
        "nodes_online": nodes_online,
        "requests": {
            "total": stats.total_requests,
            "errors": stats.error_count,
            "error_rate": error_rate,
            "avg_latency_ms": stats.avg_latency_ms,
        }
    }))
}
