//! Admin API (admin port) — operator-facing introspection and node
//! management endpoints.
//!
//! Separated onto a different port than the client API so it can be
//! network-restricted independently (e.g. reachable only from the internal
//! network), matching the teacher's split. `/admin/nodes` list/delete is
//! grounded on `original_source/backend/app/api/nodes.py`'s `list_nodes`/
//! `remove_node`; connector CRUD is explicitly out of scope (`spec.md` §6 —
//! it lives behind an external admin service this gateway only consumes).

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;

use crate::router::RouterState;

/// Build the admin-facing axum router. Every route here sits behind
/// [`crate::api::admin_auth::admin_auth_middleware`] once merged into the
/// admin-port app in `main.rs`.
pub fn router(state: Arc<RouterState>) -> Router {
    Router::new()
        .route("/admin/health", get(health))
        .route("/admin/traffic", get(traffic))
        .route("/admin/config", get(config))
        .route("/admin/nodes", get(list_nodes))
        .route("/admin/nodes/{node_id}", delete(remove_node))
        .route("/metrics", get(crate::api::metrics::metrics))
        .with_state(state)
}

/// `GET /admin/health` — liveness plus a count of known connectors/nodes.
pub async fn health(State(state): State<Arc<RouterState>>) -> impl IntoResponse {
    let connector_count = state.config().await.connectors.len();
    let node_count = state.registry.snapshot().await.len();
    Json(json!({
        "status": "ok",
        "connectors": connector_count,
        "nodes": node_count,
    }))
}

#[derive(Deserialize)]
pub struct TrafficQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}
fn default_limit() -> usize {
    100
}

/// `GET /admin/traffic?limit=N` — recent traffic entries plus aggregate stats.
pub async fn traffic(State(state): State<Arc<RouterState>>, Query(q): Query<TrafficQuery>) -> impl IntoResponse {
    let entries = state.traffic.recent(q.limit).await;
    let stats = state.traffic.stats().await;
    Json(json!({ "stats": stats, "entries": entries }))
}

/// `GET /admin/config` — current config with secrets redacted: API keys and
/// shared secrets are reported only as `configured`/`not configured`, never
/// as the env var name or the resolved value.
pub async fn config(State(state): State<Arc<RouterState>>) -> impl IntoResponse {
    let cfg = state.config().await;

    let admin_api_key_configured = !std::env::var(&cfg.gateway.admin_api_key_env).unwrap_or_default().is_empty();
    let node_secret_configured = !std::env::var(&cfg.gateway.node_secret_env).unwrap_or_default().is_empty();
    let cloud_api_key_configured = cfg.cloud.api_key().is_some();

    let connectors: Vec<_> = cfg
        .connectors
        .iter()
        .map(|c| {
            json!({
                "id": c.id,
                "allowed_models": c.allowed_models,
                "blocked_models": c.blocked_models,
                "priority": c.priority,
                "routing_prefer": c.routing_prefer.to_string(),
                "routing_fallback": c.routing_fallback.map(|t| t.to_string()),
                "routing_local_only": c.routing_local_only,
                "routing_cloud_only": c.routing_cloud_only,
                "rate_limit_per_minute": c.rate_limit_per_minute,
                "rate_limit_per_hour": c.rate_limit_per_hour,
                "is_active": c.is_active,
            })
        })
        .collect();

    Json(json!({
        "gateway": {
            "client_port": cfg.gateway.client_port,
            "admin_port": cfg.gateway.admin_port,
            "traffic_log_capacity": cfg.gateway.traffic_log_capacity,
            "liveness_ttl_seconds": cfg.gateway.liveness_ttl_seconds,
            "offline_evict_delta_seconds": cfg.gateway.offline_evict_delta_seconds,
            "max_consecutive_failures": cfg.gateway.max_consecutive_failures,
            "admin_api_key_configured": admin_api_key_configured,
            "node_secret_configured": node_secret_configured,
        },
        "cloud": {
            "base_url": cfg.cloud.base_url,
            "cloud_api_key_configured": cloud_api_key_configured,
        },
        "connectors": connectors,
    }))
}

/// `GET /admin/nodes` — snapshot of every currently-known node.
pub async fn list_nodes(State(state): State<Arc<RouterState>>) -> impl IntoResponse {
    Json(json!({ "nodes": state.registry.snapshot().await }))
}

/// `DELETE /admin/nodes/{node_id}` — evict a node. Idempotent: a second
/// delete of the same id returns `404`, not an error beyond that surface.
pub async fn remove_node(State(state): State<Arc<RouterState>>, Path(node_id): Path<String>) -> impl IntoResponse {
    if state.registry.evict(&node_id).await {
        (StatusCode::OK, Json(json!({ "message": "node removed", "node_id": node_id })))
    } else {
        (StatusCode::NOT_FOUND, Json(json!({ "error": "node not found", "node_id": node_id })))
    }
}
