//! Node heartbeat ingestion — `POST /api/nodes/heartbeat`.
//!
//! Grounded on `original_source/backend/app/api/nodes.py`'s heartbeat handler
//! and the teacher's handler shape (`Json` body in, `Json` status out), with
//! the address-normalization rule from `spec.md` §4.B: the transport peer
//! address overrides a self-reported address of the same family, since it's
//! the address the gateway can demonstrably reach.

use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use axum::{
    extract::{ConnectInfo, State},
    http::{HeaderName, StatusCode},
    routing::post,
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::registry::{Load, Reachability};

static NODE_SECRET_HEADER: HeaderName = HeaderName::from_static("x-node-secret");

/// Build the heartbeat-only router. Authenticated by `X-Node-Secret` inside
/// the handler itself, not by [`crate::api::admin_auth::admin_auth_middleware`]
/// — deliberately mounted unprotected by that layer in `main.rs`.
pub fn router(state: Arc<crate::router::RouterState>) -> Router {
    Router::new().route("/api/nodes/heartbeat", post(heartbeat)).with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    pub node_id: String,
    #[serde(default)]
    pub tunnel_url: Option<String>,
    #[serde(default)]
    pub ipv4: Option<String>,
    #[serde(default)]
    pub ipv6: Option<String>,
    pub port: u16,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub load: Option<Load>,
    #[serde(default)]
    pub metadata: Value,
}

/// `POST /api/nodes/heartbeat`. Requires `X-Node-Secret` to match
/// `gateway.node_secret_env`; normalizes reachability using the transport
/// peer address; rejects with `400` if no address survives normalization.
pub async fn heartbeat(
    State(state): State<Arc<crate::router::RouterState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: axum::http::HeaderMap,
    Json(body): Json<HeartbeatRequest>,
) -> (StatusCode, Json<Value>) {
    let config = state.config().await;
    let expected = std::env::var(&config.gateway.node_secret_env).unwrap_or_default();
    let provided = headers.get(&NODE_SECRET_HEADER).and_then(|v| v.to_str().ok());

    match provided {
        Some(secret) if !expected.is_empty() && secret == expected => {}
        _ => {
            return (
                StatusCode::FORBIDDEN,
                Json(json!({ "error": "heartbeat requires a valid X-Node-Secret header" })),
            );
        }
    }

    let reachability = normalize_reachability(peer, body.tunnel_url, body.ipv4, body.ipv6);
    if reachability.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "no reachable address (tunnel_url, ipv4, or ipv6) after normalization" })),
        );
    }

    let models = body.models.into_iter().collect();
    state.registry.upsert(&body.node_id, reachability, body.port, models, body.load.unwrap_or_default()).await;

    (StatusCode::OK, Json(json!({ "status": "ok", "node_id": body.node_id })))
}

/// Overrides a self-reported address with the transport peer's address of
/// the same IP family, per `spec.md` §4.B — the peer address is the one the
/// gateway can demonstrably reach, regardless of what the node claims.
fn normalize_reachability(peer: SocketAddr, tunnel_url: Option<String>, ipv4: Option<String>, ipv6: Option<String>) -> Reachability {
    let peer_ip = peer.ip();

    let ipv4 = match peer_ip {
        IpAddr::V4(addr) => Some(addr.to_string()),
        IpAddr::V6(_) => ipv4,
    };
    let ipv6 = match peer_ip {
        IpAddr::V6(addr) => Some(addr.to_string()),
        IpAddr::V4(_) => ipv6,
    };

    Reachability { tunnel_url, ipv4, ipv6 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_ipv4_overrides_self_reported_ipv4() {
        let peer: SocketAddr = "203.0.113.9:4100".parse().unwrap();
        let r = normalize_reachability(peer, None, Some("10.0.0.1".into()), None);
        assert_eq!(r.ipv4.as_deref(), Some("203.0.113.9"));
    }

    #[test]
    fn peer_ipv4_does_not_clobber_self_reported_ipv6() {
        let peer: SocketAddr = "203.0.113.9:4100".parse().unwrap();
        let r = normalize_reachability(peer, None, None, Some("2001:db8::1".into()));
        assert_eq!(r.ipv4.as_deref(), Some("203.0.113.9"));
        assert_eq!(r.ipv6.as_deref(), Some("2001:db8::1"));
    }

    #[test]
    fn peer_ipv6_overrides_self_reported_ipv6() {
        let peer: SocketAddr = "[2001:db8::9]:4100".parse().unwrap();
        let r = normalize_reachability(peer, None, Some("10.0.0.1".into()), Some("2001:db8::1".into()));
        assert_eq!(r.ipv4.as_deref(), Some("10.0.0.1"));
        assert_eq!(r.ipv6.as_deref(), Some("2001:db8::9"));
    }

    #[test]
    fn tunnel_url_passes_through_untouched() {
        let peer: SocketAddr = "203.0.113.9:4100".parse().unwrap();
        let r = normalize_reachability(peer, Some("https://node.example".into()), None, None);
        assert_eq!(r.tunnel_url.as_deref(), Some("https://node.example"));
    }

    #[test]
    fn all_addresses_absent_is_empty_only_without_tunnel() {
        let peer: SocketAddr = "203.0.113.9:4100".parse().unwrap();
        let r = normalize_reachability(peer, None, None, None);
        assert!(!r.is_empty(), "peer ipv4 should have populated the address");
    }
}
