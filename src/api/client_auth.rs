//! Client API key authentication middleware.
//!
//! Every request to the client port must carry `Authorization: Bearer <api_key>`.
//! The raw key is SHA-256 hashed and looked up against the active connector
//! list — mirroring the teacher's `client_auth_middleware` shape (resolve a
//! header, inject an extension, or reject) but keyed by a hash lookup instead
//! of a plaintext map, per `spec.md` §3's `api_key_hash` field. Distinguishes
//! `401` (missing/malformed header) from `403` (unknown/inactive key), unlike
//! the teacher which only ever returns 401 here — `spec.md` §6 requires the
//! finer-grained split.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
    Extension,
};
use sha2::{Digest, Sha256};

use crate::{connector::Connector, error::GatewayError, router::RouterState};

/// Request extension set by [`client_auth_middleware`] — the resolved connector.
#[derive(Clone, Debug)]
pub struct AuthenticatedConnector(pub Connector);

/// Axum middleware: resolves the bearer token to an active [`Connector`] and
/// injects it as an extension, or rejects with `401`/`403`.
pub async fn client_auth_middleware(State(state): State<Arc<RouterState>>, mut req: Request, next: Next) -> Response {
    let provided = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let Some(key) = provided else {
        return GatewayError::Unauthorized.into_response();
    };

    let hash = hex_sha256(key);
    let config = state.config().await;

    match config.connector_by_hash(&hash) {
        Some(connector) => {
            req.extensions_mut().insert(AuthenticatedConnector(connector.clone()));
            next.run(req).await
        }
        None => GatewayError::Forbidden("unknown or inactive API key".to_string()).into_response(),
    }
}

/// Convenience extractor alias for handlers: `Extension(AuthenticatedConnector(connector))`.
pub type ConnectorExtension = Extension<AuthenticatedConnector>;

fn hex_sha256(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use std::{
        collections::{HashMap, HashSet},
        path::PathBuf,
        sync::Arc,
        time::Duration,
    };

    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
        middleware,
        routing::get,
        Router,
    };
    use tower::ServiceExt;

    use super::*;
    use crate::{
        config::{CloudConfig, Config, GatewayConfig},
        connector::RoutingTarget,
        dispatch::Dispatcher,
        kv::KvStore,
        provider_router::ProviderRouter,
        rate_limit::RateLimiter,
        registry::NodeRegistry,
        traffic::TrafficLog,
        upstream::UpstreamClient,
    };

    fn connector_with_hash(hash: &str) -> Connector {
        Connector {
            id: "c1".into(),
            api_key_hash: hash.to_string(),
            allowed_models: HashSet::from(["*".to_string()]),
            blocked_models: HashSet::new(),
            priority: 5,
            routing_prefer: RoutingTarget::Local,
            routing_fallback: None,
            routing_local_only: false,
            routing_cloud_only: false,
            rate_limit_per_minute: 60,
            rate_limit_per_hour: 1000,
            default_params: HashMap::new(),
            is_active: true,
        }
    }

    async fn state_with_connector(connector: Connector) -> Arc<RouterState> {
        unsafe { std::env::set_var("FG_CA_ADMIN", "a") };
        unsafe { std::env::set_var("FG_CA_NODE", "b") };

        let config = Arc::new(Config {
            gateway: GatewayConfig {
                client_port: 8080,
                admin_port: 8081,
                traffic_log_capacity: 100,
                log_level: None,
                admin_api_key_env: "FG_CA_ADMIN".into(),
                node_secret_env: "FG_CA_NODE".into(),
                local_request_timeout_seconds: 120,
                cloud_request_timeout_seconds: 60,
                liveness_ttl_seconds: 90,
                offline_evict_delta_seconds: 180,
                max_consecutive_failures: 3,
                redis_url: None,
            },
            cloud: CloudConfig {
                base_url: "http://localhost:1".into(),
                api_key_env: None,
                attribution_referrer: None,
                attribution_title: None,
            },
            connectors: vec![connector],
        });

        let registry = Arc::new(NodeRegistry::new(None, Duration::from_secs(90), Duration::from_secs(180), 3));
        let local_client = UpstreamClient::new(Duration::from_secs(120), None);
        let dispatcher = Dispatcher::new(local_client, Arc::clone(&registry));
        let cloud_client = UpstreamClient::new(Duration::from_secs(60), None);
        let provider_router = Arc::new(ProviderRouter::new(Arc::clone(&registry), dispatcher, cloud_client, "http://localhost:1".into(), None, None));
        let rate_limiter = Arc::new(RateLimiter::new(Arc::new(KvStore::in_memory())));

        Arc::new(RouterState::new(
            config,
            PathBuf::default(),
            Arc::new(TrafficLog::new(100)),
            rate_limiter,
            provider_router,
            registry,
        ))
    }

    async fn echo_connector_id(ext: Option<Extension<AuthenticatedConnector>>) -> String {
        ext.map(|Extension(AuthenticatedConnector(c))| c.id).unwrap_or_else(|| "none".to_string())
    }

    fn app(state: Arc<RouterState>) -> Router {
        Router::new()
            .route("/", get(echo_connector_id))
            .layer(middleware::from_fn_with_state(state.clone(), client_auth_middleware))
            .with_state(state)
    }

    #[tokio::test]
    async fn valid_key_injects_connector() {
        let hash = hex_sha256("secret-key-123");
        let state = state_with_connector(connector_with_hash(&hash)).await;

        let resp = app(state)
            .oneshot(Request::get("/").header("authorization", "Bearer secret-key-123").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = to_bytes(resp.into_body(), 256).await.unwrap();
        assert_eq!(&body[..], b"c1");
    }

    #[tokio::test]
    async fn missing_header_returns_401() {
        let state = state_with_connector(connector_with_hash(&hex_sha256("k"))).await;
        let resp = app(state).oneshot(Request::get("/").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn unknown_key_returns_403() {
        let state = state_with_connector(connector_with_hash(&hex_sha256("the-real-key"))).await;
        let resp = app(state)
            .oneshot(Request::get("/").header("authorization", "Bearer wrong-key").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn inactive_connector_is_treated_as_unknown() {
        let mut connector = connector_with_hash(&hex_sha256("secret-key-123"));
        connector.is_active = false;
        let state = state_with_connector(connector).await;

        let resp = app(state)
            .oneshot(Request::get("/").header("authorization", "Bearer secret-key-123").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }
}
