//! Client-facing API (client port) — the OpenAI-compatible surface per
//! `spec.md` §6.
//!
//! Intentionally thin, per the teacher's original design note: all routing
//! logic lives in [`crate::router`]; handlers translate HTTP concerns
//! (status codes, JSON bodies, auth extension) into calls to the router and
//! back via [`crate::error::GatewayError`]'s `IntoResponse`.

use std::sync::Arc;

use axum::{
    extract::State,
    response::IntoResponse,
    routing::{get, post},
    Extension, Json, Router,
};
use serde_json::{json, Value};

use crate::{
    api::{client_auth::AuthenticatedConnector, request_id::RequestId},
    router::RouterState,
};

/// Build the client-facing axum router.
///
/// `/v1/chat/completions` and `/v1/models` require a connector bearer token
/// (`client_auth_middleware`, applied only to this group via `route_layer` so
/// it doesn't also gate `/healthz`/`/status`); those two stay public per
/// `spec.md` §6/the teacher's `/status` design intent.
pub fn router(state: Arc<RouterState>) -> Router {
    let authenticated = Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(list_models))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            crate::api::client_auth::client_auth_middleware,
        ));

    Router::new()
        .route("/healthz", get(crate::api::health::healthz))
        .route("/status", get(crate::api::status::status))
        .merge(authenticated)
        .with_state(state)
}

/// `POST /v1/chat/completions`.
pub async fn chat_completions(
    State(state): State<Arc<RouterState>>,
    Extension(AuthenticatedConnector(connector)): Extension<AuthenticatedConnector>,
    request_id: Option<Extension<RequestId>>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let request_id = request_id.map(|Extension(RequestId(id))| id);
    match crate::router::route_chat_completion(&state, &connector, body, request_id.as_deref()).await {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => e.into_response(),
    }
}

/// `GET /v1/models` — union of the connector's allowed models and every
/// model advertised by a currently-online node.
pub async fn list_models(
    State(state): State<Arc<RouterState>>,
    Extension(AuthenticatedConnector(connector)): Extension<AuthenticatedConnector>,
) -> impl IntoResponse {
    let created = state.started_at.elapsed().as_secs() as i64;
    let mut seen = std::collections::HashSet::new();
    let mut data = Vec::new();

    let mut push = |id: String, owned_by: &str| {
        if seen.insert(id.clone()) {
            data.push(json!({
                "id": id,
                "object": "model",
                "created": created,
                "owned_by": owned_by,
            }));
        }
    };

    if !connector.allowed_models.contains("*") {
        for model in &connector.allowed_models {
            if !connector.blocked_models.contains(model) {
                push(model.clone(), "connector");
            }
        }
    }

    for node in state.registry.snapshot().await {
        if node.status != crate::registry::NodeStatus::Online {
            continue;
        }
        for model in &node.models {
            if model == "*" {
                continue;
            }
            if connector.is_model_allowed(model) {
                push(model.clone(), "node");
            }
        }
    }

    Json(json!({ "object": "list", "data": data }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{Connector, RoutingTarget};
    use std::collections::{HashMap, HashSet};

    fn connector() -> Connector {
        Connector {
            id: "c1".into(),
            api_key_hash: "a".repeat(64),
            allowed_models: HashSet::from(["llama3".to_string()]),
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

    #[test]
    fn connector_allows_its_own_allowlist() {
        let c = connector();
        assert!(c.is_model_allowed("llama3"));
        assert!(!c.is_model_allowed("gpt-4o"));
    }
}
