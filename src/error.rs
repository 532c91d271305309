//! Unified error taxonomy for the gateway's request path.
//!
//! [`GatewayError`] is a closed, named set of outcomes — unlike the teacher's
//! `AppError` (which wraps an opaque `anyhow::Error`), every variant here maps
//! to one specific HTTP status and body shape, because the taxonomy this
//! gateway implements is itself closed. Internal-only variants
//! (`NoCandidates`, `NodeUnreachable`, `UpstreamBadResponse`) are never
//! returned directly to a handler — they are consumed by the dispatcher and
//! provider router and folded into `AllProvidersFailed` or a successful
//! fallback before reaching the HTTP boundary.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// One provider's failure reason, surfaced in a 503 body.
///
/// `redact` distinguishes locally-synthesized reasons (e.g. "no local
/// candidates for model `x`" — safe and meaningful to a caller) from
/// upstream-origin error text, which is logged verbatim but never echoed
/// back raw (`spec.md` §7's propagation policy).
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProviderFailure {
    pub provider: String,
    pub reason: String,
    pub redact: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Missing or malformed `Authorization` header.
    #[error("missing or malformed Authorization header")]
    Unauthorized,

    /// Credential does not resolve to an active connector, or the requested
    /// model is not permitted for it.
    #[error("{0}")]
    Forbidden(String),

    /// Sliding-window limiter tripped for this connector.
    #[error("rate limit exceeded")]
    RateLimited {
        minute_remaining: i64,
        hour_remaining: i64,
        minute_reset: i64,
        hour_reset: i64,
    },

    /// The local provider has no online node that advertises this model.
    /// Internal-only — triggers failover, never surfaced by itself.
    #[error("no local candidates for model `{0}`")]
    NoCandidates(String),

    /// Every dispatch strategy to this node failed.
    /// Internal-only — the candidate selector tries the next node.
    #[error("node `{node_id}` unreachable (last status: {last_status:?})")]
    NodeUnreachable {
        node_id: String,
        last_status: Option<u16>,
    },

    /// An upstream (node or cloud) returned a non-2xx response.
    /// Internal-only — folded into a provider failure by the caller.
    #[error("upstream returned HTTP {0}")]
    UpstreamBadResponse(u16),

    /// No provider in the connector's order produced a response.
    #[error("all providers failed")]
    AllProvidersFailed(Vec<ProviderFailure>),

    /// Anything else — surfaced as a generic 500, logged verbatim.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        match self {
            GatewayError::Unauthorized => {
                tracing::debug!("rejected request: missing/malformed auth");
                (
                    StatusCode::UNAUTHORIZED,
                    Json(json!({ "error": "API key required. Use 'Authorization: Bearer <api_key>'." })),
                )
                    .into_response()
            }
            GatewayError::Forbidden(reason) => {
                tracing::debug!(%reason, "rejected request: forbidden");
                (StatusCode::FORBIDDEN, Json(json!({ "error": reason }))).into_response()
            }
            GatewayError::RateLimited {
                minute_remaining,
                hour_remaining,
                minute_reset,
                hour_reset,
            } => (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({
                    "error": "rate limit exceeded",
                    "minute_remaining": minute_remaining,
                    "hour_remaining": hour_remaining,
                    "minute_reset": minute_reset,
                    "hour_reset": hour_reset,
                })),
            )
                .into_response(),
            GatewayError::AllProvidersFailed(failures) => {
                tracing::warn!(?failures, "all providers failed");
                // Upstream-origin error strings are redacted in the client-facing
                // body; the verbatim reasons were already logged above. Locally
                // synthesized reasons (e.g. "no local candidates") pass through.
                let redacted: Vec<_> = failures
                    .iter()
                    .map(|f| {
                        let reason = if f.redact { "provider error".to_string() } else { f.reason.clone() };
                        json!({ "provider": f.provider, "reason": reason })
                    })
                    .collect();
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(json!({
                        "error": "all providers failed",
                        "providers": redacted,
                    })),
                )
                    .into_response()
            }
            // These are internal-only; reaching IntoResponse means a bug in the
            // router/dispatcher that let one escape. Map conservatively.
            GatewayError::NoCandidates(_) | GatewayError::NodeUnreachable { .. } => {
                tracing::error!(error = %self, "internal-only error variant reached the HTTP boundary");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(json!({ "error": "provider error" })),
                )
                    .into_response()
            }
            GatewayError::UpstreamBadResponse(status) => {
                tracing::error!(%status, "internal-only error variant reached the HTTP boundary");
                (
                    StatusCode::BAD_GATEWAY,
                    Json(json!({ "error": "provider error" })),
                )
                    .into_response()
            }
            GatewayError::Other(e) => {
                tracing::warn!(error = %e, "unhandled error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": e.to_string() })),
                )
                    .into_response()
            }
        }
    }
}
