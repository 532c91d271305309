//! Provider Router — computes provider ordering from connector policy and
//! performs cross-provider failover (`spec.md` §4.F).
//!
//! Generalizes the teacher's `router::route`/`dispatch`/`escalate` shape —
//! same `#[tracing::instrument]` posture and `tracing::warn!` on
//! skip/failure — over a provider-ordering table instead of a tier ladder.

use std::sync::Arc;

use serde_json::Value;

use crate::{
    connector::{Connector, RoutingTarget},
    dispatch::{select_candidates, Dispatcher},
    error::{GatewayError, ProviderFailure},
    registry::NodeRegistry,
    upstream::{openrouter_attribution_headers, UpstreamClient},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Local,
    Cloud,
    CloudFreeOnly,
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Local => "local",
            Self::Cloud | Self::CloudFreeOnly => "cloud",
        })
    }
}

impl From<RoutingTarget> for Provider {
    fn from(t: RoutingTarget) -> Self {
        match t {
            RoutingTarget::Local => Provider::Local,
            RoutingTarget::Cloud => Provider::Cloud,
            RoutingTarget::CloudFreeOnly => Provider::CloudFreeOnly,
        }
    }
}

/// `model` is "free" iff its identifier contains `":free"`, `"/free"`, or
/// `"free:"`, case-insensitively — grounded on
/// `original_source/services/router.py::_is_free_model`.
pub fn is_free(model: &str) -> bool {
    let lower = model.to_lowercase();
    lower.contains(":free") || lower.contains("/free") || lower.contains("free:")
}

/// Compute the ordered list of providers to try for this connector, per the
/// decision table in `spec.md` §4.F.
pub fn compute_provider_order(connector: &Connector) -> Vec<Provider> {
    if connector.routing_local_only {
        return vec![Provider::Local];
    }
    if connector.routing_cloud_only {
        return match connector.routing_prefer {
            RoutingTarget::Local => vec![Provider::Cloud],
            prefer => vec![prefer.into()],
        };
    }

    let prefer: Provider = connector.routing_prefer.into();
    match connector.routing_fallback {
        Some(fallback) if Provider::from(fallback) != prefer => vec![prefer, fallback.into()],
        _ => vec![prefer],
    }
}

pub struct ProviderRouter {
    registry: Arc<NodeRegistry>,
    local_dispatcher: Dispatcher,
    cloud_client: UpstreamClient,
    cloud_base_url: String,
    cloud_site_url: Option<String>,
    cloud_app_name: Option<String>,
}

impl ProviderRouter {
    pub fn new(
        registry: Arc<NodeRegistry>,
        local_dispatcher: Dispatcher,
        cloud_client: UpstreamClient,
        cloud_base_url: String,
        cloud_site_url: Option<String>,
        cloud_app_name: Option<String>,
    ) -> Self {
        Self {
            registry,
            local_dispatcher,
            cloud_client,
            cloud_base_url,
            cloud_site_url,
            cloud_app_name,
        }
    }

    /// Try each provider in `compute_provider_order(connector)` order for
    /// `model`, returning the first success or `AllProvidersFailed` with
    /// every skip/failure reason collected along the way.
    #[tracing::instrument(skip(self, body), fields(connector_id = %connector.id, model))]
    pub async fn route(&self, connector: &Connector, model: &str, body: Value) -> Result<(Value, Provider, Option<String>), GatewayError> {
        let order = compute_provider_order(connector);
        let mut failures = Vec::new();

        for provider in order {
            match provider {
                Provider::Local => match self.try_local(connector, model, body.clone()).await {
                    Ok((value, node_id)) => return Ok((value, Provider::Local, Some(node_id))),
                    Err(reason) => {
                        tracing::warn!(provider = "local", %reason, "provider failed");
                        // Locally synthesized ("no local candidates", "node
                        // unreachable") — safe to echo back, not redacted.
                        failures.push(ProviderFailure { provider: "local".to_string(), reason, redact: false });
                    }
                },
                Provider::CloudFreeOnly => {
                    if !is_free(model) {
                        tracing::debug!(provider = "cloud_free_only", model, "skipped: model is not free");
                        continue;
                    }
                    match self.try_cloud(body.clone()).await {
                        Ok(value) => return Ok((value, Provider::Cloud, None)),
                        Err(reason) => {
                            tracing::warn!(provider = "cloud_free_only", %reason, "provider failed");
                            failures.push(ProviderFailure { provider: "cloud_free_only".to_string(), reason, redact: true });
                        }
                    }
                }
                Provider::Cloud => match self.try_cloud(body.clone()).await {
                    Ok(value) => return Ok((value, Provider::Cloud, None)),
                    Err(reason) => {
                        tracing::warn!(provider = "cloud", %reason, "provider failed");
                        failures.push(ProviderFailure { provider: "cloud".to_string(), reason, redact: true });
                    }
                },
            }
        }

        Err(GatewayError::AllProvidersFailed(failures))
    }

    async fn try_local(&self, connector: &Connector, model: &str, body: Value) -> Result<(Value, String), String> {
        let snapshot = self.registry.snapshot().await;
        let candidates = select_candidates(&snapshot, model, connector.priority);
        if candidates.is_empty() {
            return Err(format!("no local candidates for model `{model}`"));
        }

        let mut last_error = String::new();
        for node in candidates {
            match self.local_dispatcher.dispatch_to(&node, "/v1/chat/completions", body.clone()).await {
                Ok(value) => return Ok((value, node.node_id)),
                Err(e) => last_error = e.to_string(),
            }
        }
        Err(last_error)
    }

    async fn try_cloud(&self, body: Value) -> Result<Value, String> {
        let headers = openrouter_attribution_headers(self.cloud_site_url.as_deref(), self.cloud_app_name.as_deref());
        self.cloud_client
            .post_json(&self.cloud_base_url, "/v1/chat/completions", &body, Some(&headers))
            .await
            .map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};

    fn base_connector() -> Connector {
        Connector {
            id: "c1".into(),
            api_key_hash: "x".repeat(64),
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

    #[test]
    fn local_only_ignores_prefer_and_fallback() {
        let mut c = base_connector();
        c.routing_local_only = true;
        c.routing_prefer = RoutingTarget::Cloud;
        c.routing_fallback = Some(RoutingTarget::Cloud);
        assert_eq!(compute_provider_order(&c), vec![Provider::Local]);
    }

    #[test]
    fn cloud_only_with_prefer_cloud_keeps_prefer() {
        let mut c = base_connector();
        c.routing_cloud_only = true;
        c.routing_prefer = RoutingTarget::CloudFreeOnly;
        assert_eq!(compute_provider_order(&c), vec![Provider::CloudFreeOnly]);
    }

    #[test]
    fn cloud_only_with_prefer_local_is_forced_to_cloud() {
        let mut c = base_connector();
        c.routing_cloud_only = true;
        c.routing_prefer = RoutingTarget::Local;
        assert_eq!(compute_provider_order(&c), vec![Provider::Cloud]);
    }

    #[test]
    fn default_prefer_local_no_fallback_is_local_only_order() {
        let c = base_connector();
        assert_eq!(compute_provider_order(&c), vec![Provider::Local]);
    }

    #[test]
    fn prefer_with_distinct_fallback_yields_both_in_order() {
        let mut c = base_connector();
        c.routing_prefer = RoutingTarget::Local;
        c.routing_fallback = Some(RoutingTarget::Cloud);
        assert_eq!(compute_provider_order(&c), vec![Provider::Local, Provider::Cloud]);
    }

    #[test]
    fn fallback_equal_to_prefer_is_omitted() {
        let mut c = base_connector();
        c.routing_prefer = RoutingTarget::Cloud;
        c.routing_fallback = Some(RoutingTarget::Cloud);
        assert_eq!(compute_provider_order(&c), vec![Provider::Cloud]);
    }

    #[test]
    fn is_free_matches_documented_substrings_case_insensitively() {
        assert!(is_free("meta-llama/llama-3:FREE"));
        assert!(is_free("some/free-model"));
        assert!(is_free("free:whatever"));
        assert!(!is_free("gpt-4o"));
    }
}
