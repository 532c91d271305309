//! Shared application state and the top-level request orchestration glue.
//!
//! [`RouterState`] is injected into every handler via [`axum::extract::State`],
//! the same role the teacher's `RouterState` plays — hot-reloadable config
//! behind a cheaply-cloned `Arc<RwLock<Arc<Config>>>`, plus the traffic log
//! and the collaborators built once at startup (registry, rate limiter,
//! provider router). `route_chat_completion` is the thin glue tying together
//! model-allowlist check → Rate Limiter (G) → Provider Router (F), mirroring
//! the request data flow in `spec.md` §2.

use std::{path::PathBuf, sync::Arc, time::Duration};

use serde_json::Value;
use tokio::sync::RwLock;

use crate::{
    config::Config,
    connector::{apply_defaults, Connector},
    error::GatewayError,
    provider_router::{Provider, ProviderRouter},
    rate_limit::RateLimiter,
    registry::NodeRegistry,
    traffic::{TrafficEntry, TrafficLog},
    usage::{extract_token_counts, UsageEvent, UsageRecorder},
};

/// Shared application state injected into every request handler.
pub struct RouterState {
    config_lock: Arc<RwLock<Arc<Config>>>,
    pub config_path: PathBuf,
    pub traffic: Arc<TrafficLog>,
    pub started_at: std::time::Instant,
    pub rate_limiter: Arc<RateLimiter>,
    pub provider_router: Arc<ProviderRouter>,
    pub registry: Arc<NodeRegistry>,
    pub usage_recorder: UsageRecorder,
}

impl RouterState {
    pub fn new(
        config: Arc<Config>,
        config_path: PathBuf,
        traffic: Arc<TrafficLog>,
        rate_limiter: Arc<RateLimiter>,
        provider_router: Arc<ProviderRouter>,
        registry: Arc<NodeRegistry>,
    ) -> Self {
        Self {
            config_lock: Arc::new(RwLock::new(config)),
            config_path,
            traffic,
            started_at: std::time::Instant::now(),
            rate_limiter,
            provider_router,
            registry,
            usage_recorder: UsageRecorder::new(),
        }
    }

    /// Snapshot of the current live config. Cheap: clones an `Arc`.
    pub async fn config(&self) -> Arc<Config> {
        self.config_lock.read().await.clone()
    }

    /// Atomically replaces the live config. Called only from the hot-reload task.
    pub async fn replace_config(&self, new: Arc<Config>) {
        *self.config_lock.write().await = new;
    }
}

/// Orchestrates one `/v1/chat/completions` request for an already-authenticated
/// `connector`: model-allowlist check → rate limiter → default-param merge →
/// provider routing → response annotation → traffic log entry.
pub async fn route_chat_completion(
    state: &RouterState,
    connector: &Connector,
    mut body: Value,
    request_id: Option<&str>,
) -> Result<Value, GatewayError> {
    let model = body
        .get("model")
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::Forbidden("request body missing `model`".to_string()))?
        .to_string();

    if !connector.is_model_allowed(&model) {
        return Err(GatewayError::Forbidden(format!(
            "connector `{}` is not permitted to use model `{model}`",
            connector.id
        )));
    }

    let now = chrono::Utc::now().timestamp();
    let decision = state
        .rate_limiter
        .check(&connector.id, connector.rate_limit_per_minute, connector.rate_limit_per_hour, now)
        .await
        .map_err(GatewayError::Other)?;

    if !decision.allowed {
        return Err(GatewayError::RateLimited {
            minute_remaining: decision.minute_remaining,
            hour_remaining: decision.hour_remaining,
            minute_reset: decision.minute_reset,
            hour_reset: decision.hour_reset,
        });
    }

    body = apply_defaults(body, &connector.default_params);

    let t0 = std::time::Instant::now();
    let result = state.provider_router.route(connector, &model, body).await;
    let latency_ms = t0.elapsed().as_millis() as u64;

    match result {
        Ok((mut response, provider, node_id)) => {
            if let Some(obj) = response.as_object_mut() {
                obj.insert("provider".to_string(), Value::String(provider.to_string()));
                obj.insert(
                    "node_id".to_string(),
                    node_id.clone().map(Value::String).unwrap_or(Value::Null),
                );
            }

            let (tokens_in, tokens_out) = extract_token_counts(&response);
            state.usage_recorder.record(UsageEvent {
                connector_id: connector.id.clone(),
                model: model.clone(),
                provider: provider.to_string(),
                node_id: node_id.clone(),
                tokens_in,
                tokens_out,
                latency_ms,
                status: "ok",
                error: None,
            });

            let mut entry = TrafficEntry::new(connector.id.clone(), model.clone(), provider.to_string(), node_id, latency_ms, true);
            if let Some(id) = request_id {
                entry = entry.with_id(id);
            }
            state.traffic.push(entry);

            Ok(response)
        }
        Err(e) => {
            state.usage_recorder.record(UsageEvent {
                connector_id: connector.id.clone(),
                model: model.clone(),
                provider: Provider::Local.to_string(),
                node_id: None,
                tokens_in: None,
                tokens_out: None,
                latency_ms,
                status: "error",
                error: Some(e.to_string()),
            });

            let mut entry =
                TrafficEntry::new(connector.id.clone(), model.clone(), Provider::Local.to_string(), None, latency_ms, false)
                    .with_error(&e.to_string());
            if let Some(id) = request_id {
                entry = entry.with_id(id);
            }
            state.traffic.push(entry);
            Err(e)
        }
    }
}

/// Background task: polls the config file every 5 seconds and hot-reloads on
/// change. Uses filesystem `mtime` — no inotify/kqueue dependency, same as
/// the teacher's `config_watcher`. Connectors are re-normalized on every
/// reload; the registry, rate limiter, and provider router are untouched by
/// a reload (restart required to change `redis_url`, ports, or timeouts).
pub async fn config_watcher(state: Arc<RouterState>) {
    let path = state.config_path.clone();

    let mut last_mtime = std::fs::metadata(&path).and_then(|m| m.modified()).ok();

    let mut interval = tokio::time::interval(Duration::from_secs(5));
    interval.tick().await;

    loop {
        interval.tick().await;

        let mtime = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
        if mtime == last_mtime {
            continue;
        }

        match Config::load(&path) {
            Ok(new_cfg) => {
                state.replace_config(Arc::new(new_cfg)).await;
                tracing::info!(path = %path.display(), "config hot-reloaded");
                last_mtime = mtime;
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "config reload failed — keeping previous config");
            }
        }
    }
}
