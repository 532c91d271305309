use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::signal;
use tracing::{info, warn};

mod api;
mod config;
mod connector;
mod dispatch;
mod error;
mod kv;
mod provider_router;
mod rate_limit;
mod registry;
mod router;
mod traffic;
mod upstream;
mod usage;

pub use config::Config;
pub use error::GatewayError;
pub use traffic::TrafficLog;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // When invoked as a Docker HEALTHCHECK, hit /healthz and exit immediately.
    // This avoids needing any external tool (curl/wget) in the container image.
    if std::env::args().nth(1).as_deref() == Some("--healthcheck") {
        return healthcheck().await;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "fleetgate=info,tower_http=warn".into()),
        )
        .init();

    let config_path = std::env::var("FLEETGATE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/etc/fleetgate/config.toml"));

    let config = Config::load(&config_path).with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        client_port = config.gateway.client_port,
        admin_port = config.gateway.admin_port,
        connectors = config.connectors.len(),
        "fleetgate starting"
    );

    let traffic_log = Arc::new(TrafficLog::new(config.gateway.traffic_log_capacity));
    let config = Arc::new(config);

    let kv_store = Arc::new(match &config.gateway.redis_url {
        Some(url) => kv::KvStore::connect_redis(url).await.context("connecting to redis")?,
        None => {
            warn!("no gateway.redis_url configured — registry mirror and rate limiter are in-process only");
            kv::KvStore::in_memory()
        }
    });

    let registry = Arc::new(registry::NodeRegistry::new(
        Some(Arc::clone(&kv_store)),
        Duration::from_secs(config.gateway.liveness_ttl_seconds),
        Duration::from_secs(config.gateway.offline_evict_delta_seconds),
        config.gateway.max_consecutive_failures,
    ));

    let local_client = upstream::UpstreamClient::new(Duration::from_secs(config.gateway.local_request_timeout_seconds), None);
    let dispatcher = dispatch::Dispatcher::new(local_client, Arc::clone(&registry));

    let cloud_client = upstream::UpstreamClient::new(Duration::from_secs(config.gateway.cloud_request_timeout_seconds), config.cloud.api_key());

    let provider_router = Arc::new(provider_router::ProviderRouter::new(
        Arc::clone(&registry),
        dispatcher,
        cloud_client,
        config.cloud.base_url.clone(),
        config.cloud.attribution_referrer.clone(),
        config.cloud.attribution_title.clone(),
    ));

    let rate_limiter = Arc::new(rate_limit::RateLimiter::new(Arc::clone(&kv_store)));

    let state = Arc::new(router::RouterState::new(
        Arc::clone(&config),
        config_path.clone(),
        Arc::clone(&traffic_log),
        rate_limiter,
        provider_router,
        Arc::clone(&registry),
    ));

    tokio::spawn(router::config_watcher(Arc::clone(&state)));
    tokio::spawn(registry::spawn_liveness_sweeper(
        Arc::clone(&registry),
        Duration::from_secs(config.gateway.liveness_ttl_seconds),
    ));

    let client_addr: SocketAddr = format!("0.0.0.0:{}", config.gateway.client_port).parse()?;
    let admin_addr: SocketAddr = format!("0.0.0.0:{}", config.gateway.admin_port).parse()?;

    info!(%client_addr, "client API listening");
    info!(%admin_addr, "admin API listening");

    let client_listener = tokio::net::TcpListener::bind(client_addr).await?;
    let admin_listener = tokio::net::TcpListener::bind(admin_addr).await?;

    let trace_layer = || {
        tower_http::trace::TraceLayer::new_for_http()
            .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO))
            .on_response(tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO))
    };

    let client_app = api::client::router(Arc::clone(&state))
        .layer(axum::middleware::from_fn(api::request_id::request_id_middleware))
        .layer(trace_layer());

    // The heartbeat route is authenticated by its own `X-Node-Secret` check
    // inside the handler, not by `admin_auth_middleware` (which guards
    // `X-Admin-Key`) — so the layer is applied to the rest of the admin
    // surface before merging the heartbeat route in unprotected by it.
    let admin_protected = api::admin::router(Arc::clone(&state))
        .layer(axum::middleware::from_fn_with_state(Arc::clone(&state), api::admin_auth::admin_auth_middleware));

    let admin_app = admin_protected
        .merge(api::heartbeat::router(Arc::clone(&state)))
        .layer(axum::middleware::from_fn(api::request_id::request_id_middleware))
        .layer(trace_layer());

    tokio::select! {
        result = axum::serve(client_listener, client_app.into_make_service_with_connect_info::<SocketAddr>()) => {
            result.context("client API server error")?;
        }
        result = axum::serve(admin_listener, admin_app.into_make_service_with_connect_info::<SocketAddr>()) => {
            result.context("admin API server error")?;
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Lightweight healthcheck: GET /healthz and exit 0 on 200, 1 otherwise.
/// Invoked via `fleetgate --healthcheck` from a Docker HEALTHCHECK directive.
async fn healthcheck() -> anyhow::Result<()> {
    let port = std::env::var("FLEETGATE_CLIENT_PORT").ok().and_then(|v| v.parse::<u16>().ok()).unwrap_or(8080);

    let url = format!("http://127.0.0.1:{port}/healthz");
    let resp = reqwest::get(&url).await?;

    if resp.status().is_success() {
        std::process::exit(0);
    } else {
        std::process::exit(1);
    }
}
