//! Configuration types for the gateway.
//!
//! Config is loaded once at startup from a TOML file and validated before the
//! server opens any ports. Invalid configs are rejected with a clear error
//! rather than silently falling back to defaults — including the shared
//! secrets (`admin_api_key_env`, `node_secret_env`), which must resolve to a
//! non-empty environment variable at load time: unlike the teacher's optional
//! `admin_token_env` (whose absence quietly disables auth), these two secrets
//! gate every admin and heartbeat request this gateway serves, so a missing
//! value is a startup failure, not a silently-open door.
//!
//! # Example
//! ```toml
//! [gateway]
//! client_port = 8080
//! admin_port = 8081
//! admin_api_key_env = "FLEETGATE_ADMIN_KEY"
//! node_secret_env = "FLEETGATE_NODE_SECRET"
//!
//! [cloud]
//! base_url = "https://openrouter.ai/api"
//! api_key_env = "FLEETGATE_CLOUD_KEY"
//!
//! [[connectors]]
//! id = "acme-prod"
//! api_key_hash = "c775e7b757ede630cd0aa1113bd102661ab38829ca52a6422ab782862f268c0"
//! ```

use std::{collections::HashMap, path::Path};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::connector::Connector;

/// Top-level gateway configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub gateway: GatewayConfig,

    pub cloud: CloudConfig,

    /// Tenant credentials. Connector CRUD lives behind an external admin
    /// service out of scope for this gateway (`spec.md` §1/§6); this
    /// hot-reloadable list is how that external source of truth is realized
    /// here, generalizing the teacher's `[[clients]]`.
    #[serde(default)]
    pub connectors: Vec<Connector>,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let mut config: Self = toml::from_str(&content).context("parsing config TOML")?;
        config.connectors = config.connectors.into_iter().map(Connector::normalized).collect();
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            resolve_env(&self.gateway.admin_api_key_env).is_some(),
            "gateway.admin_api_key_env (`{}`) must resolve to a non-empty environment variable",
            self.gateway.admin_api_key_env
        );
        anyhow::ensure!(
            resolve_env(&self.gateway.node_secret_env).is_some(),
            "gateway.node_secret_env (`{}`) must resolve to a non-empty environment variable",
            self.gateway.node_secret_env
        );

        let mut seen_ids = std::collections::HashSet::new();
        for connector in &self.connectors {
            anyhow::ensure!(
                seen_ids.insert(connector.id.as_str()),
                "duplicate connector id `{}`",
                connector.id
            );
            anyhow::ensure!(
                connector.api_key_hash.len() == 64
                    && connector.api_key_hash.chars().all(|c| c.is_ascii_hexdigit()),
                "connector `{}` has a malformed api_key_hash (expected 64 hex chars)",
                connector.id
            );
            anyhow::ensure!(
                connector.rate_limit_per_minute > 0 && connector.rate_limit_per_hour > 0,
                "connector `{}` rate limits must be positive",
                connector.id
            );
        }

        Ok(())
    }

    /// Look up an active connector by the SHA-256 hex digest of its bearer key.
    pub fn connector_by_hash(&self, api_key_hash: &str) -> Option<&Connector> {
        self.connectors
            .iter()
            .find(|c| c.is_active && c.api_key_hash == api_key_hash)
    }
}

fn resolve_env(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.is_empty())
}

/// Core gateway settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    /// Port for the client-facing OpenAI-compatible API (default: 8080).
    #[serde(default = "defaults::client_port")]
    pub client_port: u16,

    /// Port for the admin/introspection API + node heartbeat endpoint (default: 8081).
    #[serde(default = "defaults::admin_port")]
    pub admin_port: u16,

    /// Number of recent requests kept in the in-memory traffic ring buffer (default: 500).
    #[serde(default = "defaults::traffic_log_capacity")]
    pub traffic_log_capacity: usize,

    /// Log level override (also controlled by `RUST_LOG`).
    #[serde(default)]
    pub log_level: Option<String>,

    /// Environment variable holding the shared secret required in `X-Admin-Key`
    /// on every admin-port request. Required — config fails to load without it.
    pub admin_api_key_env: String,

    /// Environment variable holding the shared secret nodes present in
    /// `X-Node-Secret` on heartbeats. Required — config fails to load without it.
    pub node_secret_env: String,

    /// Per-request timeout against a local node (default: 120s).
    #[serde(default = "defaults::local_request_timeout_seconds")]
    pub local_request_timeout_seconds: u64,

    /// Per-request timeout against the cloud upstream (default: 60s).
    #[serde(default = "defaults::cloud_request_timeout_seconds")]
    pub cloud_request_timeout_seconds: u64,

    /// Heartbeat liveness window (default: 90s). A node not heard from in
    /// this long is marked `offline`.
    #[serde(default = "defaults::liveness_ttl_seconds")]
    pub liveness_ttl_seconds: u64,

    /// Past this long without a heartbeat, a node is evicted outright
    /// (default: 180s).
    #[serde(default = "defaults::offline_evict_delta_seconds")]
    pub offline_evict_delta_seconds: u64,

    /// Consecutive dispatch failures before a node is marked `degraded` (default: 3).
    #[serde(default = "defaults::max_consecutive_failures")]
    pub max_consecutive_failures: u32,

    /// Optional external KV store URL (Redis) backing the registry mirror and
    /// rate limiter. When absent, both fall back to an in-process store —
    /// fine for a single gateway replica, not for horizontally-scaled ones.
    #[serde(default)]
    pub redis_url: Option<String>,
}

/// Cloud fallback upstream (OpenRouter-style OpenAI-compatible endpoint).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CloudConfig {
    pub base_url: String,

    /// Environment variable holding the cloud upstream's bearer token.
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// OpenRouter-style attribution headers, attached to every cloud call
    /// when set.
    #[serde(default)]
    pub attribution_referrer: Option<String>,
    #[serde(default)]
    pub attribution_title: Option<String>,
}

impl CloudConfig {
    pub fn api_key(&self) -> Option<String> {
        self.api_key_env.as_deref().and_then(|var| std::env::var(var).ok())
    }
}

mod defaults {
    pub fn client_port() -> u16 {
        8080
    }
    pub fn admin_port() -> u16 {
        8081
    }
    pub fn traffic_log_capacity() -> usize {
        500
    }
    pub fn local_request_timeout_seconds() -> u64 {
        120
    }
    pub fn cloud_request_timeout_seconds() -> u64 {
        60
    }
    pub fn liveness_ttl_seconds() -> u64 {
        90
    }
    pub fn offline_evict_delta_seconds() -> u64 {
        180
    }
    pub fn max_consecutive_failures() -> u32 {
        3
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_env<T>(vars: &[(&str, &str)], f: impl FnOnce() -> T) -> T {
        for (k, v) in vars {
            unsafe { std::env::set_var(k, v) };
        }
        let result = f();
        for (k, _) in vars {
            unsafe { std::env::remove_var(k) };
        }
        result
    }

    fn minimal_toml() -> &'static str {
        r#"
        [gateway]
        admin_api_key_env = "FG_TEST_ADMIN_KEY"
        node_secret_env = "FG_TEST_NODE_SECRET"

        [cloud]
        base_url = "https://openrouter.ai/api"
        "#
    }

    #[test]
    fn gateway_defaults_are_applied_when_section_is_minimal() {
        with_env(&[("FG_TEST_ADMIN_KEY", "a"), ("FG_TEST_NODE_SECRET", "b")], || {
            let config: Config = toml::from_str(minimal_toml()).expect("should parse");
            assert_eq!(config.gateway.client_port, 8080);
            assert_eq!(config.gateway.admin_port, 8081);
            assert_eq!(config.gateway.liveness_ttl_seconds, 90);
            assert_eq!(config.gateway.offline_evict_delta_seconds, 180);
            assert_eq!(config.gateway.max_consecutive_failures, 3);
        });
    }

    #[test]
    fn validate_fails_when_admin_api_key_env_is_unresolvable() {
        with_env(&[("FG_TEST_NODE_SECRET", "b")], || {
            let config: Config = toml::from_str(minimal_toml()).expect("should parse");
            assert!(config.validate().is_err());
        });
    }

    #[test]
    fn validate_fails_when_node_secret_env_is_unresolvable() {
        with_env(&[("FG_TEST_ADMIN_KEY", "a")], || {
            let config: Config = toml::from_str(minimal_toml()).expect("should parse");
            assert!(config.validate().is_err());
        });
    }

    #[test]
    fn validate_rejects_duplicate_connector_ids() {
        with_env(&[("FG_TEST_ADMIN_KEY", "a"), ("FG_TEST_NODE_SECRET", "b")], || {
            let toml_str = format!(
                "{}\n[[connectors]]\nid = \"c1\"\napi_key_hash = \"{}\"\n[[connectors]]\nid = \"c1\"\napi_key_hash = \"{}\"\n",
                minimal_toml(),
                "a".repeat(64),
                "b".repeat(64),
            );
            let config: Config = toml::from_str(&toml_str).expect("should parse");
            assert!(config.validate().is_err());
        });
    }

    #[test]
    fn validate_rejects_malformed_api_key_hash() {
        with_env(&[("FG_TEST_ADMIN_KEY", "a"), ("FG_TEST_NODE_SECRET", "b")], || {
            let toml_str = format!("{}\n[[connectors]]\nid = \"c1\"\napi_key_hash = \"not-hex\"\n", minimal_toml());
            let config: Config = toml::from_str(&toml_str).expect("should parse");
            assert!(config.validate().is_err());
        });
    }

    #[test]
    fn connector_by_hash_skips_inactive_connectors() {
        with_env(&[("FG_TEST_ADMIN_KEY", "a"), ("FG_TEST_NODE_SECRET", "b")], || {
            let hash = "a".repeat(64);
            let toml_str = format!(
                "{}\n[[connectors]]\nid = \"c1\"\napi_key_hash = \"{hash}\"\nis_active = false\n",
                minimal_toml()
            );
            let config: Config = toml::from_str(&toml_str).expect("should parse");
            assert!(config.connector_by_hash(&hash).is_none());
        });
    }

    #[test]
    fn load_normalizes_connector_routing_flags() {
        with_env(&[("FG_TEST_ADMIN_KEY", "a"), ("FG_TEST_NODE_SECRET", "b")], || {
            let hash = "a".repeat(64);
            let toml_str = format!(
                "{}\n[[connectors]]\nid = \"c1\"\napi_key_hash = \"{hash}\"\nrouting_local_only = true\nrouting_cloud_only = true\n",
                minimal_toml()
            );
            let dir = std::env::temp_dir().join(format!("fleetgate-test-{}", uuid::Uuid::new_v4()));
            std::fs::write(&dir, toml_str).unwrap();
            let config = Config::load(&dir).expect("should load");
            std::fs::remove_file(&dir).ok();
            assert!(config.connectors[0].routing_local_only);
            assert!(!config.connectors[0].routing_cloud_only);
        });
    }
}
