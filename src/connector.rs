//! Connector data model — the tenant-scoped credential object bundling auth,
//! access policy, rate limits, and routing preferences.
//!
//! Connector CRUD lives behind an external admin service and is explicitly
//! out of scope for this gateway (see `spec.md` §1/§6). What the core needs
//! is a read-only snapshot per request, so connectors are declared in the
//! same hot-reloadable TOML config the teacher already uses for `[[clients]]`
//! — no database dependency is introduced for a surface this repo doesn't own.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which provider class a connector prefers / falls back to / is restricted to.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RoutingTarget {
    Local,
    Cloud,
    CloudFreeOnly,
}

impl std::fmt::Display for RoutingTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Local => "local",
            Self::Cloud => "cloud",
            Self::CloudFreeOnly => "cloud_free_only",
        })
    }
}

/// A tenant credential: auth, access policy, rate limits, routing preferences.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Connector {
    /// Short opaque string, unique across the fleet.
    pub id: String,

    /// 64-hex SHA-256 digest of the raw bearer secret.
    pub api_key_hash: String,

    /// Model identifiers this connector may use. The literal `"*"` means "any".
    #[serde(default = "default_allow_all")]
    pub allowed_models: HashSet<String>,

    /// Model identifiers this connector may never use. Checked before
    /// `allowed_models` and takes absolute precedence — including over a
    /// `"*"` entry in `allowed_models`. The literal `"*"` here is NOT a
    /// wildcard block; it blocks only the literal model id `"*"`.
    #[serde(default)]
    pub blocked_models: HashSet<String>,

    /// 1..10, 10 = highest. Used as a small scheduling tie-break bias.
    #[serde(default = "default_priority")]
    pub priority: u8,

    #[serde(default = "default_prefer")]
    pub routing_prefer: RoutingTarget,

    #[serde(default)]
    pub routing_fallback: Option<RoutingTarget>,

    #[serde(default)]
    pub routing_local_only: bool,

    #[serde(default)]
    pub routing_cloud_only: bool,

    #[serde(default = "default_rpm")]
    pub rate_limit_per_minute: u32,

    #[serde(default = "default_rph")]
    pub rate_limit_per_hour: u32,

    /// Parameter name → override value, applied when absent from the request.
    #[serde(default)]
    pub default_params: HashMap<String, Value>,

    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_allow_all() -> HashSet<String> {
    HashSet::from(["*".to_string()])
}
fn default_priority() -> u8 {
    5
}
fn default_prefer() -> RoutingTarget {
    RoutingTarget::Local
}
fn default_rpm() -> u32 {
    60
}
fn default_rph() -> u32 {
    1000
}
fn default_true() -> bool {
    true
}

impl Connector {
    /// Normalize the mutually-exclusive routing flags.
    ///
    /// Invariant: `routing_local_only ∧ routing_cloud_only` is impossible. If
    /// the config sets both, treat it as `routing_local_only` — config that
    /// violates the invariant is normalized, not rejected, matching the
    /// permissive-but-validated posture of the rest of this config file.
    pub fn normalized(mut self) -> Self {
        if self.routing_local_only && self.routing_cloud_only {
            self.routing_cloud_only = false;
        }
        self
    }

    /// Whether `model` may be dispatched for this connector.
    ///
    /// Block takes precedence over allow, and is checked first. `"*"` in
    /// `allowed_models` grants every model; `"*"` in `blocked_models` blocks
    /// only the literal model id `"*"`, not all models.
    pub fn is_model_allowed(&self, model: &str) -> bool {
        if self.blocked_models.contains(model) {
            return false;
        }
        if self.allowed_models.contains("*") {
            return true;
        }
        self.allowed_models.contains(model)
    }
}

/// Merge `defaults` into `request` for every key present in `defaults` and
/// absent from `request`. Pure function — no shared-object mutation.
///
/// Recognized keys: `temperature`, `max_tokens`, `top_p`, `stop`,
/// `presence_penalty`, `frequency_penalty`.
pub fn apply_defaults(mut request: Value, defaults: &HashMap<String, Value>) -> Value {
    const MERGED_KEYS: &[&str] = &[
        "temperature",
        "max_tokens",
        "top_p",
        "stop",
        "presence_penalty",
        "frequency_penalty",
    ];

    if let Some(obj) = request.as_object_mut() {
        for key in MERGED_KEYS {
            if obj.contains_key(*key) {
                continue;
            }
            if let Some(value) = defaults.get(*key) {
                obj.insert((*key).to_string(), value.clone());
            }
        }
    }
    request
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn connector(allowed: &[&str], blocked: &[&str]) -> Connector {
        Connector {
            id: "c1".into(),
            api_key_hash: "x".repeat(64),
            allowed_models: allowed.iter().map(|s| s.to_string()).collect(),
            blocked_models: blocked.iter().map(|s| s.to_string()).collect(),
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
    fn wildcard_allows_all_models() {
        let c = connector(&["*"], &[]);
        assert!(c.is_model_allowed("llama3"));
        assert!(c.is_model_allowed("anything-else"));
    }

    #[test]
    fn explicit_allow_list_restricts_to_named_models() {
        let c = connector(&["llama3"], &[]);
        assert!(c.is_model_allowed("llama3"));
        assert!(!c.is_model_allowed("gpt-4"));
    }

    #[test]
    fn blocked_models_take_precedence_over_wildcard_allow() {
        let c = connector(&["*"], &["llama3"]);
        assert!(!c.is_model_allowed("llama3"));
        assert!(c.is_model_allowed("mixtral"));
    }

    #[test]
    fn literal_wildcard_in_blocked_models_blocks_only_the_literal_string() {
        // "*" in blocked_models is NOT a wildcard block — it blocks only the
        // literal model id "*".
        let c = connector(&["*"], &["*"]);
        assert!(!c.is_model_allowed("*"));
        assert!(c.is_model_allowed("llama3"));
    }

    #[test]
    fn both_local_only_and_cloud_only_normalizes_to_local_only() {
        let mut c = connector(&["*"], &[]);
        c.routing_local_only = true;
        c.routing_cloud_only = true;
        let c = c.normalized();
        assert!(c.routing_local_only);
        assert!(!c.routing_cloud_only);
    }

    #[test]
    fn apply_defaults_fills_only_absent_keys() {
        let request = json!({ "model": "llama3", "messages": [], "temperature": 0.2 });
        let mut defaults = HashMap::new();
        defaults.insert("temperature".to_string(), json!(0.9));
        defaults.insert("max_tokens".to_string(), json!(256));

        let merged = apply_defaults(request, &defaults);
        // temperature was already present — untouched.
        assert_eq!(merged["temperature"], json!(0.2));
        // max_tokens was absent — filled in.
        assert_eq!(merged["max_tokens"], json!(256));
    }

    #[test]
    fn apply_defaults_ignores_unrecognized_keys() {
        let request = json!({ "model": "llama3", "messages": [] });
        let mut defaults = HashMap::new();
        defaults.insert("system_prompt".to_string(), json!("be nice"));

        let merged = apply_defaults(request, &defaults);
        assert!(merged.get("system_prompt").is_none());
    }
}
