//! Unified OpenAI-compatible upstream client.
//!
//! Both dispatch targets — a node's `/v1/chat/completions` and the cloud
//! fallback's — speak the same wire protocol, so one client serves both
//! (`spec.md` §4.H), descended from the teacher's `OpenAIAdapter` in
//! `backends/openai.rs`: request bodies are forwarded verbatim, no schema
//! translation, a buffered `Client` with a configured timeout. What's new
//! here is per-call extra headers (OpenRouter-style attribution for the
//! cloud target) and response normalization (`id`/`created`/`choices[].finish_reason`
//! synthesized when an upstream omits them, matching `spec.md` §4.D's
//! "normalize, don't translate" posture).

use std::time::Duration;

use anyhow::Context;
use reqwest::{header, Client};
use serde_json::{json, Value};

use crate::error::GatewayError;

/// One extra header to attach to a specific call, e.g. OpenRouter's
/// `HTTP-Referer` / `X-Title` attribution pair.
pub type ExtraHeaders = Vec<(&'static str, String)>;

/// A buffered HTTP client aimed at one OpenAI-compatible base URL.
///
/// Built once per target (one for the local fleet, one for the cloud
/// fallback) and shared behind an `Arc` the same way the teacher shares its
/// `reqwest::Client` — cheap to clone, pools its own connections.
#[derive(Clone)]
pub struct UpstreamClient {
    client: Client,
    bearer_token: Option<String>,
}

impl UpstreamClient {
    pub fn new(timeout: Duration, bearer_token: Option<String>) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build reqwest client");
        Self { client, bearer_token }
    }

    /// `POST {base_url}{path}` with `body` as the JSON payload, returning the
    /// normalized JSON response. `base_url` varies per call (a node's
    /// `tunnel_url`/`ipv4`/`ipv6` endpoint, or the fixed cloud base), so it is
    /// not baked into the client at construction time.
    pub async fn post_json(
        &self,
        base_url: &str,
        path: &str,
        body: &Value,
        extra_headers: Option<&ExtraHeaders>,
    ) -> Result<Value, GatewayError> {
        let url = format!("{}{}", base_url.trim_end_matches('/'), path);
        let mut request = self.client.post(&url).json(body);

        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }
        if let Some(headers) = extra_headers {
            for (name, value) in headers {
                request = request.header(*name, value.as_str());
            }
        }

        let response = request
            .send()
            .await
            .map_err(|e| GatewayError::Other(anyhow::Error::new(e).context(format!("POST {url}"))))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .with_context(|| format!("reading response body from {url}"))?;

        if !status.is_success() {
            tracing::debug!(%url, %status, body = %text, "upstream returned non-success status");
            return Err(GatewayError::UpstreamBadResponse(status.as_u16()));
        }

        let mut value: Value = serde_json::from_str(&text)
            .with_context(|| format!("parsing upstream response as JSON: {text}"))?;
        normalize_chat_completion(&mut value);
        Ok(value)
    }

    /// `GET {base_url}{path}`, returning the parsed JSON response.
    pub async fn get_json(&self, base_url: &str, path: &str) -> Result<Value, GatewayError> {
        let url = format!("{}{}", base_url.trim_end_matches('/'), path);
        let mut request = self.client.get(&url);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| GatewayError::Other(anyhow::Error::new(e).context(format!("GET {url}"))))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .with_context(|| format!("reading response body from {url}"))?;
        if !status.is_success() {
            return Err(GatewayError::UpstreamBadResponse(status.as_u16()));
        }
        serde_json::from_str(&text).with_context(|| format!("parsing upstream response as JSON: {text}")).map_err(Into::into)
    }

    /// `GET {base_url}/v1/models` liveness probe — matches teacher's `health_check`.
    pub async fn health_check(&self, base_url: &str) -> anyhow::Result<()> {
        let url = format!("{}/v1/models", base_url.trim_end_matches('/'));
        let mut request = self.client.get(&url);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.with_context(|| format!("GET {url}"))?;
        anyhow::ensure!(
            response.status().is_success(),
            "health check returned HTTP {}",
            response.status()
        );
        Ok(())
    }
}

/// Synthesize fields an upstream omitted, so every response this gateway
/// returns has a complete OpenAI-shaped envelope regardless of how strict
/// the originating node's implementation is.
fn normalize_chat_completion(value: &mut Value) {
    let Some(obj) = value.as_object_mut() else { return };

    if !obj.contains_key("id") || obj["id"].is_null() {
        obj.insert("id".to_string(), json!(format!("chatcmpl-{}", chrono::Utc::now().timestamp())));
    }
    if !obj.contains_key("created") || obj["created"].is_null() {
        obj.insert(
            "created".to_string(),
            json!(chrono::Utc::now().timestamp()),
        );
    }
    if !obj.contains_key("object") || obj["object"].is_null() {
        obj.insert("object".to_string(), json!("chat.completion"));
    }

    if let Some(choices) = obj.get_mut("choices").and_then(|c| c.as_array_mut()) {
        for choice in choices {
            if let Some(choice_obj) = choice.as_object_mut() {
                if !choice_obj.contains_key("finish_reason") || choice_obj["finish_reason"].is_null() {
                    choice_obj.insert("finish_reason".to_string(), json!("stop"));
                }
            }
        }
    }
}

/// OpenRouter-style attribution headers, attached only to cloud-bound calls
/// when configured (`cloud.site_url` / `cloud.app_name` in config).
pub fn openrouter_attribution_headers(site_url: Option<&str>, app_name: Option<&str>) -> ExtraHeaders {
    let mut headers = ExtraHeaders::new();
    if let Some(url) = site_url {
        headers.push(("HTTP-Referer", url.to_string()));
    }
    if let Some(name) = app_name {
        headers.push(("X-Title", name.to_string()));
    }
    headers
}
