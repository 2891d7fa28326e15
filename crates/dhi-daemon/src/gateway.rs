//! LLM gateway: outbound cloud generation over OpenAI-compatible APIs.
//!
//! The gateway marshals the governed context payload into a chat
//! completion request and returns the raw response text; candidate
//! extraction happens in `dhi-core`. Provider routing covers `openai`,
//! `nvidia`, and `custom`; per-request overrides are accepted for key,
//! base URL, and timeout only. Transport failures are infrastructure
//! noise for the determinism gate, never candidate signal.

use std::future::Future;
use std::time::Duration;

use dhi_core::envelope::ContextPayload;
use dhi_core::llm::{DEFAULT_NVIDIA_API_BASE, LlmConfig, LlmProvider};
use dhi_core::prompts::SYSTEM_PROMPT;
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use thiserror::Error;
use tracing::debug;

/// Default OpenAI API base.
const DEFAULT_OPENAI_API_BASE: &str = "https://api.openai.com/v1";

/// Errors from the gateway.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GatewayError {
    /// No API key available for the provider, from request or environment.
    #[error("no API key available for provider '{provider}'")]
    MissingApiKey {
        /// The provider that needed a key.
        provider: LlmProvider,
    },

    /// The custom provider requires an explicit base URL.
    #[error("llm_api_base is required when llm_provider='custom'")]
    MissingApiBase,

    /// The provider rejected the request.
    #[error("provider returned HTTP {status}: {body}")]
    ProviderRejected {
        /// HTTP status code.
        status: u16,
        /// Response body, truncated.
        body: String,
    },

    /// Transport-level failure reaching the provider.
    #[error("gateway transport failure: {0}")]
    Transport(#[from] reqwest::Error),

    /// The provider returned no usable content.
    #[error("provider response contained no content")]
    EmptyResponse,
}

impl GatewayError {
    /// Returns `true` for faults that say nothing about the candidate and
    /// must be treated as provider-outage noise by the determinism gate.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::ProviderRejected { .. })
    }
}

/// Environment-sourced provider credentials, read once at startup.
#[derive(Debug, Clone, Default)]
pub struct ProviderKeys {
    /// `OPENAI_API_KEY`.
    pub openai_api_key: Option<SecretString>,
    /// `NVIDIA_API_KEY`.
    pub nvidia_api_key: Option<SecretString>,
    /// `NVIDIA_API_BASE` override.
    pub nvidia_api_base: Option<String>,
}

impl ProviderKeys {
    /// Reads provider credentials from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        let read = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            openai_api_key: read("OPENAI_API_KEY").map(SecretString::from),
            nvidia_api_key: read("NVIDIA_API_KEY").map(SecretString::from),
            nvidia_api_base: read("NVIDIA_API_BASE"),
        }
    }
}

/// Anything that can turn a governed context into raw candidate text.
pub trait CandidateGenerator: Send + Sync {
    /// Generates one raw completion for the payload.
    fn generate(
        &self,
        payload: &ContextPayload,
        config: &LlmConfig,
    ) -> impl Future<Output = Result<String, GatewayError>> + Send;
}

/// HTTP gateway over OpenAI-compatible chat completion endpoints.
#[derive(Debug, Clone)]
pub struct HttpGateway {
    client: reqwest::Client,
    keys: ProviderKeys,
}

impl HttpGateway {
    /// Creates a gateway with startup-time provider credentials.
    #[must_use]
    pub fn new(keys: ProviderKeys) -> Self {
        Self {
            client: reqwest::Client::new(),
            keys,
        }
    }

    /// Resolves `(api_base, api_key)` for a request, honoring per-request
    /// overrides before environment credentials.
    fn resolve_route(&self, config: &LlmConfig) -> Result<(String, SecretString), GatewayError> {
        match config.provider {
            LlmProvider::Openai => {
                let base = config
                    .api_base
                    .clone()
                    .unwrap_or_else(|| DEFAULT_OPENAI_API_BASE.to_string());
                let key = config
                    .api_key
                    .clone()
                    .or_else(|| self.keys.openai_api_key.clone())
                    .ok_or(GatewayError::MissingApiKey {
                        provider: LlmProvider::Openai,
                    })?;
                Ok((base, key))
            },
            LlmProvider::Nvidia => {
                let base = config
                    .api_base
                    .clone()
                    .or_else(|| self.keys.nvidia_api_base.clone())
                    .unwrap_or_else(|| DEFAULT_NVIDIA_API_BASE.to_string());
                let key = config
                    .api_key
                    .clone()
                    .or_else(|| self.keys.nvidia_api_key.clone())
                    .ok_or(GatewayError::MissingApiKey {
                        provider: LlmProvider::Nvidia,
                    })?;
                Ok((base, key))
            },
            LlmProvider::Custom => {
                let base = config.api_base.clone().ok_or(GatewayError::MissingApiBase)?;
                let key = config
                    .api_key
                    .clone()
                    .or_else(|| self.keys.openai_api_key.clone())
                    .ok_or(GatewayError::MissingApiKey {
                        provider: LlmProvider::Custom,
                    })?;
                Ok((base, key))
            },
        }
    }
}

/// Builds the user-role prompt from a governed payload.
#[must_use]
pub fn build_user_prompt(payload: &ContextPayload) -> String {
    let mut prompt = format!("Request ID: {}\n\n", payload.request_id);
    if !payload.files.is_empty() {
        prompt.push_str("CONTEXT FILES:\n");
        prompt.push_str(&payload.files.join(", "));
        prompt.push_str("\n\n");
    }
    prompt.push_str("CONTEXT CONTENT:\n");
    prompt.push_str(&payload.content);
    prompt.trim().to_string()
}

impl CandidateGenerator for HttpGateway {
    async fn generate(
        &self,
        payload: &ContextPayload,
        config: &LlmConfig,
    ) -> Result<String, GatewayError> {
        let (api_base, api_key) = self.resolve_route(config)?;

        let mut body = json!({
            "model": config.model_name,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": build_user_prompt(payload)},
            ],
        });
        let map = body.as_object_mut().expect("body is an object");
        if let Some(max_tokens) = config.max_tokens {
            map.insert("max_tokens".to_string(), json!(max_tokens));
        }
        if let Some(temperature) = config.temperature {
            map.insert("temperature".to_string(), json!(temperature));
        }
        if let Some(top_p) = config.top_p {
            map.insert("top_p".to_string(), json!(top_p));
        }
        // NVIDIA's OpenAI-compatible endpoint may reject strict response
        // formatting; the extraction fallback covers it there.
        if config.provider != LlmProvider::Nvidia {
            map.insert("response_format".to_string(), json!({"type": "json_object"}));
        }
        for (key, value) in &config.extra_body {
            map.insert(key.clone(), value.clone());
        }

        debug!(
            request_id = %payload.request_id,
            provider = %config.provider,
            model = %config.model_name,
            "dispatching generation request"
        );

        let url = format!("{}/chat/completions", api_base.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key.expose_secret())
            .timeout(Duration::from_secs_f64(config.timeout_s))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let mut truncated = body;
            truncated.truncate(2_000);
            return Err(GatewayError::ProviderRejected {
                status: status.as_u16(),
                body: truncated,
            });
        }

        let parsed: serde_json::Value = response.json().await?;
        parsed
            .pointer("/choices/0/message/content")
            .and_then(serde_json::Value::as_str)
            .map(ToString::to_string)
            .filter(|content| !content.trim().is_empty())
            .ok_or(GatewayError::EmptyResponse)
    }
}
