//! LLM gateway configuration types.
//!
//! Provider routing and per-request overrides are passed through
//! opaquely; the core neither parses nor depends on provider-specific
//! fields beyond the provider enumeration. Per-request overrides are
//! permitted for key, base URL, and timeout — never for resource limits.

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Supported LLM providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    /// OpenAI API.
    Openai,
    /// NVIDIA's OpenAI-compatible endpoint.
    Nvidia,
    /// Any OpenAI-compatible endpoint supplied via `api_base`.
    Custom,
}

impl std::fmt::Display for LlmProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Openai => write!(f, "openai"),
            Self::Nvidia => write!(f, "nvidia"),
            Self::Custom => write!(f, "custom"),
        }
    }
}

/// Default NVIDIA OpenAI-compatible API base.
pub const DEFAULT_NVIDIA_API_BASE: &str = "https://integrate.api.nvidia.com/v1";

/// Default gateway request timeout in seconds.
pub const DEFAULT_LLM_TIMEOUT_S: f64 = 120.0;

/// Validation failures in an [`LlmConfig`].
#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum LlmConfigError {
    /// Timeout outside the accepted window.
    #[error("llm_timeout_s {value} outside accepted range [1, 600]")]
    TimeoutOutOfRange {
        /// The rejected value.
        value: f64,
    },

    /// Temperature outside the accepted window.
    #[error("llm_temperature {value} outside accepted range [0, 2]")]
    TemperatureOutOfRange {
        /// The rejected value.
        value: f64,
    },

    /// Top-p outside the accepted window.
    #[error("llm_top_p {value} outside accepted range [0, 1]")]
    TopPOutOfRange {
        /// The rejected value.
        value: f64,
    },

    /// Model name missing.
    #[error("model_name must not be empty")]
    EmptyModelName,
}

/// Per-request gateway configuration.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Model identifier sent to the provider.
    pub model_name: String,
    /// Which provider to route to.
    pub provider: LlmProvider,
    /// Base URL override.
    pub api_base: Option<String>,
    /// API key override; environment keys are used when absent.
    pub api_key: Option<SecretString>,
    /// Provider-specific extra body, passed through opaquely.
    pub extra_body: serde_json::Map<String, serde_json::Value>,
    /// Request timeout in seconds.
    pub timeout_s: f64,
    /// Completion token cap.
    pub max_tokens: Option<u32>,
    /// Sampling temperature.
    pub temperature: Option<f64>,
    /// Nucleus sampling cutoff.
    pub top_p: Option<f64>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model_name: "gpt-4o".to_string(),
            provider: LlmProvider::Openai,
            api_base: None,
            api_key: None,
            extra_body: serde_json::Map::new(),
            timeout_s: DEFAULT_LLM_TIMEOUT_S,
            max_tokens: None,
            temperature: None,
            top_p: None,
        }
    }
}

impl LlmConfig {
    /// Validates the numeric windows of the configuration.
    ///
    /// # Errors
    ///
    /// Returns the first field outside its accepted window.
    pub fn validate(&self) -> Result<(), LlmConfigError> {
        if self.model_name.trim().is_empty() {
            return Err(LlmConfigError::EmptyModelName);
        }
        if !(1.0..=600.0).contains(&self.timeout_s) {
            return Err(LlmConfigError::TimeoutOutOfRange {
                value: self.timeout_s,
            });
        }
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(LlmConfigError::TemperatureOutOfRange { value: t });
            }
        }
        if let Some(p) = self.top_p {
            if !(0.0..=1.0).contains(&p) {
                return Err(LlmConfigError::TopPOutOfRange { value: p });
            }
        }
        Ok(())
    }
}
