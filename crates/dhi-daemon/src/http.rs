//! HTTP surface consumed by the IDE/CLI.
//!
//! All payloads are JSON. Malformed envelopes and unknown providers are
//! rejected synchronously with 422 before any sandbox execution; sandbox
//! capacity exhaustion surfaces as an explicit backpressure error rather
//! than a queue that never drains.

use axum::Router;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use dhi_core::envelope::Candidate;
use dhi_core::llm::{LlmConfig, LlmProvider};
use dhi_core::manifest::{AttestationManifest, FinalStatus, build_manifest};
use dhi_core::verification::{
    AttemptHistory, ResourceLimits, VerificationMode, VerificationResult, VerificationStatus,
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use crate::manifest_store::ManifestStoreError;
use crate::orchestrator::{InterceptOutcome, OrchestrateParams, OrchestrationOutcome, intercept};
use crate::sandbox::{RequestBudget, Verifier, VerifyTask, build_plan};
use crate::state::SharedState;

/// Service name reported by the health endpoint.
pub const SERVICE_NAME: &str = "dhi";

/// Service version reported by the health endpoint.
pub const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

// =============================================================================
// Error Mapping
// =============================================================================

/// Client-visible API failure.
#[derive(Debug)]
pub enum ApiError {
    /// Request body failed validation.
    Invalid(String),
    /// No resource for the requested key.
    NotFound(String),
    /// Sandbox capacity exhausted past the bounded wait.
    Backpressure,
    /// Internal fault.
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            Self::Invalid(detail) => (StatusCode::UNPROCESSABLE_ENTITY, detail),
            Self::NotFound(detail) => (StatusCode::NOT_FOUND, detail),
            Self::Backpressure => (
                StatusCode::SERVICE_UNAVAILABLE,
                "sandbox capacity exhausted; retry later".to_string(),
            ),
            Self::Internal(detail) => (StatusCode::INTERNAL_SERVER_ERROR, detail),
        };
        (status, axum::Json(json!({ "detail": detail }))).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::Invalid(rejection.body_text())
    }
}

// =============================================================================
// Request Bodies
// =============================================================================

fn default_request_id() -> String {
    "anonymous".to_string()
}

const fn default_attempt() -> u32 {
    1
}

const fn default_mode() -> VerificationMode {
    VerificationMode::Balanced
}

fn default_model_name() -> String {
    "gpt-4o".to_string()
}

const fn default_provider() -> LlmProvider {
    LlmProvider::Openai
}

const fn default_timeout_s() -> f64 {
    120.0
}

/// Per-request LLM options shared by `/intercept` and `/orchestrate`.
#[derive(Debug, Clone, Deserialize)]
pub struct LlmOptions {
    /// Model identifier.
    #[serde(default = "default_model_name")]
    pub model_name: String,
    /// Provider route. Unknown values reject with 422.
    #[serde(default = "default_provider")]
    pub llm_provider: LlmProvider,
    /// Base URL override.
    #[serde(default)]
    pub llm_api_base: Option<String>,
    /// API key override.
    #[serde(default)]
    pub llm_api_key: Option<String>,
    /// Provider-specific extra body, passed through opaquely.
    #[serde(default)]
    pub llm_extra_body: serde_json::Map<String, serde_json::Value>,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout_s")]
    pub llm_timeout_s: f64,
    /// Completion token cap.
    #[serde(default)]
    pub llm_max_tokens: Option<u32>,
    /// Sampling temperature.
    #[serde(default)]
    pub llm_temperature: Option<f64>,
    /// Nucleus sampling cutoff.
    #[serde(default)]
    pub llm_top_p: Option<f64>,
}

impl LlmOptions {
    fn into_config(self) -> Result<LlmConfig, ApiError> {
        let config = LlmConfig {
            model_name: self.model_name,
            provider: self.llm_provider,
            api_base: self.llm_api_base,
            api_key: self.llm_api_key.map(SecretString::from),
            extra_body: self.llm_extra_body,
            timeout_s: self.llm_timeout_s,
            max_tokens: self.llm_max_tokens,
            temperature: self.llm_temperature,
            top_p: self.llm_top_p,
        };
        config
            .validate()
            .map_err(|err| ApiError::Invalid(err.to_string()))?;
        Ok(config)
    }
}

/// Request body for `POST /verify`.
#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    /// Candidate code to execute.
    pub code: String,
    /// Request id; defaults to `anonymous`.
    #[serde(default = "default_request_id")]
    pub request_id: String,
    /// Attempt number this verification belongs to.
    #[serde(default = "default_attempt")]
    pub attempt: u32,
    /// Isolation mode.
    #[serde(default = "default_mode")]
    pub mode: VerificationMode,
}

/// Request body for `POST /intercept` and `POST /orchestrate`.
#[derive(Debug, Deserialize)]
pub struct InterceptRequest {
    /// Request id; defaults to `anonymous`.
    #[serde(default = "default_request_id")]
    pub request_id: String,
    /// Attempt number (intercept only; orchestrate manages its own).
    #[serde(default = "default_attempt")]
    pub attempt: u32,
    /// Context file paths.
    #[serde(default)]
    pub files: Vec<String>,
    /// Prompt plus context content.
    pub content: String,
    /// Isolation mode.
    #[serde(default = "default_mode")]
    pub mode: VerificationMode,
    /// Gateway options.
    #[serde(flatten)]
    pub llm: LlmOptions,
}

/// Sandbox result combined with its attestation manifest.
#[derive(Debug, Serialize)]
pub struct AttestationResponse {
    /// The verification result.
    pub result: VerificationResult,
    /// The proof artifact.
    pub manifest: AttestationManifest,
}

// =============================================================================
// Router
// =============================================================================

/// Builds the daemon router.
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/verify", post(verify))
        .route("/intercept", post(intercept_handler))
        .route("/orchestrate", post(orchestrate))
        .route("/manifest/{request_id}", get(manifest))
        .with_state(state)
}

async fn health() -> axum::Json<serde_json::Value> {
    axum::Json(json!({
        "status": "ok",
        "service": SERVICE_NAME,
        "version": SERVICE_VERSION,
    }))
}

/// Submits code for one local sandbox pass and returns the proof artifact.
async fn verify(
    State(state): State<SharedState>,
    body: Result<axum::Json<VerifyRequest>, JsonRejection>,
) -> Result<axum::Json<AttestationResponse>, ApiError> {
    let axum::Json(req) = body?;
    let _slot = state
        .acquire_sandbox_slot()
        .await
        .map_err(|_| ApiError::Backpressure)?;

    let candidate = Candidate::new(req.code, String::new());
    let (plan, pre_skipped) = build_plan(req.mode, &state.config.plan);
    let budget = RequestBudget::new(ResourceLimits::for_mode(req.mode).request_budget);
    let history = AttemptHistory::new();
    let cancel = state.shutdown.child_token();

    let result = state
        .executor
        .verify(VerifyTask {
            request_id: &req.request_id,
            candidate: &candidate,
            attempt: req.attempt,
            mode: req.mode,
            plan: &plan,
            pre_skipped: &pre_skipped,
            history: &history,
            budget: &budget,
            cancel: &cancel,
        })
        .await;

    let final_status = if result.status == VerificationStatus::Pass {
        FinalStatus::Verified
    } else {
        FinalStatus::Failed
    };
    let mut manifest = build_manifest(
        &result,
        req.attempt,
        req.attempt.saturating_sub(1),
        result.terminal_event,
        final_status,
    );
    if manifest.final_status == FinalStatus::Verified {
        if let Err(err) = manifest.assert_complete() {
            warn!(request_id = %req.request_id, error = %err, "manifest incomplete, downgrading");
            manifest.final_status = FinalStatus::Failed;
        }
    }
    match state.manifests.store(&manifest) {
        Ok(_) => {},
        Err(ManifestStoreError::AlreadyExists { .. }) => {
            warn!(request_id = %req.request_id, "manifest already emitted; keeping first");
        },
        Err(err) => return Err(ApiError::Internal(err.to_string())),
    }

    Ok(axum::Json(AttestationResponse { result, manifest }))
}

/// Runs governance + cloud generation + extraction + one sandbox pass.
async fn intercept_handler(
    State(state): State<SharedState>,
    body: Result<axum::Json<InterceptRequest>, JsonRejection>,
) -> Result<axum::Json<InterceptOutcome>, ApiError> {
    let axum::Json(req) = body?;
    let llm = req.llm.into_config()?;
    let _slot = state
        .acquire_sandbox_slot()
        .await
        .map_err(|_| ApiError::Backpressure)?;
    let cancel = state.shutdown.child_token();

    let outcome = intercept(
        &state.gateway,
        &state.executor,
        &state.config.plan,
        OrchestrateParams {
            request_id: req.request_id,
            files: req.files,
            content: req.content,
            mode: req.mode,
            llm,
        },
        req.attempt,
        &cancel,
    )
    .await;
    Ok(axum::Json(outcome))
}

/// Drives the full bounded retry loop.
async fn orchestrate(
    State(state): State<SharedState>,
    body: Result<axum::Json<InterceptRequest>, JsonRejection>,
) -> Result<axum::Json<OrchestrationOutcome>, ApiError> {
    let axum::Json(req) = body?;
    let llm = req.llm.into_config()?;
    let _slot = state
        .acquire_sandbox_slot()
        .await
        .map_err(|_| ApiError::Backpressure)?;
    let cancel = state.shutdown.child_token();

    let outcome = state
        .orchestrator()
        .run(
            OrchestrateParams {
                request_id: req.request_id,
                files: req.files,
                content: req.content,
                mode: req.mode,
                llm,
            },
            &cancel,
        )
        .await;
    Ok(axum::Json(outcome))
}

/// Retrieves the attestation manifest for a completed request.
async fn manifest(
    State(state): State<SharedState>,
    Path(request_id): Path<String>,
) -> Result<axum::Json<AttestationManifest>, ApiError> {
    match state.manifests.load(&request_id) {
        Ok(Some(manifest)) => Ok(axum::Json(manifest)),
        Ok(None) => Err(ApiError::NotFound(format!(
            "No attestation manifest found for request_id='{request_id}'"
        ))),
        Err(err) => Err(ApiError::Internal(err.to_string())),
    }
}
