//! Request envelope and context payload types.
//!
//! The envelope is the immutable inbound record; the context payload is
//! produced once per request by the external slicer/DLP collaborators and
//! is the only thing the gateway ever sees. Candidates come back from the
//! gateway, one per attempt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::verification::VerificationMode;

/// Immutable inbound request record. Mutated by no one after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Globally unique request identifier.
    pub request_id: String,
    /// The natural-language coding request.
    pub user_prompt: String,
    /// Requested isolation/verification mode.
    pub mode: VerificationMode,
    /// Root of the repository the request concerns.
    pub repo_root: String,
    /// UTC creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// A dependency edge between two symbols in the sliced context graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphEdge {
    /// Source symbol.
    pub from: String,
    /// Target symbol.
    pub to: String,
    /// Edge kind (call, import, inherit...), opaque to the core.
    #[serde(rename = "type")]
    pub edge_type: String,
}

/// Summary of the DLP pass over the outbound context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedactionReport {
    /// Number of confirmed-secret redactions applied.
    pub secrets_redacted: u32,
}

/// Context handed to the gateway for one attempt.
///
/// Invariant: no path outside the allowlist, no literal matching a
/// confirmed-secret pattern. The governance pipeline enforces both before
/// any cloud egress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextPayload {
    /// Originating request id.
    pub request_id: String,
    /// 1-indexed attempt this context feeds.
    pub attempt: u32,
    /// Context file paths.
    #[serde(default)]
    pub files: Vec<String>,
    /// Symbols surfaced by the slicer, when present.
    #[serde(default)]
    pub symbols: Vec<String>,
    /// Dependency edges surfaced by the slicer, when present.
    #[serde(default)]
    pub graph_edges: Vec<GraphEdge>,
    /// Prompt plus context content.
    pub content: String,
    /// DLP redaction summary for this payload.
    #[serde(default)]
    pub redaction_report: RedactionReport,
}

impl ContextPayload {
    /// Creates a payload with empty slicer output and a zero redaction
    /// report, as the HTTP surface does before governance runs.
    pub fn new(
        request_id: impl Into<String>,
        attempt: u32,
        files: Vec<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            attempt,
            files,
            symbols: Vec::new(),
            graph_edges: Vec::new(),
            content: content.into(),
            redaction_report: RedactionReport::default(),
        }
    }
}

/// A candidate produced by the LLM gateway, one per attempt.
///
/// Invariant: non-empty code. Syntax is proven (not assumed) by the parse
/// command of the sandbox plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    /// Globally unique candidate identifier.
    pub candidate_id: String,
    /// The code or diff to verify.
    pub diff_or_code: String,
    /// The model's stated reasoning.
    pub rationale: String,
    /// Checks the model expects to pass.
    #[serde(default)]
    pub expected_checks: Vec<String>,
}

impl Candidate {
    /// Creates a candidate with a fresh id.
    pub fn new(diff_or_code: impl Into<String>, rationale: impl Into<String>) -> Self {
        Self {
            candidate_id: format!("cand-{}", uuid::Uuid::new_v4()),
            diff_or_code: diff_or_code.into(),
            rationale: rationale.into(),
            expected_checks: Vec::new(),
        }
    }
}
