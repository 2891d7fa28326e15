//! Candidate extraction from raw LLM output.
//!
//! The gateway asks for a strict JSON object (`language`, `code`,
//! `notes`); some providers ignore the response-format hint, so a
//! markdown fence fallback covers them. An empty candidate fails
//! extraction here; syntax is proven, not assumed, by the parse command
//! of the sandbox plan downstream.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Structured JSON response expected from the LLM.
#[derive(Debug, Clone, Deserialize)]
pub struct LlmReply {
    /// Declared language of the candidate.
    pub language: String,
    /// The candidate code.
    pub code: String,
    /// The model's reasoning.
    #[serde(default)]
    pub notes: String,
}

/// Result of extracting candidate code from LLM output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionOutcome {
    /// Whether a usable candidate was extracted.
    pub success: bool,
    /// Extracted code (may be present even on failure, for diagnostics).
    pub code: String,
    /// Normalized declared language, when one was found.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Model notes, when present.
    pub notes: String,
    /// Whether the markdown fallback path produced this outcome.
    pub fallback_used: bool,
    /// Why extraction failed, when it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExtractionOutcome {
    fn failure(code: String, fallback_used: bool, error: impl Into<String>) -> Self {
        Self {
            success: false,
            code,
            language: None,
            notes: String::new(),
            fallback_used,
            error: Some(error.into()),
        }
    }
}

static FENCE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?P<lang>[A-Za-z0-9_+\-]*)\n(?P<code>.*?)```")
        .expect("fence pattern is valid")
});

fn strip_json_fence(response_text: &str) -> &str {
    let stripped = response_text.trim();
    stripped
        .strip_prefix("```json")
        .and_then(|rest| rest.strip_suffix("```"))
        .map_or(stripped, str::trim)
}

fn build_outcome(code: &str, language: &str, notes: &str, fallback_used: bool) -> ExtractionOutcome {
    let language_normalized = language.trim().to_lowercase();
    if code.trim().is_empty() {
        return ExtractionOutcome::failure(
            code.to_string(),
            fallback_used,
            "Candidate code is completely empty.",
        );
    }
    ExtractionOutcome {
        success: true,
        code: code.to_string(),
        language: Some(language_normalized),
        notes: notes.to_string(),
        fallback_used,
        error: None,
    }
}

fn parse_markdown_fallback(response_text: &str) -> ExtractionOutcome {
    let Some(captures) = FENCE_PATTERN.captures(response_text) else {
        return ExtractionOutcome::failure(
            String::new(),
            true,
            "Could not extract code via JSON or Markdown blocks.",
        );
    };
    let language = captures
        .name("lang")
        .map(|m| m.as_str())
        .filter(|lang| !lang.is_empty())
        .unwrap_or("python");
    let code = captures.name("code").map_or("", |m| m.as_str()).trim();
    build_outcome(code, language, "", true)
}

/// Extracts candidate code from LLM output: JSON first, markdown
/// fallback second.
#[must_use]
pub fn extract_candidate(response_text: &str) -> ExtractionOutcome {
    if response_text.trim().is_empty() {
        return ExtractionOutcome::failure(String::new(), false, "Raw LLM response was empty.");
    }

    let cleaned = strip_json_fence(response_text);
    if let Ok(reply) = serde_json::from_str::<LlmReply>(cleaned) {
        return build_outcome(&reply.code, &reply.language, &reply.notes, false);
    }

    debug!("primary JSON extraction failed, using markdown fallback parser");
    parse_markdown_fallback(response_text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_strict_json_response() {
        let raw = r#"{"language": "python", "code": "print(1+1)", "notes": "sums"}"#;
        let outcome = extract_candidate(raw);
        assert!(outcome.success);
        assert_eq!(outcome.code, "print(1+1)");
        assert_eq!(outcome.language.as_deref(), Some("python"));
        assert!(!outcome.fallback_used);
    }

    #[test]
    fn extracts_json_wrapped_in_fence() {
        let raw = "```json\n{\"language\": \"python\", \"code\": \"x = 1\", \"notes\": \"\"}\n```";
        let outcome = extract_candidate(raw);
        assert!(outcome.success);
        assert_eq!(outcome.code, "x = 1");
    }

    #[test]
    fn falls_back_to_markdown_fence() {
        let raw = "Here you go:\n```python\nprint('hi')\n```\nenjoy";
        let outcome = extract_candidate(raw);
        assert!(outcome.success);
        assert!(outcome.fallback_used);
        assert_eq!(outcome.code, "print('hi')");
        assert_eq!(outcome.language.as_deref(), Some("python"));
    }

    #[test]
    fn fence_without_language_defaults_to_python() {
        let raw = "```\nprint('hi')\n```";
        let outcome = extract_candidate(raw);
        assert!(outcome.success);
        assert_eq!(outcome.language.as_deref(), Some("python"));
    }

    #[test]
    fn empty_response_fails() {
        let outcome = extract_candidate("   \n  ");
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("Raw LLM response was empty."));
    }

    #[test]
    fn empty_code_fails_even_when_json_parses() {
        let raw = r#"{"language": "python", "code": "   ", "notes": "nothing"}"#;
        let outcome = extract_candidate(raw);
        assert!(!outcome.success);
        assert_eq!(
            outcome.error.as_deref(),
            Some("Candidate code is completely empty.")
        );
    }

    #[test]
    fn prose_without_code_fails() {
        let outcome = extract_candidate("I cannot produce code for this request.");
        assert!(!outcome.success);
        assert!(outcome.fallback_used);
    }

    #[test]
    fn language_is_normalized() {
        let raw = r#"{"language": " Python ", "code": "x = 1", "notes": ""}"#;
        let outcome = extract_candidate(raw);
        assert_eq!(outcome.language.as_deref(), Some("python"));
    }
}
