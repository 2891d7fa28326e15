//! Deterministic prompt construction for generation and repair attempts.
//!
//! The templates here are fixed and policy-layered: policy instructions
//! live in the system prompt, repository-derived text is embedded below
//! it, and nothing in the repository text can alter the policy layer.
//! Repair prompts embed the prior failure class and a bounded slice of
//! the captured output; the same inputs always produce the same prompt.

use crate::verification::{FailureClass, VerificationResult};

/// System prompt sent with every generation request.
pub const SYSTEM_PROMPT: &str = "\
You are Dhi, an advanced AI software engineer.
You will be provided with context files and a user request context.
Your task is to analyze the context and return a secure, robust code solution.
You MUST format your entire response as a single, valid JSON object containing exactly three keys:
{
  \"language\": \"python\",
  \"code\": \"print('hello')\",
  \"notes\": \"My reasoning and explanation.\"
}
DO NOT wrap the code value inside markdown fences within the JSON property.
Your response must be parseable by standard JSON parsers.";

/// Maximum characters taken from stdout/stderr in a repair prompt.
const MAX_OUTPUT_CHARS: usize = 2_000;

fn truncate(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n...[TRUNCATED]", &text[..end])
}

fn failure_guidance(failure_class: Option<FailureClass>) -> &'static str {
    match failure_class {
        Some(FailureClass::Syntax) => {
            "The previous code had a SYNTAX ERROR. Review the error output carefully \
             and emit clean, syntactically valid code."
        },
        Some(FailureClass::Deterministic) => {
            "The previous code produced a DETERMINISTIC LOGICAL FAILURE (consistent \
             wrong output or exception). Do not change the overall approach - instead \
             fix the specific logical error shown in the error output."
        },
        _ => {
            "The previous attempt failed. Analyze the error output and produce a \
             corrected solution."
        },
    }
}

/// Constructs the repair prompt for the next attempt.
///
/// Embeds the original request, the exact failure class, and bounded
/// slices of the captured output. The output replaces the `content` of
/// the next attempt's context payload.
#[must_use]
pub fn build_repair_prompt(original_content: &str, last_result: &VerificationResult) -> String {
    let class_label = last_result
        .failure_class
        .map_or_else(|| "unknown".to_string(), |c| c.to_string());

    let mut sections: Vec<String> = vec![
        "## PREVIOUS ATTEMPT FAILED - REPAIR REQUIRED".to_string(),
        String::new(),
        format!("**Failure class:** {class_label}"),
        format!("**Attempt number:** {}", last_result.attempt),
        String::new(),
        "### Guidance".to_string(),
        failure_guidance(last_result.failure_class).to_string(),
        String::new(),
    ];

    if !last_result.stdout.trim().is_empty() {
        sections.push("### Captured stdout".to_string());
        sections.push("```".to_string());
        sections.push(truncate(&last_result.stdout, MAX_OUTPUT_CHARS));
        sections.push("```".to_string());
        sections.push(String::new());
    }

    if !last_result.stderr.trim().is_empty() {
        sections.push("### Captured stderr".to_string());
        sections.push("```".to_string());
        sections.push(truncate(&last_result.stderr, MAX_OUTPUT_CHARS));
        sections.push("```".to_string());
        sections.push(String::new());
    }

    sections.push("---".to_string());
    sections.push(String::new());
    sections.push("## Original Request".to_string());
    sections.push(original_content.to_string());

    sections.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verification::{FailureClass, VerificationMode, VerificationResult};

    fn syntax_failure(stderr: &str) -> VerificationResult {
        VerificationResult::failure(
            "req-1",
            "cand-1",
            1,
            VerificationMode::Balanced,
            FailureClass::Syntax,
            None,
            stderr,
            15,
        )
    }

    #[test]
    fn repair_prompt_is_deterministic() {
        let result = syntax_failure("SyntaxError: invalid syntax");
        let a = build_repair_prompt("add two numbers", &result);
        let b = build_repair_prompt("add two numbers", &result);
        assert_eq!(a, b);
    }

    #[test]
    fn repair_prompt_embeds_class_and_original_request() {
        let result = syntax_failure("SyntaxError: invalid syntax");
        let prompt = build_repair_prompt("add two numbers", &result);
        assert!(prompt.contains("**Failure class:** syntax"));
        assert!(prompt.contains("SYNTAX ERROR"));
        assert!(prompt.contains("## Original Request\nadd two numbers"));
        assert!(prompt.contains("SyntaxError: invalid syntax"));
    }

    #[test]
    fn stderr_slice_is_bounded() {
        let result = syntax_failure(&"x".repeat(10_000));
        let prompt = build_repair_prompt("req", &result);
        assert!(prompt.contains("...[TRUNCATED]"));
        // The embedded slice never exceeds the cap plus the marker.
        let stderr_section = prompt.split("### Captured stderr").nth(1).unwrap();
        assert!(stderr_section.len() < 2_200);
    }

    #[test]
    fn empty_output_sections_are_omitted() {
        let result = syntax_failure("");
        let prompt = build_repair_prompt("req", &result);
        assert!(!prompt.contains("### Captured stdout"));
        assert!(!prompt.contains("### Captured stderr"));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let text = format!("{}é", "a".repeat(MAX_OUTPUT_CHARS - 1));
        let truncated = truncate(&text, MAX_OUTPUT_CHARS);
        assert!(truncated.ends_with("...[TRUNCATED]"));
    }
}
