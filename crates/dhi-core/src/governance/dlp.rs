//! High-entropy token detection for DLP scanning.
//!
//! Shannon entropy catches non-patterned secrets (base64 credentials,
//! random API keys) that evade the regex detectors. A perfectly random
//! ASCII string of 64 characters has entropy ~6.0 bits/char; English
//! prose averages 3.5-4.0. Values above the threshold suggest encoded
//! secrets.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

/// Tokens with entropy at or above this threshold are flagged.
pub const HIGH_ENTROPY_THRESHOLD: f64 = 4.5;

/// Tokens shorter than this are ignored.
pub const MIN_TOKEN_LEN: usize = 16;

/// Redaction marker for high-entropy (non-pattern-confirmed) tokens.
pub const HIGH_ENTROPY_MARKER: &str = "<REDACTED_HIGH_ENTROPY>";

static TOKENIZER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"[\s'"=:,;()\[\]{}<>|\\@&#%!?]+"#).expect("tokenizer pattern is valid")
});

/// Only tokens containing at least one digit or symbol character are
/// evaluated; pure alpha words are common in prose and code comments.
static NON_TRIVIAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[0-9+/=_\-]").expect("non-trivial pattern is valid"));

/// Calculates the Shannon entropy of a string in bits per character.
#[must_use]
pub fn shannon_entropy(token: &str) -> f64 {
    if token.is_empty() {
        return 0.0;
    }
    let mut frequency: HashMap<char, usize> = HashMap::new();
    for ch in token.chars() {
        *frequency.entry(ch).or_insert(0) += 1;
    }
    #[allow(clippy::cast_precision_loss)]
    let length = token.chars().count() as f64;
    frequency
        .values()
        .map(|&count| {
            #[allow(clippy::cast_precision_loss)]
            let probability = count as f64 / length;
            -probability * probability.log2()
        })
        .sum()
}

/// Returns `(token, entropy)` for every over-threshold token in the
/// content.
#[must_use]
pub fn scan_high_entropy_tokens(content: &str) -> Vec<(String, f64)> {
    TOKENIZER
        .split(content)
        .filter_map(|raw| {
            let token = raw.trim_matches(|c: char| "'\"`)\\".contains(c));
            if token.len() < MIN_TOKEN_LEN || !NON_TRIVIAL.is_match(token) {
                return None;
            }
            let entropy = shannon_entropy(token);
            (entropy >= HIGH_ENTROPY_THRESHOLD).then(|| (token.to_string(), entropy))
        })
        .collect()
}

/// Replaces over-threshold tokens with [`HIGH_ENTROPY_MARKER`].
///
/// Returns the redacted content and the total count of redactions made.
#[must_use]
pub fn redact_high_entropy(content: &str) -> (String, u32) {
    let flagged = scan_high_entropy_tokens(content);
    if flagged.is_empty() {
        return (content.to_string(), 0);
    }

    let mut redacted = content.to_string();
    let mut count = 0u32;
    let mut seen: Vec<String> = Vec::new();
    for (token, _) in flagged {
        if seen.contains(&token) {
            continue;
        }
        let occurrences = u32::try_from(redacted.matches(token.as_str()).count()).unwrap_or(0);
        if occurrences > 0 {
            redacted = redacted.replace(token.as_str(), HIGH_ENTROPY_MARKER);
            count += occurrences;
        }
        seen.push(token);
    }

    (redacted, count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entropy_of_empty_string_is_zero() {
        assert!((shannon_entropy("") - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn entropy_of_repeated_char_is_zero() {
        assert!(shannon_entropy("aaaaaaaaaaaaaaaa") < 0.01);
    }

    #[test]
    fn random_base64_is_flagged() {
        let content = "token candidate: dGhpcyBpcyBhIHNlY3JldCBrZXkxMjM0NTY3ODkwcXdlcnR5";
        let flagged = scan_high_entropy_tokens(content);
        assert_eq!(flagged.len(), 1);
        assert!(flagged[0].1 >= HIGH_ENTROPY_THRESHOLD);
    }

    #[test]
    fn english_prose_is_not_flagged() {
        let content = "the quick brown fox jumps over the lazy dog repeatedly";
        assert!(scan_high_entropy_tokens(content).is_empty());
    }

    #[test]
    fn short_tokens_are_ignored() {
        assert!(scan_high_entropy_tokens("Xk9/2q+A").is_empty());
    }

    #[test]
    fn pure_alpha_tokens_are_ignored() {
        // Long but trivially alphabetical, like identifiers in prose.
        assert!(scan_high_entropy_tokens("InternationalizationHelper").is_empty());
    }

    #[test]
    fn redaction_replaces_every_occurrence() {
        let secret = "dGhpcyBpcyBhIHNlY3JldCBrZXkxMjM0NTY3ODkwcXdlcnR5";
        let content = format!("first {secret} then {secret} again");
        let (redacted, count) = redact_high_entropy(&content);
        assert_eq!(count, 2);
        assert!(!redacted.contains(secret));
        assert_eq!(redacted.matches(HIGH_ENTROPY_MARKER).count(), 2);
    }

    #[test]
    fn clean_content_passes_through_untouched() {
        let content = "def add(a, b):\n    return a + b";
        let (redacted, count) = redact_high_entropy(content);
        assert_eq!(count, 0);
        assert_eq!(redacted, content);
    }
}
