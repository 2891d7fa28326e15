//! Retry eligibility rules for the circuit breaker.
//!
//! The circuit breaker runs at most [`MAX_ATTEMPTS`] times per request.
//! Only `syntax` and `deterministic` failures are eligible for another
//! attempt; policy, timeout, and flake halt immediately, as does every
//! terminal violation event. Unknown or unclassified failures halt
//! fail-closed: a failure the classifier could not name must never be
//! retried into a pass.

use crate::verification::{FailureClass, VerificationResult, VerificationStatus, ViolationEvent};

/// Hard, non-configurable attempt cap. Attempts are 1-indexed.
pub const MAX_ATTEMPTS: u32 = 3;

/// A retry eligibility decision with its reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryDecision {
    /// Whether the loop should schedule another attempt.
    pub should_retry: bool,
    /// Human-readable reason, logged as state-transition telemetry.
    pub reason: String,
}

impl RetryDecision {
    fn halt(reason: impl Into<String>) -> Self {
        Self {
            should_retry: false,
            reason: reason.into(),
        }
    }

    fn retry(reason: impl Into<String>) -> Self {
        Self {
            should_retry: true,
            reason: reason.into(),
        }
    }
}

/// Determines whether a failed verification result warrants a retry.
///
/// Rules, evaluated in priority order:
///
/// 1. Passed results never retry.
/// 2. At or beyond [`MAX_ATTEMPTS`]: halt (`MaxRetriesExceeded` is the
///    caller's terminal event).
/// 3. Terminal violation events: halt immediately.
/// 4. Retryable failure classes (`syntax`, `deterministic`): retry.
/// 5. Everything else, including an unclassified failure: halt.
#[must_use]
pub fn decide(result: &VerificationResult, current_attempt: u32) -> RetryDecision {
    if result.status == VerificationStatus::Pass {
        return RetryDecision::halt("verification passed, no retry needed");
    }

    if current_attempt >= MAX_ATTEMPTS {
        return RetryDecision::halt(format!(
            "max attempts reached ({MAX_ATTEMPTS}), emitting MaxRetriesExceeded"
        ));
    }

    if let Some(event) = result.terminal_event {
        // All violation events halt; strict-mode faults are never retryable.
        if event.halts_retries() {
            return RetryDecision::halt(format!("terminal violation event '{event}' is non-retryable"));
        }
    }

    match result.failure_class {
        Some(class) if class.is_retryable() => RetryDecision::retry(format!(
            "failure class '{class}' is retryable, scheduling attempt {}",
            current_attempt + 1
        )),
        Some(class) => RetryDecision::halt(format!("failure class '{class}' is non-retryable")),
        None => RetryDecision::halt("no failure class on failed result, halting fail-closed"),
    }
}

/// The terminal event to record when a halt occurred, if any.
///
/// A retryable class exhausted at the attempt cap yields
/// [`ViolationEvent::MaxRetriesExceeded`]; a non-retryable failure
/// records its own terminal event (or none) as the terminal cause.
#[must_use]
pub fn terminal_event_for_halt(
    result: &VerificationResult,
    current_attempt: u32,
) -> Option<ViolationEvent> {
    if result.status == VerificationStatus::Pass {
        return None;
    }
    let class_retryable = result
        .failure_class
        .is_some_and(FailureClass::is_retryable);
    if current_attempt >= MAX_ATTEMPTS && class_retryable && result.terminal_event.is_none() {
        return Some(ViolationEvent::MaxRetriesExceeded);
    }
    result.terminal_event
}
