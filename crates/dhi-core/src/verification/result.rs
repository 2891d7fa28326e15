//! The canonical verification contract payload.
//!
//! Every sandbox execution must account for every field here. Downstream
//! consumers (the circuit breaker, the attestation builder, the VEIL
//! ledger) rely on the result being structurally complete even when the
//! run failed before a single command could execute.
//!
//! # Pass/Fail Invariant
//!
//! `status = pass` if and only if `failure_class` is absent and `tier` is
//! present. [`VerificationResult::validate`] enforces this; the executor
//! and the orchestrator both call it before handing a result across a
//! component boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Contract schema version. Increments when any field is added or renamed.
pub const SCHEMA_VERSION: &str = "1.0";

// =============================================================================
// Closed Sum Types
// =============================================================================

/// Runtime isolation mode for the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationMode {
    /// Container profile, command plan truncated to L0 checks.
    Fast,
    /// Rootless container profile, full command plan.
    Balanced,
    /// Hardware-virtualized microVM profile. Unavailability is a terminal
    /// fault, never a downgrade.
    Strict,
}

impl std::fmt::Display for VerificationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fast => write!(f, "fast"),
            Self::Balanced => write!(f, "balanced"),
            Self::Strict => write!(f, "strict"),
        }
    }
}

/// Pass or fail outcome of a verification run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationStatus {
    /// Every executed command exited zero and no violation fired.
    Pass,
    /// At least one command failed, a violation fired, or the run never
    /// reached execution.
    Fail,
}

impl VerificationStatus {
    /// Returns `true` for a passing outcome.
    #[must_use]
    pub const fn is_pass(self) -> bool {
        matches!(self, Self::Pass)
    }
}

/// Verification tier indicating the quality of proof a passing run carries.
///
/// `AiTestsOnly` means human review is required before trusting the result;
/// AI-authored tests never confer `L1` or `L2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum VerificationTier {
    /// Parse, lint, and static type checks only.
    L0,
    /// L0 plus at least one pre-existing user-authored unit test.
    L1,
    /// L1 plus at least one user-authored integration or e2e test.
    L2,
    /// Every passing test in the run was AI-authored.
    #[serde(rename = "AI_TESTS_ONLY")]
    AiTestsOnly,
}

impl std::fmt::Display for VerificationTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::L0 => write!(f, "L0"),
            Self::L1 => write!(f, "L1"),
            Self::L2 => write!(f, "L2"),
            Self::AiTestsOnly => write!(f, "AI_TESTS_ONLY"),
        }
    }
}

impl VerificationTier {
    /// Returns `true` when the tier mandates the human-review-required
    /// marker on the attestation manifest.
    #[must_use]
    pub const fn requires_human_review(self) -> bool {
        matches!(self, Self::AiTestsOnly)
    }
}

/// Canonical failure classification for retry eligibility decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureClass {
    /// Parse, lint, or static-type failure. Retryable.
    Syntax,
    /// Security policy violation inside the sandbox. Halts immediately.
    Policy,
    /// Wall-clock or budget exhaustion. Halts immediately.
    Timeout,
    /// Non-deterministic failure (divergent outcomes for the same oracle).
    /// Halts immediately and is permanently telemetry-only.
    Flake,
    /// Reproducible logical failure. Retryable.
    Deterministic,
}

impl FailureClass {
    /// Returns `true` if the circuit breaker may schedule another attempt
    /// for this class.
    ///
    /// Only `syntax` and `deterministic` are retryable; everything else
    /// halts at the current attempt.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Syntax | Self::Deterministic)
    }

    /// Returns `true` if the class belongs to the determinism-gate noise
    /// set and must never feed behavioral memory.
    #[must_use]
    pub const fn is_noise(self) -> bool {
        matches!(self, Self::Flake)
    }

    /// Returns `true` for classes that carry candidate signal the memory
    /// system may learn from. Policy and timeout outcomes are enforcement
    /// artifacts, not candidate behavior, and stay telemetry-only.
    #[must_use]
    pub const fn is_behavioral_signal(self) -> bool {
        matches!(self, Self::Syntax | Self::Deterministic)
    }
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Syntax => write!(f, "syntax"),
            Self::Policy => write!(f, "policy"),
            Self::Timeout => write!(f, "timeout"),
            Self::Flake => write!(f, "flake"),
            Self::Deterministic => write!(f, "deterministic"),
        }
    }
}

/// Canonical runtime violation and terminal event names.
///
/// The first seven variants are enforcement events: the runtime kills the
/// sandboxed process the moment one fires and no further commands run.
/// The last three are terminal pipeline faults raised outside the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ViolationEvent {
    /// Outbound network attempt under a deny-all egress policy.
    NetworkAccessViolation,
    /// Write outside the single ephemeral scratch path.
    FilesystemWriteViolation,
    /// Per-command wall time or per-request budget exceeded.
    TimeoutViolation,
    /// Process/thread cap exceeded.
    ProcessLimitViolation,
    /// Memory cap exceeded (runtime OOM kill).
    MemoryLimitViolation,
    /// Combined stdout+stderr cap exceeded.
    OutputLimitViolation,
    /// Syscall denied by the seccomp profile.
    SyscallViolation,
    /// Strict mode was requested but no microVM backend is available.
    StrictModeUnavailable,
    /// Policy mandates strict mode but the request asked for less.
    StrictModeRequired,
    /// The bounded retry budget was exhausted on a retryable class.
    MaxRetriesExceeded,
}

impl ViolationEvent {
    /// Returns `true` for events enforced by the sandbox runtime itself.
    #[must_use]
    pub const fn is_enforcement(self) -> bool {
        !matches!(
            self,
            Self::StrictModeUnavailable | Self::StrictModeRequired | Self::MaxRetriesExceeded
        )
    }

    /// The failure class an enforcement event maps to.
    ///
    /// Timeout maps to `timeout`; every other enforcement event is a
    /// `policy` breach. Terminal pipeline faults carry no class of their
    /// own and return `None`.
    #[must_use]
    pub const fn failure_class(self) -> Option<FailureClass> {
        match self {
            Self::TimeoutViolation => Some(FailureClass::Timeout),
            Self::NetworkAccessViolation
            | Self::FilesystemWriteViolation
            | Self::ProcessLimitViolation
            | Self::MemoryLimitViolation
            | Self::OutputLimitViolation
            | Self::SyscallViolation => Some(FailureClass::Policy),
            Self::StrictModeUnavailable | Self::StrictModeRequired | Self::MaxRetriesExceeded => {
                None
            },
        }
    }

    /// Returns `true` when the event can never lead to another attempt.
    ///
    /// All violation events are non-retryable; this exists so call sites
    /// read as policy rather than as an accident of the enum.
    #[must_use]
    pub const fn halts_retries(self) -> bool {
        true
    }
}

impl std::fmt::Display for ViolationEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::NetworkAccessViolation => "NetworkAccessViolation",
            Self::FilesystemWriteViolation => "FilesystemWriteViolation",
            Self::TimeoutViolation => "TimeoutViolation",
            Self::ProcessLimitViolation => "ProcessLimitViolation",
            Self::MemoryLimitViolation => "MemoryLimitViolation",
            Self::OutputLimitViolation => "OutputLimitViolation",
            Self::SyscallViolation => "SyscallViolation",
            Self::StrictModeUnavailable => "StrictModeUnavailable",
            Self::StrictModeRequired => "StrictModeRequired",
            Self::MaxRetriesExceeded => "MaxRetriesExceeded",
        };
        write!(f, "{name}")
    }
}

// =============================================================================
// Command Plan and Evidence
// =============================================================================

/// The kind of check a command performs. Drives tier assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    /// Syntax/parse check.
    Parse,
    /// Lint pass.
    Lint,
    /// Static type check.
    TypeCheck,
    /// Direct execution of the candidate entrypoint.
    Smoke,
    /// Unit test suite.
    UnitTest,
    /// Integration or end-to-end test suite.
    IntegrationTest,
}

impl CheckKind {
    /// Returns `true` for the static L0 checks (parse/lint/type).
    #[must_use]
    pub const fn is_static(self) -> bool {
        matches!(self, Self::Parse | Self::Lint | Self::TypeCheck)
    }

    /// Returns `true` for test-executing checks.
    #[must_use]
    pub const fn is_test(self) -> bool {
        matches!(self, Self::UnitTest | Self::IntegrationTest)
    }
}

/// Who authored the check a command runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Authorship {
    /// Pre-existing, user-authored.
    User,
    /// Generated by the model for this request. Contributes tier evidence
    /// only as `AI_TESTS_ONLY`.
    Ai,
}

/// A declared command in the verification plan, before execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Stable name used as the flake oracle key across attempts.
    pub name: String,
    /// What the command checks.
    pub kind: CheckKind,
    /// Who authored the check.
    pub authorship: Authorship,
    /// Argument vector executed inside the sandbox.
    pub argv: Vec<String>,
}

impl CommandSpec {
    /// Creates a command spec.
    pub fn new(
        name: impl Into<String>,
        kind: CheckKind,
        authorship: Authorship,
        argv: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            authorship,
            argv: argv.into_iter().map(Into::into).collect(),
        }
    }
}

/// Evidence of one executed command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRecord {
    /// Name from the originating [`CommandSpec`].
    pub name: String,
    /// What the command checked.
    pub kind: CheckKind,
    /// Who authored the check.
    pub authorship: Authorship,
    /// Argument vector that actually ran.
    pub argv: Vec<String>,
    /// Exit code; `-1` when the process was killed by the runtime.
    pub exit_code: i32,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Captured stdout, truncated at the output cap.
    pub stdout_trunc: String,
    /// Captured stderr, truncated at the output cap.
    pub stderr_trunc: String,
}

impl CommandRecord {
    /// Returns `true` when the command exited zero.
    #[must_use]
    pub const fn passed(&self) -> bool {
        self.exit_code == 0
    }
}

/// A check that did not run, with the reason it was skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedCheck {
    /// Name of the skipped check.
    pub name: String,
    /// Why it was skipped (earlier failure, budget exhaustion, mode).
    pub reason: String,
}

impl SkippedCheck {
    /// Creates a skipped-check record.
    pub fn new(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

// =============================================================================
// VerificationResult
// =============================================================================

/// Structural invariant violations in a [`VerificationResult`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ResultInvariantError {
    /// A passing result carried a failure class.
    #[error("passing result must not carry a failure class (got {class})")]
    PassWithFailureClass {
        /// The offending class.
        class: FailureClass,
    },

    /// A passing result carried no tier.
    #[error("passing result must carry a verification tier")]
    PassWithoutTier,

    /// A failing result carried no failure class.
    #[error("failing result must carry a failure class")]
    FailWithoutClass,

    /// Attempt number outside the bounded window.
    #[error("attempt {attempt} outside the bounded window 1..={max}")]
    AttemptOutOfRange {
        /// The offending attempt number.
        attempt: u32,
        /// The hard attempt cap.
        max: u32,
    },
}

/// The canonical verification contract payload produced by the sandbox
/// executor. Structurally complete on every path, including internal
/// executor faults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    /// Originating request id.
    pub request_id: String,
    /// Candidate this run verified.
    pub candidate_id: String,
    /// 1-indexed attempt number.
    pub attempt: u32,
    /// Contract schema version.
    pub schema_version: String,
    /// UTC creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Isolation mode used.
    pub mode: VerificationMode,
    /// Pass or fail.
    pub status: VerificationStatus,
    /// Tier achieved; absent on failing runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<VerificationTier>,
    /// Failure class; absent on passing runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_class: Option<FailureClass>,
    /// Terminal violation event if execution was killed by policy or the
    /// pipeline raised a terminal fault.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminal_event: Option<ViolationEvent>,
    /// Exit code of the last executed (or killed) command; `-1` when the
    /// run never reached execution.
    pub exit_code: i32,
    /// Wall-clock duration of the run in milliseconds.
    pub duration_ms: u64,
    /// Captured stdout of the last command (may be empty).
    pub stdout: String,
    /// Captured stderr of the last command (may be empty).
    pub stderr: String,
    /// Executed-command evidence log, in execution order.
    pub commands: Vec<CommandRecord>,
    /// Paths to durable artifacts (logs, coverage files).
    pub artifacts: Vec<String>,
    /// Checks that did not run, with reasons.
    pub skipped_checks: Vec<SkippedCheck>,
}

impl VerificationResult {
    /// Hard cap on attempts, shared with the circuit breaker.
    pub const MAX_ATTEMPTS: u32 = 3;

    /// Checks the pass/fail structural invariant and the attempt window.
    ///
    /// # Errors
    ///
    /// Returns the first violated invariant.
    pub fn validate(&self) -> Result<(), ResultInvariantError> {
        if self.attempt == 0 || self.attempt > Self::MAX_ATTEMPTS {
            return Err(ResultInvariantError::AttemptOutOfRange {
                attempt: self.attempt,
                max: Self::MAX_ATTEMPTS,
            });
        }
        match self.status {
            VerificationStatus::Pass => {
                if let Some(class) = self.failure_class {
                    return Err(ResultInvariantError::PassWithFailureClass { class });
                }
                if self.tier.is_none() {
                    return Err(ResultInvariantError::PassWithoutTier);
                }
            },
            VerificationStatus::Fail => {
                if self.failure_class.is_none() {
                    return Err(ResultInvariantError::FailWithoutClass);
                }
            },
        }
        Ok(())
    }

    /// Builds a structurally complete failing result for a run that never
    /// reached (or was killed before finishing) command execution.
    ///
    /// Used for backend probe failures, strict-mode faults, and internal
    /// executor errors. The caller picks the failure class: `policy` for
    /// isolation faults, `deterministic` for internal errors.
    #[must_use]
    pub fn failure(
        request_id: impl Into<String>,
        candidate_id: impl Into<String>,
        attempt: u32,
        mode: VerificationMode,
        failure_class: FailureClass,
        terminal_event: Option<ViolationEvent>,
        stderr: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            candidate_id: candidate_id.into(),
            attempt,
            schema_version: SCHEMA_VERSION.to_string(),
            created_at: Utc::now(),
            mode,
            status: VerificationStatus::Fail,
            tier: None,
            failure_class: Some(failure_class),
            terminal_event,
            exit_code: -1,
            duration_ms,
            stdout: String::new(),
            stderr: stderr.into(),
            commands: Vec::new(),
            artifacts: Vec::new(),
            skipped_checks: Vec::new(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn passing_result() -> VerificationResult {
        VerificationResult {
            request_id: "req-1".to_string(),
            candidate_id: "cand-1".to_string(),
            attempt: 1,
            schema_version: SCHEMA_VERSION.to_string(),
            created_at: Utc::now(),
            mode: VerificationMode::Balanced,
            status: VerificationStatus::Pass,
            tier: Some(VerificationTier::L1),
            failure_class: None,
            terminal_event: None,
            exit_code: 0,
            duration_ms: 120,
            stdout: "ok".to_string(),
            stderr: String::new(),
            commands: Vec::new(),
            artifacts: Vec::new(),
            skipped_checks: Vec::new(),
        }
    }

    #[test]
    fn pass_requires_tier_and_no_class() {
        let result = passing_result();
        assert!(result.validate().is_ok());

        let mut broken = result.clone();
        broken.failure_class = Some(FailureClass::Syntax);
        assert!(matches!(
            broken.validate(),
            Err(ResultInvariantError::PassWithFailureClass { .. })
        ));

        let mut broken = result;
        broken.tier = None;
        assert_eq!(broken.validate(), Err(ResultInvariantError::PassWithoutTier));
    }

    #[test]
    fn fail_requires_class() {
        let mut result = passing_result();
        result.status = VerificationStatus::Fail;
        result.tier = None;
        assert_eq!(result.validate(), Err(ResultInvariantError::FailWithoutClass));

        result.failure_class = Some(FailureClass::Deterministic);
        assert!(result.validate().is_ok());
    }

    #[test]
    fn attempt_window_is_bounded() {
        let mut result = passing_result();
        result.attempt = 0;
        assert!(matches!(
            result.validate(),
            Err(ResultInvariantError::AttemptOutOfRange { .. })
        ));
        result.attempt = 4;
        assert!(matches!(
            result.validate(),
            Err(ResultInvariantError::AttemptOutOfRange { .. })
        ));
    }

    #[test]
    fn retryability_is_limited_to_syntax_and_deterministic() {
        assert!(FailureClass::Syntax.is_retryable());
        assert!(FailureClass::Deterministic.is_retryable());
        assert!(!FailureClass::Policy.is_retryable());
        assert!(!FailureClass::Timeout.is_retryable());
        assert!(!FailureClass::Flake.is_retryable());
    }

    #[test]
    fn enforcement_events_map_to_classes() {
        assert_eq!(
            ViolationEvent::NetworkAccessViolation.failure_class(),
            Some(FailureClass::Policy)
        );
        assert_eq!(
            ViolationEvent::TimeoutViolation.failure_class(),
            Some(FailureClass::Timeout)
        );
        assert_eq!(ViolationEvent::StrictModeUnavailable.failure_class(), None);
        assert!(!ViolationEvent::MaxRetriesExceeded.is_enforcement());
        assert!(ViolationEvent::SyscallViolation.is_enforcement());
    }

    #[test]
    fn wire_casing_matches_contract() {
        assert_eq!(
            serde_json::to_string(&VerificationTier::AiTestsOnly).unwrap(),
            "\"AI_TESTS_ONLY\""
        );
        assert_eq!(serde_json::to_string(&VerificationTier::L2).unwrap(), "\"L2\"");
        assert_eq!(
            serde_json::to_string(&FailureClass::Deterministic).unwrap(),
            "\"deterministic\""
        );
        assert_eq!(
            serde_json::to_string(&ViolationEvent::NetworkAccessViolation).unwrap(),
            "\"NetworkAccessViolation\""
        );
        assert_eq!(
            serde_json::to_string(&VerificationMode::Balanced).unwrap(),
            "\"balanced\""
        );
    }

    #[test]
    fn result_serde_roundtrip() {
        let result = passing_result();
        let json = serde_json::to_string(&result).unwrap();
        let recovered: VerificationResult = serde_json::from_str(&json).unwrap();
        assert_eq!(result, recovered);
    }
}
