//! Failure classifier: raw sandbox signals to canonical failure classes.
//!
//! Classification is deterministic and based only on known runtime
//! signals, error strings, and the recorded outcome history of this
//! request's attempt window. Rules are evaluated top-to-bottom, first
//! match wins:
//!
//! 1. Enforcement violation (network, filesystem, syscall, process,
//!    memory, output cap) → `policy`
//! 2. Timeout violation → `timeout`
//! 3. Parse/lint/static-type failure → `syntax`
//! 4. Test failure with divergent outcomes for the same oracle across the
//!    attempt window, or an explicit flake annotation → `flake`
//! 5. Any other non-passing outcome → `deterministic`
//!
//! A misclassified failure poisons behavioral memory downstream, so every
//! rule here is covered by a dedicated test.

use std::collections::HashMap;

use super::result::{CommandRecord, FailureClass, ViolationEvent};

// =============================================================================
// Signal Tables
// =============================================================================

/// Substrings that indicate a denied outbound network attempt.
const NETWORK_SIGNALS: &[&str] = &[
    "network is unreachable",
    "name or service not known",
    "connection refused",
    "socket.gaierror",
    "errno 101",
    "errno 111",
    "[errno 110]",
];

/// Substrings that indicate a write against the read-only mounts.
const FILESYSTEM_SIGNALS: &[&str] = &["read-only file system", "[errno 30]", "erofs"];

/// Substrings that indicate the pids cap was hit.
const PROCESS_LIMIT_SIGNALS: &[&str] = &[
    "resource temporarily unavailable",
    "can't start new thread",
    "cannot allocate memory",
    "fork: retry",
    "pids limit",
];

/// Substrings that indicate a syscall denied by the seccomp profile.
const SYSCALL_SIGNALS: &[&str] = &[
    "seccomp",
    "operation not permitted",
    "permission denied",
    "bad system call",
];

/// Substrings that mark a test as a known flake.
const FLAKE_ANNOTATIONS: &[&str] = &["[flaky]", "@flaky", "flaky test"];

/// Exit code the runtime reports for an OOM kill (SIGKILL).
const OOM_EXIT_CODE: i32 = 137;

/// Classifies the raw signals of a single killed or failed command into a
/// runtime violation event, if any known signal matches.
///
/// Returns `None` for ordinary command failures (test assertion failures,
/// compile errors) that are not isolation breaches.
#[must_use]
pub fn sniff_violation(exit_code: i32, stdout: &str, stderr: &str) -> Option<ViolationEvent> {
    let combined = format!("{}{}", stderr.to_lowercase(), stdout.to_lowercase());

    if NETWORK_SIGNALS.iter().any(|sig| combined.contains(sig)) {
        return Some(ViolationEvent::NetworkAccessViolation);
    }
    if FILESYSTEM_SIGNALS.iter().any(|sig| combined.contains(sig)) {
        return Some(ViolationEvent::FilesystemWriteViolation);
    }
    if PROCESS_LIMIT_SIGNALS.iter().any(|sig| combined.contains(sig)) {
        return Some(ViolationEvent::ProcessLimitViolation);
    }
    if SYSCALL_SIGNALS.iter().any(|sig| combined.contains(sig)) {
        return Some(ViolationEvent::SyscallViolation);
    }
    // SIGKILL with empty or kill-marked output is the runtime OOM reaper.
    if exit_code == OOM_EXIT_CODE
        && (combined.contains("killed") || combined.contains("out of memory") || stderr.trim().is_empty())
    {
        return Some(ViolationEvent::MemoryLimitViolation);
    }

    None
}

// =============================================================================
// Attempt History (flake oracle)
// =============================================================================

/// Per-request record of command outcomes across the attempt window.
///
/// The flake oracle: a failing test command is a flake iff the same
/// command name produced at least one passing and one failing outcome
/// within this window. The window is exactly the bounded retry budget;
/// no cross-request sampling is performed.
#[derive(Debug, Clone, Default)]
pub struct AttemptHistory {
    outcomes: HashMap<String, Vec<bool>>,
}

impl AttemptHistory {
    /// Creates an empty history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the outcomes of one attempt's executed commands.
    pub fn record_attempt(&mut self, commands: &[CommandRecord]) {
        for command in commands {
            self.outcomes
                .entry(command.name.clone())
                .or_default()
                .push(command.passed());
        }
    }

    /// Returns `true` when the named command produced divergent outcomes
    /// across the recorded window.
    #[must_use]
    pub fn diverged(&self, name: &str) -> bool {
        self.outcomes.get(name).is_some_and(|results| {
            results.iter().any(|passed| *passed) && results.iter().any(|passed| !*passed)
        })
    }

    /// Number of recorded outcomes for a command name.
    #[must_use]
    pub fn observations(&self, name: &str) -> usize {
        self.outcomes.get(name).map_or(0, Vec::len)
    }
}

// =============================================================================
// Run Classification
// =============================================================================

/// The classifier's verdict for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    /// Enforcement event that terminated the run, if any.
    pub violation: Option<ViolationEvent>,
    /// Canonical failure class; `None` for a clean pass.
    pub failure_class: Option<FailureClass>,
}

impl Classification {
    /// A clean pass.
    #[must_use]
    pub const fn pass() -> Self {
        Self {
            violation: None,
            failure_class: None,
        }
    }

    /// Returns `true` for a clean pass.
    #[must_use]
    pub const fn is_pass(&self) -> bool {
        self.failure_class.is_none() && self.violation.is_none()
    }
}

/// Classifies a completed run.
///
/// `timed_out` is set by the executor when the per-command clock or the
/// per-request budget expired; `output_capped` when the combined log cap
/// was breached. `history` must already include this attempt's outcomes.
#[must_use]
pub fn classify_run(
    commands: &[CommandRecord],
    timed_out: bool,
    output_capped: bool,
    history: &AttemptHistory,
) -> Classification {
    // Rule 1: enforcement violations are policy breaches.
    if output_capped {
        return Classification {
            violation: Some(ViolationEvent::OutputLimitViolation),
            failure_class: Some(FailureClass::Policy),
        };
    }
    for command in commands.iter().filter(|c| !c.passed()) {
        if let Some(violation) =
            sniff_violation(command.exit_code, &command.stdout_trunc, &command.stderr_trunc)
        {
            return Classification {
                violation: Some(violation),
                failure_class: violation.failure_class(),
            };
        }
    }

    // Rule 2: timeouts.
    if timed_out {
        return Classification {
            violation: Some(ViolationEvent::TimeoutViolation),
            failure_class: Some(FailureClass::Timeout),
        };
    }

    let Some(first_failed) = commands.iter().find(|c| !c.passed()) else {
        return Classification::pass();
    };

    // Rule 3: static-check failures are syntax class.
    if first_failed.kind.is_static() {
        return Classification {
            violation: None,
            failure_class: Some(FailureClass::Syntax),
        };
    }

    // Rule 4: flake oracle — divergence within the window or annotation.
    if first_failed.kind.is_test() {
        let annotated = FLAKE_ANNOTATIONS.iter().any(|marker| {
            first_failed.stderr_trunc.to_lowercase().contains(marker)
                || first_failed.stdout_trunc.to_lowercase().contains(marker)
        });
        if annotated || history.diverged(&first_failed.name) {
            return Classification {
                violation: None,
                failure_class: Some(FailureClass::Flake),
            };
        }
    }

    // Rule 5: everything else is a reproducible deterministic failure.
    Classification {
        violation: None,
        failure_class: Some(FailureClass::Deterministic),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verification::result::{Authorship, CheckKind};

    fn command(name: &str, kind: CheckKind, exit_code: i32, stderr: &str) -> CommandRecord {
        CommandRecord {
            name: name.to_string(),
            kind,
            authorship: Authorship::User,
            argv: vec!["true".to_string()],
            exit_code,
            duration_ms: 10,
            stdout_trunc: String::new(),
            stderr_trunc: stderr.to_string(),
        }
    }

    // -------------------------------------------------------------------------
    // Violation sniffing
    // -------------------------------------------------------------------------

    #[test]
    fn sniffs_network_violation() {
        let violation = sniff_violation(1, "", "ConnectionRefusedError: [Errno 111] connection refused");
        assert_eq!(violation, Some(ViolationEvent::NetworkAccessViolation));
    }

    #[test]
    fn sniffs_filesystem_violation() {
        let violation = sniff_violation(1, "", "OSError: [Errno 30] Read-only file system: '/source/x'");
        assert_eq!(violation, Some(ViolationEvent::FilesystemWriteViolation));
    }

    #[test]
    fn sniffs_process_limit_violation() {
        let violation = sniff_violation(1, "", "RuntimeError: can't start new thread");
        assert_eq!(violation, Some(ViolationEvent::ProcessLimitViolation));
    }

    #[test]
    fn sniffs_syscall_violation() {
        let violation = sniff_violation(1, "", "Bad system call (core dumped)");
        assert_eq!(violation, Some(ViolationEvent::SyscallViolation));
    }

    #[test]
    fn sniffs_oom_kill_with_empty_stderr() {
        assert_eq!(
            sniff_violation(137, "", ""),
            Some(ViolationEvent::MemoryLimitViolation)
        );
    }

    #[test]
    fn plain_assertion_failure_is_not_a_violation() {
        assert_eq!(sniff_violation(1, "", "AssertionError: 2 != 3"), None);
    }

    // -------------------------------------------------------------------------
    // Rule ordering
    // -------------------------------------------------------------------------

    #[test]
    fn clean_pass_classifies_as_pass() {
        let commands = vec![command("parse", CheckKind::Parse, 0, "")];
        let verdict = classify_run(&commands, false, false, &AttemptHistory::new());
        assert!(verdict.is_pass());
    }

    #[test]
    fn policy_violation_takes_precedence_over_syntax() {
        let commands = vec![command(
            "parse",
            CheckKind::Parse,
            1,
            "socket.gaierror: Name or service not known",
        )];
        let verdict = classify_run(&commands, false, false, &AttemptHistory::new());
        assert_eq!(verdict.failure_class, Some(FailureClass::Policy));
        assert_eq!(verdict.violation, Some(ViolationEvent::NetworkAccessViolation));
    }

    #[test]
    fn output_cap_breach_is_policy() {
        let commands = vec![command("unit", CheckKind::UnitTest, 0, "")];
        let verdict = classify_run(&commands, false, true, &AttemptHistory::new());
        assert_eq!(verdict.violation, Some(ViolationEvent::OutputLimitViolation));
        assert_eq!(verdict.failure_class, Some(FailureClass::Policy));
    }

    #[test]
    fn timeout_classifies_as_timeout() {
        let commands = vec![command("unit", CheckKind::UnitTest, -1, "")];
        let verdict = classify_run(&commands, true, false, &AttemptHistory::new());
        assert_eq!(verdict.violation, Some(ViolationEvent::TimeoutViolation));
        assert_eq!(verdict.failure_class, Some(FailureClass::Timeout));
    }

    #[test]
    fn static_check_failure_is_syntax() {
        let commands = vec![command(
            "parse",
            CheckKind::Parse,
            1,
            "SyntaxError: invalid syntax (candidate.py, line 3)",
        )];
        let verdict = classify_run(&commands, false, false, &AttemptHistory::new());
        assert_eq!(verdict.failure_class, Some(FailureClass::Syntax));
        assert_eq!(verdict.violation, None);
    }

    #[test]
    fn divergent_test_outcome_is_flake() {
        let pass = command("unit", CheckKind::UnitTest, 0, "");
        let fail = command("unit", CheckKind::UnitTest, 1, "AssertionError");

        let mut history = AttemptHistory::new();
        history.record_attempt(std::slice::from_ref(&pass));
        history.record_attempt(std::slice::from_ref(&fail));

        let verdict = classify_run(std::slice::from_ref(&fail), false, false, &history);
        assert_eq!(verdict.failure_class, Some(FailureClass::Flake));
    }

    #[test]
    fn annotated_flake_is_flake_without_divergence() {
        let fail = command("unit", CheckKind::UnitTest, 1, "marked [flaky] upstream");
        let mut history = AttemptHistory::new();
        history.record_attempt(std::slice::from_ref(&fail));

        let verdict = classify_run(std::slice::from_ref(&fail), false, false, &history);
        assert_eq!(verdict.failure_class, Some(FailureClass::Flake));
    }

    #[test]
    fn consistent_test_failure_is_deterministic() {
        let fail = command("unit", CheckKind::UnitTest, 1, "AssertionError: 2 != 3");
        let mut history = AttemptHistory::new();
        history.record_attempt(std::slice::from_ref(&fail));
        history.record_attempt(std::slice::from_ref(&fail));

        let verdict = classify_run(std::slice::from_ref(&fail), false, false, &history);
        assert_eq!(verdict.failure_class, Some(FailureClass::Deterministic));
    }

    #[test]
    fn history_divergence_requires_both_outcomes() {
        let fail = command("unit", CheckKind::UnitTest, 1, "");
        let mut history = AttemptHistory::new();
        history.record_attempt(std::slice::from_ref(&fail));
        assert!(!history.diverged("unit"));
        assert_eq!(history.observations("unit"), 1);

        let pass = command("unit", CheckKind::UnitTest, 0, "");
        history.record_attempt(std::slice::from_ref(&pass));
        assert!(history.diverged("unit"));
    }
}
