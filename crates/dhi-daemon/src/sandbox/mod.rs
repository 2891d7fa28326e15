//! Sandbox execution: isolation backends, staging, the command plan, and
//! the executor itself.
//!
//! The executor is the only component in the system permitted to issue
//! execution. Everything it runs is confined by the mode's isolation
//! profile: deny-all egress, read-only source, a single size-capped
//! scratch mount, and hard resource caps enforced by the runtime.

pub mod backend;
pub mod executor;
pub mod plan;
pub mod workspace;

use std::future::Future;
use std::time::Duration;

use dhi_core::envelope::Candidate;
use dhi_core::verification::{
    AttemptHistory, CommandSpec, SkippedCheck, VerificationMode, VerificationResult,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub use backend::{BackendError, BackendKind, SandboxBackend};
pub use executor::SandboxExecutor;
pub use plan::{PlanConfig, build_plan};
pub use workspace::{ArtifactDir, StagedWorkspace};

/// The per-request verification budget clock.
///
/// The deadline spans attempts: every attempt of one request charges the
/// same budget, and exhaustion mid-attempt terminates that attempt with a
/// timeout violation.
#[derive(Debug, Clone, Copy)]
pub struct RequestBudget {
    deadline: Instant,
}

impl RequestBudget {
    /// Starts the budget clock now.
    #[must_use]
    pub fn new(budget: Duration) -> Self {
        Self {
            deadline: Instant::now() + budget,
        }
    }

    /// Time remaining before exhaustion; zero once spent.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// One unit of sandbox work handed to a verifier.
#[derive(Debug)]
pub struct VerifyTask<'a> {
    /// Originating request id.
    pub request_id: &'a str,
    /// The candidate to verify.
    pub candidate: &'a Candidate,
    /// 1-indexed attempt number.
    pub attempt: u32,
    /// Isolation mode.
    pub mode: VerificationMode,
    /// Declared command plan.
    pub plan: &'a [CommandSpec],
    /// Checks already dropped before execution (fast mode).
    pub pre_skipped: &'a [SkippedCheck],
    /// Outcome history of prior attempts (flake oracle window).
    pub history: &'a AttemptHistory,
    /// Shared per-request budget clock.
    pub budget: &'a RequestBudget,
    /// Cancellation signal for this request.
    pub cancel: &'a CancellationToken,
}

/// Anything that can verify a candidate and produce a complete result.
///
/// The production implementation is [`SandboxExecutor`]; tests substitute
/// scripted verifiers to drive the circuit breaker deterministically.
pub trait Verifier: Send + Sync {
    /// Verifies one candidate. Must always resolve to a structurally
    /// complete [`VerificationResult`]; faults are folded in, not thrown.
    fn verify(&self, task: VerifyTask<'_>) -> impl Future<Output = VerificationResult> + Send;
}

impl Verifier for SandboxExecutor {
    fn verify(&self, task: VerifyTask<'_>) -> impl Future<Output = VerificationResult> + Send {
        self.execute(task)
    }
}
