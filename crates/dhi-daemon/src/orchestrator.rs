//! Circuit breaker: the bounded retry loop driving the proof pipeline.
//!
//! The orchestrator owns the per-request state machine:
//!
//! ```text
//! received → context_ready → candidate_generated → verification_running
//!   ├─ pass → verification_passed → attested → completed
//!   └─ fail → (retryable ∧ attempt < 3) → candidate_generated  [repair prompt]
//!           → (otherwise) → halted → attested → completed
//! ```
//!
//! At most [`MAX_ATTEMPTS`] attempts run per request. Attempts 2-3 are
//! repair generations: the model receives a deterministic prompt
//! embedding the prior failure class and a bounded slice of the captured
//! output. The loop halts immediately on a pass, a non-retryable failure
//! class, a terminal violation event, cancellation, or budget exhaustion.
//!
//! Every state edge emits structured transition telemetry tagged by
//! `request_id`. The manifest is built exactly once, at terminal state,
//! and the ledger gate runs after manifest assembly: telemetry always,
//! behavioral only behind the determinism gate.

use chrono::{DateTime, Utc};
use dhi_core::envelope::{Candidate, ContextPayload};
use dhi_core::extraction::extract_candidate;
use dhi_core::fingerprint::EnvironmentFingerprint;
use dhi_core::gate::{DeterminismGate, InfraNoise};
use dhi_core::governance::{self, GovernanceAuditRecord};
use dhi_core::ledger::{LedgerEvent, PersistenceClass, SignalType};
use dhi_core::llm::LlmConfig;
use dhi_core::manifest::{AttestationManifest, FinalStatus, build_manifest};
use dhi_core::prompts::build_repair_prompt;
use dhi_core::retry::{self, MAX_ATTEMPTS};
use dhi_core::verification::{
    AttemptHistory, ResourceLimits, VerificationMode, VerificationResult, VerificationStatus,
    ViolationEvent,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::gateway::CandidateGenerator;
use crate::ledger::LedgerHandle;
use crate::manifest_store::{ManifestStore, ManifestStoreError};
use crate::sandbox::plan::PlanConfig;
use crate::sandbox::{RequestBudget, Verifier, VerifyTask, build_plan};

// =============================================================================
// Request State Machine
// =============================================================================

/// Observable states of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    /// Envelope accepted.
    Received,
    /// Governance ran; the outbound context is ready.
    ContextReady,
    /// The gateway produced a candidate.
    CandidateGenerated,
    /// The sandbox is executing the plan.
    VerificationRunning,
    /// The terminal run passed.
    VerificationPassed,
    /// The loop halted on a non-retryable outcome.
    Halted,
    /// The manifest was assembled.
    Attested,
    /// Terminal.
    Completed,
}

impl std::fmt::Display for RequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Received => "received",
            Self::ContextReady => "context_ready",
            Self::CandidateGenerated => "candidate_generated",
            Self::VerificationRunning => "verification_running",
            Self::VerificationPassed => "verification_passed",
            Self::Halted => "halted",
            Self::Attested => "attested",
            Self::Completed => "completed",
        };
        write!(f, "{name}")
    }
}

/// Per-request transition tracker emitting structured telemetry per edge.
#[derive(Debug)]
struct StateTracker {
    request_id: String,
    current: RequestState,
}

impl StateTracker {
    fn new(request_id: &str) -> Self {
        info!(
            target: "dhi::state",
            request_id = %request_id,
            state = %RequestState::Received,
            "request state"
        );
        Self {
            request_id: request_id.to_string(),
            current: RequestState::Received,
        }
    }

    fn to(&mut self, next: RequestState) {
        info!(
            target: "dhi::state",
            request_id = %self.request_id,
            from = %self.current,
            to = %next,
            "request state transition"
        );
        self.current = next;
    }
}

// =============================================================================
// Records
// =============================================================================

/// Snapshot of a single generation-and-verification attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-indexed attempt number.
    pub attempt: u32,
    /// Whether a candidate was extracted from the gateway output.
    pub extraction_success: bool,
    /// Extraction or gateway failure detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extraction_error: Option<String>,
    /// Verification result, when the sandbox ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationResult>,
    /// UTC timestamp of the attempt.
    pub created_at: DateTime<Utc>,
}

impl AttemptRecord {
    fn extraction_failure(attempt: u32, error: impl Into<String>) -> Self {
        Self {
            attempt,
            extraction_success: false,
            extraction_error: Some(error.into()),
            verification: None,
            created_at: Utc::now(),
        }
    }

    fn verified(attempt: u32, result: VerificationResult) -> Self {
        Self {
            attempt,
            extraction_success: true,
            extraction_error: None,
            verification: Some(result),
            created_at: Utc::now(),
        }
    }
}

/// Aggregated outcome of the complete circuit breaker loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationOutcome {
    /// Originating request id.
    pub request_id: String,
    /// How many attempts were made.
    pub attempt_count: u32,
    /// Retries consumed: `attempt_count - 1` (zero when no attempt ran).
    pub retry_count: u32,
    /// Terminal status.
    pub final_status: FinalStatus,
    /// Terminal violation event, when one halted the request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminal_event: Option<ViolationEvent>,
    /// Full history of all attempts made.
    pub attempts: Vec<AttemptRecord>,
    /// The attestation manifest, when verification ran at all.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest: Option<AttestationManifest>,
    /// False when the run completed but the ledger write failed
    /// ("verified locally, ledger not updated").
    pub ledger_updated: bool,
    /// Governance audit of the last attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit: Option<GovernanceAuditRecord>,
}

/// Inputs to one orchestration run.
#[derive(Debug, Clone)]
pub struct OrchestrateParams {
    /// Request id.
    pub request_id: String,
    /// Context file paths.
    pub files: Vec<String>,
    /// Prompt plus context content.
    pub content: String,
    /// Isolation mode.
    pub mode: VerificationMode,
    /// Gateway configuration for this request.
    pub llm: LlmConfig,
}

// =============================================================================
// Orchestrator
// =============================================================================

/// The circuit breaker, borrowing its collaborators per request.
///
/// The request handler owns its pipeline: no cross-request globals and
/// no request-scoped singletons. Cancelling the handler's task stops the
/// whole pipeline, sandbox included.
#[derive(Debug, Clone, Copy)]
pub struct Orchestrator<'a, G, V> {
    /// Candidate generation collaborator.
    pub gateway: &'a G,
    /// The only component permitted to issue execution.
    pub verifier: &'a V,
    /// Single-writer ledger handle.
    pub ledger: &'a LedgerHandle,
    /// Append-only manifest store.
    pub manifests: &'a ManifestStore,
    /// Determinism gate bound to the project baseline.
    pub gate: &'a DeterminismGate,
    /// Startup-computed fingerprint; the plan hash is filled per request.
    pub fingerprint_template: &'a EnvironmentFingerprint,
    /// Project test suite configuration feeding the plan builder.
    pub plan_config: &'a PlanConfig,
}

impl<G: CandidateGenerator, V: Verifier> Orchestrator<'_, G, V> {
    /// Runs the bounded retry loop for one request.
    pub async fn run(
        &self,
        params: OrchestrateParams,
        cancel: &CancellationToken,
    ) -> OrchestrationOutcome {
        let request_id = params.request_id.clone();
        let mut tracker = StateTracker::new(&request_id);

        let original_content = params.content.clone();
        let mut content = params.content;
        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut history = AttemptHistory::new();
        let mut last_verification: Option<VerificationResult> = None;
        let mut audit: Option<GovernanceAuditRecord> = None;
        let mut terminal_event: Option<ViolationEvent> = None;
        let mut infra_noise: Option<InfraNoise> = None;
        let mut passed = false;

        let (plan, pre_skipped) = build_plan(params.mode, self.plan_config);
        let expected_plan_hash = EnvironmentFingerprint::hash_command_set(&plan);
        let budget = RequestBudget::new(ResourceLimits::for_mode(params.mode).request_budget);

        for attempt in 1..=MAX_ATTEMPTS {
            if cancel.is_cancelled() {
                break;
            }

            info!(
                request_id = %request_id,
                attempt,
                max_attempts = MAX_ATTEMPTS,
                "starting attempt"
            );

            let payload = ContextPayload::new(
                request_id.clone(),
                attempt,
                params.files.clone(),
                content.clone(),
            );
            let (safe_payload, attempt_audit) = governance::run(&payload);
            let blocked = attempt_audit.blocked;
            let block_reason = attempt_audit.block_reason.clone();
            audit = Some(attempt_audit);
            if attempt == 1 {
                tracker.to(RequestState::ContextReady);
            }
            if blocked {
                let reason = block_reason.unwrap_or_else(|| "governance policy block".to_string());
                attempts.push(AttemptRecord::extraction_failure(
                    attempt,
                    format!("Blocked by governance: {reason}"),
                ));
                tracker.to(RequestState::Halted);
                break;
            }

            // Cancellation aborts the outstanding external call: dropping
            // the generate future tears the connection down.
            let generated = tokio::select! {
                () = cancel.cancelled() => break,
                result = self.gateway.generate(&safe_payload, &params.llm) => result,
            };
            let raw = match generated {
                Ok(raw) => raw,
                Err(err) => {
                    if err.is_transient() {
                        infra_noise = Some(InfraNoise::ProviderOutage);
                    }
                    warn!(request_id = %request_id, attempt, error = %err, "gateway failed");
                    attempts.push(AttemptRecord::extraction_failure(attempt, err.to_string()));
                    tracker.to(RequestState::Halted);
                    break;
                },
            };

            let extraction = extract_candidate(&raw);
            if !extraction.success {
                let reason = extraction
                    .error
                    .unwrap_or_else(|| "candidate extraction failed".to_string());
                warn!(request_id = %request_id, attempt, error = %reason, "extraction failed");
                attempts.push(AttemptRecord::extraction_failure(attempt, reason));
                tracker.to(RequestState::Halted);
                break;
            }
            let mut candidate = Candidate::new(extraction.code, extraction.notes);
            candidate.expected_checks = plan.iter().map(|spec| spec.name.clone()).collect();
            tracker.to(RequestState::CandidateGenerated);

            tracker.to(RequestState::VerificationRunning);
            let result = self
                .verifier
                .verify(VerifyTask {
                    request_id: &request_id,
                    candidate: &candidate,
                    attempt,
                    mode: params.mode,
                    plan: &plan,
                    pre_skipped: &pre_skipped,
                    history: &history,
                    budget: &budget,
                    cancel,
                })
                .await;
            history.record_attempt(&result.commands);
            last_verification = Some(result.clone());
            attempts.push(AttemptRecord::verified(attempt, result.clone()));

            if cancel.is_cancelled() {
                break;
            }

            if result.status == VerificationStatus::Pass {
                info!(request_id = %request_id, attempt, "verification passed");
                tracker.to(RequestState::VerificationPassed);
                passed = true;
                break;
            }

            let decision = retry::decide(&result, attempt);
            info!(
                request_id = %request_id,
                attempt,
                failure_class = ?result.failure_class,
                retry = decision.should_retry,
                reason = %decision.reason,
                "attempt failed"
            );
            if !decision.should_retry {
                terminal_event = retry::terminal_event_for_halt(&result, attempt);
                tracker.to(RequestState::Halted);
                break;
            }

            content = build_repair_prompt(&original_content, &result);
        }

        let cancelled = cancel.is_cancelled();
        let attempt_count = u32::try_from(attempts.len()).unwrap_or(u32::MAX);
        let retry_count = attempt_count.saturating_sub(1);

        // Manifest: built once at terminal state, immutable after emission.
        let final_status = if cancelled {
            FinalStatus::Cancelled
        } else if passed {
            FinalStatus::Verified
        } else {
            FinalStatus::Failed
        };
        let manifest = last_verification.as_ref().map(|result| {
            let mut manifest =
                build_manifest(result, attempt_count, retry_count, terminal_event, final_status);
            if manifest.final_status == FinalStatus::Verified {
                if let Err(err) = manifest.assert_complete() {
                    // Never emit a verified label from an incomplete manifest.
                    error!(request_id = %request_id, error = %err, "manifest incomplete, downgrading");
                    manifest.final_status = FinalStatus::Failed;
                }
            }
            manifest
        });
        if let Some(manifest) = &manifest {
            tracker.to(RequestState::Attested);
            match self.manifests.store(manifest) {
                Ok(path) => {
                    info!(request_id = %request_id, path = %path.display(), "manifest stored");
                },
                Err(ManifestStoreError::AlreadyExists { .. }) => {
                    warn!(request_id = %request_id, "manifest already emitted for this request");
                },
                Err(err) => {
                    error!(request_id = %request_id, error = %err, "manifest store failure");
                },
            }
        }
        let final_status = manifest
            .as_ref()
            .map_or(final_status, |manifest| manifest.final_status);

        // Ledger gate: telemetry always; behavioral only behind the gate.
        let ledger_updated = self
            .write_ledger(
                &request_id,
                &expected_plan_hash,
                last_verification.as_ref(),
                infra_noise,
                cancelled,
                final_status,
                attempt_count.max(1),
            )
            .await;

        tracker.to(RequestState::Completed);

        OrchestrationOutcome {
            request_id,
            attempt_count,
            retry_count,
            final_status,
            terminal_event,
            attempts,
            manifest,
            ledger_updated,
            audit,
        }
    }

    /// Writes the ledger records for a terminal state. Returns `false`
    /// when any write failed (the run is then "verified locally, ledger
    /// not updated" and an operator alert is raised).
    async fn write_ledger(
        &self,
        request_id: &str,
        expected_plan_hash: &str,
        last_verification: Option<&VerificationResult>,
        infra_noise: Option<InfraNoise>,
        cancelled: bool,
        final_status: FinalStatus,
        attempt_count: u32,
    ) -> bool {
        let mut current = self.fingerprint_template.clone();
        current.command_set_hash = expected_plan_hash.to_string();
        let fingerprint_hash = current.fingerprint_hash();

        let failure_class = last_verification.and_then(|r| r.failure_class);
        let signal = if final_status == FinalStatus::Verified {
            SignalType::Success
        } else {
            SignalType::Failure
        };

        let decision = self
            .gate
            .evaluate(&current, expected_plan_hash, failure_class, infra_noise);
        // Cancellation is always telemetry-only, whatever the gate says.
        let reproducible = decision.reproducible && !cancelled && last_verification.is_some();
        let summary = if cancelled {
            "cancelled".to_string()
        } else {
            decision.reason.clone()
        };

        let mut updated = true;
        let telemetry = LedgerEvent::new(
            request_id,
            fingerprint_hash.clone(),
            reproducible,
            PersistenceClass::Telemetry,
            signal,
            failure_class,
            attempt_count,
            summary.clone(),
        );
        if let Err(err) = self.ledger.record(telemetry).await {
            error!(
                request_id = %request_id,
                error = %err,
                "ledger not updated; run outcome holds locally only"
            );
            updated = false;
        }

        if reproducible {
            let behavioral = LedgerEvent::new(
                request_id,
                fingerprint_hash,
                true,
                PersistenceClass::Behavioral,
                signal,
                failure_class,
                attempt_count,
                summary,
            );
            if let Err(err) = self.ledger.record(behavioral).await {
                error!(
                    request_id = %request_id,
                    error = %err,
                    "behavioral ledger write failed; memory not updated"
                );
                updated = false;
            }
        }

        updated
    }
}

// =============================================================================
// Single-pass interception
// =============================================================================

/// Combined response for governance, extraction, and one sandbox pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterceptOutcome {
    /// Originating request id.
    pub request_id: String,
    /// Governance audit of this pass.
    pub audit: GovernanceAuditRecord,
    /// Model notes surfaced to the caller.
    pub llm_notes: String,
    /// Whether a candidate was extracted.
    pub extraction_success: bool,
    /// Why extraction failed, when it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extraction_error: Option<String>,
    /// Verification result, when the sandbox ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification_result: Option<VerificationResult>,
}

/// Runs governance, cloud generation, extraction, and one sandbox pass —
/// no retry loop.
pub async fn intercept<G: CandidateGenerator, V: Verifier>(
    gateway: &G,
    verifier: &V,
    plan_config: &PlanConfig,
    params: OrchestrateParams,
    attempt: u32,
    cancel: &CancellationToken,
) -> InterceptOutcome {
    let request_id = params.request_id.clone();
    let payload = ContextPayload::new(request_id.clone(), attempt, params.files, params.content);
    let (safe_payload, audit) = governance::run(&payload);

    if audit.blocked {
        let reason = audit
            .block_reason
            .clone()
            .unwrap_or_else(|| "governance policy block".to_string());
        return InterceptOutcome {
            request_id,
            audit,
            llm_notes: String::new(),
            extraction_success: false,
            extraction_error: Some(format!("Blocked by governance: {reason}")),
            verification_result: None,
        };
    }

    let raw = match gateway.generate(&safe_payload, &params.llm).await {
        Ok(raw) => raw,
        Err(err) => {
            return InterceptOutcome {
                request_id,
                audit,
                llm_notes: String::new(),
                extraction_success: false,
                extraction_error: Some(err.to_string()),
                verification_result: None,
            };
        },
    };

    let extraction = extract_candidate(&raw);
    if !extraction.success {
        return InterceptOutcome {
            request_id,
            audit,
            llm_notes: extraction.notes,
            extraction_success: false,
            extraction_error: extraction.error,
            verification_result: None,
        };
    }

    let candidate = Candidate::new(extraction.code, extraction.notes.clone());
    let (plan, pre_skipped) = build_plan(params.mode, plan_config);
    let budget = RequestBudget::new(ResourceLimits::for_mode(params.mode).request_budget);
    let history = AttemptHistory::new();

    let result = verifier
        .verify(VerifyTask {
            request_id: &request_id,
            candidate: &candidate,
            attempt,
            mode: params.mode,
            plan: &plan,
            pre_skipped: &pre_skipped,
            history: &history,
            budget: &budget,
            cancel,
        })
        .await;

    InterceptOutcome {
        request_id,
        audit,
        llm_notes: extraction.notes,
        extraction_success: true,
        extraction_error: None,
        verification_result: Some(result),
    }
}
