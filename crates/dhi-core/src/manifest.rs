//! Attestation manifest: the tamper-evident proof of what actually ran.
//!
//! The manifest is the trust contract artifact. Every completed request
//! carries exactly one, built once at terminal state and immutable after
//! emission. A `verified` label may only ever be attached to a manifest
//! that passes the completeness check: every required field present and
//! every tier claim backed by a logged, passing command. Fail closed on
//! any ambiguity about verification evidence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::verification::{
    Authorship, CheckKind, CommandRecord, FailureClass, SkippedCheck, VerificationMode,
    VerificationResult, VerificationStatus, VerificationTier, ViolationEvent,
};

/// Manifest schema version. Increments when any field is added or renamed.
pub const MANIFEST_SCHEMA_VERSION: &str = "1.0";

/// Terminal status of the request the manifest attests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinalStatus {
    /// Proven to pass by local execution; manifest is complete.
    Verified,
    /// Halted with a failure; the manifest records the terminal cause.
    Failed,
    /// Cancelled before reaching a verdict. Never labelled verified.
    Cancelled,
}

impl std::fmt::Display for FinalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Verified => write!(f, "verified"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Reasons a manifest fails the completeness check.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ManifestError {
    /// A required identity field is empty.
    #[error("manifest field '{field}' is empty; cannot label as verified")]
    EmptyField {
        /// The offending field name.
        field: &'static str,
    },

    /// A verified manifest carries no tier.
    #[error("verified manifest must carry a verification tier")]
    MissingTier,

    /// The tier claim is not backed by a logged passing command.
    #[error("tier claim {tier} has no logged passing command backing it")]
    UnbackedTierClaim {
        /// The unbacked tier.
        tier: VerificationTier,
    },

    /// The human-review marker disagrees with the tier.
    #[error("human_review_required={actual} inconsistent with tier {tier}")]
    ReviewMarkerInconsistent {
        /// The tier on the manifest.
        tier: VerificationTier,
        /// The marker value found.
        actual: bool,
    },

    /// A verified manifest carries failure evidence.
    #[error("verified manifest must not carry a failure class or terminal event")]
    VerifiedWithFailure,
}

/// Full trust-contract proof for one completed request.
///
/// All fields are required. A downstream consumer that receives a
/// response without a manifest MUST treat the result as unverified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationManifest {
    /// Unique id from the originating request.
    pub request_id: String,
    /// Candidate that produced the terminal result.
    pub candidate_id: String,
    /// Manifest schema version.
    pub schema_version: String,
    /// UTC timestamp of manifest creation.
    pub created_at: DateTime<Utc>,
    /// Runtime isolation mode used.
    pub mode: VerificationMode,
    /// Highest tier of evidence achieved; absent on failing runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<VerificationTier>,
    /// True when the tier is `AI_TESTS_ONLY`: the response must not be
    /// treated as verified without human sign-off.
    pub human_review_required: bool,
    /// Pass/fail of the terminal verification run.
    pub status: VerificationStatus,
    /// Full command log: names, argv, exit codes, durations.
    pub commands: Vec<CommandRecord>,
    /// Exit code of the terminal run.
    pub exit_code: i32,
    /// Wall-clock duration of the terminal run in milliseconds.
    pub duration_ms: u64,
    /// How many attempts were made (1..=3).
    pub attempt_count: u32,
    /// Retries consumed: `attempt_count - 1`.
    pub retry_count: u32,
    /// Checks intentionally omitted from the terminal run.
    pub skipped_checks: Vec<SkippedCheck>,
    /// Failure class of the terminal run; absent on pass.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_class: Option<FailureClass>,
    /// Terminal violation event, when one halted the request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminal_event: Option<ViolationEvent>,
    /// Paths to durable artifacts (logs, coverage files).
    pub artifact_refs: Vec<String>,
    /// Terminal status of the request.
    pub final_status: FinalStatus,
}

impl AttestationManifest {
    /// Checks completeness: a `verified` label is only legitimate when
    /// this returns `Ok`.
    ///
    /// # Errors
    ///
    /// Returns the first completeness violation found. Non-verified
    /// manifests only need their identity fields; verified manifests
    /// additionally need executed evidence backing the tier claim and a
    /// consistent human-review marker.
    pub fn assert_complete(&self) -> Result<(), ManifestError> {
        if self.request_id.is_empty() {
            return Err(ManifestError::EmptyField { field: "request_id" });
        }
        if self.candidate_id.is_empty() && self.final_status == FinalStatus::Verified {
            return Err(ManifestError::EmptyField { field: "candidate_id" });
        }

        if let Some(tier) = self.tier {
            if self.human_review_required != tier.requires_human_review() {
                return Err(ManifestError::ReviewMarkerInconsistent {
                    tier,
                    actual: self.human_review_required,
                });
            }
        }

        if self.final_status != FinalStatus::Verified {
            return Ok(());
        }

        if self.failure_class.is_some() || self.terminal_event.is_some() {
            return Err(ManifestError::VerifiedWithFailure);
        }

        let Some(tier) = self.tier else {
            return Err(ManifestError::MissingTier);
        };

        if !self.tier_claim_backed(tier) {
            return Err(ManifestError::UnbackedTierClaim { tier });
        }

        Ok(())
    }

    /// Whether at least one logged passing command backs the tier claim.
    fn tier_claim_backed(&self, tier: VerificationTier) -> bool {
        let passing = |predicate: &dyn Fn(&CommandRecord) -> bool| {
            self.commands.iter().any(|c| c.passed() && predicate(c))
        };
        match tier {
            VerificationTier::L0 => passing(&|c| c.kind.is_static()),
            VerificationTier::L1 => passing(&|c| {
                c.kind == CheckKind::UnitTest && matches!(c.authorship, Authorship::User)
            }),
            VerificationTier::L2 => passing(&|c| {
                c.kind == CheckKind::IntegrationTest && matches!(c.authorship, Authorship::User)
            }),
            VerificationTier::AiTestsOnly => {
                passing(&|c| c.kind.is_test() && matches!(c.authorship, Authorship::Ai))
            },
        }
    }
}

/// Builds the manifest for a terminal state.
///
/// `terminal_event` is the aggregate terminal cause decided by the
/// circuit breaker (it may be `MaxRetriesExceeded`, which no single
/// verification result carries).
#[must_use]
pub fn build_manifest(
    result: &VerificationResult,
    attempt_count: u32,
    retry_count: u32,
    terminal_event: Option<ViolationEvent>,
    final_status: FinalStatus,
) -> AttestationManifest {
    let tier = result.tier;
    AttestationManifest {
        request_id: result.request_id.clone(),
        candidate_id: result.candidate_id.clone(),
        schema_version: MANIFEST_SCHEMA_VERSION.to_string(),
        created_at: Utc::now(),
        mode: result.mode,
        tier,
        human_review_required: tier.is_some_and(VerificationTier::requires_human_review),
        status: result.status,
        commands: result.commands.clone(),
        exit_code: result.exit_code,
        duration_ms: result.duration_ms,
        attempt_count,
        retry_count,
        skipped_checks: result.skipped_checks.clone(),
        failure_class: result.failure_class,
        terminal_event,
        artifact_refs: result.artifacts.clone(),
        final_status,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verification::{Authorship, CheckKind, VerificationMode};

    fn record(name: &str, kind: CheckKind, authorship: Authorship, exit_code: i32) -> CommandRecord {
        CommandRecord {
            name: name.to_string(),
            kind,
            authorship,
            argv: vec![name.to_string()],
            exit_code,
            duration_ms: 7,
            stdout_trunc: String::new(),
            stderr_trunc: String::new(),
        }
    }

    fn verified_manifest(tier: VerificationTier, commands: Vec<CommandRecord>) -> AttestationManifest {
        AttestationManifest {
            request_id: "req-1".to_string(),
            candidate_id: "cand-1".to_string(),
            schema_version: MANIFEST_SCHEMA_VERSION.to_string(),
            created_at: Utc::now(),
            mode: VerificationMode::Balanced,
            tier: Some(tier),
            human_review_required: tier.requires_human_review(),
            status: VerificationStatus::Pass,
            commands,
            exit_code: 0,
            duration_ms: 900,
            attempt_count: 1,
            retry_count: 0,
            skipped_checks: Vec::new(),
            failure_class: None,
            terminal_event: None,
            artifact_refs: Vec::new(),
            final_status: FinalStatus::Verified,
        }
    }

    #[test]
    fn complete_l1_manifest_passes() {
        let manifest = verified_manifest(
            VerificationTier::L1,
            vec![
                record("parse", CheckKind::Parse, Authorship::User, 0),
                record("unit", CheckKind::UnitTest, Authorship::User, 0),
            ],
        );
        assert!(manifest.assert_complete().is_ok());
    }

    #[test]
    fn verified_without_backing_command_is_incomplete() {
        // L1 claim but only static evidence in the log.
        let manifest = verified_manifest(
            VerificationTier::L1,
            vec![record("parse", CheckKind::Parse, Authorship::User, 0)],
        );
        assert_eq!(
            manifest.assert_complete(),
            Err(ManifestError::UnbackedTierClaim {
                tier: VerificationTier::L1
            })
        );
    }

    #[test]
    fn verified_without_tier_is_incomplete() {
        let mut manifest = verified_manifest(VerificationTier::L0, Vec::new());
        manifest.tier = None;
        manifest.human_review_required = false;
        assert_eq!(manifest.assert_complete(), Err(ManifestError::MissingTier));
    }

    #[test]
    fn ai_tests_only_requires_review_marker() {
        let mut manifest = verified_manifest(
            VerificationTier::AiTestsOnly,
            vec![
                record("parse", CheckKind::Parse, Authorship::User, 0),
                record("ai-unit", CheckKind::UnitTest, Authorship::Ai, 0),
            ],
        );
        assert!(manifest.assert_complete().is_ok());
        assert!(manifest.human_review_required);

        manifest.human_review_required = false;
        assert!(matches!(
            manifest.assert_complete(),
            Err(ManifestError::ReviewMarkerInconsistent { .. })
        ));
    }

    #[test]
    fn verified_with_failure_evidence_is_rejected() {
        let mut manifest = verified_manifest(
            VerificationTier::L0,
            vec![record("parse", CheckKind::Parse, Authorship::User, 0)],
        );
        manifest.failure_class = Some(FailureClass::Deterministic);
        assert_eq!(
            manifest.assert_complete(),
            Err(ManifestError::VerifiedWithFailure)
        );
    }

    #[test]
    fn failed_manifest_needs_only_identity() {
        let mut manifest = verified_manifest(VerificationTier::L0, Vec::new());
        manifest.final_status = FinalStatus::Failed;
        manifest.status = VerificationStatus::Fail;
        manifest.tier = None;
        manifest.human_review_required = false;
        manifest.failure_class = Some(FailureClass::Policy);
        assert!(manifest.assert_complete().is_ok());
    }

    #[test]
    fn cancelled_manifest_is_never_verified() {
        let mut manifest = verified_manifest(VerificationTier::L0, Vec::new());
        manifest.final_status = FinalStatus::Cancelled;
        // Completeness holds for the cancelled label without evidence.
        assert!(manifest.assert_complete().is_ok());
    }

    #[test]
    fn manifest_roundtrip_is_identity() {
        let manifest = verified_manifest(
            VerificationTier::L2,
            vec![
                record("parse", CheckKind::Parse, Authorship::User, 0),
                record("unit", CheckKind::UnitTest, Authorship::User, 0),
                record("e2e", CheckKind::IntegrationTest, Authorship::User, 0),
            ],
        );
        let json = serde_json::to_string_pretty(&manifest).unwrap();
        let recovered: AttestationManifest = serde_json::from_str(&json).unwrap();
        assert_eq!(manifest, recovered);
    }

    #[test]
    fn build_manifest_carries_aggregate_terminal_event() {
        let result = VerificationResult::failure(
            "req-1",
            "cand-1",
            3,
            VerificationMode::Balanced,
            FailureClass::Deterministic,
            None,
            "assertion failed",
            50,
        );
        let manifest = build_manifest(
            &result,
            3,
            2,
            Some(ViolationEvent::MaxRetriesExceeded),
            FinalStatus::Failed,
        );
        assert_eq!(manifest.attempt_count, 3);
        assert_eq!(manifest.retry_count, 2);
        assert_eq!(
            manifest.terminal_event,
            Some(ViolationEvent::MaxRetriesExceeded)
        );
        assert!(manifest.assert_complete().is_ok());
    }
}
