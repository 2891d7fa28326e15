//! Determinism gate guarding the behavioral memory write path.
//!
//! The VEIL ledger learns only from reproducible signal. A run is
//! reproducible iff (a) its environment fingerprint matches the persisted
//! project baseline, (b) its command set hash matches the expected plan
//! for this request class, and (c) its outcome is not in the noise set.
//! Telemetry is written regardless; this gate only decides whether the
//! run may also produce a behavioral event.

use serde::{Deserialize, Serialize};

use crate::fingerprint::EnvironmentFingerprint;
use crate::verification::FailureClass;

/// Infrastructure-level noise detected outside the sandbox.
///
/// These conditions say nothing about the candidate and are permanently
/// telemetry-only, exactly like the `flake` failure class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InfraNoise {
    /// The LLM provider was unreachable or returned a transient fault.
    ProviderOutage,
    /// A package registry timed out during environment preparation.
    RegistryTimeout,
    /// Host resource starvation unrelated to the candidate.
    ResourceStarvation,
}

impl std::fmt::Display for InfraNoise {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ProviderOutage => write!(f, "provider_outage"),
            Self::RegistryTimeout => write!(f, "registry_timeout"),
            Self::ResourceStarvation => write!(f, "resource_starvation"),
        }
    }
}

/// The gate's verdict for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateDecision {
    /// Whether the run is reproducible and may feed behavioral memory.
    pub reproducible: bool,
    /// Why, in a stable machine-readable form.
    pub reason: String,
}

/// Evaluates runs against the persisted project baseline.
#[derive(Debug, Clone)]
pub struct DeterminismGate {
    baseline: EnvironmentFingerprint,
}

impl DeterminismGate {
    /// Creates a gate bound to the project baseline fingerprint.
    #[must_use]
    pub const fn new(baseline: EnvironmentFingerprint) -> Self {
        Self { baseline }
    }

    /// The baseline this gate compares against.
    #[must_use]
    pub const fn baseline(&self) -> &EnvironmentFingerprint {
        &self.baseline
    }

    /// Evaluates one run.
    ///
    /// `expected_command_set_hash` is the hash of the declared plan for
    /// this request class; `failure_class` is the terminal class of the
    /// run (absent on pass); `infra_noise` carries any infrastructure
    /// noise observed outside the sandbox.
    #[must_use]
    pub fn evaluate(
        &self,
        current: &EnvironmentFingerprint,
        expected_command_set_hash: &str,
        failure_class: Option<FailureClass>,
        infra_noise: Option<InfraNoise>,
    ) -> GateDecision {
        if !current.matches(&self.baseline) {
            return GateDecision {
                reproducible: false,
                reason: "fingerprint_mismatch".to_string(),
            };
        }

        if current.command_set_hash != expected_command_set_hash {
            return GateDecision {
                reproducible: false,
                reason: "command_set_mismatch".to_string(),
            };
        }

        if let Some(noise) = infra_noise {
            return GateDecision {
                reproducible: false,
                reason: format!("noise:{noise}"),
            };
        }

        if let Some(class) = failure_class {
            if !class.is_behavioral_signal() {
                return GateDecision {
                    reproducible: false,
                    reason: format!("noise:{class}"),
                };
            }
            return GateDecision {
                reproducible: true,
                reason: format!("reproducible_fail:{class}"),
            };
        }

        GateDecision {
            reproducible: true,
            reason: "reproducible_pass".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn fingerprint(cmd_hash: &str) -> EnvironmentFingerprint {
        EnvironmentFingerprint {
            image_digest: "sha256:deadbeef".to_string(),
            toolchain_versions: BTreeMap::new(),
            lockfile_hashes: BTreeMap::new(),
            command_set_hash: cmd_hash.to_string(),
            env_allowlist_hash: "env".to_string(),
        }
    }

    #[test]
    fn matching_pass_is_reproducible() {
        let gate = DeterminismGate::new(fingerprint("plan"));
        let decision = gate.evaluate(&fingerprint("plan"), "plan", None, None);
        assert!(decision.reproducible);
        assert_eq!(decision.reason, "reproducible_pass");
    }

    #[test]
    fn deterministic_failure_is_reproducible_signal() {
        let gate = DeterminismGate::new(fingerprint("plan"));
        let decision = gate.evaluate(
            &fingerprint("plan"),
            "plan",
            Some(FailureClass::Deterministic),
            None,
        );
        assert!(decision.reproducible);
        assert_eq!(decision.reason, "reproducible_fail:deterministic");
    }

    #[test]
    fn fingerprint_mismatch_blocks_behavioral_write() {
        let gate = DeterminismGate::new(fingerprint("plan"));
        let mut drifted = fingerprint("plan");
        drifted.image_digest = "sha256:feedface".to_string();
        let decision = gate.evaluate(&drifted, "plan", None, None);
        assert!(!decision.reproducible);
        assert_eq!(decision.reason, "fingerprint_mismatch");
    }

    #[test]
    fn command_set_mismatch_blocks_behavioral_write() {
        let gate = DeterminismGate::new(fingerprint("plan"));
        let decision = gate.evaluate(&fingerprint("plan"), "other-plan", None, None);
        assert!(!decision.reproducible);
        assert_eq!(decision.reason, "command_set_mismatch");
    }

    #[test]
    fn flake_is_noise() {
        let gate = DeterminismGate::new(fingerprint("plan"));
        let decision = gate.evaluate(
            &fingerprint("plan"),
            "plan",
            Some(FailureClass::Flake),
            None,
        );
        assert!(!decision.reproducible);
        assert_eq!(decision.reason, "noise:flake");
    }

    #[test]
    fn enforcement_outcomes_stay_telemetry_only() {
        let gate = DeterminismGate::new(fingerprint("plan"));
        for class in [FailureClass::Policy, FailureClass::Timeout] {
            let decision = gate.evaluate(&fingerprint("plan"), "plan", Some(class), None);
            assert!(!decision.reproducible, "{class} must not feed memory");
        }
    }

    #[test]
    fn infra_noise_is_noise_even_on_pass() {
        let gate = DeterminismGate::new(fingerprint("plan"));
        let decision = gate.evaluate(
            &fingerprint("plan"),
            "plan",
            None,
            Some(InfraNoise::RegistryTimeout),
        );
        assert!(!decision.reproducible);
        assert_eq!(decision.reason, "noise:registry_timeout");
    }
}
