//! Shared test doubles for driving the circuit breaker deterministically.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::Utc;
use dhi_core::envelope::ContextPayload;
use dhi_core::fingerprint::EnvironmentFingerprint;
use dhi_core::gate::DeterminismGate;
use dhi_core::llm::LlmConfig;
use dhi_core::verification::{
    Authorship, CheckKind, CommandRecord, FailureClass, VerificationMode, VerificationResult,
    VerificationStatus, VerificationTier, ViolationEvent, result::SCHEMA_VERSION,
};
use dhi_daemon::gateway::{CandidateGenerator, GatewayError};
use dhi_daemon::ledger::LedgerHandle;
use dhi_daemon::manifest_store::ManifestStore;
use dhi_daemon::orchestrator::Orchestrator;
use dhi_daemon::sandbox::plan::PlanConfig;
use dhi_daemon::sandbox::{Verifier, VerifyTask, build_plan};

/// A gateway returning scripted raw responses, one per call.
pub struct StubGateway {
    responses: Mutex<VecDeque<Result<String, GatewayError>>>,
}

impl StubGateway {
    pub fn replying(raw: &str, times: usize) -> Self {
        Self {
            responses: Mutex::new((0..times).map(|_| Ok(raw.to_string())).collect()),
        }
    }

    pub fn well_formed(times: usize) -> Self {
        Self::replying(
            r#"{"language": "python", "code": "print(1+1)", "notes": "sums"}"#,
            times,
        )
    }

    pub fn failing_transport() -> Self {
        Self {
            responses: Mutex::new(
                std::iter::once(Err(GatewayError::ProviderRejected {
                    status: 503,
                    body: "provider overloaded".to_string(),
                }))
                .collect(),
            ),
        }
    }
}

impl CandidateGenerator for StubGateway {
    async fn generate(
        &self,
        _payload: &ContextPayload,
        _config: &LlmConfig,
    ) -> Result<String, GatewayError> {
        self.responses
            .lock()
            .expect("stub gateway lock")
            .pop_front()
            .unwrap_or(Err(GatewayError::EmptyResponse))
    }
}

/// Scripted sandbox behaviors for one attempt.
#[derive(Debug, Clone, Copy)]
pub enum ScriptedRun {
    PassL1,
    PassAiTestsOnly,
    SyntaxFail,
    DeterministicFail,
    NetworkViolation,
    Timeout,
    FlakeFail,
}

/// A verifier that replays a script instead of running containers.
pub struct StubVerifier {
    script: Mutex<VecDeque<ScriptedRun>>,
}

impl StubVerifier {
    pub fn scripted(runs: impl IntoIterator<Item = ScriptedRun>) -> Self {
        Self {
            script: Mutex::new(runs.into_iter().collect()),
        }
    }
}

fn command(name: &str, kind: CheckKind, authorship: Authorship, exit_code: i32, stderr: &str) -> CommandRecord {
    CommandRecord {
        name: name.to_string(),
        kind,
        authorship,
        argv: vec![name.to_string()],
        exit_code,
        duration_ms: 25,
        stdout_trunc: String::new(),
        stderr_trunc: stderr.to_string(),
    }
}

fn scripted_result(run: ScriptedRun, task: &VerifyTask<'_>) -> VerificationResult {
    let base = |status: VerificationStatus,
                tier: Option<VerificationTier>,
                failure_class: Option<FailureClass>,
                terminal_event: Option<ViolationEvent>,
                commands: Vec<CommandRecord>,
                stderr: &str| VerificationResult {
        request_id: task.request_id.to_string(),
        candidate_id: task.candidate.candidate_id.clone(),
        attempt: task.attempt,
        schema_version: SCHEMA_VERSION.to_string(),
        created_at: Utc::now(),
        mode: task.mode,
        status,
        tier,
        failure_class,
        terminal_event,
        exit_code: commands.last().map_or(-1, |c| c.exit_code),
        duration_ms: 40,
        stdout: String::new(),
        stderr: stderr.to_string(),
        commands,
        artifacts: Vec::new(),
        skipped_checks: Vec::new(),
    };

    match run {
        ScriptedRun::PassL1 => base(
            VerificationStatus::Pass,
            Some(VerificationTier::L1),
            None,
            None,
            vec![
                command("parse", CheckKind::Parse, Authorship::User, 0, ""),
                command("user-unit", CheckKind::UnitTest, Authorship::User, 0, ""),
            ],
            "",
        ),
        ScriptedRun::PassAiTestsOnly => base(
            VerificationStatus::Pass,
            Some(VerificationTier::AiTestsOnly),
            None,
            None,
            vec![
                command("parse", CheckKind::Parse, Authorship::User, 0, ""),
                command("ai-tests", CheckKind::UnitTest, Authorship::Ai, 0, ""),
            ],
            "",
        ),
        ScriptedRun::SyntaxFail => base(
            VerificationStatus::Fail,
            None,
            Some(FailureClass::Syntax),
            None,
            vec![command(
                "parse",
                CheckKind::Parse,
                Authorship::User,
                1,
                "SyntaxError: invalid syntax",
            )],
            "SyntaxError: invalid syntax",
        ),
        ScriptedRun::DeterministicFail => base(
            VerificationStatus::Fail,
            None,
            Some(FailureClass::Deterministic),
            None,
            vec![
                command("parse", CheckKind::Parse, Authorship::User, 0, ""),
                command(
                    "user-unit",
                    CheckKind::UnitTest,
                    Authorship::User,
                    1,
                    "AssertionError: 2 != 3",
                ),
            ],
            "AssertionError: 2 != 3",
        ),
        ScriptedRun::NetworkViolation => base(
            VerificationStatus::Fail,
            None,
            Some(FailureClass::Policy),
            Some(ViolationEvent::NetworkAccessViolation),
            vec![command(
                "smoke",
                CheckKind::Smoke,
                Authorship::User,
                1,
                "ConnectionRefusedError: [Errno 111] connection refused",
            )],
            "ConnectionRefusedError: [Errno 111] connection refused",
        ),
        ScriptedRun::Timeout => base(
            VerificationStatus::Fail,
            None,
            Some(FailureClass::Timeout),
            Some(ViolationEvent::TimeoutViolation),
            vec![command("smoke", CheckKind::Smoke, Authorship::User, -1, "")],
            "",
        ),
        ScriptedRun::FlakeFail => base(
            VerificationStatus::Fail,
            None,
            Some(FailureClass::Flake),
            None,
            vec![
                command("parse", CheckKind::Parse, Authorship::User, 0, ""),
                command(
                    "user-unit",
                    CheckKind::UnitTest,
                    Authorship::User,
                    1,
                    "AssertionError (marked [flaky])",
                ),
            ],
            "AssertionError (marked [flaky])",
        ),
    }
}

impl Verifier for StubVerifier {
    async fn verify(&self, task: VerifyTask<'_>) -> VerificationResult {
        let run = self
            .script
            .lock()
            .expect("stub verifier lock")
            .pop_front()
            .expect("stub verifier script exhausted");
        scripted_result(run, &task)
    }
}

/// Everything an orchestrator run needs, rooted in a temp directory.
pub struct Harness {
    /// Keeps the backing directory alive for the harness's lifetime.
    pub _dir: tempfile::TempDir,
    pub ledger: LedgerHandle,
    pub manifests: ManifestStore,
    pub gate: DeterminismGate,
    pub fingerprint: EnvironmentFingerprint,
    pub plan_config: PlanConfig,
}

impl Harness {
    /// Builds a harness whose baseline matches the plan for `mode`, so
    /// gate decisions depend only on the run's failure class.
    pub fn new(mode: VerificationMode) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let ledger = LedgerHandle::spawn(&dir.path().join("veil.db")).expect("ledger");
        let manifests = ManifestStore::open(&dir.path().join("manifests")).expect("manifests");

        let plan_config = PlanConfig {
            user_unit_tests: Some(vec!["pytest".to_string(), "tests/unit".to_string()]),
            ..PlanConfig::default()
        };
        let (plan, _) = build_plan(mode, &plan_config);

        let fingerprint = EnvironmentFingerprint {
            image_digest: "sha256:test-image".to_string(),
            toolchain_versions: std::collections::BTreeMap::new(),
            lockfile_hashes: std::collections::BTreeMap::new(),
            command_set_hash: String::new(),
            env_allowlist_hash: "env".to_string(),
        };
        let mut baseline = fingerprint.clone();
        baseline.command_set_hash = EnvironmentFingerprint::hash_command_set(&plan);

        Self {
            _dir: dir,
            ledger,
            manifests,
            gate: DeterminismGate::new(baseline),
            fingerprint,
            plan_config,
        }
    }

    pub fn orchestrator<'a, G, V>(&'a self, gateway: &'a G, verifier: &'a V) -> Orchestrator<'a, G, V>
    where
        G: CandidateGenerator,
        V: Verifier,
    {
        Orchestrator {
            gateway,
            verifier,
            ledger: &self.ledger,
            manifests: &self.manifests,
            gate: &self.gate,
            fingerprint_template: &self.fingerprint,
            plan_config: &self.plan_config,
        }
    }
}
