//! Sandbox executor: runs a candidate's command plan in isolation.
//!
//! The executor is the only component permitted to issue execution. It
//! stages the candidate into a read-only bind mount, runs each command of
//! the declared plan in a fresh ephemeral container, supervises the
//! per-command clock and the per-request verification budget, caps
//! captured output, and always returns a structurally complete
//! [`VerificationResult`] — internal faults included.
//!
//! Enforcement is terminal: the first violation, timeout, or failed
//! command stops the plan; everything that did not run is recorded as a
//! skipped check with its reason.

use std::process::Stdio;
use std::time::Instant;

use dhi_core::verification::{
    CommandRecord, CommandSpec, FailureClass, ResourceLimits, SkippedCheck, VerificationResult,
    VerificationStatus, assign_tier, classify_run, result::SCHEMA_VERSION,
};
use tokio::io::AsyncReadExt;
use tracing::{info, warn};

use super::backend::SandboxBackend;
use super::workspace::{ArtifactDir, StagedWorkspace};
use super::VerifyTask;

/// Sandbox executor configuration. Injected, never ambient.
#[derive(Debug, Clone)]
pub struct SandboxExecutor {
    /// Container runtime binary name or path.
    pub container_runtime: String,
    /// MicroVM runtime binary for strict mode, when present on this host.
    pub microvm_runtime: Option<String>,
    /// Sandbox image reference.
    pub image: String,
    /// Root of the durable per-request artifact tree.
    pub artifact_root: std::path::PathBuf,
    /// Project policy: mandate strict isolation for every request.
    pub require_strict: bool,
}

impl SandboxExecutor {
    /// Runs the declared plan for one candidate and returns the result.
    ///
    /// Never fails: every fault is folded into the returned
    /// [`VerificationResult`].
    pub async fn execute(&self, task: VerifyTask<'_>) -> VerificationResult {
        let started = Instant::now();
        let limits = ResourceLimits::for_mode(task.mode);

        let backend = match SandboxBackend::select(
            task.mode,
            self.require_strict,
            &self.container_runtime,
            self.microvm_runtime.as_deref(),
            &self.image,
        ) {
            Ok(backend) => backend,
            Err(err) => {
                warn!(request_id = %task.request_id, error = %err, "sandbox backend unavailable");
                return self.fault_result(&task, FailureClass::Policy, Some(err.terminal_event()), err.to_string(), started);
            },
        };

        let staged = match StagedWorkspace::stage(&task.candidate.diff_or_code) {
            Ok(staged) => staged,
            Err(err) => {
                return self.fault_result(&task, FailureClass::Deterministic, None, err.to_string(), started);
            },
        };

        let artifacts = match ArtifactDir::create(&self.artifact_root, task.request_id, task.attempt) {
            Ok(artifacts) => artifacts,
            Err(err) => {
                return self.fault_result(&task, FailureClass::Deterministic, None, err.to_string(), started);
            },
        };

        let mut commands: Vec<CommandRecord> = Vec::with_capacity(task.plan.len());
        let mut skipped: Vec<SkippedCheck> = task.pre_skipped.to_vec();
        let mut timed_out = false;
        let mut output_capped = false;
        let mut cancelled = false;

        for (index, spec) in task.plan.iter().enumerate() {
            if task.cancel.is_cancelled() {
                cancelled = true;
                skip_rest(&mut skipped, &task.plan[index..], "request cancelled");
                break;
            }

            let remaining = task.budget.remaining();
            if remaining.is_zero() {
                timed_out = true;
                skip_rest(&mut skipped, &task.plan[index..], "verification budget exhausted");
                break;
            }
            let command_timeout = limits.command_timeout.min(remaining);

            let outcome = self
                .run_command(&backend, &limits, &staged, spec, command_timeout, task.cancel)
                .await;

            match outcome {
                CommandOutcome::Finished(record, capped) => {
                    output_capped |= capped;
                    let failed = !record.passed();
                    commands.push(record);
                    if output_capped {
                        skip_rest(&mut skipped, &task.plan[index + 1..], "output cap breached");
                        break;
                    }
                    if failed {
                        skip_rest(
                            &mut skipped,
                            &task.plan[index + 1..],
                            &format!("earlier check '{}' failed", spec.name),
                        );
                        break;
                    }
                },
                CommandOutcome::TimedOut(record) => {
                    commands.push(record);
                    timed_out = true;
                    skip_rest(&mut skipped, &task.plan[index + 1..], "per-command wall time exceeded");
                    break;
                },
                CommandOutcome::Cancelled(record) => {
                    commands.push(record);
                    cancelled = true;
                    skip_rest(&mut skipped, &task.plan[index + 1..], "request cancelled");
                    break;
                },
                CommandOutcome::SpawnFailed(message) => {
                    return self.fault_result(&task, FailureClass::Deterministic, None, message, started);
                },
            }
        }

        // The staged workspace guard drops here on every path; only the
        // durable artifact directory survives.
        drop(staged);

        let mut window = task.history.clone();
        window.record_attempt(&commands);
        let classification = classify_run(&commands, timed_out, output_capped, &window);

        let artifact_refs = persist_artifacts(&artifacts, &commands);

        let last = commands.last();
        let exit_code = last.map_or(-1, |c| c.exit_code);
        let stdout = last.map_or_else(String::new, |c| c.stdout_trunc.clone());
        let stderr = last.map_or_else(String::new, |c| c.stderr_trunc.clone());

        let (status, tier, failure_class) = if cancelled {
            (
                VerificationStatus::Fail,
                None,
                Some(FailureClass::Deterministic),
            )
        } else if classification.is_pass() && !commands.is_empty() {
            match assign_tier(&commands) {
                Some(tier) => (VerificationStatus::Pass, Some(tier), None),
                // A passing run without tier evidence is ambiguous; fail closed.
                None => (
                    VerificationStatus::Fail,
                    None,
                    Some(FailureClass::Deterministic),
                ),
            }
        } else if commands.is_empty() && !timed_out {
            (
                VerificationStatus::Fail,
                None,
                Some(FailureClass::Deterministic),
            )
        } else {
            (VerificationStatus::Fail, None, classification.failure_class)
        };

        let result = VerificationResult {
            request_id: task.request_id.to_string(),
            candidate_id: task.candidate.candidate_id.clone(),
            attempt: task.attempt,
            schema_version: SCHEMA_VERSION.to_string(),
            created_at: chrono::Utc::now(),
            mode: task.mode,
            status,
            tier,
            failure_class,
            terminal_event: classification.violation,
            exit_code,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            stdout,
            stderr: if cancelled && stderr.is_empty() {
                "request cancelled".to_string()
            } else {
                stderr
            },
            commands,
            artifacts: artifact_refs,
            skipped_checks: skipped,
        };

        if let Err(err) = result.validate() {
            warn!(request_id = %task.request_id, error = %err, "verification result failed invariant check");
        }
        info!(
            request_id = %task.request_id,
            attempt = task.attempt,
            status = ?result.status,
            failure_class = ?result.failure_class,
            duration_ms = result.duration_ms,
            "sandbox run complete"
        );
        result
    }

    async fn run_command(
        &self,
        backend: &SandboxBackend,
        limits: &ResourceLimits,
        staged: &StagedWorkspace,
        spec: &CommandSpec,
        timeout: std::time::Duration,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> CommandOutcome {
        let argv = backend.command_argv(limits, staged.source_dir(), &spec.argv);
        let command_started = Instant::now();

        let spawned = tokio::process::Command::new(backend.runtime_bin())
            .args(&argv)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(err) => {
                return CommandOutcome::SpawnFailed(format!(
                    "failed to spawn sandbox runtime for '{}': {err}",
                    spec.name
                ));
            },
        };

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let cap = usize::try_from(limits.output_cap_bytes).unwrap_or(usize::MAX);

        // Output is drained concurrently with wait(); a child that fills
        // the pipe buffer must never deadlock against its own reaper.
        // The child is owned by this future: dropping it on timeout or
        // cancellation kills the runtime immediately (kill_on_drop).
        let wait = async move {
            let (stdout, stderr, status) = tokio::join!(
                read_capped(stdout_pipe, cap),
                read_capped(stderr_pipe, cap),
                child.wait(),
            );
            (status, stdout.0, stderr.0, stdout.1 || stderr.1)
        };

        let record = |exit_code: i32, stdout: String, stderr: String| CommandRecord {
            name: spec.name.clone(),
            kind: spec.kind,
            authorship: spec.authorship,
            argv: spec.argv.clone(),
            exit_code,
            duration_ms: u64::try_from(command_started.elapsed().as_millis()).unwrap_or(u64::MAX),
            stdout_trunc: stdout,
            stderr_trunc: stderr,
        };

        tokio::select! {
            () = cancel.cancelled() => {
                // Dropping the wait future kills the child (kill_on_drop).
                CommandOutcome::Cancelled(record(-1, String::new(), String::new()))
            },
            result = tokio::time::timeout(timeout, wait) => match result {
                Ok((Ok(status), stdout, stderr, over_cap)) => {
                    let exit_code = status.code().unwrap_or(-1);
                    CommandOutcome::Finished(record(exit_code, stdout, stderr), over_cap)
                },
                Ok((Err(err), _, _, _)) => CommandOutcome::SpawnFailed(format!(
                    "failed to reap sandbox runtime for '{}': {err}",
                    spec.name
                )),
                Err(_elapsed) => CommandOutcome::TimedOut(record(-1, String::new(), String::new())),
            },
        }
    }

    fn fault_result(
        &self,
        task: &VerifyTask<'_>,
        failure_class: FailureClass,
        terminal_event: Option<dhi_core::verification::ViolationEvent>,
        stderr: String,
        started: Instant,
    ) -> VerificationResult {
        VerificationResult::failure(
            task.request_id,
            task.candidate.candidate_id.clone(),
            task.attempt,
            task.mode,
            failure_class,
            terminal_event,
            stderr,
            u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        )
    }
}

enum CommandOutcome {
    /// The command ran to completion; the flag marks an output cap breach.
    Finished(CommandRecord, bool),
    TimedOut(CommandRecord),
    Cancelled(CommandRecord),
    SpawnFailed(String),
}

fn skip_rest(skipped: &mut Vec<SkippedCheck>, remaining: &[CommandSpec], reason: &str) {
    for spec in remaining {
        skipped.push(SkippedCheck::new(spec.name.clone(), reason));
    }
}

/// Reads a pipe up to `cap + 1` bytes; the extra byte detects a breach.
async fn read_capped<R>(pipe: Option<R>, cap: usize) -> (String, bool)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let Some(mut pipe) = pipe else {
        return (String::new(), false);
    };
    let mut buf: Vec<u8> = Vec::new();
    let mut over_cap = false;
    let mut chunk = [0u8; 8192];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                if buf.len() + n > cap {
                    over_cap = true;
                    let room = cap.saturating_sub(buf.len());
                    buf.extend_from_slice(&chunk[..room]);
                    // Keep draining so the child is not blocked on a full pipe.
                } else {
                    buf.extend_from_slice(&chunk[..n]);
                }
            },
            Err(_) => break,
        }
    }
    (String::from_utf8_lossy(&buf).into_owned(), over_cap)
}

/// Writes the command log and last captured output as durable artifacts.
fn persist_artifacts(artifacts: &ArtifactDir, commands: &[CommandRecord]) -> Vec<String> {
    let mut refs = Vec::new();
    match serde_json::to_vec_pretty(commands) {
        Ok(log) => match artifacts.write("command-log.json", &log) {
            Ok(path) => refs.push(path.display().to_string()),
            Err(err) => warn!(error = %err, "failed to persist command log artifact"),
        },
        Err(err) => warn!(error = %err, "failed to serialize command log"),
    }
    if let Some(last) = commands.last() {
        if let Ok(path) = artifacts.write("stdout.log", last.stdout_trunc.as_bytes()) {
            refs.push(path.display().to_string());
        }
        if let Ok(path) = artifacts.write("stderr.log", last.stderr_trunc.as_bytes()) {
            refs.push(path.display().to_string());
        }
    }
    refs
}

#[cfg(test)]
mod tests {
    use super::*;
    use dhi_core::envelope::Candidate;
    use dhi_core::verification::{AttemptHistory, Authorship, CheckKind, VerificationMode};
    use tokio_util::sync::CancellationToken;

    use crate::sandbox::RequestBudget;

    fn executor(root: &std::path::Path) -> SandboxExecutor {
        SandboxExecutor {
            container_runtime: "definitely-not-a-real-runtime-binary".to_string(),
            microvm_runtime: None,
            image: "dhi-sandbox:latest".to_string(),
            artifact_root: root.to_path_buf(),
            require_strict: false,
        }
    }

    fn plan() -> Vec<CommandSpec> {
        vec![CommandSpec::new(
            "parse",
            CheckKind::Parse,
            Authorship::User,
            ["python", "-m", "py_compile", "/source/candidate.py"],
        )]
    }

    #[tokio::test]
    async fn missing_runtime_fails_closed_with_complete_result() {
        let root = tempfile::tempdir().unwrap();
        let executor = executor(root.path());
        let candidate = Candidate::new("print(1)", "");
        let budget = RequestBudget::new(std::time::Duration::from_secs(180));
        let cancel = CancellationToken::new();
        let history = AttemptHistory::new();
        let plan = plan();

        let result = executor
            .execute(VerifyTask {
                request_id: "req-1",
                candidate: &candidate,
                attempt: 1,
                mode: VerificationMode::Balanced,
                plan: &plan,
                pre_skipped: &[],
                history: &history,
                budget: &budget,
                cancel: &cancel,
            })
            .await;

        assert_eq!(result.status, VerificationStatus::Fail);
        assert_eq!(result.failure_class, Some(FailureClass::Policy));
        assert_eq!(
            result.terminal_event,
            Some(dhi_core::verification::ViolationEvent::StrictModeUnavailable)
        );
        assert!(result.validate().is_ok());
    }

    #[tokio::test]
    async fn strict_mode_without_microvm_reports_strict_unavailable() {
        let root = tempfile::tempdir().unwrap();
        let executor = executor(root.path());
        let candidate = Candidate::new("print(1)", "");
        let budget = RequestBudget::new(std::time::Duration::from_secs(240));
        let cancel = CancellationToken::new();
        let history = AttemptHistory::new();
        let plan = plan();

        let result = executor
            .execute(VerifyTask {
                request_id: "req-1",
                candidate: &candidate,
                attempt: 1,
                mode: VerificationMode::Strict,
                plan: &plan,
                pre_skipped: &[],
                history: &history,
                budget: &budget,
                cancel: &cancel,
            })
            .await;

        assert_eq!(
            result.terminal_event,
            Some(dhi_core::verification::ViolationEvent::StrictModeUnavailable)
        );
        assert!(result.stderr.contains("microVM"));
    }
}
