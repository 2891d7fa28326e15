//! Sandbox backend selection and container command construction.
//!
//! Two backend profiles exist: the rootless *container* profile (fast and
//! balanced modes) and the hardware-virtualized *microVM* profile (strict
//! mode). Backend selection is driven entirely by the requested mode; if
//! strict is requested or mandated but no microVM backend is available,
//! the run fails closed with a terminal event. There is no downgrade
//! path, silent or otherwise.
//!
//! Command construction is deterministic: the same candidate, limits, and
//! paths always produce the same argument vector, which is what lets the
//! command set participate in the determinism fingerprint.

use std::path::{Path, PathBuf};

use dhi_core::verification::{ResourceLimits, VerificationMode, ViolationEvent};
use thiserror::Error;

/// Environment variable overriding the container runtime binary.
pub const CONTAINER_RUNTIME_ENV_VAR: &str = "DHI_CONTAINER_RUNTIME";

/// Environment variable naming the microVM-capable runtime for strict mode.
pub const MICROVM_RUNTIME_ENV_VAR: &str = "DHI_MICROVM_RUNTIME";

/// Default rootless container runtime.
pub const DEFAULT_CONTAINER_RUNTIME: &str = "podman";

/// Read-only mount point of the staged source inside the sandbox.
pub const SOURCE_MOUNT: &str = "/source";

/// The single writable scratch path inside the sandbox.
pub const SCRATCH_MOUNT: &str = "/tmp/dhi-scratch";

/// KVM device required by the microVM profile.
const KVM_DEVICE: &str = "/dev/kvm";

/// Errors from backend probing and selection.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BackendError {
    /// The container runtime binary is not on PATH.
    #[error("container runtime '{runtime}' not found on PATH")]
    ContainerRuntimeMissing {
        /// The probed binary name.
        runtime: String,
    },

    /// Strict mode requested but the microVM profile is unavailable.
    #[error("strict mode unavailable: {reason}")]
    StrictUnavailable {
        /// Why the microVM backend cannot run.
        reason: String,
    },

    /// Policy mandates strict isolation but the request asked for less.
    #[error("policy mandates strict mode; request asked for '{requested}'")]
    StrictRequired {
        /// The weaker mode that was requested.
        requested: VerificationMode,
    },
}

impl BackendError {
    /// The terminal event this backend fault maps to.
    #[must_use]
    pub const fn terminal_event(&self) -> ViolationEvent {
        match self {
            Self::StrictRequired { .. } => ViolationEvent::StrictModeRequired,
            Self::ContainerRuntimeMissing { .. } | Self::StrictUnavailable { .. } => {
                ViolationEvent::StrictModeUnavailable
            },
        }
    }
}

/// Which isolation profile a run executes under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Rootless container with namespace/cgroup enforcement.
    Container,
    /// Hardware-virtualized microVM.
    MicroVm,
}

/// A probed, ready-to-use sandbox backend.
#[derive(Debug, Clone)]
pub struct SandboxBackend {
    kind: BackendKind,
    runtime_bin: PathBuf,
    image: String,
}

impl SandboxBackend {
    /// Selects and probes the backend for a mode.
    ///
    /// `require_strict` reflects project policy: when set, anything below
    /// strict fails closed with [`BackendError::StrictRequired`].
    ///
    /// # Errors
    ///
    /// Fails closed when the required runtime cannot be found or strict
    /// isolation is unavailable.
    pub fn select(
        mode: VerificationMode,
        require_strict: bool,
        container_runtime: &str,
        microvm_runtime: Option<&str>,
        image: &str,
    ) -> Result<Self, BackendError> {
        if require_strict && mode != VerificationMode::Strict {
            return Err(BackendError::StrictRequired { requested: mode });
        }

        match mode {
            VerificationMode::Fast | VerificationMode::Balanced => {
                let runtime_bin = find_on_path(container_runtime).ok_or_else(|| {
                    BackendError::ContainerRuntimeMissing {
                        runtime: container_runtime.to_string(),
                    }
                })?;
                Ok(Self {
                    kind: BackendKind::Container,
                    runtime_bin,
                    image: image.to_string(),
                })
            },
            VerificationMode::Strict => {
                let Some(runtime) = microvm_runtime else {
                    return Err(BackendError::StrictUnavailable {
                        reason: format!("no microVM runtime configured ({MICROVM_RUNTIME_ENV_VAR} unset)"),
                    });
                };
                if !Path::new(KVM_DEVICE).exists() {
                    return Err(BackendError::StrictUnavailable {
                        reason: format!("{KVM_DEVICE} not present on this host"),
                    });
                }
                let runtime_bin = find_on_path(runtime).ok_or_else(|| {
                    BackendError::StrictUnavailable {
                        reason: format!("microVM runtime '{runtime}' not found on PATH"),
                    }
                })?;
                Ok(Self {
                    kind: BackendKind::MicroVm,
                    runtime_bin,
                    image: image.to_string(),
                })
            },
        }
    }

    /// The selected profile.
    #[must_use]
    pub const fn kind(&self) -> BackendKind {
        self.kind
    }

    /// The runtime binary invoked for each command.
    #[must_use]
    pub fn runtime_bin(&self) -> &Path {
        &self.runtime_bin
    }

    /// Builds the full argument vector for one sandboxed command.
    ///
    /// The source directory is mounted read-only, the rootfs is read-only,
    /// networking is disabled, and every cap from the limit table becomes
    /// an enforcement flag for the runtime.
    #[must_use]
    pub fn command_argv(
        &self,
        limits: &ResourceLimits,
        source_dir: &Path,
        inner_argv: &[String],
    ) -> Vec<String> {
        let mut argv = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--network".to_string(),
            "none".to_string(),
            "--read-only".to_string(),
            "--mount".to_string(),
            format!(
                "type=bind,source={},destination={SOURCE_MOUNT},readonly",
                source_dir.display()
            ),
            "--tmpfs".to_string(),
            format!(
                "{SCRATCH_MOUNT}:rw,noexec,nosuid,size={}",
                limits.scratch_cap_bytes
            ),
            "--memory".to_string(),
            format!("{}b", limits.memory_bytes),
            "--cpus".to_string(),
            format!("{}", f64::from(limits.cpu_milli) / 1000.0),
            "--pids-limit".to_string(),
            limits.max_processes.to_string(),
            "--env".to_string(),
            "PYTHONDONTWRITEBYTECODE=1".to_string(),
        ];
        if self.kind == BackendKind::MicroVm {
            // podman-compatible microVM runtimes (krun) take a runtime flag.
            argv.insert(1, "--runtime=krun".to_string());
        }
        argv.push(self.image.clone());
        argv.extend(inner_argv.iter().cloned());
        argv
    }
}

/// Locates an executable on PATH. Absolute paths are checked directly.
fn find_on_path(binary: &str) -> Option<PathBuf> {
    let candidate = Path::new(binary);
    if candidate.is_absolute() {
        return candidate.exists().then(|| candidate.to_path_buf());
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(binary))
        .find(|full| full.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container_backend() -> SandboxBackend {
        SandboxBackend {
            kind: BackendKind::Container,
            runtime_bin: PathBuf::from("/usr/bin/podman"),
            image: "dhi-sandbox:latest".to_string(),
        }
    }

    #[test]
    fn argv_is_deterministic() {
        let backend = container_backend();
        let limits = ResourceLimits::balanced();
        let source = Path::new("/tmp/stage");
        let inner = vec!["python".to_string(), "/source/candidate.py".to_string()];
        assert_eq!(
            backend.command_argv(&limits, source, &inner),
            backend.command_argv(&limits, source, &inner)
        );
    }

    #[test]
    fn argv_encodes_isolation_flags() {
        let backend = container_backend();
        let limits = ResourceLimits::balanced();
        let argv = backend.command_argv(
            &limits,
            Path::new("/tmp/stage"),
            &["python".to_string(), "/source/candidate.py".to_string()],
        );
        let joined = argv.join(" ");
        assert!(joined.contains("--network none"));
        assert!(joined.contains("--read-only"));
        assert!(joined.contains("readonly"));
        assert!(joined.contains("--pids-limit 256"));
        assert!(joined.contains("--memory 1073741824b"));
        assert!(joined.contains("--cpus 2"));
        assert!(joined.contains("noexec"));
        assert!(joined.ends_with("dhi-sandbox:latest python /source/candidate.py"));
    }

    #[test]
    fn strict_without_microvm_runtime_fails_closed() {
        let err = SandboxBackend::select(
            VerificationMode::Strict,
            false,
            DEFAULT_CONTAINER_RUNTIME,
            None,
            "dhi-sandbox:latest",
        )
        .unwrap_err();
        assert_eq!(err.terminal_event(), ViolationEvent::StrictModeUnavailable);
    }

    #[test]
    fn policy_mandated_strict_rejects_weaker_modes() {
        let err = SandboxBackend::select(
            VerificationMode::Balanced,
            true,
            DEFAULT_CONTAINER_RUNTIME,
            None,
            "dhi-sandbox:latest",
        )
        .unwrap_err();
        assert!(matches!(err, BackendError::StrictRequired { .. }));
        assert_eq!(err.terminal_event(), ViolationEvent::StrictModeRequired);
    }

    #[test]
    fn missing_container_runtime_is_reported() {
        let err = SandboxBackend::select(
            VerificationMode::Balanced,
            false,
            "definitely-not-a-real-runtime-binary",
            None,
            "dhi-sandbox:latest",
        )
        .unwrap_err();
        assert!(matches!(err, BackendError::ContainerRuntimeMissing { .. }));
    }
}
