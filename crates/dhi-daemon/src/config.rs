//! Daemon configuration and startup-time environment capture.
//!
//! Runtime limits, mode policy, and store paths are injected values
//! carried by [`DaemonConfig`]; only the process-wide ledger and manifest
//! stores have cross-request lifetime. Provider API keys are read from
//! the environment once at process start (optionally seeded from a local
//! `.env` file) and never re-read per request.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use dhi_core::fingerprint::{EnvironmentFingerprint, sha256_file, sha256_hex};
use tracing::{info, warn};

use crate::sandbox::plan::PlanConfig;

/// Environment variable names whose *names* (never values) participate
/// in the determinism fingerprint.
pub const DEFAULT_ENV_ALLOWLIST: &[&str] = &[
    "HOME",
    "NVIDIA_API_BASE",
    "NVIDIA_API_KEY",
    "OPENAI_API_KEY",
    "PATH",
];

/// Injected daemon configuration. No ambient globals.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// HTTP listen address.
    pub listen: SocketAddr,
    /// Path of the `SQLite` VEIL ledger.
    pub ledger_path: PathBuf,
    /// Root of the manifest store.
    pub manifest_root: PathBuf,
    /// Root of the durable artifact tree.
    pub artifact_root: PathBuf,
    /// Path of the persisted baseline fingerprint.
    pub baseline_path: PathBuf,
    /// Container runtime binary.
    pub container_runtime: String,
    /// MicroVM runtime binary for strict mode, when available.
    pub microvm_runtime: Option<String>,
    /// Sandbox image reference.
    pub sandbox_image: String,
    /// Sandbox image build file, hashed into the fingerprint when present.
    pub sandbox_dockerfile: Option<PathBuf>,
    /// Lockfiles hashed into the fingerprint when present.
    pub lockfiles: Vec<PathBuf>,
    /// Project policy: mandate strict isolation for every request.
    pub require_strict: bool,
    /// Concurrency cap on live sandboxes.
    pub max_sandboxes: usize,
    /// Bounded wait for a sandbox slot before backpressure kicks in.
    pub queue_wait: Duration,
    /// Environment variable names allowed into the sandbox fingerprint.
    pub env_allowlist: Vec<String>,
    /// Project test suite configuration.
    pub plan: PlanConfig,
}

impl DaemonConfig {
    /// Captures the environment fingerprint for this configuration.
    ///
    /// The command set hash is left empty here; it is filled per request
    /// from the declared plan. Capture is read-only: files are hashed,
    /// the runtime is asked for its version, nothing is mutated.
    #[must_use]
    pub fn capture_fingerprint(&self) -> EnvironmentFingerprint {
        let image_digest = self
            .sandbox_dockerfile
            .as_deref()
            .filter(|path| path.is_file())
            .and_then(|path| sha256_file(path).ok())
            .unwrap_or_else(|| sha256_hex(self.sandbox_image.as_bytes()));

        let mut lockfile_hashes = BTreeMap::new();
        for lockfile in &self.lockfiles {
            match sha256_file(lockfile) {
                Ok(hash) => {
                    lockfile_hashes.insert(lockfile.display().to_string(), hash);
                },
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {},
                Err(err) => {
                    warn!(lockfile = %lockfile.display(), error = %err, "lockfile hash failed");
                },
            }
        }

        let mut toolchain_versions = BTreeMap::new();
        toolchain_versions.insert(
            "container-runtime".to_string(),
            runtime_version(&self.container_runtime),
        );
        if let Some(microvm) = &self.microvm_runtime {
            toolchain_versions.insert("microvm-runtime".to_string(), runtime_version(microvm));
        }

        EnvironmentFingerprint {
            image_digest,
            toolchain_versions,
            lockfile_hashes,
            command_set_hash: String::new(),
            env_allowlist_hash: EnvironmentFingerprint::hash_env_allowlist(&self.env_allowlist),
        }
    }

    /// Loads the persisted baseline fingerprint, creating it from
    /// `current` on first run.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the baseline cannot be read or written.
    pub fn load_or_init_baseline(
        &self,
        current: &EnvironmentFingerprint,
    ) -> std::io::Result<EnvironmentFingerprint> {
        if self.baseline_path.is_file() {
            let bytes = std::fs::read(&self.baseline_path)?;
            match serde_json::from_slice::<EnvironmentFingerprint>(&bytes) {
                Ok(baseline) => return Ok(baseline),
                Err(err) => {
                    warn!(
                        path = %self.baseline_path.display(),
                        error = %err,
                        "baseline fingerprint unreadable, re-initializing"
                    );
                },
            }
        }
        if let Some(parent) = self.baseline_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec_pretty(current)
            .map_err(|err| std::io::Error::other(err.to_string()))?;
        std::fs::write(&self.baseline_path, bytes)?;
        info!(path = %self.baseline_path.display(), "baseline fingerprint initialized");
        Ok(current.clone())
    }
}

/// First line of `<runtime> --version`, or `"unknown"`.
fn runtime_version(runtime: &str) -> String {
    std::process::Command::new(runtime)
        .arg("--version")
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| {
            String::from_utf8(output.stdout)
                .ok()
                .and_then(|text| text.lines().next().map(str::trim).map(String::from))
        })
        .unwrap_or_else(|| "unknown".to_string())
}

/// Loads the first `.env` file found from `start` upward into the
/// process environment. Existing variables are never overridden.
pub fn load_dotenv(start: &Path) {
    let Some(env_path) = find_env_file(start) else {
        return;
    };
    let Ok(contents) = std::fs::read_to_string(&env_path) else {
        return;
    };

    for raw_line in contents.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line).trim();
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() || std::env::var_os(key).is_some() {
            continue;
        }
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
            .unwrap_or(value);
        // Single-threaded startup only; see main().
        std::env::set_var(key, value);
    }
    info!(path = %env_path.display(), "loaded local environment file");
}

fn find_env_file(start: &Path) -> Option<PathBuf> {
    let mut dir = Some(start);
    while let Some(current) = dir {
        let candidate = current.join(".env");
        if candidate.is_file() {
            return Some(candidate);
        }
        dir = current.parent();
    }
    None
}
