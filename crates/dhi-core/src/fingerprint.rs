//! Environment fingerprint for the determinism gate.
//!
//! A fingerprint is a deterministic snapshot of everything that could
//! make a run irreproducible: the sandbox image, the toolchain, the
//! dependency lockfiles, the executed command set, and the names (never
//! the values) of the allowed environment variables. Two runs with equal
//! fingerprints executed the same plan in the same environment.
//!
//! Computation is pure: the same inputs always hash to the same
//! `fingerprint_hash`, and nothing here mutates state. Canonicalization
//! sorts map keys lexicographically and serializes them as `key=value`
//! lines, so insertion order never leaks into the hash.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::verification::CommandSpec;

/// Domain separator between fingerprint fields, so that moving bytes
/// between adjacent fields can never produce the same hash.
const FIELD_SEPARATOR: &[u8] = b"\x1f";

/// Computes the lowercase hex SHA-256 of a byte slice.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Computes the SHA-256 of a file's contents, streaming.
///
/// # Errors
///
/// Returns the underlying I/O error when the file cannot be read.
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn canonical(map: &BTreeMap<String, String>) -> String {
    // BTreeMap iterates in lexicographic key order.
    map.iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Deterministic snapshot of the environment that produced a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentFingerprint {
    /// Digest of the sandbox runtime image.
    pub image_digest: String,
    /// Tool name to version string, canonically ordered.
    pub toolchain_versions: BTreeMap<String, String>,
    /// Lockfile path to content hash, canonically ordered.
    pub lockfile_hashes: BTreeMap<String, String>,
    /// Hash of the declared command plan for this request class.
    pub command_set_hash: String,
    /// Hash of the sorted allowed environment variable names.
    pub env_allowlist_hash: String,
}

impl EnvironmentFingerprint {
    /// Computes the single collision-resistant hash over all fields.
    #[must_use]
    pub fn fingerprint_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.image_digest.as_bytes());
        hasher.update(FIELD_SEPARATOR);
        hasher.update(canonical(&self.toolchain_versions).as_bytes());
        hasher.update(FIELD_SEPARATOR);
        hasher.update(canonical(&self.lockfile_hashes).as_bytes());
        hasher.update(FIELD_SEPARATOR);
        hasher.update(self.command_set_hash.as_bytes());
        hasher.update(FIELD_SEPARATOR);
        hasher.update(self.env_allowlist_hash.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Returns `true` when both fingerprints hash identically.
    #[must_use]
    pub fn matches(&self, baseline: &Self) -> bool {
        self.fingerprint_hash() == baseline.fingerprint_hash()
    }

    /// Hashes a declared command plan: name and argv of every command,
    /// in plan order.
    #[must_use]
    pub fn hash_command_set(plan: &[CommandSpec]) -> String {
        let blob = plan
            .iter()
            .map(|spec| format!("{} {}", spec.name, spec.argv.join(" ")))
            .collect::<Vec<_>>()
            .join("\n");
        sha256_hex(blob.as_bytes())
    }

    /// Hashes the names of the allowed environment variables.
    ///
    /// Only names are hashed; values may contain secrets and must never
    /// enter the fingerprint.
    #[must_use]
    pub fn hash_env_allowlist<S: AsRef<str>>(names: &[S]) -> String {
        let mut sorted: Vec<&str> = names.iter().map(AsRef::as_ref).collect();
        sorted.sort_unstable();
        sha256_hex(sorted.join("\n").as_bytes())
    }
}
