//! Scoped staging workspace and durable artifact directory.
//!
//! The staging directory holds the candidate source that gets bind-mounted
//! read-only into the sandbox; it is removed on every exit path (success,
//! failure, cancellation, panic) via `Drop`. The artifact directory is the
//! opposite: durable, per-request, and survives teardown so the manifest
//! can reference execution evidence by path.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use thiserror::Error;

/// Filename the candidate is staged under.
pub const CANDIDATE_FILENAME: &str = "candidate.py";

/// Errors while staging a workspace or persisting artifacts.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WorkspaceError {
    /// Staging directory could not be created or written.
    #[error("failed to stage candidate workspace: {0}")]
    Stage(#[source] std::io::Error),

    /// Artifact directory could not be created or written.
    #[error("failed to persist artifact: {0}")]
    Artifact(#[source] std::io::Error),
}

/// A staged candidate workspace. The temporary directory and everything
/// in it are removed when this guard drops.
#[derive(Debug)]
pub struct StagedWorkspace {
    dir: TempDir,
    candidate_path: PathBuf,
}

impl StagedWorkspace {
    /// Stages candidate code into a fresh temporary directory.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError::Stage`] when the directory or candidate
    /// file cannot be created.
    pub fn stage(code: &str) -> Result<Self, WorkspaceError> {
        let dir = tempfile::Builder::new()
            .prefix("dhi-src-")
            .tempdir()
            .map_err(WorkspaceError::Stage)?;
        let candidate_path = dir.path().join(CANDIDATE_FILENAME);
        let mut file = fs::File::create(&candidate_path).map_err(WorkspaceError::Stage)?;
        file.write_all(code.as_bytes()).map_err(WorkspaceError::Stage)?;
        Ok(Self { dir, candidate_path })
    }

    /// Host path of the staging directory (bind-mount source).
    #[must_use]
    pub fn source_dir(&self) -> &Path {
        self.dir.path()
    }

    /// Host path of the staged candidate file.
    #[must_use]
    pub fn candidate_path(&self) -> &Path {
        &self.candidate_path
    }
}

/// Durable per-request, per-attempt artifact directory.
#[derive(Debug)]
pub struct ArtifactDir {
    root: PathBuf,
}

impl ArtifactDir {
    /// Creates (or reuses) the artifact directory for one attempt.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError::Artifact`] when creation fails.
    pub fn create(artifact_root: &Path, request_id: &str, attempt: u32) -> Result<Self, WorkspaceError> {
        // Request ids come from clients; never let them escape the root.
        let safe_id: String = request_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        let root = artifact_root.join(safe_id).join(format!("attempt-{attempt}"));
        fs::create_dir_all(&root).map_err(WorkspaceError::Artifact)?;
        Ok(Self { root })
    }

    /// Writes one artifact file and returns its path.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError::Artifact`] when the write fails.
    pub fn write(&self, name: &str, contents: &[u8]) -> Result<PathBuf, WorkspaceError> {
        let path = self.root.join(name);
        fs::write(&path, contents).map_err(WorkspaceError::Artifact)?;
        Ok(path)
    }

    /// The directory artifacts land in.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staged_workspace_is_removed_on_drop() {
        let staged = StagedWorkspace::stage("print(1)").unwrap();
        let dir = staged.source_dir().to_path_buf();
        assert!(staged.candidate_path().is_file());
        assert_eq!(fs::read_to_string(staged.candidate_path()).unwrap(), "print(1)");
        drop(staged);
        assert!(!dir.exists());
    }

    #[test]
    fn artifact_dir_survives_guard_drop() {
        let root = tempfile::tempdir().unwrap();
        let path = {
            let artifacts = ArtifactDir::create(root.path(), "req-1", 1).unwrap();
            artifacts.write("stdout.log", b"hello").unwrap()
        };
        assert!(path.is_file());
        assert_eq!(fs::read_to_string(path).unwrap(), "hello");
    }

    #[test]
    fn hostile_request_ids_cannot_escape_the_root() {
        let root = tempfile::tempdir().unwrap();
        let artifacts = ArtifactDir::create(root.path(), "../../evil", 1).unwrap();
        assert!(artifacts.path().starts_with(root.path()));
    }
}
