//! File-backed, append-only attestation manifest store.
//!
//! Manifests are keyed by `request_id` and immutable once emitted: the
//! store is first-write-wins, and a second write for the same request is
//! a typed error rather than a silent replace. Writes go through a
//! temporary file and an atomic no-clobber rename so a crashed daemon
//! can never leave a half-written manifest behind.

use std::path::{Path, PathBuf};

use dhi_core::manifest::AttestationManifest;
use thiserror::Error;

/// Errors from the manifest store.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ManifestStoreError {
    /// A manifest for this request already exists.
    #[error("manifest for request '{request_id}' already exists; manifests are immutable")]
    AlreadyExists {
        /// The request whose manifest was re-emitted.
        request_id: String,
    },

    /// Filesystem failure.
    #[error("manifest store I/O failure: {0}")]
    Io(#[from] std::io::Error),

    /// Stored bytes did not parse back into a manifest.
    #[error("stored manifest for request '{request_id}' is corrupt: {message}")]
    Corrupt {
        /// The affected request.
        request_id: String,
        /// Parse failure detail.
        message: String,
    },
}

/// Append-only manifest store rooted at a directory.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    root: PathBuf,
}

impl ManifestStore {
    /// Opens (creating if needed) a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the root cannot be created.
    pub fn open(root: &Path) -> Result<Self, ManifestStoreError> {
        std::fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn path_for(&self, request_id: &str) -> PathBuf {
        // Request ids come from clients; keep them inside the root.
        let safe_id: String = request_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.root.join(format!("{safe_id}.json"))
    }

    /// Persists a manifest, first write wins.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestStoreError::AlreadyExists`] on re-emission, or
    /// an I/O error when the write fails.
    pub fn store(&self, manifest: &AttestationManifest) -> Result<PathBuf, ManifestStoreError> {
        let path = self.path_for(&manifest.request_id);
        if path.exists() {
            return Err(ManifestStoreError::AlreadyExists {
                request_id: manifest.request_id.clone(),
            });
        }

        let bytes = serde_json::to_vec_pretty(manifest).map_err(|err| ManifestStoreError::Corrupt {
            request_id: manifest.request_id.clone(),
            message: err.to_string(),
        })?;

        let tmp = tempfile::NamedTempFile::new_in(&self.root)?;
        std::fs::write(tmp.path(), &bytes)?;
        tmp.persist_noclobber(&path).map_err(|err| {
            if err.error.kind() == std::io::ErrorKind::AlreadyExists {
                ManifestStoreError::AlreadyExists {
                    request_id: manifest.request_id.clone(),
                }
            } else {
                ManifestStoreError::Io(err.error)
            }
        })?;
        Ok(path)
    }

    /// Loads the manifest for a request, if one was emitted.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestStoreError::Corrupt`] when stored bytes do not
    /// parse, or an I/O error on read failure.
    pub fn load(&self, request_id: &str) -> Result<Option<AttestationManifest>, ManifestStoreError> {
        let path = self.path_for(request_id);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&path)?;
        let manifest =
            serde_json::from_slice(&bytes).map_err(|err| ManifestStoreError::Corrupt {
                request_id: request_id.to_string(),
                message: err.to_string(),
            })?;
        Ok(Some(manifest))
    }
}
