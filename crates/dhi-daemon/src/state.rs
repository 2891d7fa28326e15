//! Shared daemon state.
//!
//! One instance lives for the daemon's lifetime and is shared across
//! request handlers behind an `Arc`. Per-request state never lives here:
//! each handler owns its own pipeline, and the only shared mutable
//! resource — the ledger — is reached through the single-writer handle.

use std::sync::Arc;

use dhi_core::fingerprint::EnvironmentFingerprint;
use dhi_core::gate::DeterminismGate;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::config::DaemonConfig;
use crate::gateway::HttpGateway;
use crate::ledger::LedgerHandle;
use crate::manifest_store::ManifestStore;
use crate::orchestrator::Orchestrator;
use crate::sandbox::SandboxExecutor;

/// Raised when the sandbox concurrency cap held a request past its
/// bounded queue wait. Not retryable by the client-facing breaker.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("sandbox capacity exhausted; request timed out waiting for a slot")]
pub struct BackpressureError;

/// Process-wide daemon state.
#[derive(Debug)]
pub struct AppState {
    /// Injected configuration.
    pub config: DaemonConfig,
    /// LLM gateway client.
    pub gateway: HttpGateway,
    /// The sandbox executor.
    pub executor: SandboxExecutor,
    /// Single-writer ledger handle.
    pub ledger: LedgerHandle,
    /// Append-only manifest store.
    pub manifests: ManifestStore,
    /// Determinism gate bound to the persisted project baseline.
    pub gate: DeterminismGate,
    /// Startup-captured fingerprint (plan hash filled per request).
    pub fingerprint: EnvironmentFingerprint,
    /// Global kill switch; cancelling it stops every live pipeline.
    pub shutdown: CancellationToken,
    sandbox_slots: Arc<Semaphore>,
}

/// Shared handle to the daemon state.
pub type SharedState = Arc<AppState>;

impl AppState {
    /// Assembles the daemon state from its collaborators.
    #[must_use]
    pub fn new(
        config: DaemonConfig,
        gateway: HttpGateway,
        executor: SandboxExecutor,
        ledger: LedgerHandle,
        manifests: ManifestStore,
        gate: DeterminismGate,
        fingerprint: EnvironmentFingerprint,
    ) -> Self {
        let sandbox_slots = Arc::new(Semaphore::new(config.max_sandboxes.max(1)));
        Self {
            config,
            gateway,
            executor,
            ledger,
            manifests,
            gate,
            fingerprint,
            shutdown: CancellationToken::new(),
            sandbox_slots,
        }
    }

    /// Acquires a live-sandbox slot, waiting at most the configured
    /// bounded queue time.
    ///
    /// # Errors
    ///
    /// Returns [`BackpressureError`] once the wait expires.
    pub async fn acquire_sandbox_slot(&self) -> Result<OwnedSemaphorePermit, BackpressureError> {
        let acquire = Arc::clone(&self.sandbox_slots).acquire_owned();
        match tokio::time::timeout(self.config.queue_wait, acquire).await {
            Ok(Ok(permit)) => Ok(permit),
            // Closed semaphore or expired wait both mean no capacity.
            Ok(Err(_)) | Err(_) => Err(BackpressureError),
        }
    }

    /// Builds the per-request circuit breaker over this state.
    #[must_use]
    pub fn orchestrator(&self) -> Orchestrator<'_, HttpGateway, SandboxExecutor> {
        Orchestrator {
            gateway: &self.gateway,
            verifier: &self.executor,
            ledger: &self.ledger,
            manifests: &self.manifests,
            gate: &self.gate,
            fingerprint_template: &self.fingerprint,
            plan_config: &self.config.plan,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn bounded_wait_yields_backpressure_error() {
        let slots = Arc::new(Semaphore::new(1));
        let _held = Arc::clone(&slots).acquire_owned().await.unwrap();

        let acquire = Arc::clone(&slots).acquire_owned();
        let result = tokio::time::timeout(Duration::from_millis(20), acquire).await;
        assert!(result.is_err(), "second acquire should time out");
    }
}
