//! VEIL ledger event model.
//!
//! The ledger is the only memory surface of the system. Two persistence
//! classes exist: *telemetry* events are written for every run;
//! *behavioral* events are written only when the determinism gate
//! reported the run reproducible, and are the sole inputs the memory
//! system is permitted to learn from. The write path lives in the
//! daemon; this module owns the record shape and the eligibility rule.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::verification::FailureClass;

/// Direction of the signal a ledger event carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalType {
    /// The request ended verified.
    Success,
    /// The request ended failed.
    Failure,
}

impl std::fmt::Display for SignalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
        }
    }
}

/// Persistence class of a ledger event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceClass {
    /// Always written; never used for learning.
    Telemetry,
    /// Written only behind the determinism gate; feeds memory.
    Behavioral,
}

impl std::fmt::Display for PersistenceClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Telemetry => write!(f, "telemetry"),
            Self::Behavioral => write!(f, "behavioral"),
        }
    }
}

/// One persisted ledger record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEvent {
    /// Globally unique event id.
    pub event_id: String,
    /// Request this event belongs to.
    pub request_id: String,
    /// Fingerprint hash of the environment that produced the run.
    pub fingerprint_hash: String,
    /// Whether the determinism gate reported the run reproducible.
    pub reproducible: bool,
    /// Persistence class of this record.
    pub class: PersistenceClass,
    /// Success or failure signal.
    pub signal_type: SignalType,
    /// Terminal failure class, when the signal is a failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_class: Option<FailureClass>,
    /// Attempts consumed by the request.
    pub attempt_count: u32,
    /// Short human-readable summary (gate reason, terminal cause).
    pub summary: String,
    /// UTC creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl LedgerEvent {
    /// Creates an event with a fresh `event_id`.
    #[must_use]
    pub fn new(
        request_id: impl Into<String>,
        fingerprint_hash: impl Into<String>,
        reproducible: bool,
        class: PersistenceClass,
        signal_type: SignalType,
        failure_class: Option<FailureClass>,
        attempt_count: u32,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            event_id: format!("evt-{}", uuid::Uuid::new_v4()),
            request_id: request_id.into(),
            fingerprint_hash: fingerprint_hash.into(),
            reproducible,
            class,
            signal_type,
            failure_class,
            attempt_count,
            summary: summary.into(),
            created_at: Utc::now(),
        }
    }

    /// Checks the behavioral eligibility invariant: a behavioral event
    /// must be reproducible and must not carry a noise class.
    #[must_use]
    pub fn behavioral_write_permitted(&self) -> bool {
        match self.class {
            PersistenceClass::Telemetry => true,
            PersistenceClass::Behavioral => {
                self.reproducible && !self.failure_class.is_some_and(FailureClass::is_noise)
            },
        }
    }
}
