//! Verification contract types and deterministic classification.
//!
//! This module owns the canonical sandbox contract: the
//! [`VerificationResult`] payload every execution must produce, the closed
//! sum types for failure classes and violation events, the per-mode
//! resource limit tables, the raw-signal failure classifier, and the
//! evidence-based verification tier mapper.
//!
//! # Invariants
//!
//! - A result with `status = pass` carries no failure class and a concrete
//!   tier; a result with `status = fail` always carries a failure class.
//! - Tier claims are derived only from executed-command evidence; a check
//!   that did not run cannot contribute to a tier.
//! - Classification is a total function over the closed sums: every
//!   execution outcome maps to exactly one failure class.

pub mod classifier;
pub mod limits;
pub mod result;
pub mod tier;

pub use classifier::{AttemptHistory, Classification, classify_run, sniff_violation};
pub use limits::ResourceLimits;
pub use result::{
    Authorship, CheckKind, CommandRecord, CommandSpec, FailureClass, SkippedCheck,
    VerificationMode, VerificationResult, VerificationStatus, VerificationTier, ViolationEvent,
};
pub use tier::assign_tier;
