//! Per-mode sandbox resource limit tables.
//!
//! Limits are enforced by the container/microVM runtime, not by the
//! executor process; the executor only constructs the enforcement flags
//! and supervises the per-command and per-request clocks. Per-request
//! overrides of any value here are never accepted.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::result::VerificationMode;

/// Hard resource caps applied to one verification run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Per-command wall-clock timeout.
    pub command_timeout: Duration,
    /// Per-request verification budget across all commands and attempts
    /// of a single attempt's plan.
    pub request_budget: Duration,
    /// CPU quota in milli-vCPUs (2000 = 2 vCPU).
    pub cpu_milli: u32,
    /// Memory cap in bytes.
    pub memory_bytes: u64,
    /// Maximum number of processes/threads.
    pub max_processes: u32,
    /// Combined stdout+stderr cap in bytes.
    pub output_cap_bytes: u64,
    /// Scratch tmpfs size cap in bytes.
    pub scratch_cap_bytes: u64,
}

impl ResourceLimits {
    /// Limits for the balanced (rootless container) profile.
    #[must_use]
    pub const fn balanced() -> Self {
        Self {
            command_timeout: Duration::from_secs(45),
            request_budget: Duration::from_secs(180),
            cpu_milli: 2_000,
            memory_bytes: 1024 * 1024 * 1024,
            max_processes: 256,
            output_cap_bytes: 10 * 1024 * 1024,
            scratch_cap_bytes: 512 * 1024 * 1024,
        }
    }

    /// Limits for the strict (microVM) profile.
    #[must_use]
    pub const fn strict() -> Self {
        Self {
            command_timeout: Duration::from_secs(60),
            request_budget: Duration::from_secs(240),
            cpu_milli: 2_000,
            memory_bytes: 1536 * 1024 * 1024,
            max_processes: 128,
            output_cap_bytes: 10 * 1024 * 1024,
            scratch_cap_bytes: 512 * 1024 * 1024,
        }
    }

    /// The limit table for a mode. Fast shares the balanced profile; only
    /// its command plan differs.
    #[must_use]
    pub const fn for_mode(mode: VerificationMode) -> Self {
        match mode {
            VerificationMode::Fast | VerificationMode::Balanced => Self::balanced(),
            VerificationMode::Strict => Self::strict(),
        }
    }
}
