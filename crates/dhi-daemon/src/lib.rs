//! # dhi-daemon
//!
//! The Dhi control plane: a multi-request server in which each inbound
//! request is handled by an independent logical task running the linear
//! proof pipeline — governance, cloud generation, sandbox verification,
//! attestation, and the VEIL ledger gate.
//!
//! ## Modules
//!
//! - [`http`]: the axum surface (`/health`, `/verify`, `/intercept`,
//!   `/orchestrate`, `/manifest/{request_id}`)
//! - [`orchestrator`]: the bounded-retry circuit breaker and the request
//!   state machine
//! - [`sandbox`]: isolation backends, staging, command plans, and the
//!   executor — the only component permitted to issue execution
//! - [`gateway`]: outbound LLM access over OpenAI-compatible APIs
//! - [`ledger`]: the `SQLite` VEIL store behind a single writer task
//! - [`manifest_store`]: the append-only, file-backed manifest store
//! - [`config`] / [`state`]: injected configuration and process-wide
//!   shared state

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod gateway;
pub mod http;
pub mod ledger;
pub mod manifest_store;
pub mod orchestrator;
pub mod sandbox;
pub mod state;

pub use config::DaemonConfig;
pub use state::{AppState, SharedState};
