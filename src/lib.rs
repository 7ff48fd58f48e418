//! pfguard - safe apply for pf rulesets
//!
//! Loads a candidate ruleset, arms an `at` job that reloads the known-good
//! rules after a delay, and promotes the candidate only when the operator
//! confirms in time. A ruleset that cuts off the operator's own session
//! therefore reverts by itself.
//!
//! # Architecture
//!
//! - [`core`] - Filter control, rule store, rollback scheduling and the apply/confirm state machine
//! - [`audit`] - Audit logging for all privileged operations
//! - [`validators`] - Validation of values embedded in scheduled jobs
//! - [`config`] - Settings persistence
//! - [`elevation`] - doas/sudo wrapping of privileged commands
//! - [`utils`] - Utility functions (XDG directories, etc.)

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod config;
pub mod core;
pub mod elevation;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use core::coordinator::{ApplyOutcome, ConfirmOutcome, Coordinator, Phase, SafeApplyConfig};
pub use core::error::{Error, Result};
pub use core::store::RulesetLocation;
