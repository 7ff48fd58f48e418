//! Core safe-apply functionality
//!
//! This module contains the pieces that apply a pf ruleset without risking a
//! remote lock-out:
//!
//! - [`filter`]: Primitive operations against the live packet filter
//! - [`store`]: Ruleset locations, backup and atomic promotion
//! - [`scheduler`]: Rollback job scheduling through `at`
//! - [`coordinator`]: The apply / confirm state machine
//! - [`verify`]: Dry-run validation with `pfctl -n`
//! - [`runner`]: External command execution
//! - [`diff`]: Ruleset diffs for review before applying
//! - [`error`]: Error types for all of the above

pub mod coordinator;
pub mod diff;
pub mod error;
pub mod filter;
pub mod runner;
pub mod scheduler;
pub mod store;
pub mod verify;

#[cfg(test)]
pub mod test_helpers;
