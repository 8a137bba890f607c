//! Core orchestration primitives for in-place cluster upgrades.
//!
//! This crate holds the pieces that both the per-host agent and the hub
//! depend on: the idempotent data-directory swap, the fan-out executor that
//! never stops at the first failure, the step/substep progress record, and
//! the fault injection handle used to exercise crash/resume paths in tests.
//! It performs local filesystem work only; all networking lives in the
//! agent and hub crates.

pub mod datadir;
pub mod error;
pub mod fanout;
pub mod faults;
pub mod fs;
pub mod status;
pub mod step;
pub mod upgrade_id;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::{AggregateError, ItemError};
pub use faults::FaultInjector;
pub use fs::{DirOps, LocalFs};
pub use upgrade_id::UpgradeId;
