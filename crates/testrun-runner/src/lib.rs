//! testrun run coordination.
//!
//! This crate turns a list of test files into a finished run:
//! - [`coordinator`]: dispatch with bounded concurrency, fail-fast and interruption
//! - [`timeout`]: the global inactivity watchdog
//! - [`scheduler`]: running previously failing files first
//! - [`shard`]: splitting the file list across CI machines
//! - [`run_status`]: the aggregated outcome and exit code

pub mod config;
pub mod coordinator;
pub mod error;
pub mod run_status;
pub mod scheduler;
pub mod shard;
pub mod timeout;

pub use config::{RunConfig, SHARD_INDEX_ENV, SHARD_TOTAL_ENV};
pub use coordinator::Coordinator;
pub use error::RunError;
pub use run_status::{FileStats, RunStats, RunStatus};
pub use scheduler::{SchedulerCache, FAILING_TESTS_FILE};
pub use shard::{natural_cmp, select_shard, FileOrder};
pub use timeout::TimeoutTrigger;
