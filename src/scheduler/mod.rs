//! Run scheduling.
//!
//! Runs are long (tens of minutes, dominated by external jobs), so callers
//! never wait on them directly. [`RunScheduler`] records a run, hands back a
//! [`RunHandle`] carrying its id, and executes it in the background with a
//! cap on how many runs are in flight at once.

pub mod run_scheduler;

pub use run_scheduler::{RunHandle, RunScheduler, SchedulerError, SchedulerStats};
