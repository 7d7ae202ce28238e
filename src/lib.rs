//! Scheduled and reactive indexing for project document sets.
//!
//! A [`SchedulerService`] keeps one cron timer per enabled schedule and one
//! filesystem watcher per distinct watched path. Both trigger sources go through
//! a [`RunCoordinator`], which runs the [`IndexingPipeline`] at most once at a
//! time per (project, path) and records `last_run` on success.

pub mod cli;
pub mod config;
pub mod database;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod projects;
pub mod run_coordinator;
pub mod scheduler;
pub mod schedules;
pub mod schema;

#[cfg(test)]
mod test_support;

pub use database::Database;
pub use dispatch::{CronDispatcher, CronExpr, WatchDispatcher};
pub use error::IndexWatchError;
pub use pipeline::{DryRunPipeline, IndexingPipeline};
pub use projects::Project;
pub use run_coordinator::{RunCoordinator, RunOutcome, RunStats, TriggerSource};
pub use scheduler::{ScheduleState, SchedulerService, SchedulerSettings};
pub use schedules::{Schedule, ScheduleSpec};
