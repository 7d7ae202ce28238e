use rusqlite::Error as RusqliteError;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IndexWatchError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    #[error("Database error: {0}")]
    DatabaseError(#[from] RusqliteError),

    #[error("Connection pool error: {0}")]
    PoolError(#[from] r2d2::Error),

    #[error("Logger error: {0}")]
    LoggerError(#[from] flexi_logger::FlexiLoggerError),

    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("Schedule {0} not found")]
    ScheduleNotFound(String),

    #[error("Project {0} not found")]
    ProjectNotFound(String),

    #[error("Failed to watch '{path}': {reason}")]
    WatchError { path: String, reason: String },

    #[error("Indexing failed for '{path}' (project {project_id}): {reason}")]
    Indexing {
        path: String,
        project_id: String,
        reason: String,
    },

    #[error("Scheduler is shutting down")]
    ShuttingDown,

    #[error("Error: {0}")]
    Error(String), // Allows custom application errors
}

impl IndexWatchError {
    pub fn invalid_cron(expression: &str, reason: impl Into<String>) -> Self {
        IndexWatchError::InvalidCron {
            expression: expression.to_string(),
            reason: reason.into(),
        }
    }
}
