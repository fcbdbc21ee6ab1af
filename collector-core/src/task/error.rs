use std::io;
use std::path::PathBuf;

use thiserror::Error;

use super::models::TaskStatus;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("failed to open task database {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("failed to execute statement on task database: {0}")]
    Execute(#[from] rusqlite::Error),
    #[error("task database path not configured")]
    MissingStore,
    #[error("invalid task status: {0}")]
    InvalidStatus(String),
    #[error("task not found: {0}")]
    NotFound(i64),
    #[error("task {id} version mismatch: expected {expected}, found {actual}")]
    OptimisticLock { id: i64, expected: i64, actual: i64 },
    #[error("task {id} status conflict: expected {expected}, found {actual}")]
    StatusConflict {
        id: i64,
        expected: TaskStatus,
        actual: TaskStatus,
    },
    #[error("task {id} cannot transition from {from} to {to}")]
    InvalidTransition {
        id: i64,
        from: TaskStatus,
        to: TaskStatus,
    },
    #[error("failed to encode task field: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl TaskError {
    /// Another writer changed the row between our read and our write.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            TaskError::OptimisticLock { .. } | TaskError::StatusConflict { .. }
        )
    }
}

pub type TaskResult<T> = Result<T, TaskError>;
