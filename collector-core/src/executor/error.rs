use std::io;

use thiserror::Error;

use crate::browser::BrowserError;
use crate::component::ComponentError;
use crate::task::TaskError;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("step {index} ({label}) failed: {reason}")]
    StepExecution {
        index: usize,
        label: String,
        reason: String,
    },
    #[error("verification required ({kind})")]
    VerificationRequired {
        kind: String,
        screenshot_path: Option<String>,
    },
    #[error("task {0} was cancelled")]
    TaskCancelled(String),
    #[error("no selector matched: {}", .attempts.join("; "))]
    SelectorsExhausted { attempts: Vec<String> },
    #[error("{primary}; fallbacks failed: {}", .failures.join("; "))]
    FallbacksExhausted {
        primary: String,
        failures: Vec<String>,
    },
    #[error("timed out after {elapsed_ms}ms waiting for {selector}")]
    WaitTimeout { selector: String, elapsed_ms: u64 },
    #[error("success criteria not met for {component}: {reason}")]
    CriteriaFailed { component: String, reason: String },
    #[error("{component} aborted by error handler: {message}")]
    HandlerAbort { component: String, message: String },
    #[error("pre-check failed for {component}: {reason}")]
    PreCheckFailed { component: String, reason: String },
    #[error("component nesting deeper than {0}")]
    DepthExceeded(usize),
    #[error("account {account_id} is not configured for {platform}")]
    UnknownAccount {
        platform: String,
        account_id: String,
    },
    #[error("task {task_id} cannot resume now: {reason}")]
    ResumeBlocked { task_id: String, reason: String },
    #[error(transparent)]
    Component(#[from] ComponentError),
    #[error(transparent)]
    Browser(#[from] BrowserError),
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl ExecutorError {
    /// Errors that must stop the current run instead of being retried or
    /// downgraded to a failed domain.
    pub fn is_interrupt(&self) -> bool {
        matches!(
            self,
            ExecutorError::VerificationRequired { .. } | ExecutorError::TaskCancelled(_)
        )
    }

    pub fn is_component_missing(&self) -> bool {
        matches!(self, ExecutorError::Component(err) if err.is_not_found())
    }
}

pub type ExecutorResult<T> = Result<T, ExecutorError>;
