use std::time::Duration;

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::task::{LogLevel, SqliteTaskStore, Task, TaskError, TaskFields, TaskStatus};

use super::context::{CollectionResult, TaskContext};
use super::error::{ExecutorError, ExecutorResult};

pub const PROGRESS_LOADING_LOGIN: i64 = 5;
pub const PROGRESS_LOGGING_IN: i64 = 10;
pub const PROGRESS_DOMAINS_START: i64 = 20;
pub const PROGRESS_FINISHING: i64 = 95;
pub const PROGRESS_DONE: i64 = 100;

/// Progress after `done` of `total` domains, spread over 20..=90.
pub fn domain_progress(done: usize, total: usize) -> i64 {
    if total == 0 {
        return PROGRESS_DOMAINS_START + 70;
    }
    PROGRESS_DOMAINS_START + (70 * done.min(total) / total) as i64
}

/// Writes a running task's progress through the guarded update, tracking the
/// row version it last wrote.
#[derive(Debug, Clone)]
pub struct TaskProgress {
    store: SqliteTaskStore,
    row_id: i64,
    task_id: String,
    version: i64,
}

impl TaskProgress {
    pub fn new(store: SqliteTaskStore, task: &Task) -> Self {
        Self {
            store,
            row_id: task.id,
            task_id: task.task_id.clone(),
            version: task.version,
        }
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn store(&self) -> &SqliteTaskStore {
        &self.store
    }

    pub fn report(&mut self, percent: i64, step: impl Into<String>) -> ExecutorResult<()> {
        let fields = TaskFields::default().progress(percent).current_step(step);
        self.write(TaskStatus::Running, &fields)
    }

    /// Persists the domain sets after each settled domain.
    pub fn persist_domains(
        &mut self,
        context: &TaskContext,
        percent: i64,
        step: impl Into<String>,
    ) -> ExecutorResult<()> {
        let fields = TaskFields::default()
            .progress(percent)
            .current_step(step)
            .domains(
                &context.collected_files,
                &context.completed_domains,
                &context.failed_domains,
            );
        self.write(TaskStatus::Running, &fields)
    }

    /// Fails with `TaskCancelled` once the row has been cancelled.
    pub fn ensure_not_cancelled(&mut self) -> ExecutorResult<()> {
        let row = self.store.get(self.row_id)?;
        if row.status == TaskStatus::Cancelled {
            return Err(ExecutorError::TaskCancelled(self.task_id.clone()));
        }
        Ok(())
    }

    pub fn log(&self, level: LogLevel, message: &str, details: Option<Value>) {
        if let Err(err) = self
            .store
            .append_log(self.row_id, level, message, details.as_ref())
        {
            warn!(task = %self.task_id, error = %err, "failed to append task log");
        }
    }

    /// On a version conflict the row is re-read: a cancellation surfaces as
    /// `TaskCancelled`, anything else gets one more attempt with the fresh
    /// version. A second failure is logged and swallowed.
    fn write(&mut self, status: TaskStatus, fields: &TaskFields) -> ExecutorResult<()> {
        match self.try_write(status, fields) {
            Ok(()) => Ok(()),
            Err(err) if err.is_conflict() => {
                let fresh = self.store.get(self.row_id)?;
                if fresh.status == TaskStatus::Cancelled {
                    return Err(ExecutorError::TaskCancelled(self.task_id.clone()));
                }
                self.version = fresh.version;
                match self.try_write(status, fields) {
                    Ok(()) => Ok(()),
                    Err(err) => {
                        warn!(
                            task = %self.task_id,
                            status = %status,
                            error = %err,
                            "progress write lost after re-read"
                        );
                        Ok(())
                    }
                }
            }
            Err(TaskError::InvalidTransition { from, .. }) if from == TaskStatus::Cancelled => {
                Err(ExecutorError::TaskCancelled(self.task_id.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn try_write(&mut self, status: TaskStatus, fields: &TaskFields) -> Result<(), TaskError> {
        self.version = self.store.update_status(
            self.row_id,
            status,
            Some(self.version),
            Some(TaskStatus::Running),
            fields,
        )?;
        Ok(())
    }

    /// Writes the final outcome of a run and builds its result. Verification
    /// pauses park the row as `paused`; cancellations leave the row untouched.
    pub fn conclude(
        &mut self,
        context: &mut TaskContext,
        outcome: ExecutorResult<()>,
        elapsed: Duration,
        failure_screenshot: Option<String>,
    ) -> ExecutorResult<CollectionResult> {
        let duration = elapsed.as_secs_f64();
        match self.finalize(context, outcome, duration, failure_screenshot) {
            Err(ExecutorError::TaskCancelled(_)) => {
                info!(task = %self.task_id, "task cancelled");
                Ok(CollectionResult::from_context(
                    context,
                    TaskStatus::Cancelled,
                    Some("task cancelled".into()),
                    duration,
                ))
            }
            other => other,
        }
    }

    fn finalize(
        &mut self,
        context: &mut TaskContext,
        outcome: ExecutorResult<()>,
        duration: f64,
        failure_screenshot: Option<String>,
    ) -> ExecutorResult<CollectionResult> {
        let total = context.total_domains();
        let base = TaskFields::default()
            .domains(
                &context.collected_files,
                &context.completed_domains,
                &context.failed_domains,
            )
            .duration_seconds(duration);

        let (status, message) = match outcome {
            Ok(()) => {
                self.report(PROGRESS_FINISHING, "finishing")?;
                let status = context.classify();
                let completed = context.completed_domains.len();
                let failed = context.failed_domains.len();
                let summary = match status {
                    TaskStatus::Failed => {
                        format!("collection failed: 0/{total} domains succeeded")
                    }
                    TaskStatus::PartialSuccess => format!(
                        "partial success: {completed}/{total} domains succeeded, {failed} failed"
                    ),
                    _ => format!(
                        "collection completed: {} files",
                        context.collected_files.len()
                    ),
                };
                let mut fields = base.progress(PROGRESS_DONE).current_step(summary.clone());
                if status != TaskStatus::Completed {
                    fields = fields.error_message(summary.clone());
                }
                self.write(status, &fields)?;
                let error = (status != TaskStatus::Completed).then_some(summary.clone());
                info!(
                    task = %self.task_id,
                    status = %status,
                    completed,
                    failed,
                    files = context.collected_files.len(),
                    "task finished"
                );
                self.log(LogLevel::Info, &summary, None);
                (status, error)
            }
            Err(ExecutorError::VerificationRequired {
                kind,
                screenshot_path,
            }) => {
                context.request_verification(&kind, screenshot_path.clone());
                let message = format!("verification required: {kind}");
                let fields = base
                    .current_step("waiting for verification")
                    .error_message(message.clone())
                    .verification(kind.clone(), screenshot_path.clone());
                self.write(TaskStatus::Paused, &fields)?;
                info!(task = %self.task_id, kind = %kind, "task paused for verification");
                self.log(
                    LogLevel::Warning,
                    &message,
                    Some(json!({ "screenshot_path": screenshot_path })),
                );
                (TaskStatus::Paused, Some(message))
            }
            Err(cancelled @ ExecutorError::TaskCancelled(_)) => return Err(cancelled),
            Err(err) => {
                let message = err.to_string();
                let fields = base
                    .current_step("failed")
                    .error_message(message.clone());
                warn!(task = %self.task_id, error = %message, "task failed");
                self.write(TaskStatus::Failed, &fields)?;
                self.log(
                    LogLevel::Error,
                    &message,
                    Some(json!({ "screenshot_path": failure_screenshot })),
                );
                (TaskStatus::Failed, Some(message))
            }
        };
        Ok(CollectionResult::from_context(
            context, status, message, duration,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_progress_spans_twenty_to_ninety() {
        assert_eq!(domain_progress(0, 4), 20);
        assert_eq!(domain_progress(2, 4), 55);
        assert_eq!(domain_progress(4, 4), 90);
        assert_eq!(domain_progress(0, 0), 90);
    }
}
