use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::error::TaskResult;
use super::models::{LogLevel, Task, TaskFields, TaskStatus};
use super::store::{ClaimOutcome, SqliteTaskStore};

/// Notified whenever admission moves a task into `running`.
#[async_trait]
pub trait TaskReady: Send + Sync {
    async fn ready(&self, task: Task);
}

#[derive(Debug, Clone)]
pub enum EnqueueOutcome {
    Started(Task),
    Queued(Task),
}

impl EnqueueOutcome {
    pub fn task(&self) -> &Task {
        match self {
            EnqueueOutcome::Started(task) | EnqueueOutcome::Queued(task) => task,
        }
    }
}

/// Concurrency-limited admission on top of the task store. The running count
/// is never cached: every claim re-evaluates it inside the guarded update.
#[derive(Clone)]
pub struct TaskQueue {
    store: SqliteTaskStore,
    max_concurrent: usize,
    scan_limit: usize,
    on_ready: Option<Arc<dyn TaskReady>>,
}

impl TaskQueue {
    pub fn new(store: SqliteTaskStore, max_concurrent: usize, scan_limit: usize) -> Self {
        Self {
            store,
            max_concurrent: max_concurrent.max(1),
            scan_limit: scan_limit.max(1),
            on_ready: None,
        }
    }

    pub fn with_ready_callback(mut self, callback: Arc<dyn TaskReady>) -> Self {
        self.on_ready = Some(callback);
        self
    }

    pub fn store(&self) -> &SqliteTaskStore {
        &self.store
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub async fn enqueue(&self, task: &Task) -> TaskResult<EnqueueOutcome> {
        if self
            .store
            .has_account_conflict(&task.account_id, &task.platform, task.id)?
        {
            info!(
                task = %task.task_id,
                account = %task.account_id,
                "account busy, queueing task"
            );
            return self.park(task, "waiting for account").await;
        }
        match self
            .store
            .claim_running(task.id, task.version, task.status, self.max_concurrent)?
        {
            ClaimOutcome::Claimed { .. } => {
                let started = self.store.get(task.id)?;
                info!(task = %started.task_id, "task admitted");
                self.notify(started.clone()).await;
                Ok(EnqueueOutcome::Started(started))
            }
            ClaimOutcome::AccountBusy => self.park(task, "waiting for account").await,
            ClaimOutcome::AtCapacity => {
                debug!(task = %task.task_id, limit = self.max_concurrent, "at capacity");
                self.park(task, "waiting for a free slot").await
            }
        }
    }

    async fn park(&self, task: &Task, reason: &str) -> TaskResult<EnqueueOutcome> {
        self.store.update_status(
            task.id,
            TaskStatus::Queued,
            Some(task.version),
            Some(task.status),
            &TaskFields::default().current_step(reason),
        )?;
        self.store
            .append_log(task.id, LogLevel::Info, reason, None)?;
        Ok(EnqueueOutcome::Queued(self.store.get(task.id)?))
    }

    /// Claims the oldest queued task that can run now, skipping candidates
    /// another actor grabbed first or whose account is busy.
    pub async fn try_start_next_queued(&self) -> TaskResult<Option<Task>> {
        if self.store.running_count()? >= self.max_concurrent as i64 {
            return Ok(None);
        }
        for candidate in self.store.queued(self.scan_limit)? {
            match self.store.claim_running(
                candidate.id,
                candidate.version,
                TaskStatus::Queued,
                self.max_concurrent,
            ) {
                Ok(ClaimOutcome::Claimed { .. }) => {
                    let claimed = self.store.get(candidate.id)?;
                    info!(task = %claimed.task_id, "queued task admitted");
                    return Ok(Some(claimed));
                }
                Ok(ClaimOutcome::AccountBusy) => {
                    debug!(task = %candidate.task_id, "account busy, trying next candidate");
                }
                Ok(ClaimOutcome::AtCapacity) => return Ok(None),
                Err(err) if err.is_conflict() => {
                    debug!(task = %candidate.task_id, error = %err, "candidate claimed elsewhere");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }

    pub async fn on_task_complete(&self, task_row_id: i64) -> TaskResult<Option<Task>> {
        debug!(task_row_id, "task finished, checking queue");
        let next = self.try_start_next_queued().await?;
        if let Some(task) = &next {
            self.notify(task.clone()).await;
        }
        Ok(next)
    }

    pub fn recover_on_start(&self) -> TaskResult<usize> {
        let count = self.store.mark_interrupted_on_restart()?;
        if count > 0 {
            warn!(count, "marked orphaned running tasks as interrupted");
        }
        Ok(count)
    }

    async fn notify(&self, task: Task) {
        if let Some(callback) = &self.on_ready {
            callback.ready(task).await;
        }
    }
}
