use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::json;
use tracing::{error, info, warn};

use crate::account::AccountResolver;
use crate::browser::{BrowserSession, ContextOptions, PopupDismisser, SessionDetector};
use crate::component::{ComponentStore, VersionSelector};
use crate::config::CollectorConfig;
use crate::task::{
    ClaimOutcome, EnqueueOutcome, LogLevel, SqliteTaskStore, Task, TaskError, TaskFilter,
    TaskQueue, TaskStatus,
};

use super::context::{CollectionResult, TaskContext};
use super::domain::DomainIterator;
use super::error::{ExecutorError, ExecutorResult};
use super::parallel::ParallelDomainRunner;
use super::progress::TaskProgress;
use super::step::StepExecutor;

/// Everything a worker talks to besides its configuration.
#[derive(Clone)]
pub struct Collaborators {
    pub store: SqliteTaskStore,
    pub components: Arc<dyn ComponentStore>,
    pub versions: Arc<dyn VersionSelector>,
    pub popups: Arc<dyn PopupDismisser>,
    pub sessions: Arc<dyn SessionDetector>,
    pub accounts: Arc<dyn AccountResolver>,
    pub browser: Arc<dyn BrowserSession>,
}

/// Drives admitted tasks to a final status. Futures here are not `Send`; run
/// the worker on a current-thread runtime or inside a `LocalSet`.
pub struct CollectionWorker {
    config: CollectorConfig,
    collaborators: Collaborators,
    steps: StepExecutor,
    queue: TaskQueue,
}

impl CollectionWorker {
    pub fn new(config: CollectorConfig, collaborators: Collaborators) -> Self {
        let steps = StepExecutor::new(
            &config,
            Arc::clone(&collaborators.components),
            Arc::clone(&collaborators.versions),
            Arc::clone(&collaborators.popups),
        );
        let queue = TaskQueue::new(
            collaborators.store.clone(),
            config.admission.max_concurrent_tasks,
            config.admission.queue_scan_limit,
        );
        Self {
            config,
            collaborators,
            steps,
            queue,
        }
    }

    pub fn with_steps(mut self, steps: StepExecutor) -> Self {
        self.steps = steps;
        self
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn store(&self) -> &SqliteTaskStore {
        &self.collaborators.store
    }

    pub fn steps(&self) -> &StepExecutor {
        &self.steps
    }

    /// Marks rows left `running` by a previous process as interrupted.
    pub fn recover(&self) -> ExecutorResult<usize> {
        Ok(self.queue.recover_on_start()?)
    }

    /// Offers every pending task to admission and returns those that started.
    pub async fn admit_pending(&self) -> ExecutorResult<Vec<Task>> {
        let pending = self.collaborators.store.list(&TaskFilter {
            status: Some(TaskStatus::Pending),
            ..TaskFilter::default()
        })?;
        let mut started = Vec::new();
        // Oldest first so admission order follows creation order.
        for task in pending.into_iter().rev() {
            match self.queue.enqueue(&task).await {
                Ok(EnqueueOutcome::Started(task)) => started.push(task),
                Ok(EnqueueOutcome::Queued(task)) => {
                    info!(task = %task.task_id, "task queued");
                }
                Err(err) if err.is_conflict() => {
                    warn!(task = %task.task_id, error = %err, "task changed during admission");
                }
                Err(err) => return Err(err.into()),
            }
        }
        if let Some(task) = self.queue.try_start_next_queued().await? {
            started.push(task);
        }
        Ok(started)
    }

    /// Admits whatever can run and keeps going until nothing is running or
    /// waiting. Each finished task frees a slot for the next queued one.
    pub async fn run_until_idle(&self) -> ExecutorResult<Vec<CollectionResult>> {
        let mut running = FuturesUnordered::new();
        for task in self.admit_pending().await? {
            running.push(self.execute_tracked(task));
        }
        let mut results = Vec::new();
        while let Some((row_id, outcome)) = running.next().await {
            match outcome {
                Ok(result) => results.push(result),
                Err(err) => error!(task_row_id = row_id, error = %err, "task execution aborted"),
            }
            if let Some(next) = self.queue.on_task_complete(row_id).await? {
                running.push(self.execute_tracked(next));
            }
            while let Some(next) = self.queue.try_start_next_queued().await? {
                running.push(self.execute_tracked(next));
            }
        }
        Ok(results)
    }

    async fn execute_tracked(&self, task: Task) -> (i64, ExecutorResult<CollectionResult>) {
        let row_id = task.id;
        (row_id, self.execute(task).await)
    }

    /// Puts a paused task back to `running` under the usual admission guards
    /// and runs it. Domains settled before the pause are not revisited.
    pub async fn resume(&self, task_row_id: i64) -> ExecutorResult<CollectionResult> {
        let task = self.collaborators.store.get(task_row_id)?;
        if task.status != TaskStatus::Paused {
            return Err(TaskError::InvalidTransition {
                id: task.id,
                from: task.status,
                to: TaskStatus::Running,
            }
            .into());
        }
        let outcome = self.collaborators.store.claim_running(
            task.id,
            task.version,
            TaskStatus::Paused,
            self.queue.max_concurrent(),
        )?;
        let reason = match outcome {
            ClaimOutcome::Claimed { .. } => None,
            ClaimOutcome::AccountBusy => Some("account busy with another task"),
            ClaimOutcome::AtCapacity => Some("no free execution slot"),
        };
        if let Some(reason) = reason {
            warn!(task = %task.task_id, reason, "resume refused");
            return Err(ExecutorError::ResumeBlocked {
                task_id: task.task_id,
                reason: reason.to_string(),
            });
        }
        let resumed = self.collaborators.store.get(task_row_id)?;
        info!(task = %resumed.task_id, "resuming paused task");
        let outcome = self.execute(resumed).await;
        self.queue.on_task_complete(task_row_id).await?;
        outcome
    }

    /// Runs one task that admission already moved to `running`.
    pub async fn execute(&self, task: Task) -> ExecutorResult<CollectionResult> {
        let mut context = TaskContext::from_task(
            &task,
            &self.config.downloads_dir(),
            &self.config.screenshots_dir(),
        );
        let mut progress = TaskProgress::new(self.collaborators.store.clone(), &task);
        info!(
            task = %task.task_id,
            platform = %task.platform,
            account = %task.account_id,
            domains = ?task.data_domains,
            "executing task"
        );

        let Some(account) = self
            .collaborators
            .accounts
            .resolve(&task.platform, &task.account_id)
        else {
            let missing = ExecutorError::UnknownAccount {
                platform: task.platform.clone(),
                account_id: task.account_id.clone(),
            };
            return progress.conclude(&mut context, Err(missing), Duration::ZERO, None);
        };

        let rejected = context.retain_supported(&account);
        if !rejected.is_empty() {
            info!(task = %task.task_id, domains = ?rejected, "account lacks capability, skipping domains");
            progress.log(
                LogLevel::Info,
                "skipping domains the account cannot export",
                Some(json!({ "domains": rejected })),
            );
        }

        let sessions = self.collaborators.sessions.as_ref();
        let browser = self.collaborators.browser.as_ref();
        let settings = &self.config.executor;
        if settings.parallel_enabled
            && settings.max_parallel > 1
            && context.pending_keys().len() > 1
        {
            let runner = ParallelDomainRunner::new(&self.steps, sessions, browser);
            if runner.supports(&context, &account).await {
                return runner.run(&mut context, &account, &mut progress).await;
            }
        }

        let page_context = match browser
            .new_context(ContextOptions {
                seed: None,
                download_dir: Some(context.download_dir.clone()),
            })
            .await
        {
            Ok(page_context) => page_context,
            Err(err) => {
                return progress.conclude(&mut context, Err(err.into()), Duration::ZERO, None)
            }
        };
        let result = DomainIterator::new(&self.steps, sessions)
            .run(page_context.page(), &mut context, &account, &mut progress)
            .await;
        if let Err(err) = page_context.close().await {
            warn!(task = %task.task_id, error = %err, "failed to close browser context");
        }
        result
    }
}
