use std::collections::BTreeMap;
use std::path::PathBuf;

use futures::future::join_all;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::account::AccountProfile;
use crate::browser::{BrowserSession, ContextOptions, PageContext, SessionDetector, SessionSnapshot};

use super::context::{CollectionResult, DomainKey, TaskContext};
use super::domain::{
    base_params, capture_failure, domain_scope, export_domain, login, settle, settled_count,
};
use super::error::{ExecutorError, ExecutorResult};
use super::progress::{domain_progress, TaskProgress};
use super::step::{RunScope, StepExecutor};

/// Runs a task's domains in batches, each domain in its own browser context
/// seeded with the session captured after a single login.
pub struct ParallelDomainRunner<'a> {
    steps: &'a StepExecutor,
    sessions: &'a dyn SessionDetector,
    browser: &'a dyn BrowserSession,
    max_parallel: usize,
}

impl<'a> ParallelDomainRunner<'a> {
    pub fn new(
        steps: &'a StepExecutor,
        sessions: &'a dyn SessionDetector,
        browser: &'a dyn BrowserSession,
    ) -> Self {
        Self {
            steps,
            sessions,
            browser,
            max_parallel: steps.settings().max_parallel.max(1),
        }
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    /// True when every pending domain resolves to a component that allows
    /// concurrent runs. Domains without any component count as safe; they
    /// fail the same way in either mode.
    pub async fn supports(&self, context: &TaskContext, account: &AccountProfile) -> bool {
        let base = base_params(account, context);
        for key in context.pending_keys() {
            let scope = domain_scope(context, &base, &key, context.download_dir.clone());
            for name in key.component_names() {
                match self.steps.peek_component(&name, &scope).await {
                    Ok(component) if !component.parallel_safe => {
                        info!(component = %name, "component not parallel-safe, running sequentially");
                        return false;
                    }
                    Ok(_) => break,
                    Err(err) if err.is_component_missing() => continue,
                    Err(err) => {
                        debug!(component = %name, error = %err, "component check failed");
                        return false;
                    }
                }
            }
        }
        true
    }

    pub async fn run(
        &self,
        context: &mut TaskContext,
        account: &AccountProfile,
        progress: &mut TaskProgress,
    ) -> ExecutorResult<CollectionResult> {
        let started = Instant::now();
        let mut screenshot = None;
        let outcome = self.drive(context, account, progress, &mut screenshot).await;
        progress.conclude(context, outcome, started.elapsed(), screenshot)
    }

    async fn drive(
        &self,
        context: &mut TaskContext,
        account: &AccountProfile,
        progress: &mut TaskProgress,
        screenshot: &mut Option<String>,
    ) -> ExecutorResult<()> {
        tokio::fs::create_dir_all(&context.download_dir).await?;
        let base = base_params(account, context);
        let snapshot = self
            .authenticate(context, &base, progress, screenshot)
            .await?;

        let total = context.total_domains();
        let pending = context.pending_keys();
        for (batch_index, batch) in pending.chunks(self.max_parallel).enumerate() {
            progress.ensure_not_cancelled()?;
            let names: Vec<String> = batch.iter().map(DomainKey::key).collect();
            info!(
                task = %context.task_id,
                batch = batch_index + 1,
                domains = ?names,
                "starting domain batch"
            );
            progress.report(
                domain_progress(settled_count(context), total),
                format!("collecting {}", names.join(", ")),
            )?;

            let scopes: Vec<RunScope> = batch
                .iter()
                .map(|key| {
                    let dir = context.download_dir.join(key.key().replace(':', "_"));
                    domain_scope(context, &base, key, dir)
                })
                .collect();
            let outcomes = join_all(
                batch
                    .iter()
                    .zip(&scopes)
                    .map(|(key, scope)| self.run_isolated(scope, key, &snapshot)),
            )
            .await;

            let mut interrupt = None;
            for (key, outcome) in batch.iter().zip(outcomes) {
                if let Some(err) = settle(context, key, outcome) {
                    interrupt = Some(preferred_interrupt(interrupt, err));
                }
            }
            progress.persist_domains(
                context,
                domain_progress(settled_count(context), total),
                format!("settled batch {}", batch_index + 1),
            )?;
            if let Some(err) = interrupt {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Logs in inside a throwaway context and returns its session.
    async fn authenticate(
        &self,
        context: &mut TaskContext,
        base: &BTreeMap<String, String>,
        progress: &mut TaskProgress,
        screenshot: &mut Option<String>,
    ) -> ExecutorResult<SessionSnapshot> {
        let login_context = self
            .browser
            .new_context(ContextOptions {
                seed: None,
                download_dir: Some(context.download_dir.clone()),
            })
            .await?;
        let page = login_context.page();
        let outcome = match login(self.steps, self.sessions, page, context, base, progress).await {
            Ok(()) => login_context.snapshot().await.map_err(ExecutorError::from),
            Err(err) => Err(err),
        };
        if let Err(err) = &outcome {
            if !err.is_interrupt() {
                *screenshot = capture_failure(page, context).await;
            }
        }
        close_quietly(login_context.as_ref()).await;
        outcome
    }

    async fn run_isolated(
        &self,
        scope: &RunScope,
        key: &DomainKey,
        snapshot: &SessionSnapshot,
    ) -> ExecutorResult<Option<PathBuf>> {
        tokio::fs::create_dir_all(&scope.download_dir).await?;
        let context = self
            .browser
            .new_context(ContextOptions {
                seed: Some(snapshot.clone()),
                download_dir: Some(scope.download_dir.clone()),
            })
            .await?;
        let outcome = export_domain(self.steps, context.page(), scope, key).await;
        close_quietly(context.as_ref()).await;
        outcome
    }
}

/// A verification pause outranks a cancellation seen in the same batch.
fn preferred_interrupt(current: Option<ExecutorError>, next: ExecutorError) -> ExecutorError {
    match current {
        Some(existing @ ExecutorError::VerificationRequired { .. }) => existing,
        _ => next,
    }
}

async fn close_quietly(context: &dyn PageContext) {
    if let Err(err) = context.close().await {
        warn!(error = %err, "failed to close browser context");
    }
}
