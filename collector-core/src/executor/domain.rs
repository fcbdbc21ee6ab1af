use std::collections::BTreeMap;
use std::path::PathBuf;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::account::AccountProfile;
use crate::browser::{Page, SessionDetector};
use crate::task::LogLevel;

use super::context::{CollectionResult, DomainKey, TaskContext};
use super::error::{ExecutorError, ExecutorResult};
use super::progress::{
    domain_progress, TaskProgress, PROGRESS_LOADING_LOGIN, PROGRESS_LOGGING_IN,
};
use super::step::{RunScope, StepExecutor};

/// Placeholder values shared by every component of a task run.
pub(super) fn base_params(
    account: &AccountProfile,
    context: &TaskContext,
) -> BTreeMap<String, String> {
    let mut params = account.template_params();
    params.extend(context.template_params());
    params
}

pub(super) fn domain_scope(
    context: &TaskContext,
    base: &BTreeMap<String, String>,
    key: &DomainKey,
    download_dir: PathBuf,
) -> RunScope {
    RunScope::new(
        context.platform.clone(),
        base.clone(),
        download_dir,
        context.screenshot_dir.clone(),
    )
    .with_param("params.data_domain", key.domain.clone())
    .with_param("params.sub_domain", key.sub.clone().unwrap_or_default())
}

/// Runs the login component unless an earlier run already got past it or the
/// session is still live. A failed login is checked for a challenge before it
/// is reported as a failure.
pub(super) async fn login(
    steps: &StepExecutor,
    sessions: &dyn SessionDetector,
    page: &dyn Page,
    context: &mut TaskContext,
    base: &BTreeMap<String, String>,
    progress: &mut TaskProgress,
) -> ExecutorResult<()> {
    if context.current_component_index > 0 {
        debug!(task = %context.task_id, "login already done for this run");
        return Ok(());
    }
    progress.ensure_not_cancelled()?;
    progress.report(PROGRESS_LOADING_LOGIN, "loading login component")?;

    if sessions
        .is_authenticated(page, &context.platform, &context.account_id)
        .await
    {
        info!(
            task = %context.task_id,
            account = %context.account_id,
            "session still valid, skipping login"
        );
        context.current_component_index = 1;
        return Ok(());
    }

    progress.report(PROGRESS_LOGGING_IN, "logging in")?;
    let scope = RunScope::new(
        context.platform.clone(),
        base.clone(),
        context.download_dir.clone(),
        context.screenshot_dir.clone(),
    );
    let login_component = steps.settings().login_component.clone();
    match steps.run_component(page, &login_component, &scope).await {
        Ok(_) => {}
        Err(err) if err.is_interrupt() => return Err(err),
        Err(err) => {
            if let Some(pause) = steps
                .challenges()
                .check(page, &context.platform, &context.screenshot_dir)
                .await
            {
                return Err(pause);
            }
            warn!(task = %context.task_id, error = %err, "login failed");
            return Err(err);
        }
    }
    info!(task = %context.task_id, "login succeeded");
    context.current_component_index = 1;
    Ok(())
}

/// Runs the export for one domain key, falling back from the sub-domain
/// component to the domain-wide one when the former does not exist.
pub(super) async fn export_domain(
    steps: &StepExecutor,
    page: &dyn Page,
    scope: &RunScope,
    key: &DomainKey,
) -> ExecutorResult<Option<PathBuf>> {
    let mut missing = None;
    for name in key.component_names() {
        match steps.run_component(page, &name, scope).await {
            Ok(run) => {
                if run.skipped {
                    info!(domain = %key.key(), component = %name, "export skipped by pre-check");
                }
                return Ok(run.file);
            }
            Err(err) if err.is_component_missing() => {
                debug!(domain = %key.key(), component = %name, "export component not found");
                missing = Some(err);
            }
            Err(err) => return Err(err),
        }
    }
    Err(missing.unwrap_or_else(|| ExecutorError::StepExecution {
        index: 0,
        label: key.key(),
        reason: "no export component".into(),
    }))
}

pub(super) fn settled_count(context: &TaskContext) -> usize {
    context.completed_domains.len() + context.failed_domains.len()
}

/// Applies one domain's outcome to the context. Interrupts are handed back
/// untouched so the caller can stop.
pub(super) fn settle(
    context: &mut TaskContext,
    key: &DomainKey,
    outcome: ExecutorResult<Option<PathBuf>>,
) -> Option<ExecutorError> {
    let name = key.key();
    match outcome {
        Ok(file) => {
            info!(task = %context.task_id, domain = %name, "domain collected");
            let file = file.map(|path| path.to_string_lossy().into_owned());
            context.record_success(&name, file);
            None
        }
        Err(err) if err.is_interrupt() => Some(err),
        Err(err) => {
            warn!(task = %context.task_id, domain = %name, error = %err, "domain failed");
            context.record_failure(&name, &err.to_string());
            None
        }
    }
}

/// Best-effort capture of the page after an infrastructure failure.
pub(super) async fn capture_failure(page: &dyn Page, context: &TaskContext) -> Option<String> {
    let path = context.screenshot_dir.join("error.png");
    match page.screenshot(&path).await {
        Ok(()) => Some(path.to_string_lossy().into_owned()),
        Err(err) => {
            debug!(task = %context.task_id, error = %err, "failed to capture error screenshot");
            None
        }
    }
}

/// Runs a task's domains one after another on a single page.
pub struct DomainIterator<'a> {
    steps: &'a StepExecutor,
    sessions: &'a dyn SessionDetector,
}

impl<'a> DomainIterator<'a> {
    pub fn new(steps: &'a StepExecutor, sessions: &'a dyn SessionDetector) -> Self {
        Self { steps, sessions }
    }

    pub async fn run(
        &self,
        page: &dyn Page,
        context: &mut TaskContext,
        account: &AccountProfile,
        progress: &mut TaskProgress,
    ) -> ExecutorResult<CollectionResult> {
        let started = Instant::now();
        let outcome = self.drive(page, context, account, progress).await;
        let screenshot = match &outcome {
            Err(err) if !err.is_interrupt() => capture_failure(page, context).await,
            _ => None,
        };
        progress.conclude(context, outcome, started.elapsed(), screenshot)
    }

    async fn drive(
        &self,
        page: &dyn Page,
        context: &mut TaskContext,
        account: &AccountProfile,
        progress: &mut TaskProgress,
    ) -> ExecutorResult<()> {
        tokio::fs::create_dir_all(&context.download_dir).await?;
        let base = base_params(account, context);
        login(self.steps, self.sessions, page, context, &base, progress).await?;

        let total = context.total_domains();
        for key in context.domain_keys() {
            let name = key.key();
            if context.is_settled(&name) {
                debug!(task = %context.task_id, domain = %name, "domain already settled");
                continue;
            }
            progress.ensure_not_cancelled()?;
            if let Some(index) = context.data_domains.iter().position(|d| *d == key.domain) {
                context.current_data_domain_index = index;
            }
            progress.report(
                domain_progress(settled_count(context), total),
                format!("collecting {name}"),
            )?;

            let scope = domain_scope(context, &base, &key, context.download_dir.clone());
            let outcome = export_domain(self.steps, page, &scope, &key).await;
            if let Some(interrupt) = settle(context, &key, outcome) {
                return Err(interrupt);
            }
            if let Some(failed) = context.failed_domains.iter().find(|f| f.domain == name) {
                progress.log(
                    LogLevel::Warning,
                    &format!("domain {name} failed: {}", failed.error),
                    None,
                );
            }
            progress.persist_domains(
                context,
                domain_progress(settled_count(context), total),
                format!("settled {name}"),
            )?;
        }
        Ok(())
    }
}
