use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{FutureExt, LocalBoxFuture};
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::browser::{DownloadWatcher, ElementState, Locator, Page, PopupDismisser};
use crate::component::{
    CheckFailure, Component, ComponentStore, ElementExpectation, FallbackAction, Step, StepAction,
    Target, VersionSelector, WaitFor,
};
use crate::config::{CollectorConfig, ExecutorSection, RetrySection};

use super::criteria::{
    run_error_handlers, run_pre_checks, verify_success_criteria, HandlerVerdict, PreCheckVerdict,
};
use super::error::{ExecutorError, ExecutorResult};
use super::policy::{resolve_selector, with_fallbacks, RetryPolicy, SmartWait};
use super::verification::ChallengeDetector;

/// Where and for whom a component runs.
#[derive(Debug, Clone)]
pub struct RunScope {
    pub platform: String,
    pub params: BTreeMap<String, String>,
    pub download_dir: PathBuf,
    pub screenshot_dir: PathBuf,
    depth: usize,
}

impl RunScope {
    pub fn new(
        platform: impl Into<String>,
        params: BTreeMap<String, String>,
        download_dir: impl Into<PathBuf>,
        screenshot_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            platform: platform.into(),
            params,
            download_dir: download_dir.into(),
            screenshot_dir: screenshot_dir.into(),
            depth: 0,
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Scope for a nested component: parent params plus the call's own,
    /// exposed as `{{params.<key>}}` unless already qualified.
    fn nested(&self, extra: &BTreeMap<String, String>) -> Self {
        let mut child = self.clone();
        child.depth += 1;
        for (key, value) in extra {
            let key = if key.contains('.') {
                key.clone()
            } else {
                format!("params.{key}")
            };
            child.params.insert(key, value.clone());
        }
        child
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComponentRun {
    pub component: String,
    pub version: Option<String>,
    /// A pre-check asked for the component to be skipped.
    pub skipped: bool,
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
enum StepOutcome {
    Done,
    Skipped,
    File(PathBuf),
}

/// Runs components step by step against a page.
#[derive(Clone)]
pub struct StepExecutor {
    components: Arc<dyn ComponentStore>,
    versions: Arc<dyn VersionSelector>,
    popups: Arc<dyn PopupDismisser>,
    challenges: ChallengeDetector,
    smart_wait: SmartWait,
    http: reqwest::Client,
    settings: ExecutorSection,
    retry: RetrySection,
}

impl StepExecutor {
    pub fn new(
        config: &CollectorConfig,
        components: Arc<dyn ComponentStore>,
        versions: Arc<dyn VersionSelector>,
        popups: Arc<dyn PopupDismisser>,
    ) -> Self {
        Self {
            components,
            versions,
            popups,
            challenges: ChallengeDetector::new(&config.verification),
            smart_wait: SmartWait::new(&config.smart_wait),
            http: reqwest::Client::new(),
            settings: config.executor.clone(),
            retry: config.retry.clone(),
        }
    }

    pub fn with_challenges(mut self, challenges: ChallengeDetector) -> Self {
        self.challenges = challenges;
        self
    }

    pub fn popups(&self) -> &dyn PopupDismisser {
        self.popups.as_ref()
    }

    pub fn challenges(&self) -> &ChallengeDetector {
        &self.challenges
    }

    pub fn settings(&self) -> &ExecutorSection {
        &self.settings
    }

    /// Loads a component without running it.
    pub async fn peek_component(&self, name: &str, scope: &RunScope) -> ExecutorResult<Component> {
        Ok(self
            .components
            .load(&scope.platform, name, &scope.params, None)
            .await?)
    }

    /// Loads `name` for the scope's platform (version chosen by the selector),
    /// runs it, and reports the outcome back to the selector.
    pub fn run_component<'a>(
        &'a self,
        page: &'a dyn Page,
        name: &'a str,
        scope: &'a RunScope,
    ) -> LocalBoxFuture<'a, ExecutorResult<ComponentRun>> {
        async move {
            if scope.depth > self.settings.max_component_depth {
                return Err(ExecutorError::DepthExceeded(self.settings.max_component_depth));
            }
            let mut version = self.versions.select_version(name, None, true).await;
            let loaded = self
                .components
                .load(&scope.platform, name, &scope.params, version.as_deref())
                .await;
            let component = match loaded {
                Err(err) if err.is_not_found() && version.is_some() => {
                    warn!(
                        component = name,
                        version = ?version,
                        "selected version missing, using the default file"
                    );
                    version = None;
                    self.components
                        .load(&scope.platform, name, &scope.params, None)
                        .await?
                }
                loaded => loaded?,
            };
            let outcome = self.execute(page, &component, scope).await;
            self.versions
                .record_usage(name, version.as_deref(), outcome.is_ok())
                .await;
            outcome.map(|run| ComponentRun { version, ..run })
        }
        .boxed_local()
    }

    pub async fn execute(
        &self,
        page: &dyn Page,
        component: &Component,
        scope: &RunScope,
    ) -> ExecutorResult<ComponentRun> {
        let label = format!("{}/{}", component.platform, component.name);
        let mut run = ComponentRun {
            component: component.name.clone(),
            ..ComponentRun::default()
        };

        match run_pre_checks(page, &component.pre_checks, &self.http).await {
            PreCheckVerdict::Proceed => {}
            PreCheckVerdict::Skip(reason) => {
                info!(component = %label, reason = %reason, "component skipped by pre-check");
                run.skipped = true;
                return Ok(run);
            }
            PreCheckVerdict::Fail(reason) => {
                return Err(ExecutorError::PreCheckFailed {
                    component: label,
                    reason,
                })
            }
        }

        let watcher = if component.auto_detect_download {
            Some(DownloadWatcher::start(&scope.download_dir).await?)
        } else {
            None
        };

        if component.popup_handling.check_before_steps {
            self.popups.dismiss(page, &scope.platform).await;
        }

        for (index, step) in component.steps.iter().enumerate() {
            if component.popup_handling.check_each_step && index > 0 {
                self.popups.dismiss(page, &scope.platform).await;
            }
            match self.run_step(page, step, scope).await {
                Ok(StepOutcome::File(path)) => run.file = Some(path),
                Ok(StepOutcome::Done) | Ok(StepOutcome::Skipped) => {}
                Err(err) if err.is_interrupt() => return Err(err),
                Err(err) if step.optional => {
                    warn!(
                        component = %label,
                        step = index + 1,
                        error = %err,
                        "optional step failed, continuing"
                    );
                }
                Err(err) => {
                    warn!(component = %label, step = index + 1, error = %err, "required step failed");
                    if let Some(pause) = self
                        .challenges
                        .check(page, &scope.platform, &scope.screenshot_dir)
                        .await
                    {
                        return Err(pause);
                    }
                    return Err(ExecutorError::StepExecution {
                        index: index + 1,
                        label: step.label(),
                        reason: err.to_string(),
                    });
                }
            }
        }

        if component.popup_handling.check_after_steps {
            self.popups.dismiss(page, &scope.platform).await;
        }

        if !component.success_criteria.is_empty() {
            self.verify(page, component, scope, &label).await?;
        }

        if run.file.is_none() {
            if let Some(watcher) = watcher {
                match watcher
                    .wait_for_file(self.download_timeout(None), self.poll_interval())
                    .await
                {
                    Ok(path) => {
                        info!(component = %label, file = %path.display(), "download detected");
                        run.file = Some(path);
                    }
                    Err(err) => warn!(component = %label, error = %err, "no download detected"),
                }
            }
        }

        debug!(component = %label, file = ?run.file, "component finished");
        Ok(run)
    }

    async fn verify(
        &self,
        page: &dyn Page,
        component: &Component,
        scope: &RunScope,
        label: &str,
    ) -> ExecutorResult<()> {
        let probe = self.selector_probe();
        self.popups.dismiss(page, &scope.platform).await;
        let reason = match verify_success_criteria(page, &component.success_criteria, probe).await {
            Ok(()) => return Ok(()),
            Err(reason) => reason,
        };
        warn!(component = %label, reason = %reason, "success criteria not met");
        let failed = || ExecutorError::CriteriaFailed {
            component: label.to_string(),
            reason: reason.clone(),
        };
        match run_error_handlers(
            page,
            &component.error_handlers,
            self.popups.as_ref(),
            &scope.platform,
            probe,
        )
        .await
        {
            HandlerVerdict::NoneMatched => Err(failed()),
            HandlerVerdict::Fail(message) => Err(ExecutorError::HandlerAbort {
                component: label.to_string(),
                message,
            }),
            HandlerVerdict::Cleared => {
                info!(component = %label, "error handler cleared the page, verifying again");
                verify_success_criteria(page, &component.success_criteria, probe)
                    .await
                    .map_err(|reason| ExecutorError::CriteriaFailed {
                        component: label.to_string(),
                        reason,
                    })
            }
        }
    }

    async fn run_step(
        &self,
        page: &dyn Page,
        step: &Step,
        scope: &RunScope,
    ) -> ExecutorResult<StepOutcome> {
        let label = step.label();
        let probes = step.probe_locators();
        if step.optional && !probes.is_empty() && !self.any_present(page, &probes).await {
            info!(step = %label, "optional step skipped, element not found");
            return Ok(StepOutcome::Skipped);
        }

        let policy = RetryPolicy::new(
            step.retry.as_ref().unwrap_or(&self.retry),
            step.max_retries.unwrap_or(self.settings.max_retries),
        );
        let popups = self.popups.as_ref();
        let platform = scope.platform.as_str();
        let outcome = policy
            .run(
                &label,
                move |_| self.attempt(page, step, scope),
                move || async move {
                    popups.dismiss(page, platform).await;
                },
            )
            .await?;
        if outcome.attempts > 1 {
            debug!(step = %label, attempts = outcome.attempts, "step succeeded after retry");
        }
        Ok(outcome.result)
    }

    async fn any_present(&self, page: &dyn Page, locators: &[Locator]) -> bool {
        let probe = Duration::from_millis(self.settings.optional_probe_ms);
        for locator in locators {
            if page
                .wait_for(locator, ElementState::Attached, probe)
                .await
                .is_ok()
            {
                return true;
            }
        }
        false
    }

    async fn attempt(
        &self,
        page: &dyn Page,
        step: &Step,
        scope: &RunScope,
    ) -> ExecutorResult<StepOutcome> {
        let attempted = with_fallbacks(
            self.perform(page, step, scope, None),
            &step.fallbacks,
            |fallback| self.perform(page, step, scope, Some(fallback)),
        )
        .await?;
        if !attempted.failures.is_empty() {
            info!(
                step = %step.label(),
                failures = ?attempted.failures,
                "step recovered through fallback"
            );
        }
        Ok(attempted.value)
    }

    /// Performs the step once. `fallback` replaces the target selector and
    /// timeout of targeted actions.
    async fn perform(
        &self,
        page: &dyn Page,
        step: &Step,
        scope: &RunScope,
        fallback: Option<&FallbackAction>,
    ) -> ExecutorResult<StepOutcome> {
        let timeout = self.step_timeout(step, fallback);
        match &step.action {
            StepAction::Navigate { url, wait_until } => {
                page.goto(url, *wait_until, timeout).await?;
            }
            StepAction::Click { target } => {
                let locator = self.locate(page, target, fallback).await?;
                page.click(&locator, timeout).await?;
            }
            StepAction::Fill { target, value } => {
                let locator = self.locate(page, target, fallback).await?;
                page.fill(&locator, value, timeout).await?;
            }
            StepAction::Select { target, value, by } => {
                let locator = self.locate(page, target, fallback).await?;
                page.select(&locator, value, *by, timeout).await?;
            }
            StepAction::Hover { target } => {
                let locator = self.locate(page, target, fallback).await?;
                page.hover(&locator, timeout).await?;
            }
            StepAction::Wait { .. } => self.wait(page, step, scope, timeout).await?,
            StepAction::Keyboard { key } => page.press(key).await?,
            StepAction::Scroll { selector, delta_y } => {
                let locator = selector.as_deref().map(Locator::parse);
                page.scroll(locator.as_ref(), *delta_y).await?;
            }
            StepAction::CallComponent { component, params } => {
                let child = scope.nested(params);
                let run = self.run_component(page, component, &child).await?;
                if let Some(path) = run.file {
                    return Ok(StepOutcome::File(path));
                }
            }
            StepAction::DismissPopups => {
                self.popups.dismiss(page, &scope.platform).await;
            }
            StepAction::CheckElement {
                target,
                expect,
                on_fail,
                message,
            } => {
                let locator = match fallback {
                    Some(fallback) => Locator::parse(&fallback.selector),
                    None => target
                        .primary()
                        .ok_or_else(|| ExecutorError::SelectorsExhausted { attempts: Vec::new() })?,
                };
                let state = match expect {
                    ElementExpectation::Exists => ElementState::Attached,
                    ElementExpectation::NotExists => ElementState::Detached,
                    ElementExpectation::Visible => ElementState::Visible,
                    ElementExpectation::Hidden => ElementState::Hidden,
                };
                if let Err(err) = page.wait_for(&locator, state, timeout).await {
                    let reason = message.clone().unwrap_or_else(|| err.to_string());
                    match on_fail {
                        CheckFailure::Error => return Err(err.into()),
                        CheckFailure::Skip => {
                            warn!(selector = %locator, reason = %reason, "element check failed, skipping");
                            return Ok(StepOutcome::Skipped);
                        }
                        CheckFailure::Continue => {
                            debug!(selector = %locator, reason = %reason, "element check failed");
                        }
                    }
                }
            }
            StepAction::Screenshot { name } => {
                let file = name.clone().unwrap_or_else(|| {
                    format!("screenshot_{}.png", &Uuid::new_v4().simple().to_string()[..8])
                });
                page.screenshot(&scope.screenshot_dir.join(file)).await?;
            }
            StepAction::AwaitDownload { selector } => {
                let watcher = DownloadWatcher::start(&scope.download_dir).await?;
                let trigger = fallback
                    .map(|fallback| fallback.selector.as_str())
                    .or(selector.as_deref())
                    .map(Locator::parse);
                if let Some(trigger) = trigger {
                    page.click(&trigger, self.step_timeout(step, None)).await?;
                }
                let path = watcher
                    .wait_for_file(self.download_timeout(step.timeout_ms), self.poll_interval())
                    .await?;
                info!(file = %path.display(), "download finished");
                return Ok(StepOutcome::File(path));
            }
        }
        Ok(StepOutcome::Done)
    }

    async fn wait(
        &self,
        page: &dyn Page,
        step: &Step,
        scope: &RunScope,
        timeout: Duration,
    ) -> ExecutorResult<()> {
        match step.wait_for() {
            Some(WaitFor::Selector {
                locator,
                state,
                smart: true,
            }) => {
                self.smart_wait
                    .wait(page, self.popups.as_ref(), &scope.platform, &locator, state, timeout)
                    .await
            }
            Some(WaitFor::Selector { locator, state, .. }) => {
                match page.wait_for(&locator, state, timeout).await {
                    Err(err) if err.is_timeout() => Err(ExecutorError::WaitTimeout {
                        selector: locator.to_string(),
                        elapsed_ms: timeout.as_millis() as u64,
                    }),
                    other => other.map_err(ExecutorError::from),
                }
            }
            Some(WaitFor::Duration(duration)) => {
                sleep(duration).await;
                Ok(())
            }
            Some(WaitFor::LoadState(state)) => Ok(page.wait_for_load_state(state, timeout).await?),
            None => Ok(()),
        }
    }

    async fn locate(
        &self,
        page: &dyn Page,
        target: &Target,
        fallback: Option<&FallbackAction>,
    ) -> ExecutorResult<Locator> {
        if let Some(fallback) = fallback {
            return Ok(Locator::parse(&fallback.selector));
        }
        let resolved = resolve_selector(page, target, self.selector_probe()).await?;
        if !resolved.failures.is_empty() {
            debug!(
                selector = %resolved.value,
                missed = ?resolved.failures,
                "resolved after earlier candidates missed"
            );
        }
        Ok(resolved.value)
    }

    fn step_timeout(&self, step: &Step, fallback: Option<&FallbackAction>) -> Duration {
        let millis = fallback
            .and_then(|fallback| fallback.timeout_ms)
            .or(step.timeout_ms)
            .unwrap_or(self.settings.step_timeout_ms);
        Duration::from_millis(millis)
    }

    fn download_timeout(&self, explicit_ms: Option<u64>) -> Duration {
        Duration::from_millis(explicit_ms.unwrap_or(self.settings.download_timeout_ms))
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.settings.poll_interval_ms.max(10))
    }

    fn selector_probe(&self) -> Duration {
        Duration::from_millis(self.settings.selector_probe_ms)
    }
}
