//! Retry, fallback, selector resolution and smart waiting as standalone
//! policies. The step executor composes them as
//! `retry(fallback(smart_wait(action)))`.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::browser::{ElementState, LoadState, Locator, Page, PopupDismisser};
use crate::component::{FallbackAction, Target};
use crate::config::{BackoffStrategy, RetrySection, SmartWaitSection};

use super::error::{ExecutorError, ExecutorResult};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    strategy: BackoffStrategy,
    base: Duration,
    multiplier: f64,
    cap: Duration,
    jitter_ms: u64,
}

#[derive(Debug, Clone)]
pub struct RetryOutcome<T> {
    pub result: T,
    pub attempts: u32,
}

impl RetryPolicy {
    /// `max_retries` extra attempts after the first one.
    pub fn new(config: &RetrySection, max_retries: u32) -> Self {
        Self {
            max_attempts: max_retries.saturating_add(1),
            strategy: config.strategy,
            base: Duration::from_millis(config.base_delay_ms),
            multiplier: config.multiplier.max(1.0),
            cap: Duration::from_millis(config.max_delay_ms),
            jitter_ms: config.jitter_ms,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before retry number `retry` (1-based), without jitter.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let retry = retry.max(1);
        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base,
            BackoffStrategy::Linear => self.base.saturating_mul(retry),
            BackoffStrategy::Exponential => {
                let factor = self.multiplier.powi(retry as i32 - 1);
                Duration::from_secs_f64((self.base.as_secs_f64() * factor).min(self.cap.as_secs_f64()))
            }
        };
        delay.min(self.cap)
    }

    /// Runs `operation` until it succeeds or attempts run out. `on_failure`
    /// runs between attempts (popup clearing). Interrupting errors are never
    /// retried.
    pub async fn run<T, F, Fut, H, HFut>(
        &self,
        label: &str,
        mut operation: F,
        mut on_failure: H,
    ) -> ExecutorResult<RetryOutcome<T>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = ExecutorResult<T>>,
        H: FnMut() -> HFut,
        HFut: Future<Output = ()>,
    {
        let mut attempt = 0u32;
        loop {
            match operation(attempt).await {
                Ok(result) => {
                    return Ok(RetryOutcome {
                        result,
                        attempts: attempt + 1,
                    })
                }
                Err(error) if error.is_interrupt() => return Err(error),
                Err(error) => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        return Err(error);
                    }
                    warn!(
                        step = label,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %error,
                        "step attempt failed, retrying"
                    );
                    on_failure().await;
                    let mut delay = self.delay_for_retry(attempt);
                    if self.jitter_ms > 0 {
                        let jitter = rand::thread_rng().gen_range(0..=self.jitter_ms);
                        delay += Duration::from_millis(jitter);
                    }
                    if !delay.is_zero() {
                        sleep(delay).await;
                    }
                }
            }
        }
    }
}

/// A successful result together with the failures that preceded it.
#[derive(Debug, Clone)]
pub struct Attempted<T> {
    pub value: T,
    pub failures: Vec<String>,
}

/// Runs `primary`, then each fallback in order until one succeeds. When all
/// fail, the primary error is returned augmented with every fallback reason.
pub async fn with_fallbacks<'a, T, P, F, FFut>(
    primary: P,
    fallbacks: &'a [FallbackAction],
    mut run_fallback: F,
) -> ExecutorResult<Attempted<T>>
where
    P: Future<Output = ExecutorResult<T>>,
    F: FnMut(&'a FallbackAction) -> FFut,
    FFut: Future<Output = ExecutorResult<T>>,
{
    let primary_error = match primary.await {
        Ok(value) => {
            return Ok(Attempted {
                value,
                failures: Vec::new(),
            })
        }
        Err(error) if error.is_interrupt() || fallbacks.is_empty() => return Err(error),
        Err(error) => error,
    };
    let mut failures = vec![format!("primary: {primary_error}")];
    for fallback in fallbacks {
        let name = fallback
            .description
            .clone()
            .unwrap_or_else(|| fallback.selector.clone());
        match run_fallback(fallback).await {
            Ok(value) => {
                debug!(fallback = %name, skipped = failures.len(), "fallback succeeded");
                return Ok(Attempted { value, failures });
            }
            Err(error) if error.is_interrupt() => return Err(error),
            Err(error) => failures.push(format!("{name}: {error}")),
        }
    }
    Err(ExecutorError::FallbacksExhausted {
        primary: primary_error.to_string(),
        failures: failures.split_off(1),
    })
}

/// Probes prioritised candidates, then falls back to the legacy selector,
/// which is returned unprobed so the action itself waits on it.
pub async fn resolve_selector(
    page: &dyn Page,
    target: &Target,
    probe: Duration,
) -> ExecutorResult<Attempted<Locator>> {
    let mut misses = Vec::new();
    for candidate in target.candidates() {
        match page.wait_for(&candidate, ElementState::Attached, probe).await {
            Ok(()) => {
                return Ok(Attempted {
                    value: candidate,
                    failures: misses,
                })
            }
            Err(err) => {
                debug!(selector = %candidate, error = %err, "selector candidate missed");
                misses.push(format!("{candidate}: {err}"));
            }
        }
    }
    match target.legacy() {
        Some(legacy) => Ok(Attempted {
            value: legacy,
            failures: misses,
        }),
        None => Err(ExecutorError::SelectorsExhausted { attempts: misses }),
    }
}

/// Four-tier wait sharing one budget: quick probe, popup clearing then a
/// medium probe, network idle then a probe, and finally the remainder.
#[derive(Debug, Clone)]
pub struct SmartWait {
    quick: Duration,
    after_popup: Duration,
    network_idle: Duration,
    after_idle: Duration,
}

impl SmartWait {
    pub fn new(config: &SmartWaitSection) -> Self {
        Self {
            quick: Duration::from_millis(config.quick_probe_ms),
            after_popup: Duration::from_millis(config.after_popup_ms),
            network_idle: Duration::from_millis(config.network_idle_ms),
            after_idle: Duration::from_millis(config.after_idle_ms),
        }
    }

    pub async fn wait(
        &self,
        page: &dyn Page,
        popups: &dyn PopupDismisser,
        platform: &str,
        locator: &Locator,
        state: ElementState,
        budget: Duration,
    ) -> ExecutorResult<()> {
        let started = Instant::now();
        let remaining = || budget.saturating_sub(started.elapsed());

        if self.probe(page, locator, state, self.quick.min(remaining())).await {
            return Ok(());
        }

        if !remaining().is_zero() {
            let closed = popups.dismiss(page, platform).await;
            debug!(selector = %locator, closed, "smart wait: popups cleared");
            if self
                .probe(page, locator, state, self.after_popup.min(remaining()))
                .await
            {
                return Ok(());
            }
        }

        if !remaining().is_zero() {
            let idle = self.network_idle.min(remaining());
            if let Err(err) = page.wait_for_load_state(LoadState::NetworkIdle, idle).await {
                debug!(selector = %locator, error = %err, "smart wait: network still busy");
            }
            if self
                .probe(page, locator, state, self.after_idle.min(remaining()))
                .await
            {
                return Ok(());
            }
        }

        let rest = remaining();
        if !rest.is_zero() && self.probe(page, locator, state, rest).await {
            return Ok(());
        }

        Err(ExecutorError::WaitTimeout {
            selector: locator.to_string(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn probe(
        &self,
        page: &dyn Page,
        locator: &Locator,
        state: ElementState,
        timeout: Duration,
    ) -> bool {
        if timeout.is_zero() {
            return false;
        }
        page.wait_for(locator, state, timeout).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::browser::scripted::{PageScript, ScriptedElement, ScriptedPage};
    use crate::browser::NoPopups;
    use crate::component::SelectorCandidate;
    use crate::browser::SelectorKind;

    fn page_with(selectors: &[&str]) -> ScriptedPage {
        let script = selectors.iter().fold(
            PageScript::new("https://seller.example/orders"),
            |script, selector| script.element(selector, ScriptedElement::new()),
        );
        ScriptedPage::new(script, None)
    }

    #[test]
    fn backoff_strategies_respect_cap() {
        let mut config = RetrySection::default();
        assert_eq!(
            RetryPolicy::new(&config, 2).delay_for_retry(3),
            Duration::from_millis(1000)
        );
        config.strategy = BackoffStrategy::Linear;
        assert_eq!(
            RetryPolicy::new(&config, 2).delay_for_retry(3),
            Duration::from_millis(3000)
        );
        config.strategy = BackoffStrategy::Exponential;
        config.max_delay_ms = 5000;
        let policy = RetryPolicy::new(&config, 10);
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_retry(8), Duration::from_millis(5000));
        assert_eq!(policy.max_attempts(), 11);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_clears_popups_between_attempts() {
        let policy = RetryPolicy::new(&RetrySection::default(), 2);
        let cleared = Cell::new(0);
        let outcome = policy
            .run(
                "click export",
                |attempt| async move {
                    if attempt < 2 {
                        Err(ExecutorError::SelectorsExhausted {
                            attempts: vec![format!("attempt {attempt}")],
                        })
                    } else {
                        Ok(attempt)
                    }
                },
                || {
                    cleared.set(cleared.get() + 1);
                    async {}
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.result, 2);
        assert_eq!(cleared.get(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_stops_on_verification() {
        let policy = RetryPolicy::new(&RetrySection::default(), 5);
        let calls = Cell::new(0);
        let err = policy
            .run(
                "login",
                |_| {
                    calls.set(calls.get() + 1);
                    async {
                        Err::<(), _>(ExecutorError::VerificationRequired {
                            kind: "captcha".into(),
                            screenshot_path: None,
                        })
                    }
                },
                || async {},
            )
            .await
            .unwrap_err();
        assert!(err.is_interrupt());
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn third_fallback_candidate_wins_and_earlier_failures_are_kept() {
        let page = page_with(&["#export-v3"]);
        let fallbacks = vec![
            FallbackAction {
                selector: "#export-v2".into(),
                description: Some("second layout".into()),
                timeout_ms: Some(200),
            },
            FallbackAction {
                selector: "#export-v3".into(),
                description: None,
                timeout_ms: Some(200),
            },
        ];
        let click = |selector: &str| {
            let locator = Locator::parse(selector);
            let page = &page;
            async move {
                page.click(&locator, Duration::from_millis(200))
                    .await
                    .map_err(ExecutorError::from)
            }
        };
        let outcome = with_fallbacks(click("#export"), &fallbacks, |fallback| {
            click(&fallback.selector)
        })
        .await
        .unwrap();
        assert_eq!(outcome.failures.len(), 2);
        assert!(outcome.failures[0].starts_with("primary"));
        assert!(outcome.failures[1].starts_with("second layout"));
        assert_eq!(page.actions(), vec!["click #export-v3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_fallbacks_keep_primary_error() {
        let page = page_with(&[]);
        let fallbacks = vec![FallbackAction {
            selector: "#other".into(),
            description: None,
            timeout_ms: None,
        }];
        let click = |selector: &str| {
            let locator = Locator::parse(selector);
            let page = &page;
            async move {
                page.click(&locator, Duration::from_millis(100))
                    .await
                    .map_err(ExecutorError::from)
            }
        };
        let err = with_fallbacks(click("#export"), &fallbacks, |fallback| {
            click(&fallback.selector)
        })
        .await
        .unwrap_err();
        match err {
            ExecutorError::FallbacksExhausted { primary, failures } => {
                assert!(primary.contains("#export"));
                assert_eq!(failures.len(), 1);
                assert!(failures[0].contains("#other"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn resolves_third_candidate_by_priority() {
        let page = page_with(&["text=Export"]);
        let target = Target {
            selector: None,
            selectors: vec![
                SelectorCandidate {
                    kind: SelectorKind::Text,
                    value: "Export".into(),
                    priority: 3,
                },
                SelectorCandidate {
                    kind: SelectorKind::Css,
                    value: "#export".into(),
                    priority: 1,
                },
                SelectorCandidate {
                    kind: SelectorKind::Xpath,
                    value: "//button[@id='export']".into(),
                    priority: 2,
                },
            ],
        };
        let resolved = resolve_selector(&page, &target, Duration::from_millis(1000))
            .await
            .unwrap();
        assert_eq!(resolved.value, Locator::new(SelectorKind::Text, "Export"));
        assert_eq!(resolved.failures.len(), 2);
        assert!(resolved.failures[0].starts_with("#export"));

        let missing = Target {
            selector: None,
            selectors: vec![SelectorCandidate {
                kind: SelectorKind::Css,
                value: "#nope".into(),
                priority: 1,
            }],
        };
        assert!(matches!(
            resolve_selector(&page, &missing, Duration::from_millis(100)).await,
            Err(ExecutorError::SelectorsExhausted { attempts }) if attempts.len() == 1
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn smart_wait_times_out_within_budget() {
        let page = page_with(&[]);
        let wait = SmartWait::new(&SmartWaitSection::default());
        let started = Instant::now();
        let err = wait
            .wait(
                &page,
                &NoPopups,
                "demo",
                &Locator::css("#never"),
                ElementState::Visible,
                Duration::from_millis(5000),
            )
            .await
            .unwrap_err();
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(5000));
        assert!(elapsed < Duration::from_millis(5200));
        match err {
            ExecutorError::WaitTimeout { selector, elapsed_ms } => {
                assert_eq!(selector, "#never");
                assert!((5000..5200).contains(&elapsed_ms));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn smart_wait_finds_late_element_in_later_tier() {
        let page = ScriptedPage::new(
            PageScript::new("https://seller.example/orders").element(
                ".report-ready",
                ScriptedElement::new().appear_after(Duration::from_secs(4)),
            ),
            None,
        );
        let wait = SmartWait::new(&SmartWaitSection::default());
        wait.wait(
            &page,
            &NoPopups,
            "demo",
            &Locator::css(".report-ready"),
            ElementState::Attached,
            Duration::from_secs(30),
        )
        .await
        .unwrap();
    }
}
