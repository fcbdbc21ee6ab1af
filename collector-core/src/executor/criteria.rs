use std::time::Duration;

use regex::Regex;
use tracing::{debug, warn};

use crate::browser::{BrowserResult, ElementState, Locator, Page, PopupDismisser};
use crate::component::{
    CriterionCheck, ErrorHandler, HandlerAction, PreCheck, PreCheckFailure, PreCheckKind,
    SuccessCriterion,
};

const URL_CHECK_TIMEOUT: Duration = Duration::from_secs(5);
const PRE_CHECK_ELEMENT_TIMEOUT: Duration = Duration::from_secs(3);

async fn check(page: &dyn Page, criterion: &CriterionCheck, probe: Duration) -> BrowserResult<bool> {
    Ok(match criterion {
        CriterionCheck::UrlContains { value } => {
            !value.is_empty() && page.current_url().await?.contains(value.as_str())
        }
        CriterionCheck::UrlMatches { pattern } => match Regex::new(pattern) {
            Ok(regex) => regex.is_match(&page.current_url().await?),
            Err(_) => false,
        },
        CriterionCheck::ElementExists { selector } => page
            .wait_for(&Locator::parse(selector), ElementState::Attached, probe)
            .await
            .is_ok(),
        CriterionCheck::ElementVisible { selector } => page
            .wait_for(&Locator::parse(selector), ElementState::Visible, probe)
            .await
            .is_ok(),
        CriterionCheck::ElementTextContains { selector, text } => page
            .text_content(&Locator::parse(selector))
            .await?
            .map_or(false, |content| content.contains(text.as_str())),
        CriterionCheck::PageContainsText { text } => page.page_text().await?.contains(text.as_str()),
        CriterionCheck::CustomScript { script } => page.evaluate_bool(script).await?,
    })
}

fn describe(criterion: &CriterionCheck) -> String {
    match criterion {
        CriterionCheck::UrlContains { value } => format!("url contains {value:?}"),
        CriterionCheck::UrlMatches { pattern } => format!("url matches {pattern:?}"),
        CriterionCheck::ElementExists { selector } => format!("element {selector} exists"),
        CriterionCheck::ElementVisible { selector } => format!("element {selector} visible"),
        CriterionCheck::ElementTextContains { selector, text } => {
            format!("element {selector} contains {text:?}")
        }
        CriterionCheck::PageContainsText { text } => format!("page contains {text:?}"),
        CriterionCheck::CustomScript { .. } => "custom script".to_string(),
    }
}

/// Every non-optional criterion must hold. Returns the first failing
/// criterion's description.
pub async fn verify_success_criteria(
    page: &dyn Page,
    criteria: &[SuccessCriterion],
    probe: Duration,
) -> Result<(), String> {
    for criterion in criteria {
        let passed = match check(page, &criterion.check, probe).await {
            Ok(passed) => passed,
            Err(err) => {
                debug!(criterion = %describe(&criterion.check), error = %err, "criterion errored");
                false
            }
        };
        if passed {
            continue;
        }
        if criterion.optional {
            debug!(criterion = %describe(&criterion.check), "optional criterion not met");
            continue;
        }
        return Err(describe(&criterion.check));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerVerdict {
    NoneMatched,
    /// An obstruction was cleared; criteria deserve one more look.
    Cleared,
    Fail(String),
}

/// Runs the first handler whose marker element is present.
pub async fn run_error_handlers(
    page: &dyn Page,
    handlers: &[ErrorHandler],
    popups: &dyn PopupDismisser,
    platform: &str,
    probe: Duration,
) -> HandlerVerdict {
    for handler in handlers {
        let marker = Locator::parse(&handler.selector);
        if page
            .wait_for(&marker, ElementState::Attached, probe)
            .await
            .is_err()
        {
            continue;
        }
        let message = handler
            .message
            .clone()
            .unwrap_or_else(|| format!("error marker {} present", handler.selector));
        warn!(platform, selector = %handler.selector, message = %message, "error handler matched");
        return match handler.action {
            HandlerAction::FailTask => HandlerVerdict::Fail(message),
            HandlerAction::ClosePopup => {
                if let Some(close) = &handler.close_selector {
                    if let Err(err) = page.click(&Locator::parse(close), probe).await {
                        debug!(selector = %close, error = %err, "close button click failed");
                    }
                }
                popups.dismiss(page, platform).await;
                HandlerVerdict::Cleared
            }
        };
    }
    HandlerVerdict::NoneMatched
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreCheckVerdict {
    Proceed,
    Skip(String),
    Fail(String),
}

/// Reachability probe for `url_accessible`: any non-error status counts.
pub async fn url_accessible(client: &reqwest::Client, url: &str, timeout: Duration) -> bool {
    match client.get(url).timeout(timeout).send().await {
        Ok(response) => !(response.status().is_client_error() || response.status().is_server_error()),
        Err(err) => {
            debug!(url, error = %err, "url accessibility check failed");
            false
        }
    }
}

pub async fn run_pre_checks(
    page: &dyn Page,
    checks: &[PreCheck],
    client: &reqwest::Client,
) -> PreCheckVerdict {
    for pre_check in checks {
        let (passed, reason) = match &pre_check.kind {
            PreCheckKind::UrlAccessible { url } => {
                let timeout = pre_check
                    .timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(URL_CHECK_TIMEOUT);
                (
                    url_accessible(client, url, timeout).await,
                    format!("url not accessible: {url}"),
                )
            }
            PreCheckKind::ElementExists { selector } => {
                let timeout = pre_check
                    .timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(PRE_CHECK_ELEMENT_TIMEOUT);
                let found = page
                    .wait_for(&Locator::parse(selector), ElementState::Attached, timeout)
                    .await
                    .is_ok();
                (found, format!("element not found: {selector}"))
            }
        };
        if passed {
            continue;
        }
        warn!(reason = %reason, on_failure = ?pre_check.on_failure, "pre-check failed");
        match pre_check.on_failure {
            PreCheckFailure::Skip => return PreCheckVerdict::Skip(reason),
            PreCheckFailure::Fail => return PreCheckVerdict::Fail(reason),
            PreCheckFailure::Continue => {}
        }
    }
    PreCheckVerdict::Proceed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::scripted::{PageScript, ScriptedElement, ScriptedPage};
    use crate::browser::NoPopups;

    fn criterion(check: CriterionCheck, optional: bool) -> SuccessCriterion {
        SuccessCriterion {
            check,
            optional,
            comment: None,
        }
    }

    fn dashboard() -> ScriptedPage {
        ScriptedPage::new(
            PageScript::new("https://seller.example/dashboard?shop=1")
                .body_text("Welcome back")
                .element(".user", ScriptedElement::new().text("ops@shop"))
                .element(".banner", ScriptedElement::new().invisible())
                .script_result("window.ready === true", true),
            None,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn required_criteria_must_all_pass() {
        let page = dashboard();
        let probe = Duration::from_millis(200);
        let criteria = vec![
            criterion(CriterionCheck::UrlContains { value: "/dashboard".into() }, false),
            criterion(CriterionCheck::UrlMatches { pattern: r"shop=\d+".into() }, false),
            criterion(
                CriterionCheck::ElementTextContains {
                    selector: ".user".into(),
                    text: "ops".into(),
                },
                false,
            ),
            criterion(CriterionCheck::PageContainsText { text: "Welcome".into() }, false),
            criterion(
                CriterionCheck::CustomScript {
                    script: "window.ready === true".into(),
                },
                false,
            ),
            criterion(CriterionCheck::ElementVisible { selector: ".banner".into() }, true),
        ];
        assert_eq!(verify_success_criteria(&page, &criteria, probe).await, Ok(()));

        let failing = vec![criterion(
            CriterionCheck::ElementExists {
                selector: "#logout".into(),
            },
            false,
        )];
        let reason = verify_success_criteria(&page, &failing, probe)
            .await
            .unwrap_err();
        assert!(reason.contains("#logout"));
    }

    #[tokio::test(start_paused = true)]
    async fn first_matching_handler_decides() {
        let page = ScriptedPage::new(
            PageScript::new("https://seller.example/login")
                .element(".error-banner", ScriptedElement::new().text("Wrong password")),
            None,
        );
        let handlers = vec![
            ErrorHandler {
                selector: ".promo".into(),
                action: HandlerAction::ClosePopup,
                close_selector: None,
                message: None,
            },
            ErrorHandler {
                selector: ".error-banner".into(),
                action: HandlerAction::FailTask,
                close_selector: None,
                message: Some("invalid credentials".into()),
            },
        ];
        let verdict =
            run_error_handlers(&page, &handlers, &NoPopups, "demo", Duration::from_millis(100))
                .await;
        assert_eq!(verdict, HandlerVerdict::Fail("invalid credentials".into()));
        assert_eq!(
            run_error_handlers(&page, &handlers[..1], &NoPopups, "demo", Duration::from_millis(100))
                .await,
            HandlerVerdict::NoneMatched
        );
    }

    #[tokio::test(start_paused = true)]
    async fn element_pre_checks_honour_on_failure() {
        let page = dashboard();
        let client = reqwest::Client::new();
        let check = |selector: &str, on_failure| PreCheck {
            kind: PreCheckKind::ElementExists {
                selector: selector.into(),
            },
            on_failure,
            timeout_ms: Some(100),
            description: None,
        };
        assert_eq!(
            run_pre_checks(&page, &[check(".user", PreCheckFailure::Fail)], &client).await,
            PreCheckVerdict::Proceed
        );
        assert_eq!(
            run_pre_checks(&page, &[check("#gone", PreCheckFailure::Continue)], &client).await,
            PreCheckVerdict::Proceed
        );
        assert!(matches!(
            run_pre_checks(&page, &[check("#gone", PreCheckFailure::Skip)], &client).await,
            PreCheckVerdict::Skip(_)
        ));
        assert!(matches!(
            run_pre_checks(&page, &[check("#gone", PreCheckFailure::Fail)], &client).await,
            PreCheckVerdict::Fail(reason) if reason.contains("#gone")
        ));
    }
}
