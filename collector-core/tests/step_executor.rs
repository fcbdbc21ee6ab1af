mod support;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use collector_core::browser::scripted::{ClickEffect, PageScript, ScriptedElement, ScriptedPage};
use collector_core::browser::NoPopups;
use collector_core::executor::RunScope;
use collector_core::{ExecutorError, StepExecutor, UsageStatsSelector, YamlComponentStore};
use support::{portal, Harness};

fn executor(harness: &Harness) -> StepExecutor {
    StepExecutor::new(
        &harness.config,
        Arc::new(YamlComponentStore::new(harness.config.components_dir())),
        Arc::new(UsageStatsSelector::new()),
        Arc::new(NoPopups),
    )
}

fn executor_with(harness: &Harness, versions: Arc<UsageStatsSelector>) -> StepExecutor {
    StepExecutor::new(
        &harness.config,
        Arc::new(YamlComponentStore::new(harness.config.components_dir())),
        versions,
        Arc::new(NoPopups),
    )
}

fn scope(harness: &Harness) -> RunScope {
    RunScope::new(
        "demo",
        BTreeMap::from([(
            "account.username".to_string(),
            "shop-main@example.com".to_string(),
        )]),
        harness.config.downloads_dir(),
        harness.config.screenshots_dir(),
    )
}

fn page(harness: &Harness, script: PageScript) -> ScriptedPage {
    ScriptedPage::new(script, Some(harness.config.downloads_dir()))
}

#[tokio::test(start_paused = true)]
async fn fallback_selector_recovers_a_renamed_button() {
    let harness = Harness::new();
    harness.component(
        "open_reports",
        r##"
name: open_reports
platform: demo
steps:
  - action: click
    selector: "#reports-v1"
    fallbacks:
      - selector: "#login"
        description: new layout
"##,
    );
    let page = page(&harness, portal());

    let run = executor(&harness)
        .run_component(&page, "open_reports", &scope(&harness))
        .await
        .unwrap();

    assert!(!run.skipped);
    assert_eq!(page.actions(), vec!["click #login"]);
}

#[tokio::test(start_paused = true)]
async fn exhausted_fallbacks_report_every_reason() {
    let harness = Harness::new();
    harness.component(
        "open_reports",
        r##"
name: open_reports
platform: demo
steps:
  - action: click
    selector: "#reports-v1"
    description: open reports
    fallbacks:
      - selector: "#reports-v2"
      - selector: "#reports-v3"
"##,
    );
    let page = page(&harness, portal());

    let err = executor(&harness)
        .run_component(&page, "open_reports", &scope(&harness))
        .await
        .unwrap_err();

    let ExecutorError::StepExecution {
        index,
        label,
        reason,
    } = err
    else {
        panic!("expected a step failure, got {err}");
    };
    assert_eq!(index, 1);
    assert_eq!(label, "open reports");
    assert!(reason.contains("#reports-v2"), "{reason}");
    assert!(reason.contains("#reports-v3"), "{reason}");
}

#[tokio::test(start_paused = true)]
async fn prioritised_candidates_pick_the_first_present() {
    let harness = Harness::new();
    harness.component(
        "sign_in",
        r##"
name: sign_in
platform: demo
steps:
  - action: fill
    value: "{{account.username}}"
    selectors:
      - value: "#email"
        priority: 1
      - value: "#username"
        priority: 2
"##,
    );
    let page = page(&harness, portal());

    executor(&harness)
        .run_component(&page, "sign_in", &scope(&harness))
        .await
        .unwrap();

    assert_eq!(page.actions(), vec!["fill #username=shop-main@example.com"]);
}

#[tokio::test(start_paused = true)]
async fn absent_optional_steps_are_skipped() {
    let harness = Harness::new();
    harness.component(
        "sign_in",
        r##"
name: sign_in
platform: demo
steps:
  - action: click
    selector: "#accept-cookies"
    optional: true
  - action: check_element
    selector: "#promo-banner"
    on_fail: skip
  - action: click
    selector: "#login"
"##,
    );
    let page = page(&harness, portal());

    executor(&harness)
        .run_component(&page, "sign_in", &scope(&harness))
        .await
        .unwrap();

    assert_eq!(page.actions(), vec!["click #login"]);
}

#[tokio::test(start_paused = true)]
async fn required_step_failure_names_the_step() {
    let harness = Harness::new();
    harness.component(
        "sign_in",
        r##"
name: sign_in
platform: demo
steps:
  - action: click
    selector: "#login"
  - action: click
    selector: "#missing"
"##,
    );
    let page = page(&harness, portal());

    let err = executor(&harness)
        .run_component(&page, "sign_in", &scope(&harness))
        .await
        .unwrap_err();

    assert!(
        matches!(&err, ExecutorError::StepExecution { index: 2, label, .. } if label == "click"),
        "{err}"
    );
}

#[tokio::test(start_paused = true)]
async fn flaky_clicks_succeed_on_retry() {
    let harness = Harness::new();
    harness.component(
        "open_menu",
        r##"
name: open_menu
platform: demo
steps:
  - action: click
    selector: "#menu"
    max_retries: 2
"##,
    );
    let page = page(
        &harness,
        portal().element("#menu", ScriptedElement::new().failing_clicks(2)),
    );

    executor(&harness)
        .run_component(&page, "open_menu", &scope(&harness))
        .await
        .unwrap();

    assert_eq!(
        page.actions(),
        vec!["click-failed #menu", "click-failed #menu", "click #menu"]
    );
}

#[tokio::test(start_paused = true)]
async fn nested_components_receive_call_params() {
    let harness = Harness::new();
    harness.component(
        "choose_store",
        r##"
name: choose_store
platform: demo
steps:
  - action: fill
    selector: "#username"
    value: "{{params.store}}"
"##,
    );
    harness.component(
        "prepare",
        r##"
name: prepare
platform: demo
steps:
  - action: call_component
    component: choose_store
    params:
      store: north
  - action: click
    selector: "#login"
"##,
    );
    let page = page(&harness, portal());

    executor(&harness)
        .run_component(&page, "prepare", &scope(&harness))
        .await
        .unwrap();

    assert_eq!(page.actions(), vec!["fill #username=north", "click #login"]);
}

#[tokio::test(start_paused = true)]
async fn self_calling_components_stop_at_the_depth_limit() {
    let harness = Harness::new();
    harness.component(
        "recurse",
        r##"
name: recurse
platform: demo
steps:
  - action: call_component
    component: recurse
"##,
    );
    let page = page(&harness, portal());

    let err = executor(&harness)
        .run_component(&page, "recurse", &scope(&harness))
        .await
        .unwrap_err();

    assert!(err.to_string().contains("nesting deeper than"), "{err}");
}

#[tokio::test(start_paused = true)]
async fn fail_task_handler_turns_unmet_criteria_into_an_abort() {
    let harness = Harness::new();
    harness.component(
        "sign_in",
        r##"
name: sign_in
platform: demo
steps:
  - action: click
    selector: "#login"
success_criteria:
  - type: url_contains
    value: /reports
error_handlers:
  - selector: ".account-locked"
    action: fail_task
    message: account locked
"##,
    );
    let page = page(
        &harness,
        portal().element(".account-locked", ScriptedElement::new()),
    );

    let err = executor(&harness)
        .run_component(&page, "sign_in", &scope(&harness))
        .await
        .unwrap_err();

    assert!(
        matches!(&err, ExecutorError::HandlerAbort { message, .. } if message == "account locked"),
        "{err}"
    );
}

#[tokio::test(start_paused = true)]
async fn unmet_criteria_without_a_handler_fail_the_component() {
    let harness = Harness::new();
    harness.component(
        "sign_in",
        r##"
name: sign_in
platform: demo
steps:
  - action: click
    selector: "#login"
success_criteria:
  - type: url_contains
    value: /reports
  - type: element_exists
    selector: "#welcome"
    optional: true
"##,
    );
    let page = page(&harness, portal());

    let err = executor(&harness)
        .run_component(&page, "sign_in", &scope(&harness))
        .await
        .unwrap_err();

    assert!(matches!(err, ExecutorError::CriteriaFailed { .. }), "{err}");
}

#[tokio::test(start_paused = true)]
async fn failed_pre_check_skips_the_component() {
    let harness = Harness::new();
    harness.component(
        "finance_export",
        r##"
name: finance_export
platform: demo
pre_checks:
  - type: element_exists
    selector: "#finance-tab"
    timeout_ms: 500
steps:
  - action: click
    selector: "#login"
"##,
    );
    let page = page(&harness, portal());

    let run = executor(&harness)
        .run_component(&page, "finance_export", &scope(&harness))
        .await
        .unwrap();

    assert!(run.skipped);
    assert!(run.file.is_none());
    assert!(page.actions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn auto_detect_picks_up_a_download_started_by_a_click() {
    let harness = Harness::new();
    harness.component(
        "orders_export",
        r##"
name: orders_export
platform: demo
auto_detect_download: true
steps:
  - action: click
    selector: "#export-orders"
"##,
    );
    let page = page(&harness, portal());

    let run = executor(&harness)
        .run_component(&page, "orders_export", &scope(&harness))
        .await
        .unwrap();

    let file = run.file.expect("download detected");
    assert_eq!(file.file_name().unwrap(), "orders.csv");
    assert!(file.starts_with(harness.config.downloads_dir()));
}

#[tokio::test(start_paused = true)]
async fn challenge_behind_a_failed_step_pauses_with_a_screenshot() {
    let harness = Harness::new();
    harness.component(
        "orders_export",
        r##"
name: orders_export
platform: demo
steps:
  - action: click
    selector: "#open-products"
  - action: click
    selector: "#export-products"
"##,
    );
    let script = portal()
        .element(
            "#open-products",
            ScriptedElement::new().on_click(ClickEffect::Reveal(".captcha-container".into())),
        )
        .element(".captcha-container", ScriptedElement::hidden_until_revealed());
    let page = page(&harness, script);

    let err = executor(&harness)
        .run_component(&page, "orders_export", &scope(&harness))
        .await
        .unwrap_err();

    let ExecutorError::VerificationRequired {
        kind,
        screenshot_path,
    } = err
    else {
        panic!("expected a verification pause, got {err}");
    };
    assert_eq!(kind, "captcha");
    let screenshot = PathBuf::from(screenshot_path.expect("screenshot captured"));
    assert!(screenshot.exists());
    assert!(screenshot.starts_with(harness.config.screenshots_dir()));
}

const OVERLAY_REPORT: &str = r##"
name: open_reports
platform: demo
steps:
  - action: click
    selector: "#login"
success_criteria:
  - type: element_visible
    selector: "#report-grid"
error_handlers:
  - selector: ".modal-overlay"
    action: close_popup
    close_selector: "#close-modal"
"##;

#[tokio::test(start_paused = true)]
async fn close_popup_handler_clears_the_overlay_and_verifies_again() {
    let harness = Harness::new();
    harness.component("open_reports", OVERLAY_REPORT);
    let script = portal()
        .element(".modal-overlay", ScriptedElement::new())
        .element(
            "#close-modal",
            ScriptedElement::new()
                .on_click(ClickEffect::Remove(".modal-overlay".into()))
                .on_click(ClickEffect::Reveal("#report-grid".into())),
        )
        .element("#report-grid", ScriptedElement::hidden_until_revealed());
    let page = page(&harness, script);

    let run = executor(&harness)
        .run_component(&page, "open_reports", &scope(&harness))
        .await
        .unwrap();

    assert!(!run.skipped);
    assert_eq!(page.actions(), vec!["click #login", "click #close-modal"]);
}

#[tokio::test(start_paused = true)]
async fn criteria_still_unmet_after_close_popup_fail_the_component() {
    let harness = Harness::new();
    harness.component("open_reports", OVERLAY_REPORT);
    let script = portal()
        .element(".modal-overlay", ScriptedElement::new())
        .element(
            "#close-modal",
            ScriptedElement::new().on_click(ClickEffect::Remove(".modal-overlay".into())),
        );
    let page = page(&harness, script);

    let err = executor(&harness)
        .run_component(&page, "open_reports", &scope(&harness))
        .await
        .unwrap_err();

    assert!(
        matches!(&err, ExecutorError::CriteriaFailed { reason, .. } if reason.contains("#report-grid")),
        "{err}"
    );
    assert!(page.actions().contains(&"click #close-modal".to_string()));
}

#[tokio::test(start_paused = true)]
async fn plain_wait_reports_driver_failures_as_they_are() {
    let harness = Harness::new();
    harness.component(
        "open_reports",
        r##"
name: open_reports
platform: demo
steps:
  - action: click
    selector: "#open-products"
  - action: wait
    selector: "#report-grid"
    smart: false
    timeout_ms: 2000
    max_retries: 0
"##,
    );
    let page = page(
        &harness,
        portal().element(
            "#open-products",
            ScriptedElement::new().on_click(ClickEffect::Crash),
        ),
    );

    let err = executor(&harness)
        .run_component(&page, "open_reports", &scope(&harness))
        .await
        .unwrap_err();

    let ExecutorError::StepExecution { index, reason, .. } = err else {
        panic!("expected a step failure, got {err}");
    };
    assert_eq!(index, 2);
    assert!(reason.contains("page closed"), "{reason}");
    assert!(!reason.contains("timed out"), "{reason}");
}

#[tokio::test(start_paused = true)]
async fn missing_version_file_falls_back_to_the_default_component() {
    let harness = Harness::new();
    harness.component(
        "open_reports",
        r##"
name: open_reports
platform: demo
steps:
  - action: click
    selector: "#login"
"##,
    );
    let versions = Arc::new(UsageStatsSelector::new().pin("open_reports", "2.0"));
    let page = page(&harness, portal());

    let run = executor_with(&harness, versions.clone())
        .run_component(&page, "open_reports", &scope(&harness))
        .await
        .unwrap();

    assert_eq!(run.version, None);
    assert_eq!(page.actions(), vec!["click #login"]);
    assert_eq!(versions.stats("open_reports", None).successes, 1);
    assert_eq!(versions.stats("open_reports", Some("2.0")).runs, 0);
}

#[tokio::test(start_paused = true)]
async fn selected_version_file_is_used_when_present() {
    let harness = Harness::new();
    harness.component(
        "open_reports@2.0",
        r##"
name: open_reports
platform: demo
version: "2.0"
steps:
  - action: click
    selector: "#open-products"
"##,
    );
    let versions = Arc::new(UsageStatsSelector::new().pin("open_reports", "2.0"));
    let page = page(&harness, portal());

    let run = executor_with(&harness, versions.clone())
        .run_component(&page, "open_reports", &scope(&harness))
        .await
        .unwrap();

    assert_eq!(run.version.as_deref(), Some("2.0"));
    assert_eq!(page.actions(), vec!["click #open-products"]);
    assert_eq!(versions.stats("open_reports", Some("2.0")).runs, 1);
}
