#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;

use chrono::NaiveDate;
use collector_core::browser::scripted::{
    ClickEffect, PageScript, ScriptedBrowser, ScriptedElement,
};
use collector_core::browser::{AlwaysLogin, NoPopups};
use collector_core::task::TaskFields;
use collector_core::{
    AccountBook, AccountProfile, Collaborators, CollectorConfig, NewTask, SqliteTaskStore, Task,
    TaskStatus, UsageStatsSelector, YamlComponentStore,
};
use tempfile::TempDir;

pub const LOGIN: &str = r##"
name: login
platform: demo
steps:
  - action: navigate
    url: https://seller.example/login
  - action: fill
    selector: "#username"
    value: "{{account.username}}"
  - action: click
    selector: "#login"
success_criteria:
  - type: url_contains
    value: /dashboard
"##;

pub const ORDERS_EXPORT: &str = r##"
name: orders_export
platform: demo
steps:
  - action: navigate
    url: "https://seller.example/{{params.data_domain}}?from={{params.date_from}}"
  - action: await_download
    selector: "#export-orders"
"##;

pub const PRODUCTS_EXPORT: &str = r##"
name: products_export
platform: demo
steps:
  - action: navigate
    url: https://seller.example/products
  - action: click
    selector: "#open-products"
  - action: await_download
    selector: "#export-products"
"##;

/// Temp workspace with a task database, a component directory and
/// configuration tuned for paused-clock tests.
pub struct Harness {
    pub dir: TempDir,
    pub config: CollectorConfig,
    pub store: SqliteTaskStore,
}

impl Harness {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = CollectorConfig::rooted_at(dir.path());
        config.executor.step_timeout_ms = 2_000;
        config.executor.max_retries = 0;
        config.executor.selector_probe_ms = 200;
        config.executor.optional_probe_ms = 200;
        config.executor.download_timeout_ms = 3_000;
        config.retry.base_delay_ms = 100;
        config.verification.probe_ms = 100;
        let store = SqliteTaskStore::new(config.tasks_db()).unwrap();
        store.initialize().unwrap();
        fs::create_dir_all(config.components_dir().join("demo")).unwrap();
        let harness = Self { dir, config, store };
        harness.component("login", LOGIN);
        harness
    }

    pub fn component(&self, name: &str, yaml: &str) {
        let path = self
            .config
            .components_dir()
            .join("demo")
            .join(format!("{name}.yaml"));
        fs::write(path, yaml).unwrap();
    }

    pub fn new_task(&self, account: &str, domains: &[&str]) -> NewTask {
        let day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        NewTask::new(
            "demo",
            account,
            domains.iter().map(|d| d.to_string()).collect(),
            day,
            day,
        )
    }

    pub fn insert_pending(&self, account: &str, domains: &[&str]) -> Task {
        self.store.insert(&self.new_task(account, domains)).unwrap()
    }

    /// Inserts a task and moves it straight to `running`, as admission would.
    pub fn insert_running(&self, task: NewTask) -> Task {
        let task = self.store.insert(&task).unwrap();
        self.store
            .update_status(
                task.id,
                TaskStatus::Running,
                Some(task.version),
                Some(TaskStatus::Pending),
                &TaskFields::default(),
            )
            .unwrap();
        self.store.get(task.id).unwrap()
    }

    pub fn collaborators(&self, browser: ScriptedBrowser) -> Collaborators {
        Collaborators {
            store: self.store.clone(),
            components: Arc::new(YamlComponentStore::new(self.config.components_dir())),
            versions: Arc::new(UsageStatsSelector::new()),
            popups: Arc::new(NoPopups),
            sessions: Arc::new(AlwaysLogin),
            accounts: Arc::new(AccountBook {
                accounts: vec![account("shop-main"), account("shop-second")],
            }),
            browser: Arc::new(browser),
        }
    }
}

pub fn account(id: &str) -> AccountProfile {
    AccountProfile {
        id: id.to_string(),
        platform: "demo".into(),
        label: None,
        credentials: BTreeMap::from([("username".to_string(), format!("{id}@example.com"))]),
        capabilities: BTreeMap::from([("finance".to_string(), false)]),
    }
}

fn download(file_name: &str) -> ClickEffect {
    ClickEffect::Download {
        file_name: file_name.to_string(),
        contents: b"id,total\n1,9.90\n".to_vec(),
    }
}

/// A seller portal where login works and the orders export downloads a file.
/// Products and reviews exports are opt-in.
pub fn portal() -> PageScript {
    PageScript::new("about:blank")
        .element("#username", ScriptedElement::new())
        .element(
            "#login",
            ScriptedElement::new().on_click(ClickEffect::Navigate(
                "https://seller.example/dashboard".into(),
            )),
        )
        .element(
            "#export-orders",
            ScriptedElement::new().on_click(download("orders.csv")),
        )
        .element("#open-products", ScriptedElement::new())
}

pub fn with_products(script: PageScript) -> PageScript {
    script.element(
        "#export-products",
        ScriptedElement::new().on_click(download("products.csv")),
    )
}

/// Opening the products page raises a captcha and the export never appears.
pub fn with_products_captcha(script: PageScript) -> PageScript {
    script
        .element(
            "#open-products",
            ScriptedElement::new().on_click(ClickEffect::Reveal(".captcha-container".into())),
        )
        .element(".captcha-container", ScriptedElement::hidden_until_revealed())
}
