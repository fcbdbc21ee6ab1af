use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::account::AccountProfile;
use crate::task::{FailedDomain, Task, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// One unit of domain work: a data domain, optionally narrowed to a sub-domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainKey {
    pub domain: String,
    pub sub: Option<String>,
}

impl DomainKey {
    pub fn key(&self) -> String {
        match &self.sub {
            Some(sub) => format!("{}:{sub}", self.domain),
            None => self.domain.clone(),
        }
    }

    /// Component names to try, most specific first.
    pub fn component_names(&self) -> Vec<String> {
        let generic = format!("{}_export", self.domain);
        match &self.sub {
            Some(sub) => vec![format!("{}_{sub}_export", self.domain), generic],
            None => vec![generic],
        }
    }
}

/// Runtime state of one task execution. Rebuilt from the persisted row on
/// resume; the completed and failed sets are kept disjoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskContext {
    pub task_row_id: i64,
    pub task_id: String,
    pub platform: String,
    pub account_id: String,
    pub data_domains: Vec<String>,
    pub sub_domains: Option<Vec<String>>,
    pub date_range: DateRange,
    pub granularity: String,
    pub current_component_index: usize,
    pub current_data_domain_index: usize,
    pub collected_files: Vec<String>,
    pub completed_domains: Vec<String>,
    pub failed_domains: Vec<FailedDomain>,
    pub verification_required: bool,
    pub verification_type: Option<String>,
    pub screenshot_path: Option<String>,
    pub download_dir: PathBuf,
    pub screenshot_dir: PathBuf,
}

impl TaskContext {
    /// Builds the context for `task`, carrying over any domain progress the
    /// row already records. Per-task directories live under the given roots.
    pub fn from_task(task: &Task, downloads_root: &Path, screenshots_root: &Path) -> Self {
        let mut context = Self {
            task_row_id: task.id,
            task_id: task.task_id.clone(),
            platform: task.platform.clone(),
            account_id: task.account_id.clone(),
            data_domains: task.data_domains.clone(),
            sub_domains: task.sub_domains.clone().filter(|subs| !subs.is_empty()),
            date_range: DateRange {
                start: task.date_from,
                end: task.date_to,
            },
            granularity: task.granularity.clone(),
            current_component_index: 0,
            current_data_domain_index: 0,
            collected_files: task.collected_files.clone(),
            completed_domains: Vec::new(),
            failed_domains: Vec::new(),
            verification_required: false,
            verification_type: None,
            screenshot_path: None,
            download_dir: downloads_root.join(&task.task_id),
            screenshot_dir: screenshots_root.join(&task.task_id),
        };
        for key in &task.completed_domains {
            context.record_success(key, None);
        }
        for failed in &task.failed_domains {
            context.record_failure(&failed.domain, &failed.error);
        }
        context
    }

    /// Drops domains the account cannot export and returns them.
    pub fn retain_supported(&mut self, account: &AccountProfile) -> Vec<String> {
        let (supported, rejected) = account.filter_domains(&self.data_domains);
        self.data_domains = supported;
        rejected
    }

    /// Every domain key in execution order: domains in caller order, each
    /// expanded over the sub-domains when any are set.
    pub fn domain_keys(&self) -> Vec<DomainKey> {
        let mut keys = Vec::new();
        for domain in &self.data_domains {
            match &self.sub_domains {
                Some(subs) => keys.extend(subs.iter().map(|sub| DomainKey {
                    domain: domain.clone(),
                    sub: Some(sub.clone()),
                })),
                None => keys.push(DomainKey {
                    domain: domain.clone(),
                    sub: None,
                }),
            }
        }
        keys
    }

    pub fn total_domains(&self) -> usize {
        let subs = self.sub_domains.as_ref().map_or(1, Vec::len);
        self.data_domains.len() * subs
    }

    pub fn is_settled(&self, key: &str) -> bool {
        self.completed_domains.iter().any(|done| done == key)
            || self.failed_domains.iter().any(|failed| failed.domain == key)
    }

    pub fn pending_keys(&self) -> Vec<DomainKey> {
        self.domain_keys()
            .into_iter()
            .filter(|key| !self.is_settled(&key.key()))
            .collect()
    }

    pub fn record_success(&mut self, key: &str, file: Option<String>) {
        self.failed_domains.retain(|failed| failed.domain != key);
        if !self.completed_domains.iter().any(|done| done == key) {
            self.completed_domains.push(key.to_string());
        }
        if let Some(file) = file {
            if !self.collected_files.contains(&file) {
                self.collected_files.push(file);
            }
        }
    }

    /// Records a failure unless the key already completed; a repeated failure
    /// replaces the earlier error.
    pub fn record_failure(&mut self, key: &str, error: &str) {
        if self.completed_domains.iter().any(|done| done == key) {
            return;
        }
        self.failed_domains.retain(|failed| failed.domain != key);
        self.failed_domains.push(FailedDomain {
            domain: key.to_string(),
            error: error.to_string(),
        });
    }

    pub fn request_verification(&mut self, kind: &str, screenshot_path: Option<String>) {
        self.verification_required = true;
        self.verification_type = Some(kind.to_string());
        self.screenshot_path = screenshot_path;
    }

    pub fn clear_verification(&mut self) {
        self.verification_required = false;
        self.verification_type = None;
        self.screenshot_path = None;
    }

    pub fn classify(&self) -> TaskStatus {
        classify_outcome(self.completed_domains.len(), self.failed_domains.len())
    }

    /// `{{params.*}}` and `{{task.*}}` values for component substitution.
    pub fn template_params(&self) -> BTreeMap<String, String> {
        let mut params = BTreeMap::new();
        params.insert("params.date_from".into(), self.date_range.start.to_string());
        params.insert("params.date_to".into(), self.date_range.end.to_string());
        params.insert("params.granularity".into(), self.granularity.clone());
        params.insert("task.id".into(), self.task_id.clone());
        params.insert("task.platform".into(), self.platform.clone());
        params.insert(
            "task.download_dir".into(),
            self.download_dir.to_string_lossy().into_owned(),
        );
        params.insert(
            "task.screenshot_dir".into(),
            self.screenshot_dir.to_string_lossy().into_owned(),
        );
        params
    }
}

/// Final status from domain-set sizes alone.
pub fn classify_outcome(completed: usize, failed: usize) -> TaskStatus {
    match (completed, failed) {
        (_, 0) => TaskStatus::Completed,
        (0, _) => TaskStatus::Failed,
        _ => TaskStatus::PartialSuccess,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionResult {
    pub task_id: String,
    pub status: TaskStatus,
    pub files_collected: usize,
    pub collected_files: Vec<String>,
    pub error_message: Option<String>,
    pub duration_seconds: f64,
    pub completed_domains: Vec<String>,
    pub failed_domains: Vec<FailedDomain>,
    pub total_domains: usize,
}

impl CollectionResult {
    pub fn from_context(
        context: &TaskContext,
        status: TaskStatus,
        error_message: Option<String>,
        duration_seconds: f64,
    ) -> Self {
        Self {
            task_id: context.task_id.clone(),
            status,
            files_collected: context.collected_files.len(),
            collected_files: context.collected_files.clone(),
            error_message,
            duration_seconds,
            completed_domains: context.completed_domains.clone(),
            failed_domains: context.failed_domains.clone(),
            total_domains: context.total_domains(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(domains: &[&str], subs: Option<&[&str]>) -> TaskContext {
        let day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        TaskContext {
            task_row_id: 1,
            task_id: "t-1".into(),
            platform: "demo".into(),
            account_id: "shop-main".into(),
            data_domains: domains.iter().map(|d| d.to_string()).collect(),
            sub_domains: subs.map(|subs| subs.iter().map(|s| s.to_string()).collect()),
            date_range: DateRange {
                start: day,
                end: day,
            },
            granularity: "daily".into(),
            current_component_index: 0,
            current_data_domain_index: 0,
            collected_files: Vec::new(),
            completed_domains: Vec::new(),
            failed_domains: Vec::new(),
            verification_required: false,
            verification_type: None,
            screenshot_path: None,
            download_dir: PathBuf::from("/tmp/downloads/t-1"),
            screenshot_dir: PathBuf::from("/tmp/screens/t-1"),
        }
    }

    #[test]
    fn classification_follows_set_sizes() {
        assert_eq!(classify_outcome(0, 0), TaskStatus::Completed);
        assert_eq!(classify_outcome(3, 0), TaskStatus::Completed);
        assert_eq!(classify_outcome(0, 2), TaskStatus::Failed);
        assert_eq!(classify_outcome(1, 1), TaskStatus::PartialSuccess);
    }

    #[test]
    fn sub_domains_expand_each_domain() {
        let ctx = context(&["services", "orders"], Some(&["agent", "ai"]));
        let keys: Vec<String> = ctx.domain_keys().iter().map(DomainKey::key).collect();
        assert_eq!(
            keys,
            vec!["services:agent", "services:ai", "orders:agent", "orders:ai"]
        );
        assert_eq!(ctx.total_domains(), 4);
        assert_eq!(
            ctx.domain_keys()[0].component_names(),
            vec!["services_agent_export", "services_export"]
        );
    }

    #[test]
    fn success_and_failure_stay_disjoint() {
        let mut ctx = context(&["orders", "products"], None);
        ctx.record_failure("orders", "timeout");
        ctx.record_success("orders", Some("/tmp/orders.csv".into()));
        ctx.record_failure("orders", "late failure");
        ctx.record_failure("products", "first");
        ctx.record_failure("products", "second");

        assert_eq!(ctx.completed_domains, vec!["orders"]);
        assert_eq!(ctx.failed_domains.len(), 1);
        assert_eq!(ctx.failed_domains[0].error, "second");
        assert!(ctx.pending_keys().is_empty());
        assert_eq!(ctx.classify(), TaskStatus::PartialSuccess);
    }

    #[test]
    fn unsupported_domains_are_dropped() {
        let mut ctx = context(&["orders", "finance", "products"], None);
        let account = AccountProfile {
            id: "shop-main".into(),
            platform: "demo".into(),
            label: None,
            credentials: BTreeMap::new(),
            capabilities: BTreeMap::from([("finance".to_string(), false)]),
        };
        assert_eq!(ctx.retain_supported(&account), vec!["finance"]);
        assert_eq!(ctx.data_domains, vec!["orders", "products"]);
    }

    #[test]
    fn template_params_expose_dates_and_dirs() {
        let ctx = context(&["orders"], None);
        let params = ctx.template_params();
        assert_eq!(params["params.date_from"], "2024-03-01");
        assert_eq!(params["task.download_dir"], "/tmp/downloads/t-1");
    }
}
