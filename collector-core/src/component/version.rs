use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde::Serialize;
use tracing::debug;

/// Chooses which version of a component to load and collects usage outcomes.
#[async_trait]
pub trait VersionSelector: Send + Sync {
    /// `None` means "load the unversioned file".
    async fn select_version(
        &self,
        component: &str,
        force_version: Option<&str>,
        ab_test: bool,
    ) -> Option<String>;

    async fn record_usage(&self, component: &str, version: Option<&str>, success: bool);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsageStats {
    pub runs: u64,
    pub successes: u64,
}

impl UsageStats {
    pub fn success_rate(&self) -> f64 {
        if self.runs == 0 {
            0.0
        } else {
            self.successes as f64 / self.runs as f64
        }
    }
}

/// In-memory selector: pinned versions win, A/B candidates are drawn
/// uniformly, everything else uses the default file.
#[derive(Debug, Default)]
pub struct UsageStatsSelector {
    pinned: HashMap<String, String>,
    candidates: HashMap<String, Vec<String>>,
    stats: Mutex<BTreeMap<(String, String), UsageStats>>,
}

impl UsageStatsSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pin(mut self, component: impl Into<String>, version: impl Into<String>) -> Self {
        self.pinned.insert(component.into(), version.into());
        self
    }

    pub fn ab_candidates(mut self, component: impl Into<String>, versions: Vec<String>) -> Self {
        self.candidates.insert(component.into(), versions);
        self
    }

    pub fn stats(&self, component: &str, version: Option<&str>) -> UsageStats {
        let key = (component.to_string(), version.unwrap_or("default").to_string());
        self.stats
            .lock()
            .map(|stats| stats.get(&key).copied().unwrap_or_default())
            .unwrap_or_default()
    }
}

#[async_trait]
impl VersionSelector for UsageStatsSelector {
    async fn select_version(
        &self,
        component: &str,
        force_version: Option<&str>,
        ab_test: bool,
    ) -> Option<String> {
        if let Some(forced) = force_version {
            return Some(forced.to_string());
        }
        if let Some(pinned) = self.pinned.get(component) {
            return Some(pinned.clone());
        }
        if ab_test {
            let choice = self
                .candidates
                .get(component)
                .and_then(|versions| versions.choose(&mut rand::thread_rng()).cloned());
            if let Some(version) = &choice {
                debug!(component, version = %version, "a/b version selected");
            }
            return choice;
        }
        None
    }

    async fn record_usage(&self, component: &str, version: Option<&str>, success: bool) {
        let key = (component.to_string(), version.unwrap_or("default").to_string());
        if let Ok(mut stats) = self.stats.lock() {
            let entry = stats.entry(key).or_default();
            entry.runs += 1;
            if success {
                entry.successes += 1;
            }
        }
    }
}

/// Selector used when no versioning is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultVersion;

#[async_trait]
impl VersionSelector for DefaultVersion {
    async fn select_version(&self, _: &str, force_version: Option<&str>, _: bool) -> Option<String> {
        force_version.map(str::to_string)
    }

    async fn record_usage(&self, _: &str, _: Option<&str>, _: bool) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn forced_then_pinned_then_ab() {
        let selector = UsageStatsSelector::new()
            .pin("login", "3")
            .ab_candidates("orders_export", vec!["a".into(), "b".into()]);

        assert_eq!(
            selector.select_version("login", Some("1"), false).await.as_deref(),
            Some("1")
        );
        assert_eq!(selector.select_version("login", None, true).await.as_deref(), Some("3"));
        let picked = selector.select_version("orders_export", None, true).await;
        assert!(matches!(picked.as_deref(), Some("a") | Some("b")));
        assert_eq!(selector.select_version("orders_export", None, false).await, None);
    }

    #[tokio::test]
    async fn records_success_rate() {
        let selector = UsageStatsSelector::new();
        selector.record_usage("login", None, true).await;
        selector.record_usage("login", None, false).await;
        selector.record_usage("login", Some("2"), true).await;

        let stats = selector.stats("login", None);
        assert_eq!(stats.runs, 2);
        assert!((stats.success_rate() - 0.5).abs() < f64::EPSILON);
        assert_eq!(selector.stats("login", Some("2")).successes, 1);
    }
}
