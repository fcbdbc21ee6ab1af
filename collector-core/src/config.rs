use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ConfigError, Result};

const MAX_TASKS_ENV: &str = "COLLECTOR_MAX_TASKS";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CollectorConfig {
    pub paths: PathsSection,
    #[serde(default)]
    pub admission: AdmissionSection,
    #[serde(default)]
    pub executor: ExecutorSection,
    #[serde(default)]
    pub smart_wait: SmartWaitSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub verification: VerificationSection,
    #[serde(default)]
    pub popups: PopupSection,
    #[serde(default)]
    pub chromium: ChromiumSection,
}

impl CollectorConfig {
    /// Default layout under `base_dir`, with every other section at its defaults.
    pub fn rooted_at(base_dir: impl AsRef<Path>) -> Self {
        Self {
            paths: PathsSection {
                base_dir: base_dir.as_ref().to_string_lossy().into_owned(),
                tasks_db: "data/tasks.sqlite".into(),
                components_dir: "components".into(),
                downloads_dir: "downloads".into(),
                screenshots_dir: "screenshots".into(),
                accounts_file: "accounts.toml".into(),
            },
            admission: AdmissionSection::default(),
            executor: ExecutorSection::default(),
            smart_wait: SmartWaitSection::default(),
            retry: RetrySection::default(),
            verification: VerificationSection::default(),
            popups: PopupSection::default(),
            chromium: ChromiumSection::default(),
        }
    }

    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.paths.base_dir).join(path)
        }
    }

    pub fn tasks_db(&self) -> PathBuf {
        self.resolve_path(&self.paths.tasks_db)
    }

    pub fn components_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.components_dir)
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.downloads_dir)
    }

    pub fn screenshots_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.screenshots_dir)
    }

    pub fn accounts_file(&self) -> PathBuf {
        self.resolve_path(&self.paths.accounts_file)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(raw) = std::env::var(MAX_TASKS_ENV) {
            match raw.trim().parse::<usize>() {
                Ok(value) if value > 0 => self.admission.max_concurrent_tasks = value,
                _ => warn!(value = %raw, "ignoring invalid {MAX_TASKS_ENV}"),
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.admission.max_concurrent_tasks == 0 {
            return Err(ConfigError::Invalid {
                key: "admission.max_concurrent_tasks".into(),
                reason: "must be at least 1".into(),
            });
        }
        if self.executor.max_parallel == 0 {
            return Err(ConfigError::Invalid {
                key: "executor.max_parallel".into(),
                reason: "must be at least 1".into(),
            });
        }
        if self.retry.multiplier < 1.0 {
            return Err(ConfigError::Invalid {
                key: "retry.multiplier".into(),
                reason: "must be >= 1.0".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub base_dir: String,
    pub tasks_db: String,
    pub components_dir: String,
    pub downloads_dir: String,
    pub screenshots_dir: String,
    pub accounts_file: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdmissionSection {
    pub max_concurrent_tasks: usize,
    pub queue_scan_limit: usize,
}

impl Default for AdmissionSection {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 3,
            queue_scan_limit: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorSection {
    pub step_timeout_ms: u64,
    pub max_retries: u32,
    pub optional_probe_ms: u64,
    pub selector_probe_ms: u64,
    pub download_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub max_component_depth: usize,
    pub login_component: String,
    pub parallel_enabled: bool,
    pub max_parallel: usize,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            step_timeout_ms: 30_000,
            max_retries: 2,
            optional_probe_ms: 1_000,
            selector_probe_ms: 1_000,
            download_timeout_ms: 120_000,
            poll_interval_ms: 100,
            max_component_depth: 4,
            login_component: "login".into(),
            parallel_enabled: false,
            max_parallel: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SmartWaitSection {
    pub quick_probe_ms: u64,
    pub after_popup_ms: u64,
    pub network_idle_ms: u64,
    pub after_idle_ms: u64,
}

impl Default for SmartWaitSection {
    fn default() -> Self {
        Self {
            quick_probe_ms: 1_000,
            after_popup_ms: 10_000,
            network_idle_ms: 5_000,
            after_idle_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed,
    Linear,
    Exponential,
}

/// Delay schedule between step attempts. Also accepted per step under `retry:`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub strategy: BackoffStrategy,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Fixed,
            base_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 60_000,
            jitter_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeSelector {
    pub kind: String,
    pub selector: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VerificationSection {
    pub enabled: bool,
    pub probe_ms: u64,
    pub challenges: Vec<ChallengeSelector>,
}

impl Default for VerificationSection {
    fn default() -> Self {
        let challenge = |kind: &str, selector: &str| ChallengeSelector {
            kind: kind.to_string(),
            selector: selector.to_string(),
        };
        Self {
            enabled: true,
            probe_ms: 500,
            challenges: vec![
                challenge("captcha", "[class*=\"captcha\"]"),
                challenge("verification", "[class*=\"verify\"]"),
                challenge("slider", "[class*=\"slider\"]"),
                challenge("captcha", "#captcha"),
                challenge("captcha", ".captcha-container"),
            ],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PopupSection {
    pub close_selectors: Vec<String>,
    pub probe_ms: u64,
    pub settle_ms: u64,
}

impl Default for PopupSection {
    fn default() -> Self {
        Self {
            close_selectors: vec![
                "[aria-label=\"Close\"]".into(),
                ".modal .close".into(),
                ".ant-modal-close".into(),
                "text=Got it".into(),
                "text=I know".into(),
            ],
            probe_ms: 300,
            settle_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChromiumSection {
    pub executable_path: Option<String>,
    pub headless: bool,
    pub sandbox: bool,
    pub disable_gpu: bool,
    pub request_timeout_seconds: Option<u64>,
    pub window_size: [u32; 2],
    pub extra_args: Vec<String>,
}

impl Default for ChromiumSection {
    fn default() -> Self {
        Self {
            executable_path: None,
            headless: true,
            sandbox: true,
            disable_gpu: true,
            request_timeout_seconds: Some(60),
            window_size: [1920, 1080],
            extra_args: Vec::new(),
        }
    }
}

pub fn load_collector_config<P: AsRef<Path>>(path: P) -> Result<CollectorConfig> {
    let mut config: CollectorConfig = load_toml(path)?;
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

pub(crate) fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_fixture_config() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/collector.toml");
        let config = load_toml::<CollectorConfig, _>(path).expect("config should parse");
        assert_eq!(config.admission.max_concurrent_tasks, 3);
        assert_eq!(config.executor.max_retries, 2);
        assert!(!config.verification.challenges.is_empty());
        assert!(config.tasks_db().ends_with("tasks.sqlite"));
    }

    #[test]
    fn sections_fall_back_to_defaults() {
        let config: CollectorConfig = toml::from_str(
            r#"
[paths]
base_dir = "/srv/collector"
tasks_db = "data/tasks.sqlite"
components_dir = "components"
downloads_dir = "downloads"
screenshots_dir = "screenshots"
accounts_file = "/etc/collector/accounts.toml"

[smart_wait]
quick_probe_ms = 250
"#,
        )
        .unwrap();
        assert_eq!(config.smart_wait.quick_probe_ms, 250);
        assert_eq!(config.smart_wait.after_popup_ms, 10_000);
        assert_eq!(config.admission.queue_scan_limit, 5);
        assert_eq!(config.retry.strategy, BackoffStrategy::Fixed);
        assert_eq!(
            config.tasks_db(),
            PathBuf::from("/srv/collector/data/tasks.sqlite")
        );
        assert_eq!(
            config.accounts_file(),
            PathBuf::from("/etc/collector/accounts.toml")
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rooted_layout_uses_relative_defaults() {
        let config = CollectorConfig::rooted_at("/tmp/collector");
        assert_eq!(
            config.components_dir(),
            PathBuf::from("/tmp/collector/components")
        );
        assert_eq!(config.executor.max_retries, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_zero_parallelism() {
        let mut config: CollectorConfig = toml::from_str(
            r#"
[paths]
base_dir = "."
tasks_db = "tasks.sqlite"
components_dir = "components"
downloads_dir = "downloads"
screenshots_dir = "screenshots"
accounts_file = "accounts.toml"
"#,
        )
        .unwrap();
        config.executor.max_parallel = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { .. })
        ));
    }
}
