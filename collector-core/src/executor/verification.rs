use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Local;
use tracing::{info, warn};

use crate::browser::{ElementState, Locator, Page};
use crate::config::VerificationSection;

use super::error::ExecutorError;

/// Looks for human-verification challenges (captcha, slider, SMS prompt) on
/// the current page.
#[derive(Debug, Clone)]
pub struct ChallengeDetector {
    enabled: bool,
    probe: Duration,
    challenges: Vec<(String, Locator)>,
}

impl ChallengeDetector {
    pub fn new(config: &VerificationSection) -> Self {
        Self {
            enabled: config.enabled,
            probe: Duration::from_millis(config.probe_ms),
            challenges: config
                .challenges
                .iter()
                .map(|challenge| (challenge.kind.clone(), Locator::parse(&challenge.selector)))
                .collect(),
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            probe: Duration::ZERO,
            challenges: Vec::new(),
        }
    }

    /// Kind of the first visible challenge.
    pub async fn detect(&self, page: &dyn Page) -> Option<String> {
        if !self.enabled {
            return None;
        }
        for (kind, locator) in &self.challenges {
            if page
                .wait_for(locator, ElementState::Visible, self.probe)
                .await
                .is_ok()
            {
                return Some(kind.clone());
            }
        }
        None
    }

    /// Detects a challenge and, if present, captures the page and returns the
    /// pause error.
    pub async fn check(
        &self,
        page: &dyn Page,
        platform: &str,
        screenshot_dir: &Path,
    ) -> Option<ExecutorError> {
        let kind = self.detect(page).await?;
        let path = screenshot_dir.join(screenshot_name(platform));
        let screenshot_path = match page.screenshot(&path).await {
            Ok(()) => Some(path.to_string_lossy().into_owned()),
            Err(err) => {
                warn!(platform, error = %err, "failed to capture verification screenshot");
                None
            }
        };
        info!(platform, kind = %kind, "verification challenge detected");
        Some(ExecutorError::VerificationRequired {
            kind,
            screenshot_path,
        })
    }
}

fn screenshot_name(platform: &str) -> PathBuf {
    PathBuf::from(format!(
        "verification_{platform}_{}.png",
        Local::now().format("%Y%m%d_%H%M%S")
    ))
}
