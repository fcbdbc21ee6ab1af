use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::debug;

use crate::config::PopupSection;

use super::driver::{ElementState, Locator, Page};

/// Clears modal obstructions. Never fails: a dismissal problem must not turn
/// into a step failure.
#[async_trait(?Send)]
pub trait PopupDismisser {
    async fn dismiss(&self, page: &dyn Page, platform: &str) -> usize;
}

/// Clicks every configured close button that is currently visible.
#[derive(Debug, Clone)]
pub struct SelectorPopupDismisser {
    common: Vec<Locator>,
    per_platform: BTreeMap<String, Vec<Locator>>,
    probe: Duration,
    settle: Duration,
}

impl SelectorPopupDismisser {
    pub fn new(config: &PopupSection) -> Self {
        Self {
            common: config
                .close_selectors
                .iter()
                .map(|selector| Locator::parse(selector))
                .collect(),
            per_platform: BTreeMap::new(),
            probe: Duration::from_millis(config.probe_ms),
            settle: Duration::from_millis(config.settle_ms),
        }
    }

    pub fn with_platform_selectors(mut self, platform: &str, selectors: &[String]) -> Self {
        self.per_platform.insert(
            platform.to_string(),
            selectors.iter().map(|selector| Locator::parse(selector)).collect(),
        );
        self
    }
}

#[async_trait(?Send)]
impl PopupDismisser for SelectorPopupDismisser {
    async fn dismiss(&self, page: &dyn Page, platform: &str) -> usize {
        let specific = self
            .per_platform
            .get(platform)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let mut closed = 0usize;
        for locator in specific.iter().chain(self.common.iter()) {
            if page
                .wait_for(locator, ElementState::Visible, self.probe)
                .await
                .is_err()
            {
                continue;
            }
            match page.click(locator, self.probe).await {
                Ok(()) => {
                    closed += 1;
                    sleep(self.settle).await;
                }
                Err(err) => debug!(selector = %locator, error = %err, "popup close click failed"),
            }
        }
        if closed > 0 {
            debug!(platform, closed, "dismissed popups");
        }
        closed
    }
}

/// Dismisser for contexts where no obstruction handling is wanted.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPopups;

#[async_trait(?Send)]
impl PopupDismisser for NoPopups {
    async fn dismiss(&self, _page: &dyn Page, _platform: &str) -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::scripted::{ClickEffect, PageScript, ScriptedElement, ScriptedPage};

    #[tokio::test(start_paused = true)]
    async fn clicks_visible_close_buttons_only() {
        let page = ScriptedPage::new(
            PageScript::new("https://seller.example/home")
                .element(
                    ".promo .close",
                    ScriptedElement::new().on_click(ClickEffect::Remove(".promo".into())),
                )
                .element(".promo", ScriptedElement::new())
                .element(".cookie .close", ScriptedElement::new().invisible()),
            None,
        );
        let dismisser = SelectorPopupDismisser::new(&PopupSection {
            close_selectors: vec![".cookie .close".into(), ".missing".into()],
            probe_ms: 100,
            settle_ms: 10,
        })
        .with_platform_selectors("demo", &[".promo .close".to_string()]);

        assert_eq!(dismisser.dismiss(&page, "demo").await, 1);
        assert!(!page.is_visible(&Locator::css(".promo")).await.unwrap());
        assert_eq!(dismisser.dismiss(&page, "other").await, 0);
    }
}
