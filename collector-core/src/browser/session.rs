use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;

use super::driver::{ElementState, Locator, Page};

/// Decides whether the login component can be skipped for a task.
#[async_trait(?Send)]
pub trait SessionDetector {
    async fn is_authenticated(&self, page: &dyn Page, platform: &str, account_id: &str) -> bool;
}

/// Always runs login.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysLogin;

#[async_trait(?Send)]
impl SessionDetector for AlwaysLogin {
    async fn is_authenticated(&self, _page: &dyn Page, _platform: &str, _account_id: &str) -> bool {
        false
    }
}

/// Treats the session as live when a per-platform marker element (an avatar,
/// a logout link) is present on the current page.
#[derive(Debug, Clone)]
pub struct MarkerSessionDetector {
    markers: BTreeMap<String, Locator>,
    probe: Duration,
}

impl MarkerSessionDetector {
    pub fn new(probe: Duration) -> Self {
        Self {
            markers: BTreeMap::new(),
            probe,
        }
    }

    pub fn marker(mut self, platform: &str, selector: &str) -> Self {
        self.markers
            .insert(platform.to_string(), Locator::parse(selector));
        self
    }
}

#[async_trait(?Send)]
impl SessionDetector for MarkerSessionDetector {
    async fn is_authenticated(&self, page: &dyn Page, platform: &str, _account_id: &str) -> bool {
        match self.markers.get(platform) {
            Some(marker) => page
                .wait_for(marker, ElementState::Attached, self.probe)
                .await
                .is_ok(),
            None => false,
        }
    }
}
