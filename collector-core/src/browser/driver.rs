use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::BrowserResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectorKind {
    #[default]
    Css,
    Text,
    Xpath,
    Role,
}

/// A selector together with the engine that resolves it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Locator {
    pub kind: SelectorKind,
    pub value: String,
}

impl Locator {
    pub fn new(kind: SelectorKind, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }

    pub fn css(value: impl Into<String>) -> Self {
        Self::new(SelectorKind::Css, value)
    }

    /// Parses the prefixed form used in component files: `text=…`, `xpath=…`,
    /// `role=…`, a bare `//…` xpath, or plain css.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if let Some(rest) = raw.strip_prefix("text=") {
            Self::new(SelectorKind::Text, rest)
        } else if let Some(rest) = raw.strip_prefix("xpath=") {
            Self::new(SelectorKind::Xpath, rest)
        } else if let Some(rest) = raw.strip_prefix("role=") {
            Self::new(SelectorKind::Role, rest)
        } else if raw.starts_with("//") || raw.starts_with("(//") {
            Self::new(SelectorKind::Xpath, raw)
        } else {
            Self::css(raw)
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            SelectorKind::Css => write!(f, "{}", self.value),
            SelectorKind::Text => write!(f, "text={}", self.value),
            SelectorKind::Xpath => write!(f, "xpath={}", self.value),
            SelectorKind::Role => write!(f, "role={}", self.value),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementState {
    #[default]
    Attached,
    Visible,
    Hidden,
    Detached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadState {
    #[default]
    Load,
    DomContentLoaded,
    NetworkIdle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectBy {
    #[default]
    Value,
    Label,
    Index,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CookieRecord {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub http_only: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OriginStorage {
    pub origin: String,
    pub local_storage: BTreeMap<String, String>,
}

/// Authenticated state captured from one context and replayed into others.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub cookies: Vec<CookieRecord>,
    pub origins: Vec<OriginStorage>,
}

impl SessionSnapshot {
    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty() && self.origins.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ContextOptions {
    pub seed: Option<SessionSnapshot>,
    pub download_dir: Option<PathBuf>,
}

/// Page-level primitives the executor drives. Every wait is bounded by the
/// timeout passed in; implementations return `BrowserError::Timeout` on expiry.
#[async_trait(?Send)]
pub trait Page {
    async fn goto(&self, url: &str, wait_until: LoadState, timeout: Duration) -> BrowserResult<()>;
    async fn current_url(&self) -> BrowserResult<String>;
    async fn wait_for(
        &self,
        locator: &Locator,
        state: ElementState,
        timeout: Duration,
    ) -> BrowserResult<()>;
    async fn wait_for_load_state(&self, state: LoadState, timeout: Duration) -> BrowserResult<()>;
    async fn click(&self, locator: &Locator, timeout: Duration) -> BrowserResult<()>;
    async fn fill(&self, locator: &Locator, value: &str, timeout: Duration) -> BrowserResult<()>;
    async fn select(
        &self,
        locator: &Locator,
        value: &str,
        by: SelectBy,
        timeout: Duration,
    ) -> BrowserResult<()>;
    async fn hover(&self, locator: &Locator, timeout: Duration) -> BrowserResult<()>;
    async fn press(&self, key: &str) -> BrowserResult<()>;
    async fn scroll(&self, locator: Option<&Locator>, delta_y: i64) -> BrowserResult<()>;
    async fn is_visible(&self, locator: &Locator) -> BrowserResult<bool>;
    async fn text_content(&self, locator: &Locator) -> BrowserResult<Option<String>>;
    async fn page_text(&self) -> BrowserResult<String>;
    async fn evaluate_bool(&self, script: &str) -> BrowserResult<bool>;
    async fn screenshot(&self, path: &Path) -> BrowserResult<()>;
}

#[async_trait(?Send)]
pub trait PageContext {
    fn page(&self) -> &dyn Page;
    async fn snapshot(&self) -> BrowserResult<SessionSnapshot>;
    /// Releases the context. Calling it twice is a no-op.
    async fn close(&self) -> BrowserResult<()>;
}

#[async_trait(?Send)]
pub trait BrowserSession {
    async fn new_context(&self, options: ContextOptions) -> BrowserResult<Box<dyn PageContext>>;
}
