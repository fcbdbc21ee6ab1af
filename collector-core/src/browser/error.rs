use thiserror::Error;

pub type BrowserResult<T> = Result<T, BrowserError>;

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("chromium launch failed: {0}")]
    Launch(String),
    #[error("cdp error: {0}")]
    Cdp(#[from] chromiumoxide::error::CdpError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timeout waiting for {0}")]
    Timeout(String),
    #[error("invalid browser request: {0}")]
    Configuration(String),
    #[error("element not found: {0}")]
    ElementNotFound(String),
    #[error("element {0} is not clickable")]
    NotClickable(String),
    #[error("script evaluation failed: {0}")]
    Script(String),
    /// Session cookies or storage could not be replayed into a new context.
    #[error("session restore failed: {0}")]
    SessionRestore(String),
    #[error("page closed")]
    PageClosed,
    #[error("{0} state lock poisoned")]
    Poisoned(&'static str),
}

impl BrowserError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, BrowserError::Timeout(_))
    }
}
