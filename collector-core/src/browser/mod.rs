mod chromium;
mod downloads;
mod driver;
mod error;
mod popup;
pub mod scripted;
mod session;

pub use chromium::{ChromiumLauncher, ChromiumPage, ChromiumSession};
pub use downloads::DownloadWatcher;
pub use driver::{
    BrowserSession, ContextOptions, CookieRecord, ElementState, LoadState, Locator, OriginStorage,
    Page, PageContext, SelectBy, SelectorKind, SessionSnapshot,
};
pub use error::{BrowserError, BrowserResult};
pub use popup::{NoPopups, PopupDismisser, SelectorPopupDismisser};
pub use session::{AlwaysLogin, MarkerSessionDetector, SessionDetector};
