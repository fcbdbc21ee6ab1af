//! In-memory browser used for dry runs and tests. Pages are described up
//! front as a set of elements with click effects; time-based behavior runs on
//! the tokio clock so paused-time tests advance instantly.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{sleep, Instant};

use super::driver::{
    BrowserSession, ContextOptions, ElementState, LoadState, Locator, Page, PageContext, SelectBy,
    SessionSnapshot,
};
use super::error::{BrowserError, BrowserResult};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub type ClickHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Clone)]
pub enum ClickEffect {
    /// Writes a file into the context's download directory.
    Download { file_name: String, contents: Vec<u8> },
    Navigate(String),
    Reveal(String),
    Remove(String),
    /// The page goes away; every later call on it fails.
    Crash,
    Hook(ClickHook),
}

impl fmt::Debug for ClickEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClickEffect::Download { file_name, .. } => write!(f, "Download({file_name})"),
            ClickEffect::Navigate(url) => write!(f, "Navigate({url})"),
            ClickEffect::Reveal(selector) => write!(f, "Reveal({selector})"),
            ClickEffect::Remove(selector) => write!(f, "Remove({selector})"),
            ClickEffect::Crash => write!(f, "Crash"),
            ClickEffect::Hook(_) => write!(f, "Hook"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScriptedElement {
    pub present: bool,
    pub visible: bool,
    pub text: Option<String>,
    pub appear_after: Option<Duration>,
    pub failing_clicks: usize,
    pub on_click: Vec<ClickEffect>,
}

impl Default for ScriptedElement {
    fn default() -> Self {
        Self {
            present: true,
            visible: true,
            text: None,
            appear_after: None,
            failing_clicks: 0,
            on_click: Vec::new(),
        }
    }
}

impl ScriptedElement {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declared but not attached until something reveals it.
    pub fn hidden_until_revealed() -> Self {
        Self {
            present: false,
            ..Self::default()
        }
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn invisible(mut self) -> Self {
        self.visible = false;
        self
    }

    pub fn appear_after(mut self, delay: Duration) -> Self {
        self.appear_after = Some(delay);
        self
    }

    pub fn failing_clicks(mut self, count: usize) -> Self {
        self.failing_clicks = count;
        self
    }

    pub fn on_click(mut self, effect: ClickEffect) -> Self {
        self.on_click.push(effect);
        self
    }
}

/// Template every new context starts from.
#[derive(Debug, Clone, Default)]
pub struct PageScript {
    pub url: String,
    pub body_text: String,
    pub elements: BTreeMap<String, ScriptedElement>,
    pub scripts: BTreeMap<String, bool>,
    pub network_idle_after: Option<Duration>,
}

impl PageScript {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn element(mut self, selector: &str, element: ScriptedElement) -> Self {
        self.elements
            .insert(Locator::parse(selector).to_string(), element);
        self
    }

    pub fn body_text(mut self, text: impl Into<String>) -> Self {
        self.body_text = text.into();
        self
    }

    pub fn script_result(mut self, script: impl Into<String>, result: bool) -> Self {
        self.scripts.insert(script.into(), result);
        self
    }

    pub fn network_idle_after(mut self, delay: Duration) -> Self {
        self.network_idle_after = Some(delay);
        self
    }
}

#[derive(Debug, Default)]
struct BrowserLedger {
    actions: Mutex<Vec<String>>,
    seeds: Mutex<Vec<SessionSnapshot>>,
    opened: AtomicUsize,
    closed: AtomicUsize,
}

#[derive(Debug, Clone)]
pub struct ScriptedBrowser {
    script: PageScript,
    session: SessionSnapshot,
    ledger: Arc<BrowserLedger>,
}

impl ScriptedBrowser {
    pub fn new(script: PageScript) -> Self {
        Self {
            script,
            session: SessionSnapshot::default(),
            ledger: Arc::new(BrowserLedger::default()),
        }
    }

    pub fn with_session(mut self, session: SessionSnapshot) -> Self {
        self.session = session;
        self
    }

    /// Every page action performed so far, as `"<verb> <selector>"`.
    pub fn actions(&self) -> Vec<String> {
        self.ledger
            .actions
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn seeds(&self) -> Vec<SessionSnapshot> {
        self.ledger
            .seeds
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn contexts_opened(&self) -> usize {
        self.ledger.opened.load(Ordering::SeqCst)
    }

    pub fn contexts_closed(&self) -> usize {
        self.ledger.closed.load(Ordering::SeqCst)
    }
}

#[async_trait(?Send)]
impl BrowserSession for ScriptedBrowser {
    async fn new_context(&self, options: ContextOptions) -> BrowserResult<Box<dyn PageContext>> {
        self.ledger.opened.fetch_add(1, Ordering::SeqCst);
        if let Some(seed) = options.seed.clone() {
            if let Ok(mut seeds) = self.ledger.seeds.lock() {
                seeds.push(seed);
            }
        }
        let page = ScriptedPage::new(self.script.clone(), options.download_dir)
            .with_ledger(Arc::clone(&self.ledger));
        Ok(Box::new(ScriptedContext {
            page,
            session: self.session.clone(),
            ledger: Arc::clone(&self.ledger),
            closed: Mutex::new(false),
        }))
    }
}

struct ScriptedContext {
    page: ScriptedPage,
    session: SessionSnapshot,
    ledger: Arc<BrowserLedger>,
    closed: Mutex<bool>,
}

#[async_trait(?Send)]
impl PageContext for ScriptedContext {
    fn page(&self) -> &dyn Page {
        &self.page
    }

    async fn snapshot(&self) -> BrowserResult<SessionSnapshot> {
        Ok(self.session.clone())
    }

    async fn close(&self) -> BrowserResult<()> {
        let mut closed = self
            .closed
            .lock()
            .map_err(|_| BrowserError::Poisoned("context"))?;
        if !*closed {
            *closed = true;
            self.ledger.closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[derive(Debug)]
struct PageState {
    url: String,
    elements: BTreeMap<String, ScriptedElement>,
    clicks: HashMap<String, usize>,
    closed: bool,
}

/// A single scripted page. Usable on its own for executor tests.
#[derive(Debug)]
pub struct ScriptedPage {
    script: PageScript,
    state: Mutex<PageState>,
    created: Instant,
    download_dir: Option<PathBuf>,
    ledger: Arc<BrowserLedger>,
}

impl ScriptedPage {
    pub fn new(script: PageScript, download_dir: Option<PathBuf>) -> Self {
        let state = PageState {
            url: script.url.clone(),
            elements: script.elements.clone(),
            clicks: HashMap::new(),
            closed: false,
        };
        Self {
            script,
            state: Mutex::new(state),
            created: Instant::now(),
            download_dir,
            ledger: Arc::new(BrowserLedger::default()),
        }
    }

    fn with_ledger(mut self, ledger: Arc<BrowserLedger>) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn actions(&self) -> Vec<String> {
        self.ledger
            .actions
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    fn record(&self, action: String) {
        if let Ok(mut actions) = self.ledger.actions.lock() {
            actions.push(action);
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut PageState) -> T) -> BrowserResult<T> {
        let mut guard = self
            .state
            .lock()
            .map_err(|_| BrowserError::Poisoned("page"))?;
        if guard.closed {
            return Err(BrowserError::PageClosed);
        }
        Ok(f(&mut guard))
    }

    fn attached(&self, locator: &Locator) -> BrowserResult<Option<ScriptedElement>> {
        let elapsed = self.created.elapsed();
        self.with_state(|state| {
            state
                .elements
                .get(&locator.to_string())
                .filter(|element| element.present)
                .filter(|element| element.appear_after.map_or(true, |delay| elapsed >= delay))
                .cloned()
        })
    }

    fn matches_state(&self, locator: &Locator, wanted: ElementState) -> BrowserResult<bool> {
        let element = self.attached(locator)?;
        Ok(match wanted {
            ElementState::Attached => element.is_some(),
            ElementState::Visible => element.map_or(false, |element| element.visible),
            ElementState::Hidden => element.map_or(true, |element| !element.visible),
            ElementState::Detached => element.is_none(),
        })
    }

    async fn require(&self, locator: &Locator, timeout: Duration) -> BrowserResult<()> {
        self.wait_for(locator, ElementState::Attached, timeout).await
    }

    async fn apply_effects(&self, effects: Vec<ClickEffect>) -> BrowserResult<()> {
        for effect in effects {
            match effect {
                ClickEffect::Download {
                    file_name,
                    contents,
                } => {
                    let dir = self.download_dir.clone().ok_or_else(|| {
                        BrowserError::Configuration("download directory not set".into())
                    })?;
                    tokio::fs::create_dir_all(&dir).await?;
                    tokio::fs::write(dir.join(file_name), contents).await?;
                }
                ClickEffect::Navigate(url) => {
                    self.with_state(|state| state.url = url)?;
                }
                ClickEffect::Reveal(selector) => {
                    let key = Locator::parse(&selector).to_string();
                    self.with_state(|state| {
                        let element = state.elements.entry(key).or_default();
                        element.present = true;
                        element.appear_after = None;
                    })?;
                }
                ClickEffect::Remove(selector) => {
                    let key = Locator::parse(&selector).to_string();
                    self.with_state(|state| {
                        if let Some(element) = state.elements.get_mut(&key) {
                            element.present = false;
                        }
                    })?;
                }
                ClickEffect::Crash => {
                    self.with_state(|state| state.closed = true)?;
                }
                ClickEffect::Hook(hook) => hook(),
            }
        }
        Ok(())
    }
}

#[async_trait(?Send)]
impl Page for ScriptedPage {
    async fn goto(&self, url: &str, _wait_until: LoadState, _timeout: Duration) -> BrowserResult<()> {
        self.record(format!("goto {url}"));
        let url = url.to_string();
        self.with_state(|state| state.url = url)
    }

    async fn current_url(&self) -> BrowserResult<String> {
        self.with_state(|state| state.url.clone())
    }

    async fn wait_for(
        &self,
        locator: &Locator,
        state: ElementState,
        timeout: Duration,
    ) -> BrowserResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.matches_state(locator, state)? {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(BrowserError::Timeout(locator.to_string()));
            }
            sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn wait_for_load_state(&self, state: LoadState, timeout: Duration) -> BrowserResult<()> {
        if state != LoadState::NetworkIdle {
            return Ok(());
        }
        match self.script.network_idle_after {
            Some(delay) if delay > timeout => {
                sleep(timeout).await;
                Err(BrowserError::Timeout("network idle".into()))
            }
            Some(delay) => {
                sleep(delay).await;
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn click(&self, locator: &Locator, timeout: Duration) -> BrowserResult<()> {
        self.require(locator, timeout).await?;
        let key = locator.to_string();
        let (attempt, element) = self.with_state(|state| {
            let count = state.clicks.entry(key.clone()).or_insert(0);
            *count += 1;
            (*count, state.elements.get(&key).cloned())
        })?;
        let element = element.ok_or_else(|| BrowserError::ElementNotFound(key.clone()))?;
        if attempt <= element.failing_clicks {
            self.record(format!("click-failed {key}"));
            return Err(BrowserError::NotClickable(key));
        }
        self.record(format!("click {key}"));
        self.apply_effects(element.on_click).await
    }

    async fn fill(&self, locator: &Locator, value: &str, timeout: Duration) -> BrowserResult<()> {
        self.require(locator, timeout).await?;
        self.record(format!("fill {locator}={value}"));
        Ok(())
    }

    async fn select(
        &self,
        locator: &Locator,
        value: &str,
        _by: SelectBy,
        timeout: Duration,
    ) -> BrowserResult<()> {
        self.require(locator, timeout).await?;
        self.record(format!("select {locator}={value}"));
        Ok(())
    }

    async fn hover(&self, locator: &Locator, timeout: Duration) -> BrowserResult<()> {
        self.require(locator, timeout).await?;
        self.record(format!("hover {locator}"));
        Ok(())
    }

    async fn press(&self, key: &str) -> BrowserResult<()> {
        self.record(format!("press {key}"));
        Ok(())
    }

    async fn scroll(&self, locator: Option<&Locator>, delta_y: i64) -> BrowserResult<()> {
        match locator {
            Some(locator) => self.record(format!("scroll {locator}")),
            None => self.record(format!("scroll {delta_y}")),
        }
        Ok(())
    }

    async fn is_visible(&self, locator: &Locator) -> BrowserResult<bool> {
        self.matches_state(locator, ElementState::Visible)
    }

    async fn text_content(&self, locator: &Locator) -> BrowserResult<Option<String>> {
        Ok(self.attached(locator)?.and_then(|element| element.text))
    }

    async fn page_text(&self) -> BrowserResult<String> {
        let texts = self.with_state(|state| {
            state
                .elements
                .values()
                .filter(|element| element.present)
                .filter_map(|element| element.text.clone())
                .collect::<Vec<_>>()
        })?;
        let mut body = self.script.body_text.clone();
        for text in texts {
            body.push('\n');
            body.push_str(&text);
        }
        Ok(body)
    }

    async fn evaluate_bool(&self, script: &str) -> BrowserResult<bool> {
        Ok(self.script.scripts.get(script).copied().unwrap_or(false))
    }

    async fn screenshot(&self, path: &Path) -> BrowserResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, b"scripted-screenshot").await?;
        self.record(format!("screenshot {}", path.display()));
        Ok(())
    }
}
