use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig as ChromiumConfig};
use chromiumoxide::cdp::browser_protocol::browser::{
    BrowserContextId,
    SetDownloadBehaviorBehavior, SetDownloadBehaviorParams,
};
use chromiumoxide::cdp::browser_protocol::network::CookieParam;
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams, DisposeBrowserContextParams,
};
use chromiumoxide::page::{Page as CdpPage, ScreenshotParams};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::config::ChromiumSection;

use super::driver::{
    BrowserSession, ContextOptions, CookieRecord, ElementState, LoadState, Locator, OriginStorage,
    Page, PageContext, SelectBy, SelectorKind, SessionSnapshot,
};
use super::error::{BrowserError, BrowserResult};

/// Resolves a `(kind, value)` pair to the first matching element.
const FIND_HELPER: &str = r#"
const __collectorFind = (kind, value) => {
    if (kind === 'css') return document.querySelector(value);
    if (kind === 'xpath') {
        return document.evaluate(value, document, null, XPathResult.FIRST_ORDERED_NODE_TYPE, null).singleNodeValue;
    }
    if (kind === 'text') {
        const needle = value.trim();
        const root = document.body || document.documentElement;
        const walker = document.createTreeWalker(root, NodeFilter.SHOW_ELEMENT);
        let best = null;
        let bestLength = Infinity;
        while (walker.nextNode()) {
            const node = walker.currentNode;
            const text = (node.innerText || node.textContent || '').trim();
            if (text.includes(needle) && text.length < bestLength) {
                best = node;
                bestLength = text.length;
            }
        }
        return best;
    }
    if (kind === 'role') {
        const match = value.match(/^([a-z]+)(?:\[name=["']?(.*?)["']?\])?$/i);
        const role = match ? match[1].toLowerCase() : value;
        const name = match && match[2] ? match[2] : null;
        const implicit = {
            button: 'button,input[type=button],input[type=submit]',
            link: 'a[href]',
            textbox: 'input:not([type]),input[type=text],input[type=email],input[type=password],textarea',
            checkbox: 'input[type=checkbox]',
            combobox: 'select',
        };
        const query = `[role="${role}"]` + (implicit[role] ? ',' + implicit[role] : '');
        const candidates = Array.from(document.querySelectorAll(query));
        return candidates.find((el) => {
            if (!name) return true;
            const label = el.getAttribute('aria-label') || el.innerText || el.value || '';
            return label.trim().includes(name);
        }) || null;
    }
    return null;
};
const __collectorVisible = (el) => {
    if (!el) return false;
    const style = window.getComputedStyle(el);
    const rect = el.getBoundingClientRect();
    return style.visibility !== 'hidden' && style.display !== 'none' && rect.width > 0 && rect.height > 0;
};
"#;

const NETWORK_PROBE: &str = r#"(() => ({
    ready: document.readyState === 'complete',
    resources: performance.getEntriesByType('resource').length,
}))()"#;

const STORAGE_SNAPSHOT: &str = r#"(() => {
    const items = {};
    try {
        for (let i = 0; i < window.localStorage.length; i++) {
            const key = window.localStorage.key(i);
            items[key] = window.localStorage.getItem(key);
        }
    } catch (_) {}
    return { origin: window.location.origin, items };
})()"#;

const NETWORK_QUIET_WINDOW: Duration = Duration::from_millis(500);

fn js_string(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

fn kind_name(kind: SelectorKind) -> &'static str {
    match kind {
        SelectorKind::Css => "css",
        SelectorKind::Text => "text",
        SelectorKind::Xpath => "xpath",
        SelectorKind::Role => "role",
    }
}

/// Wraps `body` in a function that has `el` bound to the located element.
fn element_script(locator: &Locator, body: &str) -> String {
    format!(
        "(() => {{ {FIND_HELPER} const el = __collectorFind({kind}, {value}); {body} }})()",
        kind = js_string(kind_name(locator.kind)),
        value = js_string(&locator.value),
    )
}

#[derive(Debug, Clone)]
pub struct ChromiumLauncher {
    config: ChromiumSection,
    poll_interval: Duration,
}

impl ChromiumLauncher {
    pub fn new(config: ChromiumSection, poll_interval: Duration) -> Self {
        Self {
            config,
            poll_interval,
        }
    }

    pub async fn launch(&self) -> BrowserResult<ChromiumSession> {
        let chromium_config = self.build_chromium_config()?;
        info!(
            headless = self.config.headless,
            width = self.config.window_size[0],
            height = self.config.window_size[1],
            "Launching Chromium instance"
        );
        let (browser, mut handler) = Browser::launch(chromium_config)
            .await
            .map_err(|err| BrowserError::Launch(err.to_string()))?;
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "Chromium handler reported error");
                }
            }
        });
        Ok(ChromiumSession {
            browser: Arc::new(AsyncMutex::new(browser)),
            handler_task: Some(handler_task),
            poll_interval: self.poll_interval,
        })
    }

    fn build_chromium_config(&self) -> BrowserResult<ChromiumConfig> {
        let [width, height] = self.config.window_size;
        let mut builder = ChromiumConfig::builder().window_size(width, height);
        if let Some(path) = &self.config.executable_path {
            builder = builder.chrome_executable(path);
        }
        if !self.config.headless {
            builder = builder.with_head();
        }
        if !self.config.sandbox {
            builder = builder.no_sandbox();
        }
        if let Some(seconds) = self.config.request_timeout_seconds {
            builder = builder.request_timeout(Duration::from_secs(seconds));
        }
        let mut args = vec![
            "--no-first-run".to_string(),
            "--disable-background-timer-throttling".to_string(),
            "--password-store=basic".to_string(),
        ];
        if self.config.disable_gpu {
            args.push("--disable-gpu".into());
        }
        args.extend(self.config.extra_args.iter().cloned());
        builder = builder.args(args);
        builder.build().map_err(BrowserError::Configuration)
    }
}

/// One Chromium process. Each task (or parallel domain) gets its own
/// incognito-style browser context from it.
#[derive(Debug)]
pub struct ChromiumSession {
    browser: Arc<AsyncMutex<Browser>>,
    handler_task: Option<JoinHandle<()>>,
    poll_interval: Duration,
}

impl ChromiumSession {
    pub async fn shutdown(mut self) -> BrowserResult<()> {
        info!("Shutting down Chromium instance");
        {
            let mut browser = self.browser.lock().await;
            if let Err(err) = browser.close().await {
                warn!(error = %err, "Failed to close browser gracefully");
            }
        }
        if let Some(handle) = self.handler_task.take() {
            if let Err(err) = handle.await {
                warn!(error = %err, "Browser handler join error");
            }
        }
        Ok(())
    }
}

impl Drop for ChromiumSession {
    fn drop(&mut self) {
        if let Some(handle) = &self.handler_task {
            if !handle.is_finished() {
                warn!("ChromiumSession dropped without explicit shutdown");
            }
        }
    }
}

#[async_trait(?Send)]
impl BrowserSession for ChromiumSession {
    async fn new_context(&self, options: ContextOptions) -> BrowserResult<Box<dyn PageContext>> {
        let browser = self.browser.lock().await;
        let created = browser
            .execute(CreateBrowserContextParams::default())
            .await?;
        let context_id = created.result.browser_context_id.clone();
        if let Some(dir) = &options.download_dir {
            tokio::fs::create_dir_all(dir).await?;
            let params = SetDownloadBehaviorParams::builder()
                .behavior(SetDownloadBehaviorBehavior::Allow)
                .browser_context_id(context_id.clone())
                .download_path(dir.to_string_lossy().to_string())
                .build()
                .map_err(BrowserError::Configuration)?;
            browser.execute(params).await?;
        }
        let target = CreateTargetParams::builder()
            .url("about:blank")
            .browser_context_id(context_id.clone())
            .build()
            .map_err(BrowserError::Configuration)?;
        let page = browser.new_page(target).await?;
        drop(browser);

        let page = ChromiumPage {
            page,
            poll_interval: self.poll_interval,
        };
        if let Some(seed) = &options.seed {
            page.restore(seed).await?;
        }
        debug!(context = ?context_id, "opened browser context");
        Ok(Box::new(ChromiumContext {
            browser: Arc::clone(&self.browser),
            context_id,
            page,
            closed: Mutex::new(false),
        }))
    }
}

struct ChromiumContext {
    browser: Arc<AsyncMutex<Browser>>,
    context_id: BrowserContextId,
    page: ChromiumPage,
    closed: Mutex<bool>,
}

#[async_trait(?Send)]
impl PageContext for ChromiumContext {
    fn page(&self) -> &dyn Page {
        &self.page
    }

    async fn snapshot(&self) -> BrowserResult<SessionSnapshot> {
        self.page.capture().await
    }

    async fn close(&self) -> BrowserResult<()> {
        {
            let mut closed = self
                .closed
                .lock()
                .map_err(|_| BrowserError::Poisoned("context"))?;
            if *closed {
                return Ok(());
            }
            *closed = true;
        }
        if let Err(err) = self.page.page.clone().close().await {
            debug!(error = %err, "page already closed");
        }
        let browser = self.browser.lock().await;
        browser
            .execute(DisposeBrowserContextParams::new(self.context_id.clone()))
            .await?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct ElementProbe {
    attached: bool,
    visible: bool,
}

#[derive(Debug, Deserialize)]
struct NetworkProbe {
    ready: bool,
    resources: u64,
}

#[derive(Debug, Deserialize)]
struct StorageProbe {
    origin: String,
    items: std::collections::BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct ChromiumPage {
    page: CdpPage,
    poll_interval: Duration,
}

impl ChromiumPage {
    async fn eval<T: DeserializeOwned>(&self, script: &str) -> BrowserResult<T> {
        self.page
            .evaluate(script)
            .await
            .map_err(|err| BrowserError::Script(err.to_string()))?
            .into_value()
            .map_err(|err| BrowserError::Script(format!("failed to decode result: {err}")))
    }

    async fn probe(&self, locator: &Locator) -> BrowserResult<ElementProbe> {
        let script = element_script(
            locator,
            "return { attached: !!el, visible: __collectorVisible(el) };",
        );
        self.eval(&script).await
    }

    /// Runs `body` against the element once it is attached; `body` must return
    /// a boolean telling whether the action applied.
    async fn act(&self, locator: &Locator, body: &str, wait: Duration) -> BrowserResult<()> {
        self.wait_for(locator, ElementState::Attached, wait).await?;
        let script = element_script(locator, &format!("if (!el) return false; {body}"));
        if self.eval::<bool>(&script).await? {
            Ok(())
        } else {
            Err(BrowserError::ElementNotFound(locator.to_string()))
        }
    }

    async fn capture(&self) -> BrowserResult<SessionSnapshot> {
        let cookies = self
            .page
            .get_cookies()
            .await?
            .into_iter()
            .map(|cookie| CookieRecord {
                name: cookie.name,
                value: cookie.value,
                domain: cookie.domain,
                path: cookie.path,
                secure: cookie.secure,
                http_only: cookie.http_only,
            })
            .collect();
        let storage: StorageProbe = self.eval(STORAGE_SNAPSHOT).await?;
        let origins = if storage.items.is_empty() || storage.origin == "null" {
            Vec::new()
        } else {
            vec![OriginStorage {
                origin: storage.origin,
                local_storage: storage.items,
            }]
        };
        Ok(SessionSnapshot { cookies, origins })
    }

    async fn restore(&self, snapshot: &SessionSnapshot) -> BrowserResult<()> {
        if !snapshot.cookies.is_empty() {
            let cookies = snapshot
                .cookies
                .iter()
                .map(|cookie| {
                    CookieParam::builder()
                        .name(cookie.name.clone())
                        .value(cookie.value.clone())
                        .domain(cookie.domain.clone())
                        .path(cookie.path.clone())
                        .secure(cookie.secure)
                        .http_only(cookie.http_only)
                        .build()
                        .map_err(BrowserError::SessionRestore)
                })
                .collect::<BrowserResult<Vec<_>>>()?;
            self.page.set_cookies(cookies).await?;
        }
        for origin in &snapshot.origins {
            let items = serde_json::to_string(&origin.local_storage)
                .map_err(|err| BrowserError::SessionRestore(err.to_string()))?;
            let script = format!(
                "(() => {{ if (window.location.origin !== {origin}) return; \
                 const items = {items}; \
                 for (const [key, value] of Object.entries(items)) {{ \
                 try {{ window.localStorage.setItem(key, value); }} catch (_) {{}} }} }})();",
                origin = js_string(&origin.origin),
            );
            self.page
                .evaluate_on_new_document(
                    AddScriptToEvaluateOnNewDocumentParams::builder()
                        .source(script)
                        .build()
                        .map_err(BrowserError::SessionRestore)?,
                )
                .await?;
        }
        Ok(())
    }

    async fn wait_network_idle(&self, budget: Duration) -> BrowserResult<()> {
        let deadline = Instant::now() + budget;
        let mut last_count: Option<u64> = None;
        let mut quiet_since = Instant::now();
        loop {
            let probe: NetworkProbe = self.eval(NETWORK_PROBE).await?;
            let now = Instant::now();
            if last_count != Some(probe.resources) {
                last_count = Some(probe.resources);
                quiet_since = now;
            } else if probe.ready && now.duration_since(quiet_since) >= NETWORK_QUIET_WINDOW {
                return Ok(());
            }
            if now >= deadline {
                return Err(BrowserError::Timeout("network idle".into()));
            }
            sleep(self.poll_interval.min(deadline - now)).await;
        }
    }
}

#[async_trait(?Send)]
impl Page for ChromiumPage {
    async fn goto(&self, url: &str, wait_until: LoadState, budget: Duration) -> BrowserResult<()> {
        let started = Instant::now();
        timeout(budget, self.page.goto(url))
            .await
            .map_err(|_| BrowserError::Timeout(format!("navigation to {url}")))??;
        if wait_until == LoadState::NetworkIdle {
            let remaining = budget.saturating_sub(started.elapsed());
            self.wait_network_idle(remaining).await?;
        }
        Ok(())
    }

    async fn current_url(&self) -> BrowserResult<String> {
        Ok(self.page.url().await?.unwrap_or_default())
    }

    async fn wait_for(
        &self,
        locator: &Locator,
        state: ElementState,
        budget: Duration,
    ) -> BrowserResult<()> {
        let deadline = Instant::now() + budget;
        loop {
            let probe = self.probe(locator).await?;
            let satisfied = match state {
                ElementState::Attached => probe.attached,
                ElementState::Visible => probe.visible,
                ElementState::Hidden => !probe.visible,
                ElementState::Detached => !probe.attached,
            };
            if satisfied {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(BrowserError::Timeout(locator.to_string()));
            }
            sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn wait_for_load_state(&self, state: LoadState, budget: Duration) -> BrowserResult<()> {
        match state {
            LoadState::NetworkIdle => self.wait_network_idle(budget).await,
            LoadState::Load | LoadState::DomContentLoaded => {
                timeout(budget, self.page.wait_for_navigation())
                    .await
                    .map_err(|_| BrowserError::Timeout("page load".into()))??;
                Ok(())
            }
        }
    }

    async fn click(&self, locator: &Locator, budget: Duration) -> BrowserResult<()> {
        self.act(
            locator,
            "el.scrollIntoView({ block: 'center' }); el.click(); return true;",
            budget,
        )
        .await
    }

    async fn fill(&self, locator: &Locator, value: &str, budget: Duration) -> BrowserResult<()> {
        let body = format!(
            "el.focus(); \
             const setter = Object.getOwnPropertyDescriptor(Object.getPrototypeOf(el), 'value'); \
             if (setter && setter.set) {{ setter.set.call(el, {value}); }} else {{ el.value = {value}; }} \
             el.dispatchEvent(new Event('input', {{ bubbles: true }})); \
             el.dispatchEvent(new Event('change', {{ bubbles: true }})); \
             return true;",
            value = js_string(value)
        );
        self.act(locator, &body, budget).await
    }

    async fn select(
        &self,
        locator: &Locator,
        value: &str,
        by: SelectBy,
        budget: Duration,
    ) -> BrowserResult<()> {
        let matcher = match by {
            SelectBy::Value => "opt.value === wanted",
            SelectBy::Label => "opt.label.trim() === wanted || opt.text.trim() === wanted",
            SelectBy::Index => "String(index) === wanted",
        };
        let body = format!(
            "const wanted = {value}; \
             const options = Array.from(el.options || []); \
             const index = options.findIndex((opt, index) => {matcher}); \
             if (index < 0) return false; \
             el.selectedIndex = index; \
             el.dispatchEvent(new Event('change', {{ bubbles: true }})); \
             return true;",
            value = js_string(value)
        );
        self.act(locator, &body, budget).await
    }

    async fn hover(&self, locator: &Locator, budget: Duration) -> BrowserResult<()> {
        self.act(
            locator,
            "el.scrollIntoView({ block: 'center' }); \
             for (const type of ['mouseover', 'mouseenter', 'mousemove']) { \
             el.dispatchEvent(new MouseEvent(type, { bubbles: true })); } \
             return true;",
            budget,
        )
        .await
    }

    async fn press(&self, key: &str) -> BrowserResult<()> {
        let script = format!(
            "(() => {{ const key = {key}; \
             const target = document.activeElement || document.body; \
             for (const type of ['keydown', 'keypress', 'keyup']) {{ \
             target.dispatchEvent(new KeyboardEvent(type, {{ key, bubbles: true }})); }} \
             if (key === 'Enter' && target.form && target.form.requestSubmit) target.form.requestSubmit(); \
             return true; }})()",
            key = js_string(key)
        );
        self.eval::<bool>(&script).await.map(|_| ())
    }

    async fn scroll(&self, locator: Option<&Locator>, delta_y: i64) -> BrowserResult<()> {
        let script = match locator {
            Some(locator) => element_script(
                locator,
                "if (!el) return false; el.scrollIntoView({ block: 'center' }); return true;",
            ),
            None => format!("(() => {{ window.scrollBy(0, {delta_y}); return true; }})()"),
        };
        if self.eval::<bool>(&script).await? {
            Ok(())
        } else {
            Err(BrowserError::ElementNotFound(
                locator.map(ToString::to_string).unwrap_or_default(),
            ))
        }
    }

    async fn is_visible(&self, locator: &Locator) -> BrowserResult<bool> {
        Ok(self.probe(locator).await?.visible)
    }

    async fn text_content(&self, locator: &Locator) -> BrowserResult<Option<String>> {
        let script = element_script(
            locator,
            "return el ? (el.innerText || el.textContent || '') : null;",
        );
        self.eval(&script).await
    }

    async fn page_text(&self) -> BrowserResult<String> {
        self.eval("(() => document.body ? document.body.innerText : '')()")
            .await
    }

    async fn evaluate_bool(&self, script: &str) -> BrowserResult<bool> {
        let value: serde_json::Value = self.eval(script).await?;
        Ok(match value {
            serde_json::Value::Bool(flag) => flag,
            serde_json::Value::Null => false,
            serde_json::Value::Number(number) => number.as_f64().map_or(false, |n| n != 0.0),
            serde_json::Value::String(text) => !text.is_empty(),
            _ => true,
        })
    }

    async fn screenshot(&self, path: &Path) -> BrowserResult<()> {
        let bytes = self
            .page
            .screenshot(ScreenshotParams::builder().full_page(true).build())
            .await?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, bytes).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn element_scripts_escape_selector_values() {
        let script = element_script(&Locator::parse("text=Export \"all\""), "return !!el;");
        assert!(script.contains(r#"__collectorFind("text", "Export \"all\"")"#));
    }
}
