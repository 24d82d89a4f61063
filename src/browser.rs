//! Browser driver over the Chrome DevTools Protocol (chromiumoxide).
//!
//! One driver per session: it owns the CDP connection, the event-handler
//! task and the active page. Command handlers never touch chromiumoxide
//! directly; everything goes through this struct, so the session can shut
//! the browser down deterministically.

use crate::error::RunError;
use crate::eval::Evaluator;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::fetch::{
    ContinueRequestParams, EnableParams as FetchEnableParams, EventRequestPaused, FailRequestParams,
};
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchMouseEventParams, DispatchMouseEventType, MouseButton,
};
use chromiumoxide::cdp::browser_protocol::network::{
    ErrorReason, Headers, SetExtraHttpHeadersParams,
};
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::{Element, Page};
use futures_util::StreamExt;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, warn};

const DEFAULT_NAV_TIMEOUT_MS: u64 = 30_000;
const SELECTOR_POLL_MS: u64 = 100;

/// Short randomised pause after user-like input, so typed flows do not fire
/// events faster than any human could.
const INPUT_PAUSE_MIN_MS: u64 = 80;
const INPUT_PAUSE_MAX_MS: u64 = 350;

pub struct BrowserDriver {
    browser: Browser,
    handler_task: JoinHandle<()>,
    page: Option<Page>,
    nav_timeout: Duration,
    /// True when attached to a remotely managed (fingerprint-profile)
    /// browser rather than one we launched.
    remote: bool,
}

impl BrowserDriver {
    /// Launch a local browser.
    pub async fn launch(headless: bool, extra_args: &[String]) -> Result<Self, RunError> {
        let mut builder = BrowserConfig::builder().viewport(None);
        if !headless {
            builder = builder.with_head();
        }
        if !extra_args.is_empty() {
            builder = builder.args(extra_args.to_vec());
        }
        let config = builder
            .build()
            .map_err(|e| RunError::Browser(format!("invalid browser config: {e}")))?;
        let (browser, handler) = Browser::launch(config)
            .await
            .map_err(|e| RunError::Browser(format!("failed to launch browser: {e}")))?;
        Ok(Self::wrap(browser, handler, false))
    }

    /// Attach to an already-running browser by its debugger websocket url
    /// (how fingerprint-profile sessions are driven).
    pub async fn connect(ws_url: &str) -> Result<Self, RunError> {
        let (browser, handler) = Browser::connect(ws_url)
            .await
            .map_err(|e| RunError::Browser(format!("failed to connect to {ws_url}: {e}")))?;
        Ok(Self::wrap(browser, handler, true))
    }

    fn wrap(
        browser: Browser,
        mut handler: chromiumoxide::Handler,
        remote: bool,
    ) -> Self {
        // The handler stream must be polled for the browser to function.
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("cdp handler: {e}");
                }
            }
        });
        Self {
            browser,
            handler_task,
            page: None,
            nav_timeout: Duration::from_millis(DEFAULT_NAV_TIMEOUT_MS),
            remote,
        }
    }

    pub fn is_remote(&self) -> bool {
        self.remote
    }

    pub fn has_page(&self) -> bool {
        self.page.is_some()
    }

    pub fn set_nav_timeout(&mut self, ms: u64) {
        self.nav_timeout = Duration::from_millis(ms.max(1));
    }

    fn page(&self) -> Result<&Page, RunError> {
        self.page
            .as_ref()
            .ok_or_else(|| RunError::Browser("no open page; run newPage or alwaysPage first".into()))
    }

    // ── Pages ───────────────────────────────────────────────────────────────

    pub async fn new_page(&mut self) -> Result<(), RunError> {
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| RunError::Browser(format!("failed to open page: {e}")))?;
        self.page = Some(page);
        Ok(())
    }

    /// Select the first existing page, or open one if the browser has none.
    pub async fn always_page(&mut self) -> Result<(), RunError> {
        let pages = self
            .browser
            .pages()
            .await
            .map_err(|e| RunError::Browser(format!("failed to list pages: {e}")))?;
        match pages.into_iter().next() {
            Some(page) => {
                self.page = Some(page);
                Ok(())
            }
            None => self.new_page().await,
        }
    }

    pub async fn reload(&self) -> Result<(), RunError> {
        self.page()?
            .reload()
            .await
            .map_err(|e| RunError::Browser(format!("reload failed: {e}")))?;
        Ok(())
    }

    pub async fn close_page(&mut self) -> Result<(), RunError> {
        if let Some(page) = self.page.take() {
            page.close()
                .await
                .map_err(|e| RunError::Browser(format!("failed to close page: {e}")))?;
        }
        Ok(())
    }

    /// Tear down the browser and its handler task. Used both by the
    /// `shutdown` command and by session close.
    pub async fn shutdown(&mut self) {
        self.page = None;
        if let Err(e) = self.browser.close().await {
            debug!("browser close: {e}");
        }
        self.handler_task.abort();
    }

    // ── Navigation ──────────────────────────────────────────────────────────

    /// Navigate the active page.
    ///
    /// With `wait` the call is bounded by the navigation timeout and
    /// failures surface to the caller. Without it the navigation is
    /// dispatched and left to complete in the background (for sites that
    /// hold the connection open indefinitely), with the outcome logged.
    pub async fn navigate(&self, url: &str, wait: bool) -> Result<(), RunError> {
        let page = self.page()?;
        if wait {
            timeout(self.nav_timeout, page.goto(url))
                .await
                .map_err(|_| RunError::Browser(format!("navigation to {url} timed out")))?
                .map_err(|e| RunError::Browser(format!("navigation to {url} failed: {e}")))?;
        } else {
            let page = page.clone();
            let url = url.to_string();
            tokio::spawn(async move {
                if let Err(e) = page.goto(url.as_str()).await {
                    warn!(url = %url, "background navigation failed: {e}");
                }
            });
        }
        Ok(())
    }

    pub async fn wait_for_navigation(&self) -> Result<(), RunError> {
        let page = self.page()?;
        timeout(self.nav_timeout, page.wait_for_navigation())
            .await
            .map_err(|_| RunError::Browser("navigation wait timed out".into()))?
            .map_err(|e| RunError::Browser(format!("navigation wait failed: {e}")))?;
        Ok(())
    }

    pub async fn set_headers(&self, headers: serde_json::Value) -> Result<(), RunError> {
        let params = SetExtraHttpHeadersParams::builder()
            .headers(Headers::new(headers))
            .build()
            .map_err(|e| RunError::Browser(format!("invalid headers: {e}")))?;
        self.page()?
            .execute(params)
            .await
            .map_err(|e| RunError::Browser(format!("failed to set headers: {e}")))?;
        Ok(())
    }

    // ── Elements ────────────────────────────────────────────────────────────

    /// Poll until the selector matches, bounded by the navigation timeout.
    pub async fn wait_for_selector(&self, selector: &str) -> Result<Element, RunError> {
        let page = self.page()?;
        let deadline = Instant::now() + self.nav_timeout;
        loop {
            match page.find_element(selector).await {
                Ok(element) => return Ok(element),
                Err(e) => {
                    if Instant::now() >= deadline {
                        return Err(RunError::Browser(format!(
                            "selector `{selector}` not found: {e}"
                        )));
                    }
                    sleep(Duration::from_millis(SELECTOR_POLL_MS)).await;
                }
            }
        }
    }

    /// The element a command targets: waits for the selector, then picks
    /// the n-th match when an index is given.
    async fn element_at(&self, selector: &str, index: Option<usize>) -> Result<Element, RunError> {
        let first = self.wait_for_selector(selector).await?;
        let Some(index) = index else {
            return Ok(first);
        };
        let elements = self
            .page()?
            .find_elements(selector)
            .await
            .map_err(|e| RunError::Browser(format!("selector `{selector}` lookup failed: {e}")))?;
        let count = elements.len();
        elements.into_iter().nth(index).ok_or_else(|| {
            RunError::Browser(format!(
                "selector `{selector}` matched {count} elements, index {index} is out of range"
            ))
        })
    }

    pub async fn hover(&self, selector: &str, index: Option<usize>) -> Result<(), RunError> {
        let element = self.element_at(selector, index).await?;
        element
            .scroll_into_view()
            .await
            .map_err(|e| RunError::Browser(format!("scroll to `{selector}` failed: {e}")))?;
        let point = element
            .clickable_point()
            .await
            .map_err(|e| RunError::Browser(format!("`{selector}` has no visible box: {e}")))?;
        let params = DispatchMouseEventParams::builder()
            .x(point.x)
            .y(point.y)
            .r#type(DispatchMouseEventType::MouseMoved)
            .build()
            .map_err(|e| RunError::Browser(format!("failed to build mouse move: {e}")))?;
        self.page()?
            .execute(params)
            .await
            .map_err(|e| RunError::Browser(format!("hover failed: {e}")))?;
        self.input_pause().await;
        Ok(())
    }

    pub async fn click(&self, selector: &str, index: Option<usize>) -> Result<(), RunError> {
        self.hover(selector, index).await?;
        let element = self.element_at(selector, index).await?;
        element
            .click()
            .await
            .map_err(|e| RunError::Browser(format!("click on `{selector}` failed: {e}")))?;
        self.input_pause().await;
        Ok(())
    }

    pub async fn double_click(&self, selector: &str, index: Option<usize>) -> Result<(), RunError> {
        self.hover(selector, index).await?;
        let element = self.element_at(selector, index).await?;
        let point = element
            .clickable_point()
            .await
            .map_err(|e| RunError::Browser(format!("`{selector}` has no visible box: {e}")))?;
        for kind in [
            DispatchMouseEventType::MousePressed,
            DispatchMouseEventType::MouseReleased,
        ] {
            let params = DispatchMouseEventParams::builder()
                .x(point.x)
                .y(point.y)
                .r#type(kind)
                .button(MouseButton::Left)
                .click_count(2)
                .build()
                .map_err(|e| RunError::Browser(format!("failed to build mouse event: {e}")))?;
            self.page()?
                .execute(params)
                .await
                .map_err(|e| RunError::Browser(format!("double click on `{selector}` failed: {e}")))?;
        }
        self.input_pause().await;
        Ok(())
    }

    pub async fn type_text(
        &self,
        selector: &str,
        index: Option<usize>,
        text: &str,
    ) -> Result<(), RunError> {
        let element = self.element_at(selector, index).await?;
        element
            .click()
            .await
            .map_err(|e| RunError::Browser(format!("focus on `{selector}` failed: {e}")))?;
        self.input_pause().await;
        element
            .type_str(text)
            .await
            .map_err(|e| RunError::Browser(format!("typing into `{selector}` failed: {e}")))?;
        self.input_pause().await;
        Ok(())
    }

    /// Set a `<select>` element's value and fire the input/change events a
    /// real selection would.
    pub async fn select_option(
        &self,
        selector: &str,
        index: Option<usize>,
        value: &str,
    ) -> Result<(), RunError> {
        self.wait_for_selector(selector).await?;
        let js = format!(
            r#"(() => {{
                const els = document.querySelectorAll({sel});
                const el = els[{idx}];
                if (!el) return false;
                el.value = {val};
                el.dispatchEvent(new Event('input', {{ bubbles: true }}));
                el.dispatchEvent(new Event('change', {{ bubbles: true }}));
                return true;
            }})()"#,
            sel = serde_json::json!(selector),
            idx = index.unwrap_or(0),
            val = serde_json::json!(value),
        );
        let ok: bool = self
            .page()?
            .evaluate(js)
            .await
            .map_err(|e| RunError::Browser(format!("select on `{selector}` failed: {e}")))?
            .into_value()
            .map_err(|e| RunError::Browser(format!("select result unreadable: {e}")))?;
        if !ok {
            return Err(RunError::Browser(format!(
                "selector `{selector}` index {} not found",
                index.unwrap_or(0)
            )));
        }
        self.input_pause().await;
        Ok(())
    }

    // ── Reads ───────────────────────────────────────────────────────────────

    pub async fn text_content(
        &self,
        selector: &str,
        index: Option<usize>,
    ) -> Result<String, RunError> {
        self.read_property(selector, index, "textContent").await
    }

    pub async fn html_content(
        &self,
        selector: &str,
        index: Option<usize>,
    ) -> Result<String, RunError> {
        self.read_property(selector, index, "innerHTML").await
    }

    async fn read_property(
        &self,
        selector: &str,
        index: Option<usize>,
        property: &str,
    ) -> Result<String, RunError> {
        self.wait_for_selector(selector).await?;
        let js = format!(
            r#"(() => {{
                const el = document.querySelectorAll({sel})[{idx}];
                return el ? String(el.{property} ?? '') : null;
            }})()"#,
            sel = serde_json::json!(selector),
            idx = index.unwrap_or(0),
        );
        let value: Option<String> = self
            .page()?
            .evaluate(js)
            .await
            .map_err(|e| RunError::Browser(format!("read of `{selector}` failed: {e}")))?
            .into_value()
            .map_err(|e| RunError::Browser(format!("read result unreadable: {e}")))?;
        value.ok_or_else(|| {
            RunError::Browser(format!(
                "selector `{selector}` index {} not found",
                index.unwrap_or(0)
            ))
        })
    }

    pub async fn element_count(&self, selector: &str) -> Result<usize, RunError> {
        let elements = self
            .page()?
            .find_elements(selector)
            .await
            .map_err(|e| RunError::Browser(format!("selector `{selector}` lookup failed: {e}")))?;
        Ok(elements.len())
    }

    pub async fn screenshot(&self) -> Result<Vec<u8>, RunError> {
        self.page()?
            .screenshot(
                ScreenshotParams::builder()
                    .format(CaptureScreenshotFormat::Png)
                    .build(),
            )
            .await
            .map_err(|e| RunError::Browser(format!("screenshot failed: {e}")))
    }

    // ── Network ─────────────────────────────────────────────────────────────

    /// Install a request filter on the active page. Each paused request has
    /// the predicate evaluated with `_url` bound to the request url: truthy
    /// aborts the request, anything else lets it continue. Evaluation errors
    /// fail open (the request proceeds).
    pub async fn install_request_filter(
        &self,
        predicate: String,
        eval: Arc<Evaluator>,
    ) -> Result<(), RunError> {
        let page = self.page()?.clone();
        page.execute(FetchEnableParams::default())
            .await
            .map_err(|e| RunError::Browser(format!("failed to enable request interception: {e}")))?;
        let mut events = page
            .event_listener::<EventRequestPaused>()
            .await
            .map_err(|e| RunError::Browser(format!("failed to listen for requests: {e}")))?;
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let url = event.request.url.clone();
                let request_id = event.request_id.clone();
                let drop_it = eval
                    .eval_bound(&predicate, &[("_url", url.clone())])
                    .map(|d| Evaluator::truthy(&d))
                    .unwrap_or_else(|e| {
                        warn!(url = %url, "request filter predicate failed: {e}");
                        false
                    });
                if drop_it {
                    debug!(url = %url, "request aborted by filter");
                    let params = FailRequestParams::builder()
                        .request_id(request_id)
                        .error_reason(ErrorReason::Aborted)
                        .build();
                    match params {
                        Ok(p) => {
                            if let Err(e) = page.execute(p).await {
                                warn!("failed to abort request: {e}");
                            }
                        }
                        Err(e) => warn!("failed to build abort params: {e}"),
                    }
                } else {
                    let params = ContinueRequestParams::builder().request_id(request_id).build();
                    match params {
                        Ok(p) => {
                            if let Err(e) = page.execute(p).await {
                                warn!("failed to continue request: {e}");
                            }
                        }
                        Err(e) => warn!("failed to build continue params: {e}"),
                    }
                }
            }
        });
        Ok(())
    }

    async fn input_pause(&self) {
        let ms = rand::thread_rng().gen_range(INPUT_PAUSE_MIN_MS..=INPUT_PAUSE_MAX_MS);
        sleep(Duration::from_millis(ms)).await;
    }
}
