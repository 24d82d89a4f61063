//! The command interpreter: sequencing, handler dispatch and control flow.
//!
//! A task document is an ordered sequence of commands; [`Interpreter::dispatch`]
//! walks it, resolves each command's kind against the closed [`CommandKind`]
//! set and runs the matching handler. Control-flow handlers (`loop`,
//! `condition`, `sub`/`call`, `finally`, `break`) recurse back into the
//! dispatcher, so control flow nests arbitrarily around leaf actions.
//!
//! Early exit is modelled as a dispatch result ([`Flow::Break`]) rather than
//! an error: the nearest loop, `call` or executed condition branch converts
//! it back to normal completion, and real failures are never swallowed on
//! the way up.

use crate::browser::BrowserDriver;
use crate::command::{Branch, Command, CommandKind, Diagnostic};
use crate::config::Config;
use crate::error::RunError;
use crate::eval::Evaluator;
use crate::metrics;
use crate::profile::ProfileClient;
use crate::store::VarStore;
use async_recursion::async_recursion;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Reserved store key holding the zero-based index of the innermost running
/// loop iteration.
pub const LOOP_COUNTER_KEY: &str = "loopCounter";

/// Default store key for fingerprint profile ids.
const PROFILE_ID_KEY: &str = "profileId";

/// Outcome of dispatching a command or a sequence.
///
/// `Break` is a structured early-exit request, not a failure. A sequence
/// stops at the first `Break` and hands it to its caller; boundaries that
/// contain it (`loop`, `call`, a chosen `condition` branch, the session
/// root) resume normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Flow {
    Continue,
    Break,
}

/// Per-session interpreter state: the variable store, subroutine registry,
/// cleanup stack, log and screenshot accumulators, the evaluation engine
/// and (once booted) the browser driver.
pub struct Interpreter {
    store: VarStore,
    subs: HashMap<String, Vec<Command>>,
    cleanup: Vec<Vec<Command>>,
    logs: Vec<String>,
    shots: Vec<Diagnostic>,
    eval: Arc<Evaluator>,
    http: reqwest::Client,
    profiles: ProfileClient,
    browser: Option<BrowserDriver>,
    headless: bool,
    browser_args: Vec<String>,
    wait_for_navigation: bool,
}

impl Interpreter {
    pub fn new(config: &Config) -> Self {
        Self {
            store: VarStore::new(),
            subs: HashMap::new(),
            cleanup: Vec::new(),
            logs: Vec::new(),
            shots: Vec::new(),
            eval: Arc::new(Evaluator::new()),
            http: reqwest::Client::new(),
            profiles: ProfileClient::new(&config.profile_api, config.profile_token.clone()),
            browser: None,
            headless: config.headless,
            browser_args: config.browser_args.clone(),
            wait_for_navigation: config.wait_for_navigation,
        }
    }

    pub fn store(&self) -> &VarStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut VarStore {
        &mut self.store
    }

    pub fn logs(&self) -> &[String] {
        &self.logs
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.shots
    }

    fn log(&mut self, message: impl Into<String>) {
        let message = message.into();
        debug!("{message}");
        self.logs.push(message);
    }

    // ── Dispatch ────────────────────────────────────────────────────────────

    /// Run a command sequence in order. Stops at the first `Break` (handing
    /// it to the caller) or the first error (aborting the rest of the
    /// sequence).
    #[async_recursion]
    pub async fn dispatch(&mut self, cmds: &[Command]) -> Result<Flow, RunError> {
        for cmd in cmds {
            let comment = cmd.comment.as_deref().unwrap_or("");
            self.log(format!("cmd: {} {}", cmd.kind, comment));
            let kind = CommandKind::parse(&cmd.kind)
                .ok_or_else(|| RunError::CommandNotFound(cmd.kind.clone()))?;
            metrics::COMMANDS_TOTAL.with_label_values(&[kind.as_str()]).inc();
            let flow = match kind {
                CommandKind::Loop => self.run_loop(cmd).await?,
                CommandKind::Condition => self.run_condition(cmd).await?,
                CommandKind::Break => self.run_break(cmd)?,
                CommandKind::Sub => self.run_sub(cmd)?,
                CommandKind::Call => self.run_call(cmd).await?,
                CommandKind::Finally => self.run_finally(cmd)?,
                CommandKind::Var => self.run_var(cmd)?,
                CommandKind::Log => self.run_log(cmd)?,
                CommandKind::Js => self.run_js(cmd)?,
                CommandKind::Throw => self.run_throw(cmd)?,
                CommandKind::Wait => self.run_wait(cmd).await?,
                CommandKind::WaitRand => self.run_wait_rand(cmd).await?,
                CommandKind::Random => self.run_random(cmd)?,
                CommandKind::HttpGet => self.run_http_get(cmd).await?,
                CommandKind::BootBrowser => self.run_boot_browser(cmd).await?,
                CommandKind::NewPage => self.run_new_page().await?,
                CommandKind::AlwaysPage => self.run_always_page().await?,
                CommandKind::ReloadPage => self.run_reload_page().await?,
                CommandKind::ClosePage => self.run_close_page().await?,
                CommandKind::Shutdown => self.run_shutdown().await?,
                CommandKind::Navigate => self.run_navigate(cmd).await?,
                CommandKind::SetHeader => self.run_set_header(cmd).await?,
                CommandKind::SetNavigationTimeout => self.run_set_navigation_timeout(cmd)?,
                CommandKind::WaitForNavigation => self.run_wait_for_navigation().await?,
                CommandKind::WaitForSelector => self.run_wait_for_selector(cmd).await?,
                CommandKind::Hover => self.run_hover(cmd).await?,
                CommandKind::Click => self.run_click(cmd).await?,
                CommandKind::DbClick => self.run_db_click(cmd).await?,
                CommandKind::Type => self.run_type(cmd).await?,
                CommandKind::Select => self.run_select(cmd).await?,
                CommandKind::TextContent => self.run_text_content(cmd).await?,
                CommandKind::HtmlContent => self.run_html_content(cmd).await?,
                CommandKind::ElementCount => self.run_element_count(cmd).await?,
                CommandKind::FilterRequest => self.run_filter_request(cmd).await?,
                CommandKind::Screenshot => self.run_screenshot(cmd).await?,
                CommandKind::CreateProfile => self.run_create_profile(cmd).await?,
                CommandKind::BootProfile => self.run_boot_profile(cmd).await?,
                CommandKind::RemoveProfile => self.run_remove_profile(cmd).await?,
            };
            if flow == Flow::Break {
                return Ok(Flow::Break);
            }
        }
        Ok(Flow::Continue)
    }

    // ── Value resolution ────────────────────────────────────────────────────

    /// Resolve the datum a command acts on.
    ///
    /// A non-empty `Key` is evaluated as an expression with the store bound:
    /// a bare key name yields that entry's current value, richer expressions
    /// yield their computed result. Without a `Key`, the literal `Value` is
    /// used as-is. An empty-string `Key` counts as absent.
    fn resolve(&self, cmd: &Command) -> Result<String, RunError> {
        match cmd.key.as_deref() {
            Some(key) if !key.is_empty() => {
                let d = self.eval.eval(key, &self.store)?;
                Ok(Evaluator::stringify(&d))
            }
            _ => Ok(cmd.value.clone().unwrap_or_default()),
        }
    }

    fn resolve_number(&self, cmd: &Command) -> Result<i64, RunError> {
        let s = self.resolve(cmd)?;
        let t = s.trim();
        if let Ok(i) = t.parse::<i64>() {
            Ok(i)
        } else if let Ok(f) = t.parse::<f64>() {
            Ok(f as i64)
        } else {
            Err(RunError::Eval(format!("expected a number, got `{s}`")))
        }
    }

    /// Evaluate the command's condition (the `Key` expression, or `Value`
    /// when no `Key` is set) down to a boolean.
    fn resolve_condition(&self, cmd: &Command) -> Result<bool, RunError> {
        let expr = match cmd.key.as_deref() {
            Some(key) if !key.is_empty() => key,
            _ => cmd.value.as_deref().unwrap_or(""),
        };
        let d = self.eval.eval(expr, &self.store)?;
        Ok(Evaluator::truthy(&d))
    }

    /// The element index for multi-match selectors, evaluated as an
    /// expression so it can reference store entries (e.g. `loopCounter`).
    fn resolve_index(&self, cmd: &Command) -> Result<Option<usize>, RunError> {
        let Some(expr) = cmd.index.as_deref().filter(|s| !s.trim().is_empty()) else {
            return Ok(None);
        };
        let d = self.eval.eval(expr, &self.store)?;
        let s = Evaluator::stringify(&d);
        s.trim()
            .parse::<usize>()
            .map(Some)
            .map_err(|_| RunError::Eval(format!("index did not resolve to an integer: `{s}`")))
    }

    /// The store key a command writes its result to. Write targets are plain
    /// names and never evaluated.
    fn target_key<'a>(&self, cmd: &'a Command, kind: &str) -> Result<&'a str, RunError> {
        cmd.key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| RunError::Invalid(format!("`{kind}` requires a Key to store into")))
    }

    fn target_selector<'a>(&self, cmd: &'a Command, kind: &str) -> Result<&'a str, RunError> {
        cmd.selector
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| RunError::Invalid(format!("`{kind}` requires a Selector")))
    }

    fn option_number(&self, cmd: &Command, name: &str) -> Result<Option<i64>, RunError> {
        let Some(value) = cmd.options.as_ref().and_then(|o| o.get(name)) else {
            return Ok(None);
        };
        match value {
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(Some)
                .ok_or_else(|| RunError::Invalid(format!("option `{name}` is not an integer"))),
            serde_json::Value::String(s) => {
                let d = self.eval.eval(s, &self.store)?;
                let s = Evaluator::stringify(&d);
                s.trim()
                    .parse::<i64>()
                    .map(Some)
                    .map_err(|_| RunError::Eval(format!("option `{name}` did not resolve to an integer")))
            }
            _ => Err(RunError::Invalid(format!("option `{name}` is not a number"))),
        }
    }

    fn option_bool(&self, cmd: &Command, name: &str) -> Option<bool> {
        cmd.options.as_ref().and_then(|o| o.get(name)).and_then(|v| v.as_bool())
    }

    // ── Control flow ────────────────────────────────────────────────────────

    async fn run_loop(&mut self, cmd: &Command) -> Result<Flow, RunError> {
        let count = self.resolve_number(cmd)?.max(0);
        self.log(format!("loop: {count}"));
        let body = cmd.nested.as_deref().unwrap_or(&[]);
        for i in 0..count {
            self.store.set(LOOP_COUNTER_KEY, i.to_string());
            match self.dispatch(body).await? {
                Flow::Break => break,
                Flow::Continue => {}
            }
        }
        Ok(Flow::Continue)
    }

    async fn run_condition(&mut self, cmd: &Command) -> Result<Flow, RunError> {
        let branches: &[Branch] = cmd.branches.as_deref().unwrap_or(&[]);
        for branch in branches {
            let d = self.eval.eval(&branch.condition, &self.store)?;
            if Evaluator::truthy(&d) {
                self.log(format!("true: {}", branch.condition));
                // An early exit from the chosen branch stops here; the
                // condition command itself completes normally.
                let _ = self.dispatch(&branch.nested).await?;
                return Ok(Flow::Continue);
            }
            self.log(format!("false: {}", branch.condition));
        }
        Ok(Flow::Continue)
    }

    fn run_break(&mut self, cmd: &Command) -> Result<Flow, RunError> {
        let has_condition = cmd.key.as_deref().is_some_and(|k| !k.is_empty())
            || cmd.value.as_deref().is_some_and(|v| !v.is_empty());
        if !has_condition {
            return Ok(Flow::Break);
        }
        if self.resolve_condition(cmd)? {
            Ok(Flow::Break)
        } else {
            self.log("break: condition not met");
            Ok(Flow::Continue)
        }
    }

    fn run_sub(&mut self, cmd: &Command) -> Result<Flow, RunError> {
        let name = self.resolve(cmd)?;
        if name.is_empty() {
            return Err(RunError::Invalid("`sub` requires a name".into()));
        }
        let body = cmd.nested.clone().unwrap_or_default();
        if self.subs.insert(name.clone(), body).is_some() {
            debug!(name = %name, "subroutine redefined");
        }
        Ok(Flow::Continue)
    }

    async fn run_call(&mut self, cmd: &Command) -> Result<Flow, RunError> {
        let name = self.resolve(cmd)?;
        let body = self
            .subs
            .get(&name)
            .cloned()
            .ok_or_else(|| RunError::SubroutineNotFound(name.clone()))?;
        // An early exit inside the subroutine is contained by the call.
        let _ = self.dispatch(&body).await?;
        Ok(Flow::Continue)
    }

    fn run_finally(&mut self, cmd: &Command) -> Result<Flow, RunError> {
        self.cleanup.push(cmd.nested.clone().unwrap_or_default());
        Ok(Flow::Continue)
    }

    /// Pop and run every registered cleanup sequence, most recent first.
    /// A failing sequence is logged and draining moves on to the next one.
    pub async fn drain_cleanup(&mut self) {
        while let Some(seq) = self.cleanup.pop() {
            match self.dispatch(&seq).await {
                Ok(_) => {}
                Err(e) => self.log(format!("cleanup step failed: {e}")),
            }
        }
    }

    // ── Data and utility commands ───────────────────────────────────────────

    fn run_var(&mut self, cmd: &Command) -> Result<Flow, RunError> {
        let key = self.target_key(cmd, "var")?.to_string();
        let d = self.eval.eval(cmd.value.as_deref().unwrap_or(""), &self.store)?;
        self.store.set(key, Evaluator::stringify(&d));
        Ok(Flow::Continue)
    }

    fn run_log(&mut self, cmd: &Command) -> Result<Flow, RunError> {
        let message = self.resolve(cmd)?;
        self.log(message);
        Ok(Flow::Continue)
    }

    fn run_js(&mut self, cmd: &Command) -> Result<Flow, RunError> {
        let src = self.resolve(cmd)?;
        self.log(format!("js: {src}"));
        let result = self.eval.eval(&src, &self.store)?;
        if let Some(map) = Evaluator::as_map(result) {
            for (k, v) in map {
                self.store.set(k.to_string(), Evaluator::stringify(&v));
            }
        }
        Ok(Flow::Continue)
    }

    fn run_throw(&mut self, cmd: &Command) -> Result<Flow, RunError> {
        Err(RunError::UserRaised(self.resolve(cmd)?))
    }

    async fn run_wait(&mut self, cmd: &Command) -> Result<Flow, RunError> {
        let ms = self.resolve_number(cmd)?.max(0) as u64;
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(Flow::Continue)
    }

    async fn run_wait_rand(&mut self, cmd: &Command) -> Result<Flow, RunError> {
        let min = self.option_number(cmd, "min")?.unwrap_or(1000).max(0) as u64;
        let max = self.option_number(cmd, "max")?.unwrap_or(5000).max(0) as u64;
        let (lo, hi) = if min <= max { (min, max) } else { (max, min) };
        let ms = rand::thread_rng().gen_range(lo..=hi);
        self.log(format!("waitRand: {ms}ms"));
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(Flow::Continue)
    }

    fn run_random(&mut self, cmd: &Command) -> Result<Flow, RunError> {
        let key = self.target_key(cmd, "random")?.to_string();
        let min = self.option_number(cmd, "min")?.unwrap_or(0);
        let max = self.option_number(cmd, "max")?.unwrap_or(100);
        let (lo, hi) = if min <= max { (min, max) } else { (max, min) };
        let n = rand::thread_rng().gen_range(lo..=hi);
        self.store.set(key, n.to_string());
        Ok(Flow::Continue)
    }

    async fn run_http_get(&mut self, cmd: &Command) -> Result<Flow, RunError> {
        let key = self.target_key(cmd, "httpGet")?.to_string();
        let url = cmd
            .value
            .clone()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| RunError::Invalid("`httpGet` requires a Value url".into()))?;
        let body = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| RunError::Http(e.to_string()))?
            .text()
            .await
            .map_err(|e| RunError::Http(e.to_string()))?;
        self.store.set(key, body);
        Ok(Flow::Continue)
    }

    // ── Browser session and pages ───────────────────────────────────────────

    fn driver(&self) -> Result<&BrowserDriver, RunError> {
        self.browser
            .as_ref()
            .ok_or_else(|| RunError::Browser("no browser session; run bootBrowser or bootProfile first".into()))
    }

    fn driver_mut(&mut self) -> Result<&mut BrowserDriver, RunError> {
        self.browser
            .as_mut()
            .ok_or_else(|| RunError::Browser("no browser session; run bootBrowser or bootProfile first".into()))
    }

    /// Close the browser if one is open. Used by the session teardown and
    /// by the `shutdown` command.
    pub async fn shutdown_browser(&mut self) {
        if let Some(mut driver) = self.browser.take() {
            driver.shutdown().await;
        }
    }

    /// Best-effort screenshot of the active page, recorded under the given
    /// label. Silent no-op when no page is open.
    pub async fn capture_screenshot(&mut self, label: &str) {
        let Some(driver) = self.browser.as_ref() else { return };
        if !driver.has_page() {
            return;
        }
        match driver.screenshot().await {
            Ok(bytes) => self.shots.push(Diagnostic {
                label: label.to_string(),
                image_data: BASE64.encode(bytes),
            }),
            Err(e) => self.log(format!("screenshot failed: {e}")),
        }
    }

    async fn run_boot_browser(&mut self, cmd: &Command) -> Result<Flow, RunError> {
        if self.browser.is_some() {
            self.log("bootBrowser: session already running");
            return Ok(Flow::Continue);
        }
        let headless = self.option_bool(cmd, "headless").unwrap_or(self.headless);
        let mut args = self.browser_args.clone();
        if let Some(extra) = cmd
            .options
            .as_ref()
            .and_then(|o| o.get("args"))
            .and_then(|v| v.as_array())
        {
            args.extend(extra.iter().filter_map(|v| v.as_str().map(String::from)));
        }
        self.browser = Some(BrowserDriver::launch(headless, &args).await?);
        Ok(Flow::Continue)
    }

    async fn run_new_page(&mut self) -> Result<Flow, RunError> {
        self.driver_mut()?.new_page().await?;
        Ok(Flow::Continue)
    }

    async fn run_always_page(&mut self) -> Result<Flow, RunError> {
        self.driver_mut()?.always_page().await?;
        Ok(Flow::Continue)
    }

    async fn run_reload_page(&mut self) -> Result<Flow, RunError> {
        self.driver()?.reload().await?;
        Ok(Flow::Continue)
    }

    async fn run_close_page(&mut self) -> Result<Flow, RunError> {
        self.driver_mut()?.close_page().await?;
        Ok(Flow::Continue)
    }

    async fn run_shutdown(&mut self) -> Result<Flow, RunError> {
        self.shutdown_browser().await;
        Ok(Flow::Continue)
    }

    // ── Navigation and page setup ───────────────────────────────────────────

    async fn run_navigate(&mut self, cmd: &Command) -> Result<Flow, RunError> {
        let url = self.resolve(cmd)?;
        if url.is_empty() {
            return Err(RunError::Invalid("`navigate` requires a url".into()));
        }
        let wait = self
            .option_bool(cmd, "waitForNavigation")
            .unwrap_or(self.wait_for_navigation);
        self.driver()?.navigate(&url, wait).await?;
        Ok(Flow::Continue)
    }

    async fn run_set_header(&mut self, cmd: &Command) -> Result<Flow, RunError> {
        if self.driver()?.is_remote() {
            // Profile-managed browsers own their fingerprint headers.
            self.log("setHeader ignored for profile sessions");
            return Ok(Flow::Continue);
        }
        let headers = cmd
            .options
            .clone()
            .ok_or_else(|| RunError::Invalid("`setHeader` requires Options with header pairs".into()))?;
        self.driver()?.set_headers(headers).await?;
        Ok(Flow::Continue)
    }

    fn run_set_navigation_timeout(&mut self, cmd: &Command) -> Result<Flow, RunError> {
        let ms = self.resolve_number(cmd)?.max(0) as u64;
        self.driver_mut()?.set_nav_timeout(ms);
        Ok(Flow::Continue)
    }

    async fn run_wait_for_navigation(&mut self) -> Result<Flow, RunError> {
        self.driver()?.wait_for_navigation().await?;
        Ok(Flow::Continue)
    }

    async fn run_wait_for_selector(&mut self, cmd: &Command) -> Result<Flow, RunError> {
        let selector = self.target_selector(cmd, "waitForSelector")?;
        self.driver()?.wait_for_selector(selector).await?;
        Ok(Flow::Continue)
    }

    // ── Element interaction ─────────────────────────────────────────────────

    async fn run_hover(&mut self, cmd: &Command) -> Result<Flow, RunError> {
        let selector = self.target_selector(cmd, "hover")?.to_string();
        let index = self.resolve_index(cmd)?;
        self.driver()?.hover(&selector, index).await?;
        Ok(Flow::Continue)
    }

    async fn run_click(&mut self, cmd: &Command) -> Result<Flow, RunError> {
        let selector = self.target_selector(cmd, "click")?.to_string();
        let index = self.resolve_index(cmd)?;
        self.driver()?.click(&selector, index).await?;
        Ok(Flow::Continue)
    }

    async fn run_db_click(&mut self, cmd: &Command) -> Result<Flow, RunError> {
        let selector = self.target_selector(cmd, "dbClick")?.to_string();
        let index = self.resolve_index(cmd)?;
        self.driver()?.double_click(&selector, index).await?;
        Ok(Flow::Continue)
    }

    async fn run_type(&mut self, cmd: &Command) -> Result<Flow, RunError> {
        let selector = self.target_selector(cmd, "type")?.to_string();
        let index = self.resolve_index(cmd)?;
        let text = self.resolve(cmd)?;
        self.driver()?.type_text(&selector, index, &text).await?;
        Ok(Flow::Continue)
    }

    async fn run_select(&mut self, cmd: &Command) -> Result<Flow, RunError> {
        let selector = self.target_selector(cmd, "select")?.to_string();
        let index = self.resolve_index(cmd)?;
        let value = self.resolve(cmd)?;
        self.driver()?.select_option(&selector, index, &value).await?;
        Ok(Flow::Continue)
    }

    // ── Page reads and network ──────────────────────────────────────────────

    async fn run_text_content(&mut self, cmd: &Command) -> Result<Flow, RunError> {
        let key = self.target_key(cmd, "textContent")?.to_string();
        let selector = self.target_selector(cmd, "textContent")?.to_string();
        let index = self.resolve_index(cmd)?;
        let text = self.driver()?.text_content(&selector, index).await?;
        self.store.set(key, text);
        Ok(Flow::Continue)
    }

    async fn run_html_content(&mut self, cmd: &Command) -> Result<Flow, RunError> {
        let key = self.target_key(cmd, "htmlContent")?.to_string();
        let selector = self.target_selector(cmd, "htmlContent")?.to_string();
        let index = self.resolve_index(cmd)?;
        let html = self.driver()?.html_content(&selector, index).await?;
        self.store.set(key, html);
        Ok(Flow::Continue)
    }

    async fn run_element_count(&mut self, cmd: &Command) -> Result<Flow, RunError> {
        let key = self.target_key(cmd, "elementCount")?.to_string();
        let selector = self.target_selector(cmd, "elementCount")?.to_string();
        let count = self.driver()?.element_count(&selector).await?;
        self.store.set(key, count.to_string());
        Ok(Flow::Continue)
    }

    async fn run_filter_request(&mut self, cmd: &Command) -> Result<Flow, RunError> {
        let predicate = cmd
            .key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| RunError::Invalid("`filterRequest` requires a Key predicate".into()))?;
        let eval = Arc::clone(&self.eval);
        self.driver()?.install_request_filter(predicate, eval).await?;
        Ok(Flow::Continue)
    }

    async fn run_screenshot(&mut self, cmd: &Command) -> Result<Flow, RunError> {
        let label = match self.resolve(cmd)? {
            l if l.is_empty() => "manual".to_string(),
            l => l,
        };
        let bytes = self.driver()?.screenshot().await?;
        self.shots.push(Diagnostic {
            label,
            image_data: BASE64.encode(bytes),
        });
        Ok(Flow::Continue)
    }

    // ── Fingerprint profiles ────────────────────────────────────────────────

    async fn run_create_profile(&mut self, cmd: &Command) -> Result<Flow, RunError> {
        let raw = self.resolve(cmd)?;
        let payload: serde_json::Value = if !raw.is_empty() {
            serde_json::from_str(&raw)
                .map_err(|e| RunError::Invalid(format!("createProfile options are not valid JSON: {e}")))?
        } else if let Some(options) = &cmd.options {
            options.clone()
        } else {
            return Err(RunError::Invalid("`createProfile` requires creation options".into()));
        };
        let id = self.profiles.create(&payload).await?;
        self.log(format!("profile created: {id}"));
        self.store.set(PROFILE_ID_KEY, id);
        Ok(Flow::Continue)
    }

    async fn run_boot_profile(&mut self, cmd: &Command) -> Result<Flow, RunError> {
        let mut id = self.resolve(cmd)?;
        if id.is_empty() {
            id = self.store.get(PROFILE_ID_KEY).unwrap_or_default().to_string();
        }
        if id.is_empty() {
            return Err(RunError::Profile("no profile id available".into()));
        }
        let ws_url = self.profiles.start(&id).await?;
        self.shutdown_browser().await;
        self.browser = Some(BrowserDriver::connect(&ws_url).await?);
        Ok(Flow::Continue)
    }

    async fn run_remove_profile(&mut self, cmd: &Command) -> Result<Flow, RunError> {
        let remote = self.browser.as_ref().map(BrowserDriver::is_remote).unwrap_or(false);
        if !remote {
            self.log("removeProfile skipped: no profile session");
            return Ok(Flow::Continue);
        }
        let mut id = self.resolve(cmd)?;
        if id.is_empty() {
            id = self.store.get(PROFILE_ID_KEY).unwrap_or_default().to_string();
        }
        if id.is_empty() {
            return Err(RunError::Profile("no profile id available".into()));
        }
        self.profiles.remove(&id).await?;
        self.log(format!("profile removed: {id}"));
        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn interp() -> Interpreter {
        Interpreter::new(&Config::default())
    }

    fn cmd(v: serde_json::Value) -> Command {
        serde_json::from_value(v).unwrap()
    }

    #[tokio::test]
    async fn test_key_wins_over_value() {
        let mut it = interp();
        it.store_mut().set("keyword", "from-store");
        let c = cmd(json!({ "Kind": "log", "Key": "keyword", "Value": "from-literal" }));
        assert_eq!(it.resolve(&c).unwrap(), "from-store");
    }

    #[tokio::test]
    async fn test_empty_key_is_absent() {
        let it = interp();
        let c = cmd(json!({ "Kind": "log", "Key": "", "Value": "literal" }));
        assert_eq!(it.resolve(&c).unwrap(), "literal");
    }

    #[tokio::test]
    async fn test_value_is_literal_not_evaluated() {
        let it = interp();
        let c = cmd(json!({ "Kind": "log", "Value": "1 + 1" }));
        assert_eq!(it.resolve(&c).unwrap(), "1 + 1");
    }

    #[tokio::test]
    async fn test_var_evaluates_value() {
        let mut it = interp();
        let seq = vec![cmd(json!({ "Kind": "var", "Key": "sum", "Value": "40 + 2" }))];
        let flow = it.dispatch(&seq).await.unwrap();
        assert_eq!(flow, Flow::Continue);
        assert_eq!(it.store().get("sum"), Some("42"));
    }

    #[tokio::test]
    async fn test_dispatch_aborts_on_unknown_kind() {
        let mut it = interp();
        let seq = vec![
            cmd(json!({ "Kind": "var", "Key": "a", "Value": "\"1\"" })),
            cmd(json!({ "Kind": "teleport" })),
            cmd(json!({ "Kind": "var", "Key": "b", "Value": "\"2\"" })),
        ];
        let err = it.dispatch(&seq).await.unwrap_err();
        assert!(matches!(err, RunError::CommandNotFound(k) if k == "teleport"));
        assert_eq!(it.store().get("a"), Some("1"));
        assert_eq!(it.store().get("b"), None);
    }

    #[tokio::test]
    async fn test_loop_counter_sequence() {
        let mut it = interp();
        let seq = vec![cmd(json!({
            "Kind": "loop",
            "Value": "3",
            "Nested": [
                { "Kind": "var", "Key": "trace", "Value": "trace + loopCounter" }
            ]
        }))];
        it.store_mut().set("trace", "");
        it.dispatch(&seq).await.unwrap();
        assert_eq!(it.store().get("trace"), Some("012"));
        assert_eq!(it.store().get(LOOP_COUNTER_KEY), Some("2"));
    }

    #[tokio::test]
    async fn test_break_terminates_only_inner_loop() {
        let mut it = interp();
        it.store_mut().set("trace", "");
        let seq = vec![cmd(json!({
            "Kind": "loop",
            "Value": "2",
            "Nested": [
                { "Kind": "var", "Key": "outer", "Value": "loopCounter" },
                { "Kind": "loop", "Value": "5", "Nested": [
                    { "Kind": "var", "Key": "trace", "Value": "trace + outer + loopCounter" },
                    { "Kind": "break", "Key": "loopCounter == \"1\"" }
                ]},
                { "Kind": "var", "Key": "trace", "Value": "trace + \".\"" }
            ]
        }))];
        let flow = it.dispatch(&seq).await.unwrap();
        assert_eq!(flow, Flow::Continue);
        // Inner loop runs iterations 0 and 1 per outer pass, then breaks;
        // the outer loop still completes both passes.
        assert_eq!(it.store().get("trace"), Some("0001.1011."));
    }

    #[tokio::test]
    async fn test_unconditional_break_stops_sequence() {
        let mut it = interp();
        let seq = vec![
            cmd(json!({ "Kind": "var", "Key": "a", "Value": "\"1\"" })),
            cmd(json!({ "Kind": "break" })),
            cmd(json!({ "Kind": "var", "Key": "b", "Value": "\"2\"" })),
        ];
        let flow = it.dispatch(&seq).await.unwrap();
        assert_eq!(flow, Flow::Break);
        assert_eq!(it.store().get("a"), Some("1"));
        assert_eq!(it.store().get("b"), None);
    }

    #[tokio::test]
    async fn test_conditional_break_not_met_continues() {
        let mut it = interp();
        let seq = vec![
            cmd(json!({ "Kind": "break", "Key": "\"0\" == \"1\"" })),
            cmd(json!({ "Kind": "var", "Key": "after", "Value": "\"yes\"" })),
        ];
        let flow = it.dispatch(&seq).await.unwrap();
        assert_eq!(flow, Flow::Continue);
        assert_eq!(it.store().get("after"), Some("yes"));
    }

    #[tokio::test]
    async fn test_condition_first_truthy_branch_only() {
        let mut it = interp();
        it.store_mut().set("x", "false");
        let seq = vec![cmd(json!({
            "Kind": "condition",
            "Branches": [
                { "Condition": "x == \"true\"", "Nested": [{ "Kind": "var", "Key": "ran", "Value": "\"A\"" }] },
                { "Condition": "true", "Nested": [{ "Kind": "var", "Key": "ran", "Value": "\"B\"" }] },
                { "Condition": "true", "Nested": [{ "Kind": "var", "Key": "ran", "Value": "\"C\"" }] }
            ]
        }))];
        it.dispatch(&seq).await.unwrap();
        assert_eq!(it.store().get("ran"), Some("B"));
    }

    #[tokio::test]
    async fn test_condition_no_match_is_noop() {
        let mut it = interp();
        let seq = vec![cmd(json!({
            "Kind": "condition",
            "Branches": [
                { "Condition": "false", "Nested": [{ "Kind": "var", "Key": "ran", "Value": "\"A\"" }] }
            ]
        }))];
        let flow = it.dispatch(&seq).await.unwrap();
        assert_eq!(flow, Flow::Continue);
        assert_eq!(it.store().get("ran"), None);
    }

    #[tokio::test]
    async fn test_condition_contains_break() {
        let mut it = interp();
        let seq = vec![
            cmd(json!({
                "Kind": "condition",
                "Branches": [
                    { "Condition": "true", "Nested": [{ "Kind": "break" }] }
                ]
            })),
            cmd(json!({ "Kind": "var", "Key": "after", "Value": "\"yes\"" })),
        ];
        let flow = it.dispatch(&seq).await.unwrap();
        assert_eq!(flow, Flow::Continue);
        assert_eq!(it.store().get("after"), Some("yes"));
    }

    #[tokio::test]
    async fn test_sub_call_roundtrip() {
        let mut it = interp();
        let seq = vec![
            cmd(json!({
                "Kind": "sub",
                "Value": "greet",
                "Nested": [{ "Kind": "var", "Key": "msg", "Value": "\"hello\"" }]
            })),
            cmd(json!({ "Kind": "call", "Value": "greet" })),
        ];
        it.dispatch(&seq).await.unwrap();
        assert_eq!(it.store().get("msg"), Some("hello"));
    }

    #[tokio::test]
    async fn test_call_contains_break() {
        let mut it = interp();
        let seq = vec![
            cmd(json!({
                "Kind": "sub",
                "Value": "stopper",
                "Nested": [
                    { "Kind": "break" },
                    { "Kind": "var", "Key": "inside", "Value": "\"no\"" }
                ]
            })),
            cmd(json!({ "Kind": "call", "Value": "stopper" })),
            cmd(json!({ "Kind": "var", "Key": "after", "Value": "\"yes\"" })),
        ];
        let flow = it.dispatch(&seq).await.unwrap();
        assert_eq!(flow, Flow::Continue);
        assert_eq!(it.store().get("inside"), None);
        assert_eq!(it.store().get("after"), Some("yes"));
    }

    #[tokio::test]
    async fn test_call_unknown_sub_fails_store_untouched() {
        let mut it = interp();
        it.store_mut().set("a", "1");
        let before = it.store().snapshot();
        let seq = vec![cmd(json!({ "Kind": "call", "Value": "nope" }))];
        let err = it.dispatch(&seq).await.unwrap_err();
        assert!(matches!(err, RunError::SubroutineNotFound(n) if n == "nope"));
        assert_eq!(it.store().snapshot(), before);
    }

    #[tokio::test]
    async fn test_sub_redefinition_overwrites() {
        let mut it = interp();
        let seq = vec![
            cmd(json!({ "Kind": "sub", "Value": "s", "Nested": [{ "Kind": "var", "Key": "v", "Value": "\"old\"" }] })),
            cmd(json!({ "Kind": "sub", "Value": "s", "Nested": [{ "Kind": "var", "Key": "v", "Value": "\"new\"" }] })),
            cmd(json!({ "Kind": "call", "Value": "s" })),
        ];
        it.dispatch(&seq).await.unwrap();
        assert_eq!(it.store().get("v"), Some("new"));
    }

    #[tokio::test]
    async fn test_finally_registers_without_running() {
        let mut it = interp();
        let seq = vec![cmd(json!({
            "Kind": "finally",
            "Nested": [{ "Kind": "var", "Key": "cleaned", "Value": "\"yes\"" }]
        }))];
        it.dispatch(&seq).await.unwrap();
        assert_eq!(it.store().get("cleaned"), None);
        it.drain_cleanup().await;
        assert_eq!(it.store().get("cleaned"), Some("yes"));
    }

    #[tokio::test]
    async fn test_cleanup_drains_lifo_and_survives_failure() {
        let mut it = interp();
        it.store_mut().set("order", "");
        let seq = vec![
            cmd(json!({ "Kind": "finally", "Nested": [{ "Kind": "var", "Key": "order", "Value": "order + \"1\"" }] })),
            cmd(json!({ "Kind": "finally", "Nested": [{ "Kind": "throw", "Value": "cleanup boom" }] })),
            cmd(json!({ "Kind": "finally", "Nested": [{ "Kind": "var", "Key": "order", "Value": "order + \"3\"" }] })),
        ];
        it.dispatch(&seq).await.unwrap();
        it.drain_cleanup().await;
        // Last registered runs first; the failing middle sequence is logged
        // and does not stop the drain.
        assert_eq!(it.store().get("order"), Some("31"));
        assert!(it.logs().iter().any(|l| l.contains("cleanup boom")));
    }

    #[tokio::test]
    async fn test_throw_surfaces_user_message() {
        let mut it = interp();
        let seq = vec![cmd(json!({ "Kind": "throw", "Value": "wrong page" }))];
        let err = it.dispatch(&seq).await.unwrap_err();
        assert!(matches!(err, RunError::UserRaised(m) if m == "wrong page"));
    }

    #[tokio::test]
    async fn test_js_map_merges_into_store() {
        let mut it = interp();
        let seq = vec![cmd(json!({
            "Kind": "js",
            "Value": "#{ ip: \"10.1.2.3\", hits: 7 }"
        }))];
        it.dispatch(&seq).await.unwrap();
        assert_eq!(it.store().get("ip"), Some("10.1.2.3"));
        assert_eq!(it.store().get("hits"), Some("7"));
    }

    #[tokio::test]
    async fn test_random_within_bounds() {
        let mut it = interp();
        let seq = vec![cmd(json!({
            "Kind": "random",
            "Key": "rand1",
            "Options": { "min": 2, "max": 5 }
        }))];
        it.dispatch(&seq).await.unwrap();
        let n: i64 = it.store().get("rand1").unwrap().parse().unwrap();
        assert!((2..=5).contains(&n));
    }

    #[tokio::test]
    async fn test_browser_command_without_session_fails() {
        let mut it = interp();
        let seq = vec![cmd(json!({ "Kind": "newPage" }))];
        let err = it.dispatch(&seq).await.unwrap_err();
        assert!(matches!(err, RunError::Browser(_)));
    }

    #[tokio::test]
    async fn test_dynamic_key_resolution() {
        let mut it = interp();
        let seq = vec![
            cmd(json!({ "Kind": "var", "Key": "a", "Value": "\"1\"" })),
            cmd(json!({ "Kind": "var", "Key": "a", "Value": "\"2\"" })),
            cmd(json!({ "Kind": "var", "Key": "seen", "Value": "a" })),
        ];
        it.dispatch(&seq).await.unwrap();
        assert_eq!(it.store().get("seen"), Some("2"));
    }
}
