//! Wire schema for task documents and results.
//!
//! A task is a tree of [`Command`] nodes plus seed variables. Field names on
//! the wire are PascalCase, matching the protocol spoken by existing callers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One node of a task document.
///
/// `kind` selects the handler; the remaining fields are interpreted
/// per-handler. `nested` carries child sequences for control-flow commands,
/// `branches` is used only by `condition`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Command {
    pub kind: String,
    /// Advisory only; echoed into the log stream, no semantic effect.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Open configuration map; recognized keys are handler-specific.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    /// Expression selecting one element when `selector` matches several.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nested: Option<Vec<Command>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branches: Option<Vec<Branch>>,
}

/// One arm of a `condition` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Branch {
    pub condition: String,
    #[serde(default)]
    pub nested: Vec<Command>,
}

/// Root invocation payload: seed variables plus the command sequence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct TaskRequest {
    pub variables: BTreeMap<String, String>,
    pub commands: Vec<Command>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_millis: Option<u64>,
}

/// Result payload returned to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaskResult {
    /// `"success"` or `"failure"`.
    pub status: String,
    pub message: String,
    pub variables: BTreeMap<String, String>,
    pub logs: Vec<String>,
    pub diagnostics: Vec<Diagnostic>,
    /// The original task document, serialized back as received.
    pub echoed_input: String,
}

pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_FAILURE: &str = "failure";

impl TaskResult {
    /// A failure result for input that never reached a session (e.g. an
    /// unparseable document).
    pub fn rejected(message: String, input: &str) -> Self {
        Self {
            status: STATUS_FAILURE.to_string(),
            message,
            variables: BTreeMap::new(),
            logs: Vec::new(),
            diagnostics: Vec::new(),
            echoed_input: input.to_string(),
        }
    }
}

/// A captured screenshot attached to the result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Diagnostic {
    pub label: String,
    /// PNG bytes, base64-encoded.
    pub image_data: String,
}

/// The closed set of command kinds.
///
/// The wire `kind` string is matched against this enumeration at dispatch
/// time; anything else fails with `RunError::CommandNotFound`, which keeps
/// unknown kinds observable instead of silently ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    // Control flow
    Loop,
    Condition,
    Break,
    Sub,
    Call,
    Finally,
    // Data and utility
    Var,
    Log,
    Js,
    Throw,
    Wait,
    WaitRand,
    Random,
    HttpGet,
    // Browser session and pages
    BootBrowser,
    NewPage,
    AlwaysPage,
    ReloadPage,
    ClosePage,
    Shutdown,
    // Navigation and page setup
    Navigate,
    SetHeader,
    SetNavigationTimeout,
    WaitForNavigation,
    WaitForSelector,
    // Element interaction
    Hover,
    Click,
    DbClick,
    Type,
    Select,
    // Page reads and network
    TextContent,
    HtmlContent,
    ElementCount,
    FilterRequest,
    Screenshot,
    // Fingerprint profiles
    CreateProfile,
    BootProfile,
    RemoveProfile,
}

impl CommandKind {
    /// Map a wire kind string onto the closed enumeration.
    pub fn parse(kind: &str) -> Option<Self> {
        use CommandKind::*;
        Some(match kind {
            "loop" => Loop,
            "condition" => Condition,
            "break" => Break,
            "sub" => Sub,
            "call" => Call,
            "finally" => Finally,
            "var" => Var,
            "log" => Log,
            "js" => Js,
            "throw" => Throw,
            "wait" => Wait,
            "waitRand" => WaitRand,
            "random" => Random,
            "httpGet" => HttpGet,
            "bootBrowser" => BootBrowser,
            "newPage" => NewPage,
            "alwaysPage" => AlwaysPage,
            "reloadPage" => ReloadPage,
            "closePage" => ClosePage,
            "shutdown" => Shutdown,
            "navigate" => Navigate,
            "setHeader" => SetHeader,
            "setNavigationTimeout" => SetNavigationTimeout,
            "waitForNavigation" => WaitForNavigation,
            "waitForSelector" => WaitForSelector,
            "hover" => Hover,
            "click" => Click,
            "dbClick" => DbClick,
            "type" => Type,
            "select" => Select,
            "textContent" => TextContent,
            "htmlContent" => HtmlContent,
            "elementCount" => ElementCount,
            "filterRequest" => FilterRequest,
            "screenshot" => Screenshot,
            "createProfile" => CreateProfile,
            "bootProfile" => BootProfile,
            "removeProfile" => RemoveProfile,
            _ => return None,
        })
    }

    /// The wire name, used for logs and metric labels.
    pub fn as_str(&self) -> &'static str {
        use CommandKind::*;
        match self {
            Loop => "loop",
            Condition => "condition",
            Break => "break",
            Sub => "sub",
            Call => "call",
            Finally => "finally",
            Var => "var",
            Log => "log",
            Js => "js",
            Throw => "throw",
            Wait => "wait",
            WaitRand => "waitRand",
            Random => "random",
            HttpGet => "httpGet",
            BootBrowser => "bootBrowser",
            NewPage => "newPage",
            AlwaysPage => "alwaysPage",
            ReloadPage => "reloadPage",
            ClosePage => "closePage",
            Shutdown => "shutdown",
            Navigate => "navigate",
            SetHeader => "setHeader",
            SetNavigationTimeout => "setNavigationTimeout",
            WaitForNavigation => "waitForNavigation",
            WaitForSelector => "waitForSelector",
            Hover => "hover",
            Click => "click",
            DbClick => "dbClick",
            Type => "type",
            Select => "select",
            TextContent => "textContent",
            HtmlContent => "htmlContent",
            ElementCount => "elementCount",
            FilterRequest => "filterRequest",
            Screenshot => "screenshot",
            CreateProfile => "createProfile",
            BootProfile => "bootProfile",
            RemoveProfile => "removeProfile",
        }
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
