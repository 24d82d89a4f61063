//! Error taxonomy for task execution.
//!
//! Everything that can abort a running task is a `RunError`. Early exit
//! (`break`) is deliberately NOT here: it travels through the dispatch
//! result channel (`interpreter::Flow`), so only real failures propagate
//! as errors.

use thiserror::Error;

/// A failure raised while executing a task document.
#[derive(Debug, Error)]
pub enum RunError {
    /// The command's kind string matches no registered handler.
    #[error("no handler registered for command kind `{0}`")]
    CommandNotFound(String),

    /// `call` referenced a subroutine name that was never defined.
    #[error("subroutine `{0}` is not defined")]
    SubroutineNotFound(String),

    /// A script-level `throw` command fired with this message.
    #[error("{0}")]
    UserRaised(String),

    /// Expression or script evaluation failed.
    #[error("script evaluation failed: {0}")]
    Eval(String),

    /// A command document is structurally unusable (missing required field).
    #[error("invalid command: {0}")]
    Invalid(String),

    /// The browser driver reported a failure (launch, navigation, element
    /// lookup, CDP call), or a browser command ran without a session/page.
    #[error("browser action failed: {0}")]
    Browser(String),

    /// The fingerprint-profile provider returned an error.
    #[error("profile provider error: {0}")]
    Profile(String),

    /// An outbound HTTP request (`httpGet`) failed.
    #[error("http request failed: {0}")]
    Http(String),

    /// The main command sequence exceeded the task's time budget.
    #[error("task timed out")]
    Timeout,
}
