//! Session runtime: one end-to-end task run.
//!
//! A session seeds the variable store, drives the root command sequence,
//! captures an on-failure screenshot while a page is still open, always
//! drains the cleanup stack, and exposes the result snapshot plus an
//! idempotent teardown. One instance serves exactly one run.

use crate::command::{TaskRequest, TaskResult, STATUS_FAILURE, STATUS_SUCCESS};
use crate::config::Config;
use crate::error::RunError;
use crate::interpreter::Interpreter;
use crate::metrics;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Process-wide count of sessions between creation and close. The metrics
/// gauge mirrors it.
static ACTIVE: AtomicUsize = AtomicUsize::new(0);

/// Number of sessions currently open, across all transports.
pub fn active_sessions() -> usize {
    ACTIVE.load(Ordering::SeqCst)
}

fn retire_session() {
    let previous = ACTIVE
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
        .unwrap_or(0);
    metrics::ACTIVE_SESSIONS.set(previous.saturating_sub(1) as i64);
}

/// Label used for the screenshot captured when the main sequence fails.
const FAILURE_LABEL: &str = "on-failure";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Idle,
    Running,
    Cleanup,
    Finished,
}

pub struct Session {
    interp: Interpreter,
    state: SessionState,
    closed: bool,
}

impl Session {
    pub fn new(config: &Config) -> Self {
        let now = ACTIVE.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::ACTIVE_SESSIONS.set(now as i64);
        Self {
            interp: Interpreter::new(config),
            state: SessionState::Idle,
            closed: false,
        }
    }

    /// Run the task to completion.
    ///
    /// The main sequence is bounded by the request's time budget; cleanup
    /// is not, so registered cleanup always runs. An early-exit signal
    /// reaching this boundary counts as a clean stop. Any error is returned
    /// after diagnostics and cleanup have been taken care of.
    pub async fn start(&mut self, request: &TaskRequest) -> Result<(), RunError> {
        if self.state != SessionState::Idle {
            return Err(RunError::Invalid("session already started".into()));
        }
        self.state = SessionState::Running;
        let run_timer = metrics::RUN_DURATION_SECONDS.start_timer();

        self.interp.store_mut().seed(request.variables.iter());

        let outcome = match request.timeout_millis {
            Some(ms) => match timeout(
                Duration::from_millis(ms),
                self.interp.dispatch(&request.commands),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(RunError::Timeout),
            },
            None => self.interp.dispatch(&request.commands).await,
        };

        // A Break that made it all the way here had nothing left to break
        // out of; the run is complete.
        let failure = match outcome {
            Ok(_) => None,
            Err(error) => Some(error),
        };

        if failure.is_some() {
            self.interp.capture_screenshot(FAILURE_LABEL).await;
        }

        self.state = SessionState::Cleanup;
        self.interp.drain_cleanup().await;
        self.state = SessionState::Finished;

        run_timer.observe_duration();
        let label = if failure.is_none() { "success" } else { "failure" };
        metrics::RUNS_TOTAL.with_label_values(&[label]).inc();

        match failure {
            None => Ok(()),
            Some(error) => Err(error),
        }
    }

    /// Snapshot the run into a result payload. Valid once `start` has
    /// settled, with either outcome.
    pub fn result(&self, outcome: &Result<(), RunError>, request: &TaskRequest) -> TaskResult {
        let (status, message) = match outcome {
            Ok(()) => (STATUS_SUCCESS, "SUCCESS".to_string()),
            Err(error) => (STATUS_FAILURE, error.to_string()),
        };
        TaskResult {
            status: status.to_string(),
            message,
            variables: self.interp.store().snapshot(),
            logs: self.interp.logs().to_vec(),
            diagnostics: self.interp.diagnostics().to_vec(),
            echoed_input: serde_json::to_string(request).unwrap_or_default(),
        }
    }

    /// Release the browser and retire this session from the process-wide
    /// count. Safe to call more than once.
    pub async fn close(&mut self) {
        if self.closed {
            debug!("session close called twice");
            return;
        }
        self.closed = true;
        self.interp.shutdown_browser().await;
        retire_session();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.closed {
            // The owner skipped close(); keep the count honest. The browser
            // process (if any) is reaped by its own kill-on-drop handling.
            warn!("session dropped without close");
            self.closed = true;
            retire_session();
        }
    }
}
