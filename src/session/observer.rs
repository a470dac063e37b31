//! Observer hooks for session events.
//!
//! Every hook is invoked through [`isolate`], so an observer that returns an
//! error or panics is logged and skipped; dispatch of later messages goes on.

use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{error, warn};

use crate::error::{Result, SessionError};
use crate::transport::AgentStatus;

/// Result returned by observer hooks
pub type CallbackResult = anyhow::Result<()>;

/// Receives transcripts, agent responses, errors and status changes
///
/// All hooks default to no-ops.
pub trait SessionObserver: Send + Sync {
    /// The user's speech was transcribed
    fn on_transcription(&self, _text: &str) -> CallbackResult {
        Ok(())
    }

    /// The agent produced response text
    fn on_response(&self, _text: &str) -> CallbackResult {
        Ok(())
    }

    /// A server, transport or device error occurred
    fn on_error(&self, _error: &SessionError) -> CallbackResult {
        Ok(())
    }

    /// Informational agent status (thinking, speaking, listening, interrupted)
    fn on_status(&self, _status: AgentStatus) -> CallbackResult {
        Ok(())
    }
}

/// Observer that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl SessionObserver for NoopObserver {}

type TextHandler = Box<dyn Fn(&str) + Send + Sync>;
type ErrorHandler = Box<dyn Fn(&SessionError) + Send + Sync>;
type StatusHandler = Box<dyn Fn(AgentStatus) + Send + Sync>;

/// Closure-based observer with optional handler slots
///
/// ```no_run
/// use lokutor_voice::session::Callbacks;
///
/// let callbacks = Callbacks::new()
///     .on_transcription(|text| println!("You: {text}"))
///     .on_response(|text| println!("Agent: {text}"));
/// ```
#[derive(Default)]
pub struct Callbacks {
    transcription: Option<TextHandler>,
    response: Option<TextHandler>,
    error: Option<ErrorHandler>,
    status: Option<StatusHandler>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_transcription(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.transcription = Some(Box::new(f));
        self
    }

    pub fn on_response(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.response = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&SessionError) + Send + Sync + 'static) -> Self {
        self.error = Some(Box::new(f));
        self
    }

    pub fn on_status(mut self, f: impl Fn(AgentStatus) + Send + Sync + 'static) -> Self {
        self.status = Some(Box::new(f));
        self
    }
}

impl SessionObserver for Callbacks {
    fn on_transcription(&self, text: &str) -> CallbackResult {
        if let Some(f) = &self.transcription {
            f(text);
        }
        Ok(())
    }

    fn on_response(&self, text: &str) -> CallbackResult {
        if let Some(f) = &self.response {
            f(text);
        }
        Ok(())
    }

    fn on_error(&self, error: &SessionError) -> CallbackResult {
        if let Some(f) = &self.error {
            f(error);
        }
        Ok(())
    }

    fn on_status(&self, status: AgentStatus) -> CallbackResult {
        if let Some(f) = &self.status {
            f(status);
        }
        Ok(())
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Run an observer hook, converting a returned error or a panic into
/// `SessionError::Callback`
pub fn isolate(hook: &str, f: impl FnOnce() -> CallbackResult) -> Result<()> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            warn!("{} callback failed: {:#}", hook, e);
            Err(SessionError::Callback(format!("{hook}: {e:#}")))
        }
        Err(payload) => {
            let msg = panic_message(payload.as_ref());
            error!("{} callback panicked: {}", hook, msg);
            Err(SessionError::Callback(format!("{hook} panicked: {msg}")))
        }
    }
}
