use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;
use tracing::debug;

use crate::error::{Result, SessionError};

/// Lifecycle of a voice session
///
/// ```text
/// Disconnected -> Connecting -> Connected -> Streaming -> Closing -> Disconnected
///                     |             |            |
///                     +-------------+------------+--> Failed -> Disconnected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Streaming,
    Closing,
    Failed,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;

        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Failed)
                | (Connecting, Closing)
                | (Connected, Streaming)
                | (Connected, Failed)
                | (Connected, Closing)
                | (Streaming, Connected)
                | (Streaming, Failed)
                | (Streaming, Closing)
                | (Failed, Closing)
                | (Failed, Disconnected)
                | (Closing, Disconnected)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Streaming => "streaming",
            SessionState::Closing => "closing",
            SessionState::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared, observable session state with validated transitions
pub struct StateMachine {
    tx: watch::Sender<SessionState>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SessionState::Disconnected);
        Self { tx }
    }

    pub fn current(&self) -> SessionState {
        *self.tx.borrow()
    }

    /// Receiver that wakes on every state change
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }

    /// Move to `next`, returning the previous state
    pub fn transition(&self, next: SessionState) -> Result<SessionState> {
        let mut previous = None;
        let mut rejected = None;

        self.tx.send_if_modified(|state| {
            if state.can_transition_to(next) {
                previous = Some(*state);
                *state = next;
                true
            } else {
                rejected = Some(*state);
                false
            }
        });

        match previous {
            Some(prev) => {
                debug!("Session state: {} -> {}", prev, next);
                Ok(prev)
            }
            None => Err(SessionError::InvalidState(format!(
                "cannot move from {} to {}",
                rejected.unwrap_or(next),
                next
            ))),
        }
    }

    /// Move to `next` only if the current state is one of `from`
    pub fn transition_from(&self, from: &[SessionState], next: SessionState) -> bool {
        let mut moved = None;

        self.tx.send_if_modified(|state| {
            if from.contains(state) && state.can_transition_to(next) {
                moved = Some(*state);
                *state = next;
                true
            } else {
                false
            }
        });

        if let Some(prev) = moved {
            debug!("Session state: {} -> {}", prev, next);
        }
        moved.is_some()
    }
}
