//! Error types for voice sessions and synthesis.

use std::time::Duration;

/// Errors surfaced by the session runtime.
///
/// Parse and callback failures are recovered where they happen and only
/// logged. Server-reported errors are surfaced but do not end the session.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    /// The channel handshake did not complete within the connect timeout.
    #[error("connection timeout after {}s", .0.as_secs_f32())]
    ConnectTimeout(Duration),

    /// Send/receive failure on the channel, or the channel is not open.
    #[error("transport error: {0}")]
    Transport(String),

    /// Error reported by the service in an `error` message.
    #[error("server error: {0}")]
    Server(String),

    /// Malformed inbound structured message.
    #[error("protocol parse error: {0}")]
    ProtocolParse(String),

    /// Audio hardware failure.
    #[error("audio device error: {0}")]
    Device(String),

    /// An observer callback failed or panicked.
    #[error("callback error: {0}")]
    Callback(String),

    /// Operation is not permitted in the current session state.
    #[error("invalid session state: {0}")]
    InvalidState(String),

    /// Invalid configuration value.
    #[error("config error: {0}")]
    Config(String),
}

impl SessionError {
    /// Whether this error ends the operation that raised it.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::Server(_) | Self::ProtocolParse(_) | Self::Callback(_)
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SessionError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        SessionError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        SessionError::ProtocolParse(err.to_string())
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, SessionError>;
