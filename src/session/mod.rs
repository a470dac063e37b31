//! Voice session management
//!
//! This module provides the `VoiceSession` abstraction that manages:
//! - Connection lifecycle and the initial configuration handshake
//! - Microphone capture and agent audio playback
//! - Routing of transcripts, status and errors to an observer
//! - Session statistics and state management

mod config;
mod dispatcher;
mod observer;
mod session;
mod state;
mod stats;

pub use config::{
    Language, SessionConfig, VoiceStyle, DEFAULT_CONNECT_TIMEOUT, DEFAULT_TTS_URL,
    DEFAULT_VOICE_AGENT_URL,
};
pub use dispatcher::{ControlDispatcher, Dispatched};
pub use observer::{isolate, CallbackResult, Callbacks, NoopObserver, SessionObserver};
pub use session::{simple_conversation, VoiceSession};
pub use state::{SessionState, StateMachine};
pub use stats::{SessionCounters, SessionStats};
