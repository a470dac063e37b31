pub mod audio;
pub mod config;
pub mod error;
pub mod session;
pub mod synthesis;
pub mod transport;

pub use audio::{
    AudioBackendConfig, AudioDevice, AudioDeviceFactory, AudioFrame, AudioInput, AudioOutput,
    PlaybackQueue,
};
pub use config::Config;
pub use error::{Result, SessionError};
pub use session::{
    simple_conversation, Callbacks, Language, SessionConfig, SessionObserver, SessionState,
    SessionStats, VoiceSession, VoiceStyle,
};
pub use synthesis::{simple_tts, SynthesisOptions, SynthesisReport, TtsClient};
pub use transport::{AgentStatus, WsTransport};
