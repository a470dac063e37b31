use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::audio::AudioBackendConfig;
use crate::error::SessionError;

/// Default voice agent endpoint
pub const DEFAULT_VOICE_AGENT_URL: &str = "wss://api.lokutor.com/ws/agent";

/// Default standalone text-to-speech endpoint
pub const DEFAULT_TTS_URL: &str = "wss://api.lokutor.com/ws/tts";

/// Connect timeout used when none is configured
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Available voice styles (female and male voices)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum VoiceStyle {
    #[default]
    F1,
    F2,
    F3,
    F4,
    F5,
    M1,
    M2,
    M3,
    M4,
    M5,
}

impl VoiceStyle {
    pub const ALL: [VoiceStyle; 10] = [
        VoiceStyle::F1,
        VoiceStyle::F2,
        VoiceStyle::F3,
        VoiceStyle::F4,
        VoiceStyle::F5,
        VoiceStyle::M1,
        VoiceStyle::M2,
        VoiceStyle::M3,
        VoiceStyle::M4,
        VoiceStyle::M5,
    ];

    /// Wire code ("F1" ... "M5")
    pub fn code(self) -> &'static str {
        match self {
            VoiceStyle::F1 => "F1",
            VoiceStyle::F2 => "F2",
            VoiceStyle::F3 => "F3",
            VoiceStyle::F4 => "F4",
            VoiceStyle::F5 => "F5",
            VoiceStyle::M1 => "M1",
            VoiceStyle::M2 => "M2",
            VoiceStyle::M3 => "M3",
            VoiceStyle::M4 => "M4",
            VoiceStyle::M5 => "M5",
        }
    }
}

impl fmt::Display for VoiceStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for VoiceStyle {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        VoiceStyle::ALL
            .into_iter()
            .find(|v| v.code().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| SessionError::Config(format!("unknown voice style '{s}'")))
    }
}

/// Supported languages for speech and text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Language {
    #[default]
    #[serde(rename = "en")]
    English,
    #[serde(rename = "es")]
    Spanish,
    #[serde(rename = "fr")]
    French,
    #[serde(rename = "pt")]
    Portuguese,
    #[serde(rename = "ko")]
    Korean,
}

impl Language {
    pub const ALL: [Language; 5] = [
        Language::English,
        Language::Spanish,
        Language::French,
        Language::Portuguese,
        Language::Korean,
    ];

    /// ISO 639-1 code used on the wire
    pub fn code(self) -> &'static str {
        match self {
            Language::English => "en",
            Language::Spanish => "es",
            Language::French => "fr",
            Language::Portuguese => "pt",
            Language::Korean => "ko",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Language {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Language::ALL
            .into_iter()
            .find(|l| l.code().eq_ignore_ascii_case(s) || format!("{l:?}").eq_ignore_ascii_case(s))
            .ok_or_else(|| SessionError::Config(format!("unknown language '{s}'")))
    }
}

/// Configuration for a voice session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// System prompt for the agent
    pub prompt: String,

    /// Voice used for agent speech
    pub voice: VoiceStyle,

    /// Language for speech and text
    pub language: Language,

    /// Voice agent WebSocket URL
    pub server_url: String,

    /// API key sent as `X-API-Key` (omitted when empty)
    pub api_key: String,

    /// Bound on the channel handshake
    pub connect_timeout: Duration,

    /// Capture/playback formats
    pub audio: AudioBackendConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            prompt: "You are a helpful AI assistant".to_string(),
            voice: VoiceStyle::F1,
            language: Language::English,
            server_url: DEFAULT_VOICE_AGENT_URL.to_string(),
            api_key: String::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            audio: AudioBackendConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn new(api_key: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn with_voice(mut self, voice: VoiceStyle) -> Self {
        self.voice = voice;
        self
    }

    pub fn with_language(mut self, language: Language) -> Self {
        self.language = language;
        self
    }

    pub fn with_server_url(mut self, url: impl Into<String>) -> Self {
        self.server_url = url.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_audio(mut self, audio: AudioBackendConfig) -> Self {
        self.audio = audio;
        self
    }

    /// Credential to attach at channel open, if any
    pub fn credential(&self) -> Option<&str> {
        Some(self.api_key.as_str()).filter(|k| !k.is_empty())
    }
}
