use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;

use crate::audio::AudioBackendConfig;
use crate::session::{
    Language, SessionConfig, VoiceStyle, DEFAULT_TTS_URL, DEFAULT_VOICE_AGENT_URL,
};
use crate::synthesis::{SynthesisOptions, TtsClient};

/// Environment variable prefix, e.g. `LOKUTOR__SERVICE__API_KEY`
pub const ENV_PREFIX: &str = "LOKUTOR";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub service: ServiceConfig,
    pub agent: AgentConfig,
    pub audio: AudioConfig,
    pub tts: TtsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub agent_url: String,
    pub tts_url: String,
    #[serde(default)]
    pub api_key: String,
    pub connect_timeout_secs: u64,
    pub response_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub prompt: String,
    pub voice: VoiceStyle,
    pub language: Language,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AudioConfig {
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub channels: u16,
    pub frame_duration_ms: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TtsConfig {
    pub speed: f32,
    pub steps: u32,
    pub visemes: bool,
}

impl Default for Config {
    fn default() -> Self {
        let audio = AudioBackendConfig::default();
        Self {
            service: ServiceConfig {
                agent_url: DEFAULT_VOICE_AGENT_URL.to_string(),
                tts_url: DEFAULT_TTS_URL.to_string(),
                api_key: String::new(),
                connect_timeout_secs: 10,
                response_timeout_secs: 30,
            },
            agent: AgentConfig {
                prompt: "You are a helpful AI assistant".to_string(),
                voice: VoiceStyle::default(),
                language: Language::default(),
            },
            audio: AudioConfig {
                input_sample_rate: audio.input_sample_rate,
                output_sample_rate: audio.output_sample_rate,
                channels: audio.channels,
                frame_duration_ms: audio.frame_duration_ms,
            },
            tts: TtsConfig {
                speed: 1.05,
                steps: 24,
                visemes: false,
            },
        }
    }
}

impl Config {
    /// Load configuration from built-in defaults, an optional file, then
    /// `LOKUTOR__*` environment variables
    pub fn load(path: Option<&str>) -> Result<Self> {
        let defaults = Config::default();

        let mut builder = config::Config::builder()
            .set_default("service.agent_url", defaults.service.agent_url)?
            .set_default("service.tts_url", defaults.service.tts_url)?
            .set_default("service.api_key", defaults.service.api_key)?
            .set_default("service.connect_timeout_secs", defaults.service.connect_timeout_secs)?
            .set_default("service.response_timeout_secs", defaults.service.response_timeout_secs)?
            .set_default("agent.prompt", defaults.agent.prompt)?
            .set_default("agent.voice", defaults.agent.voice.code())?
            .set_default("agent.language", defaults.agent.language.code())?
            .set_default("audio.input_sample_rate", defaults.audio.input_sample_rate)?
            .set_default("audio.output_sample_rate", defaults.audio.output_sample_rate)?
            .set_default("audio.channels", defaults.audio.channels)?
            .set_default("audio.frame_duration_ms", defaults.audio.frame_duration_ms)?
            .set_default("tts.speed", defaults.tts.speed as f64)?
            .set_default("tts.steps", defaults.tts.steps)?
            .set_default("tts.visemes", defaults.tts.visemes)?;

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: Config = settings
            .try_deserialize()
            .context("Failed to parse configuration")?;

        config.audio_config().validate()?;

        Ok(config)
    }

    pub fn audio_config(&self) -> AudioBackendConfig {
        AudioBackendConfig {
            input_sample_rate: self.audio.input_sample_rate,
            output_sample_rate: self.audio.output_sample_rate,
            channels: self.audio.channels,
            frame_duration_ms: self.audio.frame_duration_ms,
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::new(&self.service.api_key, &self.agent.prompt)
            .with_voice(self.agent.voice)
            .with_language(self.agent.language)
            .with_server_url(&self.service.agent_url)
            .with_connect_timeout(Duration::from_secs(self.service.connect_timeout_secs))
            .with_audio(self.audio_config())
    }

    pub fn tts_client(&self) -> TtsClient {
        TtsClient::new(&self.service.api_key)
            .with_url(&self.service.tts_url)
            .with_connect_timeout(Duration::from_secs(self.service.connect_timeout_secs))
            .with_response_timeout(Duration::from_secs(self.service.response_timeout_secs))
            .with_audio(self.audio_config())
    }

    /// Synthesis options for `text` using the configured voice and tuning
    pub fn synthesis_options(&self, text: impl Into<String>) -> SynthesisOptions {
        SynthesisOptions::new(text)
            .with_voice(self.agent.voice)
            .with_language(self.agent.language)
            .with_speed(self.tts.speed)
            .with_steps(self.tts.steps)
            .with_visemes(self.tts.visemes)
    }
}
