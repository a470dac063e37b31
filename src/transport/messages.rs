use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Result, SessionError};
use crate::session::{Language, SessionConfig, VoiceStyle};

/// Configuration message sent once at session start
///
/// Serialized as `{"type": "prompt", "data": "..."}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum ConfigMessage {
    Prompt(String),
    Voice(VoiceStyle),
    Language(Language),
}

impl ConfigMessage {
    /// The initial configuration messages, in the order the service expects
    pub fn handshake(config: &SessionConfig) -> [ConfigMessage; 3] {
        [
            ConfigMessage::Prompt(config.prompt.clone()),
            ConfigMessage::Voice(config.voice),
            ConfigMessage::Language(config.language),
        ]
    }
}

/// One-shot synthesis request for the TTS endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisRequest {
    pub text: String,
    pub voice: VoiceStyle,
    pub lang: Language,
    pub speed: f32,
    pub steps: u32,
    pub visemes: bool,
}

/// Who produced a transcript
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    User,
    #[serde(other)]
    Agent,
}

/// Agent status reported by the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// User barged in: pending agent audio must be discarded
    Interrupted,
    Thinking,
    Speaking,
    Listening,
    #[serde(other)]
    Unknown,
}

impl AgentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentStatus::Interrupted => "interrupted",
            AgentStatus::Thinking => "thinking",
            AgentStatus::Speaking => "speaking",
            AgentStatus::Listening => "listening",
            AgentStatus::Unknown => "unknown",
        }
    }
}

/// Structured message received from the voice agent
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Base64 PCM from older servers that did not send binary frames
    Audio { data: String },
    Transcript {
        #[serde(default, deserialize_with = "nullable_text")]
        data: String,
        /// Absent means the user; an explicit `null` is routed like any
        /// non-user role
        #[serde(default, deserialize_with = "nullable_role")]
        role: Role,
    },
    Status { data: AgentStatus },
    Error {
        #[serde(default)]
        data: serde_json::Value,
    },
}

impl ServerMessage {
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| SessionError::ProtocolParse(e.to_string()))
    }

    /// Kind name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Audio { .. } => "audio",
            ServerMessage::Transcript { .. } => "transcript",
            ServerMessage::Status { .. } => "status",
            ServerMessage::Error { .. } => "error",
        }
    }
}

fn nullable_text<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

fn nullable_role<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Role, D::Error> {
    Ok(Option::<Role>::deserialize(deserializer)?.unwrap_or(Role::Agent))
}

/// Decode a legacy base64 audio payload into PCM bytes
pub fn decode_legacy_audio(data: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(data.trim())
        .map_err(|e| SessionError::ProtocolParse(format!("invalid base64 audio: {e}")))
}

/// Render an error payload as text (strings are passed through unquoted)
pub fn error_text(data: &serde_json::Value) -> String {
    match data {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => "unknown server error".to_string(),
        other => other.to_string(),
    }
}

/// One unit received from the channel, in arrival order
#[derive(Debug, Clone, PartialEq)]
pub enum InboundUnit {
    /// Raw PCM for playback
    Binary(Vec<u8>),
    /// JSON control or metadata message
    Text(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_messages_use_type_and_data() {
        let json = serde_json::to_string(&ConfigMessage::Voice(VoiceStyle::M3)).unwrap();
        assert_eq!(json, r#"{"type":"voice","data":"M3"}"#);

        let json = serde_json::to_string(&ConfigMessage::Language(Language::Korean)).unwrap();
        assert_eq!(json, r#"{"type":"language","data":"ko"}"#);
    }

    #[test]
    fn transcript_role_defaults_to_user() {
        let msg = ServerMessage::parse(r#"{"type":"transcript","data":"hi"}"#).unwrap();
        assert_eq!(
            msg,
            ServerMessage::Transcript {
                data: "hi".into(),
                role: Role::User
            }
        );
    }

    #[test]
    fn unrecognised_role_is_agent() {
        let msg = ServerMessage::parse(r#"{"type":"transcript","data":"hi","role":"assistant"}"#)
            .unwrap();
        assert!(matches!(msg, ServerMessage::Transcript { role: Role::Agent, .. }));
    }

    #[test]
    fn null_role_is_agent() {
        let msg = ServerMessage::parse(r#"{"type":"transcript","data":"hi","role":null}"#).unwrap();
        assert!(matches!(msg, ServerMessage::Transcript { role: Role::Agent, .. }));
    }

    #[test]
    fn transcript_without_data_is_empty() {
        for text in [
            r#"{"type":"transcript","role":"user"}"#,
            r#"{"type":"transcript","data":null,"role":"user"}"#,
        ] {
            let msg = ServerMessage::parse(text).unwrap();
            assert_eq!(
                msg,
                ServerMessage::Transcript {
                    data: String::new(),
                    role: Role::User
                }
            );
        }
    }

    #[test]
    fn unknown_status_value_is_tolerated() {
        let msg = ServerMessage::parse(r#"{"type":"status","data":"dozing"}"#).unwrap();
        assert_eq!(msg, ServerMessage::Status { data: AgentStatus::Unknown });
    }

    #[test]
    fn unknown_kind_is_a_parse_error() {
        let err = ServerMessage::parse(r#"{"type":"telemetry","data":1}"#).unwrap_err();
        assert!(matches!(err, SessionError::ProtocolParse(_)));
    }

    #[test]
    fn error_payload_text() {
        assert_eq!(error_text(&serde_json::json!("quota exceeded")), "quota exceeded");
        assert_eq!(error_text(&serde_json::json!({"code": 4})), r#"{"code":4}"#);
    }

    #[test]
    fn legacy_audio_decodes() {
        assert_eq!(decode_legacy_audio("AAECAw==").unwrap(), vec![0, 1, 2, 3]);
        assert!(decode_legacy_audio("not base64!").is_err());
    }
}
