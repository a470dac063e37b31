// Inbound message routing
//
// Called once per inbound unit, in arrival order, from the session's dispatch
// loop. It never fails: malformed messages are logged and dropped, and
// observer failures are isolated.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::observer::{isolate, SessionObserver};
use super::stats::SessionCounters;
use crate::audio::{AudioFrame, PlaybackQueue};
use crate::error::SessionError;
use crate::transport::messages::{decode_legacy_audio, error_text};
use crate::transport::{AgentStatus, InboundUnit, Role, ServerMessage};

/// What a single dispatch did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
    /// Audio queued for playback
    Audio { bytes: usize },
    /// Transcript delivered to the observer for this role
    Transcript(Role),
    /// Playback queue flushed
    Interrupted { dropped: usize },
    /// Informational status
    Status(AgentStatus),
    /// Server error delivered to the observer
    ServerError(String),
    /// Malformed, unknown or empty unit
    Ignored,
}

/// Routes inbound units to the playback queue and the observer
pub struct ControlDispatcher {
    playback: Arc<PlaybackQueue>,
    observer: Arc<dyn SessionObserver>,
    counters: Arc<SessionCounters>,
}

impl ControlDispatcher {
    pub fn new(playback: Arc<PlaybackQueue>, observer: Arc<dyn SessionObserver>) -> Self {
        Self {
            playback,
            observer,
            counters: Arc::new(SessionCounters::default()),
        }
    }

    pub fn with_counters(mut self, counters: Arc<SessionCounters>) -> Self {
        self.counters = counters;
        self
    }

    pub fn dispatch(&self, unit: InboundUnit) -> Dispatched {
        match unit {
            InboundUnit::Binary(pcm) => self.enqueue(pcm),
            InboundUnit::Text(text) => self.dispatch_text(&text),
        }
    }

    fn enqueue(&self, pcm: Vec<u8>) -> Dispatched {
        if pcm.is_empty() {
            return Dispatched::Ignored;
        }

        let bytes = pcm.len();
        self.playback.enqueue(AudioFrame::new(pcm));
        self.counters.frames_received.fetch_add(1, Ordering::SeqCst);
        Dispatched::Audio { bytes }
    }

    fn dispatch_text(&self, text: &str) -> Dispatched {
        let message = match ServerMessage::parse(text) {
            Ok(m) => m,
            Err(e) => {
                warn!("Ignoring inbound message: {}", e);
                self.counters.malformed_messages.fetch_add(1, Ordering::SeqCst);
                return Dispatched::Ignored;
            }
        };

        debug!("Dispatching {} message", message.kind());

        match message {
            ServerMessage::Audio { data } => match decode_legacy_audio(&data) {
                Ok(pcm) => self.enqueue(pcm),
                Err(e) => {
                    warn!("Ignoring legacy audio message: {}", e);
                    self.counters.malformed_messages.fetch_add(1, Ordering::SeqCst);
                    Dispatched::Ignored
                }
            },

            ServerMessage::Transcript { data, role } => {
                self.counters.transcripts.fetch_add(1, Ordering::SeqCst);
                let observer = &self.observer;
                let _ = match role {
                    Role::User => {
                        info!("You: {}", data);
                        isolate("transcription", || observer.on_transcription(&data))
                    }
                    Role::Agent => {
                        info!("Agent: {}", data);
                        isolate("response", || observer.on_response(&data))
                    }
                };
                Dispatched::Transcript(role)
            }

            ServerMessage::Status { data: AgentStatus::Interrupted } => {
                let dropped = self.playback.flush();
                self.counters.interruptions.fetch_add(1, Ordering::SeqCst);
                self.counters.frames_flushed.fetch_add(dropped, Ordering::SeqCst);
                info!("Interrupted ({} queued frames dropped)", dropped);
                self.notify_status(AgentStatus::Interrupted);
                Dispatched::Interrupted { dropped }
            }

            ServerMessage::Status { data } => {
                match data {
                    AgentStatus::Thinking => info!("Thinking..."),
                    AgentStatus::Speaking => info!("Agent speaking..."),
                    AgentStatus::Listening => info!("Listening..."),
                    other => debug!("Agent status: {}", other.as_str()),
                }
                self.notify_status(data);
                Dispatched::Status(data)
            }

            ServerMessage::Error { data } => {
                let text = error_text(&data);
                error!("Server error: {}", text);
                self.counters.server_errors.fetch_add(1, Ordering::SeqCst);
                let err = SessionError::Server(text.clone());
                let _ = isolate("error", || self.observer.on_error(&err));
                Dispatched::ServerError(text)
            }
        }
    }

    fn notify_status(&self, status: AgentStatus) {
        let _ = isolate("status", || self.observer.on_status(status));
    }
}
