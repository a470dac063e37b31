use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::state::SessionState;

/// Statistics about a voice session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStats {
    /// Session identifier
    pub session_id: String,

    /// Current lifecycle state
    pub state: SessionState,

    /// When the session was created
    pub started_at: DateTime<Utc>,

    /// Session age in seconds
    pub duration_secs: f64,

    /// Microphone frames sent to the service
    pub frames_sent: usize,

    /// Audio frames received for playback (binary and legacy JSON)
    pub frames_received: usize,

    /// Frames discarded by interruptions
    pub frames_flushed: usize,

    /// Transcript messages received (user and agent)
    pub transcripts: usize,

    /// Interruption signals received
    pub interruptions: usize,

    /// Error messages received from the service
    pub server_errors: usize,

    /// Inbound messages dropped as malformed or unknown
    pub malformed_messages: usize,
}

/// Live counters shared between the dispatcher and the capture pipeline
#[derive(Debug, Default)]
pub struct SessionCounters {
    pub frames_sent: Arc<AtomicUsize>,
    pub frames_received: AtomicUsize,
    pub frames_flushed: AtomicUsize,
    pub transcripts: AtomicUsize,
    pub interruptions: AtomicUsize,
    pub server_errors: AtomicUsize,
    pub malformed_messages: AtomicUsize,
}

impl SessionCounters {
    pub fn snapshot(
        &self,
        session_id: &str,
        state: SessionState,
        started_at: DateTime<Utc>,
    ) -> SessionStats {
        let duration = Utc::now().signed_duration_since(started_at);

        SessionStats {
            session_id: session_id.to_string(),
            state,
            started_at,
            duration_secs: duration.num_milliseconds() as f64 / 1000.0,
            frames_sent: self.frames_sent.load(Ordering::SeqCst),
            frames_received: self.frames_received.load(Ordering::SeqCst),
            frames_flushed: self.frames_flushed.load(Ordering::SeqCst),
            transcripts: self.transcripts.load(Ordering::SeqCst),
            interruptions: self.interruptions.load(Ordering::SeqCst),
            server_errors: self.server_errors.load(Ordering::SeqCst),
            malformed_messages: self.malformed_messages.load(Ordering::SeqCst),
        }
    }
}
