use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::backend::{AudioFrame, AudioInput};
use crate::error::{Result, SessionError};

/// Interval between "frames sent" diagnostic pulses
pub const PULSE_INTERVAL: Duration = Duration::from_secs(2);

/// Destination for captured frames (the transport, in a live session)
pub trait FrameSink: Send + Sync {
    fn is_open(&self) -> bool;

    fn send_frame(&self, frame: AudioFrame) -> Result<()>;
}

/// Why the capture loop ended
#[derive(Debug, Clone)]
pub enum CaptureExit {
    /// Stop flag observed
    Stopped,
    /// Transport no longer open
    TransportClosed,
    /// Sending a frame failed
    SendFailed(SessionError),
    /// Reading from the input device failed
    DeviceFailed(SessionError),
}

impl CaptureExit {
    /// The error to surface to the session owner, if any
    pub fn error(&self) -> Option<SessionError> {
        match self {
            CaptureExit::Stopped => None,
            CaptureExit::TransportClosed => Some(SessionError::Transport(
                "connection lost while streaming".into(),
            )),
            CaptureExit::SendFailed(e) | CaptureExit::DeviceFailed(e) => Some(e.clone()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CaptureReport {
    pub frames_sent: usize,
    pub frames_dropped: usize,
    pub exit: CaptureExit,
}

/// Reads fixed-duration frames from the microphone and forwards them to a sink
pub struct CapturePipeline {
    input: Box<dyn AudioInput>,
    sink: Arc<dyn FrameSink>,
    stop: Arc<AtomicBool>,
    frames_sent: Arc<AtomicUsize>,
    pulse_interval: Duration,
}

impl CapturePipeline {
    pub fn new(input: Box<dyn AudioInput>, sink: Arc<dyn FrameSink>, stop: Arc<AtomicBool>) -> Self {
        Self {
            input,
            sink,
            stop,
            frames_sent: Arc::new(AtomicUsize::new(0)),
            pulse_interval: PULSE_INTERVAL,
        }
    }

    /// Share the sent-frames counter with session statistics
    pub fn with_counter(mut self, frames_sent: Arc<AtomicUsize>) -> Self {
        self.frames_sent = frames_sent;
        self
    }

    /// Run until the stop flag is set or the transport goes away
    ///
    /// The input device is closed on every exit path.
    pub fn run(mut self) -> CaptureReport {
        info!("Capture pipeline started");

        let mut sent = 0usize;
        let mut dropped = 0usize;
        let mut last_pulse = Instant::now();

        let exit = loop {
            if self.stop.load(Ordering::SeqCst) {
                break CaptureExit::Stopped;
            }

            let frame = match self.input.read_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    dropped += 1;
                    continue;
                }
                Err(e) => {
                    error!("Failed to read audio frame: {}", e);
                    break CaptureExit::DeviceFailed(e);
                }
            };

            if !self.sink.is_open() {
                warn!("Transport lost - ending capture loop");
                break CaptureExit::TransportClosed;
            }

            if frame.is_empty() {
                continue;
            }

            if let Err(e) = self.sink.send_frame(frame) {
                error!("Error sending audio: {}", e);
                break CaptureExit::SendFailed(e);
            }

            sent += 1;
            self.frames_sent.fetch_add(1, Ordering::SeqCst);

            if last_pulse.elapsed() >= self.pulse_interval {
                debug!("Streaming pulse: sent {} frames", sent);
                last_pulse = Instant::now();
            }
        };

        if let Err(e) = self.input.close() {
            error!("Failed to close input device: {}", e);
        }

        info!(
            "Capture pipeline stopped ({} frames sent, {} dropped)",
            sent, dropped
        );

        CaptureReport {
            frames_sent: sent,
            frames_dropped: dropped,
            exit,
        }
    }

    /// Start the loop on the blocking thread pool
    pub fn spawn(self) -> JoinHandle<CaptureReport> {
        tokio::task::spawn_blocking(move || self.run())
    }
}
