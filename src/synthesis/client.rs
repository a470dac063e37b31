//! One-shot text-to-speech over the TTS endpoint.
//!
//! A reduced session: the channel is opened without the configuration
//! handshake, exactly one [`SynthesisRequest`] is sent, and the audio that
//! streams back is either played through the playback queue or collected for
//! the caller.

use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::audio::{spawn_playback, AudioBackendConfig, AudioDevice, AudioFrame, PlaybackQueue};
use crate::error::{Result, SessionError};
use crate::session::{
    isolate, Language, VoiceStyle, DEFAULT_CONNECT_TIMEOUT, DEFAULT_TTS_URL,
};
use crate::transport::{InboundUnit, SynthesisRequest, TransportEvent, WsTransport};

/// How long to wait for the first audio frame
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Time left for the device to play out what it has buffered once the queue
/// drains, and for the peer to acknowledge our close
pub const DRAIN_GRACE: Duration = Duration::from_millis(500);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Receives viseme/timing metadata (JSON arrays) sent alongside the audio
pub type MetadataHandler = Arc<dyn Fn(&Value) + Send + Sync>;

/// What to synthesize and how
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisOptions {
    pub text: String,
    pub voice: VoiceStyle,
    pub language: Language,
    pub speed: f32,
    /// Inference steps (quality)
    pub steps: u32,
    /// Ask the service for viseme metadata
    pub visemes: bool,
    /// Play through the output device; otherwise audio is returned
    pub play: bool,
}

impl SynthesisOptions {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            voice: VoiceStyle::default(),
            language: Language::default(),
            speed: 1.05,
            steps: 24,
            visemes: false,
            play: true,
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

    pub fn with_speed(mut self, speed: f32) -> Self {
        self.speed = speed;
        self
    }

    pub fn with_steps(mut self, steps: u32) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_visemes(mut self, visemes: bool) -> Self {
        self.visemes = visemes;
        self
    }

    pub fn with_play(mut self, play: bool) -> Self {
        self.play = play;
        self
    }

    /// The wire request for these options
    pub fn request(&self) -> SynthesisRequest {
        SynthesisRequest {
            text: self.text.clone(),
            voice: self.voice,
            lang: self.language,
            speed: self.speed,
            steps: self.steps,
            visemes: self.visemes,
        }
    }
}

/// Result of a finished synthesis
#[derive(Debug, Clone, Default)]
pub struct SynthesisReport {
    /// Received audio, in arrival order (empty when it was played)
    pub frames: Vec<AudioFrame>,
    /// Audio frames received from the service
    pub frames_received: usize,
    /// Frames written to the output device
    pub frames_played: usize,
    /// Metadata messages forwarded to the handler
    pub metadata_messages: usize,
}

/// What the receive task hands back when the stream ends
#[derive(Debug, Default)]
struct Received {
    frames: Vec<AudioFrame>,
    metadata_messages: usize,
}

/// Client for the standalone text-to-speech endpoint
#[derive(Debug, Clone)]
pub struct TtsClient {
    api_key: String,
    url: String,
    connect_timeout: Duration,
    response_timeout: Duration,
    audio: AudioBackendConfig,
}

impl TtsClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            url: DEFAULT_TTS_URL.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            audio: AudioBackendConfig::default(),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_audio(mut self, audio: AudioBackendConfig) -> Self {
        self.audio = audio;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Synthesize `options.text` and wait until it has been played (or fully
    /// received, when `play` is off)
    pub async fn synthesize(
        &self,
        options: &SynthesisOptions,
        device: Arc<dyn AudioDevice>,
        on_metadata: Option<MetadataHandler>,
    ) -> Result<SynthesisReport> {
        self.start(options, device, on_metadata).await?.wait().await
    }

    /// Start a synthesis without waiting for it
    pub async fn start(
        &self,
        options: &SynthesisOptions,
        device: Arc<dyn AudioDevice>,
        on_metadata: Option<MetadataHandler>,
    ) -> Result<SynthesisHandle> {
        let output = if options.play {
            Some(device.open_output(&self.audio)?)
        } else {
            None
        };

        let credential = Some(self.api_key.as_str()).filter(|k| !k.is_empty());
        let opened = WsTransport::open(&self.url, credential, self.connect_timeout).await;
        let (transport, events) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                if let Some(mut output) = output {
                    let _ = output.close();
                }
                return Err(e);
            }
        };
        let transport = Arc::new(transport);

        if let Err(e) = transport.send_structured(&options.request()) {
            transport.shutdown(DRAIN_GRACE).await;
            if let Some(mut output) = output {
                let _ = output.close();
            }
            return Err(e);
        }

        info!(
            "Synthesizing {} chars (voice={}, language={})",
            options.text.len(),
            options.voice,
            options.language
        );

        let queue = Arc::new(PlaybackQueue::new());
        let stop = Arc::new(AtomicBool::new(false));
        let received = Arc::new(AtomicUsize::new(0));
        let (first_audio_tx, first_audio) = watch::channel(false);

        let playback = output.map(|output| spawn_playback(Arc::clone(&queue), output, Arc::clone(&stop)));

        let receiver = tokio::spawn(receive_stream(
            events,
            options.play.then(|| Arc::clone(&queue)),
            Arc::clone(&received),
            first_audio_tx,
            on_metadata,
        ));

        Ok(SynthesisHandle {
            transport,
            queue,
            stop,
            received,
            first_audio,
            response_timeout: self.response_timeout,
            receiver: Some(receiver),
            playback,
        })
    }
}

/// Route the synthesis stream until the channel ends
///
/// Audio goes to `queue` when playing, otherwise it is collected.
async fn receive_stream(
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    queue: Option<Arc<PlaybackQueue>>,
    received: Arc<AtomicUsize>,
    first_audio: watch::Sender<bool>,
    on_metadata: Option<MetadataHandler>,
) -> Result<Received> {
    let mut out = Received::default();

    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Inbound(InboundUnit::Binary(pcm)) => {
                if pcm.is_empty() {
                    continue;
                }
                let frame = AudioFrame::new(pcm);
                match &queue {
                    Some(queue) => queue.enqueue(frame),
                    None => out.frames.push(frame),
                }
                received.fetch_add(1, Ordering::SeqCst);
                first_audio.send_replace(true);
            }
            TransportEvent::Inbound(InboundUnit::Text(text)) => {
                match serde_json::from_str::<Value>(&text) {
                    Ok(value @ Value::Array(_)) => {
                        out.metadata_messages += 1;
                        if let Some(handler) = &on_metadata {
                            let _ = isolate("metadata", || {
                                handler(&value);
                                Ok(())
                            });
                        }
                    }
                    _ => debug!("TTS server message: {}", text),
                }
            }
            TransportEvent::Closed => break,
            TransportEvent::Error(e) => {
                error!("TTS transport error: {}", e);
                return Err(e);
            }
        }
    }

    Ok(out)
}

/// A synthesis in progress
pub struct SynthesisHandle {
    transport: Arc<WsTransport>,
    queue: Arc<PlaybackQueue>,
    stop: Arc<AtomicBool>,
    received: Arc<AtomicUsize>,
    first_audio: watch::Receiver<bool>,
    response_timeout: Duration,
    receiver: Option<JoinHandle<Result<Received>>>,
    playback: Option<JoinHandle<Result<usize>>>,
}

impl SynthesisHandle {
    /// Frames received so far
    pub fn frames_received(&self) -> usize {
        self.received.load(Ordering::SeqCst)
    }

    /// Wait for the audio to finish, then release the device and close the
    /// channel
    ///
    /// The stream is complete once the server closes the channel. A server
    /// that goes quiet for a whole response timeout after the first frame is
    /// treated as done. Fails if no audio arrives within the response timeout.
    pub async fn wait(mut self) -> Result<SynthesisReport> {
        let mut first_audio = self.first_audio.clone();
        let got_audio = tokio::time::timeout(self.response_timeout, first_audio.wait_for(|got| *got))
            .await
            .map(|waited| waited.is_ok());

        if got_audio.is_err() {
            warn!(
                "No audio received within {}s",
                self.response_timeout.as_secs()
            );
            let _ = self.release().await;
            return Err(SessionError::Transport(format!(
                "no audio received within {}s",
                self.response_timeout.as_secs()
            )));
        }

        self.wait_for_drain().await;
        self.release().await
    }

    /// Stop right away, discarding anything not yet played
    pub async fn close(mut self) {
        let dropped = self.queue.flush();
        debug!("Closing synthesis ({} frames discarded)", dropped);
        let _ = self.release().await;
    }

    async fn wait_for_drain(&self) {
        let playing = self.playback.is_some();
        let mut last_count = self.frames_received();
        let mut idle_since = Instant::now();

        loop {
            let count = self.frames_received();
            if count != last_count {
                last_count = count;
                idle_since = Instant::now();
            }

            let finished = self.receiver.as_ref().map_or(true, |r| r.is_finished());
            let stalled = idle_since.elapsed() >= self.response_timeout;
            let playback_stopped = self.playback.as_ref().map_or(false, |p| p.is_finished());
            let drained = !playing || self.queue.is_drained();

            if playback_stopped || (drained && (finished || stalled)) {
                if stalled && !finished {
                    warn!(
                        "No audio for {}s; ending synthesis",
                        self.response_timeout.as_secs()
                    );
                }
                break;
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }

        if playing {
            // Let the device play out what it has buffered.
            tokio::time::sleep(DRAIN_GRACE).await;
        }
    }

    async fn release(&mut self) -> Result<SynthesisReport> {
        self.stop.store(true, Ordering::SeqCst);
        self.transport.shutdown(DRAIN_GRACE).await;

        let received = match self.receiver.take() {
            Some(handle) => match handle.await {
                Ok(result) => result,
                Err(e) => Err(SessionError::Transport(format!("receive task failed: {e}"))),
            },
            None => Ok(Received::default()),
        };

        let played = match self.playback.take() {
            Some(handle) => match handle.await {
                Ok(result) => result,
                Err(e) => Err(SessionError::Device(format!("playback worker failed: {e}"))),
            },
            None => Ok(0),
        };

        let received = received?;
        let frames_played = played?;
        let report = SynthesisReport {
            frames: received.frames,
            frames_received: self.frames_received(),
            frames_played,
            metadata_messages: received.metadata_messages,
        };

        info!(
            "Synthesis finished ({} frames received, {} played)",
            report.frames_received, report.frames_played
        );

        Ok(report)
    }
}

impl Drop for SynthesisHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.transport.close();
        if let Some(receiver) = self.receiver.take() {
            receiver.abort();
        }
    }
}

/// Quick way to speak a piece of text without manual setup
pub async fn simple_tts(
    text: &str,
    api_key: &str,
    voice: VoiceStyle,
    language: Language,
    play: bool,
    url: &str,
    device: Arc<dyn AudioDevice>,
) -> Result<SynthesisReport> {
    let options = SynthesisOptions::new(text)
        .with_voice(voice)
        .with_language(language)
        .with_play(play);

    TtsClient::new(api_key)
        .with_url(url)
        .synthesize(&options, device, None)
        .await
}
