// Shared test fixtures: an in-memory audio device and a loopback websocket
// server standing in for the voice service.

#![allow(dead_code)]

use anyhow::Result;
use futures::{SinkExt, StreamExt};
use lokutor_voice::audio::{AudioBackendConfig, AudioDevice, AudioFrame, AudioInput, AudioOutput};
use lokutor_voice::session::{CallbackResult, SessionObserver};
use lokutor_voice::transport::AgentStatus;
use lokutor_voice::SessionError;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

pub type ServerStream = WebSocketStream<TcpStream>;

/// Frame period used by the in-memory input
pub const MOCK_FRAME_PERIOD: Duration = Duration::from_millis(5);

/// In-memory microphone and speaker
///
/// The input yields the scripted frames first, then silence, one frame per
/// `MOCK_FRAME_PERIOD`. Everything written to the output is recorded.
#[derive(Default)]
pub struct MockDevice {
    script: Mutex<VecDeque<AudioFrame>>,
    pub written: Arc<Mutex<Vec<AudioFrame>>>,
    pub inputs_opened: AtomicUsize,
    pub inputs_closed: Arc<AtomicUsize>,
    pub outputs_opened: AtomicUsize,
    pub outputs_closed: Arc<AtomicUsize>,
    pub fail_output: bool,
    pub fail_writes: bool,
}

impl MockDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(frames: Vec<AudioFrame>) -> Self {
        Self {
            script: Mutex::new(frames.into()),
            ..Self::default()
        }
    }

    pub fn failing_output() -> Self {
        Self {
            fail_output: true,
            ..Self::default()
        }
    }

    /// Opens fine, but every write to the speaker fails
    pub fn failing_writes() -> Self {
        Self {
            fail_writes: true,
            ..Self::default()
        }
    }

    pub fn written(&self) -> Vec<AudioFrame> {
        self.written.lock().unwrap().clone()
    }
}

impl AudioDevice for MockDevice {
    fn open_input(
        &self,
        config: &AudioBackendConfig,
    ) -> lokutor_voice::Result<Box<dyn AudioInput>> {
        self.inputs_opened.fetch_add(1, Ordering::SeqCst);
        let script = std::mem::take(&mut *self.script.lock().unwrap());
        Ok(Box::new(MockInput {
            script,
            silence: vec![0u8; config.frame_bytes()],
            closed: Arc::clone(&self.inputs_closed),
            is_closed: false,
        }))
    }

    fn open_output(
        &self,
        _config: &AudioBackendConfig,
    ) -> lokutor_voice::Result<Box<dyn AudioOutput>> {
        if self.fail_output {
            return Err(SessionError::Device("speaker unplugged".into()));
        }
        self.outputs_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(RecordingOutput {
            written: Arc::clone(&self.written),
            closed: Arc::clone(&self.outputs_closed),
            is_closed: false,
            fail_writes: self.fail_writes,
        }))
    }

    fn name(&self) -> &str {
        "mock"
    }
}

struct MockInput {
    script: VecDeque<AudioFrame>,
    silence: Vec<u8>,
    closed: Arc<AtomicUsize>,
    is_closed: bool,
}

impl AudioInput for MockInput {
    fn read_frame(&mut self) -> lokutor_voice::Result<Option<AudioFrame>> {
        std::thread::sleep(MOCK_FRAME_PERIOD);
        Ok(Some(
            self.script
                .pop_front()
                .unwrap_or_else(|| AudioFrame::new(self.silence.clone())),
        ))
    }

    fn close(&mut self) -> lokutor_voice::Result<()> {
        if !self.is_closed {
            self.is_closed = true;
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Output that records every frame it is given
pub struct RecordingOutput {
    pub written: Arc<Mutex<Vec<AudioFrame>>>,
    pub closed: Arc<AtomicUsize>,
    is_closed: bool,
    fail_writes: bool,
}

impl RecordingOutput {
    pub fn new() -> Self {
        Self {
            written: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(AtomicUsize::new(0)),
            is_closed: false,
            fail_writes: false,
        }
    }
}

impl AudioOutput for RecordingOutput {
    fn write(&mut self, frame: &AudioFrame) -> lokutor_voice::Result<()> {
        if self.fail_writes {
            return Err(SessionError::Device("speaker stopped responding".into()));
        }
        self.written.lock().unwrap().push(frame.clone());
        Ok(())
    }

    fn close(&mut self) -> lokutor_voice::Result<()> {
        if !self.is_closed {
            self.is_closed = true;
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Observer that records every hook invocation
#[derive(Default)]
pub struct RecordingObserver {
    pub transcriptions: Mutex<Vec<String>>,
    pub responses: Mutex<Vec<String>>,
    pub errors: Mutex<Vec<SessionError>>,
    pub statuses: Mutex<Vec<AgentStatus>>,
}

impl RecordingObserver {
    pub fn transcriptions(&self) -> Vec<String> {
        self.transcriptions.lock().unwrap().clone()
    }

    pub fn responses(&self) -> Vec<String> {
        self.responses.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<SessionError> {
        self.errors.lock().unwrap().clone()
    }

    pub fn statuses(&self) -> Vec<AgentStatus> {
        self.statuses.lock().unwrap().clone()
    }
}

impl SessionObserver for RecordingObserver {
    fn on_transcription(&self, text: &str) -> CallbackResult {
        self.transcriptions.lock().unwrap().push(text.to_string());
        Ok(())
    }

    fn on_response(&self, text: &str) -> CallbackResult {
        self.responses.lock().unwrap().push(text.to_string());
        Ok(())
    }

    fn on_error(&self, error: &SessionError) -> CallbackResult {
        self.errors.lock().unwrap().push(error.clone());
        Ok(())
    }

    fn on_status(&self, status: AgentStatus) -> CallbackResult {
        self.statuses.lock().unwrap().push(status);
        Ok(())
    }
}

/// Accept a single websocket connection on a loopback port and hand it to
/// `handler` together with the `x-api-key` header, if any
///
/// Returns the `ws://` URL to connect to.
pub async fn serve_once<F, Fut>(handler: F) -> Result<String>
where
    F: FnOnce(ServerStream, Option<String>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };

        let mut api_key = None;
        let callback = |req: &Request, resp: Response| {
            api_key = req
                .headers()
                .get("x-api-key")
                .and_then(|v| v.to_str().ok())
                .map(String::from);
            Ok::<Response, ErrorResponse>(resp)
        };

        if let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await {
            handler(ws, api_key).await;
        }
    });

    Ok(format!("ws://{}", addr))
}

/// A port that accepts TCP connections but never answers the handshake
pub async fn silent_listener() -> Result<(String, tokio::task::JoinHandle<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    Ok((format!("ws://{}", addr), handle))
}

/// Next text message from the client, skipping binary audio
pub async fn next_text(ws: &mut ServerStream) -> Option<String> {
    while let Some(Ok(msg)) = ws.next().await {
        match msg {
            Message::Text(text) => return Some(text),
            Message::Close(_) => return None,
            _ => {}
        }
    }
    None
}

/// Read until the client closes, counting binary frames
pub async fn drain_client(ws: &mut ServerStream) -> usize {
    let mut binary = 0;
    while let Some(Ok(msg)) = ws.next().await {
        match msg {
            Message::Binary(_) => binary += 1,
            Message::Close(_) => break,
            _ => {}
        }
    }
    binary
}

pub async fn send_json(ws: &mut ServerStream, value: serde_json::Value) {
    let _ = ws.send(Message::Text(value.to_string())).await;
}

/// Poll `check` until it holds or `timeout` elapses
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
