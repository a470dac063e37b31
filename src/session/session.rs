use super::config::SessionConfig;
use super::dispatcher::ControlDispatcher;
use super::observer::{isolate, NoopObserver, SessionObserver};
use super::state::{SessionState, StateMachine};
use super::stats::{SessionCounters, SessionStats};
use crate::audio::{
    spawn_playback, AudioDevice, CaptureExit, CapturePipeline, CaptureReport, FrameSink,
    PlaybackQueue,
};
use crate::error::{Result, SessionError};
use crate::transport::{ConfigMessage, TransportEvent, WsTransport};
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long teardown waits for each worker before giving up on it
const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// How long disconnect waits for the peer to acknowledge the close
const CLOSE_GRACE: Duration = Duration::from_secs(1);

type Worker<T> = Shared<BoxFuture<'static, T>>;

/// Capture and playback units of the active conversation
///
/// Joins are shared futures so `start_conversation` and a concurrent
/// `disconnect` can both wait on them; each worker releases its own device
/// exactly once.
struct Workers {
    capture: Worker<CaptureReport>,
    playback: Worker<Result<usize>>,
}

/// State shared with the dispatch loop
struct SessionShared {
    state: StateMachine,
    observer: Arc<dyn SessionObserver>,
    stop: Arc<AtomicBool>,
    last_error: Mutex<Option<SessionError>>,
}

impl SessionShared {
    /// Move an active session to `Failed` and surface the error once
    ///
    /// Errors that arrive while the session is already closing or failed are
    /// only logged.
    fn fail(&self, err: SessionError) -> SessionError {
        use SessionState::*;

        self.stop.store(true, Ordering::SeqCst);

        if self
            .state
            .transition_from(&[Connecting, Connected, Streaming], Failed)
        {
            error!("Session failed: {}", err);
            self.set_last_error(Some(err.clone()));
            let _ = isolate("error", || self.observer.on_error(&err));
        } else {
            debug!("Ignoring error while {}: {}", self.state.current(), err);
        }

        err
    }

    /// Like `fail`, but a device error is still surfaced when a disconnect
    /// is already tearing the session down
    fn fail_device(&self, err: SessionError) -> SessionError {
        use SessionState::*;

        if matches!(err, SessionError::Device(_))
            && matches!(self.state.current(), Closing | Disconnected)
        {
            error!("Audio device failed while closing: {}", err);
            self.set_last_error(Some(err.clone()));
            let _ = isolate("error", || self.observer.on_error(&err));
            return err;
        }

        self.fail(err)
    }

    fn set_last_error(&self, err: Option<SessionError>) {
        match self.last_error.lock() {
            Ok(mut e) => *e = err,
            Err(p) => *p.into_inner() = err,
        }
    }

    fn last_error(&self) -> Option<SessionError> {
        match self.last_error.lock() {
            Ok(e) => e.clone(),
            Err(p) => p.into_inner().clone(),
        }
    }
}

/// A full-duplex voice conversation with the agent service
///
/// Owns the transport, the playback queue and the capture/playback workers.
/// Methods take `&self`, so an `Arc<VoiceSession>` can call `disconnect` from
/// another task while `start_conversation` is running.
pub struct VoiceSession {
    /// Opaque session identifier
    id: String,

    /// Session configuration
    config: SessionConfig,

    /// Microphone and speaker adapter
    device: Arc<dyn AudioDevice>,

    /// State, observer and stop flag shared with the dispatch loop
    shared: Arc<SessionShared>,

    /// Agent audio waiting to be played
    playback: Arc<PlaybackQueue>,

    /// Live counters for statistics
    counters: Arc<SessionCounters>,

    /// When the session was created
    started_at: DateTime<Utc>,

    /// Open channel, if connected
    transport: Mutex<Option<Arc<WsTransport>>>,

    /// Handle for the inbound dispatch task
    dispatch_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,

    /// Capture and playback workers, while streaming
    workers: Mutex<Option<Workers>>,
}

impl VoiceSession {
    /// Create a new session; nothing is opened until `connect`
    pub fn new(config: SessionConfig, device: Arc<dyn AudioDevice>) -> Self {
        let id = format!("session-{}", uuid::Uuid::new_v4());
        info!("Creating voice session: {} ({})", id, device.name());

        Self {
            id,
            config,
            device,
            shared: Arc::new(SessionShared {
                state: StateMachine::new(),
                observer: Arc::new(NoopObserver),
                stop: Arc::new(AtomicBool::new(false)),
                last_error: Mutex::new(None),
            }),
            playback: Arc::new(PlaybackQueue::new()),
            counters: Arc::new(SessionCounters::default()),
            started_at: Utc::now(),
            transport: Mutex::new(None),
            dispatch_task: tokio::sync::Mutex::new(None),
            workers: Mutex::new(None),
        }
    }

    /// Install the observer for transcripts, responses, errors and status
    pub fn with_observer(self, observer: impl SessionObserver + 'static) -> Self {
        self.with_shared_observer(Arc::new(observer))
    }

    pub fn with_shared_observer(mut self, observer: Arc<dyn SessionObserver>) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.observer = observer;
        }
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.shared.state.current()
    }

    /// Agent audio waiting to be played
    pub fn playback(&self) -> &Arc<PlaybackQueue> {
        &self.playback
    }

    /// The error that moved the session to `Failed`, if any
    pub fn last_error(&self) -> Option<SessionError> {
        self.shared.last_error()
    }

    /// Whether the transport is currently open
    pub fn is_connected(&self) -> bool {
        self.current_transport().map(|t| t.is_open()).unwrap_or(false)
    }

    /// Get current session statistics
    pub fn stats(&self) -> SessionStats {
        self.counters
            .snapshot(&self.id, self.state(), self.started_at)
    }

    fn current_transport(&self) -> Option<Arc<WsTransport>> {
        match self.transport.lock() {
            Ok(t) => t.clone(),
            Err(p) => p.into_inner().clone(),
        }
    }

    fn set_transport(&self, transport: Option<Arc<WsTransport>>) -> Option<Arc<WsTransport>> {
        match self.transport.lock() {
            Ok(mut t) => std::mem::replace(&mut *t, transport),
            Err(p) => std::mem::replace(&mut *p.into_inner(), transport),
        }
    }

    fn set_workers(&self, workers: Option<Workers>) -> Option<Workers> {
        match self.workers.lock() {
            Ok(mut w) => std::mem::replace(&mut *w, workers),
            Err(p) => std::mem::replace(&mut *p.into_inner(), workers),
        }
    }

    /// Connect to the voice agent and send the initial configuration
    ///
    /// Fails with `ConnectTimeout` if the channel does not open within the
    /// configured timeout. Prompt, voice and language are sent in that order.
    pub async fn connect(&self) -> Result<()> {
        match self.state() {
            SessionState::Connected | SessionState::Streaming => return Ok(()),
            SessionState::Failed => {
                return Err(SessionError::InvalidState(
                    "session failed; disconnect before connecting again".into(),
                ))
            }
            _ => {}
        }

        self.shared.state.transition(SessionState::Connecting)?;
        self.shared.set_last_error(None);

        let (transport, events) = match WsTransport::open(
            &self.config.server_url,
            self.config.credential(),
            self.config.connect_timeout,
        )
        .await
        {
            Ok(opened) => opened,
            Err(e) => return Err(self.abort_connect(e)),
        };
        let transport = Arc::new(transport);

        for message in ConfigMessage::handshake(&self.config) {
            if let Err(e) = transport.send_structured(&message) {
                error!("Error sending config: {}", e);
                transport.close();
                return Err(self.abort_connect(e));
            }
        }

        info!(
            "Configured: voice={}, language={}",
            self.config.voice, self.config.language
        );

        self.set_transport(Some(Arc::clone(&transport)));

        if !self
            .shared
            .state
            .transition_from(&[SessionState::Connecting], SessionState::Connected)
        {
            self.set_transport(None);
            transport.shutdown(CLOSE_GRACE).await;
            self.shared
                .state
                .transition_from(&[SessionState::Closing], SessionState::Disconnected);
            return Err(SessionError::InvalidState(
                "session closed while connecting".into(),
            ));
        }

        let dispatcher = ControlDispatcher::new(
            Arc::clone(&self.playback),
            Arc::clone(&self.shared.observer),
        )
        .with_counters(Arc::clone(&self.counters));
        let task = tokio::spawn(run_dispatch(events, dispatcher, Arc::clone(&self.shared)));
        *self.dispatch_task.lock().await = Some(task);

        info!("Connected to voice agent ({})", self.id);

        Ok(())
    }

    /// Fail a connect attempt, or finish a disconnect that raced it
    fn abort_connect(&self, err: SessionError) -> SessionError {
        let err = self.shared.fail(err);
        self.shared
            .state
            .transition_from(&[SessionState::Closing], SessionState::Disconnected);
        err
    }

    /// Start an interactive voice conversation
    ///
    /// Connects first if needed, opens the microphone and speakers, and runs
    /// capture and playback until `stop` or `disconnect` is called or the
    /// transport fails.
    pub async fn start_conversation(&self) -> Result<()> {
        if self.state() == SessionState::Disconnected {
            self.connect().await?;
        }

        if !self
            .shared
            .state
            .transition_from(&[SessionState::Connected], SessionState::Streaming)
        {
            return Err(SessionError::InvalidState(format!(
                "cannot start a conversation while {}",
                self.state()
            )));
        }

        self.shared.stop.store(false, Ordering::SeqCst);

        let Some(transport) = self.current_transport() else {
            self.shared
                .state
                .transition_from(&[SessionState::Streaming], SessionState::Connected);
            return Err(SessionError::InvalidState("no open transport".into()));
        };

        info!("Starting conversation... speak whenever you're ready");

        let workers = match self.spawn_workers(transport) {
            Ok(w) => w,
            Err(e) => {
                error!("Failed to open audio devices: {}", e);
                let _ = isolate("error", || self.shared.observer.on_error(&e));
                self.shared
                    .state
                    .transition_from(&[SessionState::Streaming], SessionState::Connected);
                return Err(e);
            }
        };

        let mut capture = workers.capture.clone();
        let mut playback = workers.playback.clone();
        self.set_workers(Some(workers));

        // A shared worker future must not be polled again once it has
        // resolved, so keep whichever result ended the loop.
        let mut report = None;
        let mut played = None;
        let mut state_rx = self.shared.state.subscribe();
        while *state_rx.borrow_and_update() == SessionState::Streaming {
            tokio::select! {
                finished = &mut capture => {
                    report = Some(finished);
                    break;
                }
                finished = &mut playback => {
                    played = Some(finished);
                    break;
                }
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.shared.stop.store(true, Ordering::SeqCst);
        let report = match report {
            Some(report) => report,
            None => capture.await,
        };
        let played = match played {
            Some(played) => played,
            None => playback.await,
        };
        self.set_workers(None);

        info!(
            "Conversation ended ({} frames sent, {} frames played)",
            report.frames_sent,
            played.as_ref().copied().unwrap_or_default()
        );

        let mut device_error = None;
        if let Some(e) = report.exit.error() {
            let e = self.shared.fail_device(e);
            if matches!(e, SessionError::Device(_)) {
                device_error = Some(e);
            }
        }
        if let Err(e) = played {
            let e = self.shared.fail_device(e);
            if device_error.is_none() {
                device_error = Some(e);
            }
        }

        if self.state() == SessionState::Failed {
            let dropped = self.playback.flush();
            if dropped > 0 {
                debug!("Discarded {} unplayed frames", dropped);
            }
        }

        match self.state() {
            SessionState::Streaming => {
                if transport_open(&self.current_transport()) {
                    self.shared
                        .state
                        .transition_from(&[SessionState::Streaming], SessionState::Connected);
                    Ok(())
                } else {
                    Err(self.shared.fail(SessionError::Transport(
                        "connection lost while streaming".into(),
                    )))
                }
            }
            SessionState::Failed => Err(self.last_error().unwrap_or_else(|| {
                SessionError::Transport("session failed while streaming".into())
            })),
            _ => match device_error {
                Some(e) => Err(e),
                None => Ok(()),
            },
        }
    }

    fn spawn_workers(&self, transport: Arc<WsTransport>) -> Result<Workers> {
        let input = self.device.open_input(&self.config.audio)?;
        let output = match self.device.open_output(&self.config.audio) {
            Ok(output) => output,
            Err(e) => {
                let mut input = input;
                let _ = input.close();
                return Err(e);
            }
        };

        let playback = spawn_playback(
            Arc::clone(&self.playback),
            output,
            Arc::clone(&self.shared.stop),
        )
        .map(|joined| match joined {
            Ok(result) => result,
            Err(e) => Err(SessionError::Device(format!("playback worker failed: {e}"))),
        })
        .boxed()
        .shared();

        let sink: Arc<dyn FrameSink> = transport;
        let capture = CapturePipeline::new(input, sink, Arc::clone(&self.shared.stop))
            .with_counter(Arc::clone(&self.counters.frames_sent))
            .spawn()
            .map(|joined| match joined {
                Ok(report) => report,
                Err(e) => CaptureReport {
                    frames_sent: 0,
                    frames_dropped: 0,
                    exit: CaptureExit::DeviceFailed(SessionError::Device(format!(
                        "capture worker failed: {e}"
                    ))),
                },
            })
            .boxed()
            .shared();

        Ok(Workers { capture, playback })
    }

    /// End the current conversation but keep the connection open
    pub fn stop(&self) {
        if !self.shared.stop.swap(true, Ordering::SeqCst) {
            info!("Stop requested for {}", self.id);
        }
    }

    /// Disconnect from the server and release every resource
    ///
    /// Safe to call from any state, concurrently with `start_conversation`,
    /// and more than once.
    pub async fn disconnect(&self) {
        use SessionState::*;

        self.shared.stop.store(true, Ordering::SeqCst);

        let transport = self.set_transport(None);
        let workers = self.set_workers(None);
        let dispatch = self.dispatch_task.lock().await.take();

        if transport.is_none() && workers.is_none() && dispatch.is_none() {
            if self.shared.state.transition_from(&[Connecting], Closing) {
                debug!("Disconnect requested while connecting");
                return;
            }
            if self.shared.state.transition_from(&[Failed], Closing) {
                self.shared.state.transition_from(&[Closing], Disconnected);
            }
            debug!("Session {} already disconnected", self.id);
            return;
        }

        self.shared
            .state
            .transition_from(&[Connecting, Connected, Streaming, Failed], Closing);

        if let Some(transport) = transport {
            transport.shutdown(CLOSE_GRACE).await;
        }

        if let Some(workers) = workers {
            if tokio::time::timeout(WORKER_JOIN_TIMEOUT, workers.capture)
                .await
                .is_err()
            {
                warn!("Capture worker did not stop in time");
            }
            if tokio::time::timeout(WORKER_JOIN_TIMEOUT, workers.playback)
                .await
                .is_err()
            {
                warn!("Playback worker did not stop in time");
            }
        }

        if let Some(mut task) = dispatch {
            if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }

        let dropped = self.playback.flush();
        if dropped > 0 {
            debug!("Discarded {} unplayed frames", dropped);
        }

        self.shared.state.transition_from(&[Closing], Disconnected);
        info!("Disconnected");
    }
}

impl Drop for VoiceSession {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        if let Some(transport) = self.set_transport(None) {
            transport.close();
        }
    }
}

fn transport_open(transport: &Option<Arc<WsTransport>>) -> bool {
    transport.as_ref().map(|t| t.is_open()).unwrap_or(false)
}

/// Feed inbound units to the dispatcher until the channel closes
async fn run_dispatch(
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    dispatcher: ControlDispatcher,
    shared: Arc<SessionShared>,
) {
    debug!("Dispatch loop started");

    while let Some(event) = events.recv().await {
        if shared.state.current() == SessionState::Failed {
            debug!("Session failed; no longer dispatching");
            break;
        }
        match event {
            TransportEvent::Inbound(unit) => {
                dispatcher.dispatch(unit);
            }
            TransportEvent::Closed => {
                shared.fail(SessionError::Transport("connection closed by server".into()));
                break;
            }
            TransportEvent::Error(e) => {
                shared.fail(e);
                break;
            }
        }
    }

    debug!("Dispatch loop stopped");
}

/// Quick way to run a conversation without manual setup
///
/// Connects, streams until the transport ends or Ctrl-C is pressed, then
/// disconnects.
pub async fn simple_conversation(
    config: SessionConfig,
    device: Arc<dyn AudioDevice>,
    observer: impl SessionObserver + 'static,
) -> Result<()> {
    let session = Arc::new(VoiceSession::new(config, device).with_observer(observer));

    let interrupt = {
        let session = Arc::clone(&session);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Conversation ended");
                session.stop();
            }
        })
    };

    let result = session.start_conversation().await;
    interrupt.abort();
    session.disconnect().await;
    result
}
