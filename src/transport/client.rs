use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::messages::InboundUnit;
use crate::audio::{AudioFrame, FrameSink};
use crate::error::{Result, SessionError};

/// Header carrying the API key at channel open
pub const API_KEY_HEADER: &str = "x-api-key";

/// Something the reader or writer task observed on the channel
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Inbound(InboundUnit),
    /// Channel closed (by the peer, or after a local close)
    Closed,
    /// Send or receive failure while the channel was open
    Error(SessionError),
}

/// Persistent, authenticated WebSocket channel
///
/// Outbound messages go through an unbounded queue drained by a writer task,
/// so sends never block and keep their submission order. Inbound units are
/// pushed, in arrival order, to the event receiver returned by `open`.
pub struct WsTransport {
    url: String,
    outbound: mpsc::UnboundedSender<Message>,
    open: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl WsTransport {
    /// Open the channel, failing with `ConnectTimeout` if the handshake does
    /// not finish within `connect_timeout`
    pub async fn open(
        url: &str,
        credential: Option<&str>,
        connect_timeout: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>)> {
        if !cfg!(feature = "tls") && url.starts_with("wss://") {
            return Err(SessionError::Config(format!(
                "{url} needs TLS; build with the `tls` feature"
            )));
        }

        info!("Connecting to {}...", url);

        let mut request = url.into_client_request()?;
        match credential.filter(|k| !k.is_empty()) {
            Some(key) => {
                let value = HeaderValue::from_str(key)
                    .map_err(|e| SessionError::Config(format!("invalid API key: {e}")))?;
                request
                    .headers_mut()
                    .insert(HeaderName::from_static(API_KEY_HEADER), value);
            }
            None => warn!("No API key configured; the service may reject the connection"),
        }

        let (stream, _response) =
            match tokio::time::timeout(connect_timeout, tokio_tungstenite::connect_async(request)).await {
                Ok(Ok(connected)) => connected,
                Ok(Err(e)) => return Err(SessionError::Transport(format!("connect failed: {e}"))),
                Err(_) => return Err(SessionError::ConnectTimeout(connect_timeout)),
            };

        info!("WebSocket connected to {}", url);

        let (mut write, mut read) = stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));

        let writer_open = Arc::clone(&open);
        let writer_events = event_tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = write.send(msg).await {
                    if writer_open.swap(false, Ordering::SeqCst) {
                        let _ = writer_events.send(TransportEvent::Error(SessionError::Transport(
                            format!("send error: {e}"),
                        )));
                    }
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = write.close().await;
            debug!("Transport writer stopped");
        });

        let reader_open = Arc::clone(&open);
        let reader = tokio::spawn(async move {
            loop {
                match read.next().await {
                    Some(Ok(Message::Binary(data))) => {
                        let _ = event_tx.send(TransportEvent::Inbound(InboundUnit::Binary(data)));
                    }
                    Some(Ok(Message::Text(text))) => {
                        let _ = event_tx.send(TransportEvent::Inbound(InboundUnit::Text(text)));
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        reader_open.store(false, Ordering::SeqCst);
                        info!("Connection closed");
                        let _ = event_tx.send(TransportEvent::Closed);
                        break;
                    }
                    Some(Ok(_)) => {} // Ping/Pong frames handled by tungstenite.
                    Some(Err(e)) => {
                        let event = if reader_open.swap(false, Ordering::SeqCst) {
                            TransportEvent::Error(SessionError::Transport(format!("read error: {e}")))
                        } else {
                            TransportEvent::Closed
                        };
                        let _ = event_tx.send(event);
                        break;
                    }
                }
            }
            debug!("Transport reader stopped");
        });

        Ok((
            Self {
                url: url.to_string(),
                outbound,
                open,
                reader: Mutex::new(Some(reader)),
            },
            event_rx,
        ))
    }

    /// Whether the channel is open (may flip at any time)
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn send(&self, msg: Message) -> Result<()> {
        if !self.is_open() {
            return Err(SessionError::Transport("channel is not open".into()));
        }
        self.outbound
            .send(msg)
            .map_err(|_| SessionError::Transport("channel writer has stopped".into()))
    }

    /// Send raw PCM as a binary message
    pub fn send_binary(&self, pcm: Vec<u8>) -> Result<()> {
        self.send(Message::Binary(pcm))
    }

    /// Send a JSON message
    pub fn send_structured<T: Serialize>(&self, message: &T) -> Result<()> {
        let json = serde_json::to_string(message)
            .map_err(|e| SessionError::Transport(format!("failed to encode message: {e}")))?;
        self.send(Message::Text(json))
    }

    /// Start closing the channel. Calling it again is a no-op.
    pub fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            info!("Closing connection to {}", self.url);
            let _ = self.outbound.send(Message::Close(None));
        }
    }

    /// Close and wait up to `grace` for the peer to acknowledge, then drop the
    /// reader regardless
    pub async fn shutdown(&self, grace: Duration) {
        self.close();

        let reader = match self.reader.lock() {
            Ok(mut r) => r.take(),
            Err(p) => p.into_inner().take(),
        };

        if let Some(mut handle) = reader {
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                debug!("Peer did not acknowledge close; aborting reader");
                handle.abort();
            }
        }
    }
}

impl FrameSink for WsTransport {
    fn is_open(&self) -> bool {
        WsTransport::is_open(self)
    }

    fn send_frame(&self, frame: AudioFrame) -> Result<()> {
        self.send_binary(frame.into_bytes())
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        let reader = match self.reader.get_mut() {
            Ok(r) => r.take(),
            Err(p) => p.into_inner().take(),
        };
        if let Some(handle) = reader {
            handle.abort();
        }
    }
}
