// End-to-end tests for the voice session against a loopback server

mod common;

use anyhow::Result;
use common::{drain_client, next_text, send_json, serve_once, silent_listener, wait_until};
use common::{MockDevice, RecordingObserver};
use futures::SinkExt;
use lokutor_voice::session::{
    Language, SessionConfig, SessionState, StateMachine, VoiceSession, VoiceStyle,
};
use lokutor_voice::SessionError;
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;

const TIMEOUT: Duration = Duration::from_secs(5);

fn test_config(url: &str) -> SessionConfig {
    SessionConfig::new("test-key", "You are a test assistant")
        .with_voice(VoiceStyle::M2)
        .with_language(Language::Spanish)
        .with_server_url(url)
        .with_connect_timeout(Duration::from_secs(2))
}

fn session_with(
    url: &str,
    device: Arc<MockDevice>,
) -> (Arc<VoiceSession>, Arc<RecordingObserver>) {
    let observer = Arc::new(RecordingObserver::default());
    let session = VoiceSession::new(test_config(url), device).with_shared_observer(observer.clone());
    (Arc::new(session), observer)
}

/// Server that reads the three config messages and then holds the line
async fn handshake_server() -> Result<(String, oneshot::Receiver<(Option<String>, Vec<String>)>)> {
    let (tx, rx) = oneshot::channel();
    let url = serve_once(move |mut ws, key| async move {
        let mut config = Vec::new();
        for _ in 0..3 {
            config.push(next_text(&mut ws).await.unwrap_or_default());
        }
        let _ = tx.send((key, config));
        drain_client(&mut ws).await;
    })
    .await?;
    Ok((url, rx))
}

#[test]
fn test_state_transitions() {
    use SessionState::*;

    assert!(Disconnected.can_transition_to(Connecting));
    assert!(Connecting.can_transition_to(Connected));
    assert!(Connected.can_transition_to(Streaming));
    assert!(Streaming.can_transition_to(Connected));
    assert!(Streaming.can_transition_to(Failed));
    assert!(Failed.can_transition_to(Disconnected));
    assert!(Closing.can_transition_to(Disconnected));

    assert!(!Disconnected.can_transition_to(Streaming));
    assert!(!Connecting.can_transition_to(Streaming));
    assert!(!Closing.can_transition_to(Connected));
    assert!(!Failed.can_transition_to(Connected));
}

#[test]
fn test_state_machine_rejects_invalid_transition() {
    let machine = StateMachine::new();
    assert_eq!(machine.current(), SessionState::Disconnected);

    let err = machine.transition(SessionState::Streaming).unwrap_err();
    assert!(matches!(err, SessionError::InvalidState(_)));
    assert_eq!(machine.current(), SessionState::Disconnected);

    assert_eq!(machine.transition(SessionState::Connecting).unwrap(), SessionState::Disconnected);
    assert!(!machine.transition_from(&[SessionState::Streaming], SessionState::Connected));
    assert!(machine.transition_from(&[SessionState::Connecting], SessionState::Connected));
    assert_eq!(machine.current(), SessionState::Connected);
}

#[tokio::test]
async fn test_connect_sends_config_in_order() -> Result<()> {
    // Setup: server that records the handshake
    let (url, rx) = handshake_server().await?;
    let (session, observer) = session_with(&url, Arc::new(MockDevice::new()));

    session.connect().await?;
    assert_eq!(session.state(), SessionState::Connected);
    assert!(session.is_connected());

    // Verify: API key header, then prompt, voice and language in that order
    let (key, config) = tokio::time::timeout(TIMEOUT, rx).await??;
    assert_eq!(key.as_deref(), Some("test-key"));

    let config: Vec<serde_json::Value> = config
        .iter()
        .map(|text| serde_json::from_str(text))
        .collect::<std::result::Result<_, _>>()?;
    assert_eq!(
        config,
        vec![
            json!({"type": "prompt", "data": "You are a test assistant"}),
            json!({"type": "voice", "data": "M2"}),
            json!({"type": "language", "data": "es"}),
        ]
    );

    // A second connect is a no-op
    session.connect().await?;

    session.disconnect().await;
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(observer.errors().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_connect_timeout_fails_session() -> Result<()> {
    // Setup: a listener that never completes the websocket handshake
    let (url, listener) = silent_listener().await?;
    let observer = Arc::new(RecordingObserver::default());
    let config = test_config(&url).with_connect_timeout(Duration::from_millis(200));
    let session = VoiceSession::new(config, Arc::new(MockDevice::new()))
        .with_shared_observer(observer.clone());

    let err = session.connect().await.unwrap_err();

    // Verify: timeout error, Failed state, one error callback
    assert!(matches!(err, SessionError::ConnectTimeout(_)));
    assert_eq!(session.state(), SessionState::Failed);
    assert!(matches!(session.last_error(), Some(SessionError::ConnectTimeout(_))));
    let errors = observer.errors();
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], SessionError::ConnectTimeout(_)));

    // Failed sessions must be reset before reconnecting
    assert!(matches!(
        session.connect().await,
        Err(SessionError::InvalidState(_))
    ));

    session.disconnect().await;
    assert_eq!(session.state(), SessionState::Disconnected);

    listener.abort();
    Ok(())
}

#[tokio::test]
async fn test_disconnect_twice_is_noop() -> Result<()> {
    let (url, _rx) = handshake_server().await?;
    let (session, observer) = session_with(&url, Arc::new(MockDevice::new()));

    // Nothing to release yet
    session.disconnect().await;
    assert_eq!(session.state(), SessionState::Disconnected);

    session.connect().await?;
    session.disconnect().await;
    assert_eq!(session.state(), SessionState::Disconnected);

    session.disconnect().await;
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(observer.errors().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_conversation_transcript_audio_and_interruption() -> Result<()> {
    let (release_tx, release_rx) = oneshot::channel::<()>();
    let (done_tx, done_rx) = oneshot::channel();

    // Setup: server sends transcripts, status and two audio frames, then
    // interrupts once released
    let url = serve_once(move |mut ws, _| async move {
        for _ in 0..3 {
            let _ = next_text(&mut ws).await;
        }

        send_json(&mut ws, json!({"type": "transcript", "data": "hello", "role": "user"})).await;
        send_json(&mut ws, json!({"type": "status", "data": "thinking"})).await;
        send_json(&mut ws, json!({"type": "transcript", "data": "Hi there!", "role": "agent"})).await;
        let _ = ws.send(Message::Binary(vec![1, 0, 2, 0])).await;
        let _ = ws.send(Message::Binary(vec![3, 0, 4, 0])).await;

        let _ = release_rx.await;
        send_json(&mut ws, json!({"type": "status", "data": "interrupted"})).await;

        let binary = drain_client(&mut ws).await;
        let _ = done_tx.send(binary);
    })
    .await?;

    // Run the conversation in the background
    let device = Arc::new(MockDevice::new());
    let (session, observer) = session_with(&url, device.clone());

    let conversation = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.start_conversation().await })
    };

    // Verify: transcripts routed by role, audio played in arrival order
    assert!(wait_until(TIMEOUT, || device.written().len() == 2).await, "agent audio should play");
    assert_eq!(session.state(), SessionState::Streaming);
    assert_eq!(observer.transcriptions(), vec!["hello"]);
    assert_eq!(observer.responses(), vec!["Hi there!"]);
    assert_eq!(
        device.written().iter().map(|f| f.as_bytes().to_vec()).collect::<Vec<_>>(),
        vec![vec![1, 0, 2, 0], vec![3, 0, 4, 0]]
    );

    // Interruption clears whatever is still queued
    let _ = release_tx.send(());
    assert!(
        wait_until(TIMEOUT, || session.stats().interruptions == 1).await,
        "interruption should be dispatched"
    );
    assert!(session.playback().is_empty());
    assert!(wait_until(TIMEOUT, || session.stats().frames_sent > 0).await);

    // Teardown releases each device exactly once
    session.disconnect().await;
    tokio::time::timeout(TIMEOUT, conversation).await???;

    assert_eq!(session.state(), SessionState::Disconnected);
    assert_eq!(device.inputs_closed.load(Ordering::SeqCst), 1);
    assert_eq!(device.outputs_closed.load(Ordering::SeqCst), 1);

    let sent_by_client = tokio::time::timeout(TIMEOUT, done_rx).await??;
    assert!(sent_by_client > 0, "microphone frames should reach the server");

    let stats = session.stats();
    assert_eq!(stats.frames_received, 2);
    assert_eq!(stats.transcripts, 2);
    assert!(observer.errors().is_empty());
    assert!(observer.statuses().contains(&lokutor_voice::AgentStatus::Interrupted));
    Ok(())
}

#[tokio::test]
async fn test_stop_returns_to_connected() -> Result<()> {
    let (url, _rx) = handshake_server().await?;
    let device = Arc::new(MockDevice::new());
    let (session, observer) = session_with(&url, device.clone());

    let conversation = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.start_conversation().await })
    };

    // Let a few microphone frames go out before stopping
    assert!(wait_until(TIMEOUT, || session.stats().frames_sent >= 3).await);
    session.stop();
    tokio::time::timeout(TIMEOUT, conversation).await???;

    // Verify: connection kept, devices released
    assert_eq!(session.state(), SessionState::Connected);
    assert_eq!(device.inputs_closed.load(Ordering::SeqCst), 1);
    assert_eq!(device.outputs_closed.load(Ordering::SeqCst), 1);

    session.disconnect().await;
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(observer.errors().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_server_close_while_streaming_fails_session() -> Result<()> {
    // Setup: server closes the channel shortly after the handshake
    let url = serve_once(|mut ws, _| async move {
        for _ in 0..3 {
            let _ = next_text(&mut ws).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        let _ = ws.close(None).await;
        drain_client(&mut ws).await;
    })
    .await?;

    let device = Arc::new(MockDevice::new());
    let (session, observer) = session_with(&url, device.clone());

    let result = tokio::time::timeout(TIMEOUT, session.start_conversation()).await?;

    // Verify: treated as a transport failure, reported once
    assert!(matches!(result, Err(SessionError::Transport(_))));
    assert_eq!(session.state(), SessionState::Failed);
    assert_eq!(observer.errors().len(), 1, "the failure is reported once");
    assert_eq!(device.inputs_closed.load(Ordering::SeqCst), 1);
    assert_eq!(device.outputs_closed.load(Ordering::SeqCst), 1);

    session.disconnect().await;
    assert_eq!(session.state(), SessionState::Disconnected);
    Ok(())
}

#[tokio::test]
async fn test_malformed_messages_do_not_change_state() -> Result<()> {
    // Setup: garbage, an unknown kind and an unknown status, then a valid transcript
    let url = serve_once(|mut ws, _| async move {
        for _ in 0..3 {
            let _ = next_text(&mut ws).await;
        }
        let _ = ws.send(Message::Text("{not json".into())).await;
        send_json(&mut ws, json!({"type": "mystery", "data": 42})).await;
        send_json(&mut ws, json!({"type": "status", "data": "dozing"})).await;
        send_json(&mut ws, json!({"type": "transcript", "data": "still here"})).await;
        drain_client(&mut ws).await;
    })
    .await?;

    let (session, observer) = session_with(&url, Arc::new(MockDevice::new()));
    session.connect().await?;

    assert!(wait_until(TIMEOUT, || !observer.transcriptions().is_empty()).await);
    // Verify: only the valid transcript was delivered
    assert_eq!(session.state(), SessionState::Connected);
    assert_eq!(observer.transcriptions(), vec!["still here"]);
    assert!(observer.errors().is_empty());
    assert_eq!(session.stats().malformed_messages, 2);

    session.disconnect().await;
    Ok(())
}

#[tokio::test]
async fn test_output_device_failure_keeps_connection() -> Result<()> {
    let (url, _rx) = handshake_server().await?;
    let device = Arc::new(MockDevice::failing_output());
    let (session, observer) = session_with(&url, device.clone());

    // Speaker cannot be opened
    let err = session.start_conversation().await.unwrap_err();

    assert!(matches!(err, SessionError::Device(_)));
    assert_eq!(session.state(), SessionState::Connected);
    assert_eq!(device.inputs_closed.load(Ordering::SeqCst), 1, "input released");
    assert!(matches!(observer.errors().as_slice(), [SessionError::Device(_)]));

    session.disconnect().await;
    assert_eq!(session.state(), SessionState::Disconnected);
    Ok(())
}

#[tokio::test]
async fn test_speaker_failure_mid_conversation_fails_session() -> Result<()> {
    // Setup: the server streams agent audio to a speaker that rejects writes
    let url = serve_once(|mut ws, _| async move {
        for _ in 0..3 {
            let _ = next_text(&mut ws).await;
        }
        for i in 0..20u8 {
            let _ = ws.send(Message::Binary(vec![i, 0])).await;
        }
        drain_client(&mut ws).await;
    })
    .await?;

    let device = Arc::new(MockDevice::failing_writes());
    let (session, observer) = session_with(&url, device.clone());

    // Run: the conversation must end on its own
    let result = tokio::time::timeout(TIMEOUT, session.start_conversation()).await?;

    // Verify: the device error is reported once and nothing is left queued
    assert!(matches!(result, Err(SessionError::Device(_))));
    assert_eq!(session.state(), SessionState::Failed);
    assert!(matches!(observer.errors().as_slice(), [SessionError::Device(_)]));
    assert!(matches!(session.last_error(), Some(SessionError::Device(_))));
    assert_eq!(device.inputs_closed.load(Ordering::SeqCst), 1);
    assert_eq!(device.outputs_closed.load(Ordering::SeqCst), 1);
    assert!(device.written().is_empty());

    session.disconnect().await;
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(session.playback().is_empty());
    assert_eq!(observer.errors().len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_stats_identify_session() -> Result<()> {
    let session = VoiceSession::new(test_config("ws://127.0.0.1:9"), Arc::new(MockDevice::new()));

    let stats = session.stats();
    assert!(stats.session_id.starts_with("session-"));
    assert_eq!(stats.session_id, session.id());
    assert_eq!(stats.state, SessionState::Disconnected);
    assert_eq!(stats.frames_sent, 0);
    Ok(())
}
