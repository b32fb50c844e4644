//! VAD client integration tests against a mock sidecar

use std::sync::{Arc, Mutex};
use std::time::Duration;

use beacon_voice::voice::vad::{SpeechSignal, WakeSignal};
use beacon_voice::voice::{LinkState, VadClient, VadConfig, VadHandlers, VadMode};
use beacon_voice::Error;
use serde_json::json;
use tokio::sync::mpsc;

mod common;
use common::{MockVadServer, unused_endpoint};

#[derive(Debug)]
enum Seen {
    Start(SpeechSignal),
    End(SpeechSignal),
    Interrupt(SpeechSignal),
    Error(String),
    Wake(WakeSignal),
    Reconnected,
}

fn recording_handlers() -> (VadHandlers, mpsc::UnboundedReceiver<Seen>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let start = tx.clone();
    let end = tx.clone();
    let interrupt = tx.clone();
    let error = tx.clone();
    let wake = tx.clone();

    let handlers = VadHandlers {
        on_speech_start: Some(Arc::new(move |s| start.send(Seen::Start(s)).unwrap())),
        on_speech_end: Some(Arc::new(move |s| end.send(Seen::End(s)).unwrap())),
        on_interrupt: Some(Arc::new(move |s| interrupt.send(Seen::Interrupt(s)).unwrap())),
        on_error: Some(Arc::new(move |e| error.send(Seen::Error(e.to_string())).unwrap())),
        on_wake_word: Some(Arc::new(move |w| wake.send(Seen::Wake(w)).unwrap())),
        on_reconnected: Some(Arc::new(move || tx.send(Seen::Reconnected).unwrap())),
    };
    (handlers, rx)
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Seen>) -> Seen {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for vad event")
        .expect("handler channel closed")
}

async fn connected_client(server: &MockVadServer) -> (VadClient, mpsc::UnboundedReceiver<Seen>) {
    let client = VadClient::new(server.config()).unwrap();
    let (handlers, rx) = recording_handlers();
    client.set_handlers(handlers);
    client.connect().await.unwrap();
    server.wait_for("connection", |s| s.connection_count() >= 1).await;
    (client, rx)
}

#[tokio::test]
async fn test_events_reach_handlers() {
    let server = MockVadServer::start().await;
    let (client, mut rx) = connected_client(&server).await;

    assert!(client.is_connected());
    assert_eq!(client.link_state(), LinkState::Connected);

    server.send(json!({"type": "speech_start", "timestamp": 1.0, "confidence": 0.9}));
    let Seen::Start(signal) = next(&mut rx).await else {
        panic!("expected speech_start");
    };
    assert!((signal.confidence - 0.9).abs() < f64::EPSILON);

    server.send(json!({
        "type": "speech_end",
        "timestamp": 2.5,
        "confidence": 0.8,
        "audio_base64": "dGVzdCBhdWRpbw==",
        "duration_ms": 1500
    }));
    let Seen::End(signal) = next(&mut rx).await else {
        panic!("expected speech_end");
    };
    assert_eq!(signal.audio.as_deref(), Some(b"test audio".as_slice()));
    assert_eq!(signal.speech_duration(), Some(Duration::from_millis(1500)));

    server.send(json!({"type": "interrupt", "timestamp": 3.0, "confidence": 0.95}));
    assert!(matches!(next(&mut rx).await, Seen::Interrupt(_)));

    server.send(json!({"type": "wake_word", "wake_word": "hey_orin", "confidence": 0.7}));
    let Seen::Wake(wake) = next(&mut rx).await else {
        panic!("expected wake_word");
    };
    assert_eq!(wake.wake_word, "hey_orin");

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_server_error_and_garbage() {
    let server = MockVadServer::start().await;
    let (client, mut rx) = connected_client(&server).await;

    // Unknown and malformed frames are skipped without reconnecting
    server.send(json!({"type": "vad_stats", "frames": 12}));
    server.send(json!("not an event"));
    server.send(json!({"type": "error", "timestamp": 4.0, "message": "model crashed"}));

    let Seen::Error(message) = next(&mut rx).await else {
        panic!("expected error");
    };
    assert!(message.contains("model crashed"), "{message}");
    assert!(client.is_connected());
    assert_eq!(server.connection_count(), 1);

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_audio_frames_are_streamed() {
    let server = MockVadServer::start().await;
    let (client, _rx) = connected_client(&server).await;

    for _ in 0..5 {
        client.send_audio_frame(&[0u8; 640]).await.unwrap();
    }
    server.wait_for("frames", |s| s.frame_count() == 5).await;

    client.close().await.unwrap();
    assert!(!client.is_connected());
    assert!(matches!(
        client.send_audio_frame(&[0u8; 640]).await,
        Err(Error::NotConnected)
    ));
}

#[tokio::test]
async fn test_connect_twice_fails() {
    let server = MockVadServer::start().await;
    let (client, _rx) = connected_client(&server).await;
    assert!(client.connect().await.is_err());
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_mode_control() {
    let server = MockVadServer::start().await;
    let client = VadClient::new(server.config()).unwrap();
    assert_eq!(client.http_base_url(), format!("http://{}", server.addr));

    assert_eq!(client.get_mode().await.unwrap(), VadMode::Full);

    client.set_mode(VadMode::Playback).await.unwrap();
    assert_eq!(client.current_mode(), VadMode::Playback);
    assert_eq!(client.get_mode().await.unwrap(), VadMode::Playback);
    assert_eq!(server.mode_posts(), vec![VadMode::Playback]);
}

#[tokio::test]
async fn test_reconnects_after_server_drop() {
    let server = MockVadServer::start().await;
    let (client, mut rx) = connected_client(&server).await;

    server.disconnect_all();
    assert!(matches!(next(&mut rx).await, Seen::Reconnected));
    server.wait_for("second connection", |s| s.connection_count() == 2).await;
    assert!(client.is_connected());

    // Events flow on the new stream
    server.send(json!({"type": "speech_start", "confidence": 0.5}));
    assert!(matches!(next(&mut rx).await, Seen::Start(_)));

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_explicit_reconnect_on_live_stream_is_noop() {
    let server = MockVadServer::start().await;
    let (client, _rx) = connected_client(&server).await;

    client.reconnect().await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(server.connection_count(), 1);
    assert!(client.is_connected());
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_replaced_stream_does_not_trigger_reconnect() {
    let server = MockVadServer::start().await;
    let (client, mut rx) = connected_client(&server).await;

    // Server drops the stream; the client dials back in once
    server.disconnect_all();
    assert!(matches!(next(&mut rx).await, Seen::Reconnected));
    server.wait_for("second connection", |s| s.connection_count() == 2).await;

    // The retired stream stays quiet; nothing else dials in
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(server.connection_count(), 2);
    assert!(client.is_connected());

    server.send(json!({"type": "speech_start", "confidence": 0.5}));
    assert!(matches!(next(&mut rx).await, Seen::Start(_)));

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_lost_stream_exhausts_and_stays_down() {
    let server = MockVadServer::start().await;
    let (client, mut rx) = connected_client(&server).await;

    server.set_refusing(true);
    server.disconnect_all();

    let Seen::Error(message) = next(&mut rx).await else {
        panic!("expected exhaustion error");
    };
    assert!(message.contains('3'), "{message}");
    assert!(!client.is_running());
    assert_eq!(client.link_state(), LinkState::Idle);

    // The sidecar comes back, but the client does not dial on its own
    server.set_refusing(false);
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(server.connection_count(), 1);
    assert!(rx.try_recv().is_err());

    // An explicit reconnect revives it
    client.reconnect().await.unwrap();
    server.wait_for("revived connection", |s| s.connection_count() == 2).await;
    assert!(client.is_connected());

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_reconnect_gives_up_after_max_attempts() {
    let config = VadConfig {
        endpoint: unused_endpoint().await,
        ..MockVadServer::start().await.config()
    };
    let client = VadClient::new(config).unwrap();

    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    client.set_handlers(VadHandlers {
        on_error: Some(Arc::new(move |e| sink.lock().unwrap().push(e))),
        ..VadHandlers::default()
    });

    let result = client.reconnect().await;
    assert!(matches!(result, Err(Error::ReconnectExhausted(3))));

    let errors = errors.lock().unwrap();
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], Error::ReconnectExhausted(3)));
    assert!(!client.is_running());
    assert_eq!(client.link_state(), LinkState::Idle);
}

#[tokio::test]
async fn test_connect_to_missing_server_fails() {
    let client = VadClient::new(VadConfig {
        endpoint: unused_endpoint().await,
        ..VadConfig::default()
    })
    .unwrap();

    assert!(client.connect().await.is_err());
    assert_eq!(client.link_state(), LinkState::Idle);
    assert!(!client.is_running());
}
