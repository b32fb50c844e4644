//! Shared test utilities
#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use beacon_voice::voice::vad::ModeMessage;
use beacon_voice::voice::{
    AudioPlayer, AudioSource, PlaybackCallbacks, ReconnectPolicy, SpeechSynthesizer, VadConfig,
    VadMode,
};
use beacon_voice::{Error, Result};
use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast;

/// Write a short 16-bit mono WAV clip to `path`
pub fn write_wav(path: &Path, samples: usize) {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 24_000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).expect("failed to create wav");
    for i in 0..samples {
        writer
            .write_sample(i16::try_from(i % 100).unwrap_or(0))
            .expect("failed to write sample");
    }
    writer.finalize().expect("failed to finalize wav");
}

/// Synthesizer that writes a tiny WAV for every request
#[derive(Default)]
pub struct MockSynthesizer {
    pub requests: Mutex<Vec<(String, String)>>,
    pub fail: AtomicBool,
}

impl MockSynthesizer {
    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl SpeechSynthesizer for MockSynthesizer {
    async fn synthesize_to_file(&self, text: &str, output: &Path, voice_id: &str) -> Result<()> {
        self.requests
            .lock()
            .unwrap()
            .push((text.to_string(), voice_id.to_string()));

        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Tts("mock synthesis failure".to_string()));
        }

        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent)?;
        }
        write_wav(output, 240);
        Ok(())
    }
}

/// Player that records clips and stop calls
#[derive(Default)]
pub struct MockPlayer {
    pub playing: AtomicBool,
    /// How long each clip "plays"
    pub play_time: Mutex<Duration>,
    pub stops: AtomicUsize,
    pub played: Mutex<Vec<Vec<u8>>>,
    pub callbacks: Mutex<PlaybackCallbacks>,
}

impl MockPlayer {
    pub fn set_playing(&self, playing: bool) {
        self.playing.store(playing, Ordering::SeqCst);
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn play_count(&self) -> usize {
        self.played.lock().unwrap().len()
    }

    pub fn has_callbacks(&self) -> bool {
        let callbacks = self.callbacks.lock().unwrap();
        callbacks.on_playback_start.is_some() && callbacks.on_playback_end.is_some()
    }
}

#[async_trait]
impl AudioPlayer for MockPlayer {
    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.playing.store(false, Ordering::SeqCst);
    }

    fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    async fn play_bytes(&self, data: &[u8]) -> Result<()> {
        let callbacks = self.callbacks.lock().unwrap().clone();
        let play_time = *self.play_time.lock().unwrap();
        callbacks.playback_started();
        self.played.lock().unwrap().push(data.to_vec());
        if !play_time.is_zero() {
            tokio::time::sleep(play_time).await;
        }
        callbacks.playback_ended();
        Ok(())
    }

    fn set_callbacks(&self, callbacks: PlaybackCallbacks) {
        *self.callbacks.lock().unwrap() = callbacks;
    }
}

/// Source that yields fixed frames, then either ends or idles forever
pub struct FrameSource {
    frames: VecDeque<Vec<u8>>,
    endless: bool,
    pub closed: Arc<AtomicBool>,
}

impl FrameSource {
    pub fn finite(frames: Vec<Vec<u8>>) -> Self {
        Self {
            frames: frames.into(),
            endless: false,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn endless(frames: Vec<Vec<u8>>) -> Self {
        Self {
            endless: true,
            ..Self::finite(frames)
        }
    }
}

#[async_trait]
impl AudioSource for FrameSource {
    async fn read_frame(&mut self) -> Result<Vec<u8>> {
        if let Some(frame) = self.frames.pop_front() {
            tokio::time::sleep(Duration::from_millis(5)).await;
            return Ok(frame);
        }
        if self.endless {
            std::future::pending::<()>().await;
        }
        Err(Error::EndOfStream)
    }

    async fn close(&mut self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Server-side view of the mock VAD sidecar
pub struct VadServerState {
    pub mode: Mutex<VadMode>,
    pub mode_posts: Mutex<Vec<VadMode>>,
    pub frames: AtomicUsize,
    pub connections: AtomicUsize,
    /// Reject stream upgrades, as if the sidecar were down
    pub refusing: AtomicBool,
    /// Extra latency before a mode change is applied
    pub mode_delays: Mutex<Vec<(VadMode, Duration)>>,
    outbound: broadcast::Sender<Outbound>,
}

#[derive(Clone, Debug)]
enum Outbound {
    Text(String),
    Close,
}

/// Mock VAD sidecar: `/v1/vad/stream` WebSocket plus `/v1/vad/mode`
pub struct MockVadServer {
    pub addr: SocketAddr,
    pub state: Arc<VadServerState>,
}

impl MockVadServer {
    pub async fn start() -> Self {
        let (outbound, _) = broadcast::channel(64);
        let state = Arc::new(VadServerState {
            mode: Mutex::new(VadMode::Full),
            mode_posts: Mutex::new(Vec::new()),
            frames: AtomicUsize::new(0),
            connections: AtomicUsize::new(0),
            refusing: AtomicBool::new(false),
            mode_delays: Mutex::new(Vec::new()),
            outbound,
        });

        let app = Router::new()
            .route("/v1/vad/stream", get(stream_handler))
            .route("/v1/vad/mode", get(get_mode).post(post_mode))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind mock vad server");
        let addr = listener.local_addr().expect("no local addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("mock vad server failed");
        });

        Self { addr, state }
    }

    pub fn endpoint(&self) -> String {
        format!("ws://{}/v1/vad/stream", self.addr)
    }

    /// Client config with fast reconnects
    pub fn config(&self) -> VadConfig {
        VadConfig {
            endpoint: self.endpoint(),
            reconnect: ReconnectPolicy {
                initial_wait: Duration::from_millis(50),
                max_wait: Duration::from_millis(200),
                max_attempts: 3,
            },
            ..VadConfig::default()
        }
    }

    /// Push a JSON event to every connected client
    pub fn send(&self, event: serde_json::Value) {
        let _ = self.state.outbound.send(Outbound::Text(event.to_string()));
    }

    /// Drop every open stream from the server side
    pub fn disconnect_all(&self) {
        let _ = self.state.outbound.send(Outbound::Close);
    }

    pub fn set_refusing(&self, refusing: bool) {
        self.state.refusing.store(refusing, Ordering::SeqCst);
    }

    /// Hold requests for `mode` for `delay` before applying them
    pub fn delay_mode(&self, mode: VadMode, delay: Duration) {
        self.state.mode_delays.lock().unwrap().push((mode, delay));
    }

    pub fn current_mode(&self) -> VadMode {
        *self.state.mode.lock().unwrap()
    }

    pub fn frame_count(&self) -> usize {
        self.state.frames.load(Ordering::SeqCst)
    }

    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn mode_posts(&self) -> Vec<VadMode> {
        self.state.mode_posts.lock().unwrap().clone()
    }

    /// Wait until `check` passes, panicking after two seconds
    pub async fn wait_for(&self, what: &str, check: impl Fn(&Self) -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !check(self) {
            assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

async fn stream_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<VadServerState>>,
) -> Response {
    if state.refusing.load(Ordering::SeqCst) {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    ws.on_upgrade(move |socket| serve_socket(socket, state))
}

async fn serve_socket(socket: WebSocket, state: Arc<VadServerState>) {
    let mut outbound = state.outbound.subscribe();
    state.connections.fetch_add(1, Ordering::SeqCst);
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            message = outbound.recv() => match message {
                Ok(Outbound::Text(text)) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Ok(Outbound::Close) | Err(_) => break,
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Binary(_))) => {
                    state.frames.fetch_add(1, Ordering::SeqCst);
                }
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }

    let _ = sink.close().await;
}

async fn get_mode(State(state): State<Arc<VadServerState>>) -> Json<ModeMessage> {
    Json(ModeMessage {
        mode: *state.mode.lock().unwrap(),
    })
}

async fn post_mode(
    State(state): State<Arc<VadServerState>>,
    Json(body): Json<ModeMessage>,
) -> Json<ModeMessage> {
    let delay = state
        .mode_delays
        .lock()
        .unwrap()
        .iter()
        .find(|(mode, _)| *mode == body.mode)
        .map(|(_, delay)| *delay);
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }

    *state.mode.lock().unwrap() = body.mode;
    state.mode_posts.lock().unwrap().push(body.mode);
    Json(body)
}

/// A port nothing listens on
pub async fn unused_endpoint() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind");
    let addr = listener.local_addr().expect("no local addr");
    drop(listener);
    format!("ws://{addr}/v1/vad/stream")
}
