//! Voice activity detection (VAD) streaming client
//!
//! Keeps one WebSocket open to the external detector. Raw PCM frames go out as
//! binary messages; speech boundary events come back as JSON. A keepalive
//! loop pings the server, and a read failure while the client is meant to be
//! running starts a single-flight reconnect with exponential backoff.
//!
//! Mode switching (`FULL` / `PLAYBACK`) uses the detector's HTTP API rather
//! than the stream.

mod protocol;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

pub use protocol::{ModeMessage, SpeechSignal, VadEvent, VadMode, WakeSignal, decode_event};

use crate::{Error, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Default streaming endpoint of the local voice sidecar
pub const DEFAULT_ENDPOINT: &str = "ws://127.0.0.1:8880/v1/vad/stream";

const MODE_PATH: &str = "/v1/vad/mode";

/// Reconnection backoff policy
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Wait before the first attempt (doubles each attempt)
    pub initial_wait: Duration,
    /// Maximum wait between attempts
    pub max_wait: Duration,
    /// Attempts before giving up; 0 retries forever
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_wait: Duration::from_secs(2),
            max_wait: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Wait before attempt `attempt` (0-based): `min(initial * 2^attempt, max)`
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.initial_wait
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_wait)
    }
}

/// VAD client configuration
#[derive(Debug, Clone)]
pub struct VadConfig {
    /// WebSocket streaming endpoint
    pub endpoint: String,
    /// Base URL of the HTTP API; derived from `endpoint` when unset
    pub http_base_url: Option<String>,
    pub reconnect: ReconnectPolicy,
    /// Interval between keepalive pings
    pub ping_interval: Duration,
    pub http_timeout: Duration,
    pub handshake_timeout: Duration,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            http_base_url: None,
            reconnect: ReconnectPolicy::default(),
            ping_interval: Duration::from_secs(30),
            http_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

/// Connection lifecycle as seen by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Connecting,
    Connected,
    /// Waiting before reconnect attempt `n` (1-based)
    Backoff(u32),
}

/// Observer for speech boundary events
pub type SpeechHandler = Arc<dyn Fn(SpeechSignal) + Send + Sync>;

/// Observer for transport and server errors
pub type VadErrorHandler = Arc<dyn Fn(Error) + Send + Sync>;

/// Observer for detector-side wake word hits
pub type WakeSignalHandler = Arc<dyn Fn(WakeSignal) + Send + Sync>;

/// Observer for a completed reconnection
pub type ReconnectHandler = Arc<dyn Fn() + Send + Sync>;

/// Event observers; unset ones drop their events
#[derive(Clone, Default)]
pub struct VadHandlers {
    pub on_speech_start: Option<SpeechHandler>,
    pub on_speech_end: Option<SpeechHandler>,
    pub on_interrupt: Option<SpeechHandler>,
    pub on_error: Option<VadErrorHandler>,
    pub on_wake_word: Option<WakeSignalHandler>,
    pub on_reconnected: Option<ReconnectHandler>,
}

struct ConnState {
    writer: Option<Arc<Mutex<WsSink>>>,
    running: bool,
    mode: VadMode,
    link: LinkState,
    session: Option<CancellationToken>,
    /// Token of the installed stream's loops
    stream: Option<CancellationToken>,
}

struct Shared {
    config: VadConfig,
    http: reqwest::Client,
    http_base: String,
    state: RwLock<ConnState>,
    reconnecting: AtomicBool,
    handlers: RwLock<VadHandlers>,
}

/// Clears the single-flight flag when the reconnect attempt ends
struct ReconnectFlight<'a>(&'a AtomicBool);

impl<'a> ReconnectFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for ReconnectFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Streaming VAD client
///
/// Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct VadClient {
    shared: Arc<Shared>,
}

impl VadClient {
    /// Create a disconnected client
    ///
    /// # Errors
    ///
    /// Returns error if the endpoint is not a ws/wss URL or the HTTP client
    /// cannot be built
    pub fn new(config: VadConfig) -> Result<Self> {
        let http_base = match config.http_base_url.as_deref() {
            Some(base) if !base.trim().is_empty() => base.trim_end_matches('/').to_string(),
            _ => derive_http_base(&config.endpoint)?,
        };

        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()?;

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                http,
                http_base,
                state: RwLock::new(ConnState {
                    writer: None,
                    running: false,
                    mode: VadMode::Full,
                    link: LinkState::Idle,
                    session: None,
                    stream: None,
                }),
                reconnecting: AtomicBool::new(false),
                handlers: RwLock::new(VadHandlers::default()),
            }),
        })
    }

    #[must_use]
    pub fn config(&self) -> &VadConfig {
        &self.shared.config
    }

    /// Base URL used for mode control
    #[must_use]
    pub fn http_base_url(&self) -> &str {
        &self.shared.http_base
    }

    /// Replace all event observers
    pub fn set_handlers(&self, handlers: VadHandlers) {
        *self
            .shared
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner) = handlers;
    }

    /// Open the stream and start the receive and keepalive loops
    ///
    /// # Errors
    ///
    /// Returns error if already connected, or the handshake fails or times out
    pub async fn connect(&self) -> Result<()> {
        {
            let mut state = self.shared.state_mut();
            if state.running || state.link == LinkState::Connecting {
                return Err(Error::Vad("already connected".to_string()));
            }
            state.link = LinkState::Connecting;
        }

        tracing::debug!(endpoint = %self.shared.config.endpoint, "connecting to vad server");

        let stream = match self.shared.dial().await {
            Ok(stream) => stream,
            Err(e) => {
                self.shared.state_mut().link = LinkState::Idle;
                return Err(e);
            }
        };

        let session = CancellationToken::new();
        Shared::start_connection(&self.shared, stream, &session);

        tracing::info!(endpoint = %self.shared.config.endpoint, "vad client connected");
        Ok(())
    }

    /// Reconnect with backoff, waiting for the outcome
    ///
    /// Used to resume after reconnection was exhausted. Exhaustion is also
    /// reported to the error observer. No-op while the stream is up.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReconnectExhausted`] when every attempt failed, or an
    /// error if a reconnect is already running or the client was closed
    pub async fn reconnect(&self) -> Result<()> {
        let session = {
            let mut state = self.shared.state_mut();
            if state.running && state.link == LinkState::Connected {
                tracing::debug!("vad stream is up, nothing to reconnect");
                return Ok(());
            }
            state.running = true;
            state
                .session
                .get_or_insert_with(CancellationToken::new)
                .clone()
        };

        Shared::reconnect_loop(Arc::clone(&self.shared), session).await
    }

    /// Send one raw PCM frame
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] without a live stream, or an error if
    /// the write fails
    pub async fn send_audio_frame(&self, frame: &[u8]) -> Result<()> {
        let writer = {
            let state = self.shared.state();
            if !state.running {
                return Err(Error::NotConnected);
            }
            state.writer.clone().ok_or(Error::NotConnected)?
        };

        writer
            .lock()
            .await
            .send(Message::Binary(frame.to_vec().into()))
            .await
            .map_err(|e| Error::Vad(format!("failed to send audio frame: {e}")))
    }

    /// Stop every loop and close the stream
    ///
    /// # Errors
    ///
    /// Returns error if the socket fails to close cleanly
    pub async fn close(&self) -> Result<()> {
        let (writer, session) = {
            let mut state = self.shared.state_mut();
            if !state.running && state.writer.is_none() && state.session.is_none() {
                return Ok(());
            }
            state.running = false;
            state.link = LinkState::Idle;
            state.stream = None;
            (state.writer.take(), state.session.take())
        };

        if let Some(session) = session {
            session.cancel();
        }

        if let Some(writer) = writer {
            let mut sink = writer.lock().await;
            if let Err(e) = sink.send(Message::Close(None)).await {
                tracing::debug!(error = %e, "error sending vad close frame");
            }
            sink.close()
                .await
                .map_err(|e| Error::Vad(format!("failed to close connection: {e}")))?;
        }

        tracing::info!("vad client closed");
        Ok(())
    }

    /// Whether the stream is up and the client is running
    #[must_use]
    pub fn is_connected(&self) -> bool {
        let state = self.shared.state();
        state.running && state.writer.is_some() && state.link == LinkState::Connected
    }

    /// Whether the client is meant to be running (connected or recovering)
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.state().running
    }

    #[must_use]
    pub fn link_state(&self) -> LinkState {
        self.shared.state().link
    }

    /// Switch the detector mode
    ///
    /// # Errors
    ///
    /// Returns error if the request fails or the server rejects the mode
    pub async fn set_mode(&self, mode: VadMode) -> Result<()> {
        let previous = self.current_mode();
        let url = format!("{}{MODE_PATH}", self.shared.http_base);

        let response = self
            .shared
            .http
            .post(&url)
            .json(&ModeMessage { mode })
            .send()
            .await
            .map_err(|e| Error::Vad(format!("failed to set vad mode: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Vad(format!(
                "mode change failed: status {status}, body: {body}"
            )));
        }

        self.shared.state_mut().mode = mode;
        tracing::info!(previous = %previous, mode = %mode, "vad mode changed");
        Ok(())
    }

    /// Query the detector mode, refreshing the local copy
    ///
    /// # Errors
    ///
    /// Returns error if the request fails or the response is malformed
    pub async fn get_mode(&self) -> Result<VadMode> {
        let url = format!("{}{MODE_PATH}", self.shared.http_base);

        let response = self
            .shared
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Vad(format!("failed to get vad mode: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Vad(format!(
                "get mode failed: status {status}, body: {body}"
            )));
        }

        let ModeMessage { mode } = response
            .json()
            .await
            .map_err(|e| Error::Vad(format!("malformed mode response: {e}")))?;

        self.shared.state_mut().mode = mode;
        tracing::debug!(mode = %mode, "retrieved vad mode");
        Ok(mode)
    }

    /// Last known mode, without a round-trip
    #[must_use]
    pub fn current_mode(&self) -> VadMode {
        self.shared.state().mode
    }
}

impl Shared {
    fn state(&self) -> RwLockReadGuard<'_, ConnState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn state_mut(&self) -> RwLockWriteGuard<'_, ConnState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn handlers(&self) -> VadHandlers {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn dial(&self) -> Result<WsStream> {
        let handshake = tokio_tungstenite::connect_async(self.config.endpoint.as_str());
        let (stream, _response) = tokio::time::timeout(self.config.handshake_timeout, handshake)
            .await
            .map_err(|_| {
                Error::Vad(format!(
                    "handshake with {} timed out after {:?}",
                    self.config.endpoint, self.config.handshake_timeout
                ))
            })??;
        Ok(stream)
    }

    /// Install a fresh stream and spawn its loops
    ///
    /// Each stream gets its own child token, so the keepalive loop ends with
    /// the receive loop that owns the stream.
    fn start_connection(shared: &Arc<Self>, stream: WsStream, session: &CancellationToken) {
        let (sink, source) = stream.split();
        let writer = Arc::new(Mutex::new(sink));

        let link = session.child_token();

        let (stale, stale_stream) = {
            let mut state = shared.state_mut();
            state.running = true;
            state.link = LinkState::Connected;
            state.session = Some(session.clone());
            (
                state.writer.replace(Arc::clone(&writer)),
                state.stream.replace(link.clone()),
            )
        };

        // The old loops must not see their stream close as a failure
        if let Some(stale_stream) = stale_stream {
            stale_stream.cancel();
        }
        if let Some(stale) = stale {
            tokio::spawn(async move {
                let _ = stale.lock().await.close().await;
            });
        }

        tokio::spawn(Self::receive_loop(Arc::clone(shared), source, link.clone()));
        tokio::spawn(Self::keepalive_loop(
            writer,
            shared.config.ping_interval,
            link,
        ));
    }

    async fn receive_loop(shared: Arc<Self>, mut source: WsSource, link: CancellationToken) {
        let _stop_keepalive = link.clone().drop_guard();

        let failure = loop {
            let next = tokio::select! {
                () = link.cancelled() => return,
                next = source.next() => next,
            };

            match next {
                Some(Ok(Message::Text(text))) => shared.handle_text(text.as_str()),
                Some(Ok(Message::Close(_))) | None => break "closed by server".to_string(),
                Some(Ok(_)) => {}
                Some(Err(e)) => break e.to_string(),
            }
        };

        let session = {
            let state = shared.state();
            if !state.running || link.is_cancelled() {
                return;
            }
            state.session.clone()
        };

        let Some(session) = session else {
            return;
        };
        if session.is_cancelled() {
            return;
        }

        tracing::warn!(reason = %failure, "vad stream lost, reconnecting");
        tokio::spawn(async move {
            let _ = Self::reconnect_loop(shared, session).await;
        });
    }

    async fn keepalive_loop(writer: Arc<Mutex<WsSink>>, interval: Duration, link: CancellationToken) {
        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);

        loop {
            tokio::select! {
                () = link.cancelled() => return,
                _ = ticker.tick() => {
                    let sent = writer
                        .lock()
                        .await
                        .send(Message::Ping(Default::default()))
                        .await;
                    if let Err(e) = sent {
                        tracing::debug!(error = %e, "vad ping failed");
                        return;
                    }
                }
            }
        }
    }

    async fn reconnect_loop(shared: Arc<Self>, session: CancellationToken) -> Result<()> {
        let Some(_flight) = ReconnectFlight::acquire(&shared.reconnecting) else {
            tracing::debug!("vad reconnect already in progress");
            return Err(Error::Vad("reconnect already in progress".to_string()));
        };

        let policy = shared.config.reconnect.clone();
        let mut attempt = 0;

        loop {
            if policy.max_attempts > 0 && attempt >= policy.max_attempts {
                tracing::error!(attempts = attempt, "giving up vad reconnection");
                let (stale, stale_stream) = {
                    let mut state = shared.state_mut();
                    state.running = false;
                    state.link = LinkState::Idle;
                    (state.writer.take(), state.stream.take())
                };
                if let Some(stale_stream) = stale_stream {
                    stale_stream.cancel();
                }
                drop(stale);

                if let Some(on_error) = shared.handlers().on_error {
                    on_error(Error::ReconnectExhausted(policy.max_attempts));
                }
                return Err(Error::ReconnectExhausted(policy.max_attempts));
            }

            let wait = policy.delay_for_attempt(attempt);
            attempt += 1;
            shared.state_mut().link = LinkState::Backoff(attempt);
            tracing::info!(attempt, wait = ?wait, "attempting vad reconnection");

            tokio::select! {
                () = session.cancelled() => return Err(Error::Vad("reconnect cancelled".to_string())),
                () = tokio::time::sleep(wait) => {}
            }

            shared.state_mut().link = LinkState::Connecting;
            let dialed = tokio::select! {
                () = session.cancelled() => return Err(Error::Vad("reconnect cancelled".to_string())),
                dialed = shared.dial() => dialed,
            };

            match dialed {
                Ok(stream) => {
                    if session.is_cancelled() {
                        return Err(Error::Vad("reconnect cancelled".to_string()));
                    }
                    Self::start_connection(&shared, stream, &session);
                    tracing::info!(attempts = attempt, "vad client reconnected");

                    if let Some(on_reconnected) = shared.handlers().on_reconnected {
                        on_reconnected();
                    }
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "vad reconnection failed");
                }
            }
        }
    }

    fn handle_text(&self, text: &str) {
        let event = match decode_event(text) {
            Ok(Some(event)) => event,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(error = %e, "failed to parse vad event");
                return;
            }
        };

        tracing::debug!(kind = event.kind(), "vad event");
        let handlers = self.handlers();

        match event {
            VadEvent::SpeechStart(signal) => {
                if let Some(handler) = handlers.on_speech_start {
                    handler(signal);
                }
            }
            VadEvent::SpeechEnd(signal) => {
                if let Some(handler) = handlers.on_speech_end {
                    handler(signal);
                }
            }
            VadEvent::Interrupt(signal) => {
                tracing::info!(confidence = signal.confidence, "user interrupt during playback");
                if let Some(handler) = handlers.on_interrupt {
                    handler(signal);
                }
            }
            VadEvent::Error { timestamp, message } => {
                tracing::error!(timestamp, message = ?message, "vad server reported error");
                if let Some(handler) = handlers.on_error {
                    handler(Error::VadServer { timestamp, message });
                }
            }
            VadEvent::WakeWord(signal) => {
                if let Some(handler) = handlers.on_wake_word {
                    handler(signal);
                }
            }
        }
    }
}

/// HTTP base of a WebSocket endpoint: `ws://host:port/path` → `http://host:port`
///
/// # Errors
///
/// Returns error if the endpoint is not a valid ws/wss/http/https URL
pub fn derive_http_base(endpoint: &str) -> Result<String> {
    let mut url = url::Url::parse(endpoint)
        .map_err(|e| Error::Config(format!("invalid vad endpoint {endpoint}: {e}")))?;

    let scheme = match url.scheme() {
        "ws" | "http" => "http",
        "wss" | "https" => "https",
        other => {
            return Err(Error::Config(format!(
                "unsupported vad endpoint scheme: {other}"
            )));
        }
    };

    url.set_scheme(scheme)
        .map_err(|()| Error::Config(format!("cannot derive http url from {endpoint}")))?;
    url.set_path("");
    url.set_query(None);
    url.set_fragment(None);

    Ok(url.as_str().trim_end_matches('/').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    // -- derive_http_base -----------------------------------------------------

    #[test]
    fn derives_http_from_ws() {
        assert_eq!(
            derive_http_base("ws://127.0.0.1:8880/v1/vad/stream").unwrap(),
            "http://127.0.0.1:8880"
        );
    }

    #[test]
    fn derives_https_from_wss() {
        assert_eq!(
            derive_http_base("wss://vad.example.com/v1/vad/stream?token=x").unwrap(),
            "https://vad.example.com"
        );
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!(derive_http_base("ftp://host/vad").is_err());
        assert!(derive_http_base("not a url").is_err());
    }

    #[test]
    fn explicit_http_base_wins() {
        let client = VadClient::new(VadConfig {
            http_base_url: Some("http://10.0.0.2:9000/".to_string()),
            ..VadConfig::default()
        })
        .unwrap();
        assert_eq!(client.http_base_url(), "http://10.0.0.2:9000");
    }

    // -- ReconnectPolicy ------------------------------------------------------

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = ReconnectPolicy {
            initial_wait: Duration::from_secs(2),
            max_wait: Duration::from_secs(30),
            max_attempts: 10,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(16));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(30));
    }

    // -- single flight --------------------------------------------------------

    #[test]
    fn reconnect_flight_is_exclusive() {
        let flag = AtomicBool::new(false);
        let first = ReconnectFlight::acquire(&flag);
        assert!(first.is_some());
        assert!(ReconnectFlight::acquire(&flag).is_none());
        drop(first);
        assert!(ReconnectFlight::acquire(&flag).is_some());
    }

    // -- disconnected client --------------------------------------------------

    #[tokio::test]
    async fn send_without_connection_fails() {
        let client = VadClient::new(VadConfig::default()).unwrap();
        assert!(matches!(
            client.send_audio_frame(&[0u8; 4]).await,
            Err(Error::NotConnected)
        ));
        assert!(!client.is_connected());
        assert_eq!(client.link_state(), LinkState::Idle);
        assert_eq!(client.current_mode(), VadMode::Full);
    }

    #[tokio::test]
    async fn close_without_connection_is_noop() {
        let client = VadClient::new(VadConfig::default()).unwrap();
        client.close().await.unwrap();
        assert!(!client.is_running());
    }

    #[test]
    fn server_error_event_reaches_error_handler() {
        let client = VadClient::new(VadConfig::default()).unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        client.set_handlers(VadHandlers {
            on_error: Some(Arc::new(move |e| tx.send(e.to_string()).unwrap())),
            ..VadHandlers::default()
        });

        client
            .shared
            .handle_text(r#"{"type":"error","timestamp":1.5,"message":"overloaded"}"#);
        assert_eq!(
            rx.try_recv().unwrap(),
            "vad server error at timestamp 1.500: overloaded"
        );
    }
}
