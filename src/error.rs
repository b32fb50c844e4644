//! Error types for the Beacon voice core

use thiserror::Error;

/// Result type alias for Beacon voice operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the voice core
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio device or playback error
    #[error("audio error: {0}")]
    Audio(String),

    /// Text-to-speech error
    #[error("TTS error: {0}")]
    Tts(String),

    /// VAD client error (transport, protocol, mode control)
    #[error("vad error: {0}")]
    Vad(String),

    /// Error event reported by the VAD server itself
    #[error("vad server error at timestamp {timestamp:.3}{}", detail(.message))]
    VadServer {
        /// Server-side timestamp of the failure (seconds)
        timestamp: f64,
        /// Optional server-provided description
        message: Option<String>,
    },

    /// Operation requires a live VAD connection
    #[error("vad client: not connected")]
    NotConnected,

    /// Reconnection gave up after the configured number of attempts
    #[error("vad client: max reconnection attempts ({0}) exceeded")]
    ReconnectExhausted(u32),

    /// Wake word detection error
    #[error("wake word error: {0}")]
    WakeWord(String),

    /// Audio cache error
    #[error("cache error: {0}")]
    Cache(String),

    /// Resource not found (e.g. a clip that is not cached)
    #[error("not found: {0}")]
    NotFound(String),

    /// Audio source has no more frames
    #[error("end of audio stream")]
    EndOfStream,

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// WebSocket error
    #[error("websocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}

fn detail(message: &Option<String>) -> String {
    message
        .as_deref()
        .map(|m| format!(": {m}"))
        .unwrap_or_default()
}

impl Error {
    /// Whether this error marks the end of an audio source
    #[must_use]
    pub const fn is_end_of_stream(&self) -> bool {
        matches!(self, Self::EndOfStream)
    }
}
