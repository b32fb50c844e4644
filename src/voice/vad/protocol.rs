//! VAD wire protocol
//!
//! Inbound JSON events are decoded once here into [`VadEvent`]; nothing past
//! this module looks at raw payloads.

use std::time::Duration;

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Detector operating mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VadMode {
    /// Normal detection thresholds
    #[default]
    Full,
    /// Raised threshold while assistant audio plays
    Playback,
}

impl VadMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Full => "FULL",
            Self::Playback => "PLAYBACK",
        }
    }
}

impl std::fmt::Display for VadMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for VadMode {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "FULL" => Ok(Self::Full),
            "PLAYBACK" => Ok(Self::Playback),
            other => Err(crate::Error::Vad(format!("unknown vad mode: {other}"))),
        }
    }
}

/// Body of the mode request and response
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModeMessage {
    pub mode: VadMode,
}

/// A speech boundary reported by the detector
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpeechSignal {
    /// Server-side timestamp (seconds)
    pub timestamp: f64,
    /// Detector confidence in `[0, 1]`
    pub confidence: f64,
    /// Length of the speech segment
    pub duration: Option<Duration>,
    /// Length of the attached audio
    pub audio_length: Option<Duration>,
    /// Captured audio, already decoded; `None` when absent or undecodable
    pub audio: Option<Vec<u8>>,
}

impl SpeechSignal {
    /// Best known length of the utterance
    #[must_use]
    pub fn speech_duration(&self) -> Option<Duration> {
        self.duration.or(self.audio_length)
    }
}

/// A wake word spotted by the detector
#[derive(Debug, Clone, PartialEq)]
pub struct WakeSignal {
    pub timestamp: f64,
    pub wake_word: String,
    pub confidence: f64,
}

/// Decoded inbound event
#[derive(Debug, Clone, PartialEq)]
pub enum VadEvent {
    SpeechStart(SpeechSignal),
    SpeechEnd(SpeechSignal),
    /// User spoke over assistant playback
    Interrupt(SpeechSignal),
    Error {
        timestamp: f64,
        message: Option<String>,
    },
    WakeWord(WakeSignal),
}

impl VadEvent {
    /// Wire name of the event type
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::SpeechStart(_) => "speech_start",
            Self::SpeechEnd(_) => "speech_end",
            Self::Interrupt(_) => "interrupt",
            Self::Error { .. } => "error",
            Self::WakeWord(_) => "wake_word",
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    timestamp: f64,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    audio_base64: Option<String>,
    #[serde(default)]
    audio_length_ms: Option<f64>,
    #[serde(default)]
    duration_ms: Option<f64>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    wake_word: Option<String>,
}

fn millis(value: Option<f64>) -> Option<Duration> {
    value
        .filter(|ms| ms.is_finite() && *ms > 0.0)
        .map(|ms| Duration::from_secs_f64(ms / 1000.0))
}

fn decode_audio(kind: &str, payload: Option<&str>) -> Option<Vec<u8>> {
    let payload = payload.filter(|p| !p.is_empty())?;
    match base64::engine::general_purpose::STANDARD.decode(payload) {
        Ok(audio) => Some(audio),
        Err(e) => {
            tracing::warn!(event = kind, error = %e, "undecodable audio payload, delivering event without audio");
            None
        }
    }
}

impl WireEvent {
    fn into_signal(self) -> SpeechSignal {
        let audio = decode_audio(&self.kind, self.audio_base64.as_deref());
        SpeechSignal {
            timestamp: self.timestamp,
            confidence: self.confidence.clamp(0.0, 1.0),
            duration: millis(self.duration_ms),
            audio_length: millis(self.audio_length_ms),
            audio,
        }
    }
}

/// Decode one text frame
///
/// Unknown event types decode to `Ok(None)`.
///
/// # Errors
///
/// Returns error if the frame is not a JSON event object
pub fn decode_event(text: &str) -> Result<Option<VadEvent>> {
    let wire: WireEvent = serde_json::from_str(text)?;

    let event = match wire.kind.as_str() {
        "speech_start" => VadEvent::SpeechStart(wire.into_signal()),
        "speech_end" => VadEvent::SpeechEnd(wire.into_signal()),
        "interrupt" => VadEvent::Interrupt(wire.into_signal()),
        "error" => VadEvent::Error {
            timestamp: wire.timestamp,
            message: wire.message.filter(|m| !m.is_empty()),
        },
        "wake_word" => match wire.wake_word {
            Some(wake_word) if !wake_word.is_empty() => VadEvent::WakeWord(WakeSignal {
                timestamp: wire.timestamp,
                wake_word,
                confidence: wire.confidence.clamp(0.0, 1.0),
            }),
            _ => return Ok(None),
        },
        other => {
            tracing::debug!(kind = other, "ignoring unknown vad event type");
            return Ok(None);
        }
    };

    Ok(Some(event))
}
