//! TOML configuration file loading
//!
//! Supports `~/.config/omni/beacon/voice.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct VoiceConfigFile {
    /// Voice and audio cache
    #[serde(default)]
    pub voice: VoiceFileConfig,

    /// Conversation timing
    #[serde(default)]
    pub conversation: ConversationFileConfig,

    /// Voice activity detection
    #[serde(default)]
    pub vad: VadFileConfig,

    /// Wake word detection
    #[serde(default)]
    pub wake_word: WakeWordFileConfig,

    /// Speech synthesis sidecar
    #[serde(default)]
    pub tts: TtsFileConfig,
}

/// Voice and audio cache configuration
#[derive(Debug, Default, Deserialize)]
pub struct VoiceFileConfig {
    /// Directory holding pre-generated clips
    pub cache_dir: Option<String>,

    /// TTS voice identifier (e.g. "am_adam")
    pub voice_id: Option<String>,

    /// TTS model (e.g. "kokoro")
    pub model: Option<String>,

    /// TTS speed multiplier
    pub speed: Option<f64>,

    /// Output sample rate in Hz
    pub sample_rate: Option<u32>,

    /// Assistant name used in introductions
    pub persona_name: Option<String>,

    /// Load cached clips into memory at startup
    pub preload: Option<bool>,
}

/// Conversation timing configuration
#[derive(Debug, Default, Deserialize)]
pub struct ConversationFileConfig {
    pub warm_timeout_secs: Option<u64>,
    pub active_timeout_secs: Option<u64>,
    pub backchannel_min_ms: Option<u64>,
    pub confidence_threshold: Option<f64>,
    pub backchannel_cooldown_ms: Option<u64>,
    pub long_speech_ms: Option<u64>,
    pub backchannel_probability: Option<f64>,
}

/// VAD configuration
#[derive(Debug, Default, Deserialize)]
pub struct VadFileConfig {
    pub enabled: Option<bool>,

    /// WebSocket stream endpoint
    pub endpoint: Option<String>,

    /// Mode control base URL (derived from the endpoint when unset)
    pub http_url: Option<String>,

    pub reconnect_wait_ms: Option<u64>,
    pub max_reconnects: Option<u32>,
    pub ping_interval_secs: Option<u64>,
    pub http_timeout_secs: Option<u64>,
}

/// Wake word configuration
#[derive(Debug, Default, Deserialize)]
pub struct WakeWordFileConfig {
    pub enabled: Option<bool>,
    pub wake_words: Option<Vec<String>>,
    pub threshold: Option<f64>,

    /// Wake word → persona name
    #[serde(default)]
    pub personas: HashMap<String, String>,
}

/// Speech synthesis configuration
#[derive(Debug, Default, Deserialize)]
pub struct TtsFileConfig {
    /// OpenAI-compatible server base URL
    pub url: Option<String>,
    pub api_key: Option<String>,

    /// Response format requested from the server (e.g. "wav")
    pub response_format: Option<String>,
    pub timeout_secs: Option<u64>,
}

/// Load the TOML config file from the standard path
///
/// Returns `VoiceConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> VoiceConfigFile {
    config_file_path().map_or_else(VoiceConfigFile::default, |path| load_from(&path))
}

/// Load a TOML config file from `path`, falling back to defaults
pub fn load_from(path: &Path) -> VoiceConfigFile {
    if !path.exists() {
        return VoiceConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                VoiceConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            VoiceConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/omni/beacon/voice.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| {
        d.config_dir()
            .join("omni")
            .join("beacon")
            .join("voice.toml")
    })
}
