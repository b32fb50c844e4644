//! Configuration management for the Beacon voice core
//!
//! Every value resolves env > TOML file > default.

pub mod file;

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::Result;
use crate::voice::{
    AudioCacheConfig, CoordinatorConfig, HttpSynthesizer, ReconnectPolicy, StateConfig,
    VadConfig, WakeWordConfig,
};

use self::file::VoiceConfigFile;

/// Default speech synthesis server (Kokoro sidecar)
pub const DEFAULT_TTS_URL: &str = "http://127.0.0.1:8880";

/// Beacon voice configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory for pre-generated clips
    pub cache_dir: PathBuf,

    /// Voice the clips are generated with
    pub voice: AudioCacheConfig,

    /// Load cached clips into memory at startup
    pub preload_audio: bool,

    /// Conversation timing
    pub conversation: StateConfig,

    /// Enable continuous listening through the VAD sidecar
    pub vad_enabled: bool,

    /// VAD connection settings
    pub vad: VadConfig,

    /// Wake word filtering
    pub wake_word: WakeWordConfig,

    /// Wake word → persona name
    pub personas: HashMap<String, String>,

    /// Speech synthesis sidecar
    pub tts: TtsConfig,
}

/// Speech synthesis configuration
#[derive(Debug, Clone)]
pub struct TtsConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub response_format: Option<String>,
    pub timeout: Duration,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_TTS_URL.to_string(),
            api_key: None,
            response_format: None,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Default cache directory: `~/.cache/omni/beacon/voice`
#[must_use]
pub fn default_cache_dir() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from(".cache/omni/beacon/voice"),
        |d| d.cache_dir().join("omni").join("beacon").join("voice"),
    )
}

/// Parse a variable, warning and ignoring values that don't parse
fn parsed<T: FromStr>(env: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let raw = env(name)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(variable = name, value = %raw, "ignoring unparseable environment value");
            None
        }
    }
}

fn flag(env: &impl Fn(&str) -> Option<String>, name: &str) -> Option<bool> {
    env(name).map(|v| {
        let v = v.trim();
        v == "1" || v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("yes")
    })
}

impl Config {
    /// Load configuration from the environment and the standard config file
    ///
    /// # Errors
    ///
    /// Returns error if the resolved configuration is invalid
    pub fn load() -> Result<Self> {
        let fc = file::load_config_file();
        Self::from_sources(fc, |name| std::env::var(name).ok())
    }

    /// Resolve configuration from a parsed file and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if the resolved configuration is invalid
    pub fn from_sources(fc: VoiceConfigFile, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let voice_defaults = AudioCacheConfig::default();
        let voice = AudioCacheConfig {
            voice_id: env("BEACON_VOICE_ID")
                .or(fc.voice.voice_id)
                .unwrap_or(voice_defaults.voice_id),
            model: env("BEACON_TTS_MODEL")
                .or(fc.voice.model)
                .unwrap_or(voice_defaults.model),
            speed: parsed(&env, "BEACON_TTS_SPEED")
                .or(fc.voice.speed)
                .unwrap_or(voice_defaults.speed),
            sample_rate: fc.voice.sample_rate.unwrap_or(voice_defaults.sample_rate),
            persona_name: env("BEACON_PERSONA_NAME")
                .or(fc.voice.persona_name)
                .unwrap_or(voice_defaults.persona_name),
        };

        if !(0.25..=4.0).contains(&voice.speed) {
            return Err(crate::Error::Config(format!(
                "tts speed must be within [0.25, 4.0], got {}",
                voice.speed
            )));
        }

        let cache_dir = env("BEACON_VOICE_CACHE_DIR")
            .or(fc.voice.cache_dir)
            .map_or_else(default_cache_dir, PathBuf::from);

        let c = fc.conversation;
        let state_defaults = StateConfig::default();
        let conversation = StateConfig {
            warm_timeout: c
                .warm_timeout_secs
                .map_or(state_defaults.warm_timeout, Duration::from_secs),
            active_timeout: c
                .active_timeout_secs
                .map_or(state_defaults.active_timeout, Duration::from_secs),
            min_speech_for_backchannel: c
                .backchannel_min_ms
                .map_or(state_defaults.min_speech_for_backchannel, Duration::from_millis),
            confidence_threshold: c
                .confidence_threshold
                .unwrap_or(state_defaults.confidence_threshold),
            backchannel_cooldown: c
                .backchannel_cooldown_ms
                .map_or(state_defaults.backchannel_cooldown, Duration::from_millis),
            backchannel_long_speech: c
                .long_speech_ms
                .map_or(state_defaults.backchannel_long_speech, Duration::from_millis),
            backchannel_probability: c
                .backchannel_probability
                .unwrap_or(state_defaults.backchannel_probability)
                .clamp(0.0, 1.0),
        };

        let v = fc.vad;
        let vad_defaults = VadConfig::default();
        let reconnect_defaults = ReconnectPolicy::default();
        let vad = VadConfig {
            endpoint: env("BEACON_VAD_ENDPOINT")
                .or(v.endpoint)
                .unwrap_or(vad_defaults.endpoint),
            http_base_url: env("BEACON_VAD_HTTP_URL").or(v.http_url),
            reconnect: ReconnectPolicy {
                initial_wait: v
                    .reconnect_wait_ms
                    .map_or(reconnect_defaults.initial_wait, Duration::from_millis),
                max_attempts: parsed(&env, "BEACON_VAD_MAX_RECONNECTS")
                    .or(v.max_reconnects)
                    .unwrap_or(reconnect_defaults.max_attempts),
                ..reconnect_defaults
            },
            ping_interval: v
                .ping_interval_secs
                .map_or(vad_defaults.ping_interval, Duration::from_secs),
            http_timeout: v
                .http_timeout_secs
                .map_or(vad_defaults.http_timeout, Duration::from_secs),
            ..vad_defaults
        };
        let vad_enabled = flag(&env, "BEACON_VAD_ENABLED")
            .or(v.enabled)
            .unwrap_or(false);

        let w = fc.wake_word;
        let wake_defaults = WakeWordConfig::default();
        let wake_word = WakeWordConfig {
            enabled: w.enabled.unwrap_or(wake_defaults.enabled),
            wake_words: env("BEACON_WAKE_WORDS")
                .map(|list| {
                    list.split(',')
                        .map(str::trim)
                        .filter(|w| !w.is_empty())
                        .map(String::from)
                        .collect()
                })
                .or(w.wake_words)
                .unwrap_or(wake_defaults.wake_words),
            threshold: w.threshold.unwrap_or(wake_defaults.threshold),
        };

        let t = fc.tts;
        let tts_defaults = TtsConfig::default();
        let tts = TtsConfig {
            base_url: env("BEACON_TTS_URL")
                .or(t.url)
                .unwrap_or(tts_defaults.base_url),
            api_key: env("BEACON_TTS_API_KEY").or(t.api_key),
            response_format: t.response_format,
            timeout: t
                .timeout_secs
                .map_or(tts_defaults.timeout, Duration::from_secs),
        };

        Ok(Self {
            cache_dir,
            voice,
            preload_audio: fc.voice.preload.unwrap_or(true),
            conversation,
            vad_enabled,
            vad,
            wake_word,
            personas: w.personas,
            tts,
        })
    }

    /// Coordinator settings derived from this configuration
    #[must_use]
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            cache_dir: self.cache_dir.clone(),
            cache: self.voice.clone(),
            state: self.conversation.clone(),
            preload_audio: self.preload_audio,
            vad: self.vad_enabled.then(|| self.vad.clone()),
            wake_word: Some(self.wake_word.clone()),
            personas: self.personas.clone(),
            ..CoordinatorConfig::default()
        }
    }

    /// Build the speech synthesis client
    ///
    /// # Errors
    ///
    /// Returns error if the TTS URL is empty or the client cannot be built
    pub fn synthesizer(&self) -> Result<HttpSynthesizer> {
        let synthesizer = HttpSynthesizer::new(
            &self.tts.base_url,
            self.tts.api_key.clone(),
            self.voice.model.clone(),
            self.voice.speed,
            self.tts.timeout,
        )?;

        Ok(match &self.tts.response_format {
            Some(format) => synthesizer.with_response_format(format.clone()),
            None => synthesizer,
        })
    }
}
