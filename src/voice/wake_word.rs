//! Wake word detection
//!
//! Filters detector hits arriving on the VAD stream against the configured
//! wake words and threshold. Setups without a hotword model can instead run
//! STT transcripts through [`WakeWordClient::check_transcript`].

use std::collections::HashSet;
use std::sync::{PoisonError, RwLock};

use crate::events::{WakeDetection, WakeDetectionHandler};
use crate::voice::vad::WakeSignal;
use crate::{Error, Result};

/// Wake word client configuration
#[derive(Debug, Clone)]
pub struct WakeWordConfig {
    pub enabled: bool,
    /// Trigger phrases, e.g. `hey orin` or `hey_orin`
    pub wake_words: Vec<String>,
    /// Minimum detector confidence
    pub threshold: f64,
}

impl Default for WakeWordConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            wake_words: vec!["hey_orin".to_string(), "orin".to_string()],
            threshold: 0.5,
        }
    }
}

/// Canonical form of a wake word: trimmed, lowercase, words joined by `_`
#[must_use]
pub fn normalize(word: &str) -> String {
    word.split(|c: char| c.is_whitespace() || c == '_' || c == '-')
        .filter(|part| !part.is_empty())
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join("_")
}

/// Recognizes trigger phrases before the full pipeline engages
pub struct WakeWordClient {
    enabled: bool,
    wake_words: Vec<String>,
    threshold: f64,
    on_wake_word: RwLock<Option<WakeDetectionHandler>>,
}

impl WakeWordClient {
    /// Create a new wake word client
    ///
    /// # Errors
    ///
    /// Returns error if enabled with no usable wake words, or the threshold is
    /// outside `[0, 1]`
    pub fn new(config: WakeWordConfig) -> Result<Self> {
        let mut seen = HashSet::new();
        let wake_words: Vec<String> = config
            .wake_words
            .iter()
            .map(|w| normalize(w))
            .filter(|w| !w.is_empty() && seen.insert(w.clone()))
            .collect();

        if config.enabled && wake_words.is_empty() {
            return Err(Error::WakeWord("no wake words configured".to_string()));
        }

        if !(0.0..=1.0).contains(&config.threshold) {
            return Err(Error::WakeWord(format!(
                "threshold must be within [0, 1], got {}",
                config.threshold
            )));
        }

        tracing::debug!(wake_words = ?wake_words, threshold = config.threshold, "wake word client initialized");

        Ok(Self {
            enabled: config.enabled,
            wake_words,
            threshold: config.threshold,
            on_wake_word: RwLock::new(None),
        })
    }

    /// Register the detection observer
    pub fn on_wake_word(&self, handler: WakeDetectionHandler) {
        *self
            .on_wake_word
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    /// Get the configured wake words
    #[must_use]
    pub fn wake_words(&self) -> &[String] {
        &self.wake_words
    }

    #[must_use]
    pub const fn threshold(&self) -> f64 {
        self.threshold
    }

    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether `word` is one of the configured wake words
    #[must_use]
    pub fn matches(&self, word: &str) -> bool {
        let word = normalize(word);
        self.wake_words.iter().any(|w| *w == word)
    }

    /// Filter a detector hit; fires the observer and returns the detection
    /// when it passes
    pub fn handle_event(&self, signal: &WakeSignal) -> Option<WakeDetection> {
        if !self.enabled {
            return None;
        }

        let wake_word = normalize(&signal.wake_word);
        if !self.wake_words.contains(&wake_word) {
            tracing::debug!(wake_word = %wake_word, "ignoring unconfigured wake word");
            return None;
        }

        if signal.confidence < self.threshold {
            tracing::debug!(
                wake_word = %wake_word,
                confidence = signal.confidence,
                threshold = self.threshold,
                "wake word below threshold"
            );
            return None;
        }

        Some(self.detected(wake_word, signal.confidence))
    }

    /// Check if transcribed text contains a wake word
    ///
    /// Longer phrases win, so "hey orin" reports `hey_orin` rather than `orin`.
    pub fn check_transcript(&self, transcript: &str) -> Option<WakeDetection> {
        if !self.enabled {
            return None;
        }

        let tokens: Vec<String> = transcript
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase)
            .collect();

        let mut candidates: Vec<&String> = self.wake_words.iter().collect();
        candidates.sort_by_key(|w| std::cmp::Reverse(w.split('_').count()));

        let found = candidates.into_iter().find(|word| {
            let parts: Vec<&str> = word.split('_').collect();
            tokens
                .windows(parts.len())
                .any(|window| window.iter().zip(&parts).all(|(t, p)| t == p))
        })?;

        tracing::info!(wake_word = %found, transcript, "wake word detected in transcript");
        Some(self.detected(found.clone(), 1.0))
    }

    fn detected(&self, wake_word: String, confidence: f64) -> WakeDetection {
        let detection = WakeDetection {
            wake_word,
            confidence,
        };

        let handler = self
            .on_wake_word
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(handler) = handler {
            handler(detection.clone());
        }

        detection
    }
}
