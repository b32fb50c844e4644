//! Text-to-speech (TTS) generation

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::{Error, Result};

/// Generates spoken audio for a piece of text
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Synthesize `text` with `voice_id` and write the clip to `output`
    ///
    /// # Errors
    ///
    /// Returns error if synthesis or the file write fails
    async fn synthesize_to_file(&self, text: &str, output: &Path, voice_id: &str) -> Result<()>;
}

/// Synthesizes speech through an OpenAI-compatible `/v1/audio/speech` endpoint
///
/// Works against the local voice sidecar (Kokoro) as well as hosted providers.
pub struct HttpSynthesizer {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    speed: f64,
    response_format: String,
}

impl HttpSynthesizer {
    /// Create a new synthesizer
    ///
    /// # Errors
    ///
    /// Returns error if the base URL is empty or the HTTP client cannot be built
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        model: String,
        speed: f64,
        timeout: Duration,
    ) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(Error::Config("TTS base URL required".to_string()));
        }

        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url,
            api_key: api_key.filter(|k| !k.is_empty()),
            model,
            speed,
            response_format: "wav".to_string(),
        })
    }

    /// Override the requested audio container (default `wav`)
    #[must_use]
    pub fn with_response_format(mut self, format: impl Into<String>) -> Self {
        self.response_format = format.into();
        self
    }

    /// Synthesize text to audio bytes
    ///
    /// # Errors
    ///
    /// Returns error if the request fails or the service rejects it
    pub async fn synthesize(&self, text: &str, voice_id: &str) -> Result<Vec<u8>> {
        #[derive(serde::Serialize)]
        struct SpeechRequest<'a> {
            model: &'a str,
            input: &'a str,
            voice: &'a str,
            speed: f64,
            response_format: &'a str,
        }

        if text.trim().is_empty() {
            return Err(Error::Tts("cannot synthesize empty text".to_string()));
        }

        let request = SpeechRequest {
            model: &self.model,
            input: text,
            voice: voice_id,
            speed: self.speed,
            response_format: &self.response_format,
        };

        let mut builder = self
            .client
            .post(format!("{}/v1/audio/speech", self.base_url))
            .json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            tracing::error!(error = %e, "TTS request failed");
            e
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Tts(format!("TTS error {status}: {body}")));
        }

        let audio = response.bytes().await?;
        tracing::debug!(bytes = audio.len(), voice = voice_id, "synthesized speech");
        Ok(audio.to_vec())
    }
}

#[async_trait]
impl SpeechSynthesizer for HttpSynthesizer {
    async fn synthesize_to_file(&self, text: &str, output: &Path, voice_id: &str) -> Result<()> {
        let audio = self.synthesize(text, voice_id).await?;
        tokio::fs::write(output, audio).await?;
        Ok(())
    }
}
