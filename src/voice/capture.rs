//! Audio capture from microphone

use std::sync::mpsc as std_mpsc;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use tokio::sync::mpsc;

use super::source::{AudioSource, DEFAULT_FRAME_BYTES};
use crate::{Error, Result};

/// Sample rate for audio capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// Streams 16 kHz mono PCM16 frames from the default input device
///
/// The cpal stream lives on its own thread; dropping or closing the source
/// stops it.
pub struct MicrophoneSource {
    samples: mpsc::UnboundedReceiver<Vec<u8>>,
    pending: Vec<u8>,
    frame_bytes: usize,
    shutdown: Option<std_mpsc::Sender<()>>,
}

impl MicrophoneSource {
    /// Open the default input device
    ///
    /// # Errors
    ///
    /// Returns error if no suitable input device can be opened
    pub fn open(frame_bytes: usize) -> Result<Self> {
        let (sample_tx, samples) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (shutdown, shutdown_rx) = std_mpsc::channel::<()>();

        std::thread::Builder::new()
            .name("beacon-voice-capture".to_string())
            .spawn(move || {
                let stream = match build_stream(sample_tx) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                // Runs until closed or the source is dropped
                let _ = shutdown_rx.recv();
                drop(stream);
                tracing::debug!("audio capture stopped");
            })?;

        ready_rx
            .recv()
            .map_err(|_| Error::Audio("capture thread exited during setup".to_string()))??;

        Ok(Self {
            samples,
            pending: Vec::new(),
            frame_bytes: if frame_bytes == 0 {
                DEFAULT_FRAME_BYTES
            } else {
                frame_bytes
            },
            shutdown: Some(shutdown),
        })
    }
}

fn build_stream(sample_tx: mpsc::UnboundedSender<Vec<u8>>) -> Result<cpal::Stream> {
    let device = cpal::default_host()
        .default_input_device()
        .ok_or_else(|| Error::Audio("no input device available".to_string()))?;

    let config: StreamConfig = device
        .supported_input_configs()
        .map_err(|e| Error::Audio(e.to_string()))?
        .find(|c| {
            c.channels() == 1
                && c.min_sample_rate() <= SampleRate(SAMPLE_RATE)
                && c.max_sample_rate() >= SampleRate(SAMPLE_RATE)
        })
        .ok_or_else(|| Error::Audio("no suitable audio config found".to_string()))?
        .with_sample_rate(SampleRate(SAMPLE_RATE))
        .config();

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate = SAMPLE_RATE,
        "audio capture initialized"
    );

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let _ = sample_tx.send(samples_to_pcm16(data));
            },
            |err| tracing::error!(error = %err, "audio capture error"),
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))?;

    stream.play().map_err(|e| Error::Audio(e.to_string()))?;
    Ok(stream)
}

/// Convert f32 samples to little-endian PCM16
#[must_use]
pub fn samples_to_pcm16(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|&sample| {
            #[allow(clippy::cast_possible_truncation)]
            let sample = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            sample.to_le_bytes()
        })
        .collect()
}

#[async_trait]
impl AudioSource for MicrophoneSource {
    async fn read_frame(&mut self) -> Result<Vec<u8>> {
        while self.pending.len() < self.frame_bytes {
            match self.samples.recv().await {
                Some(chunk) => self.pending.extend_from_slice(&chunk),
                None if self.pending.is_empty() => return Err(Error::EndOfStream),
                None => break,
            }
        }

        let take = self.frame_bytes.min(self.pending.len());
        Ok(self.pending.drain(..take).collect())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.samples.close();
        Ok(())
    }
}

impl Drop for MicrophoneSource {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}
