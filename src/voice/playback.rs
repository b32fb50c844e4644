//! Audio playback to speakers

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};

use super::player::{AudioPlayer, PlaybackCallbacks};
use crate::{Error, Result};

/// Decoded mono clip
#[derive(Debug, Clone, PartialEq)]
pub struct Clip {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// Plays cached and synthesized clips on the default output device
///
/// Each clip plays on a blocking worker; [`AudioPlayer::stop`] cuts it off
/// at the next device callback.
#[derive(Default)]
pub struct DevicePlayer {
    playing: AtomicBool,
    current: Mutex<Option<Arc<AtomicBool>>>,
    callbacks: RwLock<PlaybackCallbacks>,
}

impl DevicePlayer {
    /// Create a player, checking that an output device exists
    ///
    /// # Errors
    ///
    /// Returns error if no output device is available
    pub fn new() -> Result<Self> {
        let device = cpal::default_host()
            .default_output_device()
            .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            "audio playback initialized"
        );

        Ok(Self::default())
    }

    fn callbacks(&self) -> PlaybackCallbacks {
        self.callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Clear the playing flag if `cancel` still belongs to the current clip
    fn finish(&self, cancel: &Arc<AtomicBool>) {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, cancel)) {
            *current = None;
            self.playing.store(false, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl AudioPlayer for DevicePlayer {
    fn stop(&self) {
        let current = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(cancel) = current {
            cancel.store(true, Ordering::SeqCst);
            tracing::debug!("playback stopped");
        }
        self.playing.store(false, Ordering::SeqCst);
    }

    fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    async fn play_bytes(&self, data: &[u8]) -> Result<()> {
        let clip = decode_clip(data)?;
        if clip.samples.is_empty() {
            return Ok(());
        }

        self.stop();
        let cancel = Arc::new(AtomicBool::new(false));
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&cancel));
        self.playing.store(true, Ordering::SeqCst);

        let callbacks = self.callbacks();
        callbacks.playback_started();

        let worker_cancel = Arc::clone(&cancel);
        let result = tokio::task::spawn_blocking(move || play_blocking(&clip, &worker_cancel))
            .await
            .map_err(|e| Error::Audio(format!("playback worker failed: {e}")))
            .and_then(|played| played);

        self.finish(&cancel);
        callbacks.playback_ended();
        result
    }

    fn set_callbacks(&self, callbacks: PlaybackCallbacks) {
        *self
            .callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner) = callbacks;
    }
}

/// Output config at `sample_rate`, preferring mono
fn output_config(device: &cpal::Device, sample_rate: u32) -> Result<StreamConfig> {
    let rate = SampleRate(sample_rate);
    let supports = |channels: u16| {
        device.supported_output_configs().ok()?.find(|c| {
            c.channels() == channels && c.min_sample_rate() <= rate && c.max_sample_rate() >= rate
        })
    };

    supports(1)
        .or_else(|| supports(2))
        .map(|c| c.with_sample_rate(rate).config())
        .ok_or_else(|| Error::Audio(format!("no output config for {sample_rate} Hz")))
}

fn play_blocking(clip: &Clip, cancel: &Arc<AtomicBool>) -> Result<()> {
    let device = cpal::default_host()
        .default_output_device()
        .ok_or_else(|| Error::Audio("no output device".to_string()))?;
    let config = output_config(&device, clip.sample_rate)?;
    let channels = usize::from(config.channels);

    let samples: Arc<[f32]> = clip.samples.clone().into();
    let position = Arc::new(AtomicUsize::new(0));

    let stream = {
        let samples = Arc::clone(&samples);
        let position = Arc::clone(&position);
        let cancel = Arc::clone(cancel);
        device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let stopped = cancel.load(Ordering::Relaxed);
                    let mut pos = position.load(Ordering::Relaxed);
                    for frame in data.chunks_mut(channels) {
                        let sample = if stopped { 0.0 } else { samples.get(pos).copied().unwrap_or(0.0) };
                        frame.fill(sample);
                        pos = pos.saturating_add(1);
                    }
                    position.store(pos, Ordering::Relaxed);
                },
                |err| tracing::error!(error = %err, "audio playback error"),
                None,
            )
            .map_err(|e| Error::Audio(e.to_string()))?
    };

    stream.play().map_err(|e| Error::Audio(e.to_string()))?;

    let length = u64::try_from(samples.len()).unwrap_or(u64::MAX);
    let timeout = Duration::from_millis(length.saturating_mul(1000) / u64::from(clip.sample_rate))
        + Duration::from_millis(500);
    let start = std::time::Instant::now();

    while position.load(Ordering::Relaxed) < samples.len()
        && !cancel.load(Ordering::Relaxed)
        && start.elapsed() < timeout
    {
        std::thread::sleep(Duration::from_millis(20));
    }

    drop(stream);
    tracing::debug!(
        samples = samples.len(),
        stopped = cancel.load(Ordering::Relaxed),
        "playback complete"
    );
    Ok(())
}

/// Decode a WAV or MP3 clip to mono f32 samples
///
/// # Errors
///
/// Returns error if the clip is neither 16-bit/float WAV nor MP3
pub fn decode_clip(data: &[u8]) -> Result<Clip> {
    if data.starts_with(b"RIFF") {
        decode_wav(data)
    } else {
        decode_mp3(data)
    }
}

fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    let scale = 1.0 / f32::from(u16::try_from(channels).unwrap_or(u16::MAX));
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() * scale)
        .collect()
}

fn decode_wav(data: &[u8]) -> Result<Clip> {
    let reader = hound::WavReader::new(Cursor::new(data))
        .map_err(|e| Error::Audio(format!("WAV decode error: {e}")))?;
    let spec = reader.spec();

    let interleaved: Vec<f32> = match (spec.sample_format, spec.bits_per_sample) {
        (hound::SampleFormat::Int, 16) => reader
            .into_samples::<i16>()
            .map(|s| s.map(|s| f32::from(s) / 32768.0))
            .collect::<std::result::Result<_, _>>(),
        (hound::SampleFormat::Float, 32) => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<_, _>>(),
        (format, bits) => {
            return Err(Error::Audio(format!(
                "unsupported WAV format: {format:?} {bits}-bit"
            )));
        }
    }
    .map_err(|e| Error::Audio(format!("WAV decode error: {e}")))?;

    Ok(Clip {
        samples: downmix(&interleaved, usize::from(spec.channels)),
        sample_rate: spec.sample_rate,
    })
}

fn decode_mp3(data: &[u8]) -> Result<Clip> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(data));
    let mut samples = Vec::new();
    let mut sample_rate = 0;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                sample_rate = u32::try_from(frame.sample_rate).unwrap_or(sample_rate);
                let interleaved: Vec<f32> =
                    frame.data.iter().map(|&s| f32::from(s) / 32768.0).collect();
                samples.extend(downmix(&interleaved, frame.channels));
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Audio(format!("MP3 decode error: {e}"))),
        }
    }

    if sample_rate == 0 {
        return Err(Error::Audio("no audio frames in clip".to_string()));
    }

    Ok(Clip {
        samples,
        sample_rate,
    })
}
