//! Voice conversation core
//!
//! State machine, audio cache, VAD and wake word clients, and the
//! coordinator that ties them together. Output devices, microphones and TTS
//! engines sit behind the [`AudioPlayer`], [`AudioSource`] and
//! [`SpeechSynthesizer`] traits.

mod cache;
#[cfg(feature = "device-audio")]
mod capture;
mod coordinator;
#[cfg(feature = "device-audio")]
mod playback;
mod player;
mod responses;
mod source;
mod state;
mod tts;
pub mod vad;
mod wake_word;

pub use cache::{
    AudioCache, AudioCacheConfig, CacheManifest, CacheStats, CachedPhrase, MANIFEST_FILE,
    MANIFEST_VERSION,
};
#[cfg(feature = "device-audio")]
pub use capture::{MicrophoneSource, SAMPLE_RATE, samples_to_pcm16};
pub use coordinator::{
    ConversationContext, ConversationCoordinator, CoordinatorConfig, PCM_BYTES_PER_SECOND,
    SpeechCapture, SpeechDetectedHandler, pcm_duration,
};
#[cfg(feature = "device-audio")]
pub use playback::{Clip, DevicePlayer, decode_clip};
pub use player::{AudioPlayer, PlaybackCallbacks, PlaybackHook};
pub use responses::{
    HourWindow, NAME_PLACEHOLDER, ResponseCategory, WakeResponse, WakeResponsePool,
};
pub use source::{AudioSource, DEFAULT_FRAME_BYTES, ReaderSource};
pub use state::{
    ConversationState, ConversationStateMachine, Formality, SessionClock, StateConfig,
};
pub use tts::{HttpSynthesizer, SpeechSynthesizer};
pub use vad::{LinkState, ReconnectPolicy, VadClient, VadConfig, VadHandlers, VadMode};
pub use wake_word::{WakeWordClient, WakeWordConfig, normalize as normalize_wake_word};
