//! Audio playback collaborator
//!
//! The conversation core never touches an output device directly. It drives
//! whatever implements [`AudioPlayer`]: the speaker backend behind the
//! `device-audio` feature, a UI bridge, or a test double.

use std::sync::Arc;

use async_trait::async_trait;

use crate::Result;

/// Hook invoked on playback transitions
pub type PlaybackHook = Arc<dyn Fn() + Send + Sync>;

/// Playback transition callbacks
///
/// Used by the coordinator to lower VAD sensitivity while the assistant talks.
#[derive(Clone, Default)]
pub struct PlaybackCallbacks {
    /// Called when audio starts playing
    pub on_playback_start: Option<PlaybackHook>,
    /// Called when audio finishes or is stopped
    pub on_playback_end: Option<PlaybackHook>,
}

impl PlaybackCallbacks {
    /// Fire the start hook, if any
    pub fn playback_started(&self) {
        if let Some(hook) = &self.on_playback_start {
            hook();
        }
    }

    /// Fire the end hook, if any
    pub fn playback_ended(&self) {
        if let Some(hook) = &self.on_playback_end {
            hook();
        }
    }
}

impl std::fmt::Debug for PlaybackCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackCallbacks")
            .field("on_playback_start", &self.on_playback_start.is_some())
            .field("on_playback_end", &self.on_playback_end.is_some())
            .finish()
    }
}

/// Plays encoded audio clips and supports immediate interruption
#[async_trait]
pub trait AudioPlayer: Send + Sync {
    /// Stop current playback immediately
    fn stop(&self);

    /// Whether audio is currently playing
    fn is_playing(&self) -> bool;

    /// Play an encoded clip, resolving when playback finishes or is stopped
    ///
    /// # Errors
    ///
    /// Returns error if the clip cannot be decoded or the device fails
    async fn play_bytes(&self, data: &[u8]) -> Result<()>;

    /// Register playback transition callbacks, replacing earlier ones
    fn set_callbacks(&self, callbacks: PlaybackCallbacks);
}
