//! Event surface produced by the conversation core
//!
//! Three observers exist: UI synchronization events, conversation state
//! changes, and wake word detections. Observer dispatch is best-effort and
//! never happens while an internal lock is held.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::voice::ConversationState;

/// Kind of UI synchronization event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UiEventType {
    /// Waiting for (or receiving) user speech
    Listening,
    /// User finished speaking; a response is being prepared
    Processing,
    /// Assistant audio is playing
    Speaking,
    /// Nothing in progress
    Idle,
}

impl UiEventType {
    /// Wire name of the event type
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Listening => "listening",
            Self::Processing => "processing",
            Self::Speaking => "speaking",
            Self::Idle => "idle",
        }
    }
}

impl std::fmt::Display for UiEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A UI synchronization event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UiEvent {
    /// What happened
    #[serde(rename = "eventType")]
    pub event_type: UiEventType,
    /// Conversation state at the time of the event
    #[serde(rename = "currentState")]
    pub state: ConversationState,
    /// When the event was emitted
    pub timestamp: DateTime<Utc>,
}

impl UiEvent {
    /// Create an event stamped with the current time
    #[must_use]
    pub fn now(event_type: UiEventType, state: ConversationState) -> Self {
        Self {
            event_type,
            state,
            timestamp: Utc::now(),
        }
    }
}

/// A wake word detection forwarded to external subscribers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WakeDetection {
    /// Normalized wake word (e.g. `hey_orin`)
    #[serde(rename = "wakeWord")]
    pub wake_word: String,
    /// Detector confidence in `[0, 1]`
    pub confidence: f64,
}

/// Observer for UI events
pub type UiEventHandler = Arc<dyn Fn(UiEvent) + Send + Sync>;

/// Observer for conversation state transitions `(old, new)`
pub type StateChangeHandler = Arc<dyn Fn(ConversationState, ConversationState) + Send + Sync>;

/// Observer for wake word detections
pub type WakeDetectionHandler = Arc<dyn Fn(WakeDetection) + Send + Sync>;

/// Run an observer without blocking the caller.
///
/// Spawns onto the current tokio runtime when there is one; outside a
/// runtime the observer runs inline on the calling thread.
pub(crate) fn dispatch<F>(observer: F)
where
    F: FnOnce() + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            drop(handle.spawn(async move { observer() }));
        }
        Err(_) => observer(),
    }
}
