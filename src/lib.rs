//! Beacon Voice - Real-time conversational voice core for AI assistants
//!
//! This library provides the conversation layer that sits between a voice
//! sidecar (VAD, wake word, TTS) and the assistant:
//! - Conversation state machine (cold → warm → active) with turn tracking
//! - Pre-generated audio cache for instant wake responses
//! - Streaming VAD client with barge-in and playback-aware sensitivity
//! - Wake word filtering and persona switching
//! - A coordinator tying them together for UI and LLM consumers
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │          UI events  │  speech captures  │  context  │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │              ConversationCoordinator                 │
//! │   State  │  Audio cache  │  VAD client  │  Wake word │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │   Player  │  Audio source  │  Synthesizer  │ Sidecar │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod voice;

pub use config::Config;
pub use error::{Error, Result};
pub use events::{UiEvent, UiEventType, WakeDetection};
pub use voice::{ConversationCoordinator, ConversationState, CoordinatorConfig};
