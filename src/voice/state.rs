//! Conversation state machine
//!
//! Tracks how engaged the session is (cold → warm → active) from interaction
//! timing and speech events. Performs no I/O of its own; the only side effect
//! is stopping the registered player when the user barges in.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::events::{self, StateChangeHandler, UiEvent, UiEventHandler, UiEventType};
use crate::voice::player::AudioPlayer;

/// Conversational engagement level
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationState {
    /// No recent interaction
    #[default]
    Cold,
    /// Recent interaction
    Warm,
    /// Mid-conversation
    Active,
}

impl ConversationState {
    /// Lowercase name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cold => "cold",
            Self::Warm => "warm",
            Self::Active => "active",
        }
    }
}

impl std::fmt::Display for ConversationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Register the assistant should speak in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Formality {
    /// Cold start
    Formal,
    /// Warm, early in the session
    Casual,
    /// Warm, after a few turns
    Familiar,
    /// Active conversation
    Engaged,
}

impl Formality {
    /// Lowercase name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Formal => "formal",
            Self::Casual => "casual",
            Self::Familiar => "familiar",
            Self::Engaged => "engaged",
        }
    }
}

impl std::fmt::Display for Formality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timing and gating configuration for the state machine
#[derive(Debug, Clone)]
pub struct StateConfig {
    /// Idle time before Warm (or Active) collapses to Cold
    pub warm_timeout: Duration,
    /// Idle time before Active collapses to Warm
    pub active_timeout: Duration,
    /// Minimum speech duration before a backchannel is considered
    pub min_speech_for_backchannel: Duration,
    /// Minimum confidence for speech to count as clear
    pub confidence_threshold: f64,
    /// Minimum time between two backchannels
    pub backchannel_cooldown: Duration,
    /// Speech must run longer than this before backchannels are sampled
    pub backchannel_long_speech: Duration,
    /// Probability a qualifying utterance gets a backchannel
    pub backchannel_probability: f64,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            warm_timeout: Duration::from_secs(120),
            active_timeout: Duration::from_secs(30),
            min_speech_for_backchannel: Duration::from_millis(500),
            confidence_threshold: 0.6,
            backchannel_cooldown: Duration::from_secs(2),
            backchannel_long_speech: Duration::from_secs(5),
            backchannel_probability: 0.3,
        }
    }
}

/// Session timing, owned by the state machine
#[derive(Debug, Clone, Copy)]
pub struct SessionClock {
    /// When the current session began
    pub session_start: Instant,
    /// Last recorded interaction (none since start or farewell)
    pub last_interaction_at: Option<Instant>,
    /// Last backchannel emitted
    pub last_backchannel_at: Option<Instant>,
    /// Number of user speech turns this session
    pub turn_count: u32,
}

impl SessionClock {
    fn start() -> Self {
        Self {
            session_start: Instant::now(),
            last_interaction_at: None,
            last_backchannel_at: None,
            turn_count: 0,
        }
    }
}

struct Session {
    state: ConversationState,
    clock: SessionClock,
    player: Option<Arc<dyn AudioPlayer>>,
    on_state_change: Option<StateChangeHandler>,
    on_ui_event: Option<UiEventHandler>,
}

/// Thread-safe conversation state machine
pub struct ConversationStateMachine {
    config: StateConfig,
    session: RwLock<Session>,
}

impl ConversationStateMachine {
    /// Create a state machine in the Cold state
    #[must_use]
    pub fn new(config: StateConfig) -> Self {
        Self {
            config,
            session: RwLock::new(Session {
                state: ConversationState::Cold,
                clock: SessionClock::start(),
                player: None,
                on_state_change: None,
                on_ui_event: None,
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Session> {
        self.session.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Session> {
        self.session.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Configuration in use
    #[must_use]
    pub const fn config(&self) -> &StateConfig {
        &self.config
    }

    /// Register the player used for barge-in
    pub fn set_audio_player(&self, player: Option<Arc<dyn AudioPlayer>>) {
        self.write().player = player;
    }

    /// Current state with idle timeouts applied
    #[must_use]
    pub fn state(&self) -> ConversationState {
        let session = self.read();
        self.effective_state(&session, Instant::now())
    }

    /// Apply idle timeouts to the stored state
    fn effective_state(&self, session: &Session, now: Instant) -> ConversationState {
        let Some(last) = session.clock.last_interaction_at else {
            return ConversationState::Cold;
        };
        let elapsed = now.saturating_duration_since(last);

        match session.state {
            ConversationState::Active => {
                if elapsed >= self.config.warm_timeout {
                    ConversationState::Cold
                } else if elapsed > self.config.active_timeout {
                    ConversationState::Warm
                } else {
                    ConversationState::Active
                }
            }
            ConversationState::Warm if elapsed < self.config.warm_timeout => {
                ConversationState::Warm
            }
            _ => ConversationState::Cold,
        }
    }

    /// Record an interaction and advance the state
    ///
    /// User speech stops any playing audio before the transition is computed.
    /// Returns the state after the interaction.
    pub fn record_interaction(&self, is_user_speaking: bool) -> ConversationState {
        if is_user_speaking {
            self.stop_audio_if_playing();
        }

        let (old, new, observer) = {
            let mut session = self.write();
            let now = Instant::now();
            let old = self.effective_state(&session, now);

            let new = match old {
                ConversationState::Cold => ConversationState::Warm,
                ConversationState::Warm if is_user_speaking => ConversationState::Active,
                ConversationState::Warm => ConversationState::Warm,
                ConversationState::Active => ConversationState::Active,
            };

            if is_user_speaking {
                session.clock.turn_count += 1;
            }
            session.clock.last_interaction_at = Some(now);
            session.state = new;

            (old, new, session.on_state_change.clone())
        };

        if old != new {
            tracing::debug!(from = %old, to = %new, "conversation state changed");
            if let Some(observer) = observer {
                events::dispatch(move || observer(old, new));
            }
        }

        new
    }

    /// End the conversation (farewell): back to Cold, turn count reset
    pub fn end_conversation(&self) {
        let (old, observer) = {
            let mut session = self.write();
            let old = self.effective_state(&session, Instant::now());
            session.state = ConversationState::Cold;
            session.clock = SessionClock::start();
            (old, session.on_state_change.clone())
        };

        if old != ConversationState::Cold {
            tracing::debug!(from = %old, "conversation ended");
            if let Some(observer) = observer {
                events::dispatch(move || observer(old, ConversationState::Cold));
            }
        }
    }

    /// Number of user speech turns this session
    #[must_use]
    pub fn turn_count(&self) -> u32 {
        self.read().clock.turn_count
    }

    /// Time since the session started
    #[must_use]
    pub fn session_duration(&self) -> Duration {
        self.read().clock.session_start.elapsed()
    }

    /// Snapshot of the session clock
    #[must_use]
    pub fn clock(&self) -> SessionClock {
        self.read().clock
    }

    /// True until the first user speech turn
    #[must_use]
    pub fn is_first_interaction(&self) -> bool {
        self.read().clock.turn_count == 0
    }

    /// Register the state change observer
    pub fn on_state_change(&self, observer: StateChangeHandler) {
        self.write().on_state_change = Some(observer);
    }

    /// Register the UI event observer
    pub fn on_ui_event(&self, observer: UiEventHandler) {
        self.write().on_ui_event = Some(observer);
    }

    /// Emit a UI event to the registered observer
    pub fn emit_ui_event(&self, event_type: UiEventType) {
        let (observer, state) = {
            let session = self.read();
            (
                session.on_ui_event.clone(),
                self.effective_state(&session, Instant::now()),
            )
        };

        if let Some(observer) = observer {
            observer(UiEvent::now(event_type, state));
        }
    }

    /// Whether a backchannel ("mhm") is appropriate right now
    ///
    /// Requires Active state, long enough and confident enough speech, an
    /// elapsed cooldown, and then passes only a sampled fraction of the time.
    #[must_use]
    pub fn should_trigger_backchannel(&self, speech_duration: Duration, confidence: f64) -> bool {
        {
            let session = self.read();
            let now = Instant::now();

            if self.effective_state(&session, now) != ConversationState::Active {
                return false;
            }

            if speech_duration < self.config.min_speech_for_backchannel {
                return false;
            }

            if confidence < self.config.confidence_threshold {
                return false;
            }

            if let Some(last) = session.clock.last_backchannel_at
                && now.saturating_duration_since(last) < self.config.backchannel_cooldown
            {
                return false;
            }
        }

        if speech_duration <= self.config.backchannel_long_speech {
            return false;
        }

        let probability = self.config.backchannel_probability.clamp(0.0, 1.0);
        rand::thread_rng().gen_bool(probability)
    }

    /// Record that a backchannel was played
    pub fn record_backchannel(&self) {
        self.write().clock.last_backchannel_at = Some(Instant::now());
    }

    /// Whether speech with this confidence deserves a clarification
    #[must_use]
    pub fn is_low_confidence(&self, confidence: f64) -> bool {
        confidence > 0.0 && confidence < self.config.confidence_threshold
    }

    /// Formality level for the current state and turn count
    #[must_use]
    pub fn formality(&self) -> Formality {
        let session = self.read();
        match self.effective_state(&session, Instant::now()) {
            ConversationState::Cold => Formality::Formal,
            ConversationState::Warm if session.clock.turn_count < 3 => Formality::Casual,
            ConversationState::Warm => Formality::Familiar,
            ConversationState::Active => Formality::Engaged,
        }
    }

    /// Stop playback if audio is playing; returns whether it was stopped
    pub fn stop_audio_if_playing(&self) -> bool {
        let player = self.read().player.clone();

        match player {
            Some(player) if player.is_playing() => {
                tracing::debug!("user barge-in, stopping playback");
                player.stop();
                true
            }
            _ => false,
        }
    }
}

impl Default for ConversationStateMachine {
    fn default() -> Self {
        Self::new(StateConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::voice::player::PlaybackCallbacks;

    #[derive(Default)]
    struct FakePlayer {
        playing: AtomicBool,
        stops: AtomicUsize,
    }

    #[async_trait]
    impl AudioPlayer for FakePlayer {
        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
            self.playing.store(false, Ordering::SeqCst);
        }

        fn is_playing(&self) -> bool {
            self.playing.load(Ordering::SeqCst)
        }

        async fn play_bytes(&self, _data: &[u8]) -> crate::Result<()> {
            Ok(())
        }

        fn set_callbacks(&self, _callbacks: PlaybackCallbacks) {}
    }

    fn active_machine(config: StateConfig) -> ConversationStateMachine {
        let machine = ConversationStateMachine::new(config);
        machine.record_interaction(false);
        machine.record_interaction(true);
        assert_eq!(machine.state(), ConversationState::Active);
        machine
    }

    #[test]
    fn starts_cold() {
        let machine = ConversationStateMachine::default();
        assert_eq!(machine.state(), ConversationState::Cold);
        assert_eq!(machine.turn_count(), 0);
        assert!(machine.is_first_interaction());
    }

    #[test]
    fn cold_always_goes_warm() {
        let machine = ConversationStateMachine::default();
        assert_eq!(machine.record_interaction(true), ConversationState::Warm);

        let machine = ConversationStateMachine::default();
        assert_eq!(machine.record_interaction(false), ConversationState::Warm);
    }

    #[test]
    fn warm_goes_active_only_on_speech() {
        let machine = ConversationStateMachine::default();
        machine.record_interaction(false);
        assert_eq!(machine.record_interaction(false), ConversationState::Warm);
        assert_eq!(machine.record_interaction(true), ConversationState::Active);
        assert_eq!(machine.record_interaction(false), ConversationState::Active);
    }

    #[test]
    fn turn_count_tracks_speech_only() {
        let machine = ConversationStateMachine::default();
        machine.record_interaction(false);
        assert_eq!(machine.turn_count(), 0);
        machine.record_interaction(true);
        assert_eq!(machine.turn_count(), 1);
        machine.record_interaction(true);
        assert_eq!(machine.turn_count(), 2);
        machine.record_interaction(false);
        assert_eq!(machine.turn_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn active_times_out_to_warm_then_cold() {
        let machine = active_machine(StateConfig::default());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(machine.state(), ConversationState::Warm);

        tokio::time::advance(Duration::from_secs(89)).await;
        assert_eq!(machine.state(), ConversationState::Cold);
    }

    #[tokio::test(start_paused = true)]
    async fn transition_applies_timeouts_first() {
        let machine = active_machine(StateConfig::default());

        // Active decays to Warm, so non-speech keeps Warm instead of Active
        tokio::time::advance(Duration::from_secs(45)).await;
        assert_eq!(machine.record_interaction(false), ConversationState::Warm);

        // Warm decays to Cold, so any interaction lands on Warm
        tokio::time::advance(Duration::from_secs(121)).await;
        assert_eq!(machine.record_interaction(true), ConversationState::Warm);
    }

    #[test]
    fn end_conversation_resets() {
        let machine = active_machine(StateConfig::default());
        machine.end_conversation();
        assert_eq!(machine.state(), ConversationState::Cold);
        assert_eq!(machine.turn_count(), 0);
        assert!(machine.clock().last_interaction_at.is_none());
    }

    #[test]
    fn speech_stops_playing_audio_before_transition() {
        let machine = ConversationStateMachine::default();
        let player = Arc::new(FakePlayer::default());
        player.playing.store(true, Ordering::SeqCst);
        machine.set_audio_player(Some(player.clone()));

        machine.record_interaction(false);
        assert_eq!(player.stops.load(Ordering::SeqCst), 0);

        machine.record_interaction(true);
        assert_eq!(player.stops.load(Ordering::SeqCst), 1);
        assert!(!player.is_playing());

        // Nothing playing, nothing to stop
        machine.record_interaction(true);
        assert_eq!(player.stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_audio_if_playing_reports_action() {
        let machine = ConversationStateMachine::default();
        assert!(!machine.stop_audio_if_playing());

        let player = Arc::new(FakePlayer::default());
        machine.set_audio_player(Some(player.clone()));
        assert!(!machine.stop_audio_if_playing());

        player.playing.store(true, Ordering::SeqCst);
        assert!(machine.stop_audio_if_playing());
    }

    #[test]
    fn backchannel_requires_active_state() {
        let config = StateConfig {
            backchannel_probability: 1.0,
            ..StateConfig::default()
        };
        let machine = ConversationStateMachine::new(config);
        machine.record_interaction(false);
        assert!(!machine.should_trigger_backchannel(Duration::from_secs(6), 0.9));
    }

    #[test]
    fn backchannel_requires_minimum_duration() {
        let config = StateConfig {
            backchannel_probability: 1.0,
            backchannel_long_speech: Duration::ZERO,
            ..StateConfig::default()
        };
        let machine = active_machine(config);
        assert!(!machine.should_trigger_backchannel(Duration::from_millis(100), 0.9));
        assert!(machine.should_trigger_backchannel(Duration::from_millis(600), 0.9));
    }

    #[test]
    fn backchannel_requires_confidence() {
        let config = StateConfig {
            backchannel_probability: 1.0,
            ..StateConfig::default()
        };
        let machine = active_machine(config);
        assert!(!machine.should_trigger_backchannel(Duration::from_secs(6), 0.3));
        assert!(machine.should_trigger_backchannel(Duration::from_secs(6), 0.9));
    }

    #[tokio::test(start_paused = true)]
    async fn backchannel_respects_cooldown() {
        let config = StateConfig {
            backchannel_probability: 1.0,
            ..StateConfig::default()
        };
        let machine = active_machine(config);
        machine.record_backchannel();
        assert!(!machine.should_trigger_backchannel(Duration::from_secs(6), 0.9));

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(machine.should_trigger_backchannel(Duration::from_secs(6), 0.9));
    }

    #[test]
    fn backchannel_only_sampled_for_long_speech() {
        let config = StateConfig {
            backchannel_probability: 1.0,
            ..StateConfig::default()
        };
        let machine = active_machine(config);
        assert!(!machine.should_trigger_backchannel(Duration::from_secs(2), 0.9));

        let never = StateConfig {
            backchannel_probability: 0.0,
            ..StateConfig::default()
        };
        let machine = active_machine(never);
        assert!(!machine.should_trigger_backchannel(Duration::from_secs(6), 0.9));
    }

    #[test]
    fn low_confidence_window() {
        let machine = ConversationStateMachine::default();
        assert!(machine.is_low_confidence(0.3));
        assert!(!machine.is_low_confidence(0.8));
        assert!(!machine.is_low_confidence(0.0));
    }

    #[test]
    fn formality_follows_state_and_turns() {
        let machine = ConversationStateMachine::default();
        assert_eq!(machine.formality(), Formality::Formal);

        machine.record_interaction(false);
        assert_eq!(machine.formality(), Formality::Casual);

        machine.record_interaction(true);
        assert_eq!(machine.formality(), Formality::Engaged);
    }

    #[tokio::test(start_paused = true)]
    async fn formality_familiar_after_three_turns() {
        let machine = active_machine(StateConfig::default());
        machine.record_interaction(true);
        machine.record_interaction(true);
        assert_eq!(machine.turn_count(), 3);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(machine.formality(), Formality::Familiar);
    }

    #[tokio::test]
    async fn state_change_observer_fires_outside_lock() {
        let machine = Arc::new(ConversationStateMachine::default());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let reentrant = Arc::clone(&machine);
        machine.on_state_change(Arc::new(move |old, new| {
            // Re-entering the machine must not deadlock
            let _ = reentrant.turn_count();
            tx.send((old, new)).unwrap();
        }));

        machine.record_interaction(false);
        let change = rx.recv().await.unwrap();
        assert_eq!(change, (ConversationState::Cold, ConversationState::Warm));
    }

    #[test]
    fn ui_event_carries_current_state() {
        let machine = ConversationStateMachine::default();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        machine.on_ui_event(Arc::new(move |event| sink.lock().unwrap().push(event)));

        machine.record_interaction(false);
        machine.emit_ui_event(UiEventType::Listening);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].event_type, UiEventType::Listening);
        assert_eq!(seen[0].state, ConversationState::Warm);
    }
}
