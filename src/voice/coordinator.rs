//! Conversation coordinator
//!
//! Composes the state machine, audio cache, VAD client and wake word client
//! into one object the rest of the assistant talks to. Public handlers
//! validate, update state, and return right away; audio plays on spawned
//! tasks so response text is available before any clip starts.
//!
//! Every collaborator failure is absorbed here (cache miss falls back to
//! synthesis, no synthesizer means text only, mode switch failures are
//! logged). The one error surfaced to callers is a VAD connect failure in
//! [`ConversationCoordinator::start_listening`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::cache::{AudioCache, AudioCacheConfig, CacheStats};
use super::player::{AudioPlayer, PlaybackCallbacks, PlaybackHook};
use super::responses::WakeResponse;
use super::source::AudioSource;
use super::state::{ConversationState, ConversationStateMachine, Formality, StateConfig};
use super::tts::SpeechSynthesizer;
use super::vad::{
    ReconnectHandler, SpeechHandler, SpeechSignal, VadClient, VadConfig, VadErrorHandler,
    VadHandlers, VadMode, WakeSignal, WakeSignalHandler,
};
use super::wake_word::{WakeWordClient, WakeWordConfig, normalize};
use crate::events::{
    self, StateChangeHandler, UiEventHandler, UiEventType, WakeDetection, WakeDetectionHandler,
};
use crate::{Error, Result};

/// Bytes per second of the 16 kHz mono PCM16 capture format
pub const PCM_BYTES_PER_SECOND: u64 = 32_000;

/// Playing time of `bytes` of capture-format audio
#[must_use]
pub fn pcm_duration(bytes: usize) -> Duration {
    let bytes = u64::try_from(bytes).unwrap_or(u64::MAX);
    Duration::from_micros(bytes.saturating_mul(1_000_000) / PCM_BYTES_PER_SECOND)
}

/// Coordinator configuration
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub cache_dir: PathBuf,
    /// Voice settings; `persona_name` is the initial persona
    pub cache: AudioCacheConfig,
    pub state: StateConfig,
    /// Load every cached clip into memory at construction
    pub preload_audio: bool,
    /// Continuous listening; `None` disables VAD
    pub vad: Option<VadConfig>,
    /// Hotword filtering; `None` disables it
    pub wake_word: Option<WakeWordConfig>,
    /// Wake word → persona name
    pub personas: HashMap<String, String>,
    /// Cap in bytes on audio buffered between speech start and end
    pub max_buffered_audio: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("audio_cache"),
            cache: AudioCacheConfig::default(),
            state: StateConfig::default(),
            preload_audio: true,
            vad: None,
            wake_word: Some(WakeWordConfig::default()),
            personas: HashMap::new(),
            max_buffered_audio: 960_000,
        }
    }
}

/// A finished utterance ready for transcription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeechCapture {
    pub audio: Vec<u8>,
    pub duration: Duration,
}

/// Observer for captured utterances
pub type SpeechDetectedHandler = Arc<dyn Fn(SpeechCapture) + Send + Sync>;

/// Snapshot used to enrich LLM prompts
#[derive(Debug, Clone, Serialize)]
pub struct ConversationContext {
    pub state: ConversationState,
    pub turn_count: u32,
    pub session_duration_secs: f64,
    pub is_first_turn: bool,
    pub formality: Formality,
    pub persona_name: String,
}

/// Audio captured between speech start and speech end
#[derive(Default)]
struct SpeechBuffer {
    active: bool,
    data: Vec<u8>,
}

struct Listener {
    id: u64,
    pump: CancellationToken,
}

#[derive(Default)]
struct Observers {
    on_speech_detected: Option<SpeechDetectedHandler>,
    on_wake_word_detected: Option<WakeDetectionHandler>,
}

struct Shared {
    config: CoordinatorConfig,
    state: ConversationStateMachine,
    cache: AudioCache,
    player: Option<Arc<dyn AudioPlayer>>,
    synthesizer: Option<Arc<dyn SpeechSynthesizer>>,
    persona: RwLock<String>,
    personas: HashMap<String, String>,
    vad: RwLock<Option<VadClient>>,
    wake_word: RwLock<Option<Arc<WakeWordClient>>>,
    listen_lock: tokio::sync::Mutex<()>,
    listener: Mutex<Option<Listener>>,
    next_listener: AtomicU64,
    buffer: Mutex<SpeechBuffer>,
    /// Latest requested detector mode not yet sent
    wanted_mode: Mutex<Option<VadMode>>,
    /// Serializes mode requests so they reach the sidecar in order
    mode_lock: tokio::sync::Mutex<()>,
    observers: RwLock<Observers>,
    session: CancellationToken,
}

/// Real-time conversation coordinator
///
/// Cheap to clone; clones share one conversation.
#[derive(Clone)]
pub struct ConversationCoordinator {
    inner: Arc<Shared>,
}

impl ConversationCoordinator {
    /// Create a coordinator
    ///
    /// With `preload_audio` set, cached clips are loaded into memory now;
    /// failures there are logged and clips load on demand instead.
    pub async fn new(
        config: CoordinatorConfig,
        synthesizer: Option<Arc<dyn SpeechSynthesizer>>,
        player: Option<Arc<dyn AudioPlayer>>,
    ) -> Self {
        let state = ConversationStateMachine::new(config.state.clone());
        state.set_audio_player(player.clone());

        let cache = AudioCache::new(config.cache_dir.clone(), config.cache.clone());
        if config.preload_audio {
            match cache.preload_all().await {
                Ok(files) => tracing::debug!(files, "audio cache preloaded"),
                Err(e) => tracing::debug!(error = %e, "audio cache preload skipped"),
            }
        }

        let personas = config
            .personas
            .iter()
            .map(|(word, persona)| (normalize(word), persona.clone()))
            .collect();

        Self {
            inner: Arc::new(Shared {
                persona: RwLock::new(config.cache.persona_name.clone()),
                personas,
                config,
                state,
                cache,
                player,
                synthesizer,
                vad: RwLock::new(None),
                wake_word: RwLock::new(None),
                listen_lock: tokio::sync::Mutex::new(()),
                listener: Mutex::new(None),
                next_listener: AtomicU64::new(0),
                buffer: Mutex::new(SpeechBuffer::default()),
                wanted_mode: Mutex::new(None),
                mode_lock: tokio::sync::Mutex::new(()),
                observers: RwLock::new(Observers::default()),
                session: CancellationToken::new(),
            }),
        }
    }

    fn upgrade(weak: &Weak<Shared>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    #[must_use]
    pub fn state_machine(&self) -> &ConversationStateMachine {
        &self.inner.state
    }

    #[must_use]
    pub fn cache(&self) -> &AudioCache {
        &self.inner.cache
    }

    #[must_use]
    pub fn state(&self) -> ConversationState {
        self.inner.state.state()
    }

    #[must_use]
    pub fn formality(&self) -> Formality {
        self.inner.state.formality()
    }

    #[must_use]
    pub fn persona_name(&self) -> String {
        self.inner
            .persona
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Change the persona name used in introductions
    pub fn set_persona_name(&self, name: impl Into<String>) {
        *self
            .inner
            .persona
            .write()
            .unwrap_or_else(PoisonError::into_inner) = name.into();
    }

    /// Context for prompt enrichment
    #[must_use]
    pub fn conversation_context(&self) -> ConversationContext {
        let state = &self.inner.state;
        ConversationContext {
            state: state.state(),
            turn_count: state.turn_count(),
            session_duration_secs: state.session_duration().as_secs_f64(),
            is_first_turn: state.is_first_interaction(),
            formality: state.formality(),
            persona_name: self.persona_name(),
        }
    }

    pub fn on_ui_event(&self, handler: UiEventHandler) {
        self.inner.state.on_ui_event(handler);
    }

    pub fn on_state_change(&self, handler: StateChangeHandler) {
        self.inner.state.on_state_change(handler);
    }

    /// Register the observer for captured utterances
    pub fn on_speech_detected(&self, handler: SpeechDetectedHandler) {
        self.observers_mut().on_speech_detected = Some(handler);
    }

    /// Register the observer for wake word detections
    pub fn on_wake_word_detected(&self, handler: WakeDetectionHandler) {
        self.observers_mut().on_wake_word_detected = Some(handler);
    }

    fn observers_mut(&self) -> std::sync::RwLockWriteGuard<'_, Observers> {
        self.inner
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn speech_observer(&self) -> Option<SpeechDetectedHandler> {
        self.inner
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .on_speech_detected
            .clone()
    }

    fn emit(&self, event_type: UiEventType) {
        self.inner.state.emit_ui_event(event_type);
    }

    // -- conversation handlers --------------------------------------------

    /// Respond to a wake word
    ///
    /// Returns the response text immediately; audio plays in the background.
    pub fn handle_wake_word(&self) -> String {
        let state = &self.inner.state;
        let first = state.is_first_interaction();
        let before = state.state();

        state.stop_audio_if_playing();
        state.record_interaction(false);
        self.emit(UiEventType::Listening);

        let pool = self.inner.cache.pool();
        let response = if first && before == ConversationState::Cold {
            pool.introduction()
        } else {
            pool.wake_response(before)
        };

        let text = response.render(&self.persona_name());
        tracing::debug!(state = %before, first, text = %text, "wake word response");

        self.speak(response, text.clone(), UiEventType::Listening, None);
        text
    }

    /// User started speaking; returns the new state
    ///
    /// Recording speech stops any playing audio before the transition.
    pub fn handle_user_speech_start(&self) -> ConversationState {
        let state = self.inner.state.record_interaction(true);
        self.emit(UiEventType::Listening);
        state
    }

    /// User finished speaking; returns the current state
    pub fn handle_user_speech_end(&self) -> ConversationState {
        self.emit(UiEventType::Processing);
        self.inner.state.state()
    }

    /// End the conversation and say goodbye
    pub fn handle_farewell(&self) -> String {
        self.inner.state.end_conversation();

        let response = self.inner.cache.pool().farewell();
        let text = response.render(&self.persona_name());
        self.speak(response, text.clone(), UiEventType::Idle, Some(UiEventType::Idle));
        text
    }

    /// Ask for clarification when speech was unclear
    ///
    /// Returns an empty string when the confidence is acceptable.
    pub fn handle_low_confidence_speech(&self, confidence: f64) -> String {
        if !self.inner.state.is_low_confidence(confidence) {
            return String::new();
        }

        let response = self.inner.cache.pool().confused();
        let text = response.render(&self.persona_name());
        self.speak(response, text.clone(), UiEventType::Listening, None);
        text
    }

    /// Acknowledge a command before working on it
    pub fn handle_acknowledge(&self) -> String {
        let response = self.inner.cache.pool().acknowledge();
        let text = response.render(&self.persona_name());
        self.speak(response, text.clone(), UiEventType::Processing, None);
        text
    }

    #[must_use]
    pub fn should_backchannel(&self, speech_duration: Duration, confidence: f64) -> bool {
        self.inner
            .state
            .should_trigger_backchannel(speech_duration, confidence)
    }

    /// Play a short acknowledgement sound and start the cooldown
    pub async fn backchannel(&self) -> String {
        let response = self.inner.cache.pool().backchannel();

        if let Some(player) = &self.inner.player
            && let Some(audio) = self.cached_audio(&response).await
            && let Err(e) = player.play_bytes(&audio).await
        {
            tracing::warn!(error = %e, "backchannel playback failed");
        }

        self.inner.state.record_backchannel();
        response.render(&self.persona_name())
    }

    // -- playback ---------------------------------------------------------

    /// Play a response in the background
    ///
    /// `after` is emitted once playback ends; `silent` is emitted instead when
    /// no audio could be produced.
    fn speak(
        &self,
        response: WakeResponse,
        text: String,
        after: UiEventType,
        silent: Option<UiEventType>,
    ) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::debug!(text = %text, "no runtime for playback, text only");
            if let Some(event) = silent {
                self.emit(event);
            }
            return;
        };

        let this = self.clone();
        drop(handle.spawn(async move {
            this.play_response(&response, &text, after, silent).await;
        }));
    }

    async fn play_response(
        &self,
        response: &WakeResponse,
        text: &str,
        after: UiEventType,
        silent: Option<UiEventType>,
    ) {
        let audio = match &self.inner.player {
            Some(_) => match self.cached_audio(response).await {
                Some(audio) => Some(audio),
                None => self.synthesize_fallback(text).await,
            },
            None => None,
        };

        let (Some(player), Some(audio)) = (&self.inner.player, audio) else {
            tracing::debug!(text, "no audio for response, text only");
            if let Some(event) = silent {
                self.emit(event);
            }
            return;
        };

        self.emit(UiEventType::Speaking);
        if let Err(e) = player.play_bytes(&audio).await {
            tracing::warn!(error = %e, "response playback failed");
        }
        self.emit(after);
    }

    async fn cached_audio(&self, response: &WakeResponse) -> Option<Arc<[u8]>> {
        let file = response.audio_file.as_deref()?;

        // Introductions were rendered with the persona active at generation
        if response.is_personalized()
            && self.persona_name() != self.inner.cache.config().persona_name
        {
            tracing::debug!(file, "cached clip is for another persona");
            return None;
        }

        match self.inner.cache.get_audio(file).await {
            Ok(audio) => Some(audio),
            Err(e) => {
                tracing::debug!(file, error = %e, "cache miss");
                None
            }
        }
    }

    async fn synthesize_fallback(&self, text: &str) -> Option<Arc<[u8]>> {
        let synthesizer = self.inner.synthesizer.as_ref()?;

        let file = match tempfile::Builder::new()
            .prefix("beacon-voice-")
            .suffix(".wav")
            .tempfile()
        {
            Ok(file) => file,
            Err(e) => {
                tracing::warn!(error = %e, "cannot create file for fallback synthesis");
                return None;
            }
        };

        let voice_id = &self.inner.config.cache.voice_id;
        if let Err(e) = synthesizer
            .synthesize_to_file(text, file.path(), voice_id)
            .await
        {
            tracing::warn!(error = %e, "fallback synthesis failed");
            return None;
        }

        match tokio::fs::read(file.path()).await {
            Ok(audio) => Some(audio.into()),
            Err(e) => {
                tracing::warn!(error = %e, "cannot read synthesized clip");
                None
            }
        }
    }

    // -- cache ------------------------------------------------------------

    /// Generate the audio cache if it is stale; no-op without a synthesizer
    ///
    /// # Errors
    ///
    /// Returns error if generation fails
    pub async fn ensure_cache_ready(&self) -> Result<()> {
        let Some(synthesizer) = &self.inner.synthesizer else {
            return Ok(());
        };
        self.inner.cache.ensure_generated(synthesizer.as_ref()).await
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats().await
    }

    /// Wipe the audio cache
    ///
    /// # Errors
    ///
    /// Returns error if the cache directory cannot be removed
    pub async fn clear_cache(&self) -> Result<()> {
        self.inner.cache.clear().await
    }

    // -- VAD --------------------------------------------------------------

    #[must_use]
    pub fn is_vad_enabled(&self) -> bool {
        self.inner.config.vad.is_some()
    }

    #[must_use]
    pub fn vad_client(&self) -> Option<VadClient> {
        self.inner
            .vad
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Create the VAD client and wire its events into the conversation
    ///
    /// No-op when VAD is disabled or already initialized.
    ///
    /// # Errors
    ///
    /// Returns error if the VAD configuration is invalid
    pub fn initialize_vad(&self) -> Result<()> {
        let Some(vad_config) = self.inner.config.vad.clone() else {
            tracing::debug!("vad not enabled, skipping initialization");
            return Ok(());
        };

        {
            let mut slot = self
                .inner
                .vad
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if slot.is_some() {
                return Ok(());
            }

            let client = VadClient::new(vad_config)?;
            client.set_handlers(self.vad_handlers());
            *slot = Some(client);
        }

        self.setup_playback_callbacks();

        tracing::info!("vad client initialized with playback coordination");
        Ok(())
    }

    fn vad_handlers(&self) -> VadHandlers {
        let weak = Arc::downgrade(&self.inner);

        let speech = |f: fn(&Self, SpeechSignal)| -> SpeechHandler {
            let weak = weak.clone();
            Arc::new(move |signal| {
                if let Some(this) = Self::upgrade(&weak) {
                    f(&this, signal);
                }
            })
        };

        let on_speech_start = speech(|this, signal| this.handle_vad_speech_start(&signal));
        let on_speech_end = speech(Self::handle_vad_speech_end);
        let on_interrupt = speech(Self::handle_vad_interrupt);

        let on_error: VadErrorHandler = {
            let weak = weak.clone();
            Arc::new(move |err| {
                if let Some(this) = Self::upgrade(&weak) {
                    this.handle_vad_error(&err);
                }
            })
        };

        let on_wake_word: WakeSignalHandler = {
            let weak = weak.clone();
            Arc::new(move |signal| {
                if let Some(this) = Self::upgrade(&weak) {
                    this.handle_vad_wake_word(&signal);
                }
            })
        };

        let on_reconnected: ReconnectHandler = Arc::new(move || {
            if let Some(this) = Self::upgrade(&weak) {
                tracing::debug!("vad reconnected, dropping in-flight audio");
                this.reset_buffer(false);
            }
        });

        VadHandlers {
            on_speech_start: Some(on_speech_start),
            on_speech_end: Some(on_speech_end),
            on_interrupt: Some(on_interrupt),
            on_error: Some(on_error),
            on_wake_word: Some(on_wake_word),
            on_reconnected: Some(on_reconnected),
        }
    }

    /// Lower VAD sensitivity while the assistant talks
    fn setup_playback_callbacks(&self) {
        let Some(player) = &self.inner.player else {
            tracing::debug!("no audio player, skipping playback callbacks");
            return;
        };

        let mode_switch = |mode: VadMode| -> PlaybackHook {
            let weak = Arc::downgrade(&self.inner);
            Arc::new(move || {
                let Some(this) = Self::upgrade(&weak) else {
                    return;
                };
                if let Some(client) = this.vad_client().filter(VadClient::is_connected) {
                    this.request_mode(client, mode);
                }
            })
        };

        player.set_callbacks(PlaybackCallbacks {
            on_playback_start: Some(mode_switch(VadMode::Playback)),
            on_playback_end: Some(mode_switch(VadMode::Full)),
        });
    }

    /// Switch the detector mode in the background, logging failures
    ///
    /// Requests are applied one at a time and the latest one wins, so a
    /// playback end never lands before the playback start it follows.
    fn request_mode(&self, client: VadClient, mode: VadMode) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::debug!(mode = %mode, "no runtime for vad mode switch");
            return;
        };

        *self
            .inner
            .wanted_mode
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(mode);

        let this = self.clone();
        drop(handle.spawn(async move {
            let _serial = this.inner.mode_lock.lock().await;
            let next = this
                .inner
                .wanted_mode
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();

            // An earlier task already sent the latest request
            let Some(mode) = next else {
                return;
            };
            if let Err(e) = client.set_mode(mode).await {
                tracing::warn!(mode = %mode, error = %e, "failed to switch vad mode");
            }
        }));
    }

    fn reset_buffer(&self, active: bool) {
        let mut buffer = self
            .inner
            .buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        buffer.data.clear();
        buffer.active = active;
    }

    fn buffer_frame(&self, frame: &[u8]) {
        let mut buffer = self
            .inner
            .buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !buffer.active {
            return;
        }

        let room = self
            .inner
            .config
            .max_buffered_audio
            .saturating_sub(buffer.data.len());
        let take = room.min(frame.len());
        buffer.data.extend_from_slice(&frame[..take]);
    }

    fn take_buffer(&self) -> Vec<u8> {
        let mut buffer = self
            .inner
            .buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        buffer.active = false;
        std::mem::take(&mut buffer.data)
    }

    /// Detector saw speech begin
    pub fn handle_vad_speech_start(&self, signal: &SpeechSignal) {
        tracing::debug!(confidence = signal.confidence, "vad speech start");
        self.reset_buffer(true);
        self.handle_user_speech_start();
    }

    /// Detector saw speech end; forwards the utterance for transcription
    pub fn handle_vad_speech_end(&self, signal: SpeechSignal) {
        let buffered = self.take_buffer();
        self.handle_user_speech_end();

        let duration = signal.speech_duration();
        let audio = match signal.audio {
            Some(audio) if !audio.is_empty() => audio,
            _ => buffered,
        };

        tracing::debug!(
            confidence = signal.confidence,
            audio_bytes = audio.len(),
            "vad speech end"
        );

        self.forward_speech(audio, duration);
    }

    /// User barged in over assistant playback
    ///
    /// Playback stops first, the detector returns to full sensitivity, and
    /// the interrupting audio is forwarded as the start of a new command.
    pub fn handle_vad_interrupt(&self, signal: SpeechSignal) {
        tracing::info!(confidence = signal.confidence, "user interrupt, stopping playback");

        if let Some(player) = &self.inner.player {
            player.stop();
        }

        if let Some(client) = self.vad_client() {
            self.request_mode(client, VadMode::Full);
        }

        self.emit(UiEventType::Listening);
        self.reset_buffer(false);
        self.inner.state.record_interaction(true);

        let duration = signal.speech_duration();
        self.forward_speech(signal.audio.unwrap_or_default(), duration);
    }

    /// Transport or server failure reported by the VAD client
    pub fn handle_vad_error(&self, err: &Error) {
        match err {
            Error::ReconnectExhausted(attempts) => tracing::error!(
                attempts,
                "vad reconnection exhausted, continuous listening paused until reconnect"
            ),
            other => tracing::warn!(error = %other, "vad client error"),
        }
    }

    fn handle_vad_wake_word(&self, signal: &WakeSignal) {
        let client = self
            .inner
            .wake_word
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        match client {
            Some(client) => {
                client.handle_event(signal);
            }
            None => tracing::debug!(wake_word = %signal.wake_word, "wake word client not initialized"),
        }
    }

    fn forward_speech(&self, audio: Vec<u8>, duration: Option<Duration>) {
        if audio.is_empty() {
            return;
        }
        let Some(observer) = self.speech_observer() else {
            return;
        };

        let duration = duration.unwrap_or_else(|| pcm_duration(audio.len()));
        events::dispatch(move || observer(SpeechCapture { audio, duration }));
    }

    /// Start continuous listening from `source`
    ///
    /// Connects the VAD client first if needed. Calling this while already
    /// listening is a no-op and drops `source`.
    ///
    /// # Errors
    ///
    /// Returns error if VAD is disabled or the connection cannot be made
    pub async fn start_listening(&self, source: Box<dyn AudioSource>) -> Result<()> {
        let _serial = self.inner.listen_lock.lock().await;

        if self.is_listening() {
            return Ok(());
        }

        if !self.is_vad_enabled() {
            return Err(Error::Config("vad is not enabled".to_string()));
        }

        self.initialize_vad()?;
        let client = self
            .vad_client()
            .ok_or_else(|| Error::Vad("vad client unavailable".to_string()))?;

        if !client.is_connected() && !client.is_running() {
            client.connect().await?;
        }

        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        let pump = self.inner.session.child_token();
        *self
            .inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Listener {
            id,
            pump: pump.clone(),
        });

        self.emit(UiEventType::Listening);
        tracing::info!("started continuous listening");

        let this = self.clone();
        tokio::spawn(async move {
            this.capture_pump(source, client, pump).await;
            this.listener_finished(id);
        });

        Ok(())
    }

    async fn capture_pump(
        &self,
        mut source: Box<dyn AudioSource>,
        client: VadClient,
        pump: CancellationToken,
    ) {
        loop {
            let frame = tokio::select! {
                () = pump.cancelled() => break,
                frame = source.read_frame() => frame,
            };

            match frame {
                Ok(frame) => {
                    self.buffer_frame(&frame);
                    if client.is_connected()
                        && let Err(e) = client.send_audio_frame(&frame).await
                    {
                        tracing::debug!(error = %e, "failed to send audio frame");
                    }
                }
                Err(e) if e.is_end_of_stream() => {
                    tracing::debug!("audio source exhausted");
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "error reading audio frame");
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            }
        }

        if let Err(e) = source.close().await {
            tracing::debug!(error = %e, "error closing audio source");
        }
        tracing::debug!("audio capture loop stopped");
    }

    fn listener_finished(&self, id: u64) {
        let mut listener = self
            .inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if listener.as_ref().is_some_and(|l| l.id == id) {
            *listener = None;
        }
    }

    /// Stop the capture pump, keeping the VAD connection open
    pub fn stop_listening(&self) {
        let listener = self
            .inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(listener) = listener {
            listener.pump.cancel();
            self.emit(UiEventType::Idle);
            tracing::info!("stopped continuous listening");
        }
    }

    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Stop listening and close the VAD connection
    ///
    /// # Errors
    ///
    /// Returns error if the connection fails to close cleanly
    pub async fn close_vad(&self) -> Result<()> {
        self.stop_listening();

        let client = self
            .inner
            .vad
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match client {
            Some(client) => client.close().await,
            None => Ok(()),
        }
    }

    // -- wake word --------------------------------------------------------

    #[must_use]
    pub fn wake_word_client(&self) -> Option<Arc<WakeWordClient>> {
        self.inner
            .wake_word
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Create the wake word client and route its detections here
    ///
    /// No-op when disabled or already initialized.
    ///
    /// # Errors
    ///
    /// Returns error if the wake word configuration is invalid
    pub fn initialize_wake_word(&self) -> Result<()> {
        let Some(config) = self.inner.config.wake_word.clone().filter(|c| c.enabled) else {
            tracing::debug!("wake word detection not enabled");
            return Ok(());
        };

        let mut slot = self
            .inner
            .wake_word
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Ok(());
        }

        let client = WakeWordClient::new(config)?;
        let weak = Arc::downgrade(&self.inner);
        client.on_wake_word(Arc::new(move |detection| {
            if let Some(this) = Self::upgrade(&weak) {
                this.handle_wake_word_detected(detection);
            }
        }));

        tracing::info!(wake_words = ?client.wake_words(), threshold = client.threshold(), "wake word client initialized");
        *slot = Some(Arc::new(client));
        Ok(())
    }

    /// Look for a wake phrase in an STT transcript
    ///
    /// Detections go through the same path as detector hits.
    pub fn check_transcript(&self, transcript: &str) -> Option<WakeDetection> {
        self.wake_word_client()?.check_transcript(transcript)
    }

    fn handle_wake_word_detected(&self, detection: WakeDetection) {
        tracing::info!(
            wake_word = %detection.wake_word,
            confidence = detection.confidence,
            "wake word detected"
        );

        if let Some(persona) = self.inner.personas.get(&detection.wake_word) {
            let current = self.persona_name();
            if *persona != current {
                tracing::info!(from = %current, to = %persona, "switching persona from wake word");
                self.set_persona_name(persona.clone());
            }
        }

        self.emit(UiEventType::Listening);

        let observer = self
            .inner
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .on_wake_word_detected
            .clone();
        if let Some(observer) = observer {
            events::dispatch(move || observer(detection));
        }
    }
}
