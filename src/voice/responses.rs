//! Categorized response pools for wake words and conversation flow

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use super::ConversationState;

/// Placeholder replaced with the active persona name
pub const NAME_PLACEHOLDER: &str = "{name}";

/// Purpose of a response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResponseCategory {
    /// First contact, includes the persona name
    #[serde(rename = "intro")]
    Introduction,
    /// Wake acknowledgement after a long silence
    #[serde(rename = "wake/cold")]
    WakeCold,
    /// Wake acknowledgement shortly after an interaction
    #[serde(rename = "wake/warm")]
    WakeWarm,
    /// Wake acknowledgement mid-conversation
    #[serde(rename = "wake/active")]
    WakeActive,
    /// Clarification for unclear speech
    #[serde(rename = "confused")]
    Confused,
    /// Active-listening filler
    #[serde(rename = "backchannel")]
    Backchannel,
    /// Conversation close
    #[serde(rename = "farewell")]
    Farewell,
    /// Confirms a command was taken
    #[serde(rename = "acknowledge")]
    Acknowledge,
}

impl ResponseCategory {
    /// Every category, in generation order
    pub const ALL: [Self; 8] = [
        Self::Introduction,
        Self::WakeCold,
        Self::WakeWarm,
        Self::WakeActive,
        Self::Confused,
        Self::Backchannel,
        Self::Farewell,
        Self::Acknowledge,
    ];

    /// Path-like category name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Introduction => "intro",
            Self::WakeCold => "wake/cold",
            Self::WakeWarm => "wake/warm",
            Self::WakeActive => "wake/active",
            Self::Confused => "confused",
            Self::Backchannel => "backchannel",
            Self::Farewell => "farewell",
            Self::Acknowledge => "acknowledge",
        }
    }

    /// Wake category matching a conversation state
    #[must_use]
    pub const fn for_state(state: ConversationState) -> Self {
        match state {
            ConversationState::Cold => Self::WakeCold,
            ConversationState::Warm => Self::WakeWarm,
            ConversationState::Active => Self::WakeActive,
        }
    }

    fn fallback(self) -> WakeResponse {
        let (text, volume_scale) = match self {
            Self::Introduction => ("Hi, I'm {name}. What can I help with?", 1.0),
            Self::WakeCold | Self::WakeWarm | Self::WakeActive => ("Yes?", 1.0),
            Self::Confused => ("Say again?", 1.0),
            Self::Backchannel => ("Mhm", 0.8),
            Self::Farewell => ("Sure thing.", 1.0),
            Self::Acknowledge => ("On it.", 1.0),
        };

        WakeResponse {
            text: text.to_string(),
            audio_file: None,
            hours: None,
            volume_scale,
            category: self,
        }
    }
}

impl std::fmt::Display for ResponseCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hour-of-day window `[start, end)`; wraps midnight when `start > end`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HourWindow {
    pub start: u32,
    pub end: u32,
}

impl HourWindow {
    /// Whether `hour` (0-23) falls inside the window
    #[must_use]
    pub const fn contains(self, hour: u32) -> bool {
        if self.start > self.end {
            hour >= self.start || hour < self.end
        } else {
            hour >= self.start && hour < self.end
        }
    }
}

/// A single response line
#[derive(Debug, Clone, PartialEq)]
pub struct WakeResponse {
    /// Text to speak (may contain `{name}`)
    pub text: String,
    /// Pre-generated clip, relative to the cache directory
    pub audio_file: Option<String>,
    /// When the line is appropriate
    pub hours: Option<HourWindow>,
    /// Volume modifier (1.0 normal, 0.4 late-night quiet)
    pub volume_scale: f32,
    pub category: ResponseCategory,
}

impl WakeResponse {
    /// Text with the persona name substituted
    #[must_use]
    pub fn render(&self, persona_name: &str) -> String {
        self.text.replace(NAME_PLACEHOLDER, persona_name)
    }

    /// Whether the text depends on the persona name
    #[must_use]
    pub fn is_personalized(&self) -> bool {
        self.text.contains(NAME_PLACEHOLDER)
    }
}

/// Read-only catalog of response lines
#[derive(Debug, Clone)]
pub struct WakeResponsePool {
    responses: Vec<WakeResponse>,
}

impl WakeResponsePool {
    /// Build a pool from arbitrary lines
    #[must_use]
    pub const fn new(responses: Vec<WakeResponse>) -> Self {
        Self { responses }
    }

    /// Every line, in category order
    #[must_use]
    pub fn all(&self) -> &[WakeResponse] {
        &self.responses
    }

    /// Lines of a category
    pub fn by_category(&self, category: ResponseCategory) -> impl Iterator<Item = &WakeResponse> {
        self.responses.iter().filter(move |r| r.category == category)
    }

    /// Number of lines, introductions excluded
    #[must_use]
    pub fn response_count(&self) -> usize {
        self.responses
            .iter()
            .filter(|r| r.category != ResponseCategory::Introduction)
            .count()
    }

    /// Random line of a category, or its fallback when the category is empty
    #[must_use]
    pub fn pick(&self, category: ResponseCategory) -> WakeResponse {
        let candidates: Vec<&WakeResponse> = self.by_category(category).collect();
        candidates
            .choose(&mut rand::thread_rng())
            .map_or_else(|| category.fallback(), |r| (*r).clone())
    }

    /// Wake acknowledgement for a state at the given local hour
    ///
    /// Cold prefers lines whose hour window contains `hour`, then lines with
    /// no window at all.
    #[must_use]
    pub fn wake_response_at(&self, state: ConversationState, hour: u32) -> WakeResponse {
        let category = ResponseCategory::for_state(state);
        if category != ResponseCategory::WakeCold {
            return self.pick(category);
        }

        let (timed, untimed): (Vec<&WakeResponse>, Vec<&WakeResponse>) =
            self.by_category(category).partition(|r| r.hours.is_some());

        let in_window: Vec<&WakeResponse> = timed
            .into_iter()
            .filter(|r| r.hours.is_some_and(|w| w.contains(hour)))
            .collect();

        let candidates = if in_window.is_empty() { untimed } else { in_window };

        candidates
            .choose(&mut rand::thread_rng())
            .map_or_else(|| category.fallback(), |r| (*r).clone())
    }

    /// Wake acknowledgement for a state at the current local hour
    #[must_use]
    pub fn wake_response(&self, state: ConversationState) -> WakeResponse {
        use chrono::Timelike;
        self.wake_response_at(state, chrono::Local::now().hour())
    }

    #[must_use]
    pub fn introduction(&self) -> WakeResponse {
        self.pick(ResponseCategory::Introduction)
    }

    #[must_use]
    pub fn confused(&self) -> WakeResponse {
        self.pick(ResponseCategory::Confused)
    }

    #[must_use]
    pub fn backchannel(&self) -> WakeResponse {
        self.pick(ResponseCategory::Backchannel)
    }

    #[must_use]
    pub fn farewell(&self) -> WakeResponse {
        self.pick(ResponseCategory::Farewell)
    }

    #[must_use]
    pub fn acknowledge(&self) -> WakeResponse {
        self.pick(ResponseCategory::Acknowledge)
    }
}

fn line(
    category: ResponseCategory,
    text: &str,
    file: &str,
    volume_scale: f32,
    hours: Option<(u32, u32)>,
) -> WakeResponse {
    WakeResponse {
        text: text.to_string(),
        audio_file: Some(format!("{}/{file}", category.as_str())),
        hours: hours.map(|(start, end)| HourWindow { start, end }),
        volume_scale,
        category,
    }
}

impl Default for WakeResponsePool {
    fn default() -> Self {
        use ResponseCategory::{
            Acknowledge, Backchannel, Confused, Farewell, Introduction, WakeActive, WakeCold,
            WakeWarm,
        };

        #[rustfmt::skip]
        let responses = vec![
            line(Introduction, "Hi, I'm {name}. What can I assist with today?", "hi_im_name.wav", 1.0, None),
            line(Introduction, "Hello! I'm {name}. How can I help you?", "hello_im_name.wav", 1.0, None),
            line(Introduction, "Hey there, I'm {name}. What do you need?", "hey_there_im_name.wav", 1.0, None),
            line(WakeCold, "Hi, how can I help?", "hi_how_can_i_help.wav", 1.0, None),
            line(WakeCold, "Hey there. What do you need?", "hey_there.wav", 1.0, None),
            line(WakeCold, "Good morning. How can I assist?", "good_morning.wav", 1.0, Some((5, 12))),
            line(WakeCold, "Good afternoon. What's up?", "good_afternoon.wav", 1.0, Some((12, 17))),
            line(WakeCold, "Evening. What can I do for you?", "evening.wav", 1.0, Some((17, 22))),
            line(WakeCold, "Hey.", "hey_quiet.wav", 0.4, Some((22, 5))),
            line(WakeWarm, "Yeah?", "yeah.wav", 1.0, None),
            line(WakeWarm, "I'm listening.", "im_listening.wav", 1.0, None),
            line(WakeWarm, "Go ahead.", "go_ahead.wav", 1.0, None),
            line(WakeWarm, "What's up?", "whats_up.wav", 1.0, None),
            line(WakeWarm, "Hey.", "hey.wav", 1.0, None),
            line(WakeWarm, "Uh-huh?", "uh_huh.wav", 1.0, None),
            line(WakeActive, "Mhm?", "mhm.wav", 1.0, None),
            line(WakeActive, "Yes?", "yes.wav", 1.0, None),
            line(WakeActive, "Still here.", "still_here.wav", 1.0, None),
            line(Confused, "Say again?", "say_again.wav", 1.0, None),
            line(Confused, "Hmm?", "hmm.wav", 1.0, None),
            line(Confused, "Sorry, what was that?", "sorry_what.wav", 1.0, None),
            line(Confused, "One more time?", "one_more_time.wav", 1.0, None),
            line(Backchannel, "Mhm", "mhm.wav", 0.8, None),
            line(Backchannel, "Uh-huh", "uh_huh.wav", 0.8, None),
            line(Backchannel, "Got it", "got_it.wav", 0.8, None),
            line(Backchannel, "Okay", "okay.wav", 0.8, None),
            line(Backchannel, "Right", "right.wav", 0.8, None),
            line(Farewell, "Sure thing.", "sure_thing.wav", 1.0, None),
            line(Farewell, "Anytime.", "anytime.wav", 1.0, None),
            line(Farewell, "Let me know if you need anything.", "let_me_know.wav", 1.0, None),
            line(Farewell, "I'll be here.", "ill_be_here.wav", 1.0, None),
            line(Acknowledge, "On it.", "on_it.wav", 1.0, None),
            line(Acknowledge, "Got it.", "got_it.wav", 1.0, None),
            line(Acknowledge, "Working on it.", "working_on_it.wav", 1.0, None),
            line(Acknowledge, "Let me check.", "let_me_check.wav", 1.0, None),
        ];

        Self::new(responses)
    }
}
