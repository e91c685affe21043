//! Transcript aggregation: streamed partial text → finalized turns.
//!
//! The remote service streams transcript fragments for both sides of the
//! conversation out of band with playback. This module accumulates them
//! per speaker, exposes the running text as the live "interim" view, and
//! promotes it to the append-only finalized log exactly once per turn.

/// Who produced a finalized transcript entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    User,
    Agent,
    System,
}

/// One finalized conversation turn. Never mutated after append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptItem {
    pub speaker: Speaker,
    pub text: String,
}

impl TranscriptItem {
    pub fn new(speaker: Speaker, text: impl Into<String>) -> Self {
        Self {
            speaker,
            text: text.into(),
        }
    }
}

/// Per-session transcript state machine.
///
/// Two independent interim accumulators (user, agent) feed one finalized
/// `TranscriptItem` log. Text moves from interim to finalized exactly
/// once, atomically, on turn completion. Interruption signals do not
/// touch this state; they only affect playback.
#[derive(Debug, Default)]
pub struct TranscriptAggregator {
    items: Vec<TranscriptItem>,
    interim_user: String,
    interim_agent: String,
}

impl TranscriptAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a partial fragment of the user's speech.
    pub fn push_user(&mut self, fragment: &str) {
        self.interim_user.push_str(fragment);
    }

    /// Append a partial fragment of the agent's speech.
    pub fn push_agent(&mut self, fragment: &str) {
        self.interim_agent.push_str(fragment);
    }

    /// Finalize the current turn.
    ///
    /// Each non-empty accumulator (after trimming) becomes one finalized
    /// item, user before agent, and both accumulators are cleared. Empty
    /// accumulators produce no item.
    pub fn finalize_turn(&mut self) {
        let user = self.interim_user.trim().to_string();
        let agent = self.interim_agent.trim().to_string();
        if !user.is_empty() {
            self.items.push(TranscriptItem::new(Speaker::User, user));
        }
        if !agent.is_empty() {
            self.items.push(TranscriptItem::new(Speaker::Agent, agent));
        }
        self.interim_user.clear();
        self.interim_agent.clear();
    }

    /// Record that the session opened: one System readiness item.
    pub fn note_open(&mut self, message: &str) {
        self.items.push(TranscriptItem::new(Speaker::System, message));
    }

    /// Record session close or error. Prior finalized items are preserved.
    pub fn note_closed(&mut self, reason: &str) {
        self.items.push(TranscriptItem::new(Speaker::System, reason));
    }

    /// The finalized turn log, in append order.
    pub fn items(&self) -> &[TranscriptItem] {
        &self.items
    }

    /// Live interim views: (user, agent).
    pub fn interim(&self) -> (&str, &str) {
        (&self.interim_user, &self.interim_agent)
    }
}
