//! Shared voice state
//!
//! The orchestrator is the only writer. UIs and tests read snapshots.

use parking_lot::RwLock;
use std::sync::Arc;

/// Voice pipeline state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VoiceState {
    #[default]
    Idle,
    /// Ensuring the VAD, recognizer, language and synthesis models
    LoadingModels,
    /// Capture running, waiting for a speech segment
    Listening,
    /// Transcribe, generate and synthesize; capture stopped
    Processing,
    /// Playing the synthesized response
    Speaking,
}

impl VoiceState {
    pub fn is_idle(&self) -> bool {
        matches!(self, VoiceState::Idle)
    }

    pub fn is_listening(&self) -> bool {
        matches!(self, VoiceState::Listening)
    }

    /// A turn is being handled
    pub fn is_busy(&self) -> bool {
        matches!(self, VoiceState::Processing | VoiceState::Speaking)
    }
}

impl std::fmt::Display for VoiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VoiceState::Idle => write!(f, "Idle"),
            VoiceState::LoadingModels => write!(f, "Loading models"),
            VoiceState::Listening => write!(f, "Listening"),
            VoiceState::Processing => write!(f, "Processing"),
            VoiceState::Speaking => write!(f, "Speaking"),
        }
    }
}

/// Point-in-time copy of everything a voice UI shows
#[derive(Clone, Debug, Default)]
pub struct VoiceSnapshot {
    pub state: VoiceState,
    /// Last recognized utterance
    pub transcript: Option<String>,
    /// Response text so far
    pub response: String,
    /// Capture level in `[0, 1]`; zero outside Listening
    pub audio_level: f32,
    pub last_error: Option<String>,
    pub turns_completed: usize,
    pub segments_discarded: usize,
}

impl VoiceSnapshot {
    /// Reset per-turn output when a new listening session begins
    pub fn clear_turn(&mut self) {
        self.transcript = None;
        self.response.clear();
        self.last_error = None;
    }
}

/// Thread-safe handle on the voice snapshot
#[derive(Clone, Default)]
pub struct SharedVoiceState {
    inner: Arc<RwLock<VoiceSnapshot>>,
}

impl SharedVoiceState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> VoiceSnapshot {
        self.inner.read().clone()
    }

    pub fn state(&self) -> VoiceState {
        self.inner.read().state
    }

    pub fn transcript(&self) -> Option<String> {
        self.inner.read().transcript.clone()
    }

    pub fn response(&self) -> String {
        self.inner.read().response.clone()
    }

    pub fn audio_level(&self) -> f32 {
        self.inner.read().audio_level
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.read().last_error.clone()
    }

    pub(crate) fn update<F: FnOnce(&mut VoiceSnapshot)>(&self, f: F) {
        f(&mut self.inner.write());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(VoiceState::default().is_idle());
        assert!(VoiceState::Processing.is_busy());
        assert!(VoiceState::Speaking.is_busy());
        assert!(!VoiceState::Listening.is_busy());
        assert_eq!(VoiceState::LoadingModels.to_string(), "Loading models");
    }

    #[test]
    fn test_clear_turn_keeps_counters() {
        let shared = SharedVoiceState::new();
        shared.update(|s| {
            s.transcript = Some("hello".into());
            s.response = "hi there".into();
            s.last_error = Some("boom".into());
            s.turns_completed = 2;
        });
        shared.update(VoiceSnapshot::clear_turn);

        let snapshot = shared.snapshot();
        assert!(snapshot.transcript.is_none());
        assert!(snapshot.response.is_empty());
        assert!(snapshot.last_error.is_none());
        assert_eq!(snapshot.turns_completed, 2);
    }
}
