//! Model categories and their load lifecycle
//!
//! ```text
//! Idle -> Downloading(p) -> Loading -> Ready
//!   \________\_______________\______-> Failed(reason) -> Downloading (retry)
//! ```

use serde::{Deserialize, Serialize};

/// The kind of model a resource slot holds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelCategory {
    /// Text generation
    Language,
    /// Speech-to-text
    SpeechRecognition,
    /// Text-to-speech
    SpeechSynthesis,
    /// Voice activity detection
    Audio,
    /// Vision-language
    Multimodal,
}

impl ModelCategory {
    pub const ALL: [ModelCategory; 5] = [
        ModelCategory::Language,
        ModelCategory::SpeechRecognition,
        ModelCategory::SpeechSynthesis,
        ModelCategory::Audio,
        ModelCategory::Multimodal,
    ];

    /// Short label used in status banners
    pub fn label(&self) -> &'static str {
        match self {
            ModelCategory::Language => "LLM",
            ModelCategory::SpeechRecognition => "STT",
            ModelCategory::SpeechSynthesis => "TTS",
            ModelCategory::Audio => "VAD",
            ModelCategory::Multimodal => "VLM",
        }
    }
}

impl std::fmt::Display for ModelCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelCategory::Language => write!(f, "language"),
            ModelCategory::SpeechRecognition => write!(f, "speech recognition"),
            ModelCategory::SpeechSynthesis => write!(f, "speech synthesis"),
            ModelCategory::Audio => write!(f, "audio"),
            ModelCategory::Multimodal => write!(f, "multimodal"),
        }
    }
}

/// Load state of a single model slot
#[derive(Clone, Debug, Default, PartialEq)]
pub enum LoadState {
    /// Nothing has been attempted yet
    #[default]
    Idle,
    /// Weights are being fetched; progress in `[0, 1]`
    Downloading { progress: f32 },
    /// Weights are being loaded into the engine
    Loading,
    /// Resident and usable
    Ready,
    /// The last attempt failed
    Failed(String),
}

impl LoadState {
    pub fn is_ready(&self) -> bool {
        matches!(self, LoadState::Ready)
    }

    /// Downloading or Loading
    pub fn is_in_flight(&self) -> bool {
        matches!(self, LoadState::Downloading { .. } | LoadState::Loading)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, LoadState::Failed(_))
    }

    /// Download progress, if downloading
    pub fn progress(&self) -> Option<f32> {
        match self {
            LoadState::Downloading { progress } => Some(*progress),
            _ => None,
        }
    }

    pub fn failure_reason(&self) -> Option<&str> {
        match self {
            LoadState::Failed(reason) => Some(reason),
            _ => None,
        }
    }

    /// Whether moving from `self` to `next` is a legal transition
    pub fn can_transition_to(&self, next: &LoadState) -> bool {
        use LoadState::*;
        match (self, next) {
            (Ready, _) => false,
            (_, Failed(_)) => true,
            (Idle | Failed(_), Downloading { .. }) => true,
            (Downloading { progress: from }, Downloading { progress: to }) => to >= from,
            (Downloading { .. }, Loading) => true,
            (Loading, Ready) => true,
            _ => false,
        }
    }

    /// One-line status text for a model with the given label
    pub fn banner_text(&self, label: &str) -> String {
        match self {
            LoadState::Idle => format!("No {} model loaded.", label),
            LoadState::Downloading { progress } => {
                format!(
                    "Downloading {} model... {}%",
                    label,
                    (progress * 100.0).round() as u32
                )
            }
            LoadState::Loading => format!("Loading {} model into engine...", label),
            LoadState::Ready => format!("{} model ready.", label),
            LoadState::Failed(reason) => format!("Error: {}", reason),
        }
    }
}

impl std::fmt::Display for LoadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadState::Idle => write!(f, "Idle"),
            LoadState::Downloading { progress } => {
                write!(f, "Downloading ({:.0}%)", progress * 100.0)
            }
            LoadState::Loading => write!(f, "Loading"),
            LoadState::Ready => write!(f, "Ready"),
            LoadState::Failed(reason) => write!(f, "Failed: {}", reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let path = [
            LoadState::Idle,
            LoadState::Downloading { progress: 0.0 },
            LoadState::Downloading { progress: 0.5 },
            LoadState::Downloading { progress: 1.0 },
            LoadState::Loading,
            LoadState::Ready,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(&pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_illegal_transitions() {
        assert!(!LoadState::Ready.can_transition_to(&LoadState::Failed("x".into())));
        assert!(!LoadState::Ready.can_transition_to(&LoadState::Loading));
        assert!(!LoadState::Idle.can_transition_to(&LoadState::Loading));
        assert!(!LoadState::Downloading { progress: 0.6 }
            .can_transition_to(&LoadState::Downloading { progress: 0.5 }));
    }

    #[test]
    fn test_failed_can_retry() {
        let failed = LoadState::Failed("timeout".into());
        assert!(failed.can_transition_to(&LoadState::Downloading { progress: 0.0 }));
        assert!(LoadState::Loading.can_transition_to(&failed));
    }

    #[test]
    fn test_banner_text() {
        let label = ModelCategory::Language.label();
        assert_eq!(LoadState::Idle.banner_text(label), "No LLM model loaded.");
        assert_eq!(
            LoadState::Downloading { progress: 0.42 }.banner_text(label),
            "Downloading LLM model... 42%"
        );
        assert_eq!(
            LoadState::Loading.banner_text(label),
            "Loading LLM model into engine..."
        );
        assert_eq!(
            LoadState::Failed("disk full".into()).banner_text(label),
            "Error: disk full"
        );
    }

    #[test]
    fn test_category_display() {
        assert_eq!(ModelCategory::Language.to_string(), "language");
        assert_eq!(ModelCategory::SpeechSynthesis.to_string(), "speech synthesis");
        assert_eq!(ModelCategory::ALL.len(), 5);
    }
}
