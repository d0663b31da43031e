//! Error types for the orchestration core
//!
//! Every operation returns a [`ParleyError`] rather than panicking past the
//! component boundary. Errors are `Clone` so a single load failure can be
//! handed to every caller that awaited the same in-flight load.

use crate::resource::ModelCategory;
use thiserror::Error;

/// A stage of a voice turn
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PipelineStage {
    Transcribe,
    Generate,
    Synthesize,
    Playback,
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineStage::Transcribe => write!(f, "transcription"),
            PipelineStage::Generate => write!(f, "generation"),
            PipelineStage::Synthesize => write!(f, "synthesis"),
            PipelineStage::Playback => write!(f, "playback"),
        }
    }
}

/// Orchestration errors
#[derive(Error, Debug, Clone)]
pub enum ParleyError {
    /// A model failed to download or initialize
    #[error("Failed to load {category} model: {reason}")]
    ResourceLoad {
        category: ModelCategory,
        reason: String,
    },

    /// One or more of several required models failed to load
    #[error("Failed to load one or more models: {}", format_failures(.0))]
    CompositeLoad(Vec<(ModelCategory, String)>),

    /// The token stream failed
    #[error("Generation error: {0}")]
    Generation(String),

    /// A recognised backend crash signature; the next attempt may succeed
    #[error("Transient runtime fault: {0}")]
    TransientFault(String),

    /// A voice turn stage failed
    #[error("Voice {stage} failed: {message}")]
    PipelineStage {
        stage: PipelineStage,
        message: String,
    },

    /// A generation session is already running for this context
    #[error("A generation session is already active")]
    SessionBusy,

    /// The operation was cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// Audio or camera device error
    #[error("Device error: {0}")]
    AudioDevice(String),

    /// Channel communication error
    #[error("Channel error: {0}")]
    Channel(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// File system I/O error
    #[error("IO error: {0}")]
    IOError(String),
}

fn format_failures(failures: &[(ModelCategory, String)]) -> String {
    failures
        .iter()
        .map(|(category, reason)| format!("{}: {}", category, reason))
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<std::io::Error> for ParleyError {
    fn from(e: std::io::Error) -> Self {
        ParleyError::IOError(e.to_string())
    }
}

impl ParleyError {
    /// Check if this error is recoverable
    ///
    /// Every load failure is retryable by calling `ensure()` again, and every
    /// generation or turn failure is retryable by starting a new one.
    pub fn is_recoverable(&self) -> bool {
        match self {
            ParleyError::ResourceLoad { .. } => true,
            ParleyError::CompositeLoad(_) => true,
            ParleyError::Generation(_) => true,
            ParleyError::TransientFault(_) => true,
            ParleyError::PipelineStage { .. } => true,
            ParleyError::SessionBusy => true,
            ParleyError::Cancelled => true,
            // Hardware errors may require user intervention
            ParleyError::AudioDevice(_) => false,
            ParleyError::Channel(_) => false,
            ParleyError::Config(_) => false,
            ParleyError::IOError(_) => false,
        }
    }

    /// Whether the next tick of a live loop should simply retry
    pub fn is_transient(&self) -> bool {
        matches!(self, ParleyError::TransientFault(_))
    }

    /// Get a user-friendly description of the error
    pub fn user_message(&self) -> String {
        match self {
            ParleyError::ResourceLoad { category, .. } => {
                format!("Failed to load the {} model. Please retry.", category)
            }
            ParleyError::CompositeLoad(_) => "Failed to load one or more voice models".to_string(),
            ParleyError::Generation(_) => {
                "AI response generation failed. Please try again.".to_string()
            }
            ParleyError::TransientFault(_) => {
                "Recovering from memory error... next frame will retry.".to_string()
            }
            ParleyError::PipelineStage { stage, .. } => {
                format!("Voice {} failed. Please try again.", stage)
            }
            ParleyError::SessionBusy => {
                "Please wait for the current response to finish.".to_string()
            }
            ParleyError::Cancelled => "Cancelled.".to_string(),
            ParleyError::AudioDevice(_) => {
                "Device error. Please check your microphone, speakers or camera.".to_string()
            }
            ParleyError::Channel(_) => {
                "Internal communication error. Please restart the application.".to_string()
            }
            ParleyError::Config(_) => "Configuration error. Please check settings.".to_string(),
            ParleyError::IOError(_) => "File system error occurred.".to_string(),
        }
    }
}

/// Result type alias for orchestration operations
pub type Result<T> = std::result::Result<T, ParleyError>;
