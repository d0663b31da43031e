//! Real-time multimodal inference orchestration
//!
//! Model residency, streaming chat generation, hands-free voice turns and a
//! periodic camera description loop, each behind an engine-agnostic trait.

pub mod audio;
pub mod backend;
pub mod config;
pub mod error;
pub mod generation;
pub mod live;
pub mod resource;
pub mod sim;
pub mod utils;
pub mod vision;
pub mod voice;

pub use config::ParleyConfig;
pub use error::{ParleyError, PipelineStage, Result};
pub use generation::StreamingGenerationController;
pub use live::LiveInferenceLoop;
pub use resource::{LoadState, ModelCategory, ModelRegistry, ResourceLoader};
pub use voice::{VoiceHandle, VoiceOrchestrator};
