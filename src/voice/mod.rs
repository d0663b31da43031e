//! Voice turns: listen, transcribe, respond, speak

mod orchestrator;
mod state;

pub use orchestrator::{
    TurnResult, VoiceCommand, VoiceComponents, VoiceEvent, VoiceHandle, VoiceOrchestrator,
    VOICE_MODELS,
};
pub use state::{SharedVoiceState, VoiceSnapshot, VoiceState};
