//! Token-streaming text generation
//!
//! [`StreamingGenerationController`] owns chat sessions; [`drive_stream`] is
//! the stream loop it shares with the voice pipeline.

mod controller;
mod stream;
mod throttle;

pub use controller::{
    GenerationConfig, GenerationEvent, GenerationOutcome, GenerationResult, GenerationSession,
    StreamingGenerationController,
};
pub use stream::{drive_stream, GenerationStats, StreamEnd, StreamReport};
pub use throttle::UpdateThrottle;
