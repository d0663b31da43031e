//! Inference backend contracts
//!
//! The engines themselves (language model, speech recognition, speech
//! synthesis) live outside this crate. The core only sees these traits.

use crate::audio::SynthesizedAudio;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Errors reported by an inference backend
///
/// Backends classify their own faults: a `TransientFault` is a known crash
/// signature (runtime trap, out-of-bounds memory access) after which the next
/// call is expected to work again.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("{0}")]
    TransientFault(String),

    #[error("{0}")]
    Failed(String),
}

impl BackendError {
    pub fn failed(message: impl Into<String>) -> Self {
        BackendError::Failed(message.into())
    }

    pub fn transient(message: impl Into<String>) -> Self {
        BackendError::TransientFault(message.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::TransientFault(_))
    }

    pub fn message(&self) -> &str {
        match self {
            BackendError::TransientFault(m) | BackendError::Failed(m) => m,
        }
    }
}

/// Sampling parameters for a generation request
#[derive(Clone, Debug, PartialEq)]
pub struct SamplingParams {
    /// Maximum tokens to generate
    pub max_tokens: usize,
    /// Temperature for sampling (0.0 = deterministic)
    pub temperature: f32,
    /// Nucleus sampling threshold
    pub top_p: f32,
    /// Top-k cutoff (0 disables)
    pub top_k: u32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            max_tokens: 256,
            temperature: 0.7,
            top_p: 0.9,
            top_k: 40,
        }
    }
}

impl SamplingParams {
    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = top_p;
        self
    }

    pub fn with_top_k(mut self, top_k: u32) -> Self {
        self.top_k = top_k;
        self
    }
}

/// A single text generation request
#[derive(Clone, Debug)]
pub struct GenerationRequest {
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub params: SamplingParams,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, params: SamplingParams) -> Self {
        Self {
            prompt: prompt.into(),
            system_prompt: None,
            params,
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }
}

/// What the backend reports once its token stream has finished
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Completion {
    /// Full response text; may be empty if the backend only streams
    pub text: String,
    /// Number of tokens generated
    pub tokens_used: usize,
}

/// A lazy, cancellable token stream
///
/// Dropping both halves tears the stream down. Backends must also stop
/// producing once the `CancellationToken` passed to `generate_stream` fires.
pub struct TokenStream {
    pub tokens: BoxStream<'static, std::result::Result<String, BackendError>>,
    pub completion: BoxFuture<'static, std::result::Result<Completion, BackendError>>,
}

/// Token-streaming text generation
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn generate_stream(
        &self,
        request: GenerationRequest,
        cancel: CancellationToken,
    ) -> std::result::Result<TokenStream, BackendError>;
}

/// Speech-to-text
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(
        &self,
        samples: &[f32],
        sample_rate: u32,
    ) -> std::result::Result<String, BackendError>;
}

/// Text-to-speech
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> std::result::Result<SynthesizedAudio, BackendError>;
}
