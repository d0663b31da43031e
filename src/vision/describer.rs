use super::{Frame, FrameSource, VisionBackend};
use crate::backend::{BackendError, SamplingParams};
use crate::error::{ParleyError, Result};
use crate::live::LiveWork;
use crate::resource::ResourceLoader;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One frame's description
#[derive(Clone, Debug, PartialEq)]
pub struct Description {
    pub text: String,
    pub captured_at: DateTime<Utc>,
    pub latency: Duration,
}

/// Describes camera frames with a vision-language model
///
/// Acquire ensures the model, starts the camera on demand and grabs a frame;
/// release hands the frame buffer back.
pub struct FrameDescriber {
    source: Arc<dyn FrameSource>,
    backend: Arc<dyn VisionBackend>,
    loader: ResourceLoader,
    prompt: String,
    params: SamplingParams,
    capture_dim: u32,
}

impl FrameDescriber {
    pub fn new(
        source: Arc<dyn FrameSource>,
        backend: Arc<dyn VisionBackend>,
        loader: ResourceLoader,
        prompt: impl Into<String>,
        params: SamplingParams,
        capture_dim: u32,
    ) -> Self {
        Self {
            source,
            backend,
            loader,
            prompt: prompt.into(),
            params,
            capture_dim,
        }
    }

    pub fn params(&self) -> &SamplingParams {
        &self.params
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }
}

#[async_trait]
impl LiveWork for FrameDescriber {
    type Input = Frame;
    type Output = Description;

    async fn acquire(&self) -> Result<Option<Frame>> {
        self.loader.ensure().await?;
        if !self.source.is_capturing() {
            self.source.start()?;
        }
        self.source.capture_frame(self.capture_dim).await
    }

    async fn infer(&self, frame: &Frame, _cancel: &CancellationToken) -> Result<Description> {
        let started = Instant::now();
        let text = self
            .backend
            .process(frame, &self.prompt, &self.params)
            .await
            .map_err(|e| match e {
                BackendError::TransientFault(message) => ParleyError::TransientFault(message),
                BackendError::Failed(message) => ParleyError::Generation(message),
            })?;

        Ok(Description {
            text: text.trim().to_string(),
            captured_at: frame.captured_at,
            latency: started.elapsed(),
        })
    }

    async fn release(&self, frame: Frame) {
        debug!("Released {}x{} frame", frame.width, frame.height);
    }
}
