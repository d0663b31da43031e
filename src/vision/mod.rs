//! Camera frame description, single-shot and live

mod describer;
mod session;

pub use describer::{Description, FrameDescriber};
pub use session::VisionSession;

use crate::backend::{BackendError, SamplingParams};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// A captured RGB frame
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    /// Packed RGB8, row-major
    pub pixels: Vec<u8>,
    pub captured_at: DateTime<Utc>,
}

impl Frame {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Self {
        Self {
            width,
            height,
            pixels,
            captured_at: Utc::now(),
        }
    }

    /// Longest side in pixels
    pub fn max_dim(&self) -> u32 {
        self.width.max(self.height)
    }
}

/// A camera-like producer
///
/// Singly owned: the device is stopped before another holder starts it.
#[async_trait]
pub trait FrameSource: Send + Sync {
    fn start(&self) -> Result<()>;
    fn stop(&self);
    fn is_capturing(&self) -> bool;

    /// Grab the current frame scaled so its longest side is at most `max_dim`;
    /// `None` when no frame is available yet
    async fn capture_frame(&self, max_dim: u32) -> Result<Option<Frame>>;
}

/// Vision-language inference
#[async_trait]
pub trait VisionBackend: Send + Sync {
    async fn process(
        &self,
        frame: &Frame,
        prompt: &str,
        params: &SamplingParams,
    ) -> std::result::Result<String, BackendError>;
}
