use super::describer::{Description, FrameDescriber};
use super::{FrameSource, VisionBackend};
use crate::config::VisionConfig;
use crate::error::{ParleyError, Result};
use crate::live::{invoke_once, Invocation, LiveInferenceLoop, LoopEvent, LoopPolicy, LoopStats};
use crate::resource::ResourceLoader;
use crossbeam_channel::Receiver;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Camera description: one-off requests plus a live loop
///
/// Both share one busy gate, so a single-shot request and a live tick never
/// run inference on the camera at the same time.
pub struct VisionSession {
    source: Arc<dyn FrameSource>,
    single: FrameDescriber,
    live: LiveInferenceLoop<FrameDescriber>,
    config: VisionConfig,
}

impl VisionSession {
    pub fn new(
        source: Arc<dyn FrameSource>,
        backend: Arc<dyn VisionBackend>,
        loader: ResourceLoader,
        config: VisionConfig,
    ) -> (Self, Receiver<LoopEvent<Description>>) {
        let single = FrameDescriber::new(
            source.clone(),
            backend.clone(),
            loader.clone(),
            config.prompt.clone(),
            config.single_shot_params(),
            config.capture_dim,
        );
        let live_work = Arc::new(FrameDescriber::new(
            source.clone(),
            backend,
            loader,
            config.prompt.clone(),
            config.live_params(),
            config.capture_dim,
        ));
        let policy = LoopPolicy {
            stop_on_fault: config.stop_on_fault,
        };
        let (live, events) = LiveInferenceLoop::new(live_work, policy);

        let session = Self {
            source,
            single,
            live,
            config,
        };
        (session, events)
    }

    /// Describe the current frame once
    pub async fn describe_once(&self) -> Result<Description> {
        self.describe_once_with(&CancellationToken::new()).await
    }

    pub async fn describe_once_with(&self, cancel: &CancellationToken) -> Result<Description> {
        match invoke_once(&self.single, &self.live.gate(), cancel).await {
            Invocation::Output(description) => Ok(description),
            Invocation::Idle => Err(ParleyError::AudioDevice("No camera frame available".into())),
            Invocation::Busy => Err(ParleyError::SessionBusy),
            Invocation::Transient(message) => Err(ParleyError::TransientFault(message)),
            Invocation::Fault(e) => Err(e),
            Invocation::Cancelled => Err(ParleyError::Cancelled),
        }
    }

    pub fn start_live(&self) -> Result<()> {
        info!("Starting live description every {}ms", self.config.live_interval_ms);
        self.live.start(self.config.live_interval())
    }

    /// Idempotent
    pub async fn stop_live(&self) {
        self.live.stop().await;
    }

    pub fn is_live(&self) -> bool {
        self.live.is_running()
    }

    pub fn stats(&self) -> LoopStats {
        self.live.stats()
    }

    /// Stop the loop and release the camera
    pub async fn shutdown(&self) {
        self.stop_live().await;
        self.source.stop();
        info!("Vision session shut down");
    }
}
