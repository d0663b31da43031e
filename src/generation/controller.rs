//! Chat generation controller
//!
//! One active session per controller. Each session runs on its own task,
//! reports throttled snapshots on the event channel and ends in exactly one
//! terminal result.

use super::stream::{drive_stream, GenerationStats, StreamEnd};
use crate::backend::{GenerationRequest, InferenceBackend, SamplingParams};
use crate::error::{ParleyError, Result};
use crate::resource::ResourceLoader;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Chat generation settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub max_tokens: usize,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub system_prompt: Option<String>,
    /// Minimum spacing between UI snapshots, in milliseconds
    pub update_interval_ms: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        let params = SamplingParams::default();
        Self {
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            top_p: params.top_p,
            top_k: params.top_k,
            system_prompt: None,
            update_interval_ms: 16,
        }
    }
}

impl GenerationConfig {
    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_update_interval(mut self, interval: Duration) -> Self {
        self.update_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn sampling(&self) -> SamplingParams {
        SamplingParams {
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
            top_k: self.top_k,
        }
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }
}

/// How a session ended
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum GenerationOutcome {
    Completed,
    Cancelled,
    Failed(String),
}

/// Terminal result of a session
#[derive(Clone, Debug, Serialize)]
pub struct GenerationResult {
    /// Response text, or "Error: ..." when the session failed
    pub text: String,
    pub outcome: GenerationOutcome,
    pub stats: GenerationStats,
}

impl GenerationResult {
    fn failed(message: String) -> Self {
        Self {
            text: format!("Error: {}", message),
            outcome: GenerationOutcome::Failed(message),
            stats: GenerationStats::default(),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.outcome == GenerationOutcome::Completed
    }
}

/// Events emitted by the controller
#[derive(Clone, Debug)]
pub enum GenerationEvent {
    Started { session: Uuid, prompt: String },
    /// Accumulated text so far
    Update { session: Uuid, text: String },
    Finished { session: Uuid, result: GenerationResult },
}

struct ActiveSession {
    id: Uuid,
    cancel: CancellationToken,
}

/// Handle on one running generation
pub struct GenerationSession {
    id: Uuid,
    cancel: CancellationToken,
    finished: Arc<AtomicBool>,
    result_rx: watch::Receiver<Option<GenerationResult>>,
}

impl GenerationSession {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Idempotent; a no-op once the session has finished
    pub fn cancel(&self) {
        if !self.is_finished() {
            self.cancel.cancel();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Wait for the terminal result
    pub async fn wait(mut self) -> GenerationResult {
        match self.result_rx.wait_for(Option::is_some).await {
            Ok(result) => result
                .clone()
                .unwrap_or_else(|| {
                    GenerationResult::failed("session ended without a result".into())
                }),
            Err(_) => GenerationResult::failed("session task exited unexpectedly".into()),
        }
    }
}

/// Streams chat responses from an inference backend
pub struct StreamingGenerationController {
    backend: Arc<dyn InferenceBackend>,
    loader: Option<ResourceLoader>,
    config: GenerationConfig,
    active: Arc<Mutex<Option<ActiveSession>>>,
    event_tx: Sender<GenerationEvent>,
}

impl StreamingGenerationController {
    /// Create a controller and the receiving end of its event channel
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        config: GenerationConfig,
    ) -> (Self, Receiver<GenerationEvent>) {
        let (event_tx, event_rx) = unbounded();
        let controller = Self {
            backend,
            loader: None,
            config,
            active: Arc::new(Mutex::new(None)),
            event_tx,
        };
        (controller, event_rx)
    }

    /// Make every session ensure this model is resident first
    pub fn with_loader(mut self, loader: ResourceLoader) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    pub fn is_busy(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Start a session with the configured sampling parameters
    pub fn generate(&self, prompt: impl Into<String>) -> Result<GenerationSession> {
        self.generate_with(prompt, self.config.sampling())
    }

    /// Start a session; fails with `SessionBusy` while another is running
    pub fn generate_with(
        &self,
        prompt: impl Into<String>,
        params: SamplingParams,
    ) -> Result<GenerationSession> {
        let prompt = prompt.into();
        let mut active = self.active.lock();
        if active.is_some() {
            return Err(ParleyError::SessionBusy);
        }

        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let finished = Arc::new(AtomicBool::new(false));
        let (result_tx, result_rx) = watch::channel(None);

        let mut request = GenerationRequest::new(prompt.clone(), params);
        if let Some(system_prompt) = &self.config.system_prompt {
            request = request.with_system_prompt(system_prompt.clone());
        }

        let task = SessionTask {
            id,
            request,
            backend: self.backend.clone(),
            loader: self.loader.clone(),
            update_interval: self.config.update_interval(),
            cancel: cancel.clone(),
            finished: finished.clone(),
            active: self.active.clone(),
            event_tx: self.event_tx.clone(),
            result_tx,
        };

        *active = Some(ActiveSession {
            id,
            cancel: cancel.clone(),
        });
        drop(active);

        info!("Starting generation session {}", id);
        let _ = self.event_tx.send(GenerationEvent::Started {
            session: id,
            prompt,
        });
        tokio::spawn(task.run());

        Ok(GenerationSession {
            id,
            cancel,
            finished,
            result_rx,
        })
    }

    /// Cancel the active session, if any
    pub fn cancel(&self) {
        if let Some(session) = self.active.lock().as_ref() {
            debug!("Cancelling generation session {}", session.id);
            session.cancel.cancel();
        }
    }
}

struct SessionTask {
    id: Uuid,
    request: GenerationRequest,
    backend: Arc<dyn InferenceBackend>,
    loader: Option<ResourceLoader>,
    update_interval: Duration,
    cancel: CancellationToken,
    finished: Arc<AtomicBool>,
    active: Arc<Mutex<Option<ActiveSession>>>,
    event_tx: Sender<GenerationEvent>,
    result_tx: watch::Sender<Option<GenerationResult>>,
}

impl SessionTask {
    async fn run(self) {
        let result = self.execute().await;

        {
            let mut active = self.active.lock();
            if active.as_ref().map(|s| s.id) == Some(self.id) {
                *active = None;
            }
        }
        self.finished.store(true, Ordering::SeqCst);

        match &result.outcome {
            GenerationOutcome::Completed => info!(
                "Session {} completed: {} tokens in {}ms ({:.1} tok/s)",
                self.id,
                result.stats.tokens_used,
                result.stats.latency_ms(),
                result.stats.tokens_per_second
            ),
            GenerationOutcome::Cancelled => info!("Session {} cancelled", self.id),
            GenerationOutcome::Failed(e) => warn!("Session {} failed: {}", self.id, e),
        }

        let _ = self.result_tx.send(Some(result.clone()));
        let _ = self.event_tx.send(GenerationEvent::Finished {
            session: self.id,
            result,
        });
    }

    async fn execute(&self) -> GenerationResult {
        if let Some(loader) = &self.loader {
            let loaded = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(ParleyError::Cancelled),
                loaded = loader.ensure() => loaded,
            };
            match loaded {
                Ok(()) => {}
                Err(ParleyError::Cancelled) => {
                    return GenerationResult {
                        text: String::new(),
                        outcome: GenerationOutcome::Cancelled,
                        stats: GenerationStats::default(),
                    }
                }
                Err(e) => return GenerationResult::failed(e.to_string()),
            }
        }

        let id = self.id;
        let event_tx = &self.event_tx;
        let report = drive_stream(
            self.backend.as_ref(),
            self.request.clone(),
            &self.cancel,
            self.update_interval,
            |text| {
                let _ = event_tx.send(GenerationEvent::Update {
                    session: id,
                    text: text.to_string(),
                });
            },
        )
        .await;

        match report.end {
            StreamEnd::Completed => GenerationResult {
                text: report.text,
                outcome: GenerationOutcome::Completed,
                stats: report.stats,
            },
            StreamEnd::Cancelled => GenerationResult {
                text: report.text,
                outcome: GenerationOutcome::Cancelled,
                stats: report.stats,
            },
            StreamEnd::Failed(e) => GenerationResult {
                stats: report.stats,
                ..GenerationResult::failed(e.to_string())
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendError;
    use crate::resource::{ModelCategory, ModelRegistry};
    use crate::sim::{ScriptedBackend, ScriptedModelProvider};

    #[tokio::test(start_paused = true)]
    async fn test_second_session_is_rejected_while_busy() {
        let backend = Arc::new(
            ScriptedBackend::new(["one", " two"]).with_token_delay(Duration::from_millis(20)),
        );
        let (controller, _events) =
            StreamingGenerationController::new(backend, GenerationConfig::default());

        let session = controller.generate("hello").unwrap();
        assert!(matches!(controller.generate("again"), Err(ParleyError::SessionBusy)));

        let result = session.wait().await;
        assert_eq!(result.text, "one two");
        assert!(!controller.is_busy());
        assert!(controller.generate("again").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_idempotent_and_noop_after_finish() {
        let backend =
            Arc::new(ScriptedBackend::new(["a"; 50]).with_token_delay(Duration::from_millis(10)));
        let (controller, events) =
            StreamingGenerationController::new(backend, GenerationConfig::default());

        let session = controller.generate("go").unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;
        session.cancel();
        session.cancel();
        controller.cancel();

        let result = session.wait().await;
        assert_eq!(result.outcome, GenerationOutcome::Cancelled);

        let finished = events
            .try_iter()
            .filter(|e| matches!(e, GenerationEvent::Finished { .. }))
            .count();
        assert_eq!(finished, 1);
        controller.cancel();
    }

    #[tokio::test]
    async fn test_stream_error_becomes_error_text() {
        let backend = Arc::new(
            ScriptedBackend::new(["partial"])
                .failing_after(1, BackendError::failed("context overflow")),
        );
        let (controller, _events) =
            StreamingGenerationController::new(backend, GenerationConfig::default());

        let result = controller.generate("x").unwrap().wait().await;
        assert_eq!(result.text, "Error: context overflow");
        assert_eq!(result.outcome, GenerationOutcome::Failed("context overflow".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_failure_ends_session() {
        let registry = ModelRegistry::new(Arc::new(
            ScriptedModelProvider::new(Duration::from_millis(5))
                .failing(ModelCategory::Language, "no weights"),
        ));
        let backend = Arc::new(ScriptedBackend::new(["unused"]));
        let (controller, _events) =
            StreamingGenerationController::new(backend, GenerationConfig::default());
        let controller = controller.with_loader(registry.loader(ModelCategory::Language));

        let result = controller.generate("x").unwrap().wait().await;
        assert!(matches!(result.outcome, GenerationOutcome::Failed(_)));
        assert!(result.text.starts_with("Error: Failed to load language model"));
    }
}
