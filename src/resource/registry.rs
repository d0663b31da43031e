//! Process-wide model residency
//!
//! One slot per [`ModelCategory`]. A slot's state is published on a watch
//! channel; loads are spawned on the runtime and shared between every caller
//! that asks for the same category while the load is running.

use super::state::{LoadState, ModelCategory};
use super::ModelProvider;
use crate::error::{ParleyError, Result};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

type LoadFuture = Shared<BoxFuture<'static, Result<()>>>;

struct Slot {
    category: ModelCategory,
    state_tx: watch::Sender<LoadState>,
    /// Guards both the in-flight future and terminal state publication
    inflight: Mutex<Option<LoadFuture>>,
}

impl Slot {
    fn new(category: ModelCategory) -> Self {
        let (state_tx, _) = watch::channel(LoadState::Idle);
        Self {
            category,
            state_tx,
            inflight: Mutex::new(None),
        }
    }

    fn state(&self) -> LoadState {
        self.state_tx.borrow().clone()
    }

    fn transition(&self, next: LoadState) {
        let category = self.category;
        self.state_tx.send_if_modified(|current| {
            if current.can_transition_to(&next) {
                debug!("{} model: {} -> {}", category, current, next);
                *current = next;
                true
            } else {
                warn!("{} model: ignoring transition {} -> {}", category, current, next);
                false
            }
        });
    }
}

/// Download progress sink handed to a [`ModelProvider`]
///
/// Values are clamped to `[0, 1]`; regressions and NaN are dropped, so the
/// published progress never decreases.
#[derive(Clone)]
pub struct ProgressReporter {
    slot: Arc<Slot>,
}

impl ProgressReporter {
    pub fn category(&self) -> ModelCategory {
        self.slot.category
    }

    /// Report download progress as a fraction
    pub fn report(&self, fraction: f32) {
        if fraction.is_nan() {
            return;
        }
        let fraction = fraction.clamp(0.0, 1.0);
        self.slot.state_tx.send_if_modified(|state| match state {
            LoadState::Downloading { progress } if fraction > *progress => {
                *progress = fraction;
                true
            }
            _ => false,
        });
    }

    /// Report progress from a byte count
    pub fn report_bytes(&self, received: u64, total: u64) {
        if total > 0 {
            self.report(received as f32 / total as f32);
        }
    }

    /// Last published progress, if downloading
    pub fn current(&self) -> Option<f32> {
        self.slot.state_tx.borrow().progress()
    }
}

struct RegistryInner {
    provider: Arc<dyn ModelProvider>,
    slots: Mutex<HashMap<ModelCategory, Arc<Slot>>>,
}

/// Registry of resident models, shared by cloning
#[derive(Clone)]
pub struct ModelRegistry {
    inner: Arc<RegistryInner>,
}

impl ModelRegistry {
    pub fn new(provider: Arc<dyn ModelProvider>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                provider,
                slots: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Slots are created on first reference and live as long as the registry
    fn slot(&self, category: ModelCategory) -> Arc<Slot> {
        self.inner
            .slots
            .lock()
            .entry(category)
            .or_insert_with(|| Arc::new(Slot::new(category)))
            .clone()
    }

    pub fn state(&self, category: ModelCategory) -> LoadState {
        self.slot(category).state()
    }

    /// Watch a category's state
    pub fn subscribe(&self, category: ModelCategory) -> watch::Receiver<LoadState> {
        self.slot(category).state_tx.subscribe()
    }

    /// States of every category referenced so far
    pub fn snapshot(&self) -> Vec<(ModelCategory, LoadState)> {
        let slots = self.inner.slots.lock();
        let mut states: Vec<_> = slots
            .iter()
            .map(|(category, slot)| (*category, slot.state()))
            .collect();
        states.sort_by_key(|(category, _)| *category);
        states
    }

    pub fn loader(&self, category: ModelCategory) -> super::ResourceLoader {
        super::ResourceLoader::new(self.clone(), category)
    }

    /// Make a category resident
    ///
    /// Returns immediately when Ready, joins the running load when one is in
    /// flight, and otherwise starts a fresh download-then-initialize.
    pub async fn ensure(&self, category: ModelCategory) -> Result<()> {
        let slot = self.slot(category);
        let load = {
            let mut inflight = slot.inflight.lock();
            if slot.state().is_ready() {
                return Ok(());
            }
            match inflight.as_ref() {
                Some(load) => {
                    debug!("Joining in-flight {} model load", category);
                    load.clone()
                }
                None => {
                    slot.transition(LoadState::Downloading { progress: 0.0 });
                    let load = self.spawn_load(slot.clone());
                    *inflight = Some(load.clone());
                    load
                }
            }
        };
        load.await
    }

    fn spawn_load(&self, slot: Arc<Slot>) -> LoadFuture {
        let provider = self.inner.provider.clone();
        let category = slot.category;

        let load = {
            let slot = slot.clone();
            tokio::spawn(async move {
                info!("Loading {} model", category);
                let reporter = ProgressReporter { slot };
                run_load(provider.as_ref(), &reporter).await
            })
        };

        // Settles the slot even when the provider panics, and runs whether or
        // not anyone is still awaiting the load
        let settle = tokio::spawn(async move {
            let outcome = match load.await {
                Ok(outcome) => outcome,
                Err(e) => Err(format!("load task aborted: {}", e)),
            };

            let mut inflight = slot.inflight.lock();
            match &outcome {
                Ok(()) => {
                    info!("{} model ready", category);
                    slot.transition(LoadState::Ready);
                }
                Err(reason) => {
                    warn!("{} model failed to load: {}", category, reason);
                    slot.transition(LoadState::Failed(reason.clone()));
                }
            }
            *inflight = None;
            outcome
        });

        async move {
            let outcome = match settle.await {
                Ok(outcome) => outcome,
                Err(e) => Err(format!("load task aborted: {}", e)),
            };
            outcome.map_err(|reason| ParleyError::ResourceLoad { category, reason })
        }
        .boxed()
        .shared()
    }
}

async fn run_load(
    provider: &dyn ModelProvider,
    reporter: &ProgressReporter,
) -> std::result::Result<(), String> {
    let category = reporter.category();
    provider
        .download(category, reporter)
        .await
        .map_err(|e| e.message().to_string())?;

    // Downloading always ends at 100% before Loading is observed
    reporter.report(1.0);
    reporter.slot.transition(LoadState::Loading);

    provider
        .initialize(category)
        .await
        .map_err(|e| e.message().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct CountingProvider {
        downloads: AtomicUsize,
        fail_first: bool,
    }

    #[async_trait]
    impl ModelProvider for CountingProvider {
        async fn download(
            &self,
            _category: ModelCategory,
            progress: &ProgressReporter,
        ) -> std::result::Result<(), BackendError> {
            let attempt = self.downloads.fetch_add(1, Ordering::SeqCst);
            for step in 1..=4 {
                tokio::time::sleep(Duration::from_millis(10)).await;
                progress.report(step as f32 * 0.2);
            }
            if self.fail_first && attempt == 0 {
                return Err(BackendError::failed("network unreachable"));
            }
            Ok(())
        }

        async fn initialize(
            &self,
            _category: ModelCategory,
        ) -> std::result::Result<(), BackendError> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_ensure_coalesces() {
        let provider = Arc::new(CountingProvider::default());
        let registry = ModelRegistry::new(provider.clone());

        let (a, b, c) = tokio::join!(
            registry.ensure(ModelCategory::Language),
            registry.ensure(ModelCategory::Language),
            registry.ensure(ModelCategory::Language),
        );
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(provider.downloads.load(Ordering::SeqCst), 1);
        assert!(registry.state(ModelCategory::Language).is_ready());

        // Ready returns without touching the provider
        registry.ensure(ModelCategory::Language).await.unwrap();
        assert_eq!(provider.downloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_then_retry() {
        let provider = Arc::new(CountingProvider {
            fail_first: true,
            ..Default::default()
        });
        let registry = ModelRegistry::new(provider.clone());

        let err = registry.ensure(ModelCategory::Multimodal).await.unwrap_err();
        assert!(matches!(
            err,
            ParleyError::ResourceLoad { category: ModelCategory::Multimodal, .. }
        ));
        assert_eq!(
            registry.state(ModelCategory::Multimodal).failure_reason(),
            Some("network unreachable")
        );

        registry.ensure(ModelCategory::Multimodal).await.unwrap();
        assert_eq!(provider.downloads.load(Ordering::SeqCst), 2);
        assert!(registry.state(ModelCategory::Multimodal).is_ready());
    }

    /// Panics on its first download, succeeds afterwards
    #[derive(Default)]
    struct PanickingProvider {
        downloads: AtomicUsize,
    }

    #[async_trait]
    impl ModelProvider for PanickingProvider {
        async fn download(
            &self,
            _category: ModelCategory,
            progress: &ProgressReporter,
        ) -> std::result::Result<(), BackendError> {
            if self.downloads.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("weights file truncated");
            }
            progress.report(1.0);
            Ok(())
        }

        async fn initialize(
            &self,
            _category: ModelCategory,
        ) -> std::result::Result<(), BackendError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_panicking_provider_leaves_slot_retryable() {
        let provider = Arc::new(PanickingProvider::default());
        let registry = ModelRegistry::new(provider.clone());

        let err = registry.ensure(ModelCategory::SpeechSynthesis).await.unwrap_err();
        assert!(matches!(
            err,
            ParleyError::ResourceLoad { category: ModelCategory::SpeechSynthesis, .. }
        ));
        let state = registry.state(ModelCategory::SpeechSynthesis);
        assert!(state.is_failed(), "{state}");
        assert!(state.failure_reason().is_some_and(|r| r.contains("load task aborted")));

        registry.ensure(ModelCategory::SpeechSynthesis).await.unwrap();
        assert_eq!(provider.downloads.load(Ordering::SeqCst), 2);
        assert!(registry.state(ModelCategory::SpeechSynthesis).is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_caller_does_not_abort_load() {
        let provider = Arc::new(CountingProvider::default());
        let registry = ModelRegistry::new(provider.clone());

        let first = registry.ensure(ModelCategory::Audio);
        let _ = tokio::time::timeout(Duration::from_millis(15), first).await;
        assert!(registry.state(ModelCategory::Audio).is_in_flight());

        registry.ensure(ModelCategory::Audio).await.unwrap();
        assert_eq!(provider.downloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reporter_is_monotonic_and_clamped() {
        let slot = Arc::new(Slot::new(ModelCategory::Language));
        slot.transition(LoadState::Downloading { progress: 0.0 });
        let reporter = ProgressReporter { slot: slot.clone() };

        reporter.report(0.5);
        reporter.report(0.3);
        assert_eq!(reporter.current(), Some(0.5));
        reporter.report(f32::NAN);
        assert_eq!(reporter.current(), Some(0.5));
        reporter.report(7.0);
        assert_eq!(reporter.current(), Some(1.0));
        reporter.report_bytes(10, 0);
        assert_eq!(reporter.current(), Some(1.0));
    }
}
