use super::registry::ModelRegistry;
use super::state::{LoadState, ModelCategory};
use crate::error::{ParleyError, Result};
use futures::future::join_all;
use tokio::sync::watch;

/// Handle on one category's load lifecycle
#[derive(Clone)]
pub struct ResourceLoader {
    registry: ModelRegistry,
    category: ModelCategory,
}

impl ResourceLoader {
    pub fn new(registry: ModelRegistry, category: ModelCategory) -> Self {
        Self { registry, category }
    }

    pub fn category(&self) -> ModelCategory {
        self.category
    }

    pub fn state(&self) -> LoadState {
        self.registry.state(self.category)
    }

    pub fn is_ready(&self) -> bool {
        self.state().is_ready()
    }

    pub fn subscribe(&self) -> watch::Receiver<LoadState> {
        self.registry.subscribe(self.category)
    }

    /// Status line for this model
    pub fn banner_text(&self) -> String {
        self.state().banner_text(self.category.label())
    }

    /// Idempotent: Ready returns at once, an in-flight load is joined,
    /// Idle or Failed starts a new attempt.
    pub async fn ensure(&self) -> Result<()> {
        self.registry.ensure(self.category).await
    }
}

impl std::fmt::Debug for ResourceLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceLoader")
            .field("category", &self.category)
            .field("state", &self.state())
            .finish()
    }
}

/// Ensure several resources concurrently; all must succeed
///
/// The error names every category that failed, with its reason.
pub async fn ensure_all(loaders: &[ResourceLoader]) -> Result<()> {
    let outcomes = join_all(
        loaders
            .iter()
            .map(|loader| async move { (loader.category(), loader.ensure().await) }),
    )
    .await;

    let failures: Vec<(ModelCategory, String)> = outcomes
        .into_iter()
        .filter_map(|(category, outcome)| match outcome {
            Ok(()) => None,
            Err(ParleyError::ResourceLoad { reason, .. }) => Some((category, reason)),
            Err(other) => Some((category, other.to_string())),
        })
        .collect();

    if failures.is_empty() {
        Ok(())
    } else {
        Err(ParleyError::CompositeLoad(failures))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::ScriptedModelProvider;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_ensure_all_reports_every_failure() {
        let provider = Arc::new(
            ScriptedModelProvider::new(Duration::from_millis(50))
                .failing(ModelCategory::SpeechSynthesis, "voice pack missing")
                .failing(ModelCategory::Audio, "vad weights corrupt"),
        );
        let registry = ModelRegistry::new(provider);
        let loaders: Vec<_> = [
            ModelCategory::Audio,
            ModelCategory::SpeechRecognition,
            ModelCategory::Language,
            ModelCategory::SpeechSynthesis,
        ]
        .into_iter()
        .map(|category| registry.loader(category))
        .collect();

        let err = ensure_all(&loaders).await.unwrap_err();
        match err {
            ParleyError::CompositeLoad(failures) => {
                assert_eq!(failures.len(), 2);
                assert!(failures.contains(&(ModelCategory::Audio, "vad weights corrupt".into())));
                assert!(failures.contains(&(
                    ModelCategory::SpeechSynthesis,
                    "voice pack missing".into()
                )));
            }
            other => panic!("expected composite failure, got {:?}", other),
        }

        // Successful siblings stay resident
        assert!(loaders[1].is_ready());
        assert!(loaders[2].is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn test_banner_follows_state() {
        let registry = ModelRegistry::new(Arc::new(ScriptedModelProvider::new(
            Duration::from_millis(10),
        )));
        let loader = registry.loader(ModelCategory::Language);
        assert_eq!(loader.banner_text(), "No LLM model loaded.");
        loader.ensure().await.unwrap();
        assert_eq!(loader.banner_text(), "LLM model ready.");
    }
}
