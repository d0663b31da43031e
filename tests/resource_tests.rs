//! Model residency: coalescing, progress and failure recovery

use parley::resource::{ensure_all, LoadState, ModelCategory, ModelRegistry};
use parley::sim::ScriptedModelProvider;
use parley::ParleyError;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_ensure_walks_the_lifecycle_and_coalesces() {
    let provider = Arc::new(ScriptedModelProvider::new(Duration::from_millis(100)));
    let registry = ModelRegistry::new(provider.clone());
    let loader = registry.loader(ModelCategory::Language);
    assert_eq!(loader.state(), LoadState::Idle);

    let mut rx = loader.subscribe();
    let recorder = tokio::spawn(async move {
        let mut seen = Vec::new();
        while rx.changed().await.is_ok() {
            let state = rx.borrow_and_update().clone();
            let done = state.is_ready() || state.is_failed();
            seen.push(state);
            if done {
                break;
            }
        }
        seen
    });

    let first = {
        let loader = loader.clone();
        tokio::spawn(async move { loader.ensure().await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(matches!(loader.state(), LoadState::Downloading { .. }));

    // Joins the running load instead of starting another
    let second = loader.ensure().await;
    assert!(second.is_ok());
    assert!(first.await.unwrap().is_ok());
    assert_eq!(provider.downloads(ModelCategory::Language), 1);

    let seen = recorder.await.unwrap();
    assert!(matches!(seen.first(), Some(LoadState::Downloading { .. })));
    assert_eq!(seen.last(), Some(&LoadState::Ready));

    let progress: Vec<f32> = seen.iter().filter_map(LoadState::progress).collect();
    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{:?}", progress);
    let loading = seen.iter().position(|s| *s == LoadState::Loading).unwrap();
    assert!(seen[..loading].iter().all(|s| matches!(s, LoadState::Downloading { .. })));

    // Ready is sticky: no further download
    loader.ensure().await.unwrap();
    assert_eq!(provider.downloads(ModelCategory::Language), 1);
}

#[tokio::test(start_paused = true)]
async fn test_banner_follows_state() {
    let registry =
        ModelRegistry::new(Arc::new(ScriptedModelProvider::new(Duration::from_millis(100))));
    let loader = registry.loader(ModelCategory::Language);
    assert_eq!(loader.banner_text(), "No LLM model loaded.");

    let pending = {
        let loader = loader.clone();
        tokio::spawn(async move { loader.ensure().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(loader.banner_text().starts_with("Downloading LLM model..."));

    pending.await.unwrap().unwrap();
    assert_eq!(loader.banner_text(), "LLM model ready.");
}

#[tokio::test(start_paused = true)]
async fn test_failed_load_can_be_retried() {
    let provider = Arc::new(
        ScriptedModelProvider::new(Duration::from_millis(20))
            .failing_once(ModelCategory::SpeechRecognition, "connection reset"),
    );
    let registry = ModelRegistry::new(provider.clone());
    let loader = registry.loader(ModelCategory::SpeechRecognition);

    let err = loader.ensure().await.unwrap_err();
    assert!(matches!(err, ParleyError::ResourceLoad { .. }));
    assert_eq!(loader.state(), LoadState::Failed("connection reset".into()));
    assert_eq!(loader.banner_text(), "Error: connection reset");

    loader.ensure().await.unwrap();
    assert!(loader.is_ready());
    assert_eq!(provider.downloads(ModelCategory::SpeechRecognition), 2);
}

#[tokio::test(start_paused = true)]
async fn test_composite_failure_names_each_model() {
    let registry = ModelRegistry::new(Arc::new(
        ScriptedModelProvider::new(Duration::from_millis(20))
            .failing(ModelCategory::SpeechSynthesis, "voice pack missing"),
    ));
    let loaders: Vec<_> = [
        ModelCategory::Audio,
        ModelCategory::SpeechRecognition,
        ModelCategory::SpeechSynthesis,
    ]
    .into_iter()
    .map(|category| registry.loader(category))
    .collect();

    let err = ensure_all(&loaders).await.unwrap_err();
    match err {
        ParleyError::CompositeLoad(failures) => {
            assert_eq!(
                failures,
                vec![(ModelCategory::SpeechSynthesis, "voice pack missing".to_string())]
            );
        }
        other => panic!("unexpected error: {other}"),
    }
    // The others still became resident
    assert!(loaders[0].is_ready());
    assert!(loaders[1].is_ready());
}
