//! Streaming chat sessions end to end

use parley::backend::SamplingParams;
use parley::generation::{
    GenerationConfig, GenerationEvent, GenerationOutcome, StreamingGenerationController,
};
use parley::resource::{ModelCategory, ModelRegistry};
use parley::sim::{ScriptedBackend, ScriptedModelProvider};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_three_tokens_give_three_updates() {
    let backend =
        Arc::new(ScriptedBackend::new(["H", "i", "!"]).with_token_delay(Duration::from_millis(20)));
    let (controller, events) =
        StreamingGenerationController::new(backend.clone(), GenerationConfig::default());

    let session = controller
        .generate_with("hi", SamplingParams::default().with_max_tokens(5))
        .unwrap();
    let id = session.id();
    let result = session.wait().await;

    assert_eq!(result.outcome, GenerationOutcome::Completed);
    assert_eq!(result.text, "Hi!");
    assert_eq!(result.stats.tokens_used, 3);
    assert_eq!(backend.requests()[0].params.max_tokens, 5);

    // Let the task publish its Finished event
    tokio::time::sleep(Duration::from_millis(1)).await;
    let events: Vec<_> = events.try_iter().collect();
    let updates: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            GenerationEvent::Update { session, text } if *session == id => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(updates, vec!["H", "Hi", "Hi!"]);
    assert!(matches!(
        events.first(),
        Some(GenerationEvent::Started { prompt, .. }) if prompt == "hi"
    ));
    assert!(matches!(
        events.last(),
        Some(GenerationEvent::Finished { result, .. }) if result.text == "Hi!"
    ));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_keeps_partial_text() {
    let backend =
        Arc::new(ScriptedBackend::new(["word "; 40]).with_token_delay(Duration::from_millis(10)));
    let (controller, _events) =
        StreamingGenerationController::new(backend.clone(), GenerationConfig::default());

    let session = controller.generate("tell me a story").unwrap();
    tokio::time::sleep(Duration::from_millis(55)).await;
    controller.cancel();
    controller.cancel();

    let result = session.wait().await;
    assert_eq!(result.outcome, GenerationOutcome::Cancelled);
    assert!(!result.text.is_empty());
    assert!(result.text.len() < "word ".len() * 40);
    assert!(!controller.is_busy());

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(backend.tokens_produced() < 40);
}

#[tokio::test(start_paused = true)]
async fn test_system_prompt_and_lazy_model_load() {
    let registry =
        ModelRegistry::new(Arc::new(ScriptedModelProvider::new(Duration::from_millis(40))));
    let loader = registry.loader(ModelCategory::Language);
    let backend = Arc::new(ScriptedBackend::new(["ok"]));
    let config = GenerationConfig::default().with_system_prompt("Be brief.");
    let (controller, _events) = StreamingGenerationController::new(backend.clone(), config);
    let controller = controller.with_loader(loader.clone());

    assert!(!loader.is_ready());
    let result = controller.generate("status?").unwrap().wait().await;

    assert_eq!(result.text, "ok");
    assert!(loader.is_ready());
    let request = &backend.requests()[0];
    assert_eq!(request.prompt, "status?");
    assert_eq!(request.system_prompt.as_deref(), Some("Be brief."));
}
