//! Parley demo CLI
//!
//! Runs each pipeline against the scripted engines so the orchestration can
//! be watched end to end without model weights.

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use parley::audio::{AudioSink, AudioSource, SegmentingVad, WavFileSource, CAPTURE_SAMPLE_RATE};
use parley::generation::{GenerationEvent, StreamingGenerationController};
use parley::live::LoopEvent;
use parley::resource::{ModelCategory, ModelRegistry};
use parley::sim::{
    demo_utterance, RecordingSink, ScriptedBackend, ScriptedFrameSource, ScriptedModelProvider,
    ScriptedSynthesizer, ScriptedTranscriber, ScriptedVisionBackend,
};
use parley::vision::VisionSession;
use parley::voice::{VoiceComponents, VoiceEvent, VoiceOrchestrator};
use parley::ParleyConfig;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Parser, Debug)]
#[command(name = "parley", about = "Parley - multimodal inference orchestration")]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Simulated download time per model, in milliseconds
    #[arg(long, global = true, default_value_t = 500)]
    load_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stream a chat response
    Chat {
        prompt: String,
        /// Print the generation stats as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run one voice turn
    Voice {
        /// Mono or stereo WAV to use as the microphone
        #[arg(long)]
        wav: Option<PathBuf>,
        /// Capture from the default input device instead
        #[cfg(feature = "audio-io")]
        #[arg(long)]
        mic: bool,
    },
    /// Describe the camera periodically
    Vision {
        #[arg(long, default_value_t = 10)]
        seconds: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => ParleyConfig::load(path)?,
        None => ParleyConfig::default(),
    };
    let registry = ModelRegistry::new(Arc::new(ScriptedModelProvider::new(
        Duration::from_millis(cli.load_ms),
    )));

    info!("Starting Parley");
    match cli.command {
        Command::Chat { prompt, json } => run_chat(config, registry, prompt, json).await,
        #[cfg(feature = "audio-io")]
        Command::Voice { wav, mic } => run_voice(config, registry, wav, mic).await,
        #[cfg(not(feature = "audio-io"))]
        Command::Voice { wav } => run_voice(config, registry, wav, false).await,
        Command::Vision { seconds } => run_vision(config, registry, seconds).await,
    }
}

async fn run_chat(
    config: ParleyConfig,
    registry: ModelRegistry,
    prompt: String,
    json: bool,
) -> Result<()> {
    let backend = Arc::new(
        ScriptedBackend::new(["Sure", ",", " here", " is", " a", " streamed", " reply", "."])
            .with_token_delay(Duration::from_millis(40)),
    );
    let (controller, events) = StreamingGenerationController::new(backend, config.chat);
    let controller = controller.with_loader(registry.loader(ModelCategory::Language));

    let session = controller.generate(prompt)?;
    let mut wait = Box::pin(session.wait());
    let result = loop {
        tokio::select! {
            result = &mut wait => break result,
            _ = tokio::time::sleep(POLL_INTERVAL) => {
                for event in events.try_iter() {
                    if let GenerationEvent::Update { text, .. } = event {
                        println!("... {}", text);
                    }
                }
            }
        }
    };

    println!("{}", result.text);
    if json {
        println!("{}", serde_json::to_string_pretty(&result.stats)?);
        return Ok(());
    }
    println!(
        "{} tokens, {}ms, {:.1} tok/s",
        result.stats.tokens_used,
        result.stats.latency_ms(),
        result.stats.tokens_per_second
    );
    Ok(())
}

async fn run_voice(
    config: ParleyConfig,
    registry: ModelRegistry,
    wav: Option<PathBuf>,
    mic: bool,
) -> Result<()> {
    let voice = config.voice;
    let (source, sink) = devices(wav, mic)?;
    let components = VoiceComponents {
        registry,
        source,
        vad: Box::new(SegmentingVad::energy(&voice.vad)),
        transcriber: Arc::new(
            ScriptedTranscriber::new("What's the weather like today?")
                .with_delay(Duration::from_millis(300)),
        ),
        backend: Arc::new(
            ScriptedBackend::new(["It", " looks", " sunny", " and", " mild", "."])
                .with_token_delay(Duration::from_millis(60)),
        ),
        synthesizer: Arc::new(
            ScriptedSynthesizer::new(22_050).with_delay(Duration::from_millis(200)),
        ),
        sink,
    };
    let (orchestrator, handle) = VoiceOrchestrator::new(voice, components);
    let task = orchestrator.spawn();

    handle.start_listening()?;
    let outcome = loop {
        match handle.try_recv_event() {
            Some(VoiceEvent::StateChanged(state)) => println!("[{}]", state),
            Some(VoiceEvent::Transcription(text)) => println!("You: {}", text),
            Some(VoiceEvent::ResponseComplete { text, .. }) => println!("Assistant: {}", text),
            Some(VoiceEvent::SegmentDiscarded { samples }) => {
                println!("(ignored {} samples of noise)", samples)
            }
            Some(VoiceEvent::TurnComplete(_)) => break Ok(()),
            Some(VoiceEvent::Error(message)) => break Err(message),
            Some(_) => {}
            None => tokio::time::sleep(POLL_INTERVAL).await,
        }
    };

    handle.shutdown()?;
    task.await?;
    if let Err(message) = outcome {
        bail!(message);
    }
    Ok(())
}

type Devices = (Arc<dyn AudioSource>, Arc<dyn AudioSink>);

fn devices(wav: Option<PathBuf>, mic: bool) -> Result<Devices> {
    if mic {
        return microphone();
    }
    let source: Arc<dyn AudioSource> = match wav {
        Some(path) => Arc::new(WavFileSource::open(path)?),
        None => Arc::new(WavFileSource::from_samples(demo_utterance(), CAPTURE_SAMPLE_RATE)),
    };
    let sink: Arc<dyn AudioSink> = Arc::new(RecordingSink::new());
    Ok((source, sink))
}

#[cfg(feature = "audio-io")]
fn microphone() -> Result<Devices> {
    use parley::audio::{CpalAudioSink, CpalAudioSource};
    let source: Arc<dyn AudioSource> = Arc::new(CpalAudioSource::new());
    let sink: Arc<dyn AudioSink> = Arc::new(CpalAudioSink::new());
    Ok((source, sink))
}

#[cfg(not(feature = "audio-io"))]
fn microphone() -> Result<Devices> {
    bail!("Microphone capture needs the audio-io feature")
}

async fn run_vision(config: ParleyConfig, registry: ModelRegistry, seconds: u64) -> Result<()> {
    let source = Arc::new(ScriptedFrameSource::new(640, 480));
    let backend = Arc::new(
        ScriptedVisionBackend::new([
            "A desk with a laptop and a coffee mug.",
            "Someone is waving at the camera.",
        ])
        .with_delay(Duration::from_millis(700)),
    );
    let (session, events) = VisionSession::new(
        source,
        backend,
        registry.loader(ModelCategory::Multimodal),
        config.vision,
    );

    let first = session.describe_once().await?;
    println!("{}", first.text);

    session.start_live()?;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(seconds);
    while tokio::time::Instant::now() < deadline {
        for event in events.try_iter() {
            match event {
                LoopEvent::Output(description) => println!(
                    "[{}] {} ({}ms)",
                    description.captured_at.format("%H:%M:%S"),
                    description.text,
                    description.latency.as_millis()
                ),
                LoopEvent::Fault(e) => println!("fault: {}", e.user_message()),
                other => tracing::debug!("{:?}", other),
            }
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    session.shutdown().await;

    let stats = session.stats();
    println!(
        "{} invocations, {} skipped ticks, mean {}ms",
        stats.invocations,
        stats.skipped,
        stats.mean_invocation.as_millis()
    );
    Ok(())
}
