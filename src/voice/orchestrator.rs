//! Voice turn orchestrator
//!
//! Runs as a single task. Each `StartListening` handles one turn:
//!
//! ```text
//! Idle -> [LoadingModels] -> Listening -> Processing -> Speaking -> Idle
//! ```
//!
//! Commands are honoured in every state; `Stop` during a turn cancels it and
//! drops whatever inference call is in flight.

use super::state::{SharedVoiceState, VoiceSnapshot, VoiceState};
use crate::audio::{
    AudioSink, AudioSource, CaptureEvent, SpeechActivity, SynthesizedAudio, VoiceActivityDetector,
};
use crate::backend::{BackendError, GenerationRequest, InferenceBackend, Synthesizer, Transcriber};
use crate::config::VoiceConfig;
use crate::error::{ParleyError, PipelineStage, Result};
use crate::generation::{drive_stream, GenerationStats, StreamEnd};
use crate::resource::{ensure_all, ModelCategory, ModelRegistry, ResourceLoader};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Models a voice turn needs resident
pub const VOICE_MODELS: [ModelCategory; 4] = [
    ModelCategory::Audio,
    ModelCategory::SpeechRecognition,
    ModelCategory::Language,
    ModelCategory::SpeechSynthesis,
];

/// Commands accepted by the orchestrator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoiceCommand {
    /// Load all voice models without listening
    LoadModels,
    /// Listen for one turn (loads models first if needed)
    StartListening,
    /// Stop listening or abort the current turn
    Stop,
    /// Stop everything and exit the task
    Shutdown,
}

/// Output of a completed turn
#[derive(Debug, Clone)]
pub struct TurnResult {
    pub transcription: String,
    pub response: String,
    pub audio: SynthesizedAudio,
    pub stats: GenerationStats,
}

/// Events emitted by the orchestrator
#[derive(Debug, Clone)]
pub enum VoiceEvent {
    StateChanged(VoiceState),
    SpeechStarted,
    /// A segment below the length floor was dropped
    SegmentDiscarded { samples: usize },
    Transcription(String),
    /// Accumulated response text so far
    ResponseUpdate(String),
    ResponseComplete { text: String, stats: GenerationStats },
    AudioReady { duration_secs: f32 },
    TurnComplete(TurnResult),
    Error(String),
    Shutdown,
}

/// Collaborators the orchestrator drives
pub struct VoiceComponents {
    pub registry: ModelRegistry,
    pub source: Arc<dyn AudioSource>,
    pub vad: Box<dyn VoiceActivityDetector>,
    pub transcriber: Arc<dyn Transcriber>,
    pub backend: Arc<dyn InferenceBackend>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub sink: Arc<dyn AudioSink>,
}

/// Handle for controlling a running orchestrator
#[derive(Clone)]
pub struct VoiceHandle {
    command_tx: mpsc::UnboundedSender<VoiceCommand>,
    event_rx: Receiver<VoiceEvent>,
    shared: SharedVoiceState,
}

impl VoiceHandle {
    pub fn send_command(&self, command: VoiceCommand) -> Result<()> {
        self.command_tx
            .send(command)
            .map_err(|e| ParleyError::Channel(format!("Failed to send command: {}", e)))
    }

    pub fn load_models(&self) -> Result<()> {
        self.send_command(VoiceCommand::LoadModels)
    }

    pub fn start_listening(&self) -> Result<()> {
        self.send_command(VoiceCommand::StartListening)
    }

    /// Idempotent; safe in any state
    pub fn stop(&self) -> Result<()> {
        self.send_command(VoiceCommand::Stop)
    }

    pub fn shutdown(&self) -> Result<()> {
        self.send_command(VoiceCommand::Shutdown)
    }

    pub fn try_recv_event(&self) -> Option<VoiceEvent> {
        self.event_rx.try_recv().ok()
    }

    /// Blocking receive; returns `None` on timeout
    pub fn recv_event_timeout(&self, timeout: Duration) -> Result<Option<VoiceEvent>> {
        match self.event_rx.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(ParleyError::Channel("Voice orchestrator has shut down".into()))
            }
        }
    }

    pub fn state(&self) -> VoiceState {
        self.shared.state()
    }

    pub fn snapshot(&self) -> VoiceSnapshot {
        self.shared.snapshot()
    }

    pub fn shared_state(&self) -> SharedVoiceState {
        self.shared.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Shutdown,
}

/// Publishes state changes to the snapshot and the event channel
#[derive(Clone)]
struct Publisher {
    shared: SharedVoiceState,
    event_tx: Sender<VoiceEvent>,
}

impl Publisher {
    fn set_state(&self, state: VoiceState) {
        let changed = {
            let mut changed = false;
            self.shared.update(|s| {
                changed = s.state != state;
                s.state = state;
                if state != VoiceState::Listening {
                    s.audio_level = 0.0;
                }
            });
            changed
        };
        if changed {
            debug!("Voice state -> {}", state);
            let _ = self.event_tx.send(VoiceEvent::StateChanged(state));
        }
    }

    fn emit(&self, event: VoiceEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Surface an error and return to Idle
    fn fail(&self, error: &ParleyError) {
        warn!("Voice turn failed: {}", error);
        let message = error.to_string();
        self.shared.update(|s| s.last_error = Some(message.clone()));
        self.emit(VoiceEvent::Error(message));
        self.set_state(VoiceState::Idle);
    }
}

fn stage_error(stage: PipelineStage, error: BackendError) -> ParleyError {
    ParleyError::PipelineStage {
        stage,
        message: error.message().to_string(),
    }
}

/// The sequential transcribe -> generate -> synthesize -> play chain
#[derive(Clone)]
struct TurnPipeline {
    transcriber: Arc<dyn Transcriber>,
    backend: Arc<dyn InferenceBackend>,
    synthesizer: Arc<dyn Synthesizer>,
    sink: Arc<dyn AudioSink>,
    config: VoiceConfig,
    publisher: Publisher,
}

impl TurnPipeline {
    async fn run(self, segment: Vec<f32>, cancel: CancellationToken) -> Result<TurnResult> {
        self.publisher.set_state(VoiceState::Processing);

        let transcribed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ParleyError::Cancelled),
            text = self.transcriber.transcribe(&segment, self.config.sample_rate) => text,
        };
        let transcription = transcribed
            .map_err(|e| stage_error(PipelineStage::Transcribe, e))?
            .trim()
            .to_string();
        if transcription.is_empty() {
            return Err(ParleyError::PipelineStage {
                stage: PipelineStage::Transcribe,
                message: "No speech recognized".into(),
            });
        }
        info!("Transcribed: {}", transcription);
        self.publisher
            .shared
            .update(|s| s.transcript = Some(transcription.clone()));
        self.publisher
            .emit(VoiceEvent::Transcription(transcription.clone()));

        let request = GenerationRequest::new(transcription.clone(), self.config.sampling())
            .with_system_prompt(self.config.system_prompt.clone());
        let publisher = &self.publisher;
        let report = drive_stream(
            self.backend.as_ref(),
            request,
            &cancel,
            self.config.update_interval(),
            |text| {
                publisher.shared.update(|s| s.response = text.to_string());
                publisher.emit(VoiceEvent::ResponseUpdate(text.to_string()));
            },
        )
        .await;

        let response = match report.end {
            StreamEnd::Completed => report.text.trim().to_string(),
            StreamEnd::Cancelled => return Err(ParleyError::Cancelled),
            StreamEnd::Failed(e) => return Err(stage_error(PipelineStage::Generate, e)),
        };
        if response.is_empty() {
            return Err(ParleyError::PipelineStage {
                stage: PipelineStage::Generate,
                message: "No response generated".into(),
            });
        }
        self.publisher.shared.update(|s| s.response = response.clone());
        self.publisher.emit(VoiceEvent::ResponseComplete {
            text: response.clone(),
            stats: report.stats.clone(),
        });

        let synthesized = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ParleyError::Cancelled),
            audio = self.synthesizer.synthesize(&response) => audio,
        };
        let audio = synthesized.map_err(|e| stage_error(PipelineStage::Synthesize, e))?;
        self.publisher.emit(VoiceEvent::AudioReady {
            duration_secs: audio.duration().as_secs_f32(),
        });

        self.publisher.set_state(VoiceState::Speaking);
        self.sink
            .play(&audio, &cancel)
            .await
            .map_err(|e| ParleyError::PipelineStage {
                stage: PipelineStage::Playback,
                message: e.to_string(),
            })?;
        if cancel.is_cancelled() {
            return Err(ParleyError::Cancelled);
        }

        Ok(TurnResult {
            transcription,
            response,
            audio,
            stats: report.stats,
        })
    }
}

/// The orchestrator task; see the module docs for the state machine
pub struct VoiceOrchestrator {
    config: VoiceConfig,
    loaders: Vec<ResourceLoader>,
    source: Arc<dyn AudioSource>,
    vad: Box<dyn VoiceActivityDetector>,
    pipeline: TurnPipeline,
    publisher: Publisher,
    command_rx: mpsc::UnboundedReceiver<VoiceCommand>,
}

impl VoiceOrchestrator {
    pub fn new(config: VoiceConfig, components: VoiceComponents) -> (Self, VoiceHandle) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = unbounded();
        let shared = SharedVoiceState::new();
        let publisher = Publisher {
            shared: shared.clone(),
            event_tx,
        };

        let loaders = VOICE_MODELS
            .iter()
            .map(|category| components.registry.loader(*category))
            .collect();

        let pipeline = TurnPipeline {
            transcriber: components.transcriber,
            backend: components.backend,
            synthesizer: components.synthesizer,
            sink: components.sink,
            config: config.clone(),
            publisher: publisher.clone(),
        };

        let orchestrator = Self {
            config,
            loaders,
            source: components.source,
            vad: components.vad,
            pipeline,
            publisher,
            command_rx,
        };
        let handle = VoiceHandle {
            command_tx,
            event_rx,
            shared,
        };
        (orchestrator, handle)
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        info!("Voice orchestrator started");

        while let Some(command) = self.command_rx.recv().await {
            let flow = match command {
                VoiceCommand::LoadModels => match self.load_models().await {
                    Ok(()) => {
                        self.publisher.set_state(VoiceState::Idle);
                        Flow::Continue
                    }
                    Err(flow) => flow,
                },
                VoiceCommand::StartListening => self.listen().await,
                VoiceCommand::Stop => {
                    debug!("Stop received while idle");
                    Flow::Continue
                }
                VoiceCommand::Shutdown => Flow::Shutdown,
            };
            if flow == Flow::Shutdown {
                break;
            }
        }

        self.source.stop();
        self.publisher.set_state(VoiceState::Idle);
        self.publisher.emit(VoiceEvent::Shutdown);
        info!("Voice orchestrator stopped");
    }

    fn models_ready(&self) -> bool {
        self.loaders.iter().all(ResourceLoader::is_ready)
    }

    /// Ensure every voice model; `Err` carries how the caller should proceed
    ///
    /// Stays in LoadingModels on success so a listen can move straight on.
    async fn load_models(&mut self) -> std::result::Result<(), Flow> {
        self.publisher.set_state(VoiceState::LoadingModels);

        let loaders = self.loaders.clone();
        let load = ensure_all(&loaders);
        tokio::pin!(load);

        let outcome = loop {
            tokio::select! {
                biased;
                command = self.command_rx.recv() => match command {
                    Some(VoiceCommand::Stop) => {
                        info!("Model loading abandoned");
                        self.publisher.set_state(VoiceState::Idle);
                        return Err(Flow::Continue);
                    }
                    Some(VoiceCommand::Shutdown) | None => return Err(Flow::Shutdown),
                    Some(other) => debug!("Ignoring {:?} while loading models", other),
                },
                result = &mut load => break result,
            }
        };

        match outcome {
            Ok(()) => {
                info!("Voice models ready");
                Ok(())
            }
            Err(e) => {
                self.publisher.fail(&e);
                Err(Flow::Continue)
            }
        }
    }

    async fn listen(&mut self) -> Flow {
        self.publisher.shared.update(VoiceSnapshot::clear_turn);

        if !self.models_ready() {
            if let Err(flow) = self.load_models().await {
                return flow;
            }
        }

        self.vad.reset();
        let (capture_tx, mut capture_rx) = mpsc::unbounded_channel();
        if let Err(e) = self.source.start(self.config.sample_rate, capture_tx) {
            self.publisher.fail(&e);
            return Flow::Continue;
        }
        self.publisher.set_state(VoiceState::Listening);
        info!("Listening at {} Hz", self.config.sample_rate);

        let segment = loop {
            tokio::select! {
                biased;
                command = self.command_rx.recv() => match command {
                    Some(VoiceCommand::Stop) => {
                        self.source.stop();
                        self.publisher.set_state(VoiceState::Idle);
                        return Flow::Continue;
                    }
                    Some(VoiceCommand::Shutdown) | None => {
                        self.source.stop();
                        return Flow::Shutdown;
                    }
                    Some(other) => debug!("Ignoring {:?} while listening", other),
                },
                event = capture_rx.recv() => match event {
                    Some(CaptureEvent::Level(level)) => {
                        self.publisher.shared.update(|s| s.audio_level = level);
                    }
                    Some(CaptureEvent::Chunk(chunk)) => {
                        if let Some(segment) = self.feed_vad(&chunk) {
                            break segment;
                        }
                    }
                    None => {
                        self.source.stop();
                        self.publisher
                            .fail(&ParleyError::AudioDevice("Capture stream ended".into()));
                        return Flow::Continue;
                    }
                },
            }
        };

        // Capture is released before any inference runs
        self.source.stop();
        drop(capture_rx);
        self.process_turn(segment).await
    }

    /// Feed one chunk; returns the first segment at or above the floor
    fn feed_vad(&mut self, chunk: &[f32]) -> Option<Vec<f32>> {
        for activity in self.vad.process_samples(chunk) {
            match activity {
                SpeechActivity::Started => {
                    debug!("Speech started");
                    self.publisher.emit(VoiceEvent::SpeechStarted);
                }
                SpeechActivity::Ended => {
                    while let Some(segment) = self.vad.pop_speech_segment() {
                        if segment.len() >= self.config.min_segment_samples {
                            return Some(segment);
                        }
                        debug!("Discarding {} sample segment as noise", segment.len());
                        self.publisher
                            .shared
                            .update(|s| s.segments_discarded += 1);
                        self.publisher.emit(VoiceEvent::SegmentDiscarded {
                            samples: segment.len(),
                        });
                    }
                }
            }
        }
        None
    }

    async fn process_turn(&mut self, segment: Vec<f32>) -> Flow {
        info!("Processing speech turn of {} samples", segment.len());
        let cancel = CancellationToken::new();
        let turn = self.pipeline.clone().run(segment, cancel.clone());
        tokio::pin!(turn);

        let (outcome, flow) = loop {
            tokio::select! {
                biased;
                command = self.command_rx.recv() => match command {
                    Some(VoiceCommand::Stop) => {
                        info!("Voice turn stopped");
                        cancel.cancel();
                        break (Err(ParleyError::Cancelled), Flow::Continue);
                    }
                    Some(VoiceCommand::Shutdown) | None => {
                        cancel.cancel();
                        break (Err(ParleyError::Cancelled), Flow::Shutdown);
                    }
                    Some(other) => debug!("Ignoring {:?} during a turn", other),
                },
                outcome = &mut turn => break (outcome, Flow::Continue),
            }
        };

        // Run the cancelled turn out so the sink releases the output device
        if cancel.is_cancelled() {
            let _ = (&mut turn).await;
        }

        match outcome {
            Ok(result) => {
                info!("Voice turn complete: {:?}", result.response);
                self.publisher.shared.update(|s| s.turns_completed += 1);
                self.publisher.set_state(VoiceState::Idle);
                self.publisher.emit(VoiceEvent::TurnComplete(result));
            }
            Err(ParleyError::Cancelled) => self.publisher.set_state(VoiceState::Idle),
            Err(e) => self.publisher.fail(&e),
        }
        flow
    }
}
