//! Scripted collaborators
//!
//! Deterministic stand-ins for the model provider, inference engines and
//! devices. They drive the demo binary and the test suite; every delay goes
//! through `tokio::time`, so paused-clock tests run instantly.

use crate::audio::{AudioSink, SpeechActivity, SynthesizedAudio, VoiceActivityDetector};
use crate::backend::{
    BackendError, Completion, GenerationRequest, InferenceBackend, SamplingParams, Synthesizer,
    TokenStream, Transcriber,
};
use crate::error::{ParleyError, Result};
use crate::resource::{ModelCategory, ModelProvider, ProgressReporter};
use crate::vision::{Frame, FrameSource, VisionBackend};
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const DOWNLOAD_STEPS: u32 = 5;

/// Model provider with fixed download time and optional failures
pub struct ScriptedModelProvider {
    download_time: Duration,
    failures: Mutex<HashMap<ModelCategory, (String, Option<usize>)>>,
    downloads: Mutex<HashMap<ModelCategory, usize>>,
}

impl ScriptedModelProvider {
    pub fn new(download_time: Duration) -> Self {
        Self {
            download_time,
            failures: Mutex::new(HashMap::new()),
            downloads: Mutex::new(HashMap::new()),
        }
    }

    /// Every download of `category` fails
    pub fn failing(self, category: ModelCategory, reason: impl Into<String>) -> Self {
        self.failures.lock().insert(category, (reason.into(), None));
        self
    }

    /// Only the first download of `category` fails
    pub fn failing_once(self, category: ModelCategory, reason: impl Into<String>) -> Self {
        self.failures
            .lock()
            .insert(category, (reason.into(), Some(1)));
        self
    }

    pub fn downloads(&self, category: ModelCategory) -> usize {
        self.downloads.lock().get(&category).copied().unwrap_or(0)
    }

    fn take_failure(&self, category: ModelCategory) -> Option<String> {
        let mut failures = self.failures.lock();
        let (reason, remaining) = failures.get_mut(&category)?;
        match remaining {
            None => Some(reason.clone()),
            Some(0) => None,
            Some(n) => {
                *n -= 1;
                Some(reason.clone())
            }
        }
    }
}

#[async_trait]
impl ModelProvider for ScriptedModelProvider {
    async fn download(
        &self,
        category: ModelCategory,
        progress: &ProgressReporter,
    ) -> std::result::Result<(), BackendError> {
        *self.downloads.lock().entry(category).or_default() += 1;
        let step = self.download_time / DOWNLOAD_STEPS;
        for i in 1..=DOWNLOAD_STEPS {
            tokio::time::sleep(step).await;
            progress.report(i as f32 / DOWNLOAD_STEPS as f32);
        }
        match self.take_failure(category) {
            Some(reason) => Err(BackendError::Failed(reason)),
            None => Ok(()),
        }
    }

    async fn initialize(&self, _category: ModelCategory) -> std::result::Result<(), BackendError> {
        tokio::time::sleep(self.download_time / 4).await;
        Ok(())
    }
}

/// Language model that streams a fixed token list
pub struct ScriptedBackend {
    tokens: Vec<String>,
    token_delay: Duration,
    fail_after: Option<(usize, BackendError)>,
    final_text: Option<String>,
    produced: Arc<AtomicUsize>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedBackend {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
            token_delay: Duration::ZERO,
            fail_after: None,
            final_text: None,
            produced: Arc::new(AtomicUsize::new(0)),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    /// Yield `count` tokens, then fail the stream with `error`
    pub fn failing_after(mut self, count: usize, error: BackendError) -> Self {
        self.fail_after = Some((count, error));
        self
    }

    /// Report `text` as the completion instead of the joined tokens, as an
    /// engine that post-processes its output would
    pub fn with_final_text(mut self, text: impl Into<String>) -> Self {
        self.final_text = Some(text.into());
        self
    }

    /// Tokens actually handed to a consumer so far
    pub fn tokens_produced(&self) -> usize {
        self.produced.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl InferenceBackend for ScriptedBackend {
    async fn generate_stream(
        &self,
        request: GenerationRequest,
        cancel: CancellationToken,
    ) -> std::result::Result<TokenStream, BackendError> {
        let limit = request.params.max_tokens.max(1);
        self.requests.lock().push(request);

        let mut tokens: Vec<String> = self.tokens.iter().take(limit).cloned().collect();
        let failure = self.fail_after.clone();
        if let Some((count, _)) = &failure {
            tokens.truncate(*count);
        }
        let text = self.final_text.clone().unwrap_or_else(|| tokens.concat());
        let count = tokens.len();
        let delay = self.token_delay;
        let produced = self.produced.clone();
        let stream_failure = failure.as_ref().map(|(_, e)| e.clone());

        let stream = async_stream::stream! {
            for token in tokens {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if cancel.is_cancelled() {
                    return;
                }
                produced.fetch_add(1, Ordering::SeqCst);
                yield Ok(token);
            }
            if let Some(error) = stream_failure {
                yield Err(error);
            }
        };

        let completion = async move {
            match failure {
                Some((_, error)) => Err(error),
                None => Ok(Completion {
                    text,
                    tokens_used: count,
                }),
            }
        };

        Ok(TokenStream {
            tokens: Box::pin(stream),
            completion: completion.boxed(),
        })
    }
}

/// Speech recognizer returning fixed text
pub struct ScriptedTranscriber {
    text: String,
    delay: Duration,
    error: Option<BackendError>,
    calls: Mutex<Vec<usize>>,
}

impl ScriptedTranscriber {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            delay: Duration::ZERO,
            error: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(mut self, error: BackendError) -> Self {
        self.error = Some(error);
        self
    }

    /// Segment lengths received, in call order
    pub fn calls(&self) -> Vec<usize> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Transcriber for ScriptedTranscriber {
    async fn transcribe(
        &self,
        samples: &[f32],
        _sample_rate: u32,
    ) -> std::result::Result<String, BackendError> {
        self.calls.lock().push(samples.len());
        tokio::time::sleep(self.delay).await;
        match &self.error {
            Some(error) => Err(error.clone()),
            None => Ok(self.text.clone()),
        }
    }
}

/// Synthesizer producing silence proportional to the text length
pub struct ScriptedSynthesizer {
    sample_rate: u32,
    samples_per_char: usize,
    delay: Duration,
    error: Option<BackendError>,
}

impl ScriptedSynthesizer {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            samples_per_char: (sample_rate / 20) as usize,
            delay: Duration::ZERO,
            error: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(mut self, error: BackendError) -> Self {
        self.error = Some(error);
        self
    }
}

#[async_trait]
impl Synthesizer for ScriptedSynthesizer {
    async fn synthesize(&self, text: &str) -> std::result::Result<SynthesizedAudio, BackendError> {
        tokio::time::sleep(self.delay).await;
        if let Some(error) = &self.error {
            return Err(error.clone());
        }
        Ok(SynthesizedAudio::new(
            vec![0.0; text.chars().count() * self.samples_per_char],
            self.sample_rate,
        ))
    }
}

/// Sink that "plays" for the clip's duration and records what it played
#[derive(Default)]
pub struct RecordingSink {
    played: Mutex<Vec<SynthesizedAudio>>,
    interrupted: AtomicUsize,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clips played to completion
    pub fn played(&self) -> Vec<SynthesizedAudio> {
        self.played.lock().clone()
    }

    pub fn interrupted(&self) -> usize {
        self.interrupted.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioSink for RecordingSink {
    async fn play(&self, audio: &SynthesizedAudio, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.interrupted.fetch_add(1, Ordering::SeqCst);
            }
            _ = tokio::time::sleep(audio.duration()) => {
                self.played.lock().push(audio.clone());
            }
        }
        Ok(())
    }
}

/// Detector that emits one pre-scripted segment per chunk it is fed
pub struct ScriptedVad {
    script: VecDeque<usize>,
    ready: VecDeque<Vec<f32>>,
}

impl ScriptedVad {
    /// Segment lengths, in samples, in the order they should "end"
    pub fn new(segment_lengths: impl IntoIterator<Item = usize>) -> Self {
        Self {
            script: segment_lengths.into_iter().collect(),
            ready: VecDeque::new(),
        }
    }
}

impl VoiceActivityDetector for ScriptedVad {
    fn reset(&mut self) {
        self.ready.clear();
    }

    fn process_samples(&mut self, _chunk: &[f32]) -> Vec<SpeechActivity> {
        match self.script.pop_front() {
            Some(len) => {
                self.ready.push_back(vec![0.1; len]);
                vec![SpeechActivity::Started, SpeechActivity::Ended]
            }
            None => Vec::new(),
        }
    }

    fn pop_speech_segment(&mut self) -> Option<Vec<f32>> {
        self.ready.pop_front()
    }
}

/// Camera producing flat grey frames
pub struct ScriptedFrameSource {
    width: u32,
    height: u32,
    capturing: AtomicBool,
    starts: AtomicUsize,
    captures: AtomicUsize,
    frames_available: AtomicBool,
}

impl ScriptedFrameSource {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            capturing: AtomicBool::new(false),
            starts: AtomicUsize::new(0),
            captures: AtomicUsize::new(0),
            frames_available: AtomicBool::new(true),
        }
    }

    /// Toggle whether `capture_frame` has a frame to return
    pub fn set_frames_available(&self, available: bool) {
        self.frames_available.store(available, Ordering::SeqCst);
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn captures(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FrameSource for ScriptedFrameSource {
    fn start(&self) -> Result<()> {
        if self.capturing.swap(true, Ordering::SeqCst) {
            return Err(ParleyError::AudioDevice("Camera already running".into()));
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        self.capturing.store(false, Ordering::SeqCst);
    }

    fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::SeqCst)
    }

    async fn capture_frame(&self, max_dim: u32) -> Result<Option<Frame>> {
        if !self.is_capturing() {
            return Err(ParleyError::AudioDevice("Camera is not running".into()));
        }
        if !self.frames_available.load(Ordering::SeqCst) {
            return Ok(None);
        }
        self.captures.fetch_add(1, Ordering::SeqCst);

        let longest = self.width.max(self.height).max(1);
        let target = max_dim.clamp(1, longest);
        let width = (self.width * target / longest).max(1);
        let height = (self.height * target / longest).max(1);
        Ok(Some(Frame::new(
            width,
            height,
            vec![128; (width * height * 3) as usize],
        )))
    }
}

/// Vision model cycling through fixed descriptions
pub struct ScriptedVisionBackend {
    descriptions: Vec<String>,
    script: Mutex<VecDeque<std::result::Result<String, BackendError>>>,
    delay: Duration,
    calls: AtomicUsize,
    params_log: Arc<Mutex<Vec<SamplingParams>>>,
}

impl ScriptedVisionBackend {
    pub fn new<I, S>(descriptions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            descriptions: descriptions.into_iter().map(Into::into).collect(),
            script: Mutex::new(VecDeque::new()),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            params_log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Results returned before falling back to the descriptions
    pub fn with_script(self, script: Vec<std::result::Result<String, BackendError>>) -> Self {
        *self.script.lock() = script.into();
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Sampling parameters of every call
    pub fn params_log(&self) -> Arc<Mutex<Vec<SamplingParams>>> {
        self.params_log.clone()
    }
}

#[async_trait]
impl VisionBackend for ScriptedVisionBackend {
    async fn process(
        &self,
        _frame: &Frame,
        _prompt: &str,
        params: &SamplingParams,
    ) -> std::result::Result<String, BackendError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.params_log.lock().push(params.clone());
        tokio::time::sleep(self.delay).await;

        let scripted = self.script.lock().pop_front();
        if let Some(scripted) = scripted {
            return scripted;
        }
        if self.descriptions.is_empty() {
            return Err(BackendError::failed("no descriptions scripted"));
        }
        Ok(self.descriptions[call % self.descriptions.len()].clone())
    }
}

/// One second of a voiced tone followed by silence, at 16kHz
pub fn demo_utterance() -> Vec<f32> {
    let rate = crate::audio::CAPTURE_SAMPLE_RATE as f32;
    let mut samples: Vec<f32> = (0..rate as usize)
        .map(|i| {
            let t = i as f32 / rate;
            (2.0 * std::f32::consts::PI * 180.0 * t).sin() * 0.3
        })
        .collect();
    samples.resize(samples.len() + rate as usize / 2, 0.0);
    samples
}
