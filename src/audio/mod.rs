//! Audio capture, playback and speech segmentation

pub mod buffer;
#[cfg(feature = "audio-io")]
pub mod input;
#[cfg(feature = "audio-io")]
pub mod output;
pub mod resampler;
pub mod vad;
pub mod wav;

pub use buffer::PreRollBuffer;
#[cfg(feature = "audio-io")]
pub use input::CpalAudioSource;
#[cfg(feature = "audio-io")]
pub use output::CpalAudioSink;
pub use resampler::{downmix, resample, MonoResampler};
pub use vad::{
    EnergyClassifier, FrameClassifier, SegmentingVad, SpeechActivity, VadConfig,
    VoiceActivityDetector,
};
pub use wav::{read_wav, write_wav, WavFileSource};

use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

/// Capture rate expected by the VAD and speech recognizer
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

/// What a capture device reports
#[derive(Clone, Debug, PartialEq)]
pub enum CaptureEvent {
    /// Mono samples at the requested rate
    Chunk(Vec<f32>),
    /// RMS level of the most recent chunk, in `[0, 1]`
    Level(f32),
}

/// Mono audio produced by a synthesizer
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SynthesizedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl SynthesizedAudio {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }
}

/// A microphone-like producer
///
/// Singly owned: `start` while capturing is an error, `stop` is idempotent.
pub trait AudioSource: Send + Sync {
    fn start(&self, sample_rate: u32, events: UnboundedSender<CaptureEvent>) -> Result<()>;
    fn stop(&self);
    fn is_capturing(&self) -> bool;
}

/// A speaker-like consumer
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Play to completion, or until `cancel` fires
    async fn play(&self, audio: &SynthesizedAudio, cancel: &CancellationToken) -> Result<()>;
}

/// Root-mean-square level, clamped to `[0, 1]`
pub fn rms_level(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt().min(1.0)
}

/// Send a level reading followed by the chunk itself
///
/// Returns false once the receiver has gone away.
pub fn emit_chunk(events: &UnboundedSender<CaptureEvent>, samples: Vec<f32>) -> bool {
    events.send(CaptureEvent::Level(rms_level(&samples))).is_ok()
        && events.send(CaptureEvent::Chunk(samples)).is_ok()
}
