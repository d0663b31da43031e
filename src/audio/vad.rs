//! Voice activity detection and speech segmentation
//!
//! A [`FrameClassifier`] labels fixed-size frames as speech or silence.
//! [`SegmentingVad`] turns those labels into speech segments: it keeps a short
//! pre-roll so onsets are not clipped, and closes a segment after a run of
//! silent frames (the hangover) or when the segment grows too long.

use super::buffer::PreRollBuffer;
use super::rms_level;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::debug;

/// Speech boundary reported by a detector
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpeechActivity {
    Started,
    Ended,
}

/// Detector interface consumed by the voice orchestrator
pub trait VoiceActivityDetector: Send {
    fn reset(&mut self);

    /// Feed a chunk of mono samples; returns boundaries crossed within it
    fn process_samples(&mut self, chunk: &[f32]) -> Vec<SpeechActivity>;

    /// Take the oldest completed segment
    fn pop_speech_segment(&mut self) -> Option<Vec<f32>>;
}

/// Per-frame speech/silence decision
pub trait FrameClassifier: Send {
    fn frame_len(&self) -> usize;
    fn is_speech(&mut self, frame: &[f32]) -> bool;
    fn reset(&mut self) {}
}

/// Segmenter settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    pub sample_rate: u32,
    /// Samples per classified frame (512 = 32ms at 16kHz)
    pub frame_len: usize,
    /// RMS level at or above which a frame counts as speech
    pub energy_threshold: f32,
    /// Silence needed to close a segment
    pub hangover_ms: u32,
    /// Audio kept from before the onset
    pub pre_roll_ms: u32,
    /// Segments are force-closed at this length
    pub max_segment_ms: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            frame_len: 512,
            energy_threshold: 0.015,
            hangover_ms: 480,
            pre_roll_ms: 192,
            max_segment_ms: 30_000,
        }
    }
}

impl VadConfig {
    fn ms_to_samples(&self, ms: u32) -> usize {
        (self.sample_rate as u64 * ms as u64 / 1000) as usize
    }

    pub fn hangover_frames(&self) -> usize {
        self.ms_to_samples(self.hangover_ms)
            .div_ceil(self.frame_len.max(1))
            .max(1)
    }

    pub fn pre_roll_samples(&self) -> usize {
        self.ms_to_samples(self.pre_roll_ms)
    }

    pub fn max_segment_samples(&self) -> usize {
        self.ms_to_samples(self.max_segment_ms)
    }
}

/// RMS threshold classifier
pub struct EnergyClassifier {
    threshold: f32,
    frame_len: usize,
}

impl EnergyClassifier {
    pub fn new(threshold: f32, frame_len: usize) -> Self {
        Self {
            threshold: threshold.clamp(0.0, 1.0),
            frame_len: frame_len.max(1),
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }
}

impl FrameClassifier for EnergyClassifier {
    fn frame_len(&self) -> usize {
        self.frame_len
    }

    fn is_speech(&mut self, frame: &[f32]) -> bool {
        rms_level(frame) >= self.threshold
    }
}

/// Silero classifier (16kHz or 8kHz only)
#[cfg(feature = "silero")]
pub struct SileroClassifier {
    detector: voice_activity_detector::VoiceActivityDetector,
    threshold: f32,
    frame_len: usize,
}

#[cfg(feature = "silero")]
impl SileroClassifier {
    pub fn new(sample_rate: u32, threshold: f32) -> crate::error::Result<Self> {
        let frame_len: usize = match sample_rate {
            8000 => 256,
            16000 => 512,
            other => {
                return Err(crate::error::ParleyError::Config(format!(
                    "Invalid VAD sample rate: {}. Must be 8000 or 16000",
                    other
                )))
            }
        };

        let detector = voice_activity_detector::VoiceActivityDetector::builder()
            .sample_rate(sample_rate as i32)
            .chunk_size(frame_len)
            .build()
            .map_err(|e| {
                crate::error::ParleyError::Config(format!("Failed to create VAD: {:?}", e))
            })?;

        tracing::info!("Initialized Silero VAD at {} Hz, threshold {}", sample_rate, threshold);

        Ok(Self {
            detector,
            threshold: threshold.clamp(0.0, 1.0),
            frame_len,
        })
    }
}

#[cfg(feature = "silero")]
impl FrameClassifier for SileroClassifier {
    fn frame_len(&self) -> usize {
        self.frame_len
    }

    fn is_speech(&mut self, frame: &[f32]) -> bool {
        self.detector.predict(frame.iter().copied()) >= self.threshold
    }

    fn reset(&mut self) {
        self.detector.reset();
    }
}

/// Frame-classifier-driven speech segmenter
pub struct SegmentingVad<C: FrameClassifier> {
    classifier: C,
    hangover_frames: usize,
    max_segment_samples: usize,
    pending: Vec<f32>,
    pre_roll: PreRollBuffer,
    current: Option<Vec<f32>>,
    silent_frames: usize,
    completed: VecDeque<Vec<f32>>,
}

impl SegmentingVad<EnergyClassifier> {
    /// Energy-threshold segmenter
    pub fn energy(config: &VadConfig) -> Self {
        let classifier = EnergyClassifier::new(config.energy_threshold, config.frame_len);
        Self::new(classifier, config)
    }
}

impl<C: FrameClassifier> SegmentingVad<C> {
    pub fn new(classifier: C, config: &VadConfig) -> Self {
        Self {
            classifier,
            hangover_frames: config.hangover_frames(),
            max_segment_samples: config.max_segment_samples().max(1),
            pending: Vec::new(),
            pre_roll: PreRollBuffer::new(config.pre_roll_samples()),
            current: None,
            silent_frames: 0,
            completed: VecDeque::new(),
        }
    }

    pub fn in_speech(&self) -> bool {
        self.current.is_some()
    }

    fn classify_frame(&mut self, frame: &[f32], activity: &mut Vec<SpeechActivity>) {
        let speech = self.classifier.is_speech(frame);

        match self.current.as_mut() {
            None if speech => {
                let mut segment = self.pre_roll.drain();
                segment.extend_from_slice(frame);
                self.current = Some(segment);
                self.silent_frames = 0;
                activity.push(SpeechActivity::Started);
            }
            None => self.pre_roll.push(frame),
            Some(segment) => {
                segment.extend_from_slice(frame);
                if speech {
                    self.silent_frames = 0;
                } else {
                    self.silent_frames += 1;
                }

                if self.silent_frames >= self.hangover_frames
                    || segment.len() >= self.max_segment_samples
                {
                    if let Some(segment) = self.current.take() {
                        debug!("Speech segment closed: {} samples", segment.len());
                        self.completed.push_back(segment);
                    }
                    self.silent_frames = 0;
                    activity.push(SpeechActivity::Ended);
                }
            }
        }
    }
}

impl<C: FrameClassifier> VoiceActivityDetector for SegmentingVad<C> {
    fn reset(&mut self) {
        self.classifier.reset();
        self.pending.clear();
        self.pre_roll.clear();
        self.current = None;
        self.silent_frames = 0;
        self.completed.clear();
    }

    fn process_samples(&mut self, chunk: &[f32]) -> Vec<SpeechActivity> {
        let mut activity = Vec::new();
        let frame_len = self.classifier.frame_len().max(1);
        self.pending.extend_from_slice(chunk);

        let whole = self.pending.len() - self.pending.len() % frame_len;
        if whole == 0 {
            return activity;
        }
        let frames: Vec<f32> = self.pending.drain(..whole).collect();
        for frame in frames.chunks_exact(frame_len) {
            self.classify_frame(frame, &mut activity);
        }
        activity
    }

    fn pop_speech_segment(&mut self) -> Option<Vec<f32>> {
        self.completed.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> VadConfig {
        VadConfig {
            frame_len: 160,
            energy_threshold: 0.1,
            hangover_ms: 30,
            pre_roll_ms: 20,
            ..Default::default()
        }
    }

    #[test]
    fn test_config_conversions() {
        let config = config();
        assert_eq!(config.hangover_frames(), 3);
        assert_eq!(config.pre_roll_samples(), 320);
        assert_eq!(VadConfig::default().max_segment_samples(), 480_000);
    }

    #[test]
    fn test_silence_produces_nothing() {
        let mut vad = SegmentingVad::energy(&config());
        assert!(vad.process_samples(&[0.0; 1600]).is_empty());
        assert!(vad.pop_speech_segment().is_none());
    }

    #[test]
    fn test_segment_includes_pre_roll_and_hangover() {
        let mut vad = SegmentingVad::energy(&config());

        assert!(vad.process_samples(&[0.0; 480]).is_empty());
        assert_eq!(vad.process_samples(&[0.5; 800]), vec![SpeechActivity::Started]);
        assert!(vad.in_speech());
        assert_eq!(vad.process_samples(&[0.0; 480]), vec![SpeechActivity::Ended]);

        let segment = vad.pop_speech_segment().unwrap();
        // 320 pre-roll + 800 speech + 480 hangover
        assert_eq!(segment.len(), 1600);
        assert!(vad.pop_speech_segment().is_none());
    }

    #[test]
    fn test_partial_frames_are_carried_over() {
        let mut vad = SegmentingVad::energy(&config());
        assert!(vad.process_samples(&[0.5; 100]).is_empty());
        assert_eq!(vad.process_samples(&[0.5; 100]), vec![SpeechActivity::Started]);
    }

    #[test]
    fn test_long_speech_is_force_closed() {
        let config = VadConfig {
            max_segment_ms: 100,
            ..config()
        };
        let mut vad = SegmentingVad::energy(&config);
        let activity = vad.process_samples(&[0.5; 1600]);
        assert_eq!(activity, vec![SpeechActivity::Started, SpeechActivity::Ended]);
        assert_eq!(vad.pop_speech_segment().map(|s| s.len()), Some(1600));
    }

    #[test]
    fn test_reset_discards_everything() {
        let mut vad = SegmentingVad::energy(&config());
        vad.process_samples(&[0.5; 800]);
        vad.process_samples(&[0.0; 480]);
        vad.reset();
        assert!(vad.pop_speech_segment().is_none());
        assert!(!vad.in_speech());
    }
}
