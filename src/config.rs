//! Configuration for chat, voice and vision
//!
//! Every section has working defaults; a TOML file only needs the keys it
//! wants to change.

use crate::audio::VadConfig;
use crate::backend::SamplingParams;
use crate::error::{ParleyError, Result};
use crate::generation::GenerationConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_VOICE_PROMPT: &str =
    "You are a helpful voice assistant. Keep responses concise — 1-2 sentences max.";

pub const DEFAULT_VISION_PROMPT: &str = "Describe what you see briefly.";

/// Voice turn settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    /// Capture rate handed to the audio source
    pub sample_rate: u32,
    /// Segments shorter than this are discarded as noise
    pub min_segment_samples: usize,
    pub max_tokens: usize,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub system_prompt: String,
    pub update_interval_ms: u64,
    pub vad: VadConfig,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            min_segment_samples: 1600,
            max_tokens: 40,
            temperature: 0.6,
            top_p: 0.9,
            top_k: 40,
            system_prompt: DEFAULT_VOICE_PROMPT.to_string(),
            update_interval_ms: 16,
            vad: VadConfig::default(),
        }
    }
}

impl VoiceConfig {
    pub fn with_min_segment_samples(mut self, samples: usize) -> Self {
        self.min_segment_samples = samples;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
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

/// Camera description settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisionConfig {
    pub prompt: String,
    /// Longest side of a captured frame, in pixels
    pub capture_dim: u32,
    pub single_shot_max_tokens: usize,
    pub live_max_tokens: usize,
    pub live_interval_ms: u64,
    pub temperature: f32,
    pub top_p: f32,
    /// Stop the live loop on the first non-transient fault
    pub stop_on_fault: bool,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            prompt: DEFAULT_VISION_PROMPT.to_string(),
            capture_dim: 256,
            single_shot_max_tokens: 60,
            live_max_tokens: 25,
            live_interval_ms: 2000,
            temperature: 0.5,
            top_p: 0.9,
            stop_on_fault: true,
        }
    }
}

impl VisionConfig {
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    pub fn with_live_interval(mut self, interval: Duration) -> Self {
        self.live_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn live_interval(&self) -> Duration {
        Duration::from_millis(self.live_interval_ms)
    }

    pub fn single_shot_params(&self) -> SamplingParams {
        SamplingParams::default()
            .with_max_tokens(self.single_shot_max_tokens)
            .with_temperature(self.temperature)
            .with_top_p(self.top_p)
    }

    pub fn live_params(&self) -> SamplingParams {
        SamplingParams::default()
            .with_max_tokens(self.live_max_tokens)
            .with_temperature(self.temperature)
            .with_top_p(self.top_p)
    }
}

/// Top-level configuration
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParleyConfig {
    pub chat: GenerationConfig,
    pub voice: VoiceConfig,
    pub vision: VisionConfig,
}

impl ParleyConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| ParleyError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| ParleyError::Config(e.to_string()))
    }

    /// Reject settings that would stall or spin
    pub fn validate(&self) -> Result<()> {
        if self.chat.max_tokens == 0 {
            return Err(ParleyError::Config("chat.max_tokens must be > 0".into()));
        }
        if self.voice.max_tokens == 0 {
            return Err(ParleyError::Config("voice.max_tokens must be > 0".into()));
        }
        if self.voice.sample_rate == 0 || self.voice.vad.sample_rate == 0 {
            return Err(ParleyError::Config("sample rates must be > 0".into()));
        }
        if self.voice.vad.frame_len == 0 {
            return Err(ParleyError::Config("voice.vad.frame_len must be > 0".into()));
        }
        if self.vision.live_interval_ms == 0 {
            return Err(ParleyError::Config(
                "vision.live_interval_ms must be > 0".into(),
            ));
        }
        if self.vision.capture_dim == 0 {
            return Err(ParleyError::Config("vision.capture_dim must be > 0".into()));
        }
        if self.vision.single_shot_max_tokens == 0 || self.vision.live_max_tokens == 0 {
            return Err(ParleyError::Config(
                "vision token limits must be > 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ParleyConfig::default();
        assert_eq!(config.chat.max_tokens, 256);
        assert_eq!(config.chat.update_interval_ms, 16);
        assert_eq!(config.voice.max_tokens, 40);
        assert_eq!(config.voice.temperature, 0.6);
        assert_eq!(config.voice.min_segment_samples, 1600);
        assert_eq!(config.vision.live_interval(), Duration::from_millis(2000));
        assert_eq!(config.vision.live_params().max_tokens, 25);
        assert_eq!(config.vision.single_shot_params().max_tokens, 60);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config = ParleyConfig::from_toml_str(
            r#"
            [chat]
            max_tokens = 128

            [vision]
            live_interval_ms = 500
            prompt = "What is on the desk?"
            "#,
        )
        .unwrap();
        assert_eq!(config.chat.max_tokens, 128);
        assert_eq!(config.chat.temperature, 0.7);
        assert_eq!(config.vision.live_interval_ms, 500);
        assert_eq!(config.vision.prompt, "What is on the desk?");
        assert_eq!(config.voice, VoiceConfig::default());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = ParleyConfig::from_toml_str("[vision]\nlive_interval_ms = 0\n").unwrap_err();
        assert!(matches!(err, ParleyError::Config(_)));
        assert!(ParleyConfig::from_toml_str("[chat]\nmax_tokens = \"lots\"\n").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[voice]\nmin_segment_samples = 3200").unwrap();
        let config = ParleyConfig::load(file.path()).unwrap();
        assert_eq!(config.voice.min_segment_samples, 3200);

        let written = config.to_toml_string().unwrap();
        assert!(written.contains("min_segment_samples = 3200"));
    }
}
