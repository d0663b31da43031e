use crate::error::{ParleyError, Result};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use tracing::debug;

const CHUNK_FRAMES: usize = 1024;

/// Single-channel sample rate converter
///
/// Converts whole clips: the output is trimmed of the filter delay and
/// sized to `len * to_rate / from_rate`.
pub struct MonoResampler {
    inner: SincFixedIn<f32>,
    from_rate: u32,
    to_rate: u32,
}

impl MonoResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Result<Self> {
        if from_rate == 0 || to_rate == 0 {
            return Err(ParleyError::Config(
                "Sample rates must be greater than 0".into(),
            ));
        }

        let params = SincInterpolationParameters {
            sinc_len: 256,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 256,
            window: WindowFunction::BlackmanHarris2,
        };

        let inner = SincFixedIn::<f32>::new(
            to_rate as f64 / from_rate as f64,
            2.0,
            params,
            CHUNK_FRAMES,
            1,
        )
        .map_err(|e| ParleyError::Config(format!("Failed to create resampler: {}", e)))?;

        debug!("Created resampler: {} Hz -> {} Hz", from_rate, to_rate);

        Ok(Self {
            inner,
            from_rate,
            to_rate,
        })
    }

    pub fn from_rate(&self) -> u32 {
        self.from_rate
    }

    pub fn to_rate(&self) -> u32 {
        self.to_rate
    }

    /// Convert one clip
    pub fn process(&mut self, samples: &[f32]) -> Result<Vec<f32>> {
        if samples.is_empty() {
            return Ok(Vec::new());
        }
        self.inner.reset();

        let expected =
            (samples.len() as u64 * self.to_rate as u64 / self.from_rate as u64) as usize;
        let mut output = Vec::with_capacity(expected + self.inner.output_frames_max());
        let map_err = |e: rubato::ResampleError| {
            ParleyError::AudioDevice(format!("Resampling failed: {}", e))
        };

        let mut offset = 0;
        while samples.len() - offset >= CHUNK_FRAMES {
            let chunk = &samples[offset..offset + CHUNK_FRAMES];
            let out = self.inner.process(&[chunk][..], None).map_err(map_err)?;
            output.extend_from_slice(&out[0]);
            offset += CHUNK_FRAMES;
        }
        if offset < samples.len() {
            let tail = &samples[offset..];
            let out = self.inner.process_partial(Some(&[tail][..]), None).map_err(map_err)?;
            output.extend_from_slice(&out[0]);
        }

        // Flush the filter until the delayed tail is out
        let delay = self.inner.output_delay();
        while output.len() < expected + delay {
            let out = self
                .inner
                .process_partial(None::<&[&[f32]]>, None)
                .map_err(map_err)?;
            if out[0].is_empty() {
                break;
            }
            output.extend_from_slice(&out[0]);
        }

        output.drain(..delay.min(output.len()));
        output.truncate(expected);
        Ok(output)
    }
}

/// Convert a mono clip between rates; a no-op when the rates match
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    if from_rate == to_rate {
        return Ok(samples.to_vec());
    }
    MonoResampler::new(from_rate, to_rate)?.process(samples)
}

/// Average interleaved frames down to mono
pub fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_rates() {
        assert!(MonoResampler::new(0, 16000).is_err());
        assert!(MonoResampler::new(16000, 0).is_err());
    }

    #[test]
    fn test_downsampling_length() {
        let input: Vec<f32> = (0..4800).map(|i| (i as f32 * 0.01).sin()).collect();
        let output = resample(&input, 48000, 16000).unwrap();
        assert_eq!(output.len(), 1600);
    }

    #[test]
    fn test_upsampling_length() {
        let input: Vec<f32> = (0..1000).map(|i| (i as f32 * 0.01).sin()).collect();
        let output = resample(&input, 16000, 24000).unwrap();
        assert_eq!(output.len(), 1500);
    }

    #[test]
    fn test_same_rate_is_identity() {
        let input = vec![0.1, 0.2, 0.3];
        assert_eq!(resample(&input, 16000, 16000).unwrap(), input);
        assert!(resample(&[], 16000, 48000).unwrap().is_empty());
    }

    #[test]
    fn test_downmix() {
        let stereo = vec![0.5, 0.3, 0.7, 0.1];
        let mono = downmix(&stereo, 2);
        assert_eq!(mono.len(), 2);
        assert!((mono[0] - 0.4).abs() < 0.001);
        assert!((mono[1] - 0.4).abs() < 0.001);
        assert_eq!(downmix(&stereo, 1), stereo);
    }
}
