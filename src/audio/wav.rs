use super::resampler::{downmix, resample};
use super::{emit_chunk, AudioSource, CaptureEvent};
use crate::error::{ParleyError, Result};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use parking_lot::Mutex;
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Write mono samples as 16-bit PCM
pub fn write_wav<P: AsRef<Path>>(path: P, samples: &[f32], sample_rate: u32) -> Result<()> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let mut writer = WavWriter::create(path.as_ref(), spec)
        .map_err(|e| ParleyError::IOError(format!("Failed to create WAV writer: {}", e)))?;

    for &sample in samples {
        let sample_i16 = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        writer
            .write_sample(sample_i16)
            .map_err(|e| ParleyError::IOError(format!("Failed to write sample: {}", e)))?;
    }

    writer
        .finalize()
        .map_err(|e| ParleyError::IOError(format!("Failed to finalize WAV file: {}", e)))?;

    info!("Wrote {} samples to {:?}", samples.len(), path.as_ref());
    Ok(())
}

/// Read a WAV file as mono f32 samples plus its sample rate
pub fn read_wav<P: AsRef<Path>>(path: P) -> Result<(Vec<f32>, u32)> {
    let mut reader = WavReader::open(path.as_ref())
        .map_err(|e| ParleyError::IOError(format!("Failed to open WAV file: {}", e)))?;

    let spec = reader.spec();
    debug!(
        "Reading WAV file: {} Hz, {} channels, {} bits",
        spec.sample_rate, spec.channels, spec.bits_per_sample
    );

    let read_err = |e: hound::Error| ParleyError::IOError(format!("Failed to read sample: {}", e));
    let interleaved: Vec<f32> = match (spec.sample_format, spec.bits_per_sample) {
        (SampleFormat::Float, _) => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(read_err)?,
        (SampleFormat::Int, 16) => reader
            .samples::<i16>()
            .map(|s| s.map(|v| v as f32 / i16::MAX as f32))
            .collect::<std::result::Result<_, _>>()
            .map_err(read_err)?,
        (SampleFormat::Int, 24) => reader
            .samples::<i32>()
            .map(|s| s.map(|v| v as f32 / 8_388_608.0))
            .collect::<std::result::Result<_, _>>()
            .map_err(read_err)?,
        (SampleFormat::Int, 32) => reader
            .samples::<i32>()
            .map(|s| s.map(|v| v as f32 / i32::MAX as f32))
            .collect::<std::result::Result<_, _>>()
            .map_err(read_err)?,
        (_, bits) => {
            return Err(ParleyError::Config(format!(
                "Unsupported WAV bit depth: {}",
                bits
            )))
        }
    };

    Ok((downmix(&interleaved, spec.channels as usize), spec.sample_rate))
}

/// Replays a clip as if it were a microphone
///
/// Chunks are paced in real time, followed by a stretch of silence so a
/// detector sees the end of speech. The source then stays open, silent,
/// until stopped.
pub struct WavFileSource {
    samples: Vec<f32>,
    sample_rate: u32,
    chunk_ms: u32,
    trailing_silence_ms: u32,
    running: Mutex<Option<CancellationToken>>,
}

impl WavFileSource {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let (samples, sample_rate) = read_wav(path)?;
        Ok(Self::from_samples(samples, sample_rate))
    }

    pub fn from_samples(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            chunk_ms: 32,
            trailing_silence_ms: 1000,
            running: Mutex::new(None),
        }
    }

    pub fn with_chunk_ms(mut self, chunk_ms: u32) -> Self {
        self.chunk_ms = chunk_ms.max(1);
        self
    }

    pub fn with_trailing_silence_ms(mut self, ms: u32) -> Self {
        self.trailing_silence_ms = ms;
        self
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate.max(1) as f64)
    }
}

impl AudioSource for WavFileSource {
    fn start(&self, sample_rate: u32, events: UnboundedSender<CaptureEvent>) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(ParleyError::AudioDevice("Capture already running".into()));
        }

        let mut samples = resample(&self.samples, self.sample_rate, sample_rate)?;
        let chunk_len = (sample_rate as usize * self.chunk_ms as usize / 1000).max(1);
        let silence_len = sample_rate as usize * self.trailing_silence_ms as usize / 1000;
        samples.resize(samples.len() + silence_len, 0.0);
        let period = Duration::from_millis(self.chunk_ms as u64);

        let cancel = CancellationToken::new();
        *running = Some(cancel.clone());
        info!("Replaying {} samples at {} Hz", samples.len(), sample_rate);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            for chunk in samples.chunks(chunk_len) {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                if !emit_chunk(&events, chunk.to_vec()) {
                    return;
                }
            }
            debug!("Replay finished; holding until stopped");
            cancel.cancelled().await;
        });
        Ok(())
    }

    fn stop(&self) {
        if let Some(cancel) = self.running.lock().take() {
            cancel.cancel();
            debug!("Replay stopped");
        }
    }

    fn is_capturing(&self) -> bool {
        self.running.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    #[test]
    fn test_write_read_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        let samples: Vec<f32> = (0..16000)
            .map(|i| (2.0 * PI * 440.0 * i as f32 / 16000.0).sin() * 0.5)
            .collect();

        write_wav(&path, &samples, 16000).unwrap();
        let (read, rate) = read_wav(&path).unwrap();

        assert_eq!(rate, 16000);
        assert_eq!(read.len(), samples.len());
        for (original, read) in samples.iter().zip(read.iter()) {
            assert!((original - read).abs() < 0.001);
        }
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            read_wav("/nonexistent/clip.wav"),
            Err(ParleyError::IOError(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_paces_chunks_and_is_single_owner() {
        let source = WavFileSource::from_samples(vec![0.2; 1600], 16000)
            .with_chunk_ms(20)
            .with_trailing_silence_ms(0);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        source.start(16000, tx.clone()).unwrap();
        assert!(source.is_capturing());
        assert!(source.start(16000, tx).is_err());

        let mut total = 0;
        while total < 1600 {
            if let Some(CaptureEvent::Chunk(chunk)) = rx.recv().await {
                assert_eq!(chunk.len(), 320);
                total += chunk.len();
            }
        }

        source.stop();
        source.stop();
        assert!(!source.is_capturing());
    }
}
