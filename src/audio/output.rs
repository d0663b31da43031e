use super::resampler::resample;
use super::{AudioSink, SynthesizedAudio};
use crate::error::{ParleyError, Result};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Default speaker via cpal
///
/// Each `play` runs its stream on a short-lived thread; the async side waits
/// for the buffer to drain or for cancellation, whichever comes first.
#[derive(Default)]
pub struct CpalAudioSink;

impl CpalAudioSink {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AudioSink for CpalAudioSink {
    async fn play(&self, audio: &SynthesizedAudio, cancel: &CancellationToken) -> Result<()> {
        if audio.is_empty() {
            return Ok(());
        }

        let stop = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = oneshot::channel::<Result<()>>();
        let samples = audio.samples.clone();
        let source_rate = audio.sample_rate;
        let thread_stop = stop.clone();

        std::thread::spawn(move || {
            let _ = done_tx.send(playback_thread(samples, source_rate, thread_stop));
        });

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                stop.store(true, Ordering::SeqCst);
                debug!("Playback cancelled");
                Ok(())
            }
            done = done_rx => done.unwrap_or_else(|_| {
                Err(ParleyError::AudioDevice("Playback thread exited".into()))
            }),
        }
    }
}

fn playback_thread(samples: Vec<f32>, source_rate: u32, stop: Arc<AtomicBool>) -> Result<()> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| ParleyError::AudioDevice("No output device available".into()))?;

    let config: cpal::StreamConfig = device
        .default_output_config()
        .map_err(|e| ParleyError::AudioDevice(format!("Failed to get output config: {}", e)))?
        .into();
    let channels = config.channels as usize;
    let device_rate = config.sample_rate.0;

    let samples = resample(&samples, source_rate, device_rate)?;
    let duration = Duration::from_secs_f64(samples.len() as f64 / device_rate as f64);
    let queue = Arc::new(Mutex::new(samples.into_iter().collect::<VecDeque<f32>>()));
    let callback_queue = queue.clone();

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let mut queue = callback_queue.lock();
                for frame in data.chunks_mut(channels) {
                    let sample = queue.pop_front().unwrap_or(0.0);
                    frame.fill(sample);
                }
            },
            |err| error!("Audio output stream error: {}", err),
            None,
        )
        .map_err(|e| ParleyError::AudioDevice(format!("Failed to build output stream: {}", e)))?;

    stream
        .play()
        .map_err(|e| ParleyError::AudioDevice(format!("Failed to start output stream: {}", e)))?;
    info!("Playing {:.2}s of audio", duration.as_secs_f32());

    while !stop.load(Ordering::SeqCst) && !queue.lock().is_empty() {
        std::thread::sleep(Duration::from_millis(10));
    }
    // Let the device flush its last buffer
    if !stop.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(50));
    }

    drop(stream);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_audio_is_a_noop() {
        let sink = CpalAudioSink::new();
        let cancel = CancellationToken::new();
        assert!(sink.play(&SynthesizedAudio::default(), &cancel).await.is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let sink = CpalAudioSink::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let audio = SynthesizedAudio::new(vec![0.0; 24_000], 24_000);
        assert!(sink.play(&audio, &cancel).await.is_ok());
    }
}
