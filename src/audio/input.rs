use super::resampler::{downmix, resample};
use super::{emit_chunk, AudioSource, CaptureEvent};
use crate::error::{ParleyError, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{bounded, select, Receiver, Sender};
use parking_lot::Mutex;
use std::thread::JoinHandle;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

/// Device audio is regrouped into blocks of this length before resampling
const BLOCK_MS: usize = 100;

struct Capture {
    stop_tx: Sender<()>,
    worker: JoinHandle<()>,
}

/// Default microphone via cpal
///
/// The cpal stream is not `Send`, so it lives on a dedicated thread that also
/// downmixes and resamples to the requested rate.
pub struct CpalAudioSource {
    capture: Mutex<Option<Capture>>,
}

impl CpalAudioSource {
    pub fn new() -> Self {
        Self {
            capture: Mutex::new(None),
        }
    }
}

impl Default for CpalAudioSource {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSource for CpalAudioSource {
    fn start(&self, sample_rate: u32, events: UnboundedSender<CaptureEvent>) -> Result<()> {
        let mut capture = self.capture.lock();
        if capture.is_some() {
            return Err(ParleyError::AudioDevice("Capture already running".into()));
        }

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let (ready_tx, ready_rx) = bounded::<Result<()>>(1);

        let worker = std::thread::spawn(move || {
            capture_thread(sample_rate, events, stop_rx, ready_tx);
        });

        match ready_rx.recv() {
            Ok(Ok(())) => {
                *capture = Some(Capture { stop_tx, worker });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = worker.join();
                Err(e)
            }
            Err(_) => Err(ParleyError::AudioDevice(
                "Capture thread exited during startup".into(),
            )),
        }
    }

    fn stop(&self) {
        if let Some(capture) = self.capture.lock().take() {
            let _ = capture.stop_tx.send(());
            if capture.worker.join().is_err() {
                warn!("Capture thread panicked");
            }
            info!("Stopped audio capture");
        }
    }

    fn is_capturing(&self) -> bool {
        self.capture.lock().is_some()
    }
}

impl Drop for CpalAudioSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_thread(
    target_rate: u32,
    events: UnboundedSender<CaptureEvent>,
    stop_rx: Receiver<()>,
    ready_tx: Sender<Result<()>>,
) {
    let (chunk_tx, chunk_rx) = bounded::<Vec<f32>>(64);

    let (stream, device_rate) = match open_input_stream(chunk_tx) {
        Ok(opened) => opened,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };
    let _ = ready_tx.send(Ok(()));
    info!("Capturing at {} Hz, delivering {} Hz", device_rate, target_rate);

    let block_len = device_rate as usize * BLOCK_MS / 1000;
    let mut block = Vec::with_capacity(block_len * 2);

    loop {
        select! {
            recv(stop_rx) -> _ => break,
            recv(chunk_rx) -> chunk => {
                let Ok(chunk) = chunk else { break };
                block.extend_from_slice(&chunk);
                if block.len() < block_len {
                    continue;
                }
                let samples = match resample(&block, device_rate, target_rate) {
                    Ok(samples) => samples,
                    Err(e) => {
                        error!("Dropping capture block: {}", e);
                        block.clear();
                        continue;
                    }
                };
                block.clear();
                if !emit_chunk(&events, samples) {
                    debug!("Capture receiver closed");
                    break;
                }
            }
        }
    }

    drop(stream);
}

fn open_input_stream(chunk_tx: Sender<Vec<f32>>) -> Result<(cpal::Stream, u32)> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| ParleyError::AudioDevice("No input device available".into()))?;

    info!(
        "Using input device: {}",
        device.name().unwrap_or_else(|_| "Unknown".to_string())
    );

    let config: cpal::StreamConfig = device
        .default_input_config()
        .map_err(|e| ParleyError::AudioDevice(format!("Failed to get input config: {}", e)))?
        .into();
    let channels = config.channels as usize;

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if let Err(e) = chunk_tx.try_send(downmix(data, channels)) {
                    debug!("Dropping input chunk: {}", e);
                }
            },
            |err| error!("Audio input stream error: {}", err),
            None,
        )
        .map_err(|e| ParleyError::AudioDevice(format!("Failed to build input stream: {}", e)))?;

    stream
        .play()
        .map_err(|e| ParleyError::AudioDevice(format!("Failed to start input stream: {}", e)))?;

    Ok((stream, config.sample_rate.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_lifecycle() {
        // Machines without a microphone just report a device error
        let source = CpalAudioSource::new();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        match source.start(16000, tx) {
            Ok(()) => {
                assert!(source.is_capturing());
                source.stop();
                assert!(!source.is_capturing());
            }
            Err(e) => assert!(matches!(e, ParleyError::AudioDevice(_))),
        }
        source.stop();
    }
}
