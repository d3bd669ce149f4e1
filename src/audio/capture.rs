//! Microphone capture pipeline.
//!
//! Runs on a dedicated OS thread (NOT a tokio task) so blocking ALSA reads
//! never stall the async network loops. The device is opened inside the
//! thread, with a setup handshake back to the caller so permission failures
//! surface synchronously from `start`. Each period is converted to f32,
//! downmixed, resampled to the session input rate, sliced into fixed-size
//! frames, and encoded for the outbound channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::thread::{self, JoinHandle};

use alsa::pcm::PCM;
use anyhow::Result;
use thiserror::Error;
use tokio::sync::mpsc;

use super::alsa_device::{self, NegotiatedParams};
use super::codec::EncodedChunk;
use super::resample;

/// Fixed session input rate expected by the remote model.
pub const INPUT_SAMPLE_RATE: u32 = 16_000;

/// Samples per outbound frame.
pub const FRAME_SAMPLES: usize = 4096;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("microphone unavailable: {0}")]
    DeviceUnavailable(String),
}

/// Accumulates samples and emits fixed-length frames.
///
/// A remainder shorter than one frame stays pending until the next push.
pub struct FrameSlicer {
    frame_len: usize,
    pending: Vec<f32>,
}

impl FrameSlicer {
    pub fn new(frame_len: usize) -> Self {
        Self {
            frame_len,
            pending: Vec::with_capacity(frame_len * 2),
        }
    }

    pub fn push(&mut self, samples: &[f32]) -> Vec<Vec<f32>> {
        self.pending.extend_from_slice(samples);
        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_len {
            frames.push(self.pending.drain(..self.frame_len).collect());
        }
        frames
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Owns the capture thread; `stop` (or drop) tears the stream down and
/// guarantees no further frames are sent afterward.
pub struct CapturePipeline {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl CapturePipeline {
    /// Open the microphone and start streaming encoded frames to `frames_tx`.
    pub fn start(device: &str, frames_tx: mpsc::Sender<EncodedChunk>) -> Result<Self, CaptureError> {
        let running = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = std_mpsc::channel::<std::result::Result<(), String>>();
        let device = device.to_string();

        let handle = thread::Builder::new()
            .name("mic-capture".into())
            .spawn({
                let running = running.clone();
                move || {
                    let (pcm, params) = match alsa_device::open_capture(&device, INPUT_SAMPLE_RATE, 1)
                    {
                        Ok(opened) => {
                            let _ = ready_tx.send(Ok(()));
                            opened
                        }
                        Err(e) => {
                            let _ = ready_tx.send(Err(e.to_string()));
                            return;
                        }
                    };
                    if let Err(e) = capture_loop(&pcm, &params, frames_tx, &running) {
                        log::error!("capture thread error: {e}");
                    }
                }
            })
            .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                running,
                handle: Some(handle),
            }),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(CaptureError::DeviceUnavailable(e))
            }
            Err(_) => {
                let _ = handle.join();
                Err(CaptureError::DeviceUnavailable(
                    "capture thread exited during setup".into(),
                ))
            }
        }
    }

    /// Signal the thread to stop and wait for it to release the device.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_loop(
    pcm: &PCM,
    params: &NegotiatedParams,
    frames_tx: mpsc::Sender<EncodedChunk>,
    running: &AtomicBool,
) -> Result<()> {
    let io = pcm.io_i16()?;
    let channels = params.channels as usize;
    let mut read_buf = vec![0i16; params.period_size * channels];
    let mut slicer = FrameSlicer::new(FRAME_SAMPLES);

    log::info!(
        "capture started: rate={}, channels={}, period={}",
        params.sample_rate,
        params.channels,
        params.period_size,
    );

    while running.load(Ordering::Relaxed) {
        match io.readi(&mut read_buf) {
            Ok(frames) => {
                let samples: Vec<f32> = read_buf[..frames * channels]
                    .iter()
                    .map(|&s| s as f32 / 32768.0)
                    .collect();
                let mono = resample::downmix_to_mono(&samples, channels as u16);
                let resampled = resample::resample(&mono, params.sample_rate, INPUT_SAMPLE_RATE);

                for frame in slicer.push(&resampled) {
                    let chunk = EncodedChunk::pcm16(&frame, INPUT_SAMPLE_RATE);
                    if frames_tx.blocking_send(chunk).is_err() {
                        log::warn!("outbound frame channel closed, stopping capture");
                        return Ok(());
                    }
                }
            }
            Err(e) => {
                log::warn!("ALSA capture error: {e}, recovering...");
                if let Err(e2) = pcm.prepare() {
                    log::error!("failed to recover capture stream: {e2}");
                    break;
                }
            }
        }
    }

    log::info!("capture stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slicer_emits_exact_frames() {
        let mut slicer = FrameSlicer::new(4);
        assert!(slicer.push(&[0.0; 3]).is_empty());
        assert_eq!(slicer.pending_len(), 3);

        let frames = slicer.push(&[1.0; 6]);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].len(), 4);
        assert_eq!(frames[1].len(), 4);
        assert_eq!(slicer.pending_len(), 1);
    }

    #[test]
    fn slicer_preserves_sample_order() {
        let mut slicer = FrameSlicer::new(3);
        let input: Vec<f32> = (0..7).map(|i| i as f32).collect();
        let frames = slicer.push(&input);
        assert_eq!(frames, vec![vec![0.0, 1.0, 2.0], vec![3.0, 4.0, 5.0]]);
        assert_eq!(slicer.pending_len(), 1);
    }

    #[test]
    fn slicer_large_push_drains_fully() {
        let mut slicer = FrameSlicer::new(4096);
        let frames = slicer.push(&vec![0.5; 4096 * 3]);
        assert_eq!(frames.len(), 3);
        assert_eq!(slicer.pending_len(), 0);
    }
}
