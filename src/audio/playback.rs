//! Gapless playback scheduling on a monotonic output clock.
//!
//! Inbound buffers are chained on the clock: each one starts at
//! `max(now, next_start)` and advances `next_start` by its duration, so
//! consecutive chunks play back-to-back with no overlap. An interruption
//! from the far end discards every scheduled buffer and resets the chain to
//! zero. The playback thread (a dedicated OS thread, like capture) pulls due
//! buffers and writes them to the speaker in period-sized slices, checking
//! between slices whether the buffer was flushed mid-write.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use alsa::pcm::PCM;
use anyhow::Result;

use super::alsa_device::{self, NegotiatedParams};
use super::codec::{AudioBuffer, sample_to_i16};
use super::resample;

/// Fixed rate of audio produced by the remote model.
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// A monotonic time reference for scheduling playback, in seconds.
pub trait OutputClock: Send {
    fn now(&self) -> f64;
}

/// Wall-clock output time measured from the moment playback starts.
pub struct StdClock {
    origin: Instant,
}

impl StdClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl OutputClock for StdClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

struct ScheduledPlayback {
    id: u64,
    start_time: f64,
    buffer: AudioBuffer,
    started: bool,
}

/// Owns the active set and the output-clock offset.
///
/// `next_start` is monotonically non-decreasing except for the explicit
/// reset in `interrupt`, which guarantees buffers never overlap and
/// playback never runs backward.
pub struct PlaybackScheduler {
    clock: Box<dyn OutputClock>,
    next_start: f64,
    next_id: u64,
    active: VecDeque<ScheduledPlayback>,
}

impl PlaybackScheduler {
    pub fn new(clock: Box<dyn OutputClock>) -> Self {
        Self {
            clock,
            next_start: 0.0,
            next_id: 0,
            active: VecDeque::new(),
        }
    }

    /// Chain a buffer onto the output clock and add it to the active set.
    pub fn schedule(&mut self, buffer: AudioBuffer) -> u64 {
        let start_time = self.clock.now().max(self.next_start);
        self.next_start = start_time + buffer.duration();
        let id = self.next_id;
        self.next_id += 1;
        self.active.push_back(ScheduledPlayback {
            id,
            start_time,
            buffer,
            started: false,
        });
        id
    }

    /// Hand out the earliest scheduled buffer whose start time has arrived.
    ///
    /// The buffer stays in the active set until `complete` removes it; it is
    /// only marked so it is not handed out twice.
    pub fn begin_due(&mut self) -> Option<(u64, AudioBuffer)> {
        let now = self.clock.now();
        let slot = self.active.iter_mut().find(|s| !s.started)?;
        if slot.start_time <= now {
            slot.started = true;
            Some((slot.id, slot.buffer.clone()))
        } else {
            None
        }
    }

    /// Natural completion: drop the buffer from the active set.
    pub fn complete(&mut self, id: u64) {
        self.active.retain(|s| s.id != id);
    }

    pub fn is_active(&self, id: u64) -> bool {
        self.active.iter().any(|s| s.id == id)
    }

    /// Flush-and-reset on an interruption signal: discard every scheduled
    /// buffer (a mid-write buffer is abandoned by the playback thread at its
    /// next slice) and rewind the chain to zero.
    pub fn interrupt(&mut self) {
        self.active.clear();
        self.next_start = 0.0;
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn next_start(&self) -> f64 {
        self.next_start
    }

    pub fn start_time(&self, id: u64) -> Option<f64> {
        self.active.iter().find(|s| s.id == id).map(|s| s.start_time)
    }

    pub fn now(&self) -> f64 {
        self.clock.now()
    }
}

/// Owns the playback thread and the scheduler it drains.
pub struct PlaybackPipeline {
    scheduler: Arc<Mutex<PlaybackScheduler>>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PlaybackPipeline {
    /// Open the speaker device and start the scheduling thread.
    pub fn start(device: &str) -> Result<Self> {
        let scheduler = Arc::new(Mutex::new(PlaybackScheduler::new(Box::new(StdClock::new()))));
        let running = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = std_mpsc::channel::<std::result::Result<(), String>>();
        let device = device.to_string();

        let handle = thread::Builder::new().name("audio-playback".into()).spawn({
            let scheduler = scheduler.clone();
            let running = running.clone();
            move || {
                let opened =
                    alsa_device::open_playback(&device, OUTPUT_SAMPLE_RATE, 1, Some(1024));
                let (pcm, params) = match opened {
                    Ok(opened) => {
                        let _ = ready_tx.send(Ok(()));
                        opened
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                if let Err(e) = playback_loop(&pcm, &params, &scheduler, &running) {
                    log::error!("playback thread error: {e}");
                }
            }
        })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                scheduler,
                running,
                handle: Some(handle),
            }),
            Ok(Err(e)) => {
                let _ = handle.join();
                anyhow::bail!("speaker unavailable: {e}");
            }
            Err(_) => {
                let _ = handle.join();
                anyhow::bail!("playback thread exited during setup");
            }
        }
    }

    pub fn scheduler(&self) -> Arc<Mutex<PlaybackScheduler>> {
        self.scheduler.clone()
    }

    /// Flush everything, stop the thread, and release the output device.
    pub fn stop(&mut self) {
        if let Ok(mut scheduler) = self.scheduler.lock() {
            scheduler.interrupt();
        }
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PlaybackPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn playback_loop(
    pcm: &PCM,
    params: &NegotiatedParams,
    scheduler: &Arc<Mutex<PlaybackScheduler>>,
    running: &AtomicBool,
) -> Result<()> {
    let io = pcm.io_i16()?;
    let out_channels = params.channels as usize;

    log::info!(
        "playback started: rate={}, channels={}, period={}",
        params.sample_rate,
        params.channels,
        params.period_size,
    );

    while running.load(Ordering::Relaxed) {
        let due = scheduler.lock().unwrap().begin_due();
        let Some((id, buffer)) = due else {
            thread::sleep(Duration::from_millis(2));
            continue;
        };

        // Convert to the negotiated device format: mono mixdown, resample,
        // then duplicate across output channels as interleaved i16.
        let mono = buffer.mixdown();
        let device_samples = resample::resample(&mono, buffer.sample_rate(), params.sample_rate);
        let total_frames = device_samples.len();
        let mut interleaved = Vec::with_capacity(total_frames * out_channels);
        for &sample in &device_samples {
            let value = sample_to_i16(sample);
            for _ in 0..out_channels {
                interleaved.push(value);
            }
        }

        let period = params.period_size.max(64);
        let mut written = 0usize;
        let mut retries = 0u32;
        while written < total_frames && running.load(Ordering::Relaxed) {
            // Abandon the rest of this buffer if an interruption flushed it.
            if !scheduler.lock().unwrap().is_active(id) {
                break;
            }
            let end = (written + period).min(total_frames);
            match io.writei(&interleaved[written * out_channels..end * out_channels]) {
                Ok(n) => {
                    written += n;
                    retries = 0;
                }
                Err(e) => {
                    log::warn!("ALSA playback error: {e}, recovering...");
                    retries += 1;
                    if let Err(e2) = pcm.prepare() {
                        log::error!("failed to recover playback stream: {e2}");
                        return Ok(());
                    }
                    // The device persistently cannot keep up; drop the rest
                    // of this buffer instead of spinning.
                    if retries >= 3 {
                        log::error!(
                            "max recovery retries reached, dropping {} unwritten frames",
                            total_frames - written
                        );
                        break;
                    }
                }
            }
        }

        scheduler.lock().unwrap().complete(id);
    }

    log::info!("playback stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone)]
    struct ManualClock(Arc<Mutex<f64>>);

    impl ManualClock {
        fn new() -> Self {
            Self(Arc::new(Mutex::new(0.0)))
        }

        fn advance_to(&self, t: f64) {
            *self.0.lock().unwrap() = t;
        }
    }

    impl OutputClock for ManualClock {
        fn now(&self) -> f64 {
            *self.0.lock().unwrap()
        }
    }

    fn buffer_ms(ms: u64) -> AudioBuffer {
        let frames = (OUTPUT_SAMPLE_RATE as u64 * ms / 1000) as usize;
        AudioBuffer::new(OUTPUT_SAMPLE_RATE, vec![vec![0.0; frames]])
    }

    fn scheduler_with_clock() -> (PlaybackScheduler, ManualClock) {
        let clock = ManualClock::new();
        (PlaybackScheduler::new(Box::new(clock.clone())), clock)
    }

    #[test]
    fn buffers_chain_without_overlap_or_gap() {
        let (mut scheduler, _clock) = scheduler_with_clock();
        let mut previous_end = 0.0;
        for _ in 0..5 {
            let id = scheduler.schedule(buffer_ms(100));
            let start = scheduler.start_time(id).unwrap();
            assert!((start - previous_end).abs() < 1e-9, "gap or overlap at {start}");
            previous_end = start + 0.1;
        }
        assert!((scheduler.next_start() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn schedule_catches_up_to_the_clock() {
        let (mut scheduler, clock) = scheduler_with_clock();
        scheduler.schedule(buffer_ms(100));
        // The clock has moved past the end of the chain; the next buffer
        // starts now, not back at the stale offset.
        clock.advance_to(1.0);
        let id = scheduler.schedule(buffer_ms(100));
        assert!((scheduler.start_time(id).unwrap() - 1.0).abs() < 1e-9);
        assert!((scheduler.next_start() - 1.1).abs() < 1e-9);
    }

    #[test]
    fn next_start_is_monotonic_without_interruption() {
        let (mut scheduler, clock) = scheduler_with_clock();
        let mut last = 0.0;
        for i in 0..10 {
            clock.advance_to(i as f64 * 0.03);
            scheduler.schedule(buffer_ms(50));
            assert!(scheduler.next_start() >= last);
            last = scheduler.next_start();
        }
    }

    #[test]
    fn interruption_empties_active_set_and_resets_clock_offset() {
        let (mut scheduler, clock) = scheduler_with_clock();
        scheduler.schedule(buffer_ms(100));
        scheduler.schedule(buffer_ms(100));
        assert_eq!(scheduler.active_len(), 2);

        clock.advance_to(0.05);
        scheduler.interrupt();
        assert_eq!(scheduler.active_len(), 0);
        assert_eq!(scheduler.next_start(), 0.0);

        // The next payload schedules at max(current clock, 0), not chained
        // to pre-interruption timing.
        let id = scheduler.schedule(buffer_ms(100));
        assert_eq!(scheduler.active_len(), 1);
        assert!((scheduler.start_time(id).unwrap() - 0.05).abs() < 1e-9);
    }

    #[test]
    fn post_interruption_buffer_is_not_chained_to_old_timing() {
        let (mut scheduler, clock) = scheduler_with_clock();
        // Build up a long chain, then interrupt partway through.
        for _ in 0..4 {
            scheduler.schedule(buffer_ms(250));
        }
        assert!((scheduler.next_start() - 1.0).abs() < 1e-9);

        clock.advance_to(0.1);
        scheduler.interrupt();
        let id = scheduler.schedule(buffer_ms(250));

        assert_eq!(scheduler.active_len(), 1);
        let start = scheduler.start_time(id).unwrap();
        assert!(start >= 0.1 && start < 1.0, "stale chain timing: {start}");
    }

    #[test]
    fn begin_due_respects_start_time_and_order() {
        let (mut scheduler, clock) = scheduler_with_clock();
        clock.advance_to(0.0);
        let first = scheduler.schedule(buffer_ms(100));
        let _second = scheduler.schedule(buffer_ms(100));

        let (id, _) = scheduler.begin_due().expect("first buffer is due");
        assert_eq!(id, first);
        // Second buffer starts at 0.1, which has not arrived yet.
        assert!(scheduler.begin_due().is_none());

        clock.advance_to(0.1);
        assert!(scheduler.begin_due().is_some());
    }

    #[test]
    fn begin_due_never_hands_out_a_buffer_twice() {
        let (mut scheduler, _clock) = scheduler_with_clock();
        scheduler.schedule(buffer_ms(100));
        assert!(scheduler.begin_due().is_some());
        assert!(scheduler.begin_due().is_none());
    }

    #[test]
    fn complete_removes_only_the_finished_buffer() {
        let (mut scheduler, _clock) = scheduler_with_clock();
        let first = scheduler.schedule(buffer_ms(100));
        let second = scheduler.schedule(buffer_ms(100));

        scheduler.complete(first);
        assert!(!scheduler.is_active(first));
        assert!(scheduler.is_active(second));
        assert_eq!(scheduler.active_len(), 1);
    }
}
