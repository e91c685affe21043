//! Gapless playback scheduling for inbound audio chunks.
//!
//! Chunks arrive in order from the remote stream and must play
//! back-to-back with no gaps or overlaps. The scheduler keeps a single
//! forward cursor on the output clock and a registry of every buffer it
//! has scheduled that has not yet finished or been cancelled.

use crate::audio::output::{AudioOutput, PlaybackId};
use crate::codec::AudioBuffer;
use crate::error::Result;
use std::collections::BTreeSet;

/// Schedules decoded chunks contiguously on an [`AudioOutput`].
///
/// Not thread-safe by design: exactly one event-loop thread owns it,
/// which is what keeps the cursor and registry consistent without locks.
pub struct PlaybackScheduler {
    output: Box<dyn AudioOutput>,
    /// Earliest time the next chunk may start, in output-clock seconds.
    next_start: f64,
    /// Buffers scheduled but not yet finished or cancelled.
    live: BTreeSet<PlaybackId>,
    released: bool,
}

impl PlaybackScheduler {
    pub fn new(output: Box<dyn AudioOutput>) -> Self {
        Self {
            output,
            next_start: 0.0,
            live: BTreeSet::new(),
            released: false,
        }
    }

    /// Schedule one decoded chunk for gapless playback.
    ///
    /// The chunk starts exactly when the previous one ends, unless the
    /// output clock has already run past the cursor (a late arrival), in
    /// which case it starts now — never in the past.
    pub fn enqueue(&mut self, buffer: &AudioBuffer) -> Result<()> {
        let now = self.output.now();
        if self.next_start < now {
            self.next_start = now;
        }
        let id = self.output.schedule(buffer.mono().to_vec(), self.next_start)?;
        self.next_start += buffer.duration_secs();
        self.live.insert(id);
        Ok(())
    }

    /// Deregister a buffer that finished playing naturally.
    ///
    /// Completion order follows finish order, which is not necessarily
    /// schedule order; unknown ids (already cancelled) are ignored.
    pub fn completed(&mut self, id: PlaybackId) {
        self.live.remove(&id);
    }

    /// Barge-in: force-stop everything and rewind the cursor.
    ///
    /// The next chunk reschedules from the output clock's current time,
    /// never from the stale future cursor.
    pub fn interrupt(&mut self) {
        let ids: Vec<PlaybackId> = self.live.iter().copied().collect();
        for id in ids {
            self.output.stop(id);
        }
        self.live.clear();
        self.next_start = 0.0;
    }

    /// Session teardown: stop everything and release the output context.
    /// Safe to call more than once.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.interrupt();
        self.output.release();
        self.released = true;
    }

    /// Number of buffers scheduled but not yet finished or cancelled.
    pub fn live_handles(&self) -> usize {
        self.live.len()
    }

    /// Current value of the scheduling cursor, in output-clock seconds.
    pub fn next_start(&self) -> f64 {
        self.next_start
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::output::MockAudioOutput;
    use crate::defaults;

    fn chunk(secs: f64) -> AudioBuffer {
        let samples = (secs * defaults::PLAYBACK_SAMPLE_RATE as f64) as usize;
        AudioBuffer {
            channels: vec![vec![0.0; samples]],
            sample_rate: defaults::PLAYBACK_SAMPLE_RATE,
        }
    }

    #[test]
    fn chunks_schedule_back_to_back() {
        let (output, handle) = MockAudioOutput::new(None);
        let mut scheduler = PlaybackScheduler::new(Box::new(output));

        scheduler.enqueue(&chunk(0.5)).unwrap();
        scheduler.enqueue(&chunk(0.25)).unwrap();
        scheduler.enqueue(&chunk(1.0)).unwrap();

        let log = handle.schedule_log();
        assert_eq!(log.len(), 3);
        // Each chunk starts exactly where the previous one ends.
        assert_eq!(log[0].1, 0.0);
        assert!((log[1].1 - 0.5).abs() < 1e-9);
        assert!((log[2].1 - 0.75).abs() < 1e-9);
        assert!((scheduler.next_start() - 1.75).abs() < 1e-9);
        assert_eq!(scheduler.live_handles(), 3);
    }

    #[test]
    fn late_arrival_reschedules_from_now() {
        let (output, handle) = MockAudioOutput::new(None);
        let mut scheduler = PlaybackScheduler::new(Box::new(output));

        scheduler.enqueue(&chunk(0.5)).unwrap();
        // Output clock runs past the end of the first chunk before the
        // next arrives; the scheduler must not schedule in the past.
        handle.advance(2.0);
        scheduler.enqueue(&chunk(0.5)).unwrap();

        let log = handle.schedule_log();
        assert!((log[1].1 - 2.0).abs() < 1e-9);
        assert!((scheduler.next_start() - 2.5).abs() < 1e-9);
    }

    #[test]
    fn cursor_is_monotonic_while_accumulating() {
        let (output, _handle) = MockAudioOutput::new(None);
        let mut scheduler = PlaybackScheduler::new(Box::new(output));

        let mut last = scheduler.next_start();
        for _ in 0..5 {
            scheduler.enqueue(&chunk(0.1)).unwrap();
            assert!(scheduler.next_start() >= last);
            last = scheduler.next_start();
        }
    }

    #[test]
    fn completion_deregisters_in_finish_order() {
        let (output, handle) = MockAudioOutput::new(None);
        let mut scheduler = PlaybackScheduler::new(Box::new(output));

        scheduler.enqueue(&chunk(0.5)).unwrap();
        scheduler.enqueue(&chunk(0.5)).unwrap();
        let ids: Vec<_> = handle.schedule_log().iter().map(|(id, _, _)| *id).collect();

        // Finish out of schedule order.
        scheduler.completed(ids[1]);
        assert_eq!(scheduler.live_handles(), 1);
        scheduler.completed(ids[0]);
        assert_eq!(scheduler.live_handles(), 0);

        // Unknown/already-finished ids are ignored.
        scheduler.completed(ids[0]);
        assert_eq!(scheduler.live_handles(), 0);
    }

    #[test]
    fn interrupt_stops_everything_and_rewinds() {
        let (output, handle) = MockAudioOutput::new(None);
        let mut scheduler = PlaybackScheduler::new(Box::new(output));

        scheduler.enqueue(&chunk(1.0)).unwrap();
        scheduler.enqueue(&chunk(1.0)).unwrap();
        handle.advance(0.2);

        scheduler.interrupt();
        assert_eq!(scheduler.live_handles(), 0);
        assert!(handle.live().is_empty());
        assert_eq!(handle.stopped().len(), 2);
        assert_eq!(scheduler.next_start(), 0.0);

        // Next chunk schedules at "now", not the stale 2.0s cursor.
        scheduler.enqueue(&chunk(0.5)).unwrap();
        let log = handle.schedule_log();
        assert!((log[2].1 - 0.2).abs() < 1e-9);
    }

    #[test]
    fn release_is_idempotent() {
        let (output, handle) = MockAudioOutput::new(None);
        let mut scheduler = PlaybackScheduler::new(Box::new(output));

        scheduler.enqueue(&chunk(0.5)).unwrap();
        scheduler.release();
        scheduler.release();

        assert!(handle.is_released());
        assert_eq!(scheduler.live_handles(), 0);
    }

    #[test]
    fn schedule_failure_leaves_cursor_unchanged() {
        let (output, _handle) = MockAudioOutput::failing(None);
        let mut scheduler = PlaybackScheduler::new(Box::new(output));

        assert!(scheduler.enqueue(&chunk(0.5)).is_err());
        assert_eq!(scheduler.next_start(), 0.0);
        assert_eq!(scheduler.live_handles(), 0);
    }
}
