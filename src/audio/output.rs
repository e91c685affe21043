//! Speaker output: the `AudioOutput` contract, a CPAL-backed
//! implementation with a sample-accurate schedule, and a mock with a
//! manually driven clock for deterministic tests.

use crate::defaults;
use crate::error::{Result, VoxliveError};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::Sender;
use std::sync::{Arc, Mutex};

/// Identifier of one scheduled playback buffer.
pub type PlaybackId = u64;

/// Trait for scheduled audio output devices.
///
/// Time is expressed in seconds on the device's own output clock, which
/// starts at 0.0 when the context opens and only moves forward. Buffers
/// scheduled in the past start as soon as the device reaches them.
pub trait AudioOutput: Send {
    /// Current output clock position in seconds.
    fn now(&self) -> f64;

    /// Schedule a mono buffer to begin playing at `start_secs`.
    ///
    /// Never blocks; playback happens on the device's own thread. The
    /// returned id is reported on the completions channel when the buffer
    /// finishes naturally.
    fn schedule(&mut self, samples: Vec<f32>, start_secs: f64) -> Result<PlaybackId>;

    /// Force-stop one scheduled or playing buffer. Unknown ids are ignored,
    /// and no completion is reported for stopped buffers.
    fn stop(&mut self, id: PlaybackId);

    /// Force-stop everything currently scheduled or playing.
    fn stop_all(&mut self);

    /// Release the output context. Tolerates repeated calls.
    fn release(&mut self);
}

/// One buffer placed on the output timeline.
struct Scheduled {
    id: PlaybackId,
    start_sample: u64,
    samples: Vec<f32>,
}

/// State shared between the API side and the device callback.
struct OutputState {
    /// Samples rendered since the context opened.
    cursor: u64,
    scheduled: Vec<Scheduled>,
}

/// Wrapper for cpal::Stream to make it Send.
///
/// SAFETY: the stream is only touched under the Mutex in CpalAudioOutput,
/// one thread at a time.
struct SendableStream(cpal::Stream);

unsafe impl Send for SendableStream {}

/// Scheduled speaker output via CPAL at 24kHz.
///
/// The device callback keeps a running sample cursor; scheduled buffers
/// are copied into the output at their start sample, so back-to-back
/// schedules render gaplessly. Finished buffer ids are pushed onto the
/// completions channel from the callback.
pub struct CpalAudioOutput {
    stream: Arc<Mutex<Option<SendableStream>>>,
    state: Arc<Mutex<OutputState>>,
    sample_rate: u32,
    next_id: PlaybackId,
}

impl CpalAudioOutput {
    /// Open the output device and start the render stream.
    ///
    /// # Errors
    /// Returns `VoxliveError::AudioPlayback` if no output device exists or
    /// no usable stream config can be built at the playback rate.
    pub fn new(device_name: Option<&str>, completions: Sender<PlaybackId>) -> Result<Self> {
        let host = cpal::default_host();
        let device = match device_name {
            Some(name) => {
                let mut found = None;
                let devices = host
                    .output_devices()
                    .map_err(|e| VoxliveError::AudioPlayback {
                        message: format!("Failed to enumerate output devices: {}", e),
                    })?;
                for dev in devices {
                    if dev.name().is_ok_and(|n| n == name) {
                        found = Some(dev);
                        break;
                    }
                }
                found.ok_or_else(|| VoxliveError::AudioDeviceNotFound {
                    device: name.to_string(),
                })?
            }
            None => host
                .default_output_device()
                .ok_or_else(|| VoxliveError::AudioPlayback {
                    message: "no output device available".to_string(),
                })?,
        };

        let sample_rate = defaults::PLAYBACK_SAMPLE_RATE;
        let state = Arc::new(Mutex::new(OutputState {
            cursor: 0,
            scheduled: Vec::new(),
        }));

        let stream = build_output_stream(&device, sample_rate, state.clone(), completions)?;
        stream.play().map_err(|e| VoxliveError::AudioPlayback {
            message: format!("Failed to start output stream: {}", e),
        })?;

        Ok(Self {
            stream: Arc::new(Mutex::new(Some(SendableStream(stream)))),
            state,
            sample_rate,
            next_id: 1,
        })
    }
}

/// Build the render stream, preferring mono at the playback rate and
/// falling back to the device's native channel count (mono duplicated
/// across channels).
fn build_output_stream(
    device: &cpal::Device,
    sample_rate: u32,
    state: Arc<Mutex<OutputState>>,
    completions: Sender<PlaybackId>,
) -> Result<cpal::Stream> {
    let err_callback = |err| {
        eprintln!("voxlive: output stream error: {}", err);
    };

    let mono_config = cpal::StreamConfig {
        channels: 1,
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let render_state = state.clone();
    let render_done = completions.clone();
    if let Ok(stream) = device.build_output_stream(
        &mono_config,
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            render(&render_state, data, 1, &render_done);
        },
        err_callback,
        None,
    ) {
        return Ok(stream);
    }

    let default_config =
        device
            .default_output_config()
            .map_err(|e| VoxliveError::AudioPlayback {
                message: format!("Failed to query default output config: {}", e),
            })?;
    let channels = default_config.channels() as usize;
    let native_config = cpal::StreamConfig {
        channels: default_config.channels(),
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    device
        .build_output_stream(
            &native_config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                render(&state, data, channels, &completions);
            },
            err_callback,
            None,
        )
        .map_err(|e| VoxliveError::AudioPlayback {
            message: format!("Failed to build output stream: {}", e),
        })
}

/// Fill one device buffer from the schedule and advance the cursor.
///
/// Runs on the device callback thread; must not block beyond the state lock.
fn render(
    state: &Arc<Mutex<OutputState>>,
    data: &mut [f32],
    channels: usize,
    completions: &Sender<PlaybackId>,
) {
    data.fill(0.0);
    let Ok(mut state) = state.lock() else {
        return;
    };

    let frames = (data.len() / channels.max(1)) as u64;
    let window_start = state.cursor;
    let window_end = window_start + frames;

    for buf in &state.scheduled {
        let buf_end = buf.start_sample + buf.samples.len() as u64;
        let overlap_start = buf.start_sample.max(window_start);
        let overlap_end = buf_end.min(window_end);
        for pos in overlap_start..overlap_end {
            let sample = buf.samples[(pos - buf.start_sample) as usize];
            let frame = (pos - window_start) as usize;
            for ch in 0..channels {
                data[frame * channels + ch] += sample;
            }
        }
    }

    state.cursor = window_end;

    // Report buffers fully consumed by this render pass.
    let cursor = state.cursor;
    state.scheduled.retain(|buf| {
        let finished = buf.start_sample + buf.samples.len() as u64 <= cursor;
        if finished {
            let _ = completions.send(buf.id);
        }
        !finished
    });
}

impl AudioOutput for CpalAudioOutput {
    fn now(&self) -> f64 {
        let cursor = self.state.lock().map(|s| s.cursor).unwrap_or(0);
        cursor as f64 / self.sample_rate as f64
    }

    fn schedule(&mut self, samples: Vec<f32>, start_secs: f64) -> Result<PlaybackId> {
        let id = self.next_id;
        self.next_id += 1;
        let start_sample = (start_secs.max(0.0) * self.sample_rate as f64).round() as u64;

        let mut state = self.state.lock().map_err(|e| VoxliveError::AudioPlayback {
            message: format!("Failed to lock output state: {}", e),
        })?;
        state.scheduled.push(Scheduled {
            id,
            start_sample,
            samples,
        });
        Ok(id)
    }

    fn stop(&mut self, id: PlaybackId) {
        if let Ok(mut state) = self.state.lock() {
            state.scheduled.retain(|buf| buf.id != id);
        }
    }

    fn stop_all(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            state.scheduled.clear();
        }
    }

    fn release(&mut self) {
        self.stop_all();
        if let Ok(mut guard) = self.stream.lock()
            && let Some(stream) = guard.take()
            && let Err(e) = stream.0.pause()
        {
            eprintln!("voxlive: failed to stop output stream: {}", e);
        }
    }
}

/// Inspectable state behind [`MockAudioOutput`].
#[derive(Debug, Default)]
struct MockOutputState {
    now: f64,
    next_id: PlaybackId,
    /// (id, start_secs, duration_secs) of every live buffer.
    scheduled: Vec<(PlaybackId, f64, f64)>,
    /// Every schedule call ever made, in order (never cleared).
    schedule_log: Vec<(PlaybackId, f64, f64)>,
    stopped: Vec<PlaybackId>,
    released: bool,
    fail_schedule: bool,
}

/// Lock a mock state mutex, recovering from poisoning (a panicking test
/// thread must not cascade into every other assertion).
fn lock_mock(state: &Mutex<MockOutputState>) -> std::sync::MutexGuard<'_, MockOutputState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

/// Test handle for driving and inspecting a [`MockAudioOutput`] after the
/// output itself has been handed to the scheduler.
#[derive(Clone)]
pub struct MockOutputHandle {
    state: Arc<Mutex<MockOutputState>>,
    completions: Option<Sender<PlaybackId>>,
}

impl MockOutputHandle {
    /// Advance the mock output clock.
    pub fn advance(&self, secs: f64) {
        lock_mock(&self.state).now += secs;
    }

    /// Finish one buffer naturally: remove it and report its completion.
    pub fn finish(&self, id: PlaybackId) {
        lock_mock(&self.state)
            .scheduled
            .retain(|(sid, _, _)| *sid != id);
        if let Some(tx) = &self.completions {
            let _ = tx.send(id);
        }
    }

    /// Live (scheduled, unfinished, unstopped) buffers as (id, start, duration).
    pub fn live(&self) -> Vec<(PlaybackId, f64, f64)> {
        lock_mock(&self.state).scheduled.clone()
    }

    /// Every schedule call ever made, in call order.
    pub fn schedule_log(&self) -> Vec<(PlaybackId, f64, f64)> {
        lock_mock(&self.state).schedule_log.clone()
    }

    pub fn stopped(&self) -> Vec<PlaybackId> {
        lock_mock(&self.state).stopped.clone()
    }

    pub fn is_released(&self) -> bool {
        lock_mock(&self.state).released
    }
}

/// Mock audio output with a manually advanced clock.
pub struct MockAudioOutput {
    state: Arc<Mutex<MockOutputState>>,
    sample_rate: u32,
    fail_all: bool,
}

impl MockAudioOutput {
    /// Create a mock output and its inspection handle.
    ///
    /// `completions` is the channel natural finishes are reported on
    /// (via [`MockOutputHandle::finish`]); pass None when the test polls
    /// the handle directly.
    pub fn new(completions: Option<Sender<PlaybackId>>) -> (Self, MockOutputHandle) {
        let state = Arc::new(Mutex::new(MockOutputState {
            next_id: 1,
            ..MockOutputState::default()
        }));
        let output = Self {
            state: state.clone(),
            sample_rate: defaults::PLAYBACK_SAMPLE_RATE,
            fail_all: false,
        };
        (
            output,
            MockOutputHandle {
                state,
                completions,
            },
        )
    }

    /// Make every schedule call fail, for error-path tests.
    pub fn failing(completions: Option<Sender<PlaybackId>>) -> (Self, MockOutputHandle) {
        let (mut output, handle) = Self::new(completions);
        output.fail_all = true;
        (output, handle)
    }
}

impl AudioOutput for MockAudioOutput {
    fn now(&self) -> f64 {
        lock_mock(&self.state).now
    }

    fn schedule(&mut self, samples: Vec<f32>, start_secs: f64) -> Result<PlaybackId> {
        if self.fail_all {
            return Err(VoxliveError::AudioPlayback {
                message: "mock schedule failure".to_string(),
            });
        }
        let duration = samples.len() as f64 / self.sample_rate as f64;
        let mut state = lock_mock(&self.state);
        let id = state.next_id;
        state.next_id += 1;
        state.scheduled.push((id, start_secs, duration));
        state.schedule_log.push((id, start_secs, duration));
        Ok(id)
    }

    fn stop(&mut self, id: PlaybackId) {
        let mut state = lock_mock(&self.state);
        state.scheduled.retain(|(sid, _, _)| *sid != id);
        state.stopped.push(id);
    }

    fn stop_all(&mut self) {
        let mut state = lock_mock(&self.state);
        let ids: Vec<PlaybackId> = state.scheduled.iter().map(|(id, _, _)| *id).collect();
        state.stopped.extend(ids);
        state.scheduled.clear();
    }

    fn release(&mut self) {
        let mut state = lock_mock(&self.state);
        state.scheduled.clear();
        state.released = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_copies_buffer_at_its_start_sample() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let state = Arc::new(Mutex::new(OutputState {
            cursor: 0,
            scheduled: vec![Scheduled {
                id: 7,
                start_sample: 2,
                samples: vec![0.5, 0.25],
            }],
        }));

        let mut data = [1.0f32; 6];
        render(&state, &mut data, 1, &tx);

        assert_eq!(data, [0.0, 0.0, 0.5, 0.25, 0.0, 0.0]);
        assert_eq!(state.lock().unwrap().cursor, 6);
        // Fully consumed → completion reported and buffer dropped.
        assert_eq!(rx.try_recv().unwrap(), 7);
        assert!(state.lock().unwrap().scheduled.is_empty());
    }

    #[test]
    fn render_keeps_partially_played_buffer() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let state = Arc::new(Mutex::new(OutputState {
            cursor: 0,
            scheduled: vec![Scheduled {
                id: 1,
                start_sample: 0,
                samples: vec![0.1; 8],
            }],
        }));

        let mut data = [0.0f32; 4];
        render(&state, &mut data, 1, &tx);

        assert!(rx.try_recv().is_err());
        assert_eq!(state.lock().unwrap().scheduled.len(), 1);

        render(&state, &mut data, 1, &tx);
        assert_eq!(rx.try_recv().unwrap(), 1);
    }

    #[test]
    fn render_duplicates_mono_across_channels() {
        let (tx, _rx) = crossbeam_channel::unbounded();
        let state = Arc::new(Mutex::new(OutputState {
            cursor: 0,
            scheduled: vec![Scheduled {
                id: 1,
                start_sample: 0,
                samples: vec![0.5, -0.5],
            }],
        }));

        let mut data = [0.0f32; 4];
        render(&state, &mut data, 2, &tx);
        assert_eq!(data, [0.5, 0.5, -0.5, -0.5]);
    }

    #[test]
    fn mock_output_tracks_schedule_and_stop() {
        let (mut output, handle) = MockAudioOutput::new(None);

        let a = output.schedule(vec![0.0; 24000], 0.0).unwrap();
        let b = output.schedule(vec![0.0; 12000], 1.0).unwrap();
        assert_eq!(handle.live().len(), 2);

        output.stop(a);
        assert_eq!(handle.live().len(), 1);
        assert_eq!(handle.stopped(), vec![a]);

        output.stop_all();
        assert!(handle.live().is_empty());
        assert_eq!(handle.stopped(), vec![a, b]);

        output.release();
        assert!(handle.is_released());
    }

    #[test]
    fn mock_output_clock_advances_manually() {
        let (output, handle) = MockAudioOutput::new(None);
        assert_eq!(output.now(), 0.0);
        handle.advance(1.5);
        assert_eq!(output.now(), 1.5);
    }

    #[test]
    fn mock_finish_reports_completion() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let (mut output, handle) = MockAudioOutput::new(Some(tx));
        let id = output.schedule(vec![0.0; 240], 0.0).unwrap();
        handle.finish(id);
        assert_eq!(rx.try_recv().unwrap(), id);
        assert!(handle.live().is_empty());
    }
}
