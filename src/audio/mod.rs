//! Audio device layer: microphone capture and scheduled speaker output.

pub mod capture;
pub mod output;

use crate::error::Result;
use crossbeam_channel::Sender;
use std::sync::Mutex;

pub use capture::{AudioSource, CpalAudioSource, MockAudioSource, suppress_audio_warnings};
pub use output::{AudioOutput, CpalAudioOutput, MockAudioOutput, MockOutputHandle, PlaybackId};

/// Opens fresh input/output device handles for one session.
///
/// Every session gets new handles so teardown can release them fully;
/// the factory itself outlives sessions.
pub trait DeviceFactory: Send + Sync {
    /// Acquire the microphone at the capture sample rate.
    fn open_input(&self) -> Result<Box<dyn AudioSource>>;

    /// Open the output context at the playback sample rate.
    ///
    /// `completions` receives the id of each buffer that finishes
    /// playing naturally (force-stopped buffers are not reported).
    fn open_output(&self, completions: Sender<PlaybackId>) -> Result<Box<dyn AudioOutput>>;
}

/// Real device factory backed by cpal.
#[derive(Debug, Clone, Default)]
pub struct CpalDeviceFactory {
    pub input_device: Option<String>,
    pub output_device: Option<String>,
}

impl DeviceFactory for CpalDeviceFactory {
    fn open_input(&self) -> Result<Box<dyn AudioSource>> {
        Ok(Box::new(CpalAudioSource::new(self.input_device.as_deref())?))
    }

    fn open_output(&self, completions: Sender<PlaybackId>) -> Result<Box<dyn AudioOutput>> {
        Ok(Box::new(CpalAudioOutput::new(
            self.output_device.as_deref(),
            completions,
        )?))
    }
}

/// Mock device factory for session tests: hands out a scripted capture
/// source and mock outputs whose handles remain inspectable.
#[derive(Default)]
pub struct MockDeviceFactory {
    next_source: Mutex<Option<MockAudioSource>>,
    last_output: Mutex<Option<output::MockOutputHandle>>,
    fail_input: bool,
    fail_output: bool,
}

impl MockDeviceFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use this scripted source for the next `open_input` call.
    pub fn with_source(source: MockAudioSource) -> Self {
        Self {
            next_source: Mutex::new(Some(source)),
            ..Self::default()
        }
    }

    /// Factory whose microphone acquisition fails.
    pub fn failing_input() -> Self {
        Self {
            fail_input: true,
            ..Self::default()
        }
    }

    /// Factory whose output context acquisition fails.
    pub fn failing_output() -> Self {
        Self {
            fail_output: true,
            ..Self::default()
        }
    }

    /// Inspection handle of the most recently opened mock output.
    pub fn output_handle(&self) -> Option<output::MockOutputHandle> {
        self.last_output
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl DeviceFactory for MockDeviceFactory {
    fn open_input(&self) -> Result<Box<dyn AudioSource>> {
        if self.fail_input {
            return Err(crate::error::VoxliveError::DeviceAccess {
                message: "mock microphone denied".to_string(),
            });
        }
        let source = self
            .next_source
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .unwrap_or_default();
        Ok(Box::new(source))
    }

    fn open_output(&self, completions: Sender<PlaybackId>) -> Result<Box<dyn AudioOutput>> {
        if self.fail_output {
            return Err(crate::error::VoxliveError::AudioPlayback {
                message: "mock output unavailable".to_string(),
            });
        }
        let (output, handle) = MockAudioOutput::new(Some(completions));
        *self.last_output.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(Box::new(output))
    }
}
