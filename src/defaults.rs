//! Default configuration constants for voxlive.
//!
//! This module provides shared constants used across different configuration types
//! to ensure consistency and eliminate duplication.

/// Microphone capture sample rate in Hz.
///
/// 16kHz is the standard for speech recognition input and is what the
/// remote service expects for inbound audio.
pub const CAPTURE_SAMPLE_RATE: u32 = 16000;

/// Playback sample rate in Hz for audio returned by the remote service.
///
/// The service synthesizes speech at 24kHz mono; the output context must
/// run at the same rate so chunk durations map 1:1 onto the output clock.
pub const PLAYBACK_SAMPLE_RATE: u32 = 24000;

/// Playback channel count. The remote service sends mono PCM.
pub const PLAYBACK_CHANNELS: usize = 1;

/// Fixed capture frame size in samples (256ms at 16kHz).
///
/// Each frame is encoded and sent to the remote service as one chunk:
/// large enough to keep the message rate low, small enough to stay
/// responsive.
pub const FRAME_SAMPLES: usize = 4096;

/// MIME-like tag attached to every outbound capture chunk.
pub const CAPTURE_MIME: &str = "pcm;rate=16000";

/// Default voice identity requested from the remote service.
pub const DEFAULT_VOICE: &str = "Puck";

/// Default language persona key.
pub const DEFAULT_LANGUAGE: &str = "en";

/// Default remote service endpoint.
pub const DEFAULT_ENDPOINT: &str = "wss://live.example.com/v1/session";

/// System transcript entry emitted when the session reaches Open.
pub const READY_MESSAGE: &str = "Connected. Start speaking.";

/// Capacity of the session event queue.
///
/// Sized for the worst observed burst: capture frames at ~4Hz plus
/// remote audio chunks arriving faster than realtime during synthesis.
pub const EVENT_QUEUE_SIZE: usize = 256;

/// Capture poll interval in milliseconds (~60Hz, well under one frame).
pub const CAPTURE_POLL_MS: u64 = 16;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_duration_is_256ms() {
        let ms = FRAME_SAMPLES as f64 / CAPTURE_SAMPLE_RATE as f64 * 1000.0;
        assert_eq!(ms, 256.0);
    }

    #[test]
    fn capture_mime_names_capture_rate() {
        assert!(CAPTURE_MIME.contains(&CAPTURE_SAMPLE_RATE.to_string()));
    }
}
