//! PCM wire codec: float samples ↔ base64-framed 16-bit little-endian PCM.
//!
//! Pure functions with no state. The encode side feeds the outbound
//! capture stream; the decode side reconstructs playback buffers from
//! inbound audio payloads.

use crate::defaults;
use crate::error::{Result, VoxliveError};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

/// One encoded audio chunk ready for the wire.
///
/// `data` is base64 text over 16-bit little-endian PCM; `mime` names the
/// encoding and sample rate so the remote service can interpret it.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct EncodedChunk {
    pub data: String,
    #[serde(rename = "mime_type")]
    pub mime: String,
}

/// A decoded multi-channel sample buffer at a known rate.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    /// One sample vector per channel, all the same length.
    pub channels: Vec<Vec<f32>>,
    pub sample_rate: u32,
}

impl AudioBuffer {
    /// Buffer duration in seconds (frames / rate).
    pub fn duration_secs(&self) -> f64 {
        let frames = self.channels.first().map(Vec::len).unwrap_or(0);
        frames as f64 / self.sample_rate as f64
    }

    /// Samples of the first (mono) channel, empty if no channels.
    pub fn mono(&self) -> &[f32] {
        self.channels.first().map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Encode one capture frame of normalized samples into a wire chunk.
///
/// Scaling is asymmetric: negative samples multiply by 32768, non-negative
/// by 32767. This uses the full negative i16 range without overflowing at
/// +1.0. Input is assumed pre-clamped to [-1, 1] by the capture layer.
pub fn encode_frame(samples: &[f32]) -> EncodedChunk {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let value = if sample < 0.0 {
            (sample * 32768.0) as i16
        } else {
            (sample * 32767.0) as i16
        };
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    EncodedChunk {
        data: BASE64.encode(&bytes),
        mime: defaults::CAPTURE_MIME.to_string(),
    }
}

/// Decode the base64 text framing of a wire chunk back to raw PCM bytes.
pub fn unframe(chunk: &EncodedChunk) -> Result<Vec<u8>> {
    BASE64
        .decode(&chunk.data)
        .map_err(|e| VoxliveError::MalformedAudio {
            message: format!("invalid base64 framing: {}", e),
        })
}

/// Decode raw 16-bit little-endian PCM bytes into per-channel float buffers.
///
/// Samples are interleaved by channel on the wire; each is rescaled by
/// 1/32768 to reconstruct the [-1, 1) range.
///
/// # Errors
/// Returns `VoxliveError::MalformedAudio` if the byte length is not a
/// whole multiple of `2 * channels`.
pub fn decode_chunk(bytes: &[u8], sample_rate: u32, channels: usize) -> Result<AudioBuffer> {
    if channels == 0 {
        return Err(VoxliveError::MalformedAudio {
            message: "zero channel count".to_string(),
        });
    }
    if bytes.len() % (2 * channels) != 0 {
        return Err(VoxliveError::MalformedAudio {
            message: format!(
                "{} bytes is not a whole number of {}-channel 16-bit frames",
                bytes.len(),
                channels
            ),
        });
    }

    let frames = bytes.len() / (2 * channels);
    let mut out = vec![Vec::with_capacity(frames); channels];
    for (i, pair) in bytes.chunks_exact(2).enumerate() {
        let value = i16::from_le_bytes([pair[0], pair[1]]);
        out[i % channels].push(value as f32 / 32768.0);
    }

    Ok(AudioBuffer {
        channels: out,
        sample_rate,
    })
}
