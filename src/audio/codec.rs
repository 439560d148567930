//! PCM codec: normalized f32 samples to/from base64-wrapped 16-bit
//! little-endian PCM, the wire format of the realtime transport.

use crate::audio::{AudioFrame, CAPTURE_SAMPLE_RATE, PLAYBACK_SAMPLE_RATE};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("PCM payload has odd byte length: {0}")]
    OddLength(usize),
}

/// An opaque transport payload plus its mime/format tag.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedChunk {
    /// Base64-encoded 16-bit little-endian PCM.
    pub data: String,
    pub mime_type: String,
}

/// Convert a capture frame to a transport chunk.
///
/// Samples are clamped to ±1.0 before scaling so out-of-range input distorts
/// instead of wrapping around. Negative and positive halves scale by 0x8000
/// and 0x7FFF respectively, matching the i16 range exactly.
pub fn encode(frame: &AudioFrame) -> EncodedChunk {
    let mut pcm = Vec::with_capacity(frame.samples.len() * 2);
    for &sample in &frame.samples {
        let s = sample.clamp(-1.0, 1.0);
        let value = if s < 0.0 {
            (s * 32768.0) as i16
        } else {
            (s * 32767.0) as i16
        };
        pcm.extend_from_slice(&value.to_le_bytes());
    }
    EncodedChunk {
        data: BASE64.encode(&pcm),
        mime_type: format!("audio/pcm;rate={}", CAPTURE_SAMPLE_RATE),
    }
}

/// Decode an inbound synthesized-speech chunk into a 24kHz frame.
///
/// The divisor mirrors the asymmetric encode scaling, so a decoded sample is
/// always within one quantization step of the value that produced it.
/// A malformed payload yields an error the caller logs and drops; a single
/// bad chunk must never end the call.
pub fn decode(chunk: &EncodedChunk) -> Result<AudioFrame, DecodeError> {
    let bytes = BASE64.decode(&chunk.data)?;
    if bytes.len() % 2 != 0 {
        return Err(DecodeError::OddLength(bytes.len()));
    }

    let mut samples = Vec::with_capacity(bytes.len() / 2);
    for pair in bytes.chunks_exact(2) {
        let value = i16::from_le_bytes([pair[0], pair[1]]);
        let sample = if value < 0 {
            value as f32 / 32768.0
        } else {
            value as f32 / 32767.0
        };
        samples.push(sample);
    }

    Ok(AudioFrame::new(samples, PLAYBACK_SAMPLE_RATE))
}
