//! Audio types shared across the capture and playback pipelines.
//!
//! Two fixed sample rates are in play and must never be confused: the
//! microphone captures at 16 kHz, the remote agent synthesizes at 24 kHz.

pub mod capture;
pub mod codec;
pub mod gate;
pub mod half_duplex;
pub mod playback;
pub mod sink;

/// Microphone capture rate in Hz.
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

/// Synthesized speech rate in Hz.
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;

/// Samples per capture frame (~128ms at 16kHz).
pub const FRAME_SAMPLES: usize = 2048;

/// A fixed-length slice of mono audio samples in the -1.0..=1.0 range.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// An all-zero frame of the given length.
    pub fn silence(len: usize, sample_rate: u32) -> Self {
        Self {
            samples: vec![0.0; len],
            sample_rate,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Root-mean-square energy of the frame, 0.0 for an empty frame.
    pub fn rms(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let sum_sq: f32 = self.samples.iter().map(|s| s * s).sum();
        (sum_sq / self.samples.len() as f32).sqrt()
    }
}
