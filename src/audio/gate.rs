//! RMS noise gate.
//!
//! Quiet capture frames are replaced with silence of equal length before
//! they reach the transport, so ambient noise never feeds the remote agent's
//! turn-taking detector. The classification also tells the activity monitor
//! which frames count as live conversation.

use crate::audio::AudioFrame;

/// Default gate threshold as a fraction of full scale. Calibration is
/// environment-specific; override via `CallConfig`.
pub const DEFAULT_GATE_THRESHOLD: f32 = 0.03;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameClass {
    Voice,
    Silence,
}

/// Stateless per-frame classifier. The threshold is the only tunable.
#[derive(Debug, Clone, Copy)]
pub struct NoiseGate {
    threshold: f32,
}

impl NoiseGate {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn classify(&self, frame: &AudioFrame) -> FrameClass {
        if frame.rms() >= self.threshold {
            FrameClass::Voice
        } else {
            FrameClass::Silence
        }
    }

    /// Classify and gate a frame. `Silence` frames come back as an all-zero
    /// replacement of identical length and rate, never the original.
    pub fn apply(&self, frame: AudioFrame) -> (AudioFrame, FrameClass) {
        match self.classify(&frame) {
            FrameClass::Voice => (frame, FrameClass::Voice),
            FrameClass::Silence => (
                AudioFrame::silence(frame.len(), frame.sample_rate),
                FrameClass::Silence,
            ),
        }
    }
}

impl Default for NoiseGate {
    fn default() -> Self {
        Self::new(DEFAULT_GATE_THRESHOLD)
    }
}
