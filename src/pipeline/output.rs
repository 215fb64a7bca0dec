//! Presentation collaborators
//!
//! The playback core never renders anything itself. Video frames are
//! handed to a [`VideoPresenter`] at their scheduled moment; audio is
//! pulled by an [`AudioSink`]'s device clock.

use crate::pipeline::types::Frame;

/// Device-side audio format, fixed when the device is opened.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioSpec {
    pub sample_rate: u32,
    pub channels: u16,
    /// Sample frames delivered per device callback.
    pub period_frames: usize,
    /// Audio already handed to the device but not yet audible, in seconds.
    pub hardware_latency: f64,
}

impl AudioSpec {
    /// Interleaved samples per callback.
    pub fn period_samples(&self) -> usize {
        self.period_frames * self.channels as usize
    }

    pub fn period_duration(&self) -> f64 {
        self.period_frames as f64 / self.sample_rate.max(1) as f64
    }
}

/// Displays video frames. Must not block past the frame's deadline.
pub trait VideoPresenter: Send {
    fn present(&mut self, frame: &Frame, subtitle: Option<&Frame>);
}

/// Plays interleaved f32 samples in [`AudioSpec`] format.
pub trait AudioSink: Send {
    fn spec(&self) -> AudioSpec;

    fn play(&mut self, samples: &[f32]);
}
