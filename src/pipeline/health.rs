//! Playback statistics
//!
//! Drops and decode errors never stop playback; they are counted here and
//! surfaced through [`PlaybackStats::summary`].

use std::sync::atomic::{AtomicU64, Ordering};

/// Playback counters shared by every pipeline thread.
///
/// All fields use atomic operations for thread-safe access.
#[derive(Debug, Default)]
pub struct PlaybackStats {
    /// Video frames discarded by the decode loop before queueing
    pub frame_drops_early: AtomicU64,

    /// Video frames skipped by the presentation thread
    pub frame_drops_late: AtomicU64,

    /// Packets the decoder rejected
    pub decode_errors: AtomicU64,

    /// Frames pushed into frame queues
    pub frames_decoded: AtomicU64,

    /// Video frames handed to the presenter
    pub frames_presented: AtomicU64,

    /// Audio callbacks that found no decoded audio
    pub audio_underruns: AtomicU64,

    /// Audio chunks whose sample count was corrected for drift
    pub sample_corrections: AtomicU64,

    /// Subtitles expired without being shown in full
    pub subtitles_expired: AtomicU64,
}

impl PlaybackStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_early_drop(&self) {
        self.frame_drops_early.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_late_drop(&self) {
        self.frame_drops_late.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decoded(&self) {
        self.frames_decoded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_presented(&self) {
        self.frames_presented.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_underrun(&self) {
        self.audio_underruns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sample_correction(&self) {
        self.sample_corrections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_subtitle_expired(&self) {
        self.subtitles_expired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_drops(&self) -> u64 {
        self.frame_drops_early.load(Ordering::Relaxed) + self.frame_drops_late.load(Ordering::Relaxed)
    }

    /// Dropped video frames as a percentage of all video frames seen.
    pub fn frame_drop_rate(&self) -> f64 {
        let drops = self.frame_drops();
        let total = drops + self.frames_presented.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        (drops as f64 / total as f64) * 100.0
    }

    pub fn summary(&self) -> StatsSummary {
        StatsSummary {
            frame_drops_early: self.frame_drops_early.load(Ordering::Relaxed),
            frame_drops_late: self.frame_drops_late.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            frames_decoded: self.frames_decoded.load(Ordering::Relaxed),
            frames_presented: self.frames_presented.load(Ordering::Relaxed),
            audio_underruns: self.audio_underruns.load(Ordering::Relaxed),
            sample_corrections: self.sample_corrections.load(Ordering::Relaxed),
            subtitles_expired: self.subtitles_expired.load(Ordering::Relaxed),
            frame_drop_rate: self.frame_drop_rate(),
        }
    }
}

/// Snapshot of playback counters
#[derive(Debug, Clone, PartialEq)]
pub struct StatsSummary {
    pub frame_drops_early: u64,
    pub frame_drops_late: u64,
    pub decode_errors: u64,
    pub frames_decoded: u64,
    pub frames_presented: u64,
    pub audio_underruns: u64,
    pub sample_corrections: u64,
    pub subtitles_expired: u64,
    pub frame_drop_rate: f64,
}

impl std::fmt::Display for StatsSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Playback: {} presented, {} decoded, drops {}/{} ({:.2}%), {} decode errors, {} underruns, {} corrections",
            self.frames_presented,
            self.frames_decoded,
            self.frame_drops_early,
            self.frame_drops_late,
            self.frame_drop_rate,
            self.decode_errors,
            self.audio_underruns,
            self.sample_corrections,
        )
    }
}
