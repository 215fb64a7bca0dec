//! Player configuration
//!
//! Every tunable the playback core reads lives in [`PlayerConfig`], which
//! is built once (defaults, then an optional JSON file, then CLI flags) and
//! passed by reference into stream and controller construction.

use crate::error::PlayerError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Which clock the other streams synchronize to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    #[default]
    Audio,
    Video,
    External,
}

impl std::str::FromStr for SyncMode {
    type Err = PlayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "audio" => Ok(SyncMode::Audio),
            "video" => Ok(SyncMode::Video),
            "ext" | "external" => Ok(SyncMode::External),
            other => Err(PlayerError::Config(format!("unknown sync type: {other}"))),
        }
    }
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncMode::Audio => write!(f, "audio"),
            SyncMode::Video => write!(f, "video"),
            SyncMode::External => write!(f, "external"),
        }
    }
}

/// Frame dropping policy when the video path falls behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FrameDrop {
    /// Drop only when video is not the master clock.
    #[default]
    Auto,
    Always,
    Never,
}

impl FrameDrop {
    /// Whether dropping applies given that video is (or is not) the master.
    pub fn enabled(&self, video_is_master: bool) -> bool {
        match self {
            FrameDrop::Always => true,
            FrameDrop::Never => false,
            FrameDrop::Auto => !video_is_master,
        }
    }
}

/// Queue capacities and reader back-pressure limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub video_frames: usize,
    pub audio_frames: usize,
    pub subtitle_frames: usize,
    /// Reader stalls once all packet queues together hold more bytes than this.
    pub max_buffer_bytes: usize,
    /// A stream has "enough" packets above this count...
    pub min_packets: usize,
    /// ...if they also cover at least this many seconds.
    pub min_buffered_duration: f64,
    /// `None` picks unlimited buffering for realtime sources only.
    pub infinite_buffer: Option<bool>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            video_frames: 3,
            audio_frames: 9,
            subtitle_frames: 16,
            max_buffer_bytes: 15 * 1024 * 1024,
            min_packets: 25,
            min_buffered_duration: 1.0,
            infinite_buffer: None,
        }
    }
}

/// Synchronization thresholds, all in seconds unless stated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncTuning {
    /// Lower bound of the A/V correction threshold.
    pub sync_threshold_min: f64,
    /// Upper bound of the A/V correction threshold.
    pub sync_threshold_max: f64,
    /// Frames longer than this are stretched by the full diff instead of doubled.
    pub framedup_threshold: f64,
    /// Differences beyond this are treated as a discontinuity, not drift.
    pub nosync_threshold: f64,
    /// Longest the presentation thread sleeps between refreshes.
    pub refresh_rate: f64,
    /// Inter-frame durations above this are considered bogus timestamps.
    pub max_frame_duration: f64,
    /// Number of samples before the drift average is trusted.
    pub drift_avg_samples: u32,
    /// How much the averaged drift widens the late-frame threshold.
    pub drift_threshold_scale: f64,
    /// Largest audio chunk stretch or shrink, in percent.
    pub sample_correction_percent_max: u32,
}

impl Default for SyncTuning {
    fn default() -> Self {
        Self {
            sync_threshold_min: 0.04,
            sync_threshold_max: 0.1,
            framedup_threshold: 0.1,
            nosync_threshold: 10.0,
            refresh_rate: 0.01,
            max_frame_duration: 10.0,
            drift_avg_samples: 20,
            drift_threshold_scale: 0.5,
            sample_correction_percent_max: 10,
        }
    }
}

impl SyncTuning {
    /// Smoothing coefficient giving the last `drift_avg_samples` samples 99% of the weight.
    pub fn drift_avg_coef(&self) -> f64 {
        (0.01f64.ln() / self.drift_avg_samples.max(1) as f64).exp()
    }
}

/// External clock speed control for realtime sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExternalClockTuning {
    pub min_frames: usize,
    pub max_frames: usize,
    pub speed_min: f64,
    pub speed_max: f64,
    pub speed_step: f64,
}

impl Default for ExternalClockTuning {
    fn default() -> Self {
        Self {
            min_frames: 2,
            max_frames: 10,
            speed_min: 0.900,
            speed_max: 1.010,
            speed_step: 0.001,
        }
    }
}

/// Complete configuration consumed by the playback core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    pub sync_mode: SyncMode,
    pub frame_drop: FrameDrop,
    pub queues: QueueConfig,
    pub timing: SyncTuning,
    pub external_clock: ExternalClockTuning,
    /// Number of times playback runs; 0 loops forever.
    pub loop_count: u32,
    /// Stop the player at end of input instead of holding the last frame.
    pub autoexit: bool,
    /// Input is a live source (network stream, capture device).
    pub realtime: bool,
    pub start_paused: bool,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            sync_mode: SyncMode::default(),
            frame_drop: FrameDrop::default(),
            queues: QueueConfig::default(),
            timing: SyncTuning::default(),
            external_clock: ExternalClockTuning::default(),
            loop_count: 1,
            autoexit: false,
            realtime: false,
            start_paused: false,
        }
    }
}

impl PlayerConfig {
    /// Load a configuration from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, PlayerError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| PlayerError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self, PlayerError> {
        let config: PlayerConfig =
            serde_json::from_str(text).map_err(|e| PlayerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), PlayerError> {
        let q = &self.queues;
        if q.subtitle_frames == 0 {
            return Err(PlayerError::Config(
                "frame queue capacities must be positive".into(),
            ));
        }
        // video and audio queues retain their last frame in a slot of its own
        if q.video_frames < 2 || q.audio_frames < 2 {
            return Err(PlayerError::Config(format!(
                "video and audio frame queues need at least 2 slots, got {} and {}",
                q.video_frames, q.audio_frames
            )));
        }
        let t = &self.timing;
        if !(t.sync_threshold_min >= 0.0 && t.sync_threshold_min <= t.sync_threshold_max) {
            return Err(PlayerError::Config(format!(
                "sync threshold range [{}, {}] is inverted",
                t.sync_threshold_min, t.sync_threshold_max
            )));
        }
        if !(t.max_frame_duration > 0.0 && t.refresh_rate > 0.0) {
            return Err(PlayerError::Config(
                "max_frame_duration and refresh_rate must be positive".into(),
            ));
        }
        let e = &self.external_clock;
        if !(e.speed_min > 0.0 && e.speed_min <= 1.0 && e.speed_max >= 1.0) {
            return Err(PlayerError::Config(
                "external clock speed range must contain 1.0".into(),
            ));
        }
        Ok(())
    }
}

/// Returns a version as specified in Cargo.toml
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn app_name() -> &'static str {
    env!("CARGO_PKG_NAME")
}
