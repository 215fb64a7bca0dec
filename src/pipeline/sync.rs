//! A/V synchronization for the presentation side
//!
//! Picks the master clock and decides, frame by frame, whether the current
//! video frame is presented, held back, or dropped.
//!
//! # Algorithm
//!
//! 1. The master clock is a static choice (`SyncMode`), falling back when the
//!    preferred stream does not exist.
//! 2. The nominal delay to the next frame is the pts delta of consecutive
//!    frames, clamped to reject bogus timestamps.
//! 3. When video is not the master, `diff = video_clock - master` shortens
//!    the delay when video is late and stretches it when early.
//! 4. A frame more than an adaptive threshold behind the master is dropped
//!    when dropping is enabled and another frame is already queued.
//! 5. Otherwise the caller sleeps for the remaining time (capped to the
//!    refresh quantum) and presents.
//!
//! An invalid master clock reads as NaN. NaN compares false against every
//! threshold, which disables correction and dropping until the clock is
//! set again. This is relied upon throughout.

use log::{debug, trace};

use crate::config::{ExternalClockTuning, PlayerConfig, SyncMode, SyncTuning};
use crate::pipeline::clock::Clock;
use crate::pipeline::frame_queue::FrameQueue;
use crate::pipeline::health::PlaybackStats;
use crate::pipeline::packet_queue::PacketQueue;
use crate::pipeline::types::{Frame, FramePayload};

/// The three playback clocks of one player.
pub struct Clocks<'q> {
    pub audio: Clock<'q>,
    pub video: Clock<'q>,
    pub external: Clock<'q>,
}

impl<'q> Clocks<'q> {
    pub fn new(audioq: &'q PacketQueue, videoq: &'q PacketQueue) -> Self {
        Self {
            audio: Clock::new(audioq),
            video: Clock::new(videoq),
            external: Clock::external(),
        }
    }

    pub fn pause_at(&self, time: f64) {
        self.audio.pause_at(time);
        self.video.pause_at(time);
        self.external.pause_at(time);
    }

    pub fn resume_at(&self, time: f64) {
        self.audio.resume_at(time);
        self.video.resume_at(time);
        self.external.resume_at(time);
    }
}

/// Resolve the configured mode against the streams that actually exist.
pub fn resolve_master(mode: SyncMode, has_audio: bool, has_video: bool) -> SyncMode {
    match mode {
        SyncMode::Audio if has_audio => SyncMode::Audio,
        SyncMode::Audio if has_video => SyncMode::Video,
        SyncMode::Video if has_video => SyncMode::Video,
        SyncMode::Video if has_audio => SyncMode::Audio,
        _ => SyncMode::External,
    }
}

/// Handle on whichever clock is the master.
#[derive(Clone, Copy)]
pub struct MasterClock<'a, 'q> {
    kind: SyncMode,
    clocks: &'a Clocks<'q>,
}

impl<'a, 'q> MasterClock<'a, 'q> {
    pub fn new(kind: SyncMode, clocks: &'a Clocks<'q>) -> Self {
        Self { kind, clocks }
    }

    pub fn kind(&self) -> SyncMode {
        self.kind
    }

    pub fn clocks(&self) -> &'a Clocks<'q> {
        self.clocks
    }

    pub fn clock(&self) -> &'a Clock<'q> {
        match self.kind {
            SyncMode::Audio => &self.clocks.audio,
            SyncMode::Video => &self.clocks.video,
            SyncMode::External => &self.clocks.external,
        }
    }

    pub fn now_at(&self, time: f64) -> f64 {
        self.clock().now_at(time)
    }
}

/// Exponentially weighted running average of a clock difference.
///
/// The average is only reported once enough samples have been seen.
#[derive(Debug, Clone)]
pub struct DriftAverage {
    cum: f64,
    coef: f64,
    count: u32,
    needed: u32,
}

impl DriftAverage {
    pub fn new(tuning: &SyncTuning) -> Self {
        Self {
            cum: 0.0,
            coef: tuning.drift_avg_coef(),
            count: 0,
            needed: tuning.drift_avg_samples,
        }
    }

    /// Accumulate one sample and return the average once it is trusted.
    pub fn push(&mut self, diff: f64) -> Option<f64> {
        self.cum = diff + self.coef * self.cum;
        if self.count < self.needed {
            self.count += 1;
            None
        } else {
            Some(self.cum * (1.0 - self.coef))
        }
    }

    pub fn average(&self) -> Option<f64> {
        (self.count >= self.needed).then(|| self.cum * (1.0 - self.coef))
    }

    pub fn reset(&mut self) {
        self.cum = 0.0;
        self.count = 0;
    }
}

/// What the presentation thread should do with the video queue now.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameAction {
    /// Display this frame. The queue has already advanced past it.
    Present(Frame),
    /// The current frame is not due yet.
    Wait,
    /// No undisplayed frame is queued.
    Idle,
    /// The decoder drained and the last frame was shown.
    EndOfStream,
}

/// Result of [`SyncController::next_frame_deadline`].
#[derive(Debug, Clone, PartialEq)]
pub struct Deadline {
    pub action: FrameAction,
    /// Seconds the caller may sleep before refreshing again.
    pub remaining: f64,
}

/// Per-frame video timing decisions
pub struct SyncController<'a, 'q> {
    master: MasterClock<'a, 'q>,
    tuning: SyncTuning,
    frame_drop: bool,
    stats: &'a PlaybackStats,
    /// Wall time at which the current frame became due.
    frame_timer: f64,
    drift: DriftAverage,
    paused: bool,
    step: bool,
}

impl<'a, 'q> SyncController<'a, 'q> {
    pub fn new(
        config: &PlayerConfig,
        clocks: &'a Clocks<'q>,
        stats: &'a PlaybackStats,
        has_audio: bool,
        has_video: bool,
    ) -> Self {
        let kind = resolve_master(config.sync_mode, has_audio, has_video);
        if kind != config.sync_mode {
            debug!("SyncController: {} master unavailable, using {}", config.sync_mode, kind);
        }
        Self {
            master: MasterClock::new(kind, clocks),
            tuning: config.timing.clone(),
            frame_drop: config.frame_drop.enabled(kind == SyncMode::Video),
            stats,
            frame_timer: 0.0,
            drift: DriftAverage::new(&config.timing),
            paused: false,
            step: false,
        }
    }

    pub fn master(&self) -> MasterClock<'a, 'q> {
        self.master
    }

    pub fn stats(&self) -> &'a PlaybackStats {
        self.stats
    }

    pub fn master_now_at(&self, time: f64) -> f64 {
        self.master.now_at(time)
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn frame_timer(&self) -> f64 {
        self.frame_timer
    }

    /// Averaged video-master difference, once enough samples were seen.
    pub fn average_drift(&self) -> Option<f64> {
        self.drift.average()
    }

    /// Pause or resume every clock; the frame timer skips the paused interval.
    pub fn set_paused_at(&mut self, paused: bool, time: f64) {
        if paused == self.paused {
            return;
        }
        let clocks = self.master.clocks();
        if paused {
            clocks.pause_at(time);
        } else {
            let paused_since = clocks.video.last_updated();
            if paused_since.is_finite() {
                self.frame_timer += time - paused_since;
            }
            clocks.resume_at(time);
        }
        self.paused = paused;
    }

    pub fn toggle_pause_at(&mut self, time: f64) {
        self.set_paused_at(!self.paused, time);
        self.step = false;
    }

    /// Show exactly one more frame, then pause.
    pub fn step_frame_at(&mut self, time: f64) {
        if self.paused {
            self.set_paused_at(false, time);
        }
        self.step = true;
    }

    /// Nominal display time of `current` given the frame that follows it.
    pub fn frame_duration(&self, current: &Frame, next: &Frame) -> f64 {
        if current.serial != next.serial {
            return 0.0;
        }
        let duration = next.pts - current.pts;
        if duration.is_nan() || duration <= 0.0 || duration > self.tuning.max_frame_duration {
            current.duration
        } else {
            duration
        }
    }

    fn sync_threshold(&self, delay: f64) -> f64 {
        delay
            .min(self.tuning.sync_threshold_max)
            .max(self.tuning.sync_threshold_min)
    }

    /// How far behind the master a frame of `duration` may fall before it is dropped.
    pub fn late_threshold(&self, duration: f64) -> f64 {
        let base = self.sync_threshold(duration);
        let widened = base + self.tuning.drift_threshold_scale * self.drift.average().unwrap_or(0.0).abs();
        widened.min(self.tuning.max_frame_duration)
    }

    /// Adjust the nominal `delay` so video converges on the master clock.
    pub fn compute_target_delay(&mut self, delay: f64, time: f64) -> f64 {
        let mut delay = delay;
        if self.master.kind() != SyncMode::Video {
            let clocks = self.master.clocks();
            let diff = clocks.video.now_at(time) - self.master.now_at(time);
            let sync_threshold = self.sync_threshold(delay);
            if !diff.is_nan() && diff.abs() < self.tuning.max_frame_duration {
                self.drift.push(diff);
                if diff <= -sync_threshold {
                    delay = (delay + diff).max(0.0);
                } else if diff >= sync_threshold && delay > self.tuning.framedup_threshold {
                    delay += diff;
                } else if diff >= sync_threshold {
                    delay *= 2.0;
                }
            }
            trace!("video: delay={delay:.3} A-V={:.3}", -diff);
        }
        delay
    }

    /// Bind the video clock to a presented frame and keep the external clock close.
    pub fn update_video_pts(&self, pts: f64, serial: u64, time: f64) {
        let clocks = self.master.clocks();
        clocks.video.set_at(pts, serial, time);
        clocks
            .external
            .sync_to_slave_at(&clocks.video, self.tuning.nosync_threshold, time);
    }

    /// An invalid master never makes a frame late, whatever the frame timer says.
    fn is_late(&self, frame: &Frame, duration: f64, time: f64) -> bool {
        let master = self.master.now_at(time);
        if master.is_nan() {
            return false;
        }
        let diff = frame.pts - master;
        diff < -self.late_threshold(duration) || time > self.frame_timer + duration
    }

    /// Decide what to do with the video queue at wall time `time`.
    ///
    /// Late frames are dropped here; stale frames from before a flush are
    /// discarded. A presented frame has already been advanced past, so on a
    /// keep-last queue it remains available through `peek_last`.
    pub fn next_frame_deadline(&mut self, pictq: &FrameQueue<'_>, time: f64) -> Deadline {
        let mut remaining = self.tuning.refresh_rate;
        loop {
            if pictq.remaining() == 0 {
                return Deadline {
                    action: FrameAction::Idle,
                    remaining,
                };
            }
            let (Some(last), Some(current)) = (pictq.peek_last(), pictq.peek()) else {
                return Deadline {
                    action: FrameAction::Idle,
                    remaining,
                };
            };

            if current.serial != pictq.packet_queue().serial() {
                pictq.next();
                continue;
            }
            if last.serial != current.serial {
                self.frame_timer = time;
            }
            if current.is_end_of_stream() {
                return Deadline {
                    action: FrameAction::EndOfStream,
                    remaining,
                };
            }
            if self.paused {
                return Deadline {
                    action: FrameAction::Wait,
                    remaining,
                };
            }

            let last_duration = self.frame_duration(&last, &current);
            let delay = self.compute_target_delay(last_duration, time);

            if time < self.frame_timer + delay {
                remaining = remaining.min(self.frame_timer + delay - time);
                return Deadline {
                    action: FrameAction::Wait,
                    remaining,
                };
            }

            self.frame_timer += delay;
            if delay > 0.0 && time - self.frame_timer > self.tuning.sync_threshold_max {
                self.frame_timer = time;
            }

            if !current.pts.is_nan() {
                self.update_video_pts(current.pts, current.serial, time);
            }

            if self.frame_drop && !self.step && pictq.remaining() > 1 {
                if let Ok(next) = pictq.peek_next() {
                    let duration = self.frame_duration(&current, &next);
                    if self.is_late(&current, duration, time) {
                        trace!("video: dropping late frame pts={:.3}", current.pts);
                        self.stats.record_late_drop();
                        pictq.next();
                        continue;
                    }
                }
            }

            pictq.next();
            if self.step && !self.paused {
                self.set_paused_at(true, time);
                self.step = false;
            }
            return Deadline {
                action: FrameAction::Present(current),
                remaining,
            };
        }
    }

    /// Discard subtitles whose display window has passed at the video clock.
    pub fn expire_subtitles(&self, subq: &FrameQueue<'_>) {
        let video_pts = self.master.clocks().video.pts();
        while subq.remaining() > 0 {
            let Some(current) = subq.peek() else { break };
            let next = subq.peek_next().ok();
            let stale = current.serial != subq.packet_queue().serial();
            let ended = subtitle_window(&current).is_some_and(|(_, end)| video_pts > end);
            let superseded = next
                .as_ref()
                .and_then(subtitle_window)
                .is_some_and(|(start, _)| video_pts > start);
            if stale || ended || superseded {
                if !stale && !ended {
                    self.stats.record_subtitle_expired();
                }
                subq.next();
            } else {
                break;
            }
        }
    }

    /// The subtitle that should be on screen at the current video clock.
    pub fn active_subtitle(&self, subq: &FrameQueue<'_>) -> Option<Frame> {
        let video_pts = self.master.clocks().video.pts();
        if subq.remaining() == 0 {
            return None;
        }
        subq.peek()
            .filter(|frame| subtitle_window(frame).is_some_and(|(start, _)| video_pts >= start))
    }
}

fn subtitle_window(frame: &Frame) -> Option<(f64, f64)> {
    match &frame.payload {
        FramePayload::Subtitle(sub) => Some((frame.pts + sub.start_display, frame.pts + sub.end_display)),
        _ => None,
    }
}

/// Decode-side drop of frames that are already late when they leave the decoder.
pub struct EarlyDrop<'a, 'q> {
    master: MasterClock<'a, 'q>,
    nosync_threshold: f64,
    enabled: bool,
}

impl<'a, 'q> EarlyDrop<'a, 'q> {
    pub fn new(config: &PlayerConfig, master: MasterClock<'a, 'q>) -> Self {
        Self {
            master,
            nosync_threshold: config.timing.nosync_threshold,
            enabled: config.frame_drop.enabled(master.kind() == SyncMode::Video),
        }
    }

    /// Whether a decoded frame should be discarded before queueing.
    ///
    /// Only applies when the decoder works on the serial the video clock was
    /// last set from and more packets are waiting, so catching up is possible.
    pub fn should_drop(&self, pts: f64, decoder_serial: u64, videoq: &PacketQueue, time: f64) -> bool {
        if !self.enabled || pts.is_nan() {
            return false;
        }
        let diff = pts - self.master.now_at(time);
        !diff.is_nan()
            && diff.abs() < self.nosync_threshold
            && diff < 0.0
            && decoder_serial == self.master.clocks().video.serial()
            && !videoq.is_empty()
    }
}

/// Audio-side drift correction when audio is not the master
///
/// Returns how many samples the next chunk should have so audio converges
/// on the master without audible jumps.
pub struct AudioSync<'a, 'q> {
    master: MasterClock<'a, 'q>,
    drift: DriftAverage,
    /// Averaged differences below this many seconds are left alone.
    diff_threshold: f64,
    nosync_threshold: f64,
    max_percent: u32,
}

impl<'a, 'q> AudioSync<'a, 'q> {
    pub fn new(config: &PlayerConfig, master: MasterClock<'a, 'q>, diff_threshold: f64) -> Self {
        Self {
            master,
            drift: DriftAverage::new(&config.timing),
            diff_threshold,
            nosync_threshold: config.timing.nosync_threshold,
            max_percent: config.timing.sample_correction_percent_max.min(100),
        }
    }

    pub fn wanted_samples(&mut self, nb_samples: usize, sample_rate: u32, time: f64) -> usize {
        if self.master.kind() == SyncMode::Audio {
            return nb_samples;
        }
        let diff = self.master.clocks().audio.now_at(time) - self.master.now_at(time);
        if diff.is_nan() || diff.abs() >= self.nosync_threshold {
            // too far off: a discontinuity, not drift
            self.drift.reset();
            return nb_samples;
        }
        let Some(avg) = self.drift.push(diff) else {
            return nb_samples;
        };
        if avg.abs() < self.diff_threshold {
            return nb_samples;
        }
        let wanted = nb_samples as f64 + diff * sample_rate as f64;
        let min = (nb_samples * (100 - self.max_percent) as usize / 100) as f64;
        let max = (nb_samples * (100 + self.max_percent) as usize / 100) as f64;
        let wanted = wanted.clamp(min, max) as usize;
        trace!(
            "audio: diff={diff:.3} adiff={avg:.3} sample_diff={} threshold={:.3}",
            wanted as i64 - nb_samples as i64,
            self.diff_threshold
        );
        wanted
    }
}

/// Nudge the external clock so realtime sources neither underflow nor pile up.
pub fn adjust_external_clock_speed(
    external: &Clock<'_>,
    videoq: Option<&PacketQueue>,
    audioq: Option<&PacketQueue>,
    tuning: &ExternalClockTuning,
    time: f64,
) {
    let starving = |q: Option<&PacketQueue>| q.is_some_and(|q| q.len() <= tuning.min_frames);
    let stocked = |q: Option<&PacketQueue>| q.is_none_or(|q| q.len() > tuning.max_frames);

    let speed = external.speed();
    if starving(videoq) || starving(audioq) {
        external.set_speed_at((speed - tuning.speed_step).max(tuning.speed_min), time);
    } else if stocked(videoq) && stocked(audioq) {
        external.set_speed_at((speed + tuning.speed_step).min(tuning.speed_max), time);
    } else if speed != 1.0 {
        let toward_one = tuning.speed_step * (1.0 - speed) / (1.0 - speed).abs();
        external.set_speed_at(speed + toward_one, time);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{MediaKind, PixelFormat, Subtitle, VideoGeometry};

    struct Fixture {
        audioq: PacketQueue,
        videoq: PacketQueue,
        stats: PlaybackStats,
    }

    impl Fixture {
        fn new() -> Self {
            let audioq = PacketQueue::new(MediaKind::Audio);
            let videoq = PacketQueue::new(MediaKind::Video);
            audioq.start();
            videoq.start();
            Self {
                audioq,
                videoq,
                stats: PlaybackStats::new(),
            }
        }
    }

    fn picture(pts: f64, serial: u64) -> Frame {
        Frame::video(
            vec![0u8; 4],
            VideoGeometry::new(1, 1, PixelFormat::Rgba),
            pts,
            0.033,
            serial,
        )
    }

    fn config(sync_threshold_min: f64) -> PlayerConfig {
        let mut config = PlayerConfig::default();
        config.timing.sync_threshold_min = sync_threshold_min;
        config
    }

    #[test]
    fn test_master_resolution() {
        assert_eq!(resolve_master(SyncMode::Audio, true, true), SyncMode::Audio);
        assert_eq!(resolve_master(SyncMode::Audio, false, true), SyncMode::Video);
        assert_eq!(resolve_master(SyncMode::Audio, false, false), SyncMode::External);
        assert_eq!(resolve_master(SyncMode::Video, false, true), SyncMode::Video);
        assert_eq!(resolve_master(SyncMode::Video, true, false), SyncMode::Audio);
        assert_eq!(resolve_master(SyncMode::External, true, true), SyncMode::External);
    }

    #[test]
    fn test_late_frames_dropped_against_audio_master() {
        let fx = Fixture::new();
        let clocks = Clocks::new(&fx.audioq, &fx.videoq);
        let pictq = FrameQueue::new(&fx.videoq, 4, true).unwrap();
        let serial = fx.videoq.serial();
        for pts in [0.0, 0.033, 0.066, 0.100] {
            pictq.peek_writable().unwrap().push(picture(pts, serial));
        }

        // audio master frozen at 0.5
        clocks.audio.set_at(0.5, fx.audioq.serial(), 100.0);
        clocks.audio.pause_at(100.0);

        let config = config(0.1);
        let mut sync = SyncController::new(&config, &clocks, &fx.stats, true, true);
        let deadline = sync.next_frame_deadline(&pictq, 100.0);

        match deadline.action {
            FrameAction::Present(frame) => assert!((frame.pts - 0.100).abs() < 1e-9),
            other => panic!("expected a presented frame, got {other:?}"),
        }
        assert_eq!(fx.stats.summary().frame_drops_late, 3);
        assert_eq!(pictq.remaining(), 0);
        assert!(deadline.remaining <= config.timing.refresh_rate);
    }

    #[test]
    fn test_invalid_master_disables_dropping() {
        let fx = Fixture::new();
        let clocks = Clocks::new(&fx.audioq, &fx.videoq);
        let pictq = FrameQueue::new(&fx.videoq, 4, true).unwrap();
        let serial = fx.videoq.serial();
        for pts in [0.0, 0.033, 0.066] {
            pictq.peek_writable().unwrap().push(picture(pts, serial));
        }
        // audio clock never set: NaN
        let config = config(0.1);
        let mut sync = SyncController::new(&config, &clocks, &fx.stats, true, true);
        let deadline = sync.next_frame_deadline(&pictq, 100.0);
        assert!(matches!(deadline.action, FrameAction::Present(ref f) if f.pts == 0.0));
        assert_eq!(fx.stats.summary().frame_drops_late, 0);
    }

    #[test]
    fn test_invalid_master_keeps_frames_when_presentation_falls_behind() {
        let fx = Fixture::new();
        let clocks = Clocks::new(&fx.audioq, &fx.videoq);
        let pictq = FrameQueue::new(&fx.videoq, 4, true).unwrap();
        let serial = fx.videoq.serial();
        for pts in [0.0, 0.04, 0.08] {
            pictq.peek_writable().unwrap().push(picture(pts, serial));
        }
        let config = PlayerConfig::default();
        let mut sync = SyncController::new(&config, &clocks, &fx.stats, true, true);

        assert!(matches!(
            sync.next_frame_deadline(&pictq, 1.0).action,
            FrameAction::Present(ref f) if f.pts == 0.0
        ));
        // 90ms later: past the frame timer for 0.04, but the audio clock is NaN
        assert!(matches!(
            sync.next_frame_deadline(&pictq, 1.09).action,
            FrameAction::Present(ref f) if f.pts == 0.04
        ));
        assert_eq!(fx.stats.summary().frame_drops_late, 0);
    }

    #[test]
    fn test_early_frame_waits() {
        let fx = Fixture::new();
        let clocks = Clocks::new(&fx.audioq, &fx.videoq);
        let pictq = FrameQueue::new(&fx.videoq, 4, true).unwrap();
        let serial = fx.videoq.serial();
        pictq.peek_writable().unwrap().push(picture(0.0, serial));
        pictq.peek_writable().unwrap().push(picture(0.04, serial));

        let config = PlayerConfig {
            sync_mode: SyncMode::Video,
            ..PlayerConfig::default()
        };
        let mut sync = SyncController::new(&config, &clocks, &fx.stats, true, true);

        let first = sync.next_frame_deadline(&pictq, 10.0);
        assert!(matches!(first.action, FrameAction::Present(_)));

        // 10ms later the 40ms frame is not due yet
        let second = sync.next_frame_deadline(&pictq, 10.01);
        assert_eq!(second.action, FrameAction::Wait);
        assert!(second.remaining > 0.0 && second.remaining <= 0.01 + 1e-9);

        let third = sync.next_frame_deadline(&pictq, 10.05);
        assert!(matches!(third.action, FrameAction::Present(ref f) if f.pts == 0.04));
    }

    #[test]
    fn test_stale_serial_frames_skipped() {
        let fx = Fixture::new();
        let clocks = Clocks::new(&fx.audioq, &fx.videoq);
        let pictq = FrameQueue::new(&fx.videoq, 4, true).unwrap();
        let old = fx.videoq.serial();
        pictq.peek_writable().unwrap().push(picture(5.0, old));
        pictq.peek_writable().unwrap().push(picture(5.04, old));
        fx.videoq.flush();
        pictq.peek_writable().unwrap().push(picture(0.0, fx.videoq.serial()));

        let config = PlayerConfig::default();
        let mut sync = SyncController::new(&config, &clocks, &fx.stats, false, true);
        let deadline = sync.next_frame_deadline(&pictq, 1.0);
        assert!(matches!(deadline.action, FrameAction::Present(ref f) if f.pts == 0.0));
        assert_eq!(fx.stats.summary().frame_drops_late, 0);
    }

    #[test]
    fn test_end_of_stream_holds_last_frame() {
        let fx = Fixture::new();
        let clocks = Clocks::new(&fx.audioq, &fx.videoq);
        let pictq = FrameQueue::new(&fx.videoq, 3, true).unwrap();
        let serial = fx.videoq.serial();
        pictq.peek_writable().unwrap().push(picture(0.0, serial));
        pictq.peek_writable().unwrap().push(Frame::end_of_stream(serial));

        let config = PlayerConfig::default();
        let mut sync = SyncController::new(&config, &clocks, &fx.stats, false, true);
        assert!(matches!(
            sync.next_frame_deadline(&pictq, 1.0).action,
            FrameAction::Present(_)
        ));
        assert_eq!(sync.next_frame_deadline(&pictq, 2.0).action, FrameAction::EndOfStream);
        assert_eq!(pictq.peek_last().unwrap().pts, 0.0);
    }

    #[test]
    fn test_frame_duration_rejects_bogus_deltas() {
        let fx = Fixture::new();
        let clocks = Clocks::new(&fx.audioq, &fx.videoq);
        let config = PlayerConfig::default();
        let sync = SyncController::new(&config, &clocks, &fx.stats, true, true);

        let a = picture(1.0, 1);
        assert!((sync.frame_duration(&a, &picture(1.04, 1)) - 0.04).abs() < 1e-9);
        assert_eq!(sync.frame_duration(&a, &picture(0.5, 1)), a.duration);
        assert_eq!(sync.frame_duration(&a, &picture(100.0, 1)), a.duration);
        assert_eq!(sync.frame_duration(&a, &picture(1.04, 2)), 0.0);
    }

    #[test]
    fn test_target_delay_corrections() {
        let fx = Fixture::new();
        let clocks = Clocks::new(&fx.audioq, &fx.videoq);
        let config = PlayerConfig::default();
        let mut sync = SyncController::new(&config, &clocks, &fx.stats, true, true);
        clocks.audio.set_at(10.0, fx.audioq.serial(), 0.0);

        // video late by 0.2s: delay shrinks to zero
        clocks.video.set_at(9.8, fx.videoq.serial(), 0.0);
        assert_eq!(sync.compute_target_delay(0.04, 0.0), 0.0);

        // video early by 0.05s with a short frame: delay doubles
        clocks.video.set_at(10.05, fx.videoq.serial(), 0.0);
        assert!((sync.compute_target_delay(0.04, 0.0) - 0.08).abs() < 1e-9);

        // early by 0.15s with a long frame: stretched by the diff
        clocks.video.set_at(10.15, fx.videoq.serial(), 0.0);
        assert!((sync.compute_target_delay(0.2, 0.0) - 0.35).abs() < 1e-9);

        // discontinuity beyond max_frame_duration: untouched
        clocks.video.set_at(50.0, fx.videoq.serial(), 0.0);
        assert_eq!(sync.compute_target_delay(0.04, 0.0), 0.04);
    }

    #[test]
    fn test_drift_average_widens_threshold() {
        let fx = Fixture::new();
        let clocks = Clocks::new(&fx.audioq, &fx.videoq);
        let config = PlayerConfig::default();
        let mut sync = SyncController::new(&config, &clocks, &fx.stats, true, true);
        let base = sync.late_threshold(0.04);
        assert!((base - 0.04).abs() < 1e-9);

        clocks.audio.set_at(10.0, fx.audioq.serial(), 0.0);
        clocks.video.set_at(9.7, fx.videoq.serial(), 0.0);
        for _ in 0..=config.timing.drift_avg_samples {
            sync.compute_target_delay(0.04, 0.0);
        }
        assert!(sync.average_drift().is_some());
        assert!(sync.late_threshold(0.04) > base);
    }

    #[test]
    fn test_pause_holds_and_shifts_frame_timer() {
        let fx = Fixture::new();
        let clocks = Clocks::new(&fx.audioq, &fx.videoq);
        let pictq = FrameQueue::new(&fx.videoq, 4, true).unwrap();
        let serial = fx.videoq.serial();
        pictq.peek_writable().unwrap().push(picture(0.0, serial));
        pictq.peek_writable().unwrap().push(picture(0.04, serial));

        let config = PlayerConfig {
            sync_mode: SyncMode::Video,
            ..PlayerConfig::default()
        };
        let mut sync = SyncController::new(&config, &clocks, &fx.stats, false, true);
        assert!(matches!(sync.next_frame_deadline(&pictq, 1.0).action, FrameAction::Present(_)));
        let timer = sync.frame_timer();

        sync.toggle_pause_at(1.01);
        assert!(clocks.video.is_paused());
        assert_eq!(sync.next_frame_deadline(&pictq, 5.0).action, FrameAction::Wait);

        sync.toggle_pause_at(6.01);
        assert!((sync.frame_timer() - (timer + 5.0)).abs() < 1e-9);
        assert_eq!(sync.next_frame_deadline(&pictq, 6.02).action, FrameAction::Wait);
        assert!(matches!(
            sync.next_frame_deadline(&pictq, 6.05).action,
            FrameAction::Present(ref f) if f.pts == 0.04
        ));
    }

    #[test]
    fn test_step_pauses_after_one_frame() {
        let fx = Fixture::new();
        let clocks = Clocks::new(&fx.audioq, &fx.videoq);
        let pictq = FrameQueue::new(&fx.videoq, 4, true).unwrap();
        let serial = fx.videoq.serial();
        pictq.peek_writable().unwrap().push(picture(0.0, serial));
        pictq.peek_writable().unwrap().push(picture(0.04, serial));

        let config = PlayerConfig::default();
        let mut sync = SyncController::new(&config, &clocks, &fx.stats, false, true);
        sync.set_paused_at(true, 0.5);
        sync.step_frame_at(1.0);
        assert!(matches!(sync.next_frame_deadline(&pictq, 1.0).action, FrameAction::Present(_)));
        assert!(sync.is_paused());
    }

    #[test]
    fn test_early_drop() {
        let fx = Fixture::new();
        let clocks = Clocks::new(&fx.audioq, &fx.videoq);
        let config = PlayerConfig::default();
        let master = MasterClock::new(SyncMode::Audio, &clocks);
        let early = EarlyDrop::new(&config, master);
        let serial = fx.videoq.serial();

        clocks.audio.set_at(2.0, fx.audioq.serial(), 0.0);
        clocks.video.set_at(1.0, serial, 0.0);

        // empty packet queue: no drop, nothing to catch up with
        assert!(!early.should_drop(1.5, serial, &fx.videoq, 0.0));
        fx.videoq.push(crate::pipeline::types::Packet::new(vec![1u8], Some(1.6), 0.04)).unwrap();
        assert!(early.should_drop(1.5, serial, &fx.videoq, 0.0));
        assert!(!early.should_drop(2.5, serial, &fx.videoq, 0.0));
        assert!(!early.should_drop(f64::NAN, serial, &fx.videoq, 0.0));
        assert!(!early.should_drop(1.5, serial + 1, &fx.videoq, 0.0));
    }

    #[test]
    fn test_audio_sync_corrects_after_average() {
        let fx = Fixture::new();
        let clocks = Clocks::new(&fx.audioq, &fx.videoq);
        let config = PlayerConfig::default();
        let master = MasterClock::new(SyncMode::External, &clocks);
        let mut audio_sync = AudioSync::new(&config, master, 0.02);

        clocks.external.set_at(10.0, 0, 0.0);
        clocks.audio.set_at(10.1, fx.audioq.serial(), 0.0);

        let mut last = 0;
        for _ in 0..=config.timing.drift_avg_samples {
            last = audio_sync.wanted_samples(1024, 48_000, 0.0);
        }
        // audio ahead: stretch, clamped to +10%
        assert_eq!(last, 1024 * 110 / 100);

        let master = MasterClock::new(SyncMode::Audio, &clocks);
        let mut audio_master = AudioSync::new(&config, master, 0.02);
        assert_eq!(audio_master.wanted_samples(1024, 48_000, 0.0), 1024);
    }

    #[test]
    fn test_external_clock_speed() {
        let fx = Fixture::new();
        let ext = Clock::external();
        ext.set_at(0.0, 0, 0.0);
        let tuning = ExternalClockTuning::default();

        adjust_external_clock_speed(&ext, Some(&fx.videoq), None, &tuning, 0.0);
        assert!((ext.speed() - 0.999).abs() < 1e-9);

        for i in 0..20 {
            fx.videoq.push(crate::pipeline::types::Packet::new(vec![i as u8], None, 0.0)).unwrap();
        }
        adjust_external_clock_speed(&ext, Some(&fx.videoq), None, &tuning, 0.0);
        adjust_external_clock_speed(&ext, Some(&fx.videoq), None, &tuning, 0.0);
        assert!((ext.speed() - 1.001).abs() < 1e-9);
    }

    #[test]
    fn test_subtitle_expiry() {
        let fx = Fixture::new();
        let subq_packets = PacketQueue::new(MediaKind::Subtitle);
        subq_packets.start();
        let clocks = Clocks::new(&fx.audioq, &fx.videoq);
        let subq = FrameQueue::new(&subq_packets, 16, false).unwrap();
        let serial = subq_packets.serial();
        let sub = |text: &str, pts: f64| {
            Frame::subtitle(
                Subtitle {
                    text: text.into(),
                    start_display: 0.0,
                    end_display: 1.0,
                },
                pts,
                serial,
            )
        };
        subq.peek_writable().unwrap().push(sub("one", 0.0));
        subq.peek_writable().unwrap().push(sub("two", 5.0));

        let config = PlayerConfig::default();
        let sync = SyncController::new(&config, &clocks, &fx.stats, false, true);

        clocks.video.set_at(0.5, fx.videoq.serial(), 0.0);
        sync.expire_subtitles(&subq);
        assert_eq!(subq.remaining(), 2);
        assert!(sync.active_subtitle(&subq).is_some());

        clocks.video.set_at(2.0, fx.videoq.serial(), 0.0);
        sync.expire_subtitles(&subq);
        assert_eq!(subq.remaining(), 1);
        assert!(sync.active_subtitle(&subq).is_none());
    }
}
