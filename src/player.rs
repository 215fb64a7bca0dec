//! Player: wires queues, clocks and threads for one input
//!
//! [`Player::run`] opens every stream the [`Session`] can both demux and
//! decode, spawns the reader, one decode loop per stream and the audio
//! device thread inside a `std::thread::scope`, and drives video
//! presentation on the calling thread until told to quit.
//!
//! All queues and clocks live on the caller's stack for the duration of
//! the scope, so worker threads borrow them instead of sharing ownership.
//!
//! Shutdown order: reader abort flag and packet queues, then frame queue
//! wakeups, then decoder joins, the audio device, and finally the reader.

use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, TryRecvError};
use std::thread::{self, ScopedJoinHandle};
use std::time::{Duration, Instant};

use crate::config::PlayerConfig;
use crate::error::{DecodeError, PlayerError};
use crate::pipeline::audio_renderer::AudioRenderer;
use crate::pipeline::clock::relative_time;
use crate::pipeline::decode_loop::{DecodeLoop, DecoderStatus, MediaDecoder};
use crate::pipeline::frame_queue::FrameQueue;
use crate::pipeline::health::{PlaybackStats, StatsSummary};
use crate::pipeline::output::{AudioSink, VideoPresenter};
use crate::pipeline::packet_queue::PacketQueue;
use crate::pipeline::reader::{Demuxer, ReadControl, ReadLoop, ReadOutcome, SeekTarget, StreamHandle};
use crate::pipeline::state::PlayerState;
use crate::pipeline::sync::{
    Clocks, EarlyDrop, FrameAction, MasterClock, SyncController, adjust_external_clock_speed,
    resolve_master,
};
use crate::pipeline::types::MediaKind;

/// How often the presentation loop logs playback statistics.
const STATS_INTERVAL: Duration = Duration::from_secs(5);

/// User control requests, delivered to the presentation thread.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PlayerCommand {
    TogglePause,
    Seek(SeekTarget),
    /// Seek relative to the master clock, in seconds.
    SeekRelative(f64),
    /// Seek relative to the byte position of the last shown frame.
    SeekRelativeBytes(i64),
    /// Show one frame, then pause.
    StepFrame,
    Quit,
}

/// External collaborators for one input.
pub struct Session {
    pub demuxer: Box<dyn Demuxer>,
    pub video_decoder: Option<Box<dyn MediaDecoder>>,
    pub audio_decoder: Option<Box<dyn MediaDecoder>>,
    pub subtitle_decoder: Option<Box<dyn MediaDecoder>>,
    pub presenter: Option<Box<dyn VideoPresenter>>,
    pub audio_sink: Option<Box<dyn AudioSink>>,
}

/// Aborts every queue when dropped, so an early return inside the thread
/// scope never leaves a worker blocked forever.
struct ShutdownGuard<'a, 'q> {
    control: &'a ReadControl,
    packet_queues: [&'q PacketQueue; 3],
    frame_queues: [&'a FrameQueue<'q>; 3],
    audio_running: &'a AtomicBool,
}

impl ShutdownGuard<'_, '_> {
    fn engage(&self) {
        self.control.request_abort();
        for queue in self.packet_queues {
            queue.abort();
        }
        for queue in self.frame_queues {
            queue.signal();
        }
        self.audio_running.store(false, Ordering::Release);
    }
}

impl Drop for ShutdownGuard<'_, '_> {
    fn drop(&mut self) {
        self.engage();
    }
}

pub struct Player {
    config: PlayerConfig,
    state: PlayerState,
}

impl Player {
    pub fn new(config: PlayerConfig) -> Result<Self, PlayerError> {
        config.validate()?;
        Ok(Self {
            config,
            state: PlayerState::Idle,
        })
    }

    pub fn state(&self) -> PlayerState {
        self.state
    }

    pub fn config(&self) -> &PlayerConfig {
        &self.config
    }

    fn transition(&mut self, target: PlayerState) {
        if self.state.can_transition_to(&target) {
            debug!("Player: {} -> {}", self.state, target);
            self.state = target;
        } else {
            warn!("Player: ignoring transition {} -> {}", self.state, target);
        }
    }

    /// Play `session` until a `Quit` command, a closed command channel, or
    /// end of input with autoexit. Returns the final statistics.
    pub fn run(&mut self, session: Session, commands: Receiver<PlayerCommand>) -> Result<StatsSummary, PlayerError> {
        if self.state != PlayerState::Idle {
            return Err(PlayerError::Stopped);
        }
        self.transition(PlayerState::Opening);
        let result = self.run_session(session, commands);
        self.transition(PlayerState::Stopping);
        self.transition(PlayerState::Stopped);
        result
    }

    fn run_session(&mut self, session: Session, commands: Receiver<PlayerCommand>) -> Result<StatsSummary, PlayerError> {
        let config = self.config.clone();
        let Session {
            demuxer,
            video_decoder,
            audio_decoder,
            subtitle_decoder,
            presenter,
            audio_sink,
        } = session;

        let video_decoder = video_decoder.filter(|_| presenter.is_some() && demuxer.has_stream(MediaKind::Video));
        let audio_decoder = audio_decoder.filter(|_| audio_sink.is_some() && demuxer.has_stream(MediaKind::Audio));
        let subtitle_decoder =
            subtitle_decoder.filter(|_| video_decoder.is_some() && demuxer.has_stream(MediaKind::Subtitle));
        let has_video = video_decoder.is_some();
        let has_audio = audio_decoder.is_some();
        let has_subtitles = subtitle_decoder.is_some();
        if !has_video && !has_audio {
            return Err(PlayerError::NoStreams);
        }
        let realtime = config.realtime || demuxer.is_realtime();
        let start_time = demuxer.start_time();

        let videoq = PacketQueue::new(MediaKind::Video);
        let audioq = PacketQueue::new(MediaKind::Audio);
        let subtitleq = PacketQueue::new(MediaKind::Subtitle);
        let pictq = FrameQueue::new(&videoq, config.queues.video_frames, true)?;
        let sampq = FrameQueue::new(&audioq, config.queues.audio_frames, true)?;
        let subpq = FrameQueue::new(&subtitleq, config.queues.subtitle_frames, false)?;
        let clocks = Clocks::new(&audioq, &videoq);
        let stats = PlaybackStats::new();
        let control = ReadControl::new();
        let video_status = DecoderStatus::new();
        let audio_status = DecoderStatus::new();
        let subtitle_status = DecoderStatus::new();
        let audio_running = AtomicBool::new(true);

        let master = MasterClock::new(resolve_master(config.sync_mode, has_audio, has_video), &clocks);
        info!(
            "Player: opening (video: {has_video}, audio: {has_audio}, subtitles: {has_subtitles}, master: {})",
            master.kind()
        );

        thread::scope(|s| -> Result<StatsSummary, PlayerError> {
            let guard = ShutdownGuard {
                control: &control,
                packet_queues: [&videoq, &audioq, &subtitleq],
                frame_queues: [&pictq, &sampq, &subpq],
                audio_running: &audio_running,
            };

            let mut decoders: Vec<ScopedJoinHandle<'_, Result<(), DecodeError>>> = Vec::new();
            let mut reader = ReadLoop::new(demuxer, &config, &clocks.external, &control);

            if let Some(decoder) = video_decoder {
                videoq.start();
                let worker = DecodeLoop::new(decoder, &pictq, &stats, &video_status, &control)
                    .with_early_drop(EarlyDrop::new(&config, master));
                decoders.push(
                    thread::Builder::new()
                        .name("video-decode".into())
                        .spawn_scoped(s, move || worker.run())?,
                );
                reader = reader.with_stream(
                    MediaKind::Video,
                    StreamHandle {
                        packets: &videoq,
                        frames: &pictq,
                        status: &video_status,
                    },
                );
            }
            if let Some(decoder) = audio_decoder {
                audioq.start();
                let worker = DecodeLoop::new(decoder, &sampq, &stats, &audio_status, &control)
                    .with_start_pts(start_time);
                decoders.push(
                    thread::Builder::new()
                        .name("audio-decode".into())
                        .spawn_scoped(s, move || worker.run())?,
                );
                reader = reader.with_stream(
                    MediaKind::Audio,
                    StreamHandle {
                        packets: &audioq,
                        frames: &sampq,
                        status: &audio_status,
                    },
                );
            }
            if let Some(decoder) = subtitle_decoder {
                subtitleq.start();
                let worker = DecodeLoop::new(decoder, &subpq, &stats, &subtitle_status, &control);
                decoders.push(
                    thread::Builder::new()
                        .name("subtitle-decode".into())
                        .spawn_scoped(s, move || worker.run())?,
                );
                reader = reader.with_stream(
                    MediaKind::Subtitle,
                    StreamHandle {
                        packets: &subtitleq,
                        frames: &subpq,
                        status: &subtitle_status,
                    },
                );
            }

            let audio = match audio_sink.filter(|_| has_audio) {
                Some(mut sink) => {
                    let spec = sink.spec();
                    let mut renderer = AudioRenderer::new(&config, spec, &sampq, master, &stats);
                    let running = &audio_running;
                    Some(thread::Builder::new().name("audio-device".into()).spawn_scoped(s, move || {
                        let mut buf = vec![0.0f32; spec.period_samples()];
                        let period = Duration::from_secs_f64(spec.period_duration());
                        let mut next = Instant::now();
                        while running.load(Ordering::Acquire) {
                            renderer.fill(&mut buf, relative_time());
                            sink.play(&buf);
                            next += period;
                            match next.checked_duration_since(Instant::now()) {
                                Some(wait) => thread::sleep(wait),
                                None => next = Instant::now(),
                            }
                        }
                    })?)
                }
                None => None,
            };

            let reader = thread::Builder::new()
                .name("read".into())
                .spawn_scoped(s, move || reader.run())?;

            let mut sync = SyncController::new(&config, &clocks, &stats, has_audio, has_video);
            let outcome = self.present(
                &config,
                &mut sync,
                presenter,
                &commands,
                &control,
                PresentQueues {
                    pictq: has_video.then_some(&pictq),
                    sampq: has_audio.then_some(&sampq),
                    subpq: has_subtitles.then_some(&subpq),
                    videoq: has_video.then_some(&videoq),
                    audioq: has_audio.then_some(&audioq),
                },
                realtime,
                &reader,
            );

            info!("Player: shutting down");
            guard.engage();
            for handle in decoders {
                match handle.join() {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("Player: a decoder stopped with {e}"),
                    Err(_) => error!("Player: a decoder thread panicked"),
                }
            }
            if let Some(handle) = audio {
                if handle.join().is_err() {
                    error!("Player: audio thread panicked");
                }
            }
            let read_result = match reader.join() {
                Ok(result) => result,
                Err(_) => Err(PlayerError::Demux("read thread panicked".into())),
            };
            drop(guard);

            outcome?;
            read_result?;
            let summary = stats.summary();
            info!("{summary}");
            Ok(summary)
        })
    }

    /// Presentation loop. Returns when playback should stop.
    #[allow(clippy::too_many_arguments)]
    fn present(
        &mut self,
        config: &PlayerConfig,
        sync: &mut SyncController<'_, '_>,
        mut presenter: Option<Box<dyn VideoPresenter>>,
        commands: &Receiver<PlayerCommand>,
        control: &ReadControl,
        queues: PresentQueues<'_, '_>,
        realtime: bool,
        reader: &ScopedJoinHandle<'_, Result<ReadOutcome, PlayerError>>,
    ) -> Result<(), PlayerError> {
        let now = relative_time();
        if config.start_paused {
            sync.set_paused_at(true, now);
            sync.step_frame_at(now);
            self.transition(PlayerState::Paused {
                paused_at: Instant::now(),
            });
        } else {
            self.transition(PlayerState::Playing {
                started_at: Instant::now(),
            });
        }

        let mut remaining_time = 0.0;
        let mut seeks = SeekState::default();
        let mut reported_eos = false;
        let mut last_stats = Instant::now();

        loop {
            match commands.try_recv() {
                Ok(PlayerCommand::Quit) | Err(TryRecvError::Disconnected) => {
                    info!("Player: quit requested");
                    return Ok(());
                }
                Ok(command) => {
                    self.handle_command(command, sync, control, queues, &mut seeks);
                    reported_eos = false;
                }
                Err(TryRecvError::Empty) => {}
            }

            // a paused seek shows one frame, but only once the reader flushed
            if let Some(serial) = seeks.step_after_flush {
                let flushed = queues.videoq.is_none_or(|q| q.serial() != serial);
                if flushed {
                    seeks.step_after_flush = None;
                    if sync.is_paused() {
                        sync.step_frame_at(relative_time());
                    }
                }
            }

            if reader.is_finished() {
                info!("Player: reader stopped");
                return Ok(());
            }

            if remaining_time > 0.0 {
                thread::sleep(Duration::from_secs_f64(remaining_time));
            }
            remaining_time = config.timing.refresh_rate;

            let time = relative_time();
            if realtime {
                adjust_external_clock_speed(
                    &sync.master().clocks().external,
                    queues.videoq,
                    queues.audioq,
                    &config.external_clock,
                    time,
                );
            }

            if let Some(pictq) = queues.pictq {
                let deadline = sync.next_frame_deadline(pictq, time);
                remaining_time = deadline.remaining;
                match deadline.action {
                    FrameAction::Present(frame) => {
                        let subtitle = queues.subpq.and_then(|subpq| {
                            sync.expire_subtitles(subpq);
                            sync.active_subtitle(subpq)
                        });
                        if let Some(presenter) = presenter.as_mut() {
                            presenter.present(&frame, subtitle.as_ref());
                        }
                        sync.stats().record_presented();
                        reported_eos = false;
                    }
                    FrameAction::EndOfStream if !reported_eos => {
                        info!("Player: video reached end of stream");
                        reported_eos = true;
                    }
                    _ => {}
                }
            }

            // pausing from step mode happens inside the controller
            control.set_paused(sync.is_paused());
            self.sync_state(sync.is_paused());

            if last_stats.elapsed() >= STATS_INTERVAL {
                info!("{}", sync.stats().summary());
                last_stats = Instant::now();
            }
        }
    }

    fn handle_command(
        &mut self,
        command: PlayerCommand,
        sync: &mut SyncController<'_, '_>,
        control: &ReadControl,
        queues: PresentQueues<'_, '_>,
        seeks: &mut SeekState,
    ) {
        let time = relative_time();
        let target = match command {
            PlayerCommand::TogglePause => {
                sync.toggle_pause_at(time);
                info!("Player: {}", if sync.is_paused() { "paused" } else { "resumed" });
                return;
            }
            PlayerCommand::StepFrame => {
                sync.step_frame_at(time);
                return;
            }
            PlayerCommand::Quit => return,
            PlayerCommand::Seek(target) => target,
            PlayerCommand::SeekRelative(increment) => {
                SeekTarget::Time(relative_time_target(sync.master_now_at(time), seeks.last_time, increment))
            }
            PlayerCommand::SeekRelativeBytes(increment) => {
                let position = queues
                    .pictq
                    .and_then(|q| q.last_position())
                    .or_else(|| queues.sampq.and_then(|q| q.last_position()));
                SeekTarget::Bytes(relative_byte_target(position, seeks.last_bytes, increment))
            }
        };
        match target {
            SeekTarget::Time(pts) => seeks.last_time = pts,
            SeekTarget::Bytes(pos) => seeks.last_bytes = pos,
        }
        self.seek(target, sync, control, queues, seeks);
    }

    fn seek(
        &self,
        target: SeekTarget,
        sync: &SyncController<'_, '_>,
        control: &ReadControl,
        queues: PresentQueues<'_, '_>,
        seeks: &mut SeekState,
    ) {
        debug!("Player: seek to {target:?}");
        if sync.is_paused() {
            if let Some(videoq) = queues.videoq {
                seeks.step_after_flush = Some(videoq.serial());
            }
        }
        control.request_seek(target);
    }

    fn sync_state(&mut self, paused: bool) {
        match (self.state.is_paused(), paused) {
            (false, true) => self.transition(PlayerState::Paused {
                paused_at: Instant::now(),
            }),
            (true, false) => self.transition(PlayerState::Playing {
                started_at: Instant::now(),
            }),
            _ => {}
        }
    }
}

/// Where the last seek went, for relative seeks made before any clock is valid.
#[derive(Debug, Default)]
struct SeekState {
    last_time: f64,
    last_bytes: u64,
    /// Video serial at the time of a seek issued while paused.
    step_after_flush: Option<u64>,
}

/// Stream time a relative seek lands on; falls back to the last target
/// while the master clock is invalid.
fn relative_time_target(master_now: f64, last_seek: f64, increment: f64) -> f64 {
    let pos = if master_now.is_nan() { last_seek } else { master_now };
    (pos + increment).max(0.0)
}

fn relative_byte_target(position: Option<u64>, last_seek: u64, increment: i64) -> u64 {
    position.unwrap_or(last_seek).saturating_add_signed(increment)
}

/// Queues the presentation loop reads, `None` for streams not open.
#[derive(Clone, Copy)]
struct PresentQueues<'a, 'q> {
    pictq: Option<&'a FrameQueue<'q>>,
    sampq: Option<&'a FrameQueue<'q>>,
    subpq: Option<&'a FrameQueue<'q>>,
    videoq: Option<&'q PacketQueue>,
    audioq: Option<&'q PacketQueue>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_time_target() {
        assert_eq!(relative_time_target(5.0, 0.0, 10.0), 15.0);
        assert_eq!(relative_time_target(5.0, 0.0, -10.0), 0.0);
        // master not valid yet: based on the last seek target
        assert_eq!(relative_time_target(f64::NAN, 30.0, 10.0), 40.0);
        assert_eq!(relative_time_target(f64::NAN, 30.0, -10.0), 20.0);
    }

    #[test]
    fn test_relative_byte_target() {
        assert_eq!(relative_byte_target(Some(1_000), 0, 500), 1_500);
        assert_eq!(relative_byte_target(Some(1_000), 0, -5_000), 0);
        assert_eq!(relative_byte_target(None, 8_000, 2_000), 10_000);
    }
}
