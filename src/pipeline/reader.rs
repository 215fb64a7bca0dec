//! Read loop: demuxer to packet queues
//!
//! Pulls packets from a [`Demuxer`] and routes them into the per-stream
//! packet queues. The loop throttles itself once enough is buffered,
//! executes seek requests by flushing every queue, and handles end of
//! input by pushing null packets and then looping, exiting or idling.

use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::config::PlayerConfig;
use crate::error::PlayerError;
use crate::pipeline::clock::Clock;
use crate::pipeline::decode_loop::DecoderStatus;
use crate::pipeline::frame_queue::FrameQueue;
use crate::pipeline::packet_queue::PacketQueue;
use crate::pipeline::types::{MediaKind, Packet};

/// How long the reader sleeps when it has nothing useful to do.
const IDLE_WAIT: Duration = Duration::from_millis(10);

/// Where a seek should land.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SeekTarget {
    /// Stream time in seconds.
    Time(f64),
    /// Byte offset in the input.
    Bytes(u64),
}

/// Output of one demuxer read.
#[derive(Debug, Clone)]
pub enum DemuxEvent {
    Packet(MediaKind, Packet),
    Eof,
}

/// Container reader collaborator
pub trait Demuxer: Send {
    /// Whether the input carries a stream of `kind`.
    fn has_stream(&self, kind: MediaKind) -> bool;

    fn read_packet(&mut self) -> Result<DemuxEvent, PlayerError>;

    fn seek(&mut self, target: SeekTarget) -> Result<(), PlayerError>;

    /// Stream time playback starts (and loops) from.
    fn start_time(&self) -> f64 {
        0.0
    }

    /// Live sources are never throttled and get external clock speed control.
    fn is_realtime(&self) -> bool {
        false
    }

    /// Forward pause state to network inputs that support it.
    fn set_paused(&mut self, _paused: bool) {}
}

impl<T: Demuxer + ?Sized> Demuxer for Box<T> {
    fn has_stream(&self, kind: MediaKind) -> bool {
        (**self).has_stream(kind)
    }

    fn read_packet(&mut self) -> Result<DemuxEvent, PlayerError> {
        (**self).read_packet()
    }

    fn seek(&mut self, target: SeekTarget) -> Result<(), PlayerError> {
        (**self).seek(target)
    }

    fn start_time(&self) -> f64 {
        (**self).start_time()
    }

    fn is_realtime(&self) -> bool {
        (**self).is_realtime()
    }

    fn set_paused(&mut self, paused: bool) {
        (**self).set_paused(paused)
    }
}

/// Shared control block between the player, the decoders and the reader.
///
/// Decoders call [`notify`](Self::notify) when their packet queue runs dry
/// so a throttled reader resumes without waiting out its full sleep.
#[derive(Debug, Default)]
pub struct ReadControl {
    woken: Mutex<bool>,
    cond: Condvar,
    abort: AtomicBool,
    paused: AtomicBool,
    eof_exit: AtomicBool,
    seek: Mutex<Option<SeekTarget>>,
}

impl ReadControl {
    pub fn new() -> Self {
        Self::default()
    }

    fn wake_flag(&self) -> MutexGuard<'_, bool> {
        self.woken.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn notify(&self) {
        *self.wake_flag() = true;
        self.cond.notify_all();
    }

    /// Sleep up to `timeout` or until notified. Returns true when notified.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut woken = self.wake_flag();
        if !*woken {
            woken = self
                .cond
                .wait_timeout(woken, timeout)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        std::mem::replace(&mut *woken, false)
    }

    pub fn request_abort(&self) {
        self.abort.store(true, Ordering::Release);
        self.notify();
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Queue a seek; a newer request replaces one not yet executed.
    pub fn request_seek(&self, target: SeekTarget) {
        *self.seek.lock().unwrap_or_else(PoisonError::into_inner) = Some(target);
        self.notify();
    }

    fn take_seek(&self) -> Option<SeekTarget> {
        self.seek.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Set once the reader stopped at end of input with autoexit.
    pub fn reached_eof_exit(&self) -> bool {
        self.eof_exit.load(Ordering::Acquire)
    }
}

/// Queues and status of one open stream, as seen by the reader.
#[derive(Clone, Copy)]
pub struct StreamHandle<'a, 'q> {
    pub packets: &'q PacketQueue,
    pub frames: &'a FrameQueue<'q>,
    pub status: &'a DecoderStatus,
}

impl StreamHandle<'_, '_> {
    /// Decoder drained the current serial and every frame was consumed.
    fn is_played_out(&self) -> bool {
        self.status.is_finished_at(self.packets.serial()) && self.frames.is_drained()
    }
}

/// Why the read loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    Aborted,
    /// End of input reached with autoexit set.
    EndOfInput,
}

pub struct ReadLoop<'a, 'q, D> {
    demuxer: D,
    video: Option<StreamHandle<'a, 'q>>,
    audio: Option<StreamHandle<'a, 'q>>,
    subtitle: Option<StreamHandle<'a, 'q>>,
    external: &'a Clock<'q>,
    control: &'a ReadControl,
    max_buffer_bytes: usize,
    min_packets: usize,
    min_buffered_duration: f64,
    unlimited: bool,
    loops_left: u32,
    autoexit: bool,
}

impl<'a, 'q, D: Demuxer> ReadLoop<'a, 'q, D> {
    pub fn new(
        demuxer: D,
        config: &PlayerConfig,
        external: &'a Clock<'q>,
        control: &'a ReadControl,
    ) -> Self {
        let realtime = config.realtime || demuxer.is_realtime();
        Self {
            demuxer,
            video: None,
            audio: None,
            subtitle: None,
            external,
            control,
            max_buffer_bytes: config.queues.max_buffer_bytes,
            min_packets: config.queues.min_packets,
            min_buffered_duration: config.queues.min_buffered_duration,
            unlimited: config.queues.infinite_buffer.unwrap_or(realtime),
            loops_left: config.loop_count,
            autoexit: config.autoexit,
        }
    }

    /// Attach the queues of an open stream.
    pub fn with_stream(mut self, kind: MediaKind, handle: StreamHandle<'a, 'q>) -> Self {
        match kind {
            MediaKind::Video => self.video = Some(handle),
            MediaKind::Audio => self.audio = Some(handle),
            MediaKind::Subtitle => self.subtitle = Some(handle),
        }
        self
    }

    fn streams(&self) -> impl Iterator<Item = &StreamHandle<'a, 'q>> {
        [&self.video, &self.audio, &self.subtitle]
            .into_iter()
            .filter_map(Option::as_ref)
    }

    fn queue_for(&self, kind: MediaKind) -> Option<&'q PacketQueue> {
        match kind {
            MediaKind::Video => self.video.map(|s| s.packets),
            MediaKind::Audio => self.audio.map(|s| s.packets),
            MediaKind::Subtitle => self.subtitle.map(|s| s.packets),
        }
    }

    fn buffer_full(&self) -> bool {
        if self.unlimited {
            return false;
        }
        let total: usize = self.streams().map(|s| s.packets.size()).sum();
        total > self.max_buffer_bytes
            || self
                .streams()
                .all(|s| s.packets.has_enough_packets(self.min_packets, self.min_buffered_duration))
    }

    fn played_out(&self) -> bool {
        self.audio.is_none_or(|s| s.is_played_out()) && self.video.is_none_or(|s| s.is_played_out())
    }

    fn execute_seek(&mut self, target: SeekTarget) {
        if let Err(e) = self.demuxer.seek(target) {
            warn!("ReadLoop: seek to {target:?} failed: {e}");
            return;
        }
        for stream in self.streams() {
            stream.packets.flush();
        }
        let pts = match target {
            SeekTarget::Time(pts) => pts,
            SeekTarget::Bytes(_) => f64::NAN,
        };
        self.external.set(pts, 0);
        debug!("ReadLoop: seek to {target:?} done");
    }

    /// Run until aborted or, with autoexit, until the input is played out.
    pub fn run(mut self) -> Result<ReadOutcome, PlayerError> {
        info!("ReadLoop: started (unlimited buffering: {})", self.unlimited);
        let mut eof = false;
        let mut last_paused = false;
        let mut packets_read = 0u64;

        let outcome = loop {
            if self.control.is_aborted() {
                break ReadOutcome::Aborted;
            }

            let paused = self.control.is_paused();
            if paused != last_paused {
                last_paused = paused;
                self.demuxer.set_paused(paused);
            }

            if let Some(target) = self.control.take_seek() {
                self.execute_seek(target);
                eof = false;
            }

            if self.buffer_full() {
                self.control.wait_timeout(IDLE_WAIT);
                continue;
            }

            if !paused && eof && self.played_out() {
                // loops_left: 0 loops forever, 1 is the last pass
                let again = match self.loops_left {
                    0 => true,
                    1 => false,
                    _ => {
                        self.loops_left -= 1;
                        true
                    }
                };
                if again {
                    info!("ReadLoop: end of input, looping");
                    let start = self.demuxer.start_time();
                    self.execute_seek(SeekTarget::Time(start));
                    eof = false;
                    continue;
                } else if self.autoexit {
                    info!("ReadLoop: end of input, exiting");
                    self.control.eof_exit.store(true, Ordering::Release);
                    break ReadOutcome::EndOfInput;
                }
            }

            match self.demuxer.read_packet()? {
                DemuxEvent::Packet(kind, packet) => {
                    eof = false;
                    packets_read += 1;
                    if let Some(queue) = self.queue_for(kind) {
                        // an aborted queue belongs to a closed stream
                        let _ = queue.push(packet);
                    }
                }
                DemuxEvent::Eof => {
                    if !eof {
                        debug!("ReadLoop: demuxer reached end of input");
                        for stream in self.streams() {
                            let _ = stream.packets.push_null();
                        }
                        eof = true;
                    }
                    self.control.wait_timeout(IDLE_WAIT);
                }
            }
        };

        info!("ReadLoop: finished ({packets_read} packets read, {outcome:?})");
        Ok(outcome)
    }
}
