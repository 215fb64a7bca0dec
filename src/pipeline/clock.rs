//! Drift-corrected playback clocks for audio-video synchronization
//!
//! A [`Clock`] reconstructs "where playback is now" from the last pts it
//! was set to and the wall time of that update:
//!
//! ```text
//! now = pts_drift + t - (t - last_updated) * (1 - speed)
//! ```
//!
//! which reduces to `pts` while paused. A clock bound to a packet queue
//! reports NaN once the queue's serial moves past the clock's serial, so a
//! clock is never trusted across a flush boundary.
//!
//! # Thread Safety
//!
//! Readers are lock-free: the fields live in atomics guarded by a sequence
//! counter and a snapshot is retried if a write overlapped it. Writers are
//! serialized by a small mutex that readers never touch.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering, fence};
use std::sync::{Mutex, OnceLock, PoisonError};
use std::time::Instant;

use crate::error::ClockError;
use crate::pipeline::packet_queue::PacketQueue;

static ORIGIN: OnceLock<Instant> = OnceLock::new();

/// Monotonic wall time in seconds since the first call in this process.
pub fn relative_time() -> f64 {
    ORIGIN.get_or_init(Instant::now).elapsed().as_secs_f64()
}

/// Consistent copy of a clock's fields.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockState {
    pub pts: f64,
    pub pts_drift: f64,
    pub last_updated: f64,
    pub speed: f64,
    pub serial: u64,
    pub paused: bool,
}

impl ClockState {
    fn value_at(&self, time: f64) -> f64 {
        if self.paused {
            self.pts
        } else {
            self.pts_drift + time - (time - self.last_updated) * (1.0 - self.speed)
        }
    }
}

/// Playback clock
pub struct Clock<'q> {
    /// Queue whose serial decides validity; `None` tracks the clock's own serial.
    queue: Option<&'q PacketQueue>,
    seq: AtomicU64,
    pts: AtomicU64,
    pts_drift: AtomicU64,
    last_updated: AtomicU64,
    speed: AtomicU64,
    serial: AtomicU64,
    paused: AtomicBool,
    writer: Mutex<()>,
}

impl<'q> Clock<'q> {
    /// Clock tracking the pts stream of `queue`.
    pub fn new(queue: &'q PacketQueue) -> Self {
        Self::with_queue(Some(queue))
    }

    /// Free-running reference clock. It is never invalidated by a flush.
    pub fn external() -> Self {
        Self::with_queue(None)
    }

    fn with_queue(queue: Option<&'q PacketQueue>) -> Self {
        let clock = Self {
            queue,
            seq: AtomicU64::new(0),
            pts: AtomicU64::new(f64::NAN.to_bits()),
            pts_drift: AtomicU64::new(f64::NAN.to_bits()),
            last_updated: AtomicU64::new(0f64.to_bits()),
            speed: AtomicU64::new(1f64.to_bits()),
            serial: AtomicU64::new(0),
            paused: AtomicBool::new(false),
            writer: Mutex::new(()),
        };
        clock.set(f64::NAN, 0);
        clock
    }

    /// Read a consistent snapshot of every field.
    pub fn snapshot(&self) -> ClockState {
        loop {
            let before = self.seq.load(Ordering::Acquire);
            if before & 1 == 1 {
                std::hint::spin_loop();
                continue;
            }
            let state = ClockState {
                pts: f64::from_bits(self.pts.load(Ordering::Relaxed)),
                pts_drift: f64::from_bits(self.pts_drift.load(Ordering::Relaxed)),
                last_updated: f64::from_bits(self.last_updated.load(Ordering::Relaxed)),
                speed: f64::from_bits(self.speed.load(Ordering::Relaxed)),
                serial: self.serial.load(Ordering::Relaxed),
                paused: self.paused.load(Ordering::Relaxed),
            };
            fence(Ordering::Acquire);
            if self.seq.load(Ordering::Relaxed) == before {
                return state;
            }
        }
    }

    /// Apply `update` to the current state as one atomic write.
    fn write(&self, update: impl FnOnce(&mut ClockState)) {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut state = self.snapshot();
        update(&mut state);

        let seq = self.seq.load(Ordering::Relaxed);
        self.seq.store(seq.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);
        self.pts.store(state.pts.to_bits(), Ordering::Relaxed);
        self.pts_drift.store(state.pts_drift.to_bits(), Ordering::Relaxed);
        self.last_updated.store(state.last_updated.to_bits(), Ordering::Relaxed);
        self.speed.store(state.speed.to_bits(), Ordering::Relaxed);
        self.serial.store(state.serial, Ordering::Relaxed);
        self.paused.store(state.paused, Ordering::Relaxed);
        self.seq.store(seq.wrapping_add(2), Ordering::Release);
    }

    fn queue_serial(&self, state: &ClockState) -> u64 {
        self.queue.map_or(state.serial, PacketQueue::serial)
    }

    /// Estimated pts at wall time `time`, NaN when invalid.
    pub fn now_at(&self, time: f64) -> f64 {
        let state = self.snapshot();
        if self.queue_serial(&state) != state.serial {
            return f64::NAN;
        }
        state.value_at(time)
    }

    /// Estimated pts right now, NaN when invalid.
    pub fn now(&self) -> f64 {
        self.now_at(relative_time())
    }

    /// Like [`now`](Self::now) but reports a flush boundary as an error.
    pub fn try_now(&self) -> Result<f64, ClockError> {
        let state = self.snapshot();
        let queue_serial = self.queue_serial(&state);
        if queue_serial != state.serial {
            return Err(ClockError::Invalid {
                clock_serial: state.serial,
                queue_serial,
            });
        }
        Ok(state.value_at(relative_time()))
    }

    /// Rebind the clock to `pts`/`serial` as of wall time `time`.
    pub fn set_at(&self, pts: f64, serial: u64, time: f64) {
        self.write(|state| {
            state.pts = pts;
            state.last_updated = time;
            state.pts_drift = pts - time;
            state.serial = serial;
        });
    }

    pub fn set(&self, pts: f64, serial: u64) {
        self.set_at(pts, serial, relative_time());
    }

    /// Re-anchor at the current value, then change the playback rate.
    pub fn set_speed_at(&self, speed: f64, time: f64) {
        self.write(|state| {
            let pts = state.value_at(time);
            state.pts = pts;
            state.last_updated = time;
            state.pts_drift = pts - time;
            state.speed = speed;
        });
    }

    pub fn set_speed(&self, speed: f64) {
        self.set_speed_at(speed, relative_time());
    }

    /// Freeze at the value reached by `time`.
    pub fn pause_at(&self, time: f64) {
        self.write(|state| {
            if state.paused {
                return;
            }
            let pts = state.value_at(time);
            state.pts = pts;
            state.last_updated = time;
            state.pts_drift = pts - time;
            state.paused = true;
        });
    }

    pub fn pause(&self) {
        self.pause_at(relative_time());
    }

    /// Continue from the frozen value, anchored at `time`.
    pub fn resume_at(&self, time: f64) {
        self.write(|state| {
            if !state.paused {
                return;
            }
            state.last_updated = time;
            state.pts_drift = state.pts - time;
            state.paused = false;
        });
    }

    pub fn resume(&self) {
        self.resume_at(relative_time());
    }

    pub fn is_paused(&self) -> bool {
        self.snapshot().paused
    }

    pub fn serial(&self) -> u64 {
        self.snapshot().serial
    }

    pub fn speed(&self) -> f64 {
        self.snapshot().speed
    }

    /// Last pts this clock was set to.
    pub fn pts(&self) -> f64 {
        self.snapshot().pts
    }

    pub fn last_updated(&self) -> f64 {
        self.snapshot().last_updated
    }

    /// Snap to `slave` when this clock is invalid or drifted beyond `nosync_threshold`.
    pub fn sync_to_slave(&self, slave: &Clock<'_>, nosync_threshold: f64) {
        self.sync_to_slave_at(slave, nosync_threshold, relative_time());
    }

    pub fn sync_to_slave_at(&self, slave: &Clock<'_>, nosync_threshold: f64, time: f64) {
        let clock = self.now_at(time);
        let slave_clock = slave.now_at(time);
        if !slave_clock.is_nan()
            && (clock.is_nan() || (clock - slave_clock).abs() > nosync_threshold)
        {
            self.set_at(slave_clock, slave.serial(), time);
        }
    }
}

impl std::fmt::Debug for Clock<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.snapshot();
        f.debug_struct("Clock")
            .field("pts", &state.pts)
            .field("speed", &state.speed)
            .field("serial", &state.serial)
            .field("paused", &state.paused)
            .field("external", &self.queue.is_none())
            .finish()
    }
}
