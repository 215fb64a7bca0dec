//! Fixed-capacity ring of decoded frames
//!
//! One decode loop writes, one presentation path reads. The ring is sized
//! at stream open and never resized. Waiters on either side are released
//! by the linked packet queue's abort flag.
//!
//! # Keep-last
//!
//! In keep-last mode the most recently shown frame stays in its slot after
//! [`FrameQueue::next`] so static content can be redisplayed. The
//! retained slot does not count towards [`FrameQueue::remaining`].

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::error::{PlayerError, QueueError};
use crate::pipeline::packet_queue::PacketQueue;
use crate::pipeline::types::Frame;

struct Ring {
    slots: Vec<Option<Frame>>,
    rindex: usize,
    windex: usize,
    size: usize,
    /// 1 once the frame at `rindex` has been shown and is being retained.
    rindex_shown: usize,
}

impl Ring {
    fn remaining(&self) -> usize {
        self.size - self.rindex_shown
    }

    fn slot(&self, offset: usize) -> Option<Frame> {
        self.slots[(self.rindex + offset) % self.slots.len()].clone()
    }
}

/// Bounded frame queue observing a borrowed [`PacketQueue`]
///
/// The packet queue must outlive the frame queue; the borrow enforces it.
pub struct FrameQueue<'q> {
    pktq: &'q PacketQueue,
    keep_last: bool,
    capacity: usize,
    ring: Mutex<Ring>,
    cond: Condvar,
}

/// A reserved free slot, obtained from [`FrameQueue::peek_writable`].
///
/// The writer fills it with [`WriteSlot::push`]. Dropping it without
/// pushing leaves the queue unchanged.
#[must_use = "a reserved slot does nothing until pushed"]
pub struct WriteSlot<'a, 'q> {
    queue: &'a FrameQueue<'q>,
}

impl WriteSlot<'_, '_> {
    /// Commit `frame` into the reserved slot and wake the reader.
    pub fn push(self, frame: Frame) {
        let queue = self.queue;
        let mut ring = queue.lock();
        let windex = ring.windex;
        ring.slots[windex] = Some(frame);
        ring.windex = (windex + 1) % queue.capacity;
        ring.size += 1;
        drop(ring);
        queue.cond.notify_one();
    }
}

impl<'q> FrameQueue<'q> {
    /// Allocate a ring of `capacity` slots.
    pub fn new(pktq: &'q PacketQueue, capacity: usize, keep_last: bool) -> Result<Self, PlayerError> {
        if capacity == 0 {
            return Err(PlayerError::Config(format!(
                "{} frame queue capacity must be positive",
                pktq.kind()
            )));
        }
        // the retained frame occupies a slot of its own
        if keep_last && capacity < 2 {
            return Err(PlayerError::Config(format!(
                "keep-last {} frame queue needs at least 2 slots, got {capacity}",
                pktq.kind()
            )));
        }
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(capacity)
            .map_err(|_| PlayerError::OutOfMemory("frame queue"))?;
        slots.resize_with(capacity, || None);

        Ok(Self {
            pktq,
            keep_last,
            capacity,
            ring: Mutex::new(Ring {
                slots,
                rindex: 0,
                windex: 0,
                size: 0,
                rindex_shown: 0,
            }),
            cond: Condvar::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Ring> {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn packet_queue(&self) -> &'q PacketQueue {
        self.pktq
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn keep_last(&self) -> bool {
        self.keep_last
    }

    /// Wake every waiter so it re-checks the abort flag.
    pub fn signal(&self) {
        let _ring = self.lock();
        self.cond.notify_all();
    }

    /// Block until a slot is free, or fail with `Aborted`.
    pub fn peek_writable(&self) -> Result<WriteSlot<'_, 'q>, QueueError> {
        let mut ring = self.lock();
        while ring.size >= self.capacity && !self.pktq.is_aborted() {
            ring = self.cond.wait(ring).unwrap_or_else(PoisonError::into_inner);
        }
        if self.pktq.is_aborted() {
            return Err(QueueError::Aborted);
        }
        Ok(WriteSlot { queue: self })
    }

    /// Block until an unread frame exists and return it without consuming it.
    pub fn peek_readable(&self) -> Result<Frame, QueueError> {
        let mut ring = self.lock();
        while ring.remaining() == 0 && !self.pktq.is_aborted() {
            ring = self.cond.wait(ring).unwrap_or_else(PoisonError::into_inner);
        }
        if self.pktq.is_aborted() {
            return Err(QueueError::Aborted);
        }
        ring.slot(ring.rindex_shown).ok_or(QueueError::Empty)
    }

    /// Current frame: the oldest unread one, or the retained frame once a
    /// keep-last queue has drained.
    pub fn peek(&self) -> Option<Frame> {
        let ring = self.lock();
        if ring.remaining() > 0 {
            ring.slot(ring.rindex_shown)
        } else if ring.rindex_shown == 1 {
            ring.slot(0)
        } else {
            None
        }
    }

    /// The unread frame after the current one.
    pub fn peek_next(&self) -> Result<Frame, QueueError> {
        let ring = self.lock();
        if ring.remaining() < 2 {
            return Err(QueueError::Empty);
        }
        ring.slot(ring.rindex_shown + 1).ok_or(QueueError::Empty)
    }

    /// The frame shown last (or the current one if nothing was shown yet).
    pub fn peek_last(&self) -> Option<Frame> {
        let ring = self.lock();
        if ring.size == 0 {
            return None;
        }
        ring.slot(0)
    }

    /// Release the frame just shown and advance the read index.
    ///
    /// On a keep-last queue that has drained to its retained frame this is
    /// a no-op: the retained frame is never released twice.
    pub fn next(&self) {
        let mut ring = self.lock();
        if ring.size == 0 {
            return;
        }
        if self.keep_last && ring.rindex_shown == 0 {
            ring.rindex_shown = 1;
            return;
        }
        if self.keep_last && ring.remaining() == 0 {
            return;
        }
        let rindex = ring.rindex;
        ring.slots[rindex] = None;
        ring.rindex = (rindex + 1) % self.capacity;
        ring.size -= 1;
        drop(ring);
        self.cond.notify_one();
    }

    /// Number of frames not shown yet.
    pub fn remaining(&self) -> usize {
        self.lock().remaining()
    }

    /// Nothing left to consume but possibly the end-of-stream marker.
    pub fn is_drained(&self) -> bool {
        let ring = self.lock();
        match ring.remaining() {
            0 => true,
            1 => ring
                .slot(ring.rindex_shown)
                .is_some_and(|frame| frame.is_end_of_stream()),
            _ => false,
        }
    }

    /// Byte position of the last shown frame if it belongs to the current serial.
    pub fn last_position(&self) -> Option<u64> {
        let ring = self.lock();
        if ring.rindex_shown == 0 {
            return None;
        }
        ring.slot(0)
            .filter(|frame| frame.serial == self.pktq.serial())
            .and_then(|frame| frame.pos)
    }
}

impl std::fmt::Debug for FrameQueue<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ring = self.lock();
        f.debug_struct("FrameQueue")
            .field("kind", &self.pktq.kind())
            .field("capacity", &self.capacity)
            .field("keep_last", &self.keep_last)
            .field("size", &ring.size)
            .field("remaining", &ring.remaining())
            .finish()
    }
}
