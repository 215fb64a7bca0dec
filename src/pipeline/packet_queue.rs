//! Thread-safe packet FIFO shared by the reader and one decode loop
//!
//! Every entry carries the queue serial in effect when it was pushed.
//! `flush()` discards the backlog and bumps the serial, so a consumer
//! holding a packet from before the flush can tell it is stale with one
//! integer compare.

use log::debug;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::error::QueueError;
use crate::pipeline::types::{MediaKind, Packet, PacketEntry};

/// Bookkeeping bytes charged per queued entry on top of its payload.
pub const ENTRY_OVERHEAD: usize = std::mem::size_of::<PacketEntry>();

struct Inner {
    entries: VecDeque<PacketEntry>,
    size: usize,
    duration: f64,
    serial: u64,
    aborted: bool,
}

/// Bounded-by-policy packet queue
///
/// The queue itself never rejects a push for being full; the reader
/// consults [`len`](Self::len), [`size`](Self::size) and
/// [`duration`](Self::duration) to throttle itself.
///
/// A new queue starts aborted, like a stream that has not been opened yet.
/// Call [`start`](Self::start) before use.
pub struct PacketQueue {
    kind: MediaKind,
    inner: Mutex<Inner>,
    cond: Condvar,
    /// Mirrors of `inner.serial` / `inner.aborted` for lock-free readers
    /// (clocks, frame queues). Written only while `inner` is locked.
    serial: AtomicU64,
    aborted: AtomicBool,
}

impl PacketQueue {
    pub fn new(kind: MediaKind) -> Self {
        Self {
            kind,
            inner: Mutex::new(Inner {
                entries: VecDeque::new(),
                size: 0,
                duration: 0.0,
                serial: 0,
                aborted: true,
            }),
            cond: Condvar::new(),
            serial: AtomicU64::new(0),
            aborted: AtomicBool::new(true),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Append a packet tagged with the current serial and wake one waiter.
    pub fn push(&self, packet: Packet) -> Result<(), QueueError> {
        let mut inner = self.lock();
        if inner.aborted {
            return Err(QueueError::Aborted);
        }
        inner.size += packet.size() + ENTRY_OVERHEAD;
        inner.duration += packet.duration;
        let serial = inner.serial;
        inner.entries.push_back(PacketEntry { packet, serial });
        drop(inner);
        self.cond.notify_one();
        Ok(())
    }

    /// Push the end-of-input marker.
    pub fn push_null(&self) -> Result<(), QueueError> {
        self.push(Packet::null())
    }

    /// Remove the oldest packet.
    ///
    /// With `blocking`, waits until a packet arrives or the queue is aborted.
    pub fn pop(&self, blocking: bool) -> Result<PacketEntry, QueueError> {
        let mut inner = self.lock();
        loop {
            if inner.aborted {
                return Err(QueueError::Aborted);
            }
            if let Some(entry) = inner.entries.pop_front() {
                inner.size -= entry.packet.size() + ENTRY_OVERHEAD;
                inner.duration -= entry.packet.duration;
                if inner.entries.is_empty() {
                    inner.duration = 0.0;
                }
                return Ok(entry);
            }
            if !blocking {
                return Err(QueueError::Empty);
            }
            inner = self.cond.wait(inner).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Drop every queued packet and open a new serial.
    pub fn flush(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.size = 0;
        inner.duration = 0.0;
        inner.serial += 1;
        self.serial.store(inner.serial, Ordering::Release);
        debug!("{} packet queue flushed, serial {}", self.kind, inner.serial);
    }

    /// Set the sticky abort flag and wake every waiter.
    pub fn abort(&self) {
        let mut inner = self.lock();
        inner.aborted = true;
        self.aborted.store(true, Ordering::Release);
        drop(inner);
        self.cond.notify_all();
        debug!("{} packet queue aborted", self.kind);
    }

    /// Clear the abort flag and open a new serial, as when a stream is (re)opened.
    pub fn start(&self) {
        let mut inner = self.lock();
        inner.aborted = false;
        inner.serial += 1;
        self.aborted.store(false, Ordering::Release);
        self.serial.store(inner.serial, Ordering::Release);
        debug!("{} packet queue started, serial {}", self.kind, inner.serial);
    }

    /// Current serial. Lock-free.
    pub fn serial(&self) -> u64 {
        self.serial.load(Ordering::Acquire)
    }

    /// Whether the queue is aborted. Lock-free.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Number of queued packets.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queued payload bytes plus per-entry overhead.
    pub fn size(&self) -> usize {
        self.lock().size
    }

    /// Sum of queued packet durations in seconds.
    pub fn duration(&self) -> f64 {
        self.lock().duration
    }

    /// Whether this stream has buffered enough that the reader may pause.
    pub fn has_enough_packets(&self, min_packets: usize, min_duration: f64) -> bool {
        let inner = self.lock();
        inner.aborted
            || (inner.entries.len() > min_packets
                && (inner.duration == 0.0 || inner.duration > min_duration))
    }
}

impl std::fmt::Debug for PacketQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("PacketQueue")
            .field("kind", &self.kind)
            .field("len", &inner.entries.len())
            .field("size", &inner.size)
            .field("duration", &inner.duration)
            .field("serial", &inner.serial)
            .field("aborted", &inner.aborted)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn packet(tag: u8, duration: f64) -> Packet {
        Packet::new(vec![tag; 10], Some(tag as f64), duration)
    }

    fn started() -> PacketQueue {
        let q = PacketQueue::new(MediaKind::Video);
        q.start();
        q
    }

    #[test]
    fn test_new_queue_is_aborted() {
        let q = PacketQueue::new(MediaKind::Audio);
        assert_eq!(q.push(packet(1, 0.0)), Err(QueueError::Aborted));
        assert_eq!(q.pop(false).unwrap_err(), QueueError::Aborted);
    }

    #[test]
    fn test_fifo_order() {
        let q = started();
        for i in 0..10 {
            q.push(packet(i, 0.02)).unwrap();
        }
        for i in 0..10 {
            let entry = q.pop(false).unwrap();
            assert_eq!(entry.packet.data[0], i);
        }
        assert_eq!(q.pop(false).unwrap_err(), QueueError::Empty);
    }

    #[test]
    fn test_counters() {
        let q = started();
        q.push(packet(1, 0.5)).unwrap();
        q.push(packet(2, 0.25)).unwrap();
        assert_eq!(q.len(), 2);
        assert_eq!(q.size(), 2 * (10 + ENTRY_OVERHEAD));
        assert!((q.duration() - 0.75).abs() < 1e-12);

        q.pop(false).unwrap();
        assert_eq!(q.size(), 10 + ENTRY_OVERHEAD);
        assert!((q.duration() - 0.25).abs() < 1e-12);

        q.pop(false).unwrap();
        assert_eq!(q.size(), 0);
        assert_eq!(q.duration(), 0.0);
    }

    #[test]
    fn test_flush_bumps_serial_and_tags_stale_items() {
        let q = started();
        let before = q.serial();
        q.push(packet(1, 0.0)).unwrap();
        let stale = q.pop(false).unwrap();

        q.push(packet(2, 0.0)).unwrap();
        q.flush();
        assert!(q.serial() > before);
        assert!(q.is_empty());
        assert_eq!(stale.serial, before);
        assert_ne!(stale.serial, q.serial());

        q.push(packet(3, 0.0)).unwrap();
        assert_eq!(q.pop(false).unwrap().serial, q.serial());
    }

    #[test]
    fn test_start_clears_abort_and_bumps_serial() {
        let q = started();
        let serial = q.serial();
        q.abort();
        assert!(q.is_aborted());
        assert_eq!(q.push(packet(1, 0.0)), Err(QueueError::Aborted));
        q.start();
        assert!(!q.is_aborted());
        assert_eq!(q.serial(), serial + 1);
        assert!(q.push(packet(1, 0.0)).is_ok());
    }

    #[test]
    fn test_blocking_pop_wakes_on_push() {
        let q = Arc::new(started());
        let consumer = {
            let q = q.clone();
            thread::spawn(move || q.pop(true).map(|e| e.packet.data[0]))
        };
        thread::sleep(Duration::from_millis(20));
        q.push(packet(7, 0.0)).unwrap();
        assert_eq!(consumer.join().unwrap(), Ok(7));
    }

    #[test]
    fn test_blocking_pop_wakes_on_abort() {
        let q = Arc::new(started());
        let consumer = {
            let q = q.clone();
            thread::spawn(move || q.pop(true).map(|_| ()))
        };
        thread::sleep(Duration::from_millis(20));
        q.abort();
        assert_eq!(consumer.join().unwrap(), Err(QueueError::Aborted));
    }

    #[test]
    fn test_has_enough_packets() {
        let q = started();
        for i in 0..5 {
            q.push(packet(i, 0.5)).unwrap();
        }
        assert!(!q.has_enough_packets(5, 1.0));
        q.push(packet(5, 0.5)).unwrap();
        assert!(q.has_enough_packets(5, 1.0));
        assert!(!q.has_enough_packets(5, 10.0));
        q.abort();
        assert!(q.has_enough_packets(100, 100.0));
    }
}
