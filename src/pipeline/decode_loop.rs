//! Per-stream decode worker
//!
//! Drains one packet queue through a [`MediaDecoder`] into one frame
//! queue. Runs on its own thread until the packet queue is aborted.
//!
//! # States
//!
//! ```text
//! Idle -> Running <-> PacketPending
//!            |
//!            v  null packet sent
//!         Draining -> Finished { serial }
//! ```
//!
//! A packet carrying a new serial resets the decoder and returns the loop
//! to `Running`, whatever state it was in.

use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::DecodeError;
use crate::pipeline::clock::relative_time;
use crate::pipeline::frame_queue::FrameQueue;
use crate::pipeline::health::PlaybackStats;
use crate::pipeline::packet_queue::PacketQueue;
use crate::pipeline::reader::ReadControl;
use crate::pipeline::sync::EarlyDrop;
use crate::pipeline::types::{Frame, MediaKind, Packet, PacketEntry};

/// Whether the decoder took a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Accepted,
    /// Output must be drained first; resubmit the same packet later.
    Full,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecodeOutput {
    /// A decoded frame. Its serial is overwritten by the loop.
    Frame(Frame),
    NeedMorePackets,
    /// Fully drained after a null packet.
    Eof,
}

/// Codec collaborator
///
/// A null packet (see [`Packet::is_null`]) asks the decoder to drain.
pub trait MediaDecoder: Send {
    fn send_packet(&mut self, packet: &Packet) -> Result<SendStatus, DecodeError>;

    fn receive_frame(&mut self) -> Result<DecodeOutput, DecodeError>;

    /// Drop all internal state, as after a seek.
    fn flush(&mut self);
}

impl<T: MediaDecoder + ?Sized> MediaDecoder for Box<T> {
    fn send_packet(&mut self, packet: &Packet) -> Result<SendStatus, DecodeError> {
        (**self).send_packet(packet)
    }

    fn receive_frame(&mut self) -> Result<DecodeOutput, DecodeError> {
        (**self).receive_frame()
    }

    fn flush(&mut self) {
        (**self).flush()
    }
}

#[derive(Debug, Clone)]
pub enum DecoderState {
    Idle,
    Running,
    /// The decoder refused this packet; it is resubmitted before a new pop.
    PacketPending(PacketEntry),
    Draining,
    Finished { serial: u64 },
}

/// Finished flag shared with the reader.
#[derive(Debug, Default)]
pub struct DecoderStatus {
    /// Serial the decoder last drained, 0 while not finished.
    finished: AtomicU64,
}

impl DecoderStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_finished(&self, serial: u64) {
        self.finished.store(serial, Ordering::Release);
    }

    pub fn clear(&self) {
        self.finished.store(0, Ordering::Release);
    }

    pub fn finished_serial(&self) -> Option<u64> {
        match self.finished.load(Ordering::Acquire) {
            0 => None,
            serial => Some(serial),
        }
    }

    pub fn is_finished_at(&self, serial: u64) -> bool {
        self.finished_serial() == Some(serial)
    }
}

enum Step {
    Frame(Frame),
    Finished(u64),
    Aborted,
}

pub struct DecodeLoop<'a, 'q, D> {
    decoder: D,
    kind: MediaKind,
    pktq: &'q PacketQueue,
    frameq: &'a FrameQueue<'q>,
    stats: &'a PlaybackStats,
    status: &'a DecoderStatus,
    control: &'a ReadControl,
    early_drop: Option<EarlyDrop<'a, 'q>>,
    state: DecoderState,
    pkt_serial: u64,
    /// Predicted pts of the next audio frame, for frames without one.
    next_pts: Option<f64>,
    start_pts: Option<f64>,
}

impl<'a, 'q, D: MediaDecoder> DecodeLoop<'a, 'q, D> {
    pub fn new(
        decoder: D,
        frameq: &'a FrameQueue<'q>,
        stats: &'a PlaybackStats,
        status: &'a DecoderStatus,
        control: &'a ReadControl,
    ) -> Self {
        let pktq = frameq.packet_queue();
        Self {
            decoder,
            kind: pktq.kind(),
            pktq,
            frameq,
            stats,
            status,
            control,
            early_drop: None,
            state: DecoderState::Idle,
            pkt_serial: 0,
            next_pts: None,
            start_pts: None,
        }
    }

    /// Discard video frames that are late before they reach the queue.
    pub fn with_early_drop(mut self, early_drop: EarlyDrop<'a, 'q>) -> Self {
        self.early_drop = Some(early_drop);
        self
    }

    /// Timestamp assumed for the first audio frame of each serial.
    pub fn with_start_pts(mut self, pts: f64) -> Self {
        self.start_pts = Some(pts);
        self
    }

    pub fn state(&self) -> &DecoderState {
        &self.state
    }

    /// Decode until the packet queue is aborted.
    ///
    /// Recoverable decode errors are counted and skipped. A fatal error
    /// aborts this stream's queues and is returned.
    pub fn run(mut self) -> Result<(), DecodeError> {
        info!("DecodeLoop[{}]: started", self.kind);
        self.state = DecoderState::Running;
        let mut frames = 0u64;

        let result = loop {
            match self.decode_frame() {
                Ok(Step::Frame(frame)) => {
                    if !self.queue_frame(frame) {
                        break Ok(());
                    }
                    frames += 1;
                }
                Ok(Step::Finished(serial)) => {
                    debug!("DecodeLoop[{}]: drained serial {serial}", self.kind);
                    if self.kind.needs_terminal_frame() {
                        match self.frameq.peek_writable() {
                            Ok(slot) => slot.push(Frame::end_of_stream(serial)),
                            Err(_) => break Ok(()),
                        }
                    }
                }
                Ok(Step::Aborted) => break Ok(()),
                Err(e) => {
                    error!("DecodeLoop[{}]: fatal decoder error: {e}", self.kind);
                    self.pktq.abort();
                    self.frameq.signal();
                    break Err(e);
                }
            }
        };

        info!("DecodeLoop[{}]: finished ({frames} frames)", self.kind);
        result
    }

    fn decode_frame(&mut self) -> Result<Step, DecodeError> {
        loop {
            let receiving = !matches!(self.state, DecoderState::Idle | DecoderState::Finished { .. });
            if receiving && self.pktq.serial() == self.pkt_serial {
                loop {
                    if self.pktq.is_aborted() {
                        return Ok(Step::Aborted);
                    }
                    match self.decoder.receive_frame() {
                        Ok(DecodeOutput::Frame(mut frame)) => {
                            frame.serial = self.pkt_serial;
                            return Ok(Step::Frame(frame));
                        }
                        Ok(DecodeOutput::Eof) => {
                            self.decoder.flush();
                            self.state = DecoderState::Finished {
                                serial: self.pkt_serial,
                            };
                            self.status.set_finished(self.pkt_serial);
                            return Ok(Step::Finished(self.pkt_serial));
                        }
                        Ok(DecodeOutput::NeedMorePackets) => break,
                        Err(e) if e.is_recoverable() => {
                            warn!("DecodeLoop[{}]: {e}", self.kind);
                            self.stats.record_decode_error();
                            break;
                        }
                        Err(e) => return Err(e),
                    }
                }
            }

            let Some(entry) = self.next_packet() else {
                return Ok(Step::Aborted);
            };
            self.submit(entry)?;
        }
    }

    /// Next packet of the current serial: the pending one, or a fresh pop.
    fn next_packet(&mut self) -> Option<PacketEntry> {
        loop {
            if self.pktq.is_empty() {
                self.control.notify();
            }
            let entry = match std::mem::replace(&mut self.state, DecoderState::Running) {
                DecoderState::PacketPending(entry) => entry,
                previous => {
                    self.state = previous;
                    let entry = self.pktq.pop(true).ok()?;
                    if entry.serial != self.pkt_serial {
                        self.start_serial(entry.serial);
                    }
                    entry
                }
            };
            if entry.serial == self.pktq.serial() {
                return Some(entry);
            }
        }
    }

    fn start_serial(&mut self, serial: u64) {
        debug!(
            "DecodeLoop[{}]: serial {} -> {serial}, resetting decoder",
            self.kind, self.pkt_serial
        );
        self.decoder.flush();
        self.pkt_serial = serial;
        self.status.clear();
        self.next_pts = self.start_pts;
        self.state = DecoderState::Running;
    }

    fn submit(&mut self, entry: PacketEntry) -> Result<(), DecodeError> {
        let draining = entry.packet.is_null();
        match self.decoder.send_packet(&entry.packet) {
            Ok(SendStatus::Accepted) => {
                if draining {
                    self.state = DecoderState::Draining;
                }
                Ok(())
            }
            Ok(SendStatus::Full) => {
                self.state = DecoderState::PacketPending(entry);
                Ok(())
            }
            Err(e) if e.is_recoverable() => {
                warn!("DecodeLoop[{}]: packet rejected: {e}", self.kind);
                self.stats.record_decode_error();
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Push a decoded frame. Returns false once the stream is aborted.
    fn queue_frame(&mut self, mut frame: Frame) -> bool {
        match self.kind {
            MediaKind::Video => {
                if let Some(early) = &self.early_drop {
                    if early.should_drop(frame.pts, self.pkt_serial, self.pktq, relative_time()) {
                        self.stats.record_early_drop();
                        return true;
                    }
                }
            }
            MediaKind::Audio => {
                if frame.pts.is_nan() {
                    if let Some(pts) = self.next_pts {
                        frame.pts = pts;
                    }
                }
                if !frame.pts.is_nan() {
                    self.next_pts = Some(frame.pts + frame.duration);
                }
            }
            MediaKind::Subtitle => {}
        }

        match self.frameq.peek_writable() {
            Ok(slot) => {
                slot.push(frame);
                self.stats.record_decoded();
                true
            }
            Err(_) => false,
        }
    }
}
