//! Error taxonomy for the playback core
//!
//! Queue and clock errors are local control flow and are recovered where
//! they occur. Only setup failures escalate to [`PlayerError`].

use thiserror::Error;

/// Outcome of a queue operation that could not deliver or accept an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    /// The queue was aborted. Cooperative shutdown, never surfaced to the user.
    #[error("queue aborted")]
    Aborted,

    /// Non-blocking probe found nothing.
    #[error("queue empty")]
    Empty,
}

/// Errors reported by an external decoder backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The packet could not be decoded. The loop skips it and continues.
    #[error("corrupt packet: {0}")]
    Corrupt(String),

    /// Backend specific failure that does not invalidate the stream.
    #[error("decoder backend error: {0}")]
    Backend(String),

    /// Allocation failure. Terminates the stream.
    #[error("decoder out of memory")]
    OutOfMemory,
}

impl DecodeError {
    /// Whether the decode loop may skip the offending packet and continue.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, DecodeError::OutOfMemory)
    }
}

/// A clock was read across a flush boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ClockError {
    #[error("clock serial {clock_serial} does not match queue serial {queue_serial}")]
    Invalid { clock_serial: u64, queue_serial: u64 },
}

/// Failures that abort opening or running a player.
#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("out of memory while allocating {0}")]
    OutOfMemory(&'static str),

    #[error("input has no playable streams")]
    NoStreams,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to spawn thread: {0}")]
    Thread(#[from] std::io::Error),

    #[error("demuxer error: {0}")]
    Demux(String),

    #[error("decoder error: {0}")]
    Decode(#[from] DecodeError),

    #[error("player already stopped")]
    Stopped,
}
