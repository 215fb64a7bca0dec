//! Audio/video synchronization core of a media player
//!
//! The crate owns the timing and buffering problem only: bounded packet
//! and frame queues with flush serials, playback clocks, the master clock
//! policy and the per-frame presentation decision. Containers, codecs and
//! output devices are collaborators behind the traits in [`pipeline`].

pub mod config;
pub mod demo;
pub mod error;
pub mod pipeline;
pub mod player;

pub use config::{FrameDrop, PlayerConfig, SyncMode};
pub use error::{DecodeError, PlayerError, QueueError};
pub use player::{Player, PlayerCommand, Session};
