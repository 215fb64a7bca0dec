//! Playback pipeline
//!
//! Separates the player into threads that only meet at queues and clocks:
//! - Reader: demuxer to per-stream packet queues, with back-pressure
//! - Decode loops: one per stream, packet queue to frame queue
//! - Audio renderer: device callback pulling from the audio frame queue
//! - Presentation: the sync controller decides when each video frame shows
//!
//! # Architecture
//!
//! Every queued item carries the serial of its packet queue at push time.
//! A flush bumps the serial, so stale data anywhere in the pipeline is
//! recognised with one integer compare and discarded by whoever sees it.
//! Clocks bound to a packet queue read NaN across the same boundary.

pub mod audio_renderer;
pub mod clock;
pub mod decode_loop;
pub mod frame_queue;
pub mod health;
pub mod output;
pub mod packet_queue;
pub mod reader;
pub mod state;
pub mod sync;
pub mod types;

pub use audio_renderer::AudioRenderer;
pub use clock::{Clock, relative_time};
pub use decode_loop::{DecodeLoop, DecodeOutput, DecoderStatus, MediaDecoder, SendStatus};
pub use frame_queue::FrameQueue;
pub use health::{PlaybackStats, StatsSummary};
pub use output::{AudioSink, AudioSpec, VideoPresenter};
pub use packet_queue::PacketQueue;
pub use reader::{DemuxEvent, Demuxer, ReadControl, ReadLoop, SeekTarget};
pub use state::PlayerState;
pub use sync::{Clocks, FrameAction, MasterClock, SyncController};
pub use types::{AudioSamples, Frame, FramePayload, MediaKind, Packet, PixelFormat, Subtitle, VideoGeometry};
