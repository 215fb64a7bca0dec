//! Core types for the pipeline system

use bytes::Bytes;
use std::sync::Arc;

/// Kind of media data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    /// Video frame data
    Video,
    /// Audio sample data
    Audio,
    /// Subtitle data
    Subtitle,
}

impl MediaKind {
    /// Whether the decode loop pushes an end-of-stream frame when it finishes.
    ///
    /// Subtitles simply stop appearing; video and audio consumers need an
    /// explicit marker to tell "drained" apart from "not decoded yet".
    pub fn needs_terminal_frame(&self) -> bool {
        matches!(self, MediaKind::Video | MediaKind::Audio)
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Video => write!(f, "Video"),
            MediaKind::Audio => write!(f, "Audio"),
            MediaKind::Subtitle => write!(f, "Subtitle"),
        }
    }
}

/// Compressed unit as delivered by the demuxer.
///
/// An empty payload is the null packet, which tells the decoder that the
/// input is exhausted and it should drain its buffered frames.
#[derive(Clone, Default, PartialEq)]
pub struct Packet {
    pub data: Bytes,
    /// Presentation timestamp in seconds.
    pub pts: Option<f64>,
    /// Decode timestamp in seconds.
    pub dts: Option<f64>,
    /// Duration in seconds, 0 when unknown.
    pub duration: f64,
    /// Byte position in the input, when known.
    pub pos: Option<u64>,
    pub is_keyframe: bool,
}

impl Packet {
    pub fn new(data: impl Into<Bytes>, pts: Option<f64>, duration: f64) -> Self {
        Self {
            data: data.into(),
            pts,
            dts: pts,
            duration,
            pos: None,
            is_keyframe: false,
        }
    }

    /// End-of-input marker.
    pub fn null() -> Self {
        Self::default()
    }

    pub fn is_null(&self) -> bool {
        self.data.is_empty()
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("size", &self.size())
            .field("pts", &self.pts)
            .field("dts", &self.dts)
            .field("duration", &self.duration)
            .field("pos", &self.pos)
            .field("is_keyframe", &self.is_keyframe)
            .finish()
    }
}

/// A packet together with the queue serial in effect when it was pushed.
#[derive(Debug, Clone)]
pub struct PacketEntry {
    pub packet: Packet,
    pub serial: u64,
}

/// Pixel layout of a decoded picture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Yuv420p,
    Rgba,
}

/// Geometry and format metadata of a video picture.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoGeometry {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Sample aspect ratio as (num, den); (0, 1) when unknown.
    pub sample_aspect_ratio: (u32, u32),
}

impl VideoGeometry {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
            sample_aspect_ratio: (0, 1),
        }
    }
}

/// Interleaved f32 samples plus their layout.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioSamples {
    pub samples: Arc<[f32]>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioSamples {
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
            channels,
        }
    }

    /// Number of sample frames (one sample per channel).
    pub fn frame_count(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    /// Playback length in seconds at the nominal rate.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frame_count() as f64 / self.sample_rate as f64
    }
}

/// A decoded subtitle with its display window relative to the frame pts.
#[derive(Debug, Clone, PartialEq)]
pub struct Subtitle {
    pub text: String,
    pub start_display: f64,
    pub end_display: f64,
}

/// Decoded content carried by a [`Frame`].
#[derive(Debug, Clone, PartialEq)]
pub enum FramePayload {
    Video { data: Bytes, geometry: VideoGeometry },
    Audio(AudioSamples),
    Subtitle(Subtitle),
    /// Terminal marker pushed once the decoder has fully drained.
    EndOfStream,
}

/// Decoded frame with timing information
///
/// Cloning is cheap: payload buffers are reference counted.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub payload: FramePayload,
    /// Presentation timestamp in seconds; NaN when unknown.
    pub pts: f64,
    /// Duration in seconds, 0 when unknown.
    pub duration: f64,
    /// Byte position of the source packet, when known.
    pub pos: Option<u64>,
    /// Serial of the packet this frame was decoded from.
    pub serial: u64,
}

impl Frame {
    pub fn video(data: impl Into<Bytes>, geometry: VideoGeometry, pts: f64, duration: f64, serial: u64) -> Self {
        Self {
            payload: FramePayload::Video {
                data: data.into(),
                geometry,
            },
            pts,
            duration,
            pos: None,
            serial,
        }
    }

    pub fn audio(samples: AudioSamples, pts: f64, serial: u64) -> Self {
        let duration = samples.duration();
        Self {
            payload: FramePayload::Audio(samples),
            pts,
            duration,
            pos: None,
            serial,
        }
    }

    pub fn subtitle(subtitle: Subtitle, pts: f64, serial: u64) -> Self {
        let duration = subtitle.end_display - subtitle.start_display;
        Self {
            payload: FramePayload::Subtitle(subtitle),
            pts,
            duration,
            pos: None,
            serial,
        }
    }

    pub fn end_of_stream(serial: u64) -> Self {
        Self {
            payload: FramePayload::EndOfStream,
            pts: f64::NAN,
            duration: 0.0,
            pos: None,
            serial,
        }
    }

    pub fn is_end_of_stream(&self) -> bool {
        matches!(self.payload, FramePayload::EndOfStream)
    }

    pub fn geometry(&self) -> Option<VideoGeometry> {
        match &self.payload {
            FramePayload::Video { geometry, .. } => Some(*geometry),
            _ => None,
        }
    }

    pub fn audio_samples(&self) -> Option<&AudioSamples> {
        match &self.payload {
            FramePayload::Audio(samples) => Some(samples),
            _ => None,
        }
    }
}
