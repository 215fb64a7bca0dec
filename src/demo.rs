//! Synthetic collaborators for the command line player
//!
//! Generates an interleaved stream of numbered video packets, sine-tone
//! audio chunks and periodic subtitles, so the playback core can run end
//! to end without a container library or a codec.

use anyhow::{Result, bail};
use log::{debug, trace};
use std::collections::VecDeque;
use std::f32::consts::TAU;

use crate::error::{DecodeError, PlayerError};
use crate::pipeline::decode_loop::{DecodeOutput, MediaDecoder, SendStatus};
use crate::pipeline::output::{AudioSink, AudioSpec, VideoPresenter};
use crate::pipeline::reader::{DemuxEvent, Demuxer, SeekTarget};
use crate::pipeline::types::{
    AudioSamples, Frame, FramePayload, MediaKind, Packet, PixelFormat, Subtitle, VideoGeometry,
};
use crate::player::Session;

/// Nominal input bitrate, used to map byte positions to stream time.
const BYTES_PER_SECOND: f64 = 250_000.0;

/// Shape of the generated input.
#[derive(Debug, Clone, PartialEq)]
pub struct DemoSource {
    pub duration: f64,
    pub frame_rate: f64,
    pub sample_rate: u32,
    pub channels: u16,
    /// Sample frames per audio packet.
    pub audio_chunk: usize,
    /// Seconds between subtitle events, `None` for no subtitle stream.
    pub subtitle_interval: Option<f64>,
    pub tone_hz: f32,
    pub realtime: bool,
}

impl Default for DemoSource {
    fn default() -> Self {
        Self {
            duration: 10.0,
            frame_rate: 25.0,
            sample_rate: 48_000,
            channels: 2,
            audio_chunk: 1024,
            subtitle_interval: Some(2.0),
            tone_hz: 440.0,
            realtime: false,
        }
    }
}

impl DemoSource {
    pub fn validate(&self) -> Result<()> {
        if !(self.duration > 0.0) {
            bail!("duration must be positive, got {}", self.duration);
        }
        if !(self.frame_rate > 0.0) {
            bail!("frame rate must be positive, got {}", self.frame_rate);
        }
        if self.sample_rate == 0 || self.channels == 0 || self.audio_chunk == 0 {
            bail!("audio layout must be non-empty");
        }
        if let Some(interval) = self.subtitle_interval {
            if !(interval > 0.0) {
                bail!("subtitle interval must be positive, got {interval}");
            }
        }
        Ok(())
    }

    pub fn frame_duration(&self) -> f64 {
        1.0 / self.frame_rate
    }

    pub fn chunk_duration(&self) -> f64 {
        self.audio_chunk as f64 / self.sample_rate as f64
    }

    /// Number of video frames the demuxer produces per pass.
    pub fn video_frames(&self) -> u64 {
        (self.duration * self.frame_rate).ceil() as u64
    }

    pub fn audio_chunks(&self) -> u64 {
        (self.duration / self.chunk_duration()).ceil() as u64
    }

    pub fn subtitle_count(&self) -> u64 {
        self.subtitle_interval
            .map_or(0, |interval| (self.duration / interval).ceil() as u64)
    }

    pub fn audio_spec(&self) -> AudioSpec {
        AudioSpec {
            sample_rate: self.sample_rate,
            channels: self.channels,
            period_frames: self.audio_chunk,
            hardware_latency: 0.0,
        }
    }

    /// Build a full session around the given presenter and audio sink.
    pub fn session(
        &self,
        presenter: Option<Box<dyn VideoPresenter>>,
        audio_sink: Option<Box<dyn AudioSink>>,
    ) -> Result<Session> {
        self.validate()?;
        Ok(Session {
            demuxer: Box::new(SyntheticDemuxer::new(self.clone())),
            video_decoder: Some(Box::new(SyntheticVideoDecoder::new(self.frame_duration()))),
            audio_decoder: Some(Box::new(ToneDecoder::new(self))),
            subtitle_decoder: self
                .subtitle_interval
                .map(|_| Box::new(TextSubtitleDecoder::default()) as Box<dyn MediaDecoder>),
            presenter,
            audio_sink,
        })
    }
}

/// Interleaves the generated streams in pts order.
pub struct SyntheticDemuxer {
    source: DemoSource,
    next_video: u64,
    next_audio: u64,
    next_subtitle: u64,
}

impl SyntheticDemuxer {
    pub fn new(source: DemoSource) -> Self {
        Self {
            source,
            next_video: 0,
            next_audio: 0,
            next_subtitle: 0,
        }
    }

    fn video_pts(&self) -> f64 {
        self.next_video as f64 * self.source.frame_duration()
    }

    fn audio_pts(&self) -> f64 {
        self.next_audio as f64 * self.source.chunk_duration()
    }

    fn subtitle_pts(&self) -> Option<f64> {
        self.source
            .subtitle_interval
            .map(|interval| self.next_subtitle as f64 * interval)
    }

    fn position_at(&mut self, time: f64) {
        let time = time.clamp(0.0, self.source.duration);
        self.next_video = (time / self.source.frame_duration()).ceil() as u64;
        self.next_audio = (time / self.source.chunk_duration()).floor() as u64;
        self.next_subtitle = self
            .source
            .subtitle_interval
            .map_or(0, |interval| (time / interval).ceil() as u64);
    }
}

fn packet_at(data: Vec<u8>, pts: f64, duration: f64) -> Packet {
    let mut packet = Packet::new(data, Some(pts), duration);
    packet.pos = Some((pts * BYTES_PER_SECOND) as u64);
    packet
}

impl Demuxer for SyntheticDemuxer {
    fn has_stream(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Video | MediaKind::Audio => true,
            MediaKind::Subtitle => self.source.subtitle_interval.is_some(),
        }
    }

    fn read_packet(&mut self) -> Result<DemuxEvent, PlayerError> {
        let video = (self.next_video < self.source.video_frames()).then(|| self.video_pts());
        let audio = (self.next_audio < self.source.audio_chunks()).then(|| self.audio_pts());
        let subtitle = self
            .subtitle_pts()
            .filter(|_| self.next_subtitle < self.source.subtitle_count());
        let av = match (video, audio) {
            (Some(v), Some(a)) => v.min(a),
            (v, a) => v.or(a).unwrap_or(f64::INFINITY),
        };

        if let Some(pts) = subtitle.filter(|&pts| pts <= av) {
            self.next_subtitle += 1;
            let text = format!("subtitle #{}", self.next_subtitle);
            let duration = self.source.subtitle_interval.unwrap_or_default() * 0.75;
            return Ok(DemuxEvent::Packet(
                MediaKind::Subtitle,
                packet_at(text.into_bytes(), pts, duration),
            ));
        }
        if let Some(pts) = video.filter(|&pts| pts <= av) {
            self.next_video += 1;
            let mut packet = packet_at(self.next_video.to_le_bytes().to_vec(), pts, self.source.frame_duration());
            packet.is_keyframe = true;
            return Ok(DemuxEvent::Packet(MediaKind::Video, packet));
        }
        if let Some(pts) = audio {
            self.next_audio += 1;
            return Ok(DemuxEvent::Packet(
                MediaKind::Audio,
                packet_at(self.next_audio.to_le_bytes().to_vec(), pts, self.source.chunk_duration()),
            ));
        }
        Ok(DemuxEvent::Eof)
    }

    fn seek(&mut self, target: SeekTarget) -> Result<(), PlayerError> {
        let time = match target {
            SeekTarget::Time(time) => time,
            SeekTarget::Bytes(pos) => pos as f64 / BYTES_PER_SECOND,
        };
        if !time.is_finite() {
            return Err(PlayerError::Demux(format!("cannot seek to {time}")));
        }
        debug!("SyntheticDemuxer: seek to {time:.3}s");
        self.position_at(time);
        Ok(())
    }

    fn is_realtime(&self) -> bool {
        self.source.realtime
    }
}

/// Turns each video packet into a tiny picture, one frame of delay.
pub struct SyntheticVideoDecoder {
    geometry: VideoGeometry,
    frame_duration: f64,
    pending: Option<Packet>,
    draining: bool,
}

impl SyntheticVideoDecoder {
    pub fn new(frame_duration: f64) -> Self {
        Self {
            geometry: VideoGeometry::new(16, 16, PixelFormat::Rgba),
            frame_duration,
            pending: None,
            draining: false,
        }
    }
}

impl MediaDecoder for SyntheticVideoDecoder {
    fn send_packet(&mut self, packet: &Packet) -> Result<SendStatus, DecodeError> {
        if packet.is_null() {
            self.draining = true;
            return Ok(SendStatus::Accepted);
        }
        if self.pending.is_some() {
            return Ok(SendStatus::Full);
        }
        if packet.data.len() != 8 {
            return Err(DecodeError::Corrupt(format!("{} byte picture", packet.data.len())));
        }
        self.pending = Some(packet.clone());
        Ok(SendStatus::Accepted)
    }

    fn receive_frame(&mut self) -> Result<DecodeOutput, DecodeError> {
        match self.pending.take() {
            Some(packet) => {
                let pts = packet.pts.unwrap_or(f64::NAN);
                let duration = if packet.duration > 0.0 { packet.duration } else { self.frame_duration };
                let mut frame = Frame::video(packet.data, self.geometry, pts, duration, 0);
                frame.pos = packet.pos;
                Ok(DecodeOutput::Frame(frame))
            }
            None if self.draining => Ok(DecodeOutput::Eof),
            None => Ok(DecodeOutput::NeedMorePackets),
        }
    }

    fn flush(&mut self) {
        self.pending = None;
        self.draining = false;
    }
}

/// Synthesizes a continuous sine tone for each audio packet.
pub struct ToneDecoder {
    sample_rate: u32,
    channels: u16,
    chunk: usize,
    tone_hz: f32,
    pending: VecDeque<f64>,
    draining: bool,
}

impl ToneDecoder {
    pub fn new(source: &DemoSource) -> Self {
        Self {
            sample_rate: source.sample_rate,
            channels: source.channels,
            chunk: source.audio_chunk,
            tone_hz: source.tone_hz,
            pending: VecDeque::new(),
            draining: false,
        }
    }

    fn synthesize(&self, pts: f64) -> AudioSamples {
        let channels = self.channels as usize;
        let rate = self.sample_rate as f64;
        let mut samples = Vec::with_capacity(self.chunk * channels);
        for n in 0..self.chunk {
            let t = pts + n as f64 / rate;
            let phase = (t * self.tone_hz as f64).fract() as f32;
            let value = 0.2 * (TAU * phase).sin();
            samples.extend(std::iter::repeat_n(value, channels));
        }
        AudioSamples::new(samples, self.sample_rate, self.channels)
    }
}

impl MediaDecoder for ToneDecoder {
    fn send_packet(&mut self, packet: &Packet) -> Result<SendStatus, DecodeError> {
        if packet.is_null() {
            self.draining = true;
            return Ok(SendStatus::Accepted);
        }
        if self.pending.len() >= 2 {
            return Ok(SendStatus::Full);
        }
        // a missing pts is filled in by the decode loop
        self.pending.push_back(packet.pts.unwrap_or(f64::NAN));
        Ok(SendStatus::Accepted)
    }

    fn receive_frame(&mut self) -> Result<DecodeOutput, DecodeError> {
        match self.pending.pop_front() {
            Some(pts) => {
                let samples = self.synthesize(if pts.is_nan() { 0.0 } else { pts });
                Ok(DecodeOutput::Frame(Frame::audio(samples, pts, 0)))
            }
            None if self.draining => Ok(DecodeOutput::Eof),
            None => Ok(DecodeOutput::NeedMorePackets),
        }
    }

    fn flush(&mut self) {
        self.pending.clear();
        self.draining = false;
    }
}

/// Packets carry UTF-8 text shown for the packet duration.
#[derive(Default)]
pub struct TextSubtitleDecoder {
    pending: VecDeque<Frame>,
    draining: bool,
}

impl MediaDecoder for TextSubtitleDecoder {
    fn send_packet(&mut self, packet: &Packet) -> Result<SendStatus, DecodeError> {
        if packet.is_null() {
            self.draining = true;
            return Ok(SendStatus::Accepted);
        }
        let text = std::str::from_utf8(&packet.data)
            .map_err(|e| DecodeError::Corrupt(format!("subtitle text: {e}")))?;
        let subtitle = Subtitle {
            text: text.to_owned(),
            start_display: 0.0,
            end_display: packet.duration,
        };
        self.pending
            .push_back(Frame::subtitle(subtitle, packet.pts.unwrap_or(f64::NAN), 0));
        Ok(SendStatus::Accepted)
    }

    fn receive_frame(&mut self) -> Result<DecodeOutput, DecodeError> {
        match self.pending.pop_front() {
            Some(frame) => Ok(DecodeOutput::Frame(frame)),
            None if self.draining => Ok(DecodeOutput::Eof),
            None => Ok(DecodeOutput::NeedMorePackets),
        }
    }

    fn flush(&mut self) {
        self.pending.clear();
        self.draining = false;
    }
}

/// Logs every presented frame instead of drawing it.
#[derive(Default)]
pub struct LogPresenter {
    presented: u64,
}

impl VideoPresenter for LogPresenter {
    fn present(&mut self, frame: &Frame, subtitle: Option<&Frame>) {
        self.presented += 1;
        let text = subtitle.and_then(|sub| match &sub.payload {
            FramePayload::Subtitle(sub) => Some(sub.text.as_str()),
            _ => None,
        });
        match text {
            Some(text) => debug!("frame {} pts {:.3} [{text}]", self.presented, frame.pts),
            None => trace!("frame {} pts {:.3}", self.presented, frame.pts),
        }
    }
}

/// Discards samples at the device rate; the device thread does the pacing.
pub struct NullAudioSink {
    spec: AudioSpec,
    played: u64,
}

impl NullAudioSink {
    pub fn new(spec: AudioSpec) -> Self {
        Self { spec, played: 0 }
    }

    pub fn played_frames(&self) -> u64 {
        self.played
    }
}

impl AudioSink for NullAudioSink {
    fn spec(&self) -> AudioSpec {
        self.spec
    }

    fn play(&mut self, samples: &[f32]) {
        self.played += (samples.len() / self.spec.channels.max(1) as usize) as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn short_source() -> DemoSource {
        DemoSource {
            duration: 1.0,
            frame_rate: 10.0,
            sample_rate: 8_000,
            channels: 1,
            audio_chunk: 2_000,
            subtitle_interval: Some(0.5),
            ..DemoSource::default()
        }
    }

    fn drain(demuxer: &mut SyntheticDemuxer) -> Vec<(MediaKind, f64)> {
        let mut out = Vec::new();
        while let Ok(DemuxEvent::Packet(kind, packet)) = demuxer.read_packet() {
            out.push((kind, packet.pts.unwrap_or(f64::NAN)));
        }
        out
    }

    #[test]
    fn test_demuxer_interleaves_in_pts_order() {
        let mut demuxer = SyntheticDemuxer::new(short_source());
        let packets = drain(&mut demuxer);

        let count = |kind| packets.iter().filter(|(k, _)| *k == kind).count();
        assert_eq!(count(MediaKind::Video), 10);
        assert_eq!(count(MediaKind::Audio), 4);
        assert_eq!(count(MediaKind::Subtitle), 2);
        assert!(packets.windows(2).all(|w| w[0].1 <= w[1].1 + 1e-9));
        assert!(matches!(demuxer.read_packet(), Ok(DemuxEvent::Eof)));
    }

    #[test]
    fn test_demuxer_seek() {
        let mut demuxer = SyntheticDemuxer::new(short_source());
        demuxer.seek(SeekTarget::Time(0.5)).unwrap();
        let packets = drain(&mut demuxer);
        let first_video = packets.iter().find(|(k, _)| *k == MediaKind::Video).unwrap();
        assert!((first_video.1 - 0.5).abs() < 1e-9);

        demuxer.seek(SeekTarget::Bytes(0)).unwrap();
        assert_eq!(drain(&mut demuxer).len(), 16);
        assert!(demuxer.seek(SeekTarget::Time(f64::NAN)).is_err());
    }

    #[test]
    fn test_video_decoder_backpressure_and_drain() {
        let mut decoder = SyntheticVideoDecoder::new(0.04);
        let packet = packet_at(1u64.to_le_bytes().to_vec(), 0.0, 0.04);
        assert_eq!(decoder.send_packet(&packet), Ok(SendStatus::Accepted));
        assert_eq!(decoder.send_packet(&packet), Ok(SendStatus::Full));
        assert!(matches!(decoder.receive_frame(), Ok(DecodeOutput::Frame(_))));
        assert_eq!(decoder.receive_frame(), Ok(DecodeOutput::NeedMorePackets));

        decoder.send_packet(&Packet::null()).unwrap();
        assert_eq!(decoder.receive_frame(), Ok(DecodeOutput::Eof));
        decoder.flush();
        assert_eq!(decoder.receive_frame(), Ok(DecodeOutput::NeedMorePackets));
    }

    #[test]
    fn test_video_decoder_rejects_garbage() {
        let mut decoder = SyntheticVideoDecoder::new(0.04);
        let result = decoder.send_packet(&Packet::new(vec![1u8, 2, 3], Some(0.0), 0.04));
        assert!(matches!(result, Err(DecodeError::Corrupt(_))));
    }

    #[test]
    fn test_tone_decoder_chunk_layout() {
        let source = short_source();
        let mut decoder = ToneDecoder::new(&source);
        decoder.send_packet(&Packet::new(vec![0u8], Some(0.25), 0.25)).unwrap();
        let Ok(DecodeOutput::Frame(frame)) = decoder.receive_frame() else {
            panic!("expected a frame");
        };
        let samples = frame.audio_samples().unwrap();
        assert_eq!(samples.frame_count(), 2_000);
        assert!((frame.duration - 0.25).abs() < 1e-9);
        assert!(samples.samples.iter().all(|s| s.abs() <= 0.2 + f32::EPSILON));
    }

    #[test]
    fn test_null_sink_counts_sample_frames() {
        let source = short_source();
        let mut sink = NullAudioSink::new(source.audio_spec());
        sink.play(&[0.0; 400]);
        sink.play(&[0.0; 100]);
        assert_eq!(sink.played_frames(), 500);
        assert_eq!(sink.spec().period_frames, 2_000);
    }

    #[test]
    fn test_session_wires_subtitles_when_configured() {
        let session = short_source().session(None, None).unwrap();
        assert!(session.subtitle_decoder.is_some());

        let without = DemoSource {
            subtitle_interval: None,
            ..short_source()
        };
        let session = without.session(None, None).unwrap();
        assert!(session.subtitle_decoder.is_none());
        assert!(!session.demuxer.has_stream(MediaKind::Subtitle));

        let broken = DemoSource {
            duration: 0.0,
            ..short_source()
        };
        assert!(broken.session(None, None).is_err());
    }
}
