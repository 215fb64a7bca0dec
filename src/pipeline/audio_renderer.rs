//! Audio device callback path
//!
//! [`AudioRenderer::fill`] is called from the device's own thread each time
//! it needs another period of samples. It never blocks: when no decoded
//! audio is ready it writes silence and the audio clock stops advancing.
//!
//! After every callback the audio clock is set to the pts of the last
//! sample handed out, minus what is still buffered on our side and in the
//! device, so it tracks what is audible right now.

use log::trace;

use crate::config::PlayerConfig;
use crate::pipeline::frame_queue::FrameQueue;
use crate::pipeline::health::PlaybackStats;
use crate::pipeline::output::AudioSpec;
use crate::pipeline::sync::{AudioSync, MasterClock};
use crate::pipeline::types::AudioSamples;

pub struct AudioRenderer<'a, 'q> {
    sampq: &'a FrameQueue<'q>,
    master: MasterClock<'a, 'q>,
    sync: AudioSync<'a, 'q>,
    stats: &'a PlaybackStats,
    spec: AudioSpec,
    nosync_threshold: f64,
    /// Current decoded chunk, after sample-count correction.
    buf: Vec<f32>,
    buf_index: usize,
    /// Pts at the end of `buf`, NaN when unknown.
    audio_clock: f64,
    audio_clock_serial: u64,
}

impl<'a, 'q> AudioRenderer<'a, 'q> {
    pub fn new(
        config: &PlayerConfig,
        spec: AudioSpec,
        sampq: &'a FrameQueue<'q>,
        master: MasterClock<'a, 'q>,
        stats: &'a PlaybackStats,
    ) -> Self {
        Self {
            sampq,
            master,
            // corrections smaller than one device period are inaudible noise
            sync: AudioSync::new(config, master, spec.period_duration()),
            stats,
            spec,
            nosync_threshold: config.timing.nosync_threshold,
            buf: Vec::with_capacity(spec.period_samples() * 2),
            buf_index: 0,
            audio_clock: f64::NAN,
            audio_clock_serial: 0,
        }
    }

    pub fn spec(&self) -> AudioSpec {
        self.spec
    }

    /// Fill `out` with interleaved samples for a callback issued at `callback_time`.
    ///
    /// While the audio clock is paused the device gets silence and the
    /// partially played chunk is kept for when playback resumes.
    pub fn fill(&mut self, out: &mut [f32], callback_time: f64) {
        if self.master.clocks().audio.is_paused() {
            out.fill(0.0);
            return;
        }
        let mut written = 0;
        while written < out.len() {
            if self.buf_index >= self.buf.len() && !self.refill(callback_time) {
                out[written..].fill(0.0);
                self.buf.clear();
                self.buf_index = 0;
                break;
            }
            let n = (out.len() - written).min(self.buf.len() - self.buf_index);
            out[written..written + n].copy_from_slice(&self.buf[self.buf_index..self.buf_index + n]);
            written += n;
            self.buf_index += n;
        }

        if !self.audio_clock.is_nan() {
            let samples_per_sec = self.spec.sample_rate as f64 * self.spec.channels.max(1) as f64;
            let unplayed = (self.buf.len() - self.buf_index) as f64 / samples_per_sec;
            let clocks = self.master.clocks();
            clocks.audio.set_at(
                self.audio_clock - self.spec.hardware_latency - unplayed,
                self.audio_clock_serial,
                callback_time,
            );
            clocks
                .external
                .sync_to_slave_at(&clocks.audio, self.nosync_threshold, callback_time);
        }
    }

    /// Load the next current-serial chunk. Returns false when none is ready.
    fn refill(&mut self, time: f64) -> bool {
        loop {
            let Some(frame) = self.sampq.peek().filter(|_| self.sampq.remaining() > 0) else {
                self.stats.record_underrun();
                return false;
            };
            if frame.serial != self.sampq.packet_queue().serial() {
                self.sampq.next();
                continue;
            }
            if frame.is_end_of_stream() {
                return false;
            }
            self.sampq.next();

            let Some(samples) = frame.audio_samples() else {
                continue;
            };
            let nb_samples = samples.frame_count();
            let wanted = self.sync.wanted_samples(nb_samples, samples.sample_rate, time);
            if wanted != nb_samples {
                trace!("audio: resizing chunk {nb_samples} -> {wanted} samples");
                self.stats.record_sample_correction();
            }
            corrected_into(samples, wanted, &mut self.buf);
            self.buf_index = 0;

            self.audio_clock = if frame.pts.is_nan() || samples.sample_rate == 0 {
                f64::NAN
            } else {
                frame.pts + nb_samples as f64 / samples.sample_rate as f64
            };
            self.audio_clock_serial = frame.serial;
            return true;
        }
    }
}

/// Copy `samples` into `out`, truncated or padded with the last sample frame
/// so it holds exactly `wanted` sample frames.
fn corrected_into(samples: &AudioSamples, wanted: usize, out: &mut Vec<f32>) {
    let channels = samples.channels.max(1) as usize;
    let have = samples.frame_count();
    out.clear();
    out.extend_from_slice(&samples.samples[..wanted.min(have) * channels]);
    if wanted > have && have > 0 {
        let last = &samples.samples[(have - 1) * channels..have * channels];
        for _ in have..wanted {
            out.extend_from_slice(last);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncMode;
    use crate::pipeline::packet_queue::PacketQueue;
    use crate::pipeline::sync::Clocks;
    use crate::pipeline::types::{Frame, MediaKind};

    fn spec(sample_rate: u32, period_frames: usize) -> AudioSpec {
        AudioSpec {
            sample_rate,
            channels: 1,
            period_frames,
            hardware_latency: 0.0,
        }
    }

    fn chunk(values: Vec<f32>, rate: u32, pts: f64, serial: u64) -> Frame {
        Frame::audio(AudioSamples::new(values, rate, 1), pts, serial)
    }

    struct Fixture {
        audioq: PacketQueue,
        videoq: PacketQueue,
        stats: PlaybackStats,
    }

    impl Fixture {
        fn new() -> Self {
            let audioq = PacketQueue::new(MediaKind::Audio);
            let videoq = PacketQueue::new(MediaKind::Video);
            audioq.start();
            videoq.start();
            Self {
                audioq,
                videoq,
                stats: PlaybackStats::new(),
            }
        }
    }

    #[test]
    fn test_fill_sets_audio_clock() {
        let fx = Fixture::new();
        let clocks = Clocks::new(&fx.audioq, &fx.videoq);
        let sampq = FrameQueue::new(&fx.audioq, 4, false).unwrap();
        let config = PlayerConfig::default();
        let master = MasterClock::new(SyncMode::Audio, &clocks);
        let mut renderer = AudioRenderer::new(&config, spec(48_000, 240), &sampq, master, &fx.stats);

        sampq
            .peek_writable()
            .unwrap()
            .push(chunk(vec![0.5; 480], 48_000, 1.0, fx.audioq.serial()));

        let mut out = vec![0.0; 240];
        renderer.fill(&mut out, 10.0);
        assert!(out.iter().all(|&s| s == 0.5));
        // chunk ends at 1.01, half of it still unplayed
        assert!((clocks.audio.now_at(10.0) - 1.005).abs() < 1e-9);
        // external clock follows the audio clock
        assert!((clocks.external.now_at(10.0) - 1.005).abs() < 1e-9);

        renderer.fill(&mut out, 10.005);
        assert!((clocks.audio.now_at(10.005) - 1.01).abs() < 1e-9);
        assert_eq!(fx.stats.summary().audio_underruns, 0);
    }

    #[test]
    fn test_underrun_writes_silence() {
        let fx = Fixture::new();
        let clocks = Clocks::new(&fx.audioq, &fx.videoq);
        let sampq = FrameQueue::new(&fx.audioq, 4, false).unwrap();
        let config = PlayerConfig::default();
        let master = MasterClock::new(SyncMode::Audio, &clocks);
        let mut renderer = AudioRenderer::new(&config, spec(48_000, 64), &sampq, master, &fx.stats);

        let mut out = vec![1.0; 64];
        renderer.fill(&mut out, 0.0);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(fx.stats.summary().audio_underruns, 1);
        assert!(clocks.audio.now_at(0.0).is_nan());
    }

    #[test]
    fn test_stale_chunks_skipped_and_end_marker_kept() {
        let fx = Fixture::new();
        let clocks = Clocks::new(&fx.audioq, &fx.videoq);
        let sampq = FrameQueue::new(&fx.audioq, 4, false).unwrap();
        let config = PlayerConfig::default();
        let master = MasterClock::new(SyncMode::Audio, &clocks);
        let mut renderer = AudioRenderer::new(&config, spec(1000, 4), &sampq, master, &fx.stats);

        let old = fx.audioq.serial();
        sampq.peek_writable().unwrap().push(chunk(vec![9.0; 4], 1000, 0.0, old));
        fx.audioq.flush();
        let serial = fx.audioq.serial();
        sampq.peek_writable().unwrap().push(chunk(vec![1.0; 4], 1000, 3.0, serial));
        sampq.peek_writable().unwrap().push(Frame::end_of_stream(serial));

        let mut out = vec![0.0; 4];
        renderer.fill(&mut out, 0.0);
        assert_eq!(out, vec![1.0; 4]);

        renderer.fill(&mut out, 0.004);
        assert_eq!(out, vec![0.0; 4]);
        assert_eq!(sampq.remaining(), 1);
        assert!(sampq.is_drained());
        assert_eq!(fx.stats.summary().audio_underruns, 0);
    }

    #[test]
    fn test_paused_clock_outputs_silence() {
        let fx = Fixture::new();
        let clocks = Clocks::new(&fx.audioq, &fx.videoq);
        let sampq = FrameQueue::new(&fx.audioq, 4, false).unwrap();
        let config = PlayerConfig::default();
        let master = MasterClock::new(SyncMode::Audio, &clocks);
        let mut renderer = AudioRenderer::new(&config, spec(1000, 4), &sampq, master, &fx.stats);

        sampq
            .peek_writable()
            .unwrap()
            .push(chunk(vec![1.0; 4], 1000, 0.0, fx.audioq.serial()));
        clocks.audio.pause_at(0.0);

        let mut out = vec![0.5; 4];
        renderer.fill(&mut out, 1.0);
        assert_eq!(out, vec![0.0; 4]);
        assert_eq!(sampq.remaining(), 1);
    }

    #[test]
    fn test_chunk_stretched_toward_external_master() {
        let fx = Fixture::new();
        let clocks = Clocks::new(&fx.audioq, &fx.videoq);
        let sampq = FrameQueue::new(&fx.audioq, 4, false).unwrap();
        let mut config = PlayerConfig::default();
        config.timing.drift_avg_samples = 1;
        let master = MasterClock::new(SyncMode::External, &clocks);
        let mut renderer = AudioRenderer::new(&config, spec(1000, 100), &sampq, master, &fx.stats);

        let serial = fx.audioq.serial();
        clocks.external.set_at(10.0, 0, 0.0);
        clocks.external.pause_at(0.0);
        clocks.audio.set_at(10.5, serial, 0.0);
        sampq.peek_writable().unwrap().push(chunk(vec![0.0; 100], 1000, 10.5, serial));
        let ramp: Vec<f32> = (0..100).map(|i| i as f32).collect();
        sampq.peek_writable().unwrap().push(chunk(ramp, 1000, 10.6, serial));

        let mut out = vec![0.0; 100];
        renderer.fill(&mut out, 0.0);
        assert_eq!(fx.stats.summary().sample_corrections, 0);

        // audio 0.6s ahead: second chunk stretched by the 10% maximum
        renderer.fill(&mut out, 0.0);
        assert_eq!(fx.stats.summary().sample_corrections, 1);
        assert_eq!(out[99], 99.0);

        renderer.fill(&mut out, 0.0);
        assert!(out[..10].iter().all(|&s| s == 99.0));
        assert!(out[10..].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_corrected_into() {
        let samples = AudioSamples::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 1000, 2);
        let mut out = Vec::new();
        corrected_into(&samples, 2, &mut out);
        assert_eq!(out, vec![1.0, 2.0, 3.0, 4.0]);
        corrected_into(&samples, 4, &mut out);
        assert_eq!(out, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 5.0, 6.0]);
    }
}
