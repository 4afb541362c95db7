//! Built-in media backend that fabricates decoded streams.
//!
//! Real container stacks are external collaborators; this backend stands in
//! for them the way a placeholder decoder stands in for FFmpeg in builds
//! without one. It parses clip parameters out of the URL itself, so fixture
//! names double as clip definitions:
//!
//! ```text
//! fixtures/10s_60fps_noaudio.mp4      10 s, 60 fps, video only
//! fixtures/5s_440hz_novideo.mp4       5 s, 440 Hz stereo tone, audio only
//! synth:dur=2,fps=30,w=64,h=36        key=value form
//! ```
//!
//! Video frames are 32-bit packed gradient patterns in exactly the
//! negotiated `width*height*4` layout; audio is a stereo sine tone in the
//! format the engine asks for. Both readers are fully seekable.

use std::f64::consts::TAU;

use bytes::Bytes;

use crate::clock::{TICKS_PER_MS, TICKS_PER_SEC};
use crate::error::PlayerError;
use crate::metadata::{StreamDescriptor, StreamKind};
use crate::source::{
    AcceleratorDevice, AcceleratorManager, AudioFormat, MediaBackend, MediaSample, SampleEncoding,
    SampleRead, SourceReader, VideoFormat, VideoReaderConfig,
};

/// Audio block size produced per `read_sample`, in milliseconds.
const AUDIO_BLOCK_MS: u32 = 20;

/// Sine amplitude relative to full scale.
const TONE_AMPLITUDE: f64 = 0.3;

/// Clip parameters decoded from a URL.
#[derive(Debug, Clone, PartialEq)]
pub struct ClipParams {
    pub duration_ticks: i64,
    pub fps_num: u32,
    pub fps_den: u32,
    pub width: u32,
    pub height: u32,
    pub has_video: bool,
    pub has_audio: bool,
    pub tone_hz: u32,
    /// Emit `Pending` every n-th video read (0 = never).
    pub pending_every: u32,
}

impl Default for ClipParams {
    fn default() -> Self {
        Self {
            duration_ticks: 5 * TICKS_PER_SEC,
            fps_num: 30,
            fps_den: 1,
            width: 640,
            height: 360,
            has_video: true,
            has_audio: true,
            tone_hz: 440,
            pending_every: 0,
        }
    }
}

impl ClipParams {
    /// Parses clip parameters from `url`. Unknown tokens are ignored, so
    /// any path-like string yields the default clip.
    pub fn parse(url: &str) -> Self {
        let mut params = Self::default();
        for token in url.split(|c: char| !c.is_ascii_alphanumeric() && c != '=') {
            let token = token.to_ascii_lowercase();
            match token.as_str() {
                "" => continue,
                "noaudio" => params.has_audio = false,
                "novideo" | "audioonly" => params.has_video = false,
                "stereo" => {}
                _ => {
                    if let Some((key, value)) = token.split_once('=') {
                        let Ok(n) = value.parse::<u32>() else {
                            continue;
                        };
                        match key {
                            "dur" => params.duration_ticks = n as i64 * TICKS_PER_SEC,
                            "durms" => params.duration_ticks = n as i64 * TICKS_PER_MS,
                            "fps" => (params.fps_num, params.fps_den) = (n.max(1), 1),
                            "w" => params.width = n,
                            "h" => params.height = n,
                            "tone" => params.tone_hz = n,
                            "audio" => params.has_audio = n != 0,
                            "video" => params.has_video = n != 0,
                            "pending" => params.pending_every = n,
                            _ => {}
                        }
                    } else if let Some(n) = suffixed(&token, "fps") {
                        (params.fps_num, params.fps_den) = (n.max(1), 1);
                    } else if let Some(n) = suffixed(&token, "hz") {
                        params.tone_hz = n;
                    } else if let Some(n) = suffixed(&token, "ms") {
                        params.duration_ticks = n as i64 * TICKS_PER_MS;
                    } else if let Some(n) = suffixed(&token, "s") {
                        params.duration_ticks = n as i64 * TICKS_PER_SEC;
                    }
                }
            }
        }
        params
    }

    fn frame_ticks(&self) -> i64 {
        TICKS_PER_SEC * self.fps_den.max(1) as i64 / self.fps_num.max(1) as i64
    }

    fn descriptors(&self) -> Vec<StreamDescriptor> {
        let mut streams = Vec::new();
        if self.has_video {
            streams.push(StreamDescriptor {
                kind: Some(StreamKind::Video),
                width: Some(self.width),
                height: Some(self.height),
                fps_num: Some(self.fps_num),
                fps_den: Some(self.fps_den),
                ..StreamDescriptor::default()
            });
        }
        if self.has_audio {
            streams.push(StreamDescriptor {
                kind: Some(StreamKind::Audio),
                channels: Some(2),
                sample_rate: Some(48_000),
                ..StreamDescriptor::default()
            });
        }
        streams
    }
}

fn suffixed(token: &str, suffix: &str) -> Option<u32> {
    token.strip_suffix(suffix)?.parse().ok()
}

// ============================================================================
// Backend
// ============================================================================

/// The synthetic [`MediaBackend`].
#[derive(Debug, Default)]
pub struct SyntheticBackend;

impl MediaBackend for SyntheticBackend {
    fn create_accelerator(&self) -> Result<Option<AcceleratorManager>, PlayerError> {
        Ok(Some(AcceleratorManager::new(AcceleratorDevice {
            name: "synthetic-accelerator".to_string(),
            video_decode: true,
            thread_safe: true,
        })))
    }

    fn open_video_reader(
        &self,
        url: &str,
        accelerator: Option<&AcceleratorManager>,
        config: &VideoReaderConfig,
    ) -> Result<Box<dyn SourceReader>, PlayerError> {
        let params = ClipParams::parse(url);
        tracing::info!(
            "synthetic video reader: {} ({}x{} @ {}/{} fps, accel={}, hw_transforms={}, advanced={})",
            url,
            params.width,
            params.height,
            params.fps_num,
            params.fps_den,
            accelerator.map(|a| a.reset_token()).unwrap_or(0),
            config.hardware_transforms,
            config.advanced_processing,
        );
        Ok(Box::new(SyntheticVideoReader::new(params)))
    }

    fn open_audio_reader(
        &self,
        url: &str,
        wanted: &AudioFormat,
    ) -> Result<Box<dyn SourceReader>, PlayerError> {
        let params = ClipParams::parse(url);
        if !params.has_audio {
            return Err(PlayerError::platform(
                0xC00D_36C4_u32 as i64,
                format!("no audio stream in {url}"),
            ));
        }
        tracing::info!(
            "synthetic audio reader: {} ({} Hz tone, {} Hz {}ch output)",
            url,
            params.tone_hz,
            wanted.sample_rate,
            wanted.channels
        );
        Ok(Box::new(SyntheticAudioReader::new(params, wanted.clone())))
    }
}

// ============================================================================
// Video reader
// ============================================================================

#[derive(Debug)]
struct SyntheticVideoReader {
    params: ClipParams,
    /// Next frame's PTS in ticks.
    cursor: i64,
    reads: u32,
}

impl SyntheticVideoReader {
    fn new(params: ClipParams) -> Self {
        Self {
            params,
            cursor: 0,
            reads: 0,
        }
    }

    fn render_frame(&self, index: i64) -> Bytes {
        let (w, h) = (self.params.width as usize, self.params.height as usize);
        let mut pixels = vec![0u8; w * h * 4];
        let shade = (index as u8).wrapping_mul(3);
        for y in 0..h {
            let row = &mut pixels[y * w * 4..(y + 1) * w * 4];
            let g = if h > 1 { (y * 255 / (h - 1)) as u8 } else { 0 };
            for (x, px) in row.chunks_exact_mut(4).enumerate() {
                let r = if w > 1 { (x * 255 / (w - 1)) as u8 } else { 0 };
                px.copy_from_slice(&[r, g, shade, 255]);
            }
        }
        Bytes::from(pixels)
    }
}

impl SourceReader for SyntheticVideoReader {
    fn read_sample(&mut self) -> Result<SampleRead, PlayerError> {
        if !self.params.has_video || self.cursor >= self.params.duration_ticks {
            return Ok(SampleRead::EndOfStream);
        }
        self.reads += 1;
        if self.params.pending_every != 0 && self.reads % self.params.pending_every == 0 {
            return Ok(SampleRead::Pending);
        }
        let frame_ticks = self.params.frame_ticks();
        let pts = self.cursor;
        self.cursor += frame_ticks;
        Ok(SampleRead::Sample(MediaSample {
            pts,
            data: self.render_frame(pts / frame_ticks),
        }))
    }

    fn seek(&mut self, position: i64) -> Result<(), PlayerError> {
        if position < 0 {
            return Err(PlayerError::invalid("negative seek position"));
        }
        // Snap to the preceding frame boundary, like a sync-point seek.
        let frame_ticks = self.params.frame_ticks();
        self.cursor = (position / frame_ticks) * frame_ticks;
        Ok(())
    }

    fn duration(&self) -> Option<i64> {
        Some(self.params.duration_ticks)
    }

    fn video_format(&self) -> Option<VideoFormat> {
        Some(VideoFormat {
            width: if self.params.has_video { self.params.width } else { 0 },
            height: if self.params.has_video { self.params.height } else { 0 },
            fps_num: self.params.fps_num,
            fps_den: self.params.fps_den,
        })
    }

    fn stream_descriptors(&self) -> Vec<StreamDescriptor> {
        self.params.descriptors()
    }
}

// ============================================================================
// Audio reader
// ============================================================================

#[derive(Debug)]
struct SyntheticAudioReader {
    params: ClipParams,
    format: AudioFormat,
    /// Next block's first frame index.
    frame_cursor: i64,
}

impl SyntheticAudioReader {
    fn new(params: ClipParams, format: AudioFormat) -> Self {
        Self {
            params,
            format,
            frame_cursor: 0,
        }
    }

    fn total_frames(&self) -> i64 {
        self.params.duration_ticks * self.format.sample_rate as i64 / TICKS_PER_SEC
    }

    fn block_frames(&self) -> i64 {
        (self.format.sample_rate * AUDIO_BLOCK_MS / 1_000).max(1) as i64
    }

    fn tone_sample(&self, frame: i64) -> f64 {
        let t = frame as f64 / self.format.sample_rate as f64;
        (t * self.params.tone_hz as f64 * TAU).sin() * TONE_AMPLITUDE
    }
}

impl SourceReader for SyntheticAudioReader {
    fn read_sample(&mut self) -> Result<SampleRead, PlayerError> {
        let total = self.total_frames();
        if self.frame_cursor >= total {
            return Ok(SampleRead::EndOfStream);
        }
        let frames = self.block_frames().min(total - self.frame_cursor);
        let channels = self.format.channels as i64;
        let mut data = Vec::with_capacity((frames * channels) as usize * 4);
        for i in 0..frames {
            let value = self.tone_sample(self.frame_cursor + i);
            for _ in 0..channels {
                match self.format.encoding {
                    SampleEncoding::PcmI16 => {
                        let word = (value * i16::MAX as f64) as i16;
                        data.extend_from_slice(&word.to_le_bytes());
                    }
                    SampleEncoding::PcmF32 => {
                        data.extend_from_slice(&(value as f32).to_le_bytes());
                    }
                }
            }
        }
        let pts = self.frame_cursor * TICKS_PER_SEC / self.format.sample_rate as i64;
        self.frame_cursor += frames;
        Ok(SampleRead::Sample(MediaSample {
            pts,
            data: Bytes::from(data),
        }))
    }

    fn seek(&mut self, position: i64) -> Result<(), PlayerError> {
        if position < 0 {
            return Err(PlayerError::invalid("negative seek position"));
        }
        let frame = position * self.format.sample_rate as i64 / TICKS_PER_SEC;
        let block = self.block_frames();
        self.frame_cursor = (frame / block) * block;
        Ok(())
    }

    fn duration(&self) -> Option<i64> {
        Some(self.params.duration_ticks)
    }

    fn audio_format(&self) -> Option<AudioFormat> {
        Some(self.format.clone())
    }

    fn stream_descriptors(&self) -> Vec<StreamDescriptor> {
        self.params.descriptors()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fixture_names() {
        let params = ClipParams::parse("fixtures/10s_60fps_noaudio.mp4");
        assert_eq!(params.duration_ticks, 10 * TICKS_PER_SEC);
        assert_eq!(params.fps_num, 60);
        assert!(!params.has_audio);
        assert!(params.has_video);

        let params = ClipParams::parse("fixtures/5s_440hz_novideo.mp4");
        assert_eq!(params.duration_ticks, 5 * TICKS_PER_SEC);
        assert_eq!(params.tone_hz, 440);
        assert!(!params.has_video);
        assert!(params.has_audio);
    }

    #[test]
    fn test_parse_key_value_form() {
        let params = ClipParams::parse("synth:dur=2,fps=24,w=64,h=36,audio=0");
        assert_eq!(params.duration_ticks, 2 * TICKS_PER_SEC);
        assert_eq!(params.fps_num, 24);
        assert_eq!((params.width, params.height), (64, 36));
        assert!(!params.has_audio);
    }

    #[test]
    fn test_parse_unknown_tokens_default() {
        assert_eq!(ClipParams::parse("movie.mp4"), ClipParams::default());
    }

    #[test]
    fn test_video_reader_frame_sequence() {
        let mut reader = SyntheticVideoReader::new(ClipParams::parse("durms=100,fps=25,w=8,h=8"));
        let mut count = 0;
        let mut last_pts = -1;
        loop {
            match reader.read_sample().unwrap() {
                SampleRead::Sample(sample) => {
                    assert!(sample.pts > last_pts);
                    assert_eq!(sample.data.len(), 8 * 8 * 4);
                    last_pts = sample.pts;
                    count += 1;
                }
                SampleRead::EndOfStream => break,
                SampleRead::Pending => unreachable!(),
            }
        }
        // 100ms at 25fps: frames at 0, 40 and 80 ms
        assert_eq!(count, 3);
        // EOS is sticky until seek.
        assert!(matches!(
            reader.read_sample().unwrap(),
            SampleRead::EndOfStream
        ));
        reader.seek(0).unwrap();
        assert!(matches!(reader.read_sample().unwrap(), SampleRead::Sample(_)));
    }

    #[test]
    fn test_video_seek_snaps_to_frame_boundary() {
        let mut reader = SyntheticVideoReader::new(ClipParams::parse("10s_30fps"));
        let frame_ticks = TICKS_PER_SEC / 30;
        reader.seek(frame_ticks * 7 + 123).unwrap();
        match reader.read_sample().unwrap() {
            SampleRead::Sample(sample) => assert_eq!(sample.pts, frame_ticks * 7),
            other => panic!("expected sample, got {other:?}"),
        }
    }

    #[test]
    fn test_no_video_clip_reports_zero_size_and_eos() {
        let mut reader = SyntheticVideoReader::new(ClipParams::parse("5s_novideo"));
        let fmt = reader.video_format().unwrap();
        assert_eq!((fmt.width, fmt.height), (0, 0));
        assert!(matches!(
            reader.read_sample().unwrap(),
            SampleRead::EndOfStream
        ));
    }

    #[test]
    fn test_pending_injection() {
        let mut reader = SyntheticVideoReader::new(ClipParams::parse("1s,pending=2"));
        assert!(matches!(reader.read_sample().unwrap(), SampleRead::Sample(_)));
        assert!(matches!(reader.read_sample().unwrap(), SampleRead::Pending));
        assert!(matches!(reader.read_sample().unwrap(), SampleRead::Sample(_)));
    }

    #[test]
    fn test_audio_blocks_are_block_aligned() {
        let format = AudioFormat::negotiation_target();
        let mut reader = SyntheticAudioReader::new(ClipParams::parse("durms=50"), format.clone());
        let mut total_frames = 0;
        loop {
            match reader.read_sample().unwrap() {
                SampleRead::Sample(sample) => {
                    assert_eq!(sample.data.len() % format.block_align as usize, 0);
                    total_frames += format.frames_in(sample.data.len());
                }
                SampleRead::EndOfStream => break,
                SampleRead::Pending => unreachable!(),
            }
        }
        // 50ms at 48kHz
        assert_eq!(total_frames, 2_400);
    }

    #[test]
    fn test_audio_pts_matches_cursor() {
        let format = AudioFormat::negotiation_target();
        let mut reader = SyntheticAudioReader::new(ClipParams::parse("1s"), format);
        let SampleRead::Sample(first) = reader.read_sample().unwrap() else {
            panic!("expected sample");
        };
        assert_eq!(first.pts, 0);
        let SampleRead::Sample(second) = reader.read_sample().unwrap() else {
            panic!("expected sample");
        };
        assert_eq!(second.pts, AUDIO_BLOCK_MS as i64 * TICKS_PER_MS);
    }

    #[test]
    fn test_backend_audio_open_fails_without_audio() {
        let backend = SyntheticBackend;
        let err = backend
            .open_audio_reader("10s_noaudio", &AudioFormat::negotiation_target())
            .unwrap_err();
        assert!(matches!(err, PlayerError::Platform { .. }));
    }
}
