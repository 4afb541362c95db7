//! Abstract container/codec stack: formats, samples, and reader traits.
//!
//! The engine never talks to a demuxer directly. A [`MediaBackend`] opens
//! independent, seekable demux+decode pipelines ([`SourceReader`]) over a
//! URL — one restricted to the first video stream, one to the first audio
//! stream — so the audio thread and the video consumer each own a private
//! cursor. The backend also supplies the opaque hardware-accelerator
//! manager shared with video readers.
//!
//! [`crate::synthetic::SyntheticBackend`] is the built-in implementation;
//! host applications wire a real container stack by implementing these
//! traits and passing them to [`crate::platform::initialize`].

use bytes::Bytes;

use crate::error::PlayerError;
use crate::metadata::StreamDescriptor;

/// Sample encoding of an audio stream on the engine boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleEncoding {
    /// Signed 16-bit integer PCM, interleaved.
    PcmI16,
    /// 32-bit float PCM, interleaved.
    PcmF32,
}

impl SampleEncoding {
    /// Bytes per sample word.
    pub fn sample_bytes(&self) -> u16 {
        match self {
            SampleEncoding::PcmI16 => 2,
            SampleEncoding::PcmF32 => 4,
        }
    }

    /// Bits per sample word.
    pub fn bits_per_sample(&self) -> u16 {
        self.sample_bytes() * 8
    }
}

/// Negotiated audio output format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFormat {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Channel count (interleaved).
    pub channels: u16,
    /// Sample encoding.
    pub encoding: SampleEncoding,
    /// Bytes per audio frame (all channels for one instant).
    pub block_align: u16,
    /// Average byte rate, `sample_rate * block_align`.
    pub avg_bytes_per_sec: u32,
}

impl AudioFormat {
    /// The negotiation target: 48 kHz, 16-bit signed, stereo.
    pub fn negotiation_target() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
            encoding: SampleEncoding::PcmI16,
            block_align: 4,
            avg_bytes_per_sec: 192_000,
        }
    }

    /// Frames contained in `bytes` of payload.
    pub fn frames_in(&self, bytes: usize) -> u32 {
        if self.block_align == 0 {
            0
        } else {
            (bytes / self.block_align as usize) as u32
        }
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::negotiation_target()
    }
}

/// Negotiated video output format.
///
/// Frames are 32-bit packed color, row-major, tightly packed to
/// `width * 4` bytes per row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoFormat {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Frame-rate ratio numerator.
    pub fps_num: u32,
    /// Frame-rate ratio denominator.
    pub fps_den: u32,
}

impl VideoFormat {
    /// Bytes in one tightly-packed frame.
    pub fn frame_bytes(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }

    /// Milliseconds per frame, defaulting to 30/1 when the rate is unknown.
    pub fn frame_time_ms(&self) -> f64 {
        let (num, den) = if self.fps_num == 0 || self.fps_den == 0 {
            (30, 1)
        } else {
            (self.fps_num, self.fps_den)
        };
        1_000.0 * den as f64 / num as f64
    }
}

/// A decoded, contiguous sample with its presentation timestamp.
#[derive(Debug, Clone)]
pub struct MediaSample {
    /// Presentation timestamp in 100-ns ticks.
    pub pts: i64,
    /// Contiguous payload: `width*height*4` bytes for video, a multiple of
    /// the block-align for audio.
    pub data: Bytes,
}

/// Outcome of a single [`SourceReader::read_sample`] call.
#[derive(Debug, Clone)]
pub enum SampleRead {
    /// A decoded sample.
    Sample(MediaSample),
    /// No sample produced yet, but the stream is not finished. Callers
    /// yield briefly and retry.
    Pending,
    /// The stream has ended.
    EndOfStream,
}

/// An independent, seekable demux+decode cursor over one stream of a URL.
pub trait SourceReader: Send + std::fmt::Debug {
    /// Pulls the next sample from the selected stream.
    fn read_sample(&mut self) -> Result<SampleRead, PlayerError>;

    /// Repositions the cursor to `position` ticks (nearest preceding
    /// sync point) and clears any end-of-stream condition.
    fn seek(&mut self, position: i64) -> Result<(), PlayerError>;

    /// Total duration of the presentation, in ticks, when known.
    fn duration(&self) -> Option<i64>;

    /// The negotiated video output format, for video readers.
    fn video_format(&self) -> Option<VideoFormat> {
        None
    }

    /// The actually negotiated audio output format, for audio readers.
    fn audio_format(&self) -> Option<AudioFormat> {
        None
    }

    /// Descriptors for every stream in the container, for metadata queries.
    fn stream_descriptors(&self) -> Vec<StreamDescriptor>;
}

/// Opaque hardware-accelerator device created by the backend.
#[derive(Debug, Clone)]
pub struct AcceleratorDevice {
    /// Backend-specific adapter name, for logs.
    pub name: String,
    /// Device was created with video-decode capability.
    pub video_decode: bool,
    /// Multithread protection enabled on the device.
    pub thread_safe: bool,
}

/// Reset-token manager wrapping the accelerator device, shared with every
/// video reader of the process.
#[derive(Debug)]
pub struct AcceleratorManager {
    device: AcceleratorDevice,
    reset_token: u32,
}

impl AcceleratorManager {
    /// Wraps `device` and assigns it a fresh reset token.
    pub fn new(device: AcceleratorDevice) -> Self {
        use std::sync::atomic::{AtomicU32, Ordering};
        static NEXT_TOKEN: AtomicU32 = AtomicU32::new(1);
        Self {
            device,
            reset_token: NEXT_TOKEN.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn device(&self) -> &AcceleratorDevice {
        &self.device
    }

    pub fn reset_token(&self) -> u32 {
        self.reset_token
    }
}

/// Configuration for creating a video reader.
#[derive(Debug, Clone, Default)]
pub struct VideoReaderConfig {
    /// Enable hardware transforms in the reader pipeline.
    pub hardware_transforms: bool,
    /// Enable the backend's advanced video processing path.
    pub advanced_processing: bool,
}

impl VideoReaderConfig {
    /// The configuration `open` uses: everything on.
    pub fn accelerated() -> Self {
        Self {
            hardware_transforms: true,
            advanced_processing: true,
        }
    }
}

/// Factory for source readers and the accelerator device.
///
/// Implementations must be cheap to clone behind an `Arc` and callable from
/// any thread; the engine opens the video and audio readers back to back on
/// the consumer thread.
pub trait MediaBackend: Send + Sync {
    /// Creates the process-wide accelerator device, if the backend has one.
    fn create_accelerator(&self) -> Result<Option<AcceleratorManager>, PlayerError> {
        Ok(None)
    }

    /// Opens a reader restricted to the first video stream of `url`,
    /// negotiated to 32-bit packed color output.
    fn open_video_reader(
        &self,
        url: &str,
        accelerator: Option<&AcceleratorManager>,
        config: &VideoReaderConfig,
    ) -> Result<Box<dyn SourceReader>, PlayerError>;

    /// Opens an independent, unaccelerated reader restricted to the first
    /// audio stream of `url`, negotiated as close to `wanted` as the
    /// container allows. The actual format is read back from the reader.
    fn open_audio_reader(
        &self,
        url: &str,
        wanted: &AudioFormat,
    ) -> Result<Box<dyn SourceReader>, PlayerError>;
}
