//! Stream descriptors and the structured metadata query.

/// Major type of a container stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Video,
    Audio,
    /// Subtitles, data tracks, anything the engine does not decode.
    Other,
}

/// Codec identifiers the metadata query knows how to describe.
///
/// The set mirrors the fixed subtype table of the original decoder stack;
/// anything outside it surfaces as `None` in [`StreamInfo::mime`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecId {
    H264,
    Hevc,
    Vp9,
    Av1,
    Mpeg4,
    Wmv3,
    Aac,
    Mp3,
    Pcm,
    Flac,
    Opus,
}

impl CodecId {
    /// MIME string for the codec.
    pub fn mime(&self) -> &'static str {
        match self {
            CodecId::H264 => "video/avc",
            CodecId::Hevc => "video/hevc",
            CodecId::Vp9 => "video/x-vnd.on2.vp9",
            CodecId::Av1 => "video/av01",
            CodecId::Mpeg4 => "video/mp4v-es",
            CodecId::Wmv3 => "video/x-ms-wmv",
            CodecId::Aac => "audio/mp4a-latm",
            CodecId::Mp3 => "audio/mpeg",
            CodecId::Pcm => "audio/raw",
            CodecId::Flac => "audio/flac",
            CodecId::Opus => "audio/opus",
        }
    }

    /// Whether this is a video codec.
    pub fn is_video(&self) -> bool {
        matches!(
            self,
            CodecId::H264
                | CodecId::Hevc
                | CodecId::Vp9
                | CodecId::Av1
                | CodecId::Mpeg4
                | CodecId::Wmv3
        )
    }
}

/// Raw per-stream facts reported by a [`crate::source::SourceReader`].
#[derive(Debug, Clone, Default)]
pub struct StreamDescriptor {
    pub kind: Option<StreamKind>,
    pub codec: Option<CodecId>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps_num: Option<u32>,
    pub fps_den: Option<u32>,
    pub channels: Option<u16>,
    pub sample_rate: Option<u32>,
}

/// One stream of the structured metadata record. Fields that the container
/// did not report stay `None`.
#[derive(Debug, Clone, Default)]
pub struct StreamInfo {
    pub kind: Option<StreamKind>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps_num: Option<u32>,
    pub fps_den: Option<u32>,
    pub mime: Option<&'static str>,
    pub channels: Option<u16>,
    pub sample_rate: Option<u32>,
}

/// Structured metadata for an open media, built by traversing both
/// readers' stream descriptors.
#[derive(Debug, Clone, Default)]
pub struct MediaInfo {
    pub streams: Vec<StreamInfo>,
    /// Presentation duration in 100-ns ticks, when known.
    pub duration: Option<i64>,
}

impl MediaInfo {
    /// Populates per-kind fields from raw descriptors: video streams get
    /// dimensions, frame rate, and the MIME mapping; audio streams get
    /// channel count and sample rate.
    pub fn from_descriptors(descriptors: &[StreamDescriptor], duration: Option<i64>) -> Self {
        let streams = descriptors
            .iter()
            .map(|d| {
                let mut info = StreamInfo {
                    kind: d.kind,
                    mime: d.codec.map(|c| c.mime()),
                    ..StreamInfo::default()
                };
                match d.kind {
                    Some(StreamKind::Video) => {
                        info.width = d.width;
                        info.height = d.height;
                        info.fps_num = d.fps_num;
                        info.fps_den = d.fps_den;
                    }
                    Some(StreamKind::Audio) => {
                        info.channels = d.channels;
                        info.sample_rate = d.sample_rate;
                    }
                    _ => {}
                }
                info
            })
            .collect();
        Self { streams, duration }
    }

    /// First video stream, if any.
    pub fn video(&self) -> Option<&StreamInfo> {
        self.streams
            .iter()
            .find(|s| s.kind == Some(StreamKind::Video))
    }

    /// First audio stream, if any.
    pub fn audio(&self) -> Option<&StreamInfo> {
        self.streams
            .iter()
            .find(|s| s.kind == Some(StreamKind::Audio))
    }
}
