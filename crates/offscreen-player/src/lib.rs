//! offscreen-player: embeddable media playback without a window.
//!
//! This crate decodes a container (file path or URL) into a stream of
//! uncompressed 32-bit video frames pulled by the embedding application,
//! while a per-instance render thread feeds the decoded audio into the
//! platform's shared-mode audio endpoint and keeps both streams aligned on
//! an audio-derived master clock. Any number of independent instances can
//! coexist in one process.
//!
//! # Architecture
//!
//! ```text
//! url ──► [video reader] ──► read_video_frame ──► consumer
//! url ──► [audio reader] ──► audio thread ──► endpoint ring ──► device
//!                                 │
//!                                 └──► master clock ◄── video pacing/drop
//! ```
//!
//! The media is opened twice so the audio thread and the video consumer
//! each own an independent demux cursor; only the seek coordinator ever
//! resynchronizes them.
//!
//! # Example
//!
//! ```
//! use offscreen_player::{platform, Player, VideoFrameRead};
//!
//! # fn main() -> Result<(), offscreen_player::PlayerError> {
//! platform::initialize_default()?;
//! let mut player = Player::new()?;
//! player.open("fixtures/2s_30fps_noaudio.mp4")?;
//! player.play()?;
//! match player.read_video_frame()? {
//!     VideoFrameRead::Frame(frame) => {
//!         // frame.data is width*height*4 packed color bytes
//!         assert_eq!(frame.data.len(), (frame.width * frame.height * 4) as usize);
//!     }
//!     VideoFrameRead::NotReady | VideoFrameRead::EndOfStream => {}
//! }
//! drop(player);
//! platform::shutdown()?;
//! # Ok(())
//! # }
//! ```
//!
//! # Collaborators
//!
//! The container/codec stack and the audio endpoint are abstract: wire a
//! real demuxer by implementing [`source::MediaBackend`] and a real audio
//! device by implementing [`endpoint::EndpointEnumerator`], then pass both
//! to [`platform::initialize`]. Out of the box the crate ships the
//! [`synthetic::SyntheticBackend`] clip generator, an in-memory
//! [`endpoint::loopback`] endpoint, and — behind the `system-audio`
//! feature — a cpal-backed system endpoint.

mod audio_render;
pub mod clock;
pub mod endpoint;
pub mod error;
pub mod instance;
pub mod metadata;
pub mod platform;
pub mod source;
pub mod synthetic;
#[cfg(feature = "system-audio")]
pub mod system_audio;

pub use clock::{TICKS_PER_MS, TICKS_PER_SEC};
pub use error::PlayerError;
pub use instance::{FrameRef, Player, VideoFrameRead};
pub use metadata::{CodecId, MediaInfo, StreamInfo, StreamKind};
pub use source::{AudioFormat, MediaSample, SampleEncoding, SampleRead, VideoFormat};
