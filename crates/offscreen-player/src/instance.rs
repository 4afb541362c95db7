//! Playback instances: lifecycle, the video read path, playback control,
//! and the seek coordinator.
//!
//! A [`Player`] is the ownership root for everything one playback needs:
//! both source readers, the audio client and its render thread, the locked
//! video frame, and the clock. The consumer thread drives the synchronous
//! API; the audio thread runs free and only meets the consumer at the
//! clock mutex and the `seek_in_progress` fence.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::audio_render::{spawn_audio_thread, AudioThreadParams};
use crate::clock::{monotonic_ms, precise_sleep, ticks_to_ms, PlaybackClock, TICKS_PER_MS};
use crate::endpoint::{peak_to_percent, AudioClient, DEFAULT_BUFFER_MS};
use crate::error::PlayerError;
use crate::metadata::{MediaInfo, StreamKind};
use crate::platform::{self, HostServices};
use crate::source::{
    AudioFormat, SampleRead, SourceReader, VideoFormat, VideoReaderConfig,
};

/// A video frame is dropped when it is more than this many frame times
/// behind the master clock.
const SKIP_BEHIND_FRAMES: f64 = 3.0;

/// Cap on the audio-driven wait-ahead, in frame times.
const AUDIO_WAIT_CAP_FRAMES: f64 = 2.0;

/// Cap on the wall-clock wait-ahead, in frame times.
const WALL_WAIT_CAP_FRAMES: f64 = 1.5;

/// How long `close` waits for the audio thread to honor its stop flag.
const AUDIO_STOP_TIMEOUT: Duration = Duration::from_secs(1);

// ============================================================================
// Shared playback state
// ============================================================================

/// State shared between the consumer thread and the audio thread.
pub(crate) struct PlaybackShared {
    /// The master clock; the only mutex both threads take.
    pub(crate) clock: Mutex<PlaybackClock>,
    /// Software volume, f32 bits, clamped to [0, 1].
    volume_bits: AtomicU32,
    /// Playback speed, f32 bits, clamped to [0.5, 2].
    speed_bits: AtomicU32,
    /// Cooperative run flag; the audio thread exists iff this is set.
    pub(crate) audio_thread_running: AtomicBool,
    /// Signalled by the controller when audio may begin (and re-signalled
    /// after seeks and on shutdown to wake the thread).
    pub(crate) start_gate: crate::endpoint::AutoResetEvent,
}

impl PlaybackShared {
    fn new() -> Self {
        Self {
            clock: Mutex::new(PlaybackClock::new()),
            volume_bits: AtomicU32::new(1.0f32.to_bits()),
            speed_bits: AtomicU32::new(1.0f32.to_bits()),
            audio_thread_running: AtomicBool::new(false),
            start_gate: crate::endpoint::AutoResetEvent::new(),
        }
    }

    pub(crate) fn volume(&self) -> f32 {
        f32::from_bits(self.volume_bits.load(Ordering::Relaxed))
    }

    fn set_volume(&self, volume: f32) {
        let clamped = volume.max(0.0).min(1.0);
        self.volume_bits.store(clamped.to_bits(), Ordering::Relaxed);
    }

    pub(crate) fn speed(&self) -> f32 {
        f32::from_bits(self.speed_bits.load(Ordering::Relaxed))
    }

    fn set_speed(&self, speed: f32) {
        let clamped = speed.max(0.5).min(2.0);
        self.speed_bits.store(clamped.to_bits(), Ordering::Relaxed);
    }
}

// ============================================================================
// Frame lease
// ============================================================================

/// The single buffer currently leased to the consumer.
struct LockedFrame {
    data: Bytes,
    current_size: usize,
    pts: i64,
}

/// A read-only view of the locked frame, valid until the next
/// [`Player::read_video_frame`] or [`Player::unlock_video_frame`].
#[derive(Debug)]
pub struct FrameRef<'a> {
    /// 32-bit packed color pixels, row-major, stride = `width * 4`.
    pub data: &'a [u8],
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Presentation timestamp in 100-ns ticks.
    pub pts: i64,
}

/// Outcome of one [`Player::read_video_frame`] call.
#[derive(Debug)]
pub enum VideoFrameRead<'a> {
    /// A frame, leased until the next read or unlock.
    Frame(FrameRef<'a>),
    /// The decoder produced nothing this call; try again.
    NotReady,
    /// The video stream has ended. Terminal until `seek` or `open`.
    EndOfStream,
}

// ============================================================================
// Player
// ============================================================================

/// One independent playback instance.
///
/// Dropping the player closes any open media, stops its audio thread, and
/// deregisters it from the platform host.
pub struct Player {
    services: HostServices,

    video_reader: Option<Box<dyn SourceReader>>,
    audio_reader: Option<Arc<Mutex<Box<dyn SourceReader>>>>,
    video_format: Option<VideoFormat>,
    audio_format: Option<AudioFormat>,
    audio_client: Option<Arc<AudioClient>>,
    audio_thread: Option<std::thread::JoinHandle<()>>,

    shared: Arc<PlaybackShared>,
    locked_frame: Option<LockedFrame>,

    has_audio: bool,
    eof: bool,
    playing: bool,
    loading: bool,
}

impl Player {
    /// Creates an instance. Fails with `NotInitialized` before
    /// [`platform::initialize`].
    pub fn new() -> Result<Self, PlayerError> {
        let services = platform::register_instance()?;
        Ok(Self {
            services,
            video_reader: None,
            audio_reader: None,
            video_format: None,
            audio_format: None,
            audio_client: None,
            audio_thread: None,
            shared: Arc::new(PlaybackShared::new()),
            locked_frame: None,
            has_audio: false,
            eof: false,
            playing: false,
            loading: false,
        })
    }

    // ------------------------------------------------------------------
    // Media lifecycle
    // ------------------------------------------------------------------

    /// Opens `url`, implicitly closing any previously opened media.
    ///
    /// Video setup failures are fatal; audio setup failures downgrade the
    /// instance to video-only and `open` still succeeds.
    pub fn open(&mut self, url: &str) -> Result<(), PlayerError> {
        if url.is_empty() {
            return Err(PlayerError::invalid("empty url"));
        }
        self.close();
        self.loading = true;
        let result = self.open_inner(url);
        self.loading = false;
        if result.is_err() {
            self.close();
        }
        result
    }

    fn open_inner(&mut self, url: &str) -> Result<(), PlayerError> {
        let config = VideoReaderConfig::accelerated();
        let video_reader = self.services.backend.open_video_reader(
            url,
            self.services.accelerator.as_deref(),
            &config,
        )?;
        let video_format = video_reader
            .video_format()
            .ok_or_else(|| PlayerError::platform(-1, "video reader reported no output format"))?;
        info!(
            "opened video: {}x{} @ {}/{}",
            video_format.width, video_format.height, video_format.fps_num, video_format.fps_den
        );
        self.video_reader = Some(video_reader);
        self.video_format = Some(video_format);

        if let Err(err) = self.setup_audio(url) {
            warn!("audio setup failed, continuing video-only: {err}");
            self.audio_reader = None;
            self.audio_format = None;
            self.audio_client = None;
            self.has_audio = false;
        }
        Ok(())
    }

    fn setup_audio(&mut self, url: &str) -> Result<(), PlayerError> {
        let wanted = AudioFormat::negotiation_target();
        let reader = self.services.backend.open_audio_reader(url, &wanted)?;
        let actual = reader
            .audio_format()
            .ok_or_else(|| PlayerError::platform(-1, "audio reader reported no output format"))?;
        let device = self.services.enumerator.default_device()?;
        let client = Arc::new(device.activate_client(&actual, DEFAULT_BUFFER_MS)?);
        info!(
            "audio on '{}': {} Hz, {} ch, block align {}",
            device.name(),
            actual.sample_rate,
            actual.channels,
            actual.block_align
        );

        let reader = Arc::new(Mutex::new(reader));
        self.audio_thread = Some(spawn_audio_thread(AudioThreadParams {
            shared: self.shared.clone(),
            reader: reader.clone(),
            client: client.clone(),
        }));
        self.audio_reader = Some(reader);
        self.audio_format = Some(actual);
        self.audio_client = Some(client);
        self.has_audio = true;
        self.shared.start_gate.set();
        Ok(())
    }

    /// Tears down the open media but keeps the instance.
    pub fn close(&mut self) {
        self.stop_audio_thread();
        self.locked_frame = None;
        if let Some(client) = &self.audio_client {
            let _ = client.stop();
        }
        // Release order: audio client (ring + render view + device), then
        // both readers, then the cached formats.
        self.audio_client = None;
        self.audio_reader = None;
        self.video_reader = None;
        self.audio_format = None;
        self.video_format = None;
        self.has_audio = false;
        self.eof = false;
        self.playing = false;
        self.shared.clock.lock().reset();
        self.shared.set_speed(1.0);
    }

    fn stop_audio_thread(&mut self) {
        self.shared
            .audio_thread_running
            .store(false, Ordering::Release);
        self.shared.start_gate.set();
        let Some(handle) = self.audio_thread.take() else {
            return;
        };
        let deadline = Instant::now() + AUDIO_STOP_TIMEOUT;
        while !handle.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        if handle.is_finished() || !self.services.detach_stuck_audio_thread {
            if handle.join().is_err() {
                warn!("audio thread panicked");
            }
        } else {
            // Opt-in escape hatch; the thread re-checks its run flag at
            // least every 10 ms, so this path means something is wedged
            // below us.
            warn!("audio thread missed its stop deadline, detaching");
        }
    }

    // ------------------------------------------------------------------
    // Video read path
    // ------------------------------------------------------------------

    /// Pulls the next video frame, pacing and dropping against the master
    /// clock. A previously leased frame is released on entry.
    pub fn read_video_frame(&mut self) -> Result<VideoFrameRead<'_>, PlayerError> {
        self.locked_frame = None;

        let video_format = self.video_format.ok_or(PlayerError::NotInitialized)?;
        if self.eof {
            return Ok(VideoFrameRead::EndOfStream);
        }

        let reader = self.video_reader.as_mut().ok_or(PlayerError::NotInitialized)?;
        let sample = match reader.read_sample()? {
            SampleRead::Sample(sample) => sample,
            SampleRead::Pending => return Ok(VideoFrameRead::NotReady),
            SampleRead::EndOfStream => {
                self.eof = true;
                return Ok(VideoFrameRead::EndOfStream);
            }
        };

        let speed = self.shared.speed();
        let frame_time_ms = video_format.frame_time_ms();
        let (master, elapsed_ticks) = {
            let mut clock = self.shared.clock.lock();
            clock.current_position = sample.pts;
            (
                clock.master_position,
                clock.effective_elapsed_ticks(monotonic_ms(), speed),
            )
        };

        if self.has_audio && master > 0 {
            // Audio-driven mode: slave to the master clock.
            let diff_ticks = sample.pts - (master as f64 * speed as f64) as i64;
            let skip_threshold = -(frame_time_ms * SKIP_BEHIND_FRAMES * TICKS_PER_MS as f64) as i64;
            if diff_ticks > 0 {
                let cap = AUDIO_WAIT_CAP_FRAMES * frame_time_ms / speed as f64;
                precise_sleep((ticks_to_ms(diff_ticks) as f64).min(cap));
            } else if diff_ticks < skip_threshold {
                debug!(
                    "dropping late video frame: pts {} is {} ms behind",
                    sample.pts,
                    ticks_to_ms(-diff_ticks)
                );
                return Ok(VideoFrameRead::NotReady);
            }
        } else if sample.pts > elapsed_ticks {
            // Video-only mode: slave to the wall clock.
            let cap = WALL_WAIT_CAP_FRAMES * frame_time_ms / speed as f64;
            precise_sleep((ticks_to_ms(sample.pts - elapsed_ticks) as f64).min(cap));
        }

        let current_size = sample.data.len();
        let frame = self.locked_frame.insert(LockedFrame {
            data: sample.data,
            current_size,
            pts: sample.pts,
        });
        Ok(VideoFrameRead::Frame(FrameRef {
            data: &frame.data[..frame.current_size],
            width: video_format.width,
            height: video_format.height,
            pts: frame.pts,
        }))
    }

    /// Releases the leased frame. Idempotent.
    pub fn unlock_video_frame(&mut self) {
        self.locked_frame = None;
    }

    // ------------------------------------------------------------------
    // Playback control
    // ------------------------------------------------------------------

    /// Play/pause/stop in one call: `stop` wins over `playing`.
    pub fn set_playback_state(&mut self, playing: bool, stop: bool) -> Result<(), PlayerError> {
        if self.video_reader.is_none() {
            return Err(PlayerError::NotInitialized);
        }
        if stop {
            self.stop()
        } else if playing {
            self.play()
        } else {
            self.pause()
        }
    }

    /// Starts or resumes playback.
    pub fn play(&mut self) -> Result<(), PlayerError> {
        if self.video_reader.is_none() {
            return Err(PlayerError::NotInitialized);
        }
        let now = monotonic_ms();
        {
            let mut clock = self.shared.clock.lock();
            clock.start_segment(now);
            clock.end_pause(now);
        }
        if let Some(client) = &self.audio_client {
            client.start()?;
        }
        self.shared.start_gate.set();
        self.playing = true;
        Ok(())
    }

    /// Pauses playback, freezing the derived clock.
    pub fn pause(&mut self) -> Result<(), PlayerError> {
        if self.video_reader.is_none() {
            return Err(PlayerError::NotInitialized);
        }
        self.shared.clock.lock().begin_pause(monotonic_ms());
        if let Some(client) = &self.audio_client {
            client.stop()?;
        }
        self.playing = false;
        Ok(())
    }

    /// Full stop: playback state and clock return to their initial values.
    pub fn stop(&mut self) -> Result<(), PlayerError> {
        if let Some(client) = &self.audio_client {
            client.stop()?;
        }
        self.shared.clock.lock().stop_segment();
        self.playing = false;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Seek coordinator
    // ------------------------------------------------------------------

    /// Seeks both readers to `target` ticks without tearing down the
    /// pipeline. Preserves the playing/paused state exactly.
    pub fn seek(&mut self, target: i64) -> Result<(), PlayerError> {
        if target < 0 {
            return Err(PlayerError::invalid("negative seek target"));
        }
        if self.video_reader.is_none() {
            return Err(PlayerError::NotInitialized);
        }

        {
            let mut clock = self.shared.clock.lock();
            clock.seek_in_progress = true;
            if clock.pause_start_wall != 0 {
                // Keep later resume accounting correct across the seek.
                clock.pause_start_wall = monotonic_ms();
            }
        }
        self.locked_frame = None;

        let was_playing = self.playing;
        if let Some(client) = &self.audio_client {
            if let Err(err) = client.stop() {
                warn!("audio client stop before seek failed: {err}");
            }
            // Give the render loop a beat to observe the suspension.
            precise_sleep(5.0);
        }

        if let Err(err) = self
            .video_reader
            .as_mut()
            .expect("checked above")
            .seek(target)
        {
            self.shared.clock.lock().seek_in_progress = false;
            return Err(err);
        }
        if let Some(reader) = &self.audio_reader {
            if let Err(err) = reader.lock().seek(target) {
                warn!("audio seek to {target} failed, continuing: {err}");
            }
        }
        if let Some(client) = &self.audio_client {
            client.reset();
        }

        {
            let mut clock = self.shared.clock.lock();
            clock.rebase_after_seek(target, monotonic_ms());
            clock.seek_in_progress = false;
        }
        self.eof = false;

        if was_playing {
            if let Some(client) = &self.audio_client {
                let _ = client.start();
            }
        }
        self.respawn_audio_thread_if_exited();
        self.shared.start_gate.set();
        debug!("seek to {} ms complete", ticks_to_ms(target));
        Ok(())
    }

    /// The render thread exits when its stream drains; seeking backwards
    /// afterwards brings audio back by spawning a fresh thread over the
    /// shared reader.
    fn respawn_audio_thread_if_exited(&mut self) {
        if !self.has_audio || self.shared.audio_thread_running.load(Ordering::Acquire) {
            return;
        }
        if let Some(handle) = self.audio_thread.take() {
            let _ = handle.join();
        }
        if let (Some(reader), Some(client)) = (&self.audio_reader, &self.audio_client) {
            self.audio_thread = Some(spawn_audio_thread(AudioThreadParams {
                shared: self.shared.clone(),
                reader: reader.clone(),
                client: client.clone(),
            }));
        }
    }

    // ------------------------------------------------------------------
    // Volume, speed, metering
    // ------------------------------------------------------------------

    /// Stores the software volume, clamped to [0, 1].
    pub fn set_volume(&self, volume: f32) {
        self.shared.set_volume(volume);
    }

    /// The clamped volume.
    pub fn volume(&self) -> f32 {
        self.shared.volume()
    }

    /// Stores the playback speed, clamped to [0.5, 2].
    pub fn set_speed(&self, speed: f32) {
        self.shared.set_speed(speed);
    }

    /// The clamped playback speed.
    pub fn speed(&self) -> f32 {
        self.shared.speed()
    }

    /// Per-channel output levels in percent, from the endpoint meter.
    pub fn audio_levels(&self) -> Result<(f32, f32), PlayerError> {
        let client = self.audio_client.as_ref().ok_or(PlayerError::NotInitialized)?;
        let (left, right) = client.channel_peaks();
        Ok((peak_to_percent(left), peak_to_percent(right)))
    }

    // ------------------------------------------------------------------
    // Metadata & queries
    // ------------------------------------------------------------------

    /// Presentation duration in 100-ns ticks.
    pub fn duration(&self) -> Result<i64, PlayerError> {
        if let Some(duration) = self.video_reader.as_ref().and_then(|r| r.duration()) {
            return Ok(duration);
        }
        if let Some(reader) = &self.audio_reader {
            if let Some(duration) = reader.lock().duration() {
                return Ok(duration);
            }
        }
        Err(PlayerError::NotInitialized)
    }

    /// Last presented video position in 100-ns ticks.
    pub fn position(&self) -> i64 {
        self.shared.clock.lock().current_position
    }

    /// Negotiated frame size.
    pub fn video_size(&self) -> Result<(u32, u32), PlayerError> {
        let format = self.video_format.ok_or(PlayerError::NotInitialized)?;
        Ok((format.width, format.height))
    }

    /// Frame-rate ratio of the current media type.
    pub fn video_frame_rate(&self) -> Result<(u32, u32), PlayerError> {
        let format = self.video_format.ok_or(PlayerError::NotInitialized)?;
        Ok((format.fps_num, format.fps_den))
    }

    /// Structured metadata built from both readers' stream descriptors.
    pub fn media_info(&self) -> Result<MediaInfo, PlayerError> {
        let reader = self.video_reader.as_ref().ok_or(PlayerError::NotInitialized)?;
        let mut descriptors = reader.stream_descriptors();
        let duration = self.duration().ok();
        if !descriptors.iter().any(|d| d.kind == Some(StreamKind::Audio)) {
            if let Some(audio) = &self.audio_reader {
                descriptors.extend(
                    audio
                        .lock()
                        .stream_descriptors()
                        .into_iter()
                        .filter(|d| d.kind == Some(StreamKind::Audio)),
                );
            }
        }
        Ok(MediaInfo::from_descriptors(&descriptors, duration))
    }

    /// The audio format actually in use, when audio is active.
    pub fn audio_format(&self) -> Option<&AudioFormat> {
        self.audio_format.as_ref()
    }

    /// Whether the open media carries a playable audio stream.
    pub fn has_audio(&self) -> bool {
        self.has_audio
    }

    /// Whether the video stream has reported end-of-stream.
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Whether an `open` call is currently in flight.
    pub fn is_loading(&self) -> bool {
        self.loading
    }

    /// Whether playback is running (not paused, not stopped).
    pub fn is_playing(&self) -> bool {
        self.playing
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.close();
    }
}
