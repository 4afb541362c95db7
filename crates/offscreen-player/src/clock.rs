//! Master clock, pause accounting, and timing helpers.
//!
//! The engine keeps all timestamps in the decoder's native 100-nanosecond
//! ticks and only converts to milliseconds at the sync-decision boundary.
//! One `PlaybackClock` lives behind a single mutex per instance; both the
//! audio thread and the consumer thread take brief locks on it and never
//! hold it across a `read_sample` call.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Decoder timestamp ticks per millisecond (100 ns units).
pub const TICKS_PER_MS: i64 = 10_000;

/// Decoder timestamp ticks per second.
pub const TICKS_PER_SEC: i64 = TICKS_PER_MS * 1_000;

/// Converts 100-ns ticks to whole milliseconds.
#[inline]
pub fn ticks_to_ms(ticks: i64) -> i64 {
    ticks / TICKS_PER_MS
}

/// Converts milliseconds to 100-ns ticks.
#[inline]
pub fn ms_to_ticks(ms: i64) -> i64 {
    ms * TICKS_PER_MS
}

/// Milliseconds since an arbitrary process-local epoch, monotonic.
pub fn monotonic_ms() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
}

/// Sleeps for `ms` milliseconds without undersleeping.
///
/// Requests of 0.1 ms or less return immediately. Longer requests use a
/// coarse kernel sleep that stops ~1 ms short of the target, then a spin
/// tail up to the exact deadline. The spin keeps the worst-case oversleep
/// well under a scheduler quantum, which the A/V sync math depends on.
pub fn precise_sleep(ms: f64) {
    if ms <= 0.1 {
        return;
    }
    let target = Duration::from_secs_f64(ms / 1_000.0);
    let start = Instant::now();
    if target > Duration::from_millis(2) {
        std::thread::sleep(target - Duration::from_millis(1));
    }
    while start.elapsed() < target {
        std::hint::spin_loop();
    }
}

/// Per-instance playback clock.
///
/// `master_position` is written by the audio thread from consumed sample
/// timestamps (the audio-derived master mode); `current_position` tracks
/// the last video sample handed to the consumer and backs the position
/// query. Wall-clock fields are in [`monotonic_ms`] milliseconds.
#[derive(Debug, Default)]
pub struct PlaybackClock {
    /// Last audio-sample PTS observed, or the seek target (ticks).
    pub master_position: i64,
    /// Wall clock at which the current play segment began; 0 if never started.
    pub playback_start_wall: u64,
    /// Accumulated duration of completed pauses (ms).
    pub total_paused_ms: u64,
    /// Wall clock at which the current pause began; 0 while playing.
    pub pause_start_wall: u64,
    /// Last video sample PTS presented (ticks).
    pub current_position: i64,
    /// Set while the seek coordinator owns both readers.
    pub seek_in_progress: bool,
}

impl PlaybackClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wall-clock time since play began, less all pauses, scaled by `speed`,
    /// in milliseconds. Returns 0 before playback has started.
    ///
    /// An in-progress pause is not yet folded into `total_paused_ms`; its
    /// prefix is subtracted here so the value freezes while paused.
    pub fn effective_elapsed_ms(&self, now_ms: u64, speed: f32) -> u64 {
        if self.playback_start_wall == 0 {
            return 0;
        }
        let mut paused = self.total_paused_ms;
        if self.pause_start_wall != 0 {
            paused += now_ms.saturating_sub(self.pause_start_wall);
        }
        let raw = now_ms
            .saturating_sub(self.playback_start_wall)
            .saturating_sub(paused);
        (raw as f64 * speed as f64) as u64
    }

    /// Same quantity in decoder ticks.
    pub fn effective_elapsed_ticks(&self, now_ms: u64, speed: f32) -> i64 {
        ms_to_ticks(self.effective_elapsed_ms(now_ms, speed) as i64)
    }

    /// Marks the start of a play segment if none is active.
    pub fn start_segment(&mut self, now_ms: u64) {
        if self.playback_start_wall == 0 {
            self.playback_start_wall = now_ms;
        }
    }

    /// Records the start of a pause. Idempotent while already paused.
    pub fn begin_pause(&mut self, now_ms: u64) {
        if self.pause_start_wall == 0 {
            self.pause_start_wall = now_ms;
        }
    }

    /// Folds the current pause into the accumulator and resumes.
    pub fn end_pause(&mut self, now_ms: u64) {
        if self.pause_start_wall != 0 {
            self.total_paused_ms += now_ms.saturating_sub(self.pause_start_wall);
            self.pause_start_wall = 0;
        }
    }

    /// True while a pause is in effect.
    pub fn is_paused(&self) -> bool {
        self.pause_start_wall != 0
    }

    /// Full-stop accounting: the next play begins a fresh segment.
    pub fn stop_segment(&mut self) {
        self.playback_start_wall = 0;
        self.total_paused_ms = 0;
        self.pause_start_wall = 0;
        self.master_position = 0;
    }

    /// Re-bases the wall-clock origin after a seek to `target` ticks so
    /// that `effective_elapsed` matches the target immediately.
    ///
    /// Only applies when a play segment exists; seeking a never-started
    /// instance must not make it look like playback has begun.
    pub fn rebase_after_seek(&mut self, target: i64, now_ms: u64) {
        self.current_position = target;
        self.master_position = target;
        if self.playback_start_wall != 0 {
            self.playback_start_wall = now_ms.saturating_sub(ticks_to_ms(target).max(0) as u64);
            self.total_paused_ms = 0;
            if self.pause_start_wall != 0 {
                self.pause_start_wall = now_ms;
            }
        }
    }

    /// Resets every field to the closed-media state.
    pub fn reset(&mut self) {
        *self = PlaybackClock::default();
    }
}
