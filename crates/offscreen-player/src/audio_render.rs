//! The per-instance audio render thread.
//!
//! A real-time producer: pulls decoded audio blocks from the instance's
//! audio reader, paces them against the master clock, and copies them into
//! the endpoint ring under `samples_ready` event pacing. The thread is the
//! sole writer of `master_position`, which makes the audio stream the
//! master clock the video path slaves to.
//!
//! All waits are bounded except the initial `start_gate`, so the
//! cooperative run flag is observed at least every 10 ms.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::clock::{monotonic_ms, precise_sleep, ticks_to_ms};
use crate::endpoint::{AudioClient, RenderClient};
use crate::instance::PlaybackShared;
use crate::source::{SampleEncoding, SampleRead, SourceReader};

/// Audio ahead of the clock by more than this waits before rendering.
const DRIFT_WAIT_AHEAD_MS: i64 = 15;

/// Audio behind the clock by more than this drops the sample.
const DRIFT_DROP_BEHIND_MS: i64 = -50;

/// Upper bound on a single drift wait, before speed scaling.
const DRIFT_MAX_WAIT_MS: i64 = 100;

/// What the drift policy decided for one sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum DriftAction {
    /// Render immediately.
    Proceed,
    /// Sleep this many milliseconds (already speed-scaled), then render.
    Wait(f64),
    /// Sample is too late; elide it whole.
    Drop,
}

/// Applies the drift policy to one sample.
pub(crate) fn drift_action(drift_ms: i64, speed: f32) -> DriftAction {
    if drift_ms > DRIFT_WAIT_AHEAD_MS {
        DriftAction::Wait(drift_ms.min(DRIFT_MAX_WAIT_MS) as f64 / speed as f64)
    } else if drift_ms < DRIFT_DROP_BEHIND_MS {
        DriftAction::Drop
    } else {
        DriftAction::Proceed
    }
}

/// Scales PCM samples in place by `volume`.
///
/// 16-bit words are truncated back (`as i16`), bit-for-bit with the
/// reference behavior; float words are multiplied. Other encodings would
/// pass through unscaled, but the engine only negotiates these two.
pub(crate) fn apply_volume(data: &mut [u8], volume: f32, encoding: SampleEncoding) {
    match encoding {
        SampleEncoding::PcmI16 => {
            for word in data.chunks_exact_mut(2) {
                let sample = i16::from_le_bytes([word[0], word[1]]);
                let scaled = (sample as f32 * volume) as i16;
                word.copy_from_slice(&scaled.to_le_bytes());
            }
        }
        SampleEncoding::PcmF32 => {
            for word in data.chunks_exact_mut(4) {
                let sample = f32::from_le_bytes([word[0], word[1], word[2], word[3]]);
                word.copy_from_slice(&(sample * volume).to_le_bytes());
            }
        }
    }
}

/// Everything the render thread owns or shares.
pub(crate) struct AudioThreadParams {
    pub shared: Arc<PlaybackShared>,
    pub reader: Arc<Mutex<Box<dyn SourceReader>>>,
    pub client: Arc<AudioClient>,
}

/// Spawns the render thread. The caller signals `start_gate` once the
/// instance is ready for audio to begin.
pub(crate) fn spawn_audio_thread(params: AudioThreadParams) -> JoinHandle<()> {
    params
        .shared
        .audio_thread_running
        .store(true, std::sync::atomic::Ordering::Release);
    std::thread::Builder::new()
        .name("audio-render".to_string())
        .spawn(move || render_loop(params))
        .expect("spawn audio render thread")
}

fn render_loop(params: AudioThreadParams) {
    use std::sync::atomic::Ordering;

    let AudioThreadParams {
        shared,
        reader,
        client,
    } = params;
    let render: RenderClient = client.render_client();
    let capacity = render.buffer_frames();
    let format = render.format().clone();

    shared.start_gate.wait_forever();
    debug!(
        "audio thread started: ring of {} frames at {} Hz",
        capacity, format.sample_rate
    );

    while shared.audio_thread_running.load(Ordering::Acquire) {
        // The endpoint signals whenever free frames appear; a timeout just
        // re-checks the run flag.
        if !render.samples_ready().wait(Duration::from_millis(10)) {
            continue;
        }

        let suspended = {
            let clock = shared.clock.lock();
            clock.seek_in_progress || clock.pause_start_wall != 0 || clock.playback_start_wall == 0
        };
        if suspended {
            precise_sleep(5.0);
            continue;
        }

        if capacity - render.padding() == 0 {
            continue;
        }

        let sample = match reader.lock().read_sample() {
            Ok(SampleRead::Sample(sample)) => sample,
            Ok(SampleRead::Pending) => continue,
            Ok(SampleRead::EndOfStream) => {
                info!("audio stream ended");
                break;
            }
            Err(err) => {
                // The instance stays usable for video-only playback.
                warn!("audio read failed, stopping audio: {err}");
                break;
            }
        };

        // A seek may have begun while we were inside read_sample; the
        // sample belongs to the old position, so drop it here.
        if shared.clock.lock().seek_in_progress {
            precise_sleep(5.0);
            continue;
        }

        let speed = shared.speed();
        let drift_ms = {
            let clock = shared.clock.lock();
            ticks_to_ms(sample.pts) - clock.effective_elapsed_ms(monotonic_ms(), speed) as i64
        };
        match drift_action(drift_ms, speed) {
            DriftAction::Wait(ms) => precise_sleep(ms),
            DriftAction::Drop => {
                debug!("dropping late audio sample ({drift_ms} ms behind)");
                continue;
            }
            DriftAction::Proceed => {}
        }

        if write_sample(&shared, &render, &sample.data, &format, capacity)
            && sample.pts > 0
        {
            shared.clock.lock().master_position = sample.pts;
        }
    }

    shared.audio_thread_running.store(false, Ordering::Release);
    if let Err(err) = client.stop() {
        warn!("audio client stop on thread exit failed: {err}");
    }
    debug!("audio thread stopped");
}

/// Copies one sample into the ring in `min(remaining, free)` chunks,
/// waiting out full-ring intervals on `samples_ready`. Returns `false`
/// when the remainder was abandoned because of shutdown or a seek.
fn write_sample(
    shared: &PlaybackShared,
    render: &RenderClient,
    data: &[u8],
    format: &crate::source::AudioFormat,
    capacity: u32,
) -> bool {
    use std::sync::atomic::Ordering;

    let block_align = format.block_align.max(1) as usize;
    let total_frames = format.frames_in(data.len());
    let mut written = 0u32;

    while written < total_frames {
        if !shared.audio_thread_running.load(Ordering::Acquire) {
            return false;
        }
        if shared.clock.lock().seek_in_progress {
            // The coordinator is about to flush the ring; the rest of this
            // sample is stale.
            return false;
        }

        let free = capacity - render.padding();
        if free == 0 {
            render.samples_ready().wait(Duration::from_millis(5));
            continue;
        }

        let chunk = (total_frames - written).min(free);
        let start = written as usize * block_align;
        let end = start + chunk as usize * block_align;
        let mut slot = match render.acquire(chunk) {
            Ok(slot) => slot,
            Err(err) => {
                warn!("render slot acquisition failed: {err}");
                return false;
            }
        };
        slot.data_mut().copy_from_slice(&data[start..end]);
        let volume = shared.volume();
        if volume < 0.999 {
            apply_volume(slot.data_mut(), volume, format.encoding);
        }
        slot.commit();
        written += chunk;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drift_policy() {
        assert_eq!(drift_action(0, 1.0), DriftAction::Proceed);
        assert_eq!(drift_action(15, 1.0), DriftAction::Proceed);
        assert_eq!(drift_action(-50, 1.0), DriftAction::Proceed);
        assert_eq!(drift_action(-51, 1.0), DriftAction::Drop);
        assert_eq!(drift_action(16, 1.0), DriftAction::Wait(16.0));
        // Waits are capped at 100ms and scaled by speed.
        assert_eq!(drift_action(400, 1.0), DriftAction::Wait(100.0));
        assert_eq!(drift_action(400, 2.0), DriftAction::Wait(50.0));
        assert_eq!(drift_action(30, 0.5), DriftAction::Wait(60.0));
    }

    #[test]
    fn test_volume_zero_silences_i16() {
        let mut data = [0x12, 0x34, 0xFF, 0x7F];
        apply_volume(&mut data, 0.0, SampleEncoding::PcmI16);
        assert_eq!(data, [0, 0, 0, 0]);
    }

    #[test]
    fn test_volume_half_truncates_i16() {
        let samples: [i16; 4] = [1001, -1001, 3, i16::MAX];
        let mut data = Vec::new();
        for s in samples {
            data.extend_from_slice(&s.to_le_bytes());
        }
        apply_volume(&mut data, 0.5, SampleEncoding::PcmI16);
        let scaled: Vec<i16> = data
            .chunks_exact(2)
            .map(|w| i16::from_le_bytes([w[0], w[1]]))
            .collect();
        // `as i16` truncates toward zero, same as the C cast.
        assert_eq!(scaled, vec![500, -500, 1, 16383]);
    }

    #[test]
    fn test_volume_scales_f32() {
        let mut data = Vec::new();
        for s in [0.8f32, -0.4] {
            data.extend_from_slice(&s.to_le_bytes());
        }
        apply_volume(&mut data, 0.5, SampleEncoding::PcmF32);
        let scaled: Vec<f32> = data
            .chunks_exact(4)
            .map(|w| f32::from_le_bytes([w[0], w[1], w[2], w[3]]))
            .collect();
        assert!((scaled[0] - 0.4).abs() < 1e-6);
        assert!((scaled[1] + 0.2).abs() < 1e-6);
    }
}
