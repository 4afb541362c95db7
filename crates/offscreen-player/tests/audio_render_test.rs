//! Byte-level tests of the audio render path: what actually lands in the
//! endpoint ring, with and without software volume.
//!
//! No background pump here — each test drains its own client so it can
//! inspect the bytes. Tests share the process-global platform host and the
//! loopback device, so they serialize on a mutex and pick their consumer
//! by activation index.

use std::f64::consts::TAU;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use offscreen_player::endpoint::loopback::{LoopbackDevice, LoopbackEnumerator};
use offscreen_player::endpoint::RingConsumer;
use offscreen_player::platform::{self, PlatformConfig};
use offscreen_player::synthetic::SyntheticBackend;
use offscreen_player::Player;

/// Frames per 20 ms synthetic audio block at 48 kHz.
const BLOCK_FRAMES: usize = 960;
/// Interleaved stereo words per block.
const BLOCK_WORDS: usize = BLOCK_FRAMES * 2;

fn device() -> Arc<LoopbackDevice> {
    static DEVICE: OnceLock<Arc<LoopbackDevice>> = OnceLock::new();
    DEVICE
        .get_or_init(|| {
            let _ = tracing_subscriber::fmt::try_init();
            let enumerator = LoopbackEnumerator::new();
            let device = enumerator.device();
            platform::initialize(PlatformConfig::new(
                Arc::new(SyntheticBackend),
                Arc::new(enumerator),
            ))
            .expect("platform init");
            device
        })
        .clone()
}

fn serial() -> MutexGuard<'static, ()> {
    static SERIAL: Mutex<()> = Mutex::new(());
    SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn open_audio_player(url: &str) -> (Player, RingConsumer) {
    let device = device();
    let before = device.consumers().len();
    let mut player = Player::new().unwrap();
    player.open(url).unwrap();
    let consumers = device.consumers();
    assert_eq!(consumers.len(), before + 1, "expected one new audio client");
    (player, consumers[before].clone())
}

/// Drains the consumer until `min_bytes` were collected or `budget` ran out.
fn drain_bytes(consumer: &RingConsumer, min_bytes: usize, budget: Duration) -> Vec<u8> {
    let deadline = Instant::now() + budget;
    let mut collected = Vec::new();
    while collected.len() < min_bytes && Instant::now() < deadline {
        let chunk = consumer.read_frames(240);
        if chunk.is_empty() {
            thread::sleep(Duration::from_millis(1));
        } else {
            collected.extend_from_slice(&chunk);
        }
    }
    collected
}

fn to_words(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|w| i16::from_le_bytes([w[0], w[1]]))
        .collect()
}

/// The synthetic 440 Hz tone word for an absolute frame index.
fn tone_word(frame: i64) -> i16 {
    let t = frame as f64 / 48_000.0;
    ((t * 440.0 * TAU).sin() * 0.3 * i16::MAX as f64) as i16
}

fn block_matches(drained: &[i16], block_index: i64, volume: f32) -> bool {
    let base_frame = block_index * BLOCK_FRAMES as i64;
    drained.iter().enumerate().all(|(j, &word)| {
        let expected = tone_word(base_frame + j as i64 / 2);
        let scaled = if volume < 0.999 {
            (expected as f32 * volume) as i16
        } else {
            expected
        };
        word == scaled
    })
}

/// Checks that the drained words are an in-order sequence of whole tone
/// blocks scaled by `volume`. Late-drop may elide blocks, never reorder
/// or split them.
fn verify_scaled_tone(words: &[i16], volume: f32) {
    let mut next_block = 0i64;
    let mut offset = 0;
    let mut verified = 0;
    while offset + BLOCK_WORDS <= words.len() {
        let drained = &words[offset..offset + BLOCK_WORDS];
        let matched = (next_block..next_block + 64)
            .find(|&k| block_matches(drained, k, volume));
        match matched {
            Some(k) => next_block = k + 1,
            None => panic!("block at word {offset} matches no expected block"),
        }
        offset += BLOCK_WORDS;
        verified += 1;
    }
    assert!(verified >= 2, "only {verified} complete blocks drained");
}

#[test]
fn test_volume_zero_renders_silence() {
    let _guard = serial();
    let (mut player, consumer) = open_audio_player("durms=600,fps=30,w=8,h=8,tone=440");
    player.set_volume(0.0);
    player.play().unwrap();

    let bytes = drain_bytes(&consumer, BLOCK_WORDS * 2 * 3, Duration::from_secs(3));
    assert!(bytes.len() >= BLOCK_WORDS * 2 * 2, "drained {}", bytes.len());
    assert!(bytes.iter().all(|&b| b == 0), "expected all-zero samples");

    // Silence also means a dead meter.
    assert_eq!(player.audio_levels().unwrap(), (0.0, 0.0));
    player.close();
}

#[test]
fn test_volume_unity_passes_decoder_output_through() {
    let _guard = serial();
    let (mut player, consumer) = open_audio_player("durms=600,fps=30,w=8,h=8,tone=440");
    player.play().unwrap();

    let bytes = drain_bytes(&consumer, BLOCK_WORDS * 2 * 4, Duration::from_secs(3));
    verify_scaled_tone(&to_words(&bytes), 1.0);
    player.close();
}

#[test]
fn test_volume_half_truncates_every_word() {
    let _guard = serial();
    let (mut player, consumer) = open_audio_player("durms=600,fps=30,w=8,h=8,tone=440");
    player.set_volume(0.5);
    player.play().unwrap();

    let bytes = drain_bytes(&consumer, BLOCK_WORDS * 2 * 4, Duration::from_secs(3));
    verify_scaled_tone(&to_words(&bytes), 0.5);
    player.close();
}

#[test]
fn test_audio_levels_reflect_played_tone() {
    let _guard = serial();
    let (mut player, consumer) = open_audio_player("durms=600,fps=30,w=8,h=8,tone=440");
    player.play().unwrap();

    drain_bytes(&consumer, BLOCK_WORDS * 2, Duration::from_secs(3));
    let (left, right) = player.audio_levels().unwrap();
    // A 0.3 full-scale tone sits around -10.5 dB, i.e. ~82% on the meter.
    assert!(left > 50.0 && left <= 100.0, "left level {left}");
    assert!((left - right).abs() < 10.0, "channels diverge: {left} / {right}");
    player.close();
}

#[test]
fn test_pause_halts_the_drain() {
    let _guard = serial();
    let (mut player, consumer) = open_audio_player("durms=900,fps=30,w=8,h=8,tone=440");
    player.play().unwrap();
    let before = drain_bytes(&consumer, BLOCK_WORDS * 2, Duration::from_secs(3));
    assert!(!before.is_empty());

    player.pause().unwrap();
    // A stopped client neither drains nor signals.
    assert!(consumer.read_frames(240).is_empty());
    assert!(consumer.read_frames(240).is_empty());

    player.play().unwrap();
    let after = drain_bytes(&consumer, BLOCK_WORDS, Duration::from_secs(3));
    assert!(!after.is_empty(), "no audio after resume");
    player.close();
}

#[test]
fn test_seek_flushes_stale_audio() {
    let _guard = serial();
    let (mut player, consumer) = open_audio_player("10s,fps=30,w=8,h=8,tone=440");
    player.play().unwrap();
    drain_bytes(&consumer, BLOCK_WORDS * 2, Duration::from_secs(3));

    // Seek far ahead; everything drained afterwards must come from
    // blocks at or beyond the target, never from the pre-seek backlog.
    let target_ms = 5_000i64;
    player.seek(target_ms * offscreen_player::TICKS_PER_MS).unwrap();
    let words = to_words(&drain_bytes(
        &consumer,
        BLOCK_WORDS * 2 * 2,
        Duration::from_secs(3),
    ));
    assert!(words.len() >= BLOCK_WORDS, "drained {} words", words.len());

    let target_block = target_ms / 20;
    let first = &words[..BLOCK_WORDS];
    let matched = (target_block..target_block + 64).find(|&k| block_matches(first, k, 1.0));
    assert!(
        matched.is_some(),
        "first post-seek block is not at or after the seek target"
    );
    player.close();
}
