//! Shared-mode audio endpoint abstraction.
//!
//! This module models the platform audio stack the engine renders into:
//! an [`EndpointEnumerator`] yields the default [`EndpointDevice`], which
//! activates an [`AudioClient`] owning a bounded shared-mode ring buffer
//! (~200 ms of playback). The audio thread writes through a [`RenderClient`]
//! view — query padding, acquire a render slot, copy, commit — while the
//! device-side consumer drains the ring and signals `samples_ready`
//! whenever space frees, which is what paces the render loop.
//!
//! Two device implementations ship with the crate:
//! - [`loopback`]: fully in-memory; the host (or a test) drives the drain
//!   side. This is the default endpoint in headless builds.
//! - `system` (feature `system-audio`, see [`crate::system_audio`]): the
//!   real default output device via cpal.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::error::PlayerError;
use crate::source::{AudioFormat, SampleEncoding};

/// Default ring depth requested at client activation.
pub const DEFAULT_BUFFER_MS: u32 = 200;

// ============================================================================
// Auto-reset event
// ============================================================================

/// A latching auto-reset event in the Win32 style: `set` wakes exactly one
/// waiter (or latches if none is waiting), `wait` consumes the signal.
#[derive(Default)]
pub struct AutoResetEvent {
    signalled: Mutex<bool>,
    condvar: Condvar,
}

impl AutoResetEvent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals the event, waking one waiter.
    pub fn set(&self) {
        let mut signalled = self.signalled.lock();
        *signalled = true;
        self.condvar.notify_one();
    }

    /// Waits up to `timeout` for the event. Returns `true` if it was
    /// signalled, consuming the signal; `false` on timeout.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut signalled = self.signalled.lock();
        if !*signalled {
            let _ = self.condvar.wait_for(&mut signalled, timeout);
        }
        let was = *signalled;
        *signalled = false;
        was
    }

    /// Blocks until the event is signalled.
    pub fn wait_forever(&self) {
        let mut signalled = self.signalled.lock();
        while !*signalled {
            self.condvar.wait(&mut signalled);
        }
        *signalled = false;
    }
}

// ============================================================================
// Shared ring state
// ============================================================================

struct RingInner {
    /// Written-but-unplayed bytes, FIFO.
    buf: VecDeque<u8>,
    /// Staging area for the currently acquired render slot.
    staging: Vec<u8>,
}

/// State shared between the render side, the device consumer, and the
/// controlling instance.
pub(crate) struct RingShared {
    inner: Mutex<RingInner>,
    capacity_frames: u32,
    format: AudioFormat,
    samples_ready: AutoResetEvent,
    /// Per-channel peak of the most recently drained block, f32 bits.
    peaks: [AtomicU32; 2],
    /// Set between `start()` and `stop()`; the consumer only drains (and
    /// only signals) while active.
    active: AtomicBool,
}

impl RingShared {
    fn new(format: AudioFormat, buffer_ms: u32) -> Arc<Self> {
        let capacity_frames = (format.sample_rate as u64 * buffer_ms as u64 / 1_000).max(1) as u32;
        Arc::new(Self {
            inner: Mutex::new(RingInner {
                buf: VecDeque::with_capacity(capacity_frames as usize * format.block_align as usize),
                staging: Vec::new(),
            }),
            capacity_frames,
            format,
            samples_ready: AutoResetEvent::new(),
            peaks: [AtomicU32::new(0), AtomicU32::new(0)],
            active: AtomicBool::new(false),
        })
    }

    fn padding_frames(&self, inner: &RingInner) -> u32 {
        (inner.buf.len() / self.format.block_align.max(1) as usize) as u32
    }

    fn store_peaks(&self, left: f32, right: f32) {
        self.peaks[0].store(left.to_bits(), Ordering::Relaxed);
        self.peaks[1].store(right.to_bits(), Ordering::Relaxed);
    }

    fn load_peaks(&self) -> (f32, f32) {
        (
            f32::from_bits(self.peaks[0].load(Ordering::Relaxed)),
            f32::from_bits(self.peaks[1].load(Ordering::Relaxed)),
        )
    }
}

// ============================================================================
// Render side
// ============================================================================

/// The audio thread's view onto the ring: padding queries, render slots,
/// and the `samples_ready` pacing event.
#[derive(Clone)]
pub struct RenderClient {
    ring: Arc<RingShared>,
}

impl RenderClient {
    /// Total ring capacity in frames.
    pub fn buffer_frames(&self) -> u32 {
        self.ring.capacity_frames
    }

    /// Frames written but not yet played.
    pub fn padding(&self) -> u32 {
        let inner = self.ring.inner.lock();
        self.ring.padding_frames(&inner)
    }

    /// Leases a contiguous render slot of `frames` frames.
    ///
    /// Fails with `InvalidParameter` if the ring does not have that much
    /// free space; callers size requests from `capacity - padding`.
    pub fn acquire(&self, frames: u32) -> Result<RenderSlot<'_>, PlayerError> {
        let mut inner = self.ring.inner.lock();
        let free = self.ring.capacity_frames - self.ring.padding_frames(&inner);
        if frames == 0 || frames > free {
            return Err(PlayerError::invalid(format!(
                "render slot of {frames} frames with only {free} free"
            )));
        }
        let bytes = frames as usize * self.ring.format.block_align as usize;
        inner.staging.clear();
        inner.staging.resize(bytes, 0);
        Ok(RenderSlot {
            guard: inner,
            bytes,
        })
    }

    /// Event signalled by the device consumer whenever free frames appear.
    pub fn samples_ready(&self) -> &AutoResetEvent {
        &self.ring.samples_ready
    }

    /// The format the client was activated with.
    pub fn format(&self) -> &AudioFormat {
        &self.ring.format
    }
}

/// A leased span of the ring. Write into [`RenderSlot::data_mut`], then
/// [`RenderSlot::commit`]; dropping without commit discards the lease.
pub struct RenderSlot<'a> {
    guard: MutexGuard<'a, RingInner>,
    bytes: usize,
}

impl RenderSlot<'_> {
    /// The writable slot contents, zero-initialized.
    pub fn data_mut(&mut self) -> &mut [u8] {
        let bytes = self.bytes;
        &mut self.guard.staging[..bytes]
    }

    /// Commits the written bytes into the ring.
    pub fn commit(mut self) {
        let staged = std::mem::take(&mut self.guard.staging);
        self.guard.buf.extend(staged[..self.bytes].iter().copied());
        self.guard.staging = staged;
    }
}

// ============================================================================
// Device consumer side
// ============================================================================

/// The device-side drain handle: the real output callback (or a test)
/// pulls interleaved bytes out of the ring with it.
#[derive(Clone)]
pub struct RingConsumer {
    ring: Arc<RingShared>,
}

impl RingConsumer {
    /// Fills `out` from the ring, zero-padding any shortfall, and returns
    /// the number of ring bytes consumed. Updates the channel peak meters
    /// and signals `samples_ready` when anything was drained or space is
    /// available. A stopped client consumes nothing.
    pub fn read(&self, out: &mut [u8]) -> usize {
        if !self.ring.active.load(Ordering::Acquire) {
            out.fill(0);
            return 0;
        }
        let consumed = {
            let mut inner = self.ring.inner.lock();
            let n = inner.buf.len().min(out.len());
            for byte in out.iter_mut().take(n) {
                // VecDeque::pop_front is O(1); the drain sizes here are a
                // device period, not the whole ring.
                *byte = inner.buf.pop_front().unwrap_or(0);
            }
            n
        };
        out[consumed..].fill(0);
        self.update_peaks(&out[..consumed]);
        self.ring.samples_ready.set();
        consumed
    }

    /// Convenience drain in whole frames; returns the consumed bytes.
    pub fn read_frames(&self, frames: u32) -> Vec<u8> {
        let mut out = vec![0u8; frames as usize * self.ring.format.block_align as usize];
        let consumed = self.read(&mut out);
        out.truncate(consumed);
        out
    }

    /// Whether the owning client is started.
    pub fn is_active(&self) -> bool {
        self.ring.active.load(Ordering::Acquire)
    }

    /// The negotiated format.
    pub fn format(&self) -> &AudioFormat {
        &self.ring.format
    }

    fn update_peaks(&self, consumed: &[u8]) {
        if consumed.is_empty() {
            return;
        }
        let channels = self.ring.format.channels.max(1) as usize;
        let mut peak = [0f32; 2];
        match self.ring.format.encoding {
            SampleEncoding::PcmI16 => {
                for (i, word) in consumed.chunks_exact(2).enumerate() {
                    let sample = i16::from_le_bytes([word[0], word[1]]);
                    let level = (sample as f32 / 32_768.0).abs();
                    let ch = (i % channels).min(1);
                    peak[ch] = peak[ch].max(level);
                }
            }
            SampleEncoding::PcmF32 => {
                for (i, word) in consumed.chunks_exact(4).enumerate() {
                    let sample = f32::from_le_bytes([word[0], word[1], word[2], word[3]]);
                    let ch = (i % channels).min(1);
                    peak[ch] = peak[ch].max(sample.abs());
                }
            }
        }
        if channels == 1 {
            peak[1] = peak[0];
        }
        self.ring.store_peaks(peak[0], peak[1]);
    }
}

// ============================================================================
// Audio client
// ============================================================================

/// Transport hooks onto the platform stream backing a client.
pub trait OutputTransport: Send + Sync {
    /// Starts or stops the platform stream.
    fn set_active(&self, active: bool) -> Result<(), PlayerError>;
}

/// A no-op transport; the ring's `active` flag alone gates the consumer.
pub struct InertTransport;

impl OutputTransport for InertTransport {
    fn set_active(&self, _active: bool) -> Result<(), PlayerError> {
        Ok(())
    }
}

/// An activated shared-mode audio client: the ring, its device transport,
/// and the negotiated format. One per instance with audio.
pub struct AudioClient {
    ring: Arc<RingShared>,
    transport: Box<dyn OutputTransport>,
    format: AudioFormat,
}

impl AudioClient {
    /// Builds a client over a fresh ring. Device implementations call this
    /// from [`EndpointDevice::activate_client`].
    pub fn new(
        format: AudioFormat,
        buffer_ms: u32,
        build_transport: impl FnOnce(RingConsumer) -> Result<Box<dyn OutputTransport>, PlayerError>,
    ) -> Result<Self, PlayerError> {
        let ring = RingShared::new(format.clone(), buffer_ms);
        let transport = build_transport(RingConsumer { ring: ring.clone() })?;
        Ok(Self {
            ring,
            transport,
            format,
        })
    }

    /// The render-side view handed to the audio thread.
    pub fn render_client(&self) -> RenderClient {
        RenderClient {
            ring: self.ring.clone(),
        }
    }

    /// Starts playback: the consumer begins draining and signalling.
    pub fn start(&self) -> Result<(), PlayerError> {
        self.ring.active.store(true, Ordering::Release);
        self.transport.set_active(true)
    }

    /// Stops playback; written frames stay in the ring.
    pub fn stop(&self) -> Result<(), PlayerError> {
        self.ring.active.store(false, Ordering::Release);
        self.transport.set_active(false)
    }

    /// Discards all buffered frames (used on seek).
    pub fn reset(&self) {
        let mut inner = self.ring.inner.lock();
        inner.buf.clear();
    }

    /// Ring capacity in frames.
    pub fn buffer_frames(&self) -> u32 {
        self.ring.capacity_frames
    }

    /// Raw per-channel peaks of the most recently played block, 0.0–1.0.
    pub fn channel_peaks(&self) -> (f32, f32) {
        self.ring.load_peaks()
    }

    /// The format the client was activated with.
    pub fn format(&self) -> &AudioFormat {
        &self.format
    }
}

/// Converts a raw peak (0.0–1.0) to the percentage scale of the level
/// meter: `clamp((20·log10(peak) + 60) / 60, 0, 1) × 100`, with silence
/// mapping to zero without evaluating `log10(0)`.
pub fn peak_to_percent(peak: f32) -> f32 {
    if peak <= 0.0 {
        return 0.0;
    }
    let db = 20.0 * peak.log10();
    ((db + 60.0) / 60.0).clamp(0.0, 1.0) * 100.0
}

// ============================================================================
// Device traits
// ============================================================================

/// An audio render endpoint.
pub trait EndpointDevice: Send + Sync {
    /// Device name for logs.
    fn name(&self) -> &str;

    /// Activates a shared-mode client with a ring of `buffer_ms`
    /// milliseconds at the given format.
    fn activate_client(
        &self,
        format: &AudioFormat,
        buffer_ms: u32,
    ) -> Result<AudioClient, PlayerError>;
}

/// Enumerates render endpoints; the engine only ever asks for the default.
pub trait EndpointEnumerator: Send + Sync {
    fn default_device(&self) -> Result<Arc<dyn EndpointDevice>, PlayerError>;
}

// ============================================================================
// Loopback endpoint
// ============================================================================

/// In-memory endpoint: activation succeeds unconditionally and the drain
/// side is exposed to the host through [`LoopbackDevice::consumers`].
pub mod loopback {
    use super::*;

    /// Enumerator over a single shared [`LoopbackDevice`].
    pub struct LoopbackEnumerator {
        device: Arc<LoopbackDevice>,
    }

    impl LoopbackEnumerator {
        pub fn new() -> Self {
            Self {
                device: Arc::new(LoopbackDevice::default()),
            }
        }

        /// The device this enumerator hands out, for driving drains.
        pub fn device(&self) -> Arc<LoopbackDevice> {
            self.device.clone()
        }
    }

    impl Default for LoopbackEnumerator {
        fn default() -> Self {
            Self::new()
        }
    }

    impl EndpointEnumerator for LoopbackEnumerator {
        fn default_device(&self) -> Result<Arc<dyn EndpointDevice>, PlayerError> {
            Ok(self.device.clone())
        }
    }

    /// The loopback render device. Keeps a consumer handle for every
    /// client it activates so the host can pump them.
    #[derive(Default)]
    pub struct LoopbackDevice {
        consumers: Mutex<Vec<RingConsumer>>,
    }

    impl LoopbackDevice {
        /// Consumer handles for all activated clients, oldest first.
        pub fn consumers(&self) -> Vec<RingConsumer> {
            self.consumers.lock().clone()
        }

        /// Consumer handle for the most recently activated client.
        pub fn latest_consumer(&self) -> Option<RingConsumer> {
            self.consumers.lock().last().cloned()
        }
    }

    impl EndpointDevice for LoopbackDevice {
        fn name(&self) -> &str {
            "loopback"
        }

        fn activate_client(
            &self,
            format: &AudioFormat,
            buffer_ms: u32,
        ) -> Result<AudioClient, PlayerError> {
            let client = AudioClient::new(format.clone(), buffer_ms, |consumer| {
                self.consumers.lock().push(consumer);
                Ok(Box::new(InertTransport))
            })?;
            tracing::debug!(
                "loopback client activated: {} frames at {} Hz",
                client.buffer_frames(),
                format.sample_rate
            );
            Ok(client)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::loopback::LoopbackEnumerator;
    use super::*;

    fn activate() -> (AudioClient, RingConsumer) {
        let enumerator = LoopbackEnumerator::new();
        let device = enumerator.device();
        let client = device
            .activate_client(&AudioFormat::negotiation_target(), DEFAULT_BUFFER_MS)
            .unwrap();
        let consumer = device.latest_consumer().unwrap();
        (client, consumer)
    }

    #[test]
    fn test_capacity_matches_requested_duration() {
        let (client, _) = activate();
        // 200ms at 48kHz
        assert_eq!(client.buffer_frames(), 9_600);
    }

    #[test]
    fn test_acquire_commit_padding() {
        let (client, consumer) = activate();
        let render = client.render_client();
        assert_eq!(render.padding(), 0);

        let mut slot = render.acquire(4).unwrap();
        slot.data_mut().copy_from_slice(&[1u8; 16]);
        slot.commit();
        assert_eq!(render.padding(), 4);

        client.start().unwrap();
        let drained = consumer.read_frames(4);
        assert_eq!(drained, vec![1u8; 16]);
        assert_eq!(render.padding(), 0);
    }

    #[test]
    fn test_acquire_over_free_space_fails() {
        let (client, _) = activate();
        let render = client.render_client();
        assert!(render.acquire(render.buffer_frames() + 1).is_err());
        assert!(render.acquire(0).is_err());
    }

    #[test]
    fn test_dropped_slot_discards() {
        let (client, _) = activate();
        let render = client.render_client();
        {
            let mut slot = render.acquire(8).unwrap();
            slot.data_mut().fill(7);
            // no commit
        }
        assert_eq!(render.padding(), 0);
    }

    #[test]
    fn test_fifo_order_preserved() {
        let (client, consumer) = activate();
        let render = client.render_client();
        for value in 1u8..=3 {
            let mut slot = render.acquire(1).unwrap();
            slot.data_mut().fill(value);
            slot.commit();
        }
        client.start().unwrap();
        let drained = consumer.read_frames(3);
        assert_eq!(&drained[..4], &[1; 4]);
        assert_eq!(&drained[4..8], &[2; 4]);
        assert_eq!(&drained[8..], &[3; 4]);
    }

    #[test]
    fn test_stopped_client_drains_nothing() {
        let (client, consumer) = activate();
        let render = client.render_client();
        let mut slot = render.acquire(2).unwrap();
        slot.data_mut().fill(9);
        slot.commit();

        assert!(consumer.read_frames(2).is_empty());
        client.start().unwrap();
        assert_eq!(consumer.read_frames(2).len(), 8);
        client.stop().unwrap();
        assert!(consumer.read_frames(2).is_empty());
    }

    #[test]
    fn test_drain_signals_samples_ready() {
        let (client, consumer) = activate();
        let render = client.render_client();
        client.start().unwrap();
        assert!(!render.samples_ready().wait(Duration::from_millis(1)));
        consumer.read_frames(16);
        assert!(render.samples_ready().wait(Duration::from_millis(1)));
        // Auto-reset: signal was consumed.
        assert!(!render.samples_ready().wait(Duration::from_millis(1)));
    }

    #[test]
    fn test_reset_clears_ring() {
        let (client, _) = activate();
        let render = client.render_client();
        let mut slot = render.acquire(16).unwrap();
        slot.data_mut().fill(1);
        slot.commit();
        client.reset();
        assert_eq!(render.padding(), 0);
    }

    #[test]
    fn test_peaks_track_drained_samples() {
        let (client, consumer) = activate();
        let render = client.render_client();
        client.start().unwrap();

        // Left at half scale, right at full scale.
        let left = (16_384i16).to_le_bytes();
        let right = (-32_768i16).to_le_bytes();
        let mut slot = render.acquire(2).unwrap();
        let data = slot.data_mut();
        for frame in data.chunks_exact_mut(4) {
            frame[..2].copy_from_slice(&left);
            frame[2..].copy_from_slice(&right);
        }
        slot.commit();
        consumer.read_frames(2);

        let (l, r) = client.channel_peaks();
        assert!((l - 0.5).abs() < 0.01, "left peak {l}");
        assert!((r - 1.0).abs() < 0.01, "right peak {r}");
    }

    #[test]
    fn test_peak_to_percent() {
        assert_eq!(peak_to_percent(0.0), 0.0);
        assert_eq!(peak_to_percent(-1.0), 0.0);
        assert!((peak_to_percent(1.0) - 100.0).abs() < f32::EPSILON);
        // -60 dB floor maps to zero.
        assert!(peak_to_percent(0.001) < 0.01);
        // -6 dB is 90%.
        let half = peak_to_percent(0.5);
        assert!((half - 89.97).abs() < 0.1, "got {half}");
    }

    #[test]
    fn test_event_latches_one_signal() {
        let event = AutoResetEvent::new();
        event.set();
        event.set();
        assert!(event.wait(Duration::from_millis(1)));
        assert!(!event.wait(Duration::from_millis(1)));
    }
}
