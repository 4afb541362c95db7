//! Process-wide platform host: decoder backend, accelerator device,
//! endpoint enumerator, and the live-instance registry.
//!
//! The host is a singleton: `initialize` brings up the decoder backend and
//! its hardware accelerator once for the whole process, and `shutdown`
//! refuses to run while any [`crate::Player`] is alive. Instances register
//! through an RAII ticket so a leaked instance can never leave the counter
//! wrong.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::endpoint::EndpointEnumerator;
use crate::error::PlayerError;
use crate::source::{AcceleratorManager, MediaBackend};
use crate::synthetic::SyntheticBackend;

/// Platform-level configuration handed to [`initialize`].
pub struct PlatformConfig {
    backend: Arc<dyn MediaBackend>,
    enumerator: Arc<dyn EndpointEnumerator>,
    detach_stuck_audio_thread: bool,
}

impl PlatformConfig {
    /// Builds a config over an explicit backend and endpoint enumerator.
    pub fn new(backend: Arc<dyn MediaBackend>, enumerator: Arc<dyn EndpointEnumerator>) -> Self {
        Self {
            backend,
            enumerator,
            detach_stuck_audio_thread: false,
        }
    }

    /// Last-resort escape hatch: if an audio thread misses its 1-second
    /// stop deadline, abandon its join handle instead of blocking close.
    /// Off by default; the cooperative run flag is checked at least every
    /// 10 ms, so a healthy thread always makes the deadline.
    pub fn with_detach_stuck_audio_thread(mut self, detach: bool) -> Self {
        self.detach_stuck_audio_thread = detach;
        self
    }
}

impl Default for PlatformConfig {
    /// Synthetic decoder backend plus the system endpoint when the
    /// `system-audio` feature is enabled, the loopback endpoint otherwise.
    fn default() -> Self {
        Self::new(Arc::new(SyntheticBackend), default_enumerator())
    }
}

#[cfg(feature = "system-audio")]
fn default_enumerator() -> Arc<dyn EndpointEnumerator> {
    Arc::new(crate::system_audio::SystemEnumerator::new())
}

#[cfg(not(feature = "system-audio"))]
fn default_enumerator() -> Arc<dyn EndpointEnumerator> {
    Arc::new(crate::endpoint::loopback::LoopbackEnumerator::new())
}

struct HostState {
    backend: Arc<dyn MediaBackend>,
    enumerator: Arc<dyn EndpointEnumerator>,
    accelerator: Option<Arc<AcceleratorManager>>,
    detach_stuck_audio_thread: bool,
    active_instances: usize,
}

static HOST: Mutex<Option<HostState>> = Mutex::new(None);

/// Initializes the platform host. Fails with `AlreadyInitialized` on a
/// redundant call.
pub fn initialize(config: PlatformConfig) -> Result<(), PlayerError> {
    let mut host = HOST.lock();
    if host.is_some() {
        return Err(PlayerError::AlreadyInitialized);
    }

    let accelerator = config.backend.create_accelerator()?.map(Arc::new);
    match &accelerator {
        Some(manager) => tracing::info!(
            "platform initialized, accelerator '{}' (reset token {})",
            manager.device().name,
            manager.reset_token()
        ),
        None => tracing::info!("platform initialized, no hardware accelerator"),
    }

    *host = Some(HostState {
        backend: config.backend,
        enumerator: config.enumerator,
        accelerator,
        detach_stuck_audio_thread: config.detach_stuck_audio_thread,
        active_instances: 0,
    });
    Ok(())
}

/// Initializes with [`PlatformConfig::default`].
pub fn initialize_default() -> Result<(), PlayerError> {
    initialize(PlatformConfig::default())
}

/// Tears the host down, releasing resources in reverse creation order.
/// Refused while any instance is alive.
pub fn shutdown() -> Result<(), PlayerError> {
    let mut host = HOST.lock();
    {
        let state = host.as_ref().ok_or(PlayerError::NotInitialized)?;
        if state.active_instances > 0 {
            return Err(PlayerError::InstancesActive(state.active_instances));
        }
    }
    let state = host.take().expect("checked above");
    drop(state.accelerator);
    drop(state.enumerator);
    drop(state.backend);
    tracing::info!("platform shut down");
    Ok(())
}

/// Whether [`initialize`] has run (and [`shutdown`] has not).
pub fn is_initialized() -> bool {
    HOST.lock().is_some()
}

/// Number of live playback instances.
pub fn active_instances() -> usize {
    HOST.lock().as_ref().map_or(0, |s| s.active_instances)
}

/// RAII registration of one live instance.
pub(crate) struct InstanceTicket(());

impl Drop for InstanceTicket {
    fn drop(&mut self) {
        if let Some(state) = HOST.lock().as_mut() {
            state.active_instances = state.active_instances.saturating_sub(1);
        }
    }
}

/// Everything an instance borrows from the host, plus its ticket.
pub(crate) struct HostServices {
    pub backend: Arc<dyn MediaBackend>,
    pub enumerator: Arc<dyn EndpointEnumerator>,
    pub accelerator: Option<Arc<AcceleratorManager>>,
    pub detach_stuck_audio_thread: bool,
    #[allow(dead_code)]
    ticket: InstanceTicket,
}

/// Registers a new instance with the host.
pub(crate) fn register_instance() -> Result<HostServices, PlayerError> {
    let mut host = HOST.lock();
    let state = host.as_mut().ok_or(PlayerError::NotInitialized)?;
    state.active_instances += 1;
    Ok(HostServices {
        backend: state.backend.clone(),
        enumerator: state.enumerator.clone(),
        accelerator: state.accelerator.clone(),
        detach_stuck_audio_thread: state.detach_stuck_audio_thread,
        ticket: InstanceTicket(()),
    })
}
