//! Platform host lifecycle: init/shutdown ordering against live instances.
//!
//! The host is process-global, so this suite keeps the whole sequence in
//! a single test (this file is its own test binary and therefore its own
//! process).

use std::sync::Arc;
use std::thread;

use offscreen_player::endpoint::loopback::LoopbackEnumerator;
use offscreen_player::platform::{self, PlatformConfig};
use offscreen_player::synthetic::SyntheticBackend;
use offscreen_player::{Player, PlayerError};

#[test]
fn test_platform_lifecycle_with_instances() {
    // Instance creation before init is refused.
    assert!(matches!(Player::new(), Err(PlayerError::NotInitialized)));
    assert!(!platform::is_initialized());

    let enumerator = LoopbackEnumerator::new();
    let device = enumerator.device();
    platform::initialize(
        PlatformConfig::new(Arc::new(SyntheticBackend), Arc::new(enumerator))
            .with_detach_stuck_audio_thread(true),
    )
    .unwrap();
    assert!(platform::is_initialized());
    assert!(matches!(
        platform::initialize_default(),
        Err(PlayerError::AlreadyInitialized)
    ));

    // Pump so audio-carrying instances run normally.
    let pump = device.clone();
    thread::spawn(move || loop {
        for consumer in pump.consumers() {
            consumer.read_frames(256);
        }
        thread::sleep(std::time::Duration::from_millis(3));
    });

    // Two instances from different threads; shutdown refused while they
    // are alive.
    let first = Player::new().unwrap();
    let second = thread::spawn(|| {
        let mut player = Player::new().unwrap();
        player.open("durms=200,fps=30,w=8,h=8,tone=440").unwrap();
        player.play().unwrap();
        player
    })
    .join()
    .unwrap();

    assert_eq!(platform::active_instances(), 2);
    assert!(matches!(
        platform::shutdown(),
        Err(PlayerError::InstancesActive(2))
    ));

    drop(first);
    assert!(matches!(
        platform::shutdown(),
        Err(PlayerError::InstancesActive(1))
    ));

    drop(second);
    assert_eq!(platform::active_instances(), 0);
    platform::shutdown().unwrap();
    assert!(!platform::is_initialized());

    // The host can come back up after a clean shutdown.
    platform::initialize_default().unwrap();
    let player = Player::new().unwrap();
    drop(player);
    platform::shutdown().unwrap();
}
