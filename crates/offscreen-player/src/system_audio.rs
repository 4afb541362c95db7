//! System audio endpoint backed by cpal.
//!
//! Activation spawns a dedicated output thread that owns the cpal stream
//! (cpal streams are not `Send`) and services start/stop commands over a
//! channel. The stream callback drains the shared ring through a
//! [`RingConsumer`], which is also what signals `samples_ready` back to
//! the render loop.

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::endpoint::{
    AudioClient, EndpointDevice, EndpointEnumerator, OutputTransport, RingConsumer,
};
use crate::error::PlayerError;
use crate::source::{AudioFormat, SampleEncoding};

/// Enumerator over the host's default output device.
#[derive(Default)]
pub struct SystemEnumerator;

impl SystemEnumerator {
    pub fn new() -> Self {
        Self
    }
}

impl EndpointEnumerator for SystemEnumerator {
    fn default_device(&self) -> Result<Arc<dyn EndpointDevice>, PlayerError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| PlayerError::platform(-1, "no default audio output device"))?;
        let name = device.name().unwrap_or_else(|_| "default".to_string());
        Ok(Arc::new(SystemDevice { name }))
    }
}

/// The default render endpoint.
pub struct SystemDevice {
    name: String,
}

impl EndpointDevice for SystemDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn activate_client(
        &self,
        format: &AudioFormat,
        buffer_ms: u32,
    ) -> Result<AudioClient, PlayerError> {
        info!(
            "activating system audio on '{}': {} Hz, {} ch",
            self.name, format.sample_rate, format.channels
        );
        let stream_format = format.clone();
        AudioClient::new(format.clone(), buffer_ms, move |consumer| {
            let transport = SystemTransport::spawn(stream_format, consumer)?;
            Ok(Box::new(transport))
        })
    }
}

enum TransportCmd {
    Active(bool),
    Shutdown,
}

/// Command channel into the output thread that owns the cpal stream.
struct SystemTransport {
    commands: Mutex<mpsc::Sender<TransportCmd>>,
}

impl SystemTransport {
    fn spawn(format: AudioFormat, consumer: RingConsumer) -> Result<Self, PlayerError> {
        let (commands, command_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();

        std::thread::Builder::new()
            .name("audio-output".to_string())
            .spawn(move || {
                let stream = match build_stream(&format, consumer) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                // Streams come up running on some hosts; start stopped.
                let _ = stream.pause();
                while let Ok(cmd) = command_rx.recv() {
                    match cmd {
                        TransportCmd::Active(true) => {
                            if let Err(err) = stream.play() {
                                warn!("audio stream play failed: {err}");
                            }
                        }
                        TransportCmd::Active(false) => {
                            if let Err(err) = stream.pause() {
                                warn!("audio stream pause failed: {err}");
                            }
                        }
                        TransportCmd::Shutdown => break,
                    }
                }
            })
            .map_err(|err| PlayerError::platform(-1, format!("spawn audio output: {err}")))?;

        match ready_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(Ok(())) => Ok(Self {
                commands: Mutex::new(commands),
            }),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(PlayerError::platform(-1, "audio output thread did not come up")),
        }
    }
}

impl OutputTransport for SystemTransport {
    fn set_active(&self, active: bool) -> Result<(), PlayerError> {
        self.commands
            .lock()
            .send(TransportCmd::Active(active))
            .map_err(|_| PlayerError::platform(-1, "audio output thread gone"))
    }
}

impl Drop for SystemTransport {
    fn drop(&mut self) {
        let _ = self.commands.lock().send(TransportCmd::Shutdown);
    }
}

fn build_stream(format: &AudioFormat, consumer: RingConsumer) -> Result<cpal::Stream, PlayerError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| PlayerError::platform(-1, "no default audio output device"))?;
    let config = cpal::StreamConfig {
        channels: format.channels,
        sample_rate: cpal::SampleRate(format.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let stream = match format.encoding {
        SampleEncoding::PcmI16 => {
            let mut scratch: Vec<u8> = Vec::new();
            device.build_output_stream(
                &config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    scratch.resize(data.len() * 2, 0);
                    consumer.read(&mut scratch);
                    for (word, bytes) in data.iter_mut().zip(scratch.chunks_exact(2)) {
                        *word = i16::from_le_bytes([bytes[0], bytes[1]]);
                    }
                },
                |err| warn!("audio output stream error: {err}"),
                None,
            )
        }
        SampleEncoding::PcmF32 => {
            let mut scratch: Vec<u8> = Vec::new();
            device.build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    scratch.resize(data.len() * 4, 0);
                    consumer.read(&mut scratch);
                    for (word, bytes) in data.iter_mut().zip(scratch.chunks_exact(4)) {
                        *word = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                    }
                },
                |err| warn!("audio output stream error: {err}"),
                None,
            )
        }
    }
    .map_err(|err| PlayerError::platform(-1, format!("build audio output stream: {err}")))?;

    Ok(stream)
}
