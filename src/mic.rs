//! Client microphone sink
//!
//! 0x02 binary frames carry s16le mono PCM at 24 kHz from the browser.
//! They are played into a PulseAudio virtual source (loaded on demand via
//! pactl) so host applications can record the remote user's microphone.

#[cfg(feature = "pulseaudio")]
pub use pulse_impl::MicrophoneSink;

#[cfg(not(feature = "pulseaudio"))]
pub use stub_impl::MicrophoneSink;

#[cfg(feature = "pulseaudio")]
pub const VIRTUAL_SOURCE_NAME: &str = "SelkiesVirtualMic";
#[cfg(feature = "pulseaudio")]
pub const MASTER_MONITOR: &str = "input.monitor";
#[cfg(feature = "pulseaudio")]
pub const MIC_SAMPLE_RATE: u32 = 24_000;

#[cfg(feature = "pulseaudio")]
mod pulse_impl {
    use super::{MASTER_MONITOR, MIC_SAMPLE_RATE, VIRTUAL_SOURCE_NAME};
    use libpulse_binding::sample::{Format, Spec};
    use libpulse_binding::stream::Direction;
    use libpulse_simple_binding::Simple;
    use log::{info, warn};
    use std::process::Command;
    use std::sync::mpsc::{sync_channel, SyncSender, TrySendError};

    // ~2 seconds of 20 ms packets before we start dropping.
    const QUEUE_DEPTH: usize = 100;

    /// Feeds client PCM into the virtual source from a dedicated thread;
    /// PulseAudio writes block and must stay off the executor.
    pub struct MicrophoneSink {
        sender: Option<SyncSender<Vec<u8>>>,
    }

    impl MicrophoneSink {
        pub fn new() -> Self {
            Self { sender: None }
        }

        pub fn write(&mut self, payload: &[u8]) {
            if payload.is_empty() {
                return;
            }
            if self.sender.is_none() {
                self.sender = spawn_worker();
            }
            if let Some(sender) = &self.sender {
                match sender.try_send(payload.to_vec()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        warn!("Microphone buffer overflow, dropping packet to prevent drift");
                    }
                    Err(TrySendError::Disconnected(_)) => {
                        warn!("Microphone worker gone; will respawn on next packet");
                        self.sender = None;
                    }
                }
            }
        }

        /// Stop the worker; it unloads the virtual-source module on exit.
        pub fn close(&mut self) {
            self.sender = None;
        }
    }

    impl Default for MicrophoneSink {
        fn default() -> Self {
            Self::new()
        }
    }

    fn spawn_worker() -> Option<SyncSender<Vec<u8>>> {
        let (sender, receiver) = sync_channel::<Vec<u8>>(QUEUE_DEPTH);
        let spawned = std::thread::Builder::new()
            .name("mic-sink".into())
            .spawn(move || {
                let module_index = ensure_virtual_source();
                let mut stream: Option<Simple> = None;
                while let Ok(payload) = receiver.recv() {
                    if stream.is_none() {
                        stream = open_stream();
                    }
                    if let Some(s) = &stream {
                        if let Err(err) = s.write(&payload) {
                            warn!("PulseAudio stream write error: {}", err);
                            stream = None;
                        }
                    }
                }
                if let Some(index) = module_index {
                    info!("Unloading PulseAudio module {} for virtual mic", index);
                    let _ = Command::new("pactl")
                        .args(["unload-module", &index.to_string()])
                        .status();
                }
            });
        match spawned {
            Ok(_) => Some(sender),
            Err(err) => {
                warn!("Failed to spawn microphone worker: {}", err);
                None
            }
        }
    }

    /// Make sure the virtual source exists; returns the module index when
    /// this process loaded it (and therefore owns the unload).
    fn ensure_virtual_source() -> Option<u32> {
        let listing = Command::new("pactl")
            .args(["list", "short", "sources"])
            .output()
            .ok()?;
        let text = String::from_utf8_lossy(&listing.stdout);
        if text
            .lines()
            .any(|line| line.split_whitespace().nth(1) == Some(VIRTUAL_SOURCE_NAME))
        {
            info!("Virtual source '{}' already exists", VIRTUAL_SOURCE_NAME);
            return None;
        }

        let load = Command::new("pactl")
            .args([
                "load-module",
                "module-virtual-source",
                &format!("source_name={}", VIRTUAL_SOURCE_NAME),
                &format!("master={}", MASTER_MONITOR),
            ])
            .output()
            .ok()?;
        if !load.status.success() {
            warn!(
                "Failed to load module-virtual-source: {}",
                String::from_utf8_lossy(&load.stderr).trim()
            );
            return None;
        }
        let index: u32 = String::from_utf8_lossy(&load.stdout).trim().parse().ok()?;
        info!(
            "Loaded module-virtual-source with index {} for '{}'",
            index, VIRTUAL_SOURCE_NAME
        );
        Some(index)
    }

    fn open_stream() -> Option<Simple> {
        let spec = Spec {
            format: Format::S16le,
            channels: 1,
            rate: MIC_SAMPLE_RATE,
        };
        match Simple::new(
            None,
            "selkies-stream",
            Direction::Playback,
            Some("input"),
            "MicStream",
            &spec,
            None,
            None,
        ) {
            Ok(stream) => {
                info!(
                    "Opened microphone playback stream at {} Hz (s16le, mono)",
                    MIC_SAMPLE_RATE
                );
                Some(stream)
            }
            Err(err) => {
                warn!("Failed to open PulseAudio playback stream: {}", err);
                None
            }
        }
    }
}

#[cfg(not(feature = "pulseaudio"))]
mod stub_impl {
    use log::warn;

    pub struct MicrophoneSink {
        warned: bool,
    }

    impl MicrophoneSink {
        pub fn new() -> Self {
            Self { warned: false }
        }

        pub fn write(&mut self, payload: &[u8]) {
            if !payload.is_empty() && !self.warned {
                warn!("PulseAudio support not built in. Skipping microphone data.");
                self.warned = true;
            }
        }

        pub fn close(&mut self) {}
    }

    impl Default for MicrophoneSink {
        fn default() -> Self {
            Self::new()
        }
    }
}
