//! Virtual gamepad hub
//!
//! Four pre-allocated gamepad slots, each exposing a joystick-flavored and
//! an evdev-flavored Unix socket that a local C interposer connects to. On
//! connect the interposer receives a fixed 1360-byte configuration struct
//! and answers with a single byte, its sizeof(long), which selects the
//! timeval layout for subsequent input_event records.
//!
//! The wire format is native-endian: the consumer is always a local
//! process on the same machine.

use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixListener;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

pub const NUM_GAMEPADS: usize = 4;

const INTERPOSER_MAX_BTNS: usize = 512;
const INTERPOSER_MAX_AXES: usize = 64;
const CONTROLLER_NAME_MAX_LEN: usize = 255;
pub const INTERPOSER_CONFIG_SIZE: usize = 1360;

const EVENT_QUEUE_DEPTH: usize = 256;
const SHUTDOWN_DRAIN_CAP: Duration = Duration::from_secs(2);

// evdev codes (linux/input-event-codes.h)
const BTN_A: u16 = 0x130;
const BTN_B: u16 = 0x131;
const BTN_X: u16 = 0x133;
const BTN_Y: u16 = 0x134;
const BTN_TL: u16 = 0x136;
const BTN_TR: u16 = 0x137;
const BTN_SELECT: u16 = 0x13a;
const BTN_START: u16 = 0x13b;
const BTN_MODE: u16 = 0x13c;
const BTN_THUMBL: u16 = 0x13d;
const BTN_THUMBR: u16 = 0x13e;

const ABS_X: u8 = 0x00;
const ABS_Y: u8 = 0x01;
const ABS_Z: u8 = 0x02;
const ABS_RX: u8 = 0x03;
const ABS_RY: u8 = 0x04;
const ABS_RZ: u8 = 0x05;
const ABS_HAT0X: u8 = 0x10;
const ABS_HAT0Y: u8 = 0x11;

const EV_SYN: u16 = 0x00;
const EV_KEY: u16 = 0x01;
const EV_ABS: u16 = 0x03;
const SYN_REPORT: u16 = 0x00;

const JS_EVENT_BUTTON: u8 = 0x01;
const JS_EVENT_AXIS: u8 = 0x02;

const ABS_MIN_VAL: i32 = -32767;
const ABS_MAX_VAL: i32 = 32767;

/// Fixed XBox-360-style identity presented to every interposer.
pub const XPAD_NAME: &str = "Microsoft X-Box 360 pad";
pub const XPAD_VENDOR: u16 = 0x045e;
pub const XPAD_PRODUCT: u16 = 0x028e;
pub const XPAD_VERSION: u16 = 0x0114;

const XPAD_BTN_MAP: [u16; 11] = [
    BTN_A, BTN_B, BTN_X, BTN_Y, BTN_TL, BTN_TR, BTN_SELECT, BTN_START, BTN_MODE, BTN_THUMBL,
    BTN_THUMBR,
];
const XPAD_AXES_MAP: [u8; 8] = [
    ABS_X, ABS_Y, ABS_Z, ABS_RX, ABS_RY, ABS_RZ, ABS_HAT0X, ABS_HAT0Y,
];

// Internal abstract axis indices for the triggers and hats.
const AXIS_LEFT_TRIGGER: usize = 2;
const AXIS_RIGHT_TRIGGER: usize = 5;
const AXIS_HAT0X: usize = 6;
const AXIS_HAT0Y: usize = 7;

/// Configuration payload sent to the interposer on connect.
#[derive(Debug, Clone)]
pub struct InterposerConfig {
    pub name: String,
    pub vendor: u16,
    pub product: u16,
    pub version: u16,
    pub btn_map: Vec<u16>,
    pub axes_map: Vec<u8>,
}

impl InterposerConfig {
    pub fn standard_xpad() -> Self {
        Self {
            name: XPAD_NAME.to_string(),
            vendor: XPAD_VENDOR,
            product: XPAD_PRODUCT,
            version: XPAD_VERSION,
            btn_map: XPAD_BTN_MAP.to_vec(),
            axes_map: XPAD_AXES_MAP.to_vec(),
        }
    }

    /// Pack to exactly 1360 bytes, native-endian, NUL-padded:
    /// name[255], 1 pad byte, five u16 fields, btn_map[512] u16,
    /// axes_map[64] u8, 6 trailing pad bytes.
    pub fn pack(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(INTERPOSER_CONFIG_SIZE);

        let name_bytes = self.name.as_bytes();
        let name_len = name_bytes.len().min(CONTROLLER_NAME_MAX_LEN - 1);
        buf.extend_from_slice(&name_bytes[..name_len]);
        buf.resize(CONTROLLER_NAME_MAX_LEN, 0);
        buf.push(0); // alignment pad before the u16 fields

        buf.extend_from_slice(&self.vendor.to_ne_bytes());
        buf.extend_from_slice(&self.product.to_ne_bytes());
        buf.extend_from_slice(&self.version.to_ne_bytes());
        buf.extend_from_slice(&(self.btn_map.len().min(INTERPOSER_MAX_BTNS) as u16).to_ne_bytes());
        buf.extend_from_slice(&(self.axes_map.len().min(INTERPOSER_MAX_AXES) as u16).to_ne_bytes());

        for i in 0..INTERPOSER_MAX_BTNS {
            let code = self.btn_map.get(i).copied().unwrap_or(0);
            buf.extend_from_slice(&code.to_ne_bytes());
        }
        for i in 0..INTERPOSER_MAX_AXES {
            buf.push(self.axes_map.get(i).copied().unwrap_or(0));
        }

        buf.resize(INTERPOSER_CONFIG_SIZE, 0);
        debug_assert_eq!(buf.len(), INTERPOSER_CONFIG_SIZE);
        buf
    }
}

/// Evdev event before per-client timeval formatting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvdevEvent {
    pub ev_type: u16,
    pub code: u16,
    pub value: i32,
}

/// One mapped client event, ready for fan-out.
#[derive(Debug, Clone, PartialEq)]
pub struct MappedEvent {
    pub js_data: [u8; 8],
    pub evdev: EvdevEvent,
}

fn now_timestamp() -> (u64, u32, u32) {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);
    let millis = (now.as_millis() & 0xFFFF_FFFF) as u64;
    (millis, now.as_secs() as u32, now.subsec_micros())
}

/// struct js_event { __u32 time; __s16 value; __u8 type; __u8 number; }
pub fn pack_js_event(ev_type: u8, number: u8, value: i16) -> [u8; 8] {
    let (time_ms, _, _) = now_timestamp();
    let mut data = [0u8; 8];
    data[0..4].copy_from_slice(&(time_ms as u32).to_ne_bytes());
    data[4..6].copy_from_slice(&value.to_ne_bytes());
    data[6] = ev_type;
    data[7] = number;
    data
}

#[cfg(test)]
pub fn unpack_js_event(data: &[u8; 8]) -> (u8, u8, i16) {
    let value = i16::from_ne_bytes([data[4], data[5]]);
    (data[6], data[7], value)
}

/// struct input_event plus a SYN_REPORT, with the timeval layout chosen by
/// the client's sizeof(long).
pub fn pack_evdev_events(event: &EvdevEvent, arch_bits: u8) -> Vec<u8> {
    let (_, secs, micros) = now_timestamp();
    let mut buf = Vec::with_capacity(96);
    for (ev_type, code, value) in [
        (event.ev_type, event.code, event.value),
        (EV_SYN, SYN_REPORT, 0),
    ] {
        if arch_bits == 64 {
            buf.extend_from_slice(&(secs as i64).to_ne_bytes());
            buf.extend_from_slice(&(micros as i64).to_ne_bytes());
        } else {
            buf.extend_from_slice(&(secs as i32).to_ne_bytes());
            buf.extend_from_slice(&(micros as i32).to_ne_bytes());
        }
        buf.extend_from_slice(&ev_type.to_ne_bytes());
        buf.extend_from_slice(&code.to_ne_bytes());
        buf.extend_from_slice(&value.to_ne_bytes());
    }
    buf
}

fn normalize_stick(value: f64) -> i32 {
    (ABS_MIN_VAL as f64 + ((value + 1.0) / 2.0) * (ABS_MAX_VAL - ABS_MIN_VAL) as f64) as i32
}

fn normalize_trigger(value: f64) -> i32 {
    (ABS_MIN_VAL as f64 + value * (ABS_MAX_VAL - ABS_MIN_VAL) as f64) as i32
}

fn clamp_hat(value: f64) -> i32 {
    (value.round() as i32).clamp(-1, 1)
}

/// Map a client-facing event onto the fixed XPad layout. Returns None for
/// client indices with no mapping.
pub fn map_client_event(client_idx: u32, value: f64, is_button: bool) -> Option<MappedEvent> {
    if is_button {
        match client_idx {
            // D-pad buttons become HAT axis swings.
            12 | 13 | 14 | 15 => {
                let (axis, direction) = match client_idx {
                    12 => (AXIS_HAT0Y, -1),
                    13 => (AXIS_HAT0Y, 1),
                    14 => (AXIS_HAT0X, -1),
                    _ => (AXIS_HAT0X, 1),
                };
                let hat = clamp_hat(direction as f64 * value);
                let code = XPAD_AXES_MAP[axis] as u16;
                Some(MappedEvent {
                    // JS consumers expect a full-range axis swing, not -1/0/1.
                    js_data: pack_js_event(
                        JS_EVENT_AXIS,
                        axis as u8,
                        (hat * ABS_MAX_VAL) as i16,
                    ),
                    evdev: EvdevEvent {
                        ev_type: EV_ABS,
                        code,
                        value: hat,
                    },
                })
            }
            // Analog triggers arrive as buttons with value 0..1.
            6 | 7 => {
                let axis = if client_idx == 6 {
                    AXIS_LEFT_TRIGGER
                } else {
                    AXIS_RIGHT_TRIGGER
                };
                let normalized = normalize_trigger(value);
                Some(MappedEvent {
                    js_data: pack_js_event(JS_EVENT_AXIS, axis as u8, normalized as i16),
                    evdev: EvdevEvent {
                        ev_type: EV_ABS,
                        code: XPAD_AXES_MAP[axis] as u16,
                        value: normalized,
                    },
                })
            }
            _ => {
                let internal = match client_idx {
                    0 => 0,
                    1 => 1,
                    2 => 2,
                    3 => 3,
                    4 => 4,
                    5 => 5,
                    8 => 6,
                    9 => 7,
                    10 => 9,
                    11 => 10,
                    16 => 8,
                    _ => return None,
                };
                let pressed = if value != 0.0 { 1 } else { 0 };
                Some(MappedEvent {
                    js_data: pack_js_event(JS_EVENT_BUTTON, internal as u8, pressed as i16),
                    evdev: EvdevEvent {
                        ev_type: EV_KEY,
                        code: XPAD_BTN_MAP[internal],
                        value: pressed,
                    },
                })
            }
        }
    } else {
        let internal = match client_idx {
            0 => 0,
            1 => 1,
            2 => 3,
            3 => 4,
            _ => return None,
        };
        let normalized = normalize_stick(value);
        Some(MappedEvent {
            js_data: pack_js_event(JS_EVENT_AXIS, internal as u8, normalized as i16),
            evdev: EvdevEvent {
                ev_type: EV_ABS,
                code: XPAD_AXES_MAP[internal] as u16,
                value: normalized,
            },
        })
    }
}

struct InterposerClient {
    writer: OwnedWriteHalf,
    arch_bits: u8,
}

struct SlotClients {
    js: Vec<InterposerClient>,
    evdev: Vec<InterposerClient>,
}

/// One pre-allocated gamepad slot with its two socket listeners.
pub struct GamepadSlot {
    pub index: usize,
    js_path: PathBuf,
    evdev_path: PathBuf,
    config_payload: Arc<Vec<u8>>,
    event_tx: mpsc::Sender<MappedEvent>,
    clients: Arc<Mutex<SlotClients>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl GamepadSlot {
    async fn bind(index: usize, prefix: &Path) -> io::Result<Arc<Self>> {
        let js_path = prefix.join(format!("selkies_js{}.sock", index));
        let evdev_path = prefix.join(format!("selkies_event{}.sock", 1000 + index));
        let config_payload = Arc::new(InterposerConfig::standard_xpad().pack());

        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let slot = Arc::new(Self {
            index,
            js_path: js_path.clone(),
            evdev_path: evdev_path.clone(),
            config_payload,
            event_tx,
            clients: Arc::new(Mutex::new(SlotClients {
                js: Vec::new(),
                evdev: Vec::new(),
            })),
            tasks: Mutex::new(Vec::new()),
        });

        let js_listener = bind_unix(&js_path)?;
        let evdev_listener = bind_unix(&evdev_path)?;
        info!(
            "Gamepad slot {} listening on {:?} (js) and {:?} (evdev)",
            index, js_path, evdev_path
        );

        let mut tasks = slot.tasks.lock().await;
        tasks.push(tokio::spawn(accept_loop(
            slot.clone(),
            js_listener,
            false,
        )));
        tasks.push(tokio::spawn(accept_loop(
            slot.clone(),
            evdev_listener,
            true,
        )));
        tasks.push(tokio::spawn(drain_loop(slot.clone(), event_rx)));
        drop(tasks);

        Ok(slot)
    }

    /// Queue one mapped event for fan-out; drops when the queue is full.
    fn enqueue(&self, event: MappedEvent) {
        if self.event_tx.try_send(event).is_err() {
            warn!("Gamepad slot {} event queue full; dropping event", self.index);
        }
    }

    async fn shutdown(&self) {
        // Give the drain task a bounded window to flush queued events.
        let drained = tokio::time::timeout(SHUTDOWN_DRAIN_CAP, async {
            while self.event_tx.capacity() < EVENT_QUEUE_DEPTH {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!("Gamepad slot {} queue did not drain before shutdown", self.index);
        }

        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        let mut clients = self.clients.lock().await;
        clients.js.clear();
        clients.evdev.clear();

        for path in [&self.js_path, &self.evdev_path] {
            if let Err(err) = std::fs::remove_file(path) {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!("Could not remove socket file {:?}: {}", path, err);
                }
            } else {
                info!("Removed socket file {:?}", path);
            }
        }
    }
}

fn bind_unix(path: &Path) -> io::Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    UnixListener::bind(path)
}

async fn accept_loop(slot: Arc<GamepadSlot>, listener: UnixListener, is_evdev: bool) {
    let flavor = if is_evdev { "EVDEV" } else { "JS" };
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                error!("Gamepad slot {} {} accept error: {}", slot.index, flavor, err);
                tokio::time::sleep(Duration::from_millis(500)).await;
                continue;
            }
        };
        debug!("Gamepad slot {} {} interposer connected", slot.index, flavor);

        let (mut reader, mut writer) = stream.into_split();

        // Handshake: config payload out, one arch byte back.
        if let Err(err) = writer.write_all(&slot.config_payload).await {
            warn!(
                "Gamepad slot {} {}: failed to send config: {}",
                slot.index, flavor, err
            );
            continue;
        }
        let mut arch_byte = [0u8; 1];
        if let Err(err) = reader.read_exact(&mut arch_byte).await {
            warn!(
                "Gamepad slot {} {}: handshake read failed: {}",
                slot.index, flavor, err
            );
            continue;
        }
        let sizeof_long = arch_byte[0];
        if sizeof_long != 4 && sizeof_long != 8 {
            warn!(
                "Gamepad slot {} {}: invalid arch specifier {}; closing",
                slot.index, flavor, sizeof_long
            );
            continue;
        }
        let arch_bits = sizeof_long * 8;
        info!(
            "Gamepad slot {} {}: interposer registered ({}-bit)",
            slot.index, flavor, arch_bits
        );

        let mut clients = slot.clients.lock().await;
        let list = if is_evdev {
            &mut clients.evdev
        } else {
            &mut clients.js
        };
        list.push(InterposerClient { writer, arch_bits });
    }
}

async fn drain_loop(slot: Arc<GamepadSlot>, mut event_rx: mpsc::Receiver<MappedEvent>) {
    while let Some(event) = event_rx.recv().await {
        let mut clients = slot.clients.lock().await;

        let mut failed = Vec::new();
        for (i, client) in clients.js.iter_mut().enumerate() {
            if client.writer.write_all(&event.js_data).await.is_err() {
                failed.push(i);
            }
        }
        for &i in failed.iter().rev() {
            clients.js.remove(i);
            debug!("Gamepad slot {}: removed dead JS client", slot.index);
        }

        let mut failed = Vec::new();
        for (i, client) in clients.evdev.iter_mut().enumerate() {
            let payload = pack_evdev_events(&event.evdev, client.arch_bits);
            if client.writer.write_all(&payload).await.is_err() {
                failed.push(i);
            }
        }
        for &i in failed.iter().rev() {
            clients.evdev.remove(i);
            debug!("Gamepad slot {}: removed dead EVDEV client", slot.index);
        }
    }
}

/// Process-global hub owning the pre-allocated slots.
pub struct GamepadHub {
    slots: Vec<Arc<GamepadSlot>>,
    associations: parking_lot::Mutex<HashMap<usize, String>>,
}

impl GamepadHub {
    pub async fn start(prefix: &Path) -> io::Result<GamepadHub> {
        if !prefix.exists() {
            std::fs::create_dir_all(prefix)?;
        }
        let mut slots = Vec::with_capacity(NUM_GAMEPADS);
        for i in 0..NUM_GAMEPADS {
            slots.push(GamepadSlot::bind(i, prefix).await?);
        }
        Ok(GamepadHub {
            slots,
            associations: parking_lot::Mutex::new(HashMap::new()),
        })
    }

    /// Record which client controller is driving a slot. The slot and its
    /// sockets persist regardless.
    pub fn connect(&self, index: usize, name: &str, num_btns: u32, num_axes: u32) {
        if index >= self.slots.len() {
            warn!("Gamepad connect for out-of-range slot {}", index);
            return;
        }
        info!(
            "Client controller '{}' ({}b, {}a) associated with gamepad slot {}",
            name, num_btns, num_axes, index
        );
        self.associations.lock().insert(index, name.to_string());
    }

    pub fn disconnect(&self, index: usize) {
        if let Some(name) = self.associations.lock().remove(&index) {
            info!(
                "Client controller '{}' disassociated from gamepad slot {}",
                name, index
            );
        }
    }

    pub fn send_event(&self, index: usize, client_idx: u32, value: f64, is_button: bool) {
        let Some(slot) = self.slots.get(index) else {
            warn!("Gamepad event for out-of-range slot {}", index);
            return;
        };
        if let Some(event) = map_client_event(client_idx, value, is_button) {
            slot.enqueue(event);
        }
    }

    pub async fn shutdown(&self) {
        info!("Shutting down gamepad hub...");
        for slot in &self.slots {
            slot.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_payload_is_exactly_1360_bytes_and_stable() {
        let config = InterposerConfig::standard_xpad();
        let first = config.pack();
        let second = config.pack();
        assert_eq!(first.len(), INTERPOSER_CONFIG_SIZE);
        assert_eq!(first, second);
    }

    #[test]
    fn config_payload_field_offsets() {
        let payload = InterposerConfig::standard_xpad().pack();
        // name at 0, NUL-padded to 255
        assert_eq!(&payload[..XPAD_NAME.len()], XPAD_NAME.as_bytes());
        assert_eq!(payload[CONTROLLER_NAME_MAX_LEN - 1], 0);
        // u16 fields start at 256 after the alignment pad
        assert_eq!(
            u16::from_ne_bytes([payload[256], payload[257]]),
            XPAD_VENDOR
        );
        assert_eq!(
            u16::from_ne_bytes([payload[258], payload[259]]),
            XPAD_PRODUCT
        );
        assert_eq!(
            u16::from_ne_bytes([payload[260], payload[261]]),
            XPAD_VERSION
        );
        assert_eq!(u16::from_ne_bytes([payload[262], payload[263]]), 11);
        assert_eq!(u16::from_ne_bytes([payload[264], payload[265]]), 8);
        // btn_map[0] = BTN_A at 266
        assert_eq!(u16::from_ne_bytes([payload[266], payload[267]]), BTN_A);
        // axes_map at 1290; entry 6 is HAT0X
        assert_eq!(payload[1290], ABS_X);
        assert_eq!(payload[1290 + 6], ABS_HAT0X);
        // trailing pad
        assert_eq!(&payload[1354..], &[0u8; 6]);
    }

    #[test]
    fn js_event_roundtrip() {
        let data = pack_js_event(JS_EVENT_BUTTON, 3, 1);
        let (ev_type, number, value) = unpack_js_event(&data);
        assert_eq!(ev_type, JS_EVENT_BUTTON);
        assert_eq!(number, 3);
        assert_eq!(value, 1);
    }

    #[test]
    fn evdev_payload_sizes_follow_arch() {
        let event = EvdevEvent {
            ev_type: EV_KEY,
            code: BTN_A,
            value: 1,
        };
        // input_event + SYN_REPORT
        assert_eq!(pack_evdev_events(&event, 64).len(), 48);
        assert_eq!(pack_evdev_events(&event, 32).len(), 32);
    }

    #[test]
    fn button_press_maps_to_btn_a() {
        let mapped = map_client_event(0, 1.0, true).expect("mapped");
        assert_eq!(mapped.evdev.ev_type, EV_KEY);
        assert_eq!(mapped.evdev.code, BTN_A);
        assert_eq!(mapped.evdev.value, 1);
        let (ev_type, number, value) = unpack_js_event(&mapped.js_data);
        assert_eq!(ev_type, JS_EVENT_BUTTON);
        assert_eq!(number, 0);
        assert_eq!(value, 1);
    }

    #[test]
    fn dpad_up_swings_hat_axis() {
        let mapped = map_client_event(12, 1.0, true).expect("mapped");
        assert_eq!(mapped.evdev.ev_type, EV_ABS);
        assert_eq!(mapped.evdev.code, ABS_HAT0Y as u16);
        assert_eq!(mapped.evdev.value, -1);
        // JS value is scaled to the full axis range
        let (_, number, value) = unpack_js_event(&mapped.js_data);
        assert_eq!(number, AXIS_HAT0Y as u8);
        assert_eq!(value, -32767);

        let released = map_client_event(12, 0.0, true).expect("mapped");
        assert_eq!(released.evdev.value, 0);
    }

    #[test]
    fn trigger_button_maps_to_analog_axis() {
        let full = map_client_event(7, 1.0, true).expect("mapped");
        assert_eq!(full.evdev.ev_type, EV_ABS);
        assert_eq!(full.evdev.code, ABS_RZ as u16);
        assert_eq!(full.evdev.value, 32767);

        let idle = map_client_event(6, 0.0, true).expect("mapped");
        assert_eq!(idle.evdev.code, ABS_Z as u16);
        assert_eq!(idle.evdev.value, -32767);
    }

    #[test]
    fn stick_axes_map_and_normalize() {
        let centered = map_client_event(0, 0.0, false).expect("mapped");
        assert_eq!(centered.evdev.code, ABS_X as u16);
        assert_eq!(centered.evdev.value, 0);

        // Client right-stick X is internal axis 3
        let right = map_client_event(2, 1.0, false).expect("mapped");
        assert_eq!(right.evdev.code, ABS_RX as u16);
        assert_eq!(right.evdev.value, 32767);

        let left = map_client_event(2, -1.0, false).expect("mapped");
        assert_eq!(left.evdev.value, -32767);
    }

    #[test]
    fn unknown_client_index_is_dropped() {
        assert!(map_client_event(99, 1.0, true).is_none());
        assert!(map_client_event(12, 1.0, false).is_none());
    }

    #[tokio::test]
    async fn interposer_handshake_and_event_delivery() {
        use tokio::net::UnixStream;

        let dir = tempfile::tempdir().expect("tempdir");
        let hub = GamepadHub::start(dir.path()).await.expect("hub");

        let js_path = dir.path().join("selkies_js0.sock");
        let mut stream = UnixStream::connect(&js_path).await.expect("connect");

        let mut config = vec![0u8; INTERPOSER_CONFIG_SIZE];
        stream.read_exact(&mut config).await.expect("config");
        assert_eq!(&config[..XPAD_NAME.len()], XPAD_NAME.as_bytes());

        stream.write_all(&[8u8]).await.expect("arch byte");
        // Registration happens on the accept task; give it a moment.
        tokio::time::sleep(Duration::from_millis(50)).await;

        hub.send_event(0, 0, 1.0, true);
        let mut event = [0u8; 8];
        stream.read_exact(&mut event).await.expect("event");
        let (ev_type, number, value) = unpack_js_event(&event);
        assert_eq!(ev_type, JS_EVENT_BUTTON);
        assert_eq!(number, 0);
        assert_eq!(value, 1);

        hub.shutdown().await;
        assert!(!js_path.exists());
    }

    #[tokio::test]
    async fn bad_arch_byte_closes_connection() {
        use tokio::net::UnixStream;

        let dir = tempfile::tempdir().expect("tempdir");
        let hub = GamepadHub::start(dir.path()).await.expect("hub");

        let evdev_path = dir.path().join("selkies_event1001.sock");
        let mut stream = UnixStream::connect(&evdev_path).await.expect("connect");
        let mut config = vec![0u8; INTERPOSER_CONFIG_SIZE];
        stream.read_exact(&mut config).await.expect("config");
        stream.write_all(&[2u8]).await.expect("arch byte");
        tokio::time::sleep(Duration::from_millis(50)).await;

        hub.send_event(1, 0, 1.0, true);
        // The server closed its end after the invalid specifier; the next
        // read must hit EOF rather than deliver an event.
        let mut buf = [0u8; 8];
        let n = stream.read(&mut buf).await.expect("read");
        assert_eq!(n, 0);

        hub.shutdown().await;
    }
}
