//! Frame-level flow control
//!
//! Compares server-sent frame ids against client-acknowledged ids and gates
//! outgoing video frames. Frame ids are 16-bit and wrap at 65536; every
//! comparison here is wrap-aware. The gate applies uniformly to all
//! encoders at encoded-frame granularity.

use log::{info, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

pub const BACKPRESSURE_ALLOWED_DESYNC_MS: f64 = 2000.0;
pub const BACKPRESSURE_LATENCY_THRESHOLD_MS: f64 = 50.0;
pub const BACKPRESSURE_CHECK_INTERVAL: Duration = Duration::from_millis(500);
pub const STALLED_CLIENT_TIMEOUT: Duration = Duration::from_secs(4);
pub const RTT_SMOOTHING_SAMPLES: usize = 20;
pub const SENT_FRAME_TIMESTAMP_HISTORY_SIZE: usize = 1000;
const MAX_FRAME_ID: u32 = u16::MAX as u32;
const SUSPICIOUS_GAP_THRESHOLD: u32 = MAX_FRAME_ID / 2;
const ABSURD_DESYNC_FRAMES: u32 = 10_000;

/// Forward distance from `acked` to `sent`, modulo 2^16.
pub fn frame_desync(sent: u16, acked: u16) -> u32 {
    let sent = sent as u32;
    let acked = acked as u32;
    if sent >= acked {
        sent - acked
    } else {
        (MAX_FRAME_ID - acked) + sent + 1
    }
}

/// Send timestamps for recently emitted frame ids, bounded with FIFO
/// eviction so memory stays flat for long-lived clients.
struct SentFrameHistory {
    order: VecDeque<u16>,
    timestamps: HashMap<u16, Instant>,
}

impl SentFrameHistory {
    fn new() -> Self {
        Self {
            order: VecDeque::with_capacity(SENT_FRAME_TIMESTAMP_HISTORY_SIZE),
            timestamps: HashMap::with_capacity(SENT_FRAME_TIMESTAMP_HISTORY_SIZE),
        }
    }

    fn record(&mut self, frame_id: u16, at: Instant) {
        if self.timestamps.insert(frame_id, at).is_none() {
            self.order.push_back(frame_id);
        }
        while self.order.len() > SENT_FRAME_TIMESTAMP_HISTORY_SIZE {
            if let Some(oldest) = self.order.pop_front() {
                self.timestamps.remove(&oldest);
            }
        }
    }

    fn take(&mut self, frame_id: u16) -> Option<Instant> {
        self.timestamps.remove(&frame_id)
    }

    fn clear(&mut self) {
        self.order.clear();
        self.timestamps.clear();
    }

    fn len(&self) -> usize {
        self.timestamps.len()
    }
}

struct FlowState {
    sent_id: u16,
    /// -1 until the client ACKs something after a reset.
    acked_id: i32,
    last_ack_update: Instant,
    rtt_samples: VecDeque<f64>,
    smoothed_rtt_ms: f64,
    client_render_fps: f64,
    history: SentFrameHistory,
}

/// Shared flow-control state. The gate is an atomic so the capture
/// callback path can consult it without taking the lock.
pub struct FlowController {
    state: Mutex<FlowState>,
    send_enabled: AtomicBool,
}

impl FlowController {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FlowState {
                sent_id: 0,
                acked_id: -1,
                last_ack_update: Instant::now(),
                rtt_samples: VecDeque::with_capacity(RTT_SMOOTHING_SAMPLES),
                smoothed_rtt_ms: 0.0,
                client_render_fps: 0.0,
                history: SentFrameHistory::new(),
            }),
            send_enabled: AtomicBool::new(true),
        }
    }

    /// Whether the next encoded frame may be broadcast.
    pub fn send_enabled(&self) -> bool {
        self.send_enabled.load(Ordering::Relaxed)
    }

    pub fn record_sent(&self, frame_id: u16) {
        let mut state = self.state.lock();
        state.sent_id = frame_id;
        let now = Instant::now();
        state.history.record(frame_id, now);
    }

    pub fn record_ack(&self, frame_id: u16) {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.acked_id = frame_id as i32;
        state.last_ack_update = now;
        if let Some(sent_at) = state.history.take(frame_id) {
            let rtt_ms = now.duration_since(sent_at).as_secs_f64() * 1000.0;
            if state.rtt_samples.len() >= RTT_SMOOTHING_SAMPLES {
                state.rtt_samples.pop_front();
            }
            state.rtt_samples.push_back(rtt_ms);
            state.smoothed_rtt_ms =
                state.rtt_samples.iter().sum::<f64>() / state.rtt_samples.len() as f64;
        }
    }

    pub fn set_client_fps(&self, fps: f64) {
        self.state.lock().client_render_fps = fps;
    }

    pub fn smoothed_rtt_ms(&self) -> f64 {
        self.state.lock().smoothed_rtt_ms
    }

    pub fn last_sent_id(&self) -> u16 {
        self.state.lock().sent_id
    }

    /// Zero both counters after a pipeline reset; the caller broadcasts
    /// `PIPELINE_RESETTING 0` before any new frame goes out.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.sent_id = 0;
        state.acked_id = -1;
        state.last_ack_update = Instant::now();
        state.history.clear();
        drop(state);
        self.send_enabled.store(true, Ordering::Relaxed);
    }

    /// Force the gate open, e.g. while no video pipeline is active.
    pub fn open_gate(&self) {
        self.send_enabled.store(true, Ordering::Relaxed);
    }

    /// One backpressure decision. `configured_fps` is the session framerate
    /// used when the client has not reported its render FPS yet.
    pub fn evaluate(&self, configured_fps: f64, now: Instant) {
        let mut state = self.state.lock();

        // No ACK since the last reset: let frames flow so the client can
        // start acknowledging.
        if state.acked_id < 0 {
            state.last_ack_update = now;
            drop(state);
            self.set_gate(true, "no ACK since reset");
            return;
        }

        let mut client_fps = state.client_render_fps;
        if client_fps <= 0.0 {
            client_fps = configured_fps;
        }
        if client_fps <= 0.0 {
            drop(state);
            self.set_gate(true, "client FPS unknown");
            return;
        }

        let sent = state.sent_id as i64;
        let acked = state.acked_id as i64;

        // A plain gap wider than half the id space is a wrap or reset
        // artifact, not a real backlog.
        if (sent - acked).unsigned_abs() as u32 > SUSPICIOUS_GAP_THRESHOLD {
            state.last_ack_update = now;
            drop(state);
            self.set_gate(true, "frame id wrap suspected");
            return;
        }

        let desync = frame_desync(state.sent_id, state.acked_id as u16);
        let allowed = (BACKPRESSURE_ALLOWED_DESYNC_MS / 1000.0) * client_fps;
        let rtt_ms = state.smoothed_rtt_ms;
        let latency_adjustment = if rtt_ms > BACKPRESSURE_LATENCY_THRESHOLD_MS {
            (rtt_ms / 1000.0) * client_fps
        } else {
            0.0
        };
        let effective = desync as f64 - latency_adjustment;
        let stalled = now.duration_since(state.last_ack_update) > STALLED_CLIENT_TIMEOUT;
        drop(state);

        if stalled {
            if self.send_enabled() {
                warn!(
                    "Client stall: no ACK update for over {:?} (last ACK {}). Gating frames.",
                    STALLED_CLIENT_TIMEOUT, acked
                );
            }
            self.send_enabled.store(false, Ordering::Relaxed);
        } else if effective > allowed {
            if desync > ABSURD_DESYNC_FRAMES {
                // Transient nonsense reading; keep the current gate.
                return;
            }
            if self.send_enabled() {
                warn!(
                    "Backpressure triggered. S:{} C:{} desync:{} effective:{:.1} > allowed:{:.1} \
                     (fps {:.1}, rtt {:.1}ms). Gating frames.",
                    sent, acked, desync, effective, allowed, client_fps, rtt_ms
                );
            }
            self.send_enabled.store(false, Ordering::Relaxed);
        } else {
            self.set_gate(true, "within allowed desync");
        }
    }

    fn set_gate(&self, enabled: bool, reason: &str) {
        let was = self.send_enabled.swap(enabled, Ordering::Relaxed);
        if was != enabled {
            info!(
                "Backpressure {}: {}.",
                if enabled { "lifted" } else { "engaged" },
                reason
            );
        }
    }

    #[cfg(test)]
    fn history_len(&self) -> usize {
        self.state.lock().history.len()
    }

    #[cfg(test)]
    fn backdate_last_ack(&self, age: Duration) {
        self.state.lock().last_ack_update = Instant::now() - age;
    }
}

impl Default for FlowController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn desync_wraps_forward() {
        assert_eq!(frame_desync(10, 65530), 15);
        assert_eq!(frame_desync(200, 100), 100);
        assert_eq!(frame_desync(100, 100), 0);
        assert_eq!(frame_desync(0, 65535), 1);
    }

    #[test]
    fn gate_open_with_zero_fps() {
        let flow = FlowController::new();
        flow.record_sent(500);
        flow.record_ack(1);
        flow.evaluate(0.0, Instant::now());
        assert!(flow.send_enabled());
    }

    #[test]
    fn gate_open_before_first_ack() {
        let flow = FlowController::new();
        flow.record_sent(400);
        flow.evaluate(30.0, Instant::now());
        assert!(flow.send_enabled());
    }

    #[test]
    fn gate_closes_on_desync_and_reopens_after_catchup() {
        let flow = FlowController::new();
        flow.set_client_fps(30.0);
        flow.record_sent(200);
        flow.record_ack(100);
        // desync 100 > allowed 60 (2s * 30fps), RTT below threshold
        flow.evaluate(30.0, Instant::now());
        assert!(!flow.send_enabled());

        flow.record_ack(180);
        // desync 20 < 60
        flow.evaluate(30.0, Instant::now());
        assert!(flow.send_enabled());
    }

    #[test]
    fn gate_closes_on_stalled_client() {
        let flow = FlowController::new();
        flow.set_client_fps(30.0);
        flow.record_sent(10);
        flow.record_ack(9);
        flow.backdate_last_ack(Duration::from_secs(5));
        flow.evaluate(30.0, Instant::now());
        assert!(!flow.send_enabled());
    }

    #[test]
    fn wrap_artifact_keeps_frames_flowing() {
        let flow = FlowController::new();
        flow.set_client_fps(30.0);
        flow.record_sent(10);
        flow.record_ack(60000);
        flow.evaluate(30.0, Instant::now());
        assert!(flow.send_enabled());
    }

    #[test]
    fn reset_zeroes_counters_and_opens_gate() {
        let flow = FlowController::new();
        flow.record_sent(123);
        flow.record_ack(120);
        flow.reset();
        assert_eq!(flow.last_sent_id(), 0);
        assert!(flow.send_enabled());
        // After reset the no-ACK branch applies again.
        flow.evaluate(30.0, Instant::now());
        assert!(flow.send_enabled());
    }

    #[test]
    fn sent_history_is_bounded() {
        let flow = FlowController::new();
        for i in 0..3000u32 {
            flow.record_sent((i % 65536) as u16);
        }
        assert!(flow.history_len() <= SENT_FRAME_TIMESTAMP_HISTORY_SIZE);
    }

    #[test]
    fn rtt_ring_is_bounded_and_averaged() {
        let flow = FlowController::new();
        for i in 0..100u16 {
            flow.record_sent(i);
            flow.record_ack(i);
        }
        // All samples are near zero; the mean must stay finite and small.
        assert!(flow.smoothed_rtt_ms() < 50.0);
    }
}
