//! Periodic system/GPU/network statistics
//!
//! Collectors refresh a shared slot map on their own cadence; a per-client
//! sender flushes pending entries every few seconds as JSON text frames.

use crate::broadcaster::{Broadcaster, ClientHandle};
use log::{debug, error, info};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;
use tokio::process::Command;

const SYSTEM_INTERVAL: Duration = Duration::from_secs(1);
const GPU_INTERVAL: Duration = Duration::from_secs(1);
const NETWORK_INTERVAL: Duration = Duration::from_secs(2);
const SEND_INTERVAL: Duration = Duration::from_secs(5);

/// Latest stats payloads, keyed by kind, consumed by the sender.
#[derive(Default)]
pub struct SharedStats {
    slots: Mutex<HashMap<&'static str, serde_json::Value>>,
}

impl SharedStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, kind: &'static str, value: serde_json::Value) {
        self.slots.lock().insert(kind, value);
    }

    pub fn take(&self, kind: &'static str) -> Option<serde_json::Value> {
        self.slots.lock().remove(kind)
    }
}

fn unix_timestamp() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

pub async fn collect_system_stats(shared: Arc<SharedStats>) {
    debug!("System monitor loop started, interval: {:?}", SYSTEM_INTERVAL);
    let mut sys = System::new();
    loop {
        sys.refresh_cpu();
        sys.refresh_memory();
        shared.put(
            "system",
            json!({
                "type": "system_stats",
                "timestamp": unix_timestamp(),
                "cpu_percent": sys.global_cpu_info().cpu_usage(),
                "mem_total": sys.total_memory(),
                "mem_used": sys.used_memory(),
            }),
        );
        tokio::time::sleep(SYSTEM_INTERVAL).await;
    }
}

/// GPU stats come from nvidia-smi; the task exits quietly when the tool is
/// absent or stops answering.
pub async fn collect_gpu_stats(shared: Arc<SharedStats>, gpu_id: u32) {
    if !crate::x11::which("nvidia-smi") {
        debug!("nvidia-smi not found; GPU monitor disabled");
        return;
    }
    debug!("GPU monitor loop for GPU {}", gpu_id);
    loop {
        let output = Command::new("nvidia-smi")
            .args([
                "--query-gpu=utilization.gpu,memory.total,memory.used",
                "--format=csv,noheader,nounits",
                &format!("--id={}", gpu_id),
            ])
            .output()
            .await;
        match output {
            Ok(output) if output.status.success() => {
                let text = String::from_utf8_lossy(&output.stdout);
                let fields: Vec<f64> = text
                    .trim()
                    .split(',')
                    .filter_map(|f| f.trim().parse().ok())
                    .collect();
                if fields.len() == 3 {
                    shared.put(
                        "gpu",
                        json!({
                            "type": "gpu_stats",
                            "timestamp": unix_timestamp(),
                            "gpu_id": gpu_id,
                            "load": fields[0] / 100.0,
                            "memory_total": (fields[1] * 1024.0 * 1024.0) as u64,
                            "memory_used": (fields[2] * 1024.0 * 1024.0) as u64,
                        }),
                    );
                }
            }
            _ => {
                error!("GPU {} no longer answering; stopping GPU monitor", gpu_id);
                return;
            }
        }
        tokio::time::sleep(GPU_INTERVAL).await;
    }
}

/// Outbound bandwidth over the broadcaster's send counter.
pub async fn collect_network_stats(shared: Arc<SharedStats>, broadcaster: Arc<Broadcaster>) {
    let mut last_bytes = broadcaster.bytes_sent();
    loop {
        tokio::time::sleep(NETWORK_INTERVAL).await;
        let now_bytes = broadcaster.bytes_sent();
        let delta = now_bytes.saturating_sub(last_bytes);
        last_bytes = now_bytes;
        shared.put(
            "network",
            json!({
                "type": "network_stats",
                "timestamp": unix_timestamp(),
                "bytes_per_second": delta / NETWORK_INTERVAL.as_secs().max(1),
            }),
        );
    }
}

/// Flush pending stats to one client every 5 s.
pub async fn send_stats_periodically(client: ClientHandle, shared: Arc<SharedStats>) {
    loop {
        tokio::time::sleep(SEND_INTERVAL).await;
        for kind in ["system", "gpu", "network"] {
            if let Some(value) = shared.take(kind) {
                client.send_text(value.to_string());
            }
        }
    }
}

/// Log a one-line startup summary of the host.
pub fn log_host_summary() {
    let mut sys = System::new();
    sys.refresh_memory();
    info!(
        "Host: {} cpus, {} MiB memory",
        sys.cpus().len().max(num_cpus_fallback()),
        sys.total_memory() / (1024 * 1024)
    );
}

fn num_cpus_fallback() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_are_consumed_once() {
        let stats = SharedStats::new();
        stats.put("system", json!({"type": "system_stats"}));
        assert!(stats.take("system").is_some());
        assert!(stats.take("system").is_none());
        assert!(stats.take("gpu").is_none());
    }
}
