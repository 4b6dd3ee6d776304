//! Clipboard synchronization
//!
//! Inbound: single-frame and chunked clipboard writes from clients are
//! accumulated and piped into xclip. Outbound: a monitor polls the
//! clipboard every 500 ms and broadcasts changes, chunking large payloads.
//! Server-written content is remembered by hash so the monitor does not
//! echo it back.

use crate::broadcaster::Broadcaster;
use crate::protocol;
use base64::Engine;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use xxhash_rust::xxh64::xxh64;

const MONITOR_INTERVAL: Duration = Duration::from_millis(500);
const READ_TIMEOUT: Duration = Duration::from_secs(1);
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);
const MAX_CLIPBOARD_BYTES: usize = 16 * 1024 * 1024;

const BINARY_MIME_PREFERENCE: [&str; 5] = [
    "image/png",
    "image/jpeg",
    "image/bmp",
    "image/svg",
    "image/webp",
];

fn content_hash(mime_type: &str, data: &[u8]) -> u64 {
    xxh64(data, xxh64(mime_type.as_bytes(), 0))
}

/// Shared clipboard state between the inbound path and the monitor.
pub struct ClipboardSync {
    /// Hash of the last content the server itself wrote, to suppress echo.
    last_written: Mutex<Option<u64>>,
    pub binary_enabled: AtomicBool,
}

impl ClipboardSync {
    pub fn new(binary_enabled: bool) -> Self {
        Self {
            last_written: Mutex::new(None),
            binary_enabled: AtomicBool::new(binary_enabled),
        }
    }

    pub fn set_binary_enabled(&self, enabled: bool) {
        self.binary_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn binary_enabled(&self) -> bool {
        self.binary_enabled.load(Ordering::Relaxed)
    }

    fn mark_written(&self, mime_type: &str, data: &[u8]) {
        *self.last_written.lock() = Some(content_hash(mime_type, data));
    }

    fn was_written_by_server(&self, mime_type: &str, data: &[u8]) -> bool {
        *self.last_written.lock() == Some(content_hash(mime_type, data))
    }
}

async fn xclip_read(target: &str) -> Option<Vec<u8>> {
    let child = Command::new("xclip")
        .args(["-selection", "clipboard", "-o", "-t", target])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output();
    match tokio::time::timeout(READ_TIMEOUT, child).await {
        Ok(Ok(output)) if output.status.success() => Some(output.stdout),
        _ => None,
    }
}

/// Read the clipboard, preferring image formats when binary mode is on.
/// Returns the content bytes and their MIME type.
pub async fn read_clipboard(use_binary: bool) -> Option<(Vec<u8>, String)> {
    let targets_raw = xclip_read("TARGETS").await?;
    let targets = String::from_utf8_lossy(&targets_raw);
    let targets: Vec<&str> = targets.lines().map(|l| l.trim()).collect();

    if use_binary {
        for mime in BINARY_MIME_PREFERENCE {
            if targets.contains(&mime) {
                if let Some(data) = xclip_read(mime).await {
                    if !data.is_empty() {
                        return Some((data, mime.to_string()));
                    }
                }
            }
        }
    }
    if targets.contains(&"UTF8_STRING") {
        if let Some(data) = xclip_read("UTF8_STRING").await {
            return Some((data, "text/plain".to_string()));
        }
    }
    None
}

/// Pipe data into the clipboard with the given MIME type.
pub async fn write_clipboard(data: &[u8], mime_type: &str) -> bool {
    if data.is_empty() {
        return true;
    }
    let mut child = match Command::new("xclip")
        .args(["-selection", "clipboard", "-i", "-t", mime_type])
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            warn!("Failed to spawn xclip: {}", err);
            return false;
        }
    };
    if let Some(mut stdin) = child.stdin.take() {
        if stdin.write_all(data).await.is_err() {
            return false;
        }
        drop(stdin);
    }
    match tokio::time::timeout(WRITE_TIMEOUT, child.wait()).await {
        Ok(Ok(status)) if status.success() => true,
        Ok(Ok(status)) => {
            warn!("xclip exited with non-zero code: {}", status);
            false
        }
        Ok(Err(err)) => {
            warn!("Error waiting for xclip: {}", err);
            false
        }
        Err(_) => {
            warn!("Timeout waiting for xclip to terminate");
            false
        }
    }
}

/// Per-session accumulator for inbound clipboard transfers.
pub struct ClipboardReceiver {
    sync: Arc<ClipboardSync>,
    enabled: bool,
    buffer: Vec<u8>,
    total_size: usize,
    mime_type: String,
    in_progress: bool,
}

impl ClipboardReceiver {
    pub fn new(sync: Arc<ClipboardSync>, enabled: bool) -> Self {
        Self {
            sync,
            enabled,
            buffer: Vec::new(),
            total_size: 0,
            mime_type: "text/plain".to_string(),
            in_progress: false,
        }
    }

    pub async fn write_single_text(&mut self, data_b64: &str) {
        if !self.enabled {
            warn!("Rejecting clipboard write: inbound clipboard disabled");
            return;
        }
        let Ok(data) = base64::engine::general_purpose::STANDARD.decode(data_b64) else {
            error!("Clipboard decode error");
            return;
        };
        self.sync.mark_written("text/plain", &data);
        if write_clipboard(&data, "text/plain").await {
            info!("Set clipboard content, length: {}", data.len());
        }
    }

    pub async fn write_single_binary(&mut self, mime_type: &str, data_b64: &str) {
        if !self.enabled || !self.sync.binary_enabled() {
            warn!("Rejecting binary clipboard write: disabled");
            return;
        }
        let Ok(data) = base64::engine::general_purpose::STANDARD.decode(data_b64) else {
            error!("Binary clipboard decode error");
            return;
        };
        self.sync.mark_written(mime_type, &data);
        if write_clipboard(&data, mime_type).await {
            info!(
                "Set binary clipboard content ({}), size: {} bytes",
                mime_type,
                data.len()
            );
        }
    }

    pub fn start(&mut self, mime_type: &str, total_size: usize) {
        if !self.enabled {
            warn!("Rejecting multi-part clipboard write: inbound clipboard disabled");
            return;
        }
        if total_size > MAX_CLIPBOARD_BYTES {
            error!(
                "Rejecting multi-part clipboard of {} bytes (limit {})",
                total_size, MAX_CLIPBOARD_BYTES
            );
            return;
        }
        info!(
            "Starting multi-part clipboard receive ({}), total size: {}",
            mime_type, total_size
        );
        self.mime_type = mime_type.to_string();
        self.total_size = total_size;
        self.buffer = Vec::with_capacity(total_size.min(MAX_CLIPBOARD_BYTES));
        self.in_progress = true;
    }

    pub fn chunk(&mut self, data_b64: &str) {
        if !self.in_progress {
            return;
        }
        match base64::engine::general_purpose::STANDARD.decode(data_b64) {
            Ok(data) => {
                if self.buffer.len() + data.len() > MAX_CLIPBOARD_BYTES {
                    error!("Multi-part clipboard exceeded size limit; aborting");
                    self.abort();
                    return;
                }
                self.buffer.extend_from_slice(&data);
            }
            Err(err) => {
                error!("Failed to process clipboard data chunk: {}", err);
                self.abort();
            }
        }
    }

    /// Completes a transfer: the accumulator must match the declared size
    /// exactly or the content is discarded.
    pub async fn finish(&mut self) {
        if !self.in_progress {
            return;
        }
        self.in_progress = false;
        let data = std::mem::take(&mut self.buffer);
        if data.len() != self.total_size {
            error!(
                "Multi-part clipboard size mismatch. Expected {}, got {}. Aborting.",
                self.total_size,
                data.len()
            );
            return;
        }
        info!("Finished multi-part clipboard receive. Total size: {}", data.len());
        if self.mime_type != "text/plain" && !self.sync.binary_enabled() {
            warn!("Discarding multi-part binary clipboard: binary clipboard disabled");
            return;
        }
        self.sync.mark_written(&self.mime_type, &data);
        if write_clipboard(&data, &self.mime_type).await {
            info!(
                "Set multi-part clipboard content ({}), size: {} bytes",
                self.mime_type,
                data.len()
            );
        }
    }

    pub fn abort(&mut self) {
        self.buffer.clear();
        self.in_progress = false;
    }

    #[cfg(test)]
    fn received(&self) -> usize {
        self.buffer.len()
    }

    #[cfg(test)]
    fn is_in_progress(&self) -> bool {
        self.in_progress
    }
}

/// Read the clipboard once and broadcast its content to all clients.
pub async fn broadcast_clipboard(sync: &ClipboardSync, broadcaster: &Broadcaster) {
    if let Some((data, mime_type)) = read_clipboard(sync.binary_enabled()).await {
        for message in protocol::clipboard_messages(&data, &mime_type) {
            broadcaster.broadcast_text(&message);
        }
    } else {
        debug!("No clipboard content to send on request");
    }
}

/// Poll the clipboard and broadcast on change. Runs until `running` clears.
pub async fn run_clipboard_monitor(
    sync: Arc<ClipboardSync>,
    broadcaster: Arc<Broadcaster>,
    running: Arc<AtomicBool>,
) {
    info!("Clipboard monitor running");
    let mut last_hash: Option<u64> = None;
    while running.load(Ordering::Relaxed) {
        tokio::time::sleep(MONITOR_INTERVAL).await;
        let Some((data, mime_type)) = read_clipboard(sync.binary_enabled()).await else {
            continue;
        };
        let hash = content_hash(&mime_type, &data);
        if last_hash == Some(hash) {
            continue;
        }
        last_hash = Some(hash);
        if sync.was_written_by_server(&mime_type, &data) {
            continue;
        }
        info!(
            "Clipboard changed ({}, {} bytes); broadcasting",
            mime_type,
            data.len()
        );
        for message in protocol::clipboard_messages(&data, &mime_type) {
            broadcaster.broadcast_text(&message);
        }
    }
    info!("Clipboard monitor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn receiver() -> ClipboardReceiver {
        ClipboardReceiver::new(Arc::new(ClipboardSync::new(true)), true)
    }

    #[test]
    fn chunks_accumulate() {
        let mut rx = receiver();
        rx.start("image/png", 6);
        rx.chunk(&base64::engine::general_purpose::STANDARD.encode(b"abc"));
        rx.chunk(&base64::engine::general_purpose::STANDARD.encode(b"def"));
        assert_eq!(rx.received(), 6);
        assert!(rx.is_in_progress());
    }

    #[tokio::test]
    async fn size_mismatch_discards_transfer() {
        let mut rx = receiver();
        rx.start("text/plain", 100);
        rx.chunk(&base64::engine::general_purpose::STANDARD.encode(b"short"));
        rx.finish().await;
        assert!(!rx.is_in_progress());
        assert_eq!(rx.received(), 0);
    }

    #[test]
    fn bad_chunk_aborts_transfer() {
        let mut rx = receiver();
        rx.start("text/plain", 10);
        rx.chunk("not!!base64@@");
        assert!(!rx.is_in_progress());
    }

    #[test]
    fn oversized_transfer_is_rejected() {
        let mut rx = receiver();
        rx.start("image/png", MAX_CLIPBOARD_BYTES + 1);
        assert!(!rx.is_in_progress());
    }

    #[test]
    fn echo_suppression_matches_mime_and_content() {
        let sync = ClipboardSync::new(false);
        sync.mark_written("text/plain", b"hello");
        assert!(sync.was_written_by_server("text/plain", b"hello"));
        assert!(!sync.was_written_by_server("image/png", b"hello"));
        assert!(!sync.was_written_by_server("text/plain", b"other"));
    }
}
