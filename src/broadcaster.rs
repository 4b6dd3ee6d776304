//! Process-wide client registry and fan-out
//!
//! Every connected WebSocket registers an outbound handle here. Encoded
//! media and broadcast text go to all live clients; per-client ordering is
//! preserved by each connection's single writer task draining its queue.

use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;
use uuid::Uuid;

/// Outbound handle for one connected client.
#[derive(Clone)]
pub struct ClientHandle {
    pub id: Uuid,
    sender: mpsc::UnboundedSender<Message>,
    last_pong: std::sync::Arc<Mutex<Instant>>,
}

impl ClientHandle {
    pub fn new(sender: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender,
            last_pong: std::sync::Arc::new(Mutex::new(Instant::now())),
        }
    }

    /// Send failures mean the writer task is gone; the reader path of that
    /// connection cleans up, so they are ignored here.
    pub fn send_text(&self, text: String) {
        let _ = self.sender.send(Message::Text(text));
    }

    pub fn send_binary(&self, payload: Vec<u8>) {
        let _ = self.sender.send(Message::Binary(payload));
    }

    pub fn send_ping(&self) {
        let _ = self.sender.send(Message::Ping(Vec::new()));
    }

    pub fn send_pong(&self, payload: Vec<u8>) {
        let _ = self.sender.send(Message::Pong(payload));
    }

    pub fn send_close(&self) {
        let _ = self.sender.send(Message::Close(None));
    }

    pub fn record_pong(&self) {
        *self.last_pong.lock() = Instant::now();
    }

    pub fn pong_age(&self) -> std::time::Duration {
        self.last_pong.lock().elapsed()
    }
}

/// Registry of live clients plus replay state for late joiners.
pub struct Broadcaster {
    clients: Mutex<HashMap<Uuid, ClientHandle>>,
    last_cursor_message: Mutex<Option<String>>,
    last_resolution_message: Mutex<Option<String>>,
    bytes_sent: AtomicU64,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            last_cursor_message: Mutex::new(None),
            last_resolution_message: Mutex::new(None),
            bytes_sent: AtomicU64::new(0),
        }
    }

    pub fn add(&self, client: ClientHandle) {
        self.clients.lock().insert(client.id, client);
    }

    pub fn remove(&self, id: &Uuid) {
        self.clients.lock().remove(id);
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.lock().is_empty()
    }

    /// Snapshot of every live client except `exclude`.
    pub fn peers_of(&self, exclude: &Uuid) -> Vec<ClientHandle> {
        self.clients
            .lock()
            .values()
            .filter(|c| c.id != *exclude)
            .cloned()
            .collect()
    }

    pub fn broadcast_text(&self, text: &str) {
        let clients = self.clients.lock();
        if clients.is_empty() {
            return;
        }
        self.bytes_sent
            .fetch_add((text.len() * clients.len()) as u64, Ordering::Relaxed);
        for client in clients.values() {
            client.send_text(text.to_string());
        }
    }

    pub fn broadcast_binary(&self, payload: &[u8]) {
        let clients = self.clients.lock();
        if clients.is_empty() {
            return;
        }
        self.bytes_sent
            .fetch_add((payload.len() * clients.len()) as u64, Ordering::Relaxed);
        for client in clients.values() {
            client.send_binary(payload.to_vec());
        }
    }

    /// Total bytes handed to client queues since startup; the network stats
    /// task differences this counter over its interval.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn set_cursor_message(&self, message: String) {
        *self.last_cursor_message.lock() = Some(message);
    }

    pub fn last_cursor_message(&self) -> Option<String> {
        self.last_cursor_message.lock().clone()
    }

    pub fn set_resolution_message(&self, message: String) {
        *self.last_resolution_message.lock() = Some(message);
    }

    pub fn last_resolution_message(&self) -> Option<String> {
        self.last_resolution_message.lock().clone()
    }

    /// Send the cached cursor to a newly connected client so it sees the
    /// correct pointer before the first cursor change.
    pub fn replay_cursor(&self, client: &ClientHandle) {
        if let Some(message) = self.last_cursor_message() {
            debug!("Replaying cached cursor to client {}", client.id);
            client.send_text(message);
        }
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client() -> (ClientHandle, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ClientHandle::new(tx), rx)
    }

    #[test]
    fn membership_is_idempotent() {
        let broadcaster = Broadcaster::new();
        let (client, _rx) = test_client();
        let id = client.id;
        broadcaster.add(client.clone());
        broadcaster.add(client);
        assert_eq!(broadcaster.client_count(), 1);
        broadcaster.remove(&id);
        broadcaster.remove(&id);
        assert!(broadcaster.is_empty());
    }

    #[test]
    fn broadcast_reaches_all_clients_in_order() {
        let broadcaster = Broadcaster::new();
        let (a, mut rx_a) = test_client();
        let (b, mut rx_b) = test_client();
        broadcaster.add(a);
        broadcaster.add(b);

        broadcaster.broadcast_text("first");
        broadcaster.broadcast_binary(&[0x03, 0x00, 0x01]);

        for rx in [&mut rx_a, &mut rx_b] {
            match rx.try_recv().expect("text") {
                Message::Text(text) => assert_eq!(text, "first"),
                other => panic!("unexpected message: {:?}", other),
            }
            match rx.try_recv().expect("binary") {
                Message::Binary(payload) => assert_eq!(payload, vec![0x03, 0x00, 0x01]),
                other => panic!("unexpected message: {:?}", other),
            }
        }
    }

    #[test]
    fn dead_client_does_not_poison_broadcast() {
        let broadcaster = Broadcaster::new();
        let (a, rx_a) = test_client();
        let (b, mut rx_b) = test_client();
        broadcaster.add(a);
        broadcaster.add(b);
        drop(rx_a);
        broadcaster.broadcast_text("still alive");
        match rx_b.try_recv().expect("delivered") {
            Message::Text(text) => assert_eq!(text, "still alive"),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn cursor_replay_uses_cache() {
        let broadcaster = Broadcaster::new();
        let (client, mut rx) = test_client();
        broadcaster.replay_cursor(&client);
        assert!(rx.try_recv().is_err());

        broadcaster.set_cursor_message("cursor,{\"width\":8}".to_string());
        broadcaster.replay_cursor(&client);
        match rx.try_recv().expect("cursor") {
            Message::Text(text) => assert!(text.starts_with("cursor,")),
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
