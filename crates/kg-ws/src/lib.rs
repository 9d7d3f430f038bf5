//! WebSocket Broadcaster (C10).
//!
//! Nothing elsewhere wires up `axum`'s `ws` feature even though it's
//! declared in this workspace's dependency table, so this is authored fresh
//! in `axum`'s idiom: `axum::extract::ws::{WebSocketUpgrade, Message}` plus a
//! bounded per-client send buffer. Tokio's `mpsc` rejects sends once full
//! rather than evicting the oldest entry, so the buffer here is a
//! `Mutex<VecDeque<Message>>` with an explicit drop-oldest push, matched to
//! a `Notify` that wakes the per-connection forwarding task.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use kg_dispatch::{DispatchEvent, EventHandler, HandlerError};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::{info, warn};
use uuid::Uuid;

/// Default send-buffer depth before the oldest queued message is dropped.
pub const MAX_PENDING: usize = 1000;

struct ClientBuffer {
    queue: Mutex<VecDeque<Message>>,
    notify: Notify,
    lagged: AtomicBool,
    capacity: usize,
}

impl ClientBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            lagged: AtomicBool::new(false),
            capacity,
        }
    }

    fn push(&self, msg: Message) {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        if queue.len() >= self.capacity {
            queue.pop_front();
            self.lagged.store(true, Ordering::Relaxed);
        }
        queue.push_back(msg);
        drop(queue);
        self.notify.notify_one();
    }

    async fn pop(&self) -> Message {
        loop {
            {
                let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(msg) = queue.pop_front() {
                    return msg;
                }
            }
            self.notify.notified().await;
        }
    }

    fn take_lagged(&self) -> bool {
        self.lagged.swap(false, Ordering::Relaxed)
    }
}

/// Registry of connected clients, keyed by a per-connection uuid, each
/// holding its own bounded send buffer.
#[derive(Clone)]
pub struct Broadcaster {
    clients: Arc<Mutex<HashMap<Uuid, Arc<ClientBuffer>>>>,
    max_pending: usize,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(MAX_PENDING)
    }
}

impl Broadcaster {
    pub fn new(max_pending: usize) -> Self {
        Self { clients: Arc::new(Mutex::new(HashMap::new())), max_pending }
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Drives one upgraded connection until the client disconnects. Spawns
    /// an internal forwarding task so a slow reader never blocks `broadcast`.
    pub async fn handle_socket(&self, socket: WebSocket) {
        let id = Uuid::new_v4();
        let buffer = Arc::new(ClientBuffer::new(self.max_pending));
        self.clients.lock().unwrap_or_else(|e| e.into_inner()).insert(id, Arc::clone(&buffer));
        info!(client_id = %id, "websocket client connected");

        let (mut sink, mut stream) = socket.split();

        let forward_buffer = Arc::clone(&buffer);
        let forward_task = tokio::spawn(async move {
            loop {
                let msg = forward_buffer.pop().await;
                if sink.send(msg).await.is_err() {
                    return;
                }
            }
        });

        while let Some(Ok(msg)) = stream.next().await {
            if let Message::Text(text) = &msg {
                if text.trim() == "resync" {
                    let lagged = buffer.take_lagged();
                    let ack = serde_json::json!({ "type": "resync_ack", "lagged": lagged });
                    buffer.push(Message::Text(ack.to_string().into()));
                }
            }
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }

        forward_task.abort();
        self.clients.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
        info!(client_id = %id, "websocket client disconnected");
    }

    fn broadcast_raw(&self, msg: Message) {
        let clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        for buffer in clients.values() {
            buffer.push(msg.clone());
        }
    }
}

#[async_trait]
impl EventHandler for Broadcaster {
    async fn handle(&self, event: &DispatchEvent) -> Result<(), HandlerError> {
        let payload = match event {
            DispatchEvent::NodeAccess(e) => serde_json::to_value(e),
            DispatchEvent::NodeMutation(e) => serde_json::to_value(e),
        }
        .map_err(|e| HandlerError(e.to_string()))?;

        if self.client_count() == 0 {
            return Ok(());
        }
        self.broadcast_raw(Message::Text(payload.to_string().into()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_buffer_drops_oldest_past_capacity() {
        let buffer = ClientBuffer::new(2);
        buffer.push(Message::Text("a".into()));
        buffer.push(Message::Text("b".into()));
        buffer.push(Message::Text("c".into()));

        assert!(buffer.take_lagged());
        let queue = buffer.queue.lock().unwrap();
        assert_eq!(queue.len(), 2);
        assert!(matches!(&queue[0], Message::Text(t) if t == "b"));
        assert!(matches!(&queue[1], Message::Text(t) if t == "c"));
    }

    #[test]
    fn client_buffer_does_not_flag_lag_under_capacity() {
        let buffer = ClientBuffer::new(5);
        buffer.push(Message::Text("a".into()));
        assert!(!buffer.take_lagged());
    }

    #[tokio::test]
    async fn broadcaster_starts_with_no_clients() {
        let broadcaster = Broadcaster::default();
        assert_eq!(broadcaster.client_count(), 0);
    }
}
