//! Transport abstraction and the in-process channel implementation.
//!
//! The sync core only ever sees two things: a [`Connection`] it can emit
//! events to, and a [`Transport`] it can broadcast through. The WebSocket
//! front-end implements both over real sockets; [`ChannelTransport`] and
//! [`LocalConnection`] implement them over tokio channels for embedding
//! the engine in-process and for tests.
//!
//! Fan-out uses one tokio broadcast channel per room, so a send is O(1)
//! regardless of member count. Each subscriber buffers up to `capacity`
//! frames; lagging subscribers drop the oldest.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use serde_json::Value;
use tokio::sync::broadcast;

use crate::protocol::Frame;

/// One client connection, as seen by the sync core.
pub trait Connection: Send + Sync {
    /// Stable connection identifier; doubles as the client key in rooms.
    fn id(&self) -> &str;
    /// Identity forwarded to the adapter.
    fn user_id(&self) -> String;
    /// Register this connection for the room's broadcasts.
    fn join(&self, room: &str);
    /// Push an event to this connection only.
    fn emit(&self, event: &str, payload: Value);
}

/// Room-addressed broadcast, the `.to(room).emit(...)` contract.
pub trait Transport: Send + Sync {
    fn broadcast(&self, room: &str, event: &str, payload: Value);
}

struct RoomChannel {
    sender: broadcast::Sender<Frame>,
}

/// Per-room broadcast fan-out over tokio channels.
pub struct ChannelTransport {
    rooms: RwLock<HashMap<String, RoomChannel>>,
    capacity: usize,
    frames_sent: AtomicU64,
}

impl ChannelTransport {
    /// `capacity` is the number of frames buffered per subscriber before
    /// backpressure starts dropping the oldest.
    pub fn new(capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            capacity,
            frames_sent: AtomicU64::new(0),
        }
    }

    /// Subscribe to a room's broadcasts, creating the channel on demand.
    pub fn subscribe(&self, room: &str) -> broadcast::Receiver<Frame> {
        if let Some(channel) = self.rooms.read().expect("transport lock").get(room) {
            return channel.sender.subscribe();
        }
        let mut rooms = self.rooms.write().expect("transport lock");
        let channel = rooms.entry(room.to_string()).or_insert_with(|| {
            let (sender, _) = broadcast::channel(self.capacity);
            RoomChannel { sender }
        });
        channel.sender.subscribe()
    }

    /// Number of rooms with a live channel.
    pub fn room_count(&self) -> usize {
        self.rooms.read().expect("transport lock").len()
    }

    /// Total frames broadcast since construction.
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Transport for ChannelTransport {
    fn broadcast(&self, room: &str, event: &str, payload: Value) {
        let rooms = self.rooms.read().expect("transport lock");
        if let Some(channel) = rooms.get(room) {
            // send only fails when nobody is subscribed, which is fine.
            let _ = channel.sender.send(Frame::event(event, payload));
            self.frames_sent.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// In-process connection: joined rooms and emitted events are recorded
/// and can be inspected, which is what embedders and tests need.
pub struct LocalConnection {
    id: String,
    user_id: String,
    joined: Mutex<Vec<String>>,
    emitted: Mutex<Vec<(String, Value)>>,
}

impl LocalConnection {
    pub fn new(id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            joined: Mutex::new(Vec::new()),
            emitted: Mutex::new(Vec::new()),
        }
    }

    /// Rooms this connection has joined, in join order.
    pub fn joined(&self) -> Vec<String> {
        self.joined.lock().expect("connection lock").clone()
    }

    /// Events emitted directly to this connection, in emit order.
    pub fn emitted(&self) -> Vec<(String, Value)> {
        self.emitted.lock().expect("connection lock").clone()
    }
}

impl Connection for LocalConnection {
    fn id(&self) -> &str {
        &self.id
    }

    fn user_id(&self) -> String {
        self.user_id.clone()
    }

    fn join(&self, room: &str) {
        self.joined
            .lock()
            .expect("connection lock")
            .push(room.to_string());
    }

    fn emit(&self, event: &str, payload: Value) {
        self.emitted
            .lock()
            .expect("connection lock")
            .push((event.to_string(), payload));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::commands;
    use serde_json::json;

    #[tokio::test]
    async fn test_broadcast_reaches_all_subscribers() {
        let transport = ChannelTransport::new(16);
        let mut rx1 = transport.subscribe("r");
        let mut rx2 = transport.subscribe("r");

        transport.broadcast("r", commands::REMOTE_UPDATE_INCOMING, json!("c1"));

        let f1 = rx1.recv().await.unwrap();
        let f2 = rx2.recv().await.unwrap();
        assert_eq!(f1.event, commands::REMOTE_UPDATE_INCOMING);
        assert_eq!(f1.data, json!("c1"));
        assert_eq!(f2, f1);
    }

    #[tokio::test]
    async fn test_rooms_are_isolated() {
        let transport = ChannelTransport::new(16);
        let mut rx_a = transport.subscribe("a");
        let _rx_b = transport.subscribe("b");

        transport.broadcast("b", commands::REMOTE_UPDATE_INCOMING, json!("x"));
        assert!(rx_a.try_recv().is_err());
        assert_eq!(transport.room_count(), 2);
    }

    #[test]
    fn test_broadcast_without_subscribers_is_noop() {
        let transport = ChannelTransport::new(16);
        transport.broadcast("ghost", commands::ERROR, json!("nobody home"));
        assert_eq!(transport.frames_sent(), 0);
    }

    #[test]
    fn test_local_connection_records_activity() {
        let conn = LocalConnection::new("c1", "alice");
        conn.join("r");
        conn.emit(commands::ERROR, json!("Need to re-connect!"));

        assert_eq!(conn.id(), "c1");
        assert_eq!(conn.user_id(), "alice");
        assert_eq!(conn.joined(), vec!["r".to_string()]);
        assert_eq!(
            conn.emitted(),
            vec![(commands::ERROR.to_string(), json!("Need to re-connect!"))]
        );
    }
}
