use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::{DashMap, DashSet};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;

use super::bus::UpstreamSink;
use super::protocol::ServerEvent;

pub type FrameSender = mpsc::UnboundedSender<Message>;

pub(crate) struct ConnectionHandle {
    tx: FrameSender,
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RouterMetrics {
    pub messages_routed: AtomicU64,
    pub frames_delivered: AtomicU64,
    pub frames_dropped: AtomicU64,
}

impl RouterMetrics {
    fn record(&self, delivered: u64, dropped: u64) {
        self.messages_routed.fetch_add(1, Ordering::Relaxed);
        self.frames_delivered.fetch_add(delivered, Ordering::Relaxed);
        if dropped > 0 {
            self.frames_dropped.fetch_add(dropped, Ordering::Relaxed);
        }
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Local transport-level room membership and delivery of upstream messages.
///
/// Holds only this process's connections. Cluster-wide bookkeeping lives in
/// the shared store and is owned by the broker.
#[derive(Default)]
pub struct FanoutRouter {
    connections: DashMap<String, ConnectionHandle>,
    room_members: DashMap<String, DashSet<String>>,
    conn_rooms: DashMap<String, DashSet<String>>,
    metrics: RouterMetrics,
}

impl FanoutRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a live connection. Returns false when `max_connections` is
    /// already reached.
    pub fn register(&self, conn_id: &str, tx: FrameSender, max_connections: usize) -> bool {
        if self.connections.len() >= max_connections {
            return false;
        }
        self.connections
            .insert(conn_id.to_owned(), ConnectionHandle { tx });
        true
    }

    pub fn is_connected(&self, conn_id: &str) -> bool {
        self.connections.contains_key(conn_id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Drop a connection and every transport-level room membership it held.
    /// Returns the rooms it was removed from.
    pub fn unregister(&self, conn_id: &str) -> Vec<String> {
        self.connections.remove(conn_id);
        let Some((_, rooms)) = self.conn_rooms.remove(conn_id) else {
            return Vec::new();
        };
        let mut left = Vec::with_capacity(rooms.len());
        for room in rooms {
            if let Some(members) = self.room_members.get(&room) {
                members.remove(conn_id);
                if members.is_empty() {
                    drop(members);
                    self.room_members.remove_if(&room, |_, m| m.is_empty());
                }
            }
            left.push(room);
        }
        left
    }

    /// Make `conn_id` a recipient for `room`. Idempotent.
    pub fn add_member(&self, conn_id: &str, room: &str) {
        self.room_members
            .entry(room.to_owned())
            .or_default()
            .insert(conn_id.to_owned());
        self.conn_rooms
            .entry(conn_id.to_owned())
            .or_default()
            .insert(room.to_owned());
    }

    pub fn is_member(&self, conn_id: &str, room: &str) -> bool {
        self.room_members
            .get(room)
            .is_some_and(|m| m.contains(conn_id))
    }

    pub fn local_members(&self, room: &str) -> usize {
        self.room_members.get(room).map_or(0, |m| m.len())
    }

    /// Stop delivering `room` to `conn_id`. Missing entries are ignored.
    pub fn remove_member(&self, conn_id: &str, room: &str) {
        if let Some(members) = self.room_members.get(room) {
            members.remove(conn_id);
            if members.is_empty() {
                drop(members);
                self.room_members.remove_if(room, |_, m| m.is_empty());
            }
        }
        if let Some(rooms) = self.conn_rooms.get(conn_id) {
            rooms.remove(room);
        }
    }

    /// Ask every local connection to close (shutdown path).
    pub fn close_all(&self) {
        for handle in self.connections.iter() {
            let _ = handle.tx.send(Message::Close(None));
        }
    }

    pub fn metrics(&self) -> &RouterMetrics {
        &self.metrics
    }

    /// Collect sender handles for a room's members. Map guards are released
    /// before any frame is sent.
    fn collect_room_senders(&self, room: &str) -> Vec<FrameSender> {
        let Some(members) = self.room_members.get(room) else {
            return Vec::new();
        };
        members
            .iter()
            .filter_map(|cid| self.connections.get(cid.key()).map(|h| h.tx.clone()))
            .collect()
    }

    /// Deliver `payload` unchanged as a `room-update` to every local member of
    /// `room`. Returns the number of connections the frame was queued for.
    pub fn dispatch(&self, room: &str, payload: &str) -> usize {
        let senders = self.collect_room_senders(room);
        if senders.is_empty() {
            return 0;
        }
        let msg = Message::Text(ServerEvent::RoomUpdate(payload).to_text().into());
        let mut delivered = 0u64;
        let mut dropped = 0u64;
        for tx in &senders {
            if tx.send(msg.clone()).is_ok() {
                delivered += 1;
            } else {
                dropped += 1;
            }
        }
        self.metrics.record(delivered, dropped);
        tracing::trace!(room, delivered, dropped, "room update fanned out");
        delivered as usize
    }
}

impl UpstreamSink for FanoutRouter {
    fn on_upstream_message(&self, room: &str, payload: &str) {
        self.dispatch(room, payload);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn connect(router: &FanoutRouter, id: &str) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        assert!(router.register(id, tx, usize::MAX));
        rx
    }

    fn room_update_data(msg: Message) -> String {
        let Message::Text(text) = msg else {
            panic!("expected text frame");
        };
        let v: Value = serde_json::from_str(text.as_str()).unwrap();
        assert_eq!(v["event"], "room-update");
        v["data"].as_str().unwrap().to_string()
    }

    #[test]
    fn test_dispatch_reaches_only_room_members() {
        let router = FanoutRouter::new();
        let mut a = connect(&router, "a");
        let mut b = connect(&router, "b");
        let mut c = connect(&router, "c");
        router.add_member("a", "alpha");
        router.add_member("b", "alpha");
        router.add_member("c", "beta");

        assert_eq!(router.dispatch("alpha", "hello"), 2);
        assert_eq!(room_update_data(a.try_recv().unwrap()), "hello");
        assert_eq!(room_update_data(b.try_recv().unwrap()), "hello");
        assert!(c.try_recv().is_err());
    }

    #[test]
    fn test_dispatch_to_empty_room_is_noop() {
        let router = FanoutRouter::new();
        let mut a = connect(&router, "a");
        assert_eq!(router.dispatch("nobody-here", "x"), 0);
        assert!(a.try_recv().is_err());
        assert_eq!(router.metrics().messages_routed.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_unregister_removes_memberships() {
        let router = FanoutRouter::new();
        let _a = connect(&router, "a");
        router.add_member("a", "alpha");
        router.add_member("a", "beta");
        let mut left = router.unregister("a");
        left.sort();
        assert_eq!(left, ["alpha", "beta"]);
        assert!(!router.is_connected("a"));
        assert_eq!(router.local_members("alpha"), 0);
        assert_eq!(router.dispatch("alpha", "x"), 0);
        // second unregister is a no-op
        assert!(router.unregister("a").is_empty());
    }

    #[test]
    fn test_add_member_idempotent() {
        let router = FanoutRouter::new();
        let mut a = connect(&router, "a");
        router.add_member("a", "alpha");
        router.add_member("a", "alpha");
        assert_eq!(router.local_members("alpha"), 1);
        assert_eq!(router.dispatch("alpha", "once"), 1);
        assert!(a.try_recv().is_ok());
        assert!(a.try_recv().is_err());
    }

    #[test]
    fn test_remove_member_stops_delivery() {
        let router = FanoutRouter::new();
        let mut a = connect(&router, "a");
        router.add_member("a", "alpha");
        router.add_member("a", "beta");
        router.remove_member("a", "alpha");
        router.remove_member("a", "alpha");
        assert!(!router.is_member("a", "alpha"));
        assert_eq!(router.local_members("alpha"), 0);
        assert_eq!(router.dispatch("alpha", "x"), 0);
        assert!(a.try_recv().is_err());
        assert_eq!(router.unregister("a"), ["beta"]);
    }

    #[test]
    fn test_closed_receiver_counts_as_dropped() {
        let router = FanoutRouter::new();
        let rx = connect(&router, "a");
        router.add_member("a", "alpha");
        drop(rx);
        assert_eq!(router.dispatch("alpha", "x"), 0);
        assert_eq!(router.metrics().frames_dropped.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_register_respects_limit() {
        let router = FanoutRouter::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(router.register("a", tx.clone(), 1));
        assert!(!router.register("b", tx, 1));
        assert_eq!(router.connection_count(), 1);
    }

    #[test]
    fn test_upstream_sink_delivers_unchanged_payload() {
        let router = FanoutRouter::new();
        let mut a = connect(&router, "a");
        router.add_member("a", "alpha");
        let sink: &dyn UpstreamSink = &router;
        sink.on_upstream_message("alpha", "raw \"payload\"");
        assert_eq!(room_update_data(a.try_recv().unwrap()), "raw \"payload\"");
    }
}
