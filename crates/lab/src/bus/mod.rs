//! Multiplayer channel bus: typed pub/sub over one WebSocket endpoint.
//!
//! The bus core is transport-only: it tracks connections and their
//! subscriptions and fans deltas out. Channel semantics (snapshot loaders,
//! authorization, client-event handlers, reference-counting hooks) live in
//! [`handler`] and [`snapshots`].

pub mod handler;
pub mod snapshots;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use log::{debug, warn};
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use lab_protocol::{ChannelKind, ChannelPath, Delta, ServerMessage};

/// Pending-message cap per subscriber; beyond it messages are dropped
/// with a warning rather than blocking publishers.
const CONNECTION_BUFFER_SIZE: usize = 1024;

/// Identifier for one WebSocket connection.
pub type ConnId = u64;

/// The bus: connection registry plus subscription table.
///
/// Fan-out never blocks a publisher: sends use `try_send` against each
/// subscriber's bounded queue and overflow drops the message for that
/// subscriber only.
pub struct ChannelBus {
    next_conn_id: AtomicU64,
    connections: DashMap<ConnId, mpsc::Sender<ServerMessage>>,
    subscriptions: DashMap<ChannelPath, HashSet<ConnId>>,
}

impl ChannelBus {
    pub fn new() -> Self {
        Self {
            next_conn_id: AtomicU64::new(1),
            connections: DashMap::new(),
            subscriptions: DashMap::new(),
        }
    }

    /// Register a new connection; returns its id and the message queue the
    /// socket task drains.
    pub fn register_connection(&self) -> (ConnId, mpsc::Receiver<ServerMessage>) {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(CONNECTION_BUFFER_SIZE);
        self.connections.insert(conn_id, tx);
        debug!("Bus connection {} registered", conn_id);
        (conn_id, rx)
    }

    /// Drop a connection and all of its subscriptions.
    ///
    /// Returns the paths the connection was subscribed to, with a flag for
    /// each marking whether it now has zero subscribers (so callers can
    /// fire last-unsubscribe hooks).
    pub fn unregister_connection(&self, conn_id: ConnId) -> Vec<(ChannelPath, bool)> {
        self.connections.remove(&conn_id);

        let mut affected = Vec::new();
        for mut entry in self.subscriptions.iter_mut() {
            if entry.value_mut().remove(&conn_id) {
                affected.push((*entry.key(), entry.value().is_empty()));
            }
        }
        self.subscriptions.retain(|_, subs| !subs.is_empty());

        debug!("Bus connection {} unregistered", conn_id);
        affected
    }

    /// Record a subscription. Returns true when this is the path's first
    /// subscriber.
    pub fn subscribe(&self, conn_id: ConnId, path: ChannelPath) -> bool {
        let mut entry = self.subscriptions.entry(path).or_default();
        let first = entry.is_empty();
        entry.insert(conn_id);
        first
    }

    /// Remove a subscription. Returns true when the path now has zero
    /// subscribers.
    pub fn unsubscribe(&self, conn_id: ConnId, path: &ChannelPath) -> bool {
        let Some(mut entry) = self.subscriptions.get_mut(path) else {
            return false;
        };
        entry.remove(&conn_id);
        let empty = entry.is_empty();
        drop(entry);
        if empty {
            self.subscriptions.remove(path);
        }
        empty
    }

    pub fn is_subscribed(&self, conn_id: ConnId, path: &ChannelPath) -> bool {
        self.subscriptions
            .get(path)
            .is_some_and(|subs| subs.contains(&conn_id))
    }

    pub fn subscriber_count(&self, path: &ChannelPath) -> usize {
        self.subscriptions.get(path).map(|s| s.len()).unwrap_or(0)
    }

    /// Queue a message for one connection, dropping on overflow.
    pub fn send_to(&self, conn_id: ConnId, message: ServerMessage) {
        let Some(tx) = self.connections.get(&conn_id) else {
            return;
        };
        if tx.try_send(message).is_err() {
            warn!(
                "Dropping message for slow bus connection {} (queue > {})",
                conn_id, CONNECTION_BUFFER_SIZE
            );
        }
    }

    /// Publish a delta to everyone subscribed to `kind` with `param`.
    pub fn publish_delta(&self, kind: ChannelKind, param: Option<Uuid>, delta: Delta) {
        let path = ChannelPath { kind, param };
        self.fan_out(&path, ServerMessage::Delta {
            channel: path.to_string(),
            data: delta,
        });
    }

    /// Publish a server event to everyone subscribed to `kind` with
    /// `param`.
    pub fn publish_event(&self, kind: ChannelKind, param: Option<Uuid>, data: Value) {
        let path = ChannelPath { kind, param };
        self.fan_out(&path, ServerMessage::Event {
            channel: path.to_string(),
            data,
        });
    }

    fn fan_out(&self, path: &ChannelPath, message: ServerMessage) {
        let Some(subs) = self.subscriptions.get(path) else {
            return;
        };
        for conn_id in subs.iter() {
            self.send_to(*conn_id, message.clone());
        }
    }
}

impl Default for ChannelBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sessions_path() -> ChannelPath {
        ChannelPath::global(ChannelKind::Sessions)
    }

    #[tokio::test]
    async fn deltas_reach_only_matching_subscribers() {
        let bus = ChannelBus::new();
        let (a, mut rx_a) = bus.register_connection();
        let (b, mut rx_b) = bus.register_connection();

        bus.subscribe(a, sessions_path());
        let other = ChannelPath::scoped(ChannelKind::SessionContainers, Uuid::new_v4());
        bus.subscribe(b, other);

        bus.publish_delta(ChannelKind::Sessions, None, Delta::add(&json!({"id": "s1"})));

        let got = rx_a.try_recv().unwrap();
        assert!(matches!(got, ServerMessage::Delta { .. }));
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn publisher_order_is_preserved_per_subscriber() {
        let bus = ChannelBus::new();
        let (a, mut rx) = bus.register_connection();
        bus.subscribe(a, sessions_path());

        for i in 0..10 {
            bus.publish_delta(
                ChannelKind::Sessions,
                None,
                Delta::add(&json!({"id": i})),
            );
        }

        for i in 0..10 {
            match rx.try_recv().unwrap() {
                ServerMessage::Delta { data: Delta::Add { item }, .. } => {
                    assert_eq!(item["id"], i);
                }
                other => panic!("unexpected message: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn first_and_last_subscriber_transitions() {
        let bus = ChannelBus::new();
        let (a, _rx_a) = bus.register_connection();
        let (b, _rx_b) = bus.register_connection();
        let path = ChannelPath::scoped(ChannelKind::SessionBrowserFrames, Uuid::new_v4());

        assert!(bus.subscribe(a, path));
        assert!(!bus.subscribe(b, path));
        assert!(!bus.unsubscribe(a, &path));
        assert!(bus.unsubscribe(b, &path));
    }

    #[tokio::test]
    async fn unregister_reports_emptied_paths() {
        let bus = ChannelBus::new();
        let (a, _rx_a) = bus.register_connection();
        let (b, _rx_b) = bus.register_connection();
        let solo = ChannelPath::scoped(ChannelKind::SessionLogs, Uuid::new_v4());
        let shared = sessions_path();

        bus.subscribe(a, solo);
        bus.subscribe(a, shared);
        bus.subscribe(b, shared);

        let affected = bus.unregister_connection(a);
        let now_empty: Vec<bool> = affected
            .iter()
            .filter(|(path, _)| *path == solo)
            .map(|(_, empty)| *empty)
            .collect();
        assert_eq!(now_empty, vec![true]);

        let shared_empty = affected
            .iter()
            .find(|(path, _)| *path == shared)
            .map(|(_, empty)| *empty)
            .unwrap();
        assert!(!shared_empty);
    }

    #[tokio::test]
    async fn slow_subscriber_messages_are_dropped_not_blocking() {
        let bus = ChannelBus::new();
        let (a, mut rx) = bus.register_connection();
        bus.subscribe(a, sessions_path());

        // Overfill the queue; publishes must not block.
        for i in 0..(CONNECTION_BUFFER_SIZE + 10) {
            bus.publish_delta(
                ChannelKind::Sessions,
                None,
                Delta::add(&json!({"id": i})),
            );
        }

        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, CONNECTION_BUFFER_SIZE);
    }
}
