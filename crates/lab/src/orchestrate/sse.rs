//! Replayable event rings for SSE endpoints.
//!
//! Each manager keeps a bounded ring of `(id, payload)` events. A client
//! reconnecting with `Last-Event-ID` replays what it missed (as far back
//! as the ring reaches) and then follows the live feed.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::broadcast;

/// Live-feed fanout capacity.
const BROADCAST_CAPACITY: usize = 64;

/// A bounded ring of replayable events.
pub struct EventRing {
    capacity: usize,
    next_id: AtomicU64,
    ring: Mutex<VecDeque<(u64, Value)>>,
    tx: broadcast::Sender<(u64, Value)>,
}

impl EventRing {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            capacity,
            next_id: AtomicU64::new(1),
            ring: Mutex::new(VecDeque::with_capacity(capacity)),
            tx,
        }
    }

    /// Append an event; returns its id.
    pub fn push(&self, payload: Value) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        {
            let mut ring = self.ring.lock().expect("event ring poisoned");
            if ring.len() == self.capacity {
                ring.pop_front();
            }
            ring.push_back((id, payload.clone()));
        }
        let _ = self.tx.send((id, payload));
        id
    }

    /// Events after `last_id` still held by the ring, oldest first.
    pub fn replay_after(&self, last_id: u64) -> Vec<(u64, Value)> {
        let ring = self.ring.lock().expect("event ring poisoned");
        ring.iter()
            .filter(|(id, _)| *id > last_id)
            .cloned()
            .collect()
    }

    /// Follow the live feed.
    pub fn subscribe(&self) -> broadcast::Receiver<(u64, Value)> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn replay_respects_last_event_id() {
        let ring = EventRing::new(10);
        for i in 0..5 {
            ring.push(json!({"n": i}));
        }

        let replay = ring.replay_after(2);
        assert_eq!(replay.len(), 3);
        assert_eq!(replay[0].0, 3);
        assert_eq!(replay[2].1["n"], 4);
    }

    #[test]
    fn ring_is_bounded_and_drops_oldest() {
        let ring = EventRing::new(3);
        for i in 0..6 {
            ring.push(json!({"n": i}));
        }

        // Everything before the window is gone.
        let replay = ring.replay_after(0);
        assert_eq!(replay.len(), 3);
        assert_eq!(replay[0].0, 4);
    }

    #[tokio::test]
    async fn live_subscribers_see_pushes() {
        let ring = EventRing::new(4);
        let mut rx = ring.subscribe();
        ring.push(json!({"n": 1}));
        let (id, payload) = rx.recv().await.unwrap();
        assert_eq!(id, 1);
        assert_eq!(payload["n"], 1);
    }
}
