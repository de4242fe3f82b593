//! Fan-out broadcast with backpressure.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers. Each
//! subscriber gets an independent receiver that buffers up to `capacity`
//! messages; a subscriber that falls further behind loses the oldest ones
//! and reports the gap through [`BroadcastGroup::record_lag`].
//!
//! The same group type carries the engine's write events and the relay's
//! per-namespace rooms.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_lagged: u64,
    pub active_peers: usize,
}

/// Lock-free counters updated on the send path.
#[derive(Debug, Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_lagged: AtomicU64,
}

/// A broadcast group for one topic.
///
/// Senders receive their own messages too; filtering by origin is the
/// caller's job.
#[derive(Debug)]
pub struct BroadcastGroup<T> {
    sender: broadcast::Sender<T>,
    peers: RwLock<HashSet<Uuid>>,
    capacity: usize,
    atomic_stats: AtomicBroadcastStats,
}

impl<T: Clone> BroadcastGroup<T> {
    /// Create a group buffering up to `capacity` messages per receiver.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: RwLock::new(HashSet::new()),
            capacity,
            atomic_stats: AtomicBroadcastStats::default(),
        }
    }

    /// Register a peer and return its receiver.
    pub async fn add_peer(&self, peer_id: Uuid) -> broadcast::Receiver<T> {
        self.peers.write().await.insert(peer_id);
        self.sender.subscribe()
    }

    /// Returns whether the peer was registered.
    pub async fn remove_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.write().await.remove(peer_id)
    }

    /// Subscribe without registering as a peer.
    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.sender.subscribe()
    }

    /// Send to every current receiver. Returns the receiver count.
    pub fn broadcast(&self, msg: T) -> usize {
        let count = self.sender.send(msg).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Note that a receiver skipped `skipped` messages.
    pub fn record_lag(&self, skipped: u64) {
        self.atomic_stats
            .messages_lagged
            .fetch_add(skipped, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn has_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.read().await.contains(peer_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_lagged: self.atomic_stats.messages_lagged.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Maps room keys to broadcast groups so traffic stays isolated per key.
#[derive(Debug)]
pub struct RoomManager<K, T> {
    rooms: RwLock<HashMap<K, Arc<BroadcastGroup<T>>>>,
    default_capacity: usize,
}

impl<K, T> RoomManager<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone,
{
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Get or create the room for `key`.
    pub async fn get_or_create(&self, key: &K) -> Arc<BroadcastGroup<T>> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(key) {
                return Arc::clone(room);
            }
        }

        let mut rooms = self.rooms.write().await;
        // Another task may have created it between the two locks.
        if let Some(room) = rooms.get(key) {
            return Arc::clone(room);
        }
        let room = Arc::new(BroadcastGroup::new(self.default_capacity));
        rooms.insert(key.clone(), Arc::clone(&room));
        room
    }

    /// Drop the room if nobody is registered in it.
    pub async fn remove_if_empty(&self, key: &K) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(key) {
            if room.peer_count().await == 0 {
                rooms.remove(key);
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<K> {
        self.rooms.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_group_add_remove() {
        let group: BroadcastGroup<u32> = BroadcastGroup::new(16);
        let peer = Uuid::new_v4();

        let _rx = group.add_peer(peer).await;
        assert_eq!(group.peer_count().await, 1);
        assert!(group.has_peer(&peer).await);

        assert!(group.remove_peer(&peer).await);
        assert_eq!(group.peer_count().await, 0);
        assert!(!group.remove_peer(&peer).await);
    }

    #[tokio::test]
    async fn test_broadcast_fan_out() {
        let group = BroadcastGroup::new(16);
        let mut rx1 = group.add_peer(Uuid::new_v4()).await;
        let mut rx2 = group.add_peer(Uuid::new_v4()).await;
        let mut rx3 = group.subscribe();

        let count = group.broadcast(Arc::new(vec![1u8, 2, 3]));
        assert_eq!(count, 3);

        for rx in [&mut rx1, &mut rx2, &mut rx3] {
            assert_eq!(*rx.recv().await.unwrap(), vec![1, 2, 3]);
        }
    }

    #[tokio::test]
    async fn test_broadcast_without_receivers() {
        let group: BroadcastGroup<u8> = BroadcastGroup::new(4);
        assert_eq!(group.broadcast(1), 0);
        assert_eq!(group.stats().await.messages_sent, 1);
    }

    #[tokio::test]
    async fn test_lagging_receiver() {
        let group = BroadcastGroup::new(2);
        let mut rx = group.subscribe();
        for i in 0..5u8 {
            group.broadcast(i);
        }

        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => group.record_lag(n),
            other => panic!("expected lag, got {other:?}"),
        }
        assert_eq!(group.stats().await.messages_lagged, 3);
        assert_eq!(rx.recv().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_broadcast_stats() {
        let group = BroadcastGroup::new(16);
        let _rx = group.add_peer(Uuid::new_v4()).await;
        group.broadcast("a");
        group.broadcast("b");

        let stats = group.stats().await;
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.active_peers, 1);
        assert_eq!(group.capacity(), 16);
    }

    #[tokio::test]
    async fn test_room_manager_get_or_create() {
        let manager: RoomManager<String, u8> = RoomManager::new(16);
        let key = "users:1".to_string();

        let room1 = manager.get_or_create(&key).await;
        let room2 = manager.get_or_create(&key).await;

        assert!(Arc::ptr_eq(&room1, &room2));
        assert_eq!(manager.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_room_manager_isolation() {
        let manager: RoomManager<&str, u8> = RoomManager::new(16);
        let room_a = manager.get_or_create(&"a").await;
        let room_b = manager.get_or_create(&"b").await;
        let mut rx_b = room_b.subscribe();

        room_a.broadcast(1);
        assert!(rx_b.try_recv().is_err());

        let rooms = manager.active_rooms().await;
        assert!(rooms.contains(&"a"));
        assert!(rooms.contains(&"b"));
    }

    #[tokio::test]
    async fn test_room_manager_cleanup() {
        let manager: RoomManager<u8, u8> = RoomManager::new(16);
        let room = manager.get_or_create(&1).await;
        let peer = Uuid::new_v4();
        let _rx = room.add_peer(peer).await;

        assert!(!manager.remove_if_empty(&1).await);
        room.remove_peer(&peer).await;
        assert!(manager.remove_if_empty(&1).await);
        assert_eq!(manager.room_count().await, 0);
    }
}
