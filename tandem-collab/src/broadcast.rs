//! Per-channel fan-out.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers. Each
//! subscriber gets an independent receiver buffering up to `capacity`
//! deliveries; a subscriber that falls further behind sees `Lagged` and
//! must resync.
//!
//! Both the in-process hub and the relay server route through these rooms.
//!
//! Performance target: 1,000 frames to 100 peers < 10ms

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tandem_core::ClientId;
use tokio::sync::{broadcast, RwLock};

use crate::protocol::ChannelId;

/// Who is connected to a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub client_id: ClientId,
    pub display_name: String,
}

impl PeerInfo {
    pub fn new(client_id: ClientId, display_name: impl Into<String>) -> Self {
        Self {
            client_id,
            display_name: display_name.into(),
        }
    }
}

/// One encoded frame plus the connection it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Subscribers skip deliveries carrying their own origin.
    pub origin: ClientId,
    pub bytes: Vec<u8>,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub active_peers: usize,
}

/// Lock-free counters on the hot path.
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    bytes_sent: AtomicU64,
}

/// A broadcast group for a single channel.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Delivery>>,
    peers: RwLock<HashMap<ClientId, PeerInfo>>,
    capacity: usize,
    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` bounds how far a slow subscriber may lag.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            capacity,
            stats: AtomicBroadcastStats::default(),
        }
    }

    /// Register a peer and subscribe it.
    pub async fn add_peer(&self, info: PeerInfo) -> broadcast::Receiver<Arc<Delivery>> {
        let mut peers = self.peers.write().await;
        peers.insert(info.client_id, info);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, client_id: &ClientId) -> Option<PeerInfo> {
        self.peers.write().await.remove(client_id)
    }

    /// Fan out to every subscriber (echo filtering is the receiver's job).
    ///
    /// Returns the number of receivers.
    pub fn broadcast(&self, origin: ClientId, bytes: Vec<u8>) -> usize {
        let len = bytes.len() as u64;
        let count = self
            .sender
            .send(Arc::new(Delivery { origin, bytes }))
            .unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_sent.fetch_add(len, Ordering::Relaxed);
        count
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn has_peer(&self, client_id: &ClientId) -> bool {
        self.peers.read().await.contains_key(client_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            bytes_sent: self.stats.bytes_sent.load(Ordering::Relaxed),
            active_peers: self.peer_count().await,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Subscribe without registering a peer.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Delivery>> {
        self.sender.subscribe()
    }
}

/// Maps channels to broadcast groups, isolating traffic per file.
pub struct RoomManager {
    rooms: RwLock<HashMap<ChannelId, Arc<BroadcastGroup>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Add `info` to the channel's room, creating the room if needed.
    ///
    /// The map stays write-locked until the peer is in, so `remove_if_empty`
    /// cannot drop a room between lookup and join. `None` when the room
    /// already holds `max_peers`.
    pub async fn join(
        &self,
        channel: &ChannelId,
        info: PeerInfo,
        max_peers: usize,
    ) -> Option<(Arc<BroadcastGroup>, broadcast::Receiver<Arc<Delivery>>)> {
        let mut rooms = self.rooms.write().await;
        let room = match rooms.get(channel) {
            Some(room) => {
                if room.peer_count().await >= max_peers {
                    return None;
                }
                room.clone()
            }
            None => {
                if max_peers == 0 {
                    return None;
                }
                log::debug!("Creating room {channel}");
                let room = Arc::new(BroadcastGroup::new(self.default_capacity));
                rooms.insert(channel.clone(), room.clone());
                room
            }
        };
        let rx = room.add_peer(info).await;
        Some((room, rx))
    }

    pub async fn get(&self, channel: &ChannelId) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(channel).cloned()
    }

    /// Drop the room if nobody is in it.
    pub async fn remove_if_empty(&self, channel: &ChannelId) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(channel) {
            if room.peer_count().await == 0 {
                rooms.remove(channel);
                log::debug!("Room {channel} removed (empty)");
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_channels(&self) -> Vec<ChannelId> {
        self.rooms.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn peer(name: &str) -> PeerInfo {
        PeerInfo::new(Uuid::new_v4(), name)
    }

    #[tokio::test]
    async fn test_broadcast_group_add_remove() {
        let group = BroadcastGroup::new(16);
        let alice = peer("Alice");
        let id = alice.client_id;

        let _rx = group.add_peer(alice).await;
        assert_eq!(group.peer_count().await, 1);
        assert!(group.has_peer(&id).await);

        group.remove_peer(&id).await;
        assert_eq!(group.peer_count().await, 0);
        assert!(!group.has_peer(&id).await);
    }

    #[tokio::test]
    async fn test_broadcast_fan_out_carries_origin() {
        let group = BroadcastGroup::new(16);
        let alice = peer("Alice");
        let mut rx1 = group.add_peer(alice.clone()).await;
        let mut rx2 = group.add_peer(peer("Bob")).await;

        let count = group.broadcast(alice.client_id, vec![1, 2, 3]);
        assert_eq!(count, 2);

        let d1 = rx1.recv().await.unwrap();
        let d2 = rx2.recv().await.unwrap();
        assert_eq!(d1.origin, alice.client_id);
        assert_eq!(d2.bytes, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_broadcast_stats() {
        let group = BroadcastGroup::new(16);
        let alice = peer("Alice");
        let _rx = group.add_peer(alice.clone()).await;

        group.broadcast(alice.client_id, vec![0; 10]);
        group.broadcast(alice.client_id, vec![0; 5]);

        let stats = group.stats().await;
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.bytes_sent, 15);
        assert_eq!(stats.active_peers, 1);
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags() {
        let group = BroadcastGroup::new(2);
        let origin = Uuid::new_v4();
        let mut rx = group.subscribe();
        for i in 0..5u8 {
            group.broadcast(origin, vec![i]);
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(3))
        ));
    }

    #[tokio::test]
    async fn test_room_manager_join_shares_room() {
        let manager = RoomManager::new(16);
        let channel = ChannelId::new("p", "f");

        let (room1, _rx1) = manager.join(&channel, peer("Alice"), 10).await.unwrap();
        let (room2, _rx2) = manager.join(&channel, peer("Bob"), 10).await.unwrap();
        assert!(Arc::ptr_eq(&room1, &room2));
        assert_eq!(room1.peer_count().await, 2);
        assert_eq!(manager.room_count().await, 1);
        assert_eq!(manager.active_channels().await, vec![channel]);
    }

    #[tokio::test]
    async fn test_join_refused_when_full() {
        let manager = RoomManager::new(16);
        let channel = ChannelId::new("p", "f");

        assert!(manager.join(&channel, peer("Alice"), 0).await.is_none());
        assert_eq!(manager.room_count().await, 0);

        let (room, _rx) = manager.join(&channel, peer("Alice"), 1).await.unwrap();
        assert!(manager.join(&channel, peer("Bob"), 1).await.is_none());
        assert_eq!(room.peer_count().await, 1);
    }

    #[tokio::test]
    async fn test_rooms_isolated_per_channel() {
        let manager = RoomManager::new(16);
        let (a, _rx_a) = manager.join(&ChannelId::new("p", "a.rs"), peer("A"), 10).await.unwrap();
        let (_b, mut rx_b) = manager.join(&ChannelId::new("p", "b.rs"), peer("B"), 10).await.unwrap();

        a.broadcast(Uuid::new_v4(), vec![1]);
        assert!(rx_b.try_recv().is_err());
        assert_eq!(manager.room_count().await, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_join_racing_last_leave_stays_in_live_room() {
        let manager = Arc::new(RoomManager::new(16));
        let channel = ChannelId::new("p", "f");

        for _ in 0..200 {
            let leaver = peer("Y");
            let leaver_id = leaver.client_id;
            let (room_y, _rx_y) = manager.join(&channel, leaver, usize::MAX).await.unwrap();

            let leave = {
                let manager = manager.clone();
                let channel = channel.clone();
                tokio::spawn(async move {
                    room_y.remove_peer(&leaver_id).await;
                    manager.remove_if_empty(&channel).await;
                })
            };
            let joiner = peer("X");
            let joiner_id = joiner.client_id;
            let join = {
                let manager = manager.clone();
                let channel = channel.clone();
                tokio::spawn(async move { manager.join(&channel, joiner, usize::MAX).await })
            };

            leave.await.unwrap();
            let (room_x, _rx_x) = join.await.unwrap().unwrap();
            let current = manager.get(&channel).await.expect("joined room was dropped");
            assert!(Arc::ptr_eq(&room_x, &current));

            room_x.remove_peer(&joiner_id).await;
            assert!(manager.remove_if_empty(&channel).await);
        }
    }

    #[tokio::test]
    async fn test_room_manager_cleanup() {
        let manager = RoomManager::new(16);
        let channel = ChannelId::new("p", "f");
        let alice = peer("Alice");
        let id = alice.client_id;
        let (room, _rx) = manager.join(&channel, alice, 10).await.unwrap();

        assert!(!manager.remove_if_empty(&channel).await);
        room.remove_peer(&id).await;
        assert!(manager.remove_if_empty(&channel).await);
        assert_eq!(manager.room_count().await, 0);
        assert!(manager.get(&channel).await.is_none());
    }
}
