//! Fan-out of room traffic to N-1 peers with backpressure.
//!
//! Each room owns one tokio broadcast channel carrying pre-encoded
//! frames. Every connected peer holds an independent receiver buffering
//! up to `capacity` frames; a lagging peer drops frames rather than
//! stalling the room. Self-originated frames are filtered at the
//! receiving end, never here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::presence::PeerInfo;
use crate::protocol::{TransportError, WireMessage};

/// Counters for monitoring fan-out health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    pub active_peers: usize,
}

/// A broadcast group for a single room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    /// Connected peers in this room.
    peers: Arc<RwLock<HashMap<Uuid, PeerInfo>>>,
    capacity: usize,
    /// Lock-free counter so the hot path never takes a lock.
    frames_sent: AtomicU64,
}

impl BroadcastGroup {
    /// `capacity` frames are buffered per receiver before a lagging peer
    /// starts losing frames.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            frames_sent: AtomicU64::new(0),
        }
    }

    /// Register a peer and return its receiver.
    pub async fn add_peer(&self, info: PeerInfo) -> broadcast::Receiver<Arc<Vec<u8>>> {
        let mut peers = self.peers.write().await;
        peers.insert(info.client_id, info);
        self.sender.subscribe()
    }

    /// Deregister a peer. Its receiver stops getting frames once dropped.
    pub async fn remove_peer(&self, client_id: Uuid) -> Option<PeerInfo> {
        let mut peers = self.peers.write().await;
        peers.remove(&client_id)
    }

    /// Encode a message and fan it out. Returns the number of receivers.
    pub fn broadcast(&self, msg: &WireMessage) -> Result<usize, TransportError> {
        let encoded = msg.encode()?;
        Ok(self.broadcast_raw(Arc::new(encoded)))
    }

    /// Fan out pre-encoded bytes (zero-copy fast path, fully lock-free).
    pub fn broadcast_raw(&self, frame: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn has_peer(&self, client_id: Uuid) -> bool {
        self.peers.read().await.contains_key(&client_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Raw receiver without peer registration (relay-internal use).
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.sender.subscribe()
    }
}
