//! Ephemeral presence: who is in the room, where their cursor is.
//!
//! Presence is not document content. It is never persisted, carries no
//! ordering guarantee relative to document updates, and every field is
//! last-write-wins per client. Liveness is heartbeat-driven: a peer
//! silent for three heartbeat intervals is evicted, so stale cursors
//! never linger after an abrupt disconnect.
//!
//! Reference: Kleppmann, Chapter 8 — Broadcast Protocols

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tandem_core::Position;

/// sRGB color assigned to a peer for cursor/selection rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl PeerColor {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Hex string for UI style sheets.
    pub fn to_hex(&self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

/// Fixed palette the color assignment cycles through.
pub const PALETTE: [PeerColor; 8] = [
    PeerColor::new(0x4c, 0x8b, 0xf5), // blue
    PeerColor::new(0xef, 0x6c, 0x5d), // red
    PeerColor::new(0x3c, 0xb3, 0x71), // green
    PeerColor::new(0xb4, 0x78, 0xde), // purple
    PeerColor::new(0xf0, 0xa3, 0x3c), // orange
    PeerColor::new(0x2c, 0xb5, 0xb0), // teal
    PeerColor::new(0xe0, 0x60, 0xa8), // pink
    PeerColor::new(0xc9, 0xb2, 0x3c), // olive
];

/// Deterministic color assignment: a pure function of the user and the
/// colors currently on screen.
///
/// The same user always starts from the same palette slot, so their color
/// is stable across reconnects; when that slot is taken by someone else
/// who is present right now, the next free slot in palette order is used.
/// With every slot taken, the base slot wins — duplicates beat flicker.
pub fn color_for(user_id: Uuid, occupied: &HashSet<PeerColor>) -> PeerColor {
    let base = (user_id.as_u128() % PALETTE.len() as u128) as usize;
    for step in 0..PALETTE.len() {
        let candidate = PALETTE[(base + step) % PALETTE.len()];
        if !occupied.contains(&candidate) {
            return candidate;
        }
    }
    PALETTE[base]
}

/// Peer identity with display metadata, as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Ephemeral, regenerated on every reconnect.
    pub client_id: Uuid,
    /// Identifies the human across reconnects.
    pub user_id: Uuid,
    pub username: String,
    pub color: PeerColor,
}

/// A selection range between two positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub anchor: Position,
    pub head: Position,
}

/// Cursor and selection of one peer. Last-write-wins per `client_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorState {
    pub client_id: Uuid,
    pub position: Position,
    pub selection: Option<Selection>,
}

/// One row of a presence snapshot: the peer plus its latest cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub peer: PeerInfo,
    pub cursor: Option<CursorState>,
}

/// Locally tracked state for one remote peer.
#[derive(Debug, Clone)]
struct PeerPresence {
    info: PeerInfo,
    cursor: Option<CursorState>,
    /// Logical timestamp of the last applied cursor, for LWW.
    cursor_timestamp: u64,
    last_seen: Instant,
}

/// Tracks the presence set of one room.
///
/// Used on both sides of the wire: the client keeps one per session (its
/// `local_client` filters self-echo out of snapshots), the relay keeps
/// one per room with a nil local client.
pub struct PresenceManager {
    local_client: Uuid,
    peers: HashMap<Uuid, PeerPresence>,
    heartbeat_interval: Duration,
    /// Throttle for outgoing local-cursor broadcasts.
    cursor_broadcast_interval: Duration,
    last_cursor_broadcast: Instant,
}

impl PresenceManager {
    /// Heartbeats every 10 seconds; a peer is stale after three missed
    /// intervals; local cursor broadcasts at most 10 per second.
    pub fn new(local_client: Uuid) -> Self {
        Self::with_intervals(local_client, Duration::from_secs(10), Duration::from_millis(100))
    }

    /// Custom intervals, for the relay's configuration and for tests.
    pub fn with_intervals(
        local_client: Uuid,
        heartbeat_interval: Duration,
        cursor_broadcast_interval: Duration,
    ) -> Self {
        Self {
            local_client,
            peers: HashMap::new(),
            heartbeat_interval,
            cursor_broadcast_interval,
            // Allow an immediate first broadcast.
            last_cursor_broadcast: Instant::now() - cursor_broadcast_interval,
        }
    }

    pub fn local_client(&self) -> Uuid {
        self.local_client
    }

    /// Reconnects regenerate the client id; the session updates us so
    /// self-filtering keeps working.
    pub fn set_local_client(&mut self, client_id: Uuid) {
        self.local_client = client_id;
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// How long a peer may stay silent before eviction.
    pub fn stale_after(&self) -> Duration {
        self.heartbeat_interval * 3
    }

    /// Add a peer to the room and assign its color.
    ///
    /// A duplicate join for an already-present `client_id` replaces the
    /// prior entry — idempotent, never an error. The color passed in is
    /// ignored; assignment is always recomputed here so it stays a pure
    /// function of `(user_id, currently occupied colors)`.
    pub fn join(&mut self, mut info: PeerInfo) -> PeerColor {
        let occupied: HashSet<PeerColor> = self
            .peers
            .values()
            .filter(|p| p.info.user_id != info.user_id && p.info.client_id != info.client_id)
            .map(|p| p.info.color)
            .collect();
        let color = color_for(info.user_id, &occupied);
        info.color = color;

        if let Some(prior) = self.peers.insert(
            info.client_id,
            PeerPresence {
                info,
                cursor: None,
                cursor_timestamp: 0,
                last_seen: Instant::now(),
            },
        ) {
            log::debug!("duplicate join for client {}, replaced", prior.info.client_id);
        }
        color
    }

    /// Replace the peer set with an authoritative snapshot from the
    /// relay. The local client's own entry is skipped.
    pub fn apply_snapshot(&mut self, entries: Vec<PresenceEntry>) {
        let now = Instant::now();
        let mut next = HashMap::with_capacity(entries.len());
        for entry in entries {
            if entry.peer.client_id == self.local_client {
                continue;
            }
            let client_id = entry.peer.client_id;
            // Keep the LWW clock of a peer we already track so a stale
            // snapshot cursor cannot roll a fresher one back.
            let prior = self.peers.remove(&client_id);
            let (cursor, cursor_timestamp) = match prior {
                Some(p) if p.cursor_timestamp > 0 => (p.cursor, p.cursor_timestamp),
                _ => (entry.cursor, 0),
            };
            next.insert(
                client_id,
                PeerPresence { info: entry.peer, cursor, cursor_timestamp, last_seen: now },
            );
        }
        self.peers = next;
    }

    /// Last-write-wins cursor overwrite.
    ///
    /// Returns `true` when applied; `false` for an unknown peer (the next
    /// snapshot will introduce it) or a stale reordered update.
    pub fn update_cursor(&mut self, cursor: CursorState, timestamp: u64) -> bool {
        match self.peers.get_mut(&cursor.client_id) {
            Some(peer) => {
                if timestamp < peer.cursor_timestamp {
                    return false;
                }
                peer.cursor_timestamp = timestamp;
                peer.cursor = Some(cursor);
                peer.last_seen = Instant::now();
                true
            }
            None => {
                log::debug!("cursor from unknown client {}, dropped", cursor.client_id);
                false
            }
        }
    }

    /// Refresh a peer's liveness.
    pub fn heartbeat(&mut self, client_id: Uuid) {
        if let Some(peer) = self.peers.get_mut(&client_id) {
            peer.last_seen = Instant::now();
        }
    }

    /// Remove a peer. Idempotent — a second leave is a no-op.
    pub fn leave(&mut self, client_id: Uuid) -> Option<PeerInfo> {
        self.peers.remove(&client_id).map(|p| p.info)
    }

    /// Evict peers whose heartbeat lapsed. Idempotent.
    pub fn evict_stale(&mut self) -> Vec<PeerInfo> {
        let cutoff = self.stale_after();
        let stale: Vec<Uuid> = self
            .peers
            .iter()
            .filter(|(_, p)| p.last_seen.elapsed() >= cutoff)
            .map(|(id, _)| *id)
            .collect();
        stale
            .into_iter()
            .filter_map(|id| {
                let evicted = self.peers.remove(&id).map(|p| p.info);
                if let Some(info) = &evicted {
                    log::info!("evicting silent peer {} ({})", info.username, info.client_id);
                }
                evicted
            })
            .collect()
    }

    /// Full presence list: every tracked peer plus its latest cursor.
    pub fn snapshot(&self) -> Vec<PresenceEntry> {
        self.peers
            .values()
            .map(|p| PresenceEntry { peer: p.info.clone(), cursor: p.cursor.clone() })
            .collect()
    }

    /// Peer identities only, for the UI's collaborator list.
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.peers.values().map(|p| p.info.clone()).collect()
    }

    pub fn peer(&self, client_id: Uuid) -> Option<PeerInfo> {
        self.peers.get(&client_id).map(|p| p.info.clone())
    }

    pub fn cursor(&self, client_id: Uuid) -> Option<CursorState> {
        self.peers.get(&client_id).and_then(|p| p.cursor.clone())
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Build a local cursor update if the throttle allows it.
    ///
    /// At most one broadcast per `cursor_broadcast_interval`; `None` when
    /// throttled. Cursor staleness of a few milliseconds is acceptable,
    /// bounding broadcast volume is not optional.
    pub fn update_local_cursor(
        &mut self,
        position: Position,
        selection: Option<Selection>,
    ) -> Option<CursorState> {
        if self.last_cursor_broadcast.elapsed() < self.cursor_broadcast_interval {
            return None;
        }
        self.last_cursor_broadcast = Instant::now();
        Some(CursorState { client_id: self.local_client, position, selection })
    }

    /// Build a local cursor update regardless of the throttle (used right
    /// after resync so peers see the cursor immediately).
    pub fn force_local_cursor(
        &mut self,
        position: Position,
        selection: Option<Selection>,
    ) -> CursorState {
        self.last_cursor_broadcast = Instant::now();
        CursorState { client_id: self.local_client, position, selection }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn info(client_id: Uuid, user_id: Uuid, name: &str) -> PeerInfo {
        PeerInfo {
            client_id,
            user_id,
            username: name.into(),
            color: PALETTE[0],
        }
    }

    fn cursor(client_id: Uuid, line: u32, column: u32) -> CursorState {
        CursorState { client_id, position: Position::new(line, column), selection: None }
    }

    // ── color assignment ─────────────────────────────────────────

    #[test]
    fn test_color_stable_for_user() {
        let user = Uuid::new_v4();
        let empty = HashSet::new();
        assert_eq!(color_for(user, &empty), color_for(user, &empty));
    }

    #[test]
    fn test_color_collision_advances() {
        let user = Uuid::new_v4();
        let base = color_for(user, &HashSet::new());

        let mut occupied = HashSet::new();
        occupied.insert(base);
        let next = color_for(user, &occupied);

        assert_ne!(next, base);
        let base_idx = PALETTE.iter().position(|c| *c == base).unwrap();
        assert_eq!(next, PALETTE[(base_idx + 1) % PALETTE.len()]);
    }

    #[test]
    fn test_color_all_occupied_falls_back_to_base() {
        let user = Uuid::new_v4();
        let occupied: HashSet<PeerColor> = PALETTE.iter().copied().collect();
        let base = color_for(user, &HashSet::new());
        assert_eq!(color_for(user, &occupied), base);
    }

    #[test]
    fn test_rejoin_same_user_same_color() {
        let user = Uuid::new_v4();
        let mut room = PresenceManager::new(Uuid::nil());

        let first = room.join(info(Uuid::new_v4(), user, "alice"));
        let client = room.peers()[0].client_id;
        room.leave(client);
        assert!(room.is_empty());

        // New connection, new client id, same human — same color.
        let second = room.join(info(Uuid::new_v4(), user, "alice"));
        assert_eq!(first, second);
    }

    #[test]
    fn test_join_avoids_present_peer_color() {
        // Two users whose hashes collide on the same palette slot.
        let user_a = Uuid::from_u128(5);
        let user_b = Uuid::from_u128(5 + PALETTE.len() as u128);

        let mut room = PresenceManager::new(Uuid::nil());
        let color_a = room.join(info(Uuid::new_v4(), user_a, "a"));
        let color_b = room.join(info(Uuid::new_v4(), user_b, "b"));
        assert_ne!(color_a, color_b);
    }

    // ── membership ───────────────────────────────────────────────

    #[test]
    fn test_duplicate_join_replaces() {
        let mut room = PresenceManager::new(Uuid::nil());
        let client = Uuid::new_v4();
        let user = Uuid::new_v4();

        room.join(info(client, user, "old name"));
        room.join(info(client, user, "new name"));

        assert_eq!(room.peer_count(), 1);
        assert_eq!(room.peer(client).unwrap().username, "new name");
    }

    #[test]
    fn test_leave_is_idempotent() {
        let mut room = PresenceManager::new(Uuid::nil());
        let client = Uuid::new_v4();
        room.join(info(client, Uuid::new_v4(), "x"));

        assert!(room.leave(client).is_some());
        assert!(room.leave(client).is_none());
        assert_eq!(room.peer_count(), 0);
    }

    #[test]
    fn test_apply_snapshot_skips_local_client() {
        let local = Uuid::new_v4();
        let mut room = PresenceManager::new(local);
        let remote = Uuid::new_v4();

        room.apply_snapshot(vec![
            PresenceEntry { peer: info(local, Uuid::new_v4(), "me"), cursor: None },
            PresenceEntry { peer: info(remote, Uuid::new_v4(), "them"), cursor: None },
        ]);

        assert_eq!(room.peer_count(), 1);
        assert!(room.peer(remote).is_some());
        assert!(room.peer(local).is_none());
    }

    #[test]
    fn test_apply_snapshot_removes_absent_peers() {
        let mut room = PresenceManager::new(Uuid::nil());
        let gone = Uuid::new_v4();
        let kept = Uuid::new_v4();
        room.join(info(gone, Uuid::new_v4(), "gone"));
        room.join(info(kept, Uuid::new_v4(), "kept"));

        room.apply_snapshot(vec![PresenceEntry {
            peer: info(kept, Uuid::new_v4(), "kept"),
            cursor: None,
        }]);

        assert_eq!(room.peer_count(), 1);
        assert!(room.peer(gone).is_none());
    }

    // ── cursors ──────────────────────────────────────────────────

    #[test]
    fn test_cursor_lww() {
        let mut room = PresenceManager::new(Uuid::nil());
        let client = Uuid::new_v4();
        room.join(info(client, Uuid::new_v4(), "x"));

        assert!(room.update_cursor(cursor(client, 1, 1), 5));
        // Stale reordered update is rejected.
        assert!(!room.update_cursor(cursor(client, 9, 9), 3));
        assert_eq!(room.cursor(client).unwrap().position, Position::new(1, 1));

        assert!(room.update_cursor(cursor(client, 2, 0), 6));
        assert_eq!(room.cursor(client).unwrap().position, Position::new(2, 0));
    }

    #[test]
    fn test_cursor_unknown_peer_dropped() {
        let mut room = PresenceManager::new(Uuid::nil());
        assert!(!room.update_cursor(cursor(Uuid::new_v4(), 0, 0), 1));
        assert_eq!(room.peer_count(), 0);
    }

    #[test]
    fn test_local_cursor_throttled() {
        let mut room = PresenceManager::with_intervals(
            Uuid::new_v4(),
            Duration::from_secs(10),
            Duration::from_millis(50),
        );

        assert!(room.update_local_cursor(Position::new(0, 0), None).is_some());
        assert!(room.update_local_cursor(Position::new(0, 1), None).is_none());

        thread::sleep(Duration::from_millis(60));
        assert!(room.update_local_cursor(Position::new(0, 2), None).is_some());
    }

    #[test]
    fn test_force_local_cursor_bypasses_throttle() {
        let mut room = PresenceManager::new(Uuid::new_v4());
        let _ = room.update_local_cursor(Position::new(0, 0), None);
        let forced = room.force_local_cursor(Position::new(1, 0), None);
        assert_eq!(forced.position, Position::new(1, 0));
        assert_eq!(forced.client_id, room.local_client());
    }

    // ── liveness ─────────────────────────────────────────────────

    #[test]
    fn test_evict_stale_after_three_intervals() {
        let mut room = PresenceManager::with_intervals(
            Uuid::nil(),
            Duration::from_millis(20),
            Duration::from_millis(100),
        );
        let silent = Uuid::new_v4();
        let chatty = Uuid::new_v4();
        room.join(info(silent, Uuid::new_v4(), "silent"));
        room.join(info(chatty, Uuid::new_v4(), "chatty"));

        // Nothing is stale yet.
        assert!(room.evict_stale().is_empty());

        thread::sleep(Duration::from_millis(40));
        room.heartbeat(chatty);
        thread::sleep(Duration::from_millis(30));

        let evicted = room.evict_stale();
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].client_id, silent);
        assert!(room.peer(chatty).is_some());

        // Idempotent.
        assert!(room.evict_stale().is_empty());
    }

    #[test]
    fn test_heartbeat_interval_accessors() {
        let room = PresenceManager::with_intervals(
            Uuid::nil(),
            Duration::from_secs(10),
            Duration::from_millis(100),
        );
        assert_eq!(room.heartbeat_interval(), Duration::from_secs(10));
        assert_eq!(room.stale_after(), Duration::from_secs(30));
    }

    #[test]
    fn test_to_hex() {
        assert_eq!(PeerColor::new(0x4c, 0x8b, 0xf5).to_hex(), "#4c8bf5");
    }
}
