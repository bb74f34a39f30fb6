//! The relay: WebSocket server with room-based routing.
//!
//! ```text
//! Client A ──┐
//!            ├── Room (project, file) ── SharedDocument (authoritative)
//! Client B ──┘        │                  PresenceManager
//!                     │                  BroadcastGroup
//!                     │
//!          ┌──────────┼──────────┐
//!          ▼          ▼          ▼
//!       Client A   Client B   Client C
//! ```
//!
//! Rooms are created lazily on first join and disposed when the last peer
//! leaves — nothing here persists. The relay keeps an authoritative
//! replica per room purely so it can hand a joiner the full document
//! state; durable storage of file contents is the host application's
//! concern, not this subsystem's.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use tandem_core::SharedDocument;

use crate::broadcast::BroadcastGroup;
use crate::presence::{PeerInfo, PresenceManager, PALETTE};
use crate::protocol::{MessageKind, RoomId, WireMessage};

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to.
    pub bind_addr: String,
    /// Joins beyond this per-room limit are refused.
    pub max_peers_per_room: usize,
    /// Frames buffered per peer before a lagging peer drops frames.
    pub broadcast_capacity: usize,
    /// Expected client heartbeat cadence; peers silent for three
    /// intervals are evicted.
    pub heartbeat_interval: Duration,
    /// Shared join secret. `None` accepts every join.
    pub auth_token: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            heartbeat_interval: Duration::from_secs(10),
            auth_token: None,
        }
    }
}

/// Relay-wide counters.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

/// One collaboration room: authoritative document, presence, fan-out.
struct Room {
    document: Mutex<SharedDocument>,
    presence: Mutex<PresenceManager>,
    broadcast: BroadcastGroup,
}

impl Room {
    fn new(config: &RelayConfig) -> Self {
        Self {
            document: Mutex::new(SharedDocument::new()),
            // Nil local client: the relay is nobody's replica.
            presence: Mutex::new(PresenceManager::with_intervals(
                Uuid::nil(),
                config.heartbeat_interval,
                Duration::from_millis(100),
            )),
            broadcast: BroadcastGroup::new(config.broadcast_capacity),
        }
    }
}

/// The relay server.
pub struct RelayServer {
    config: RelayConfig,
    rooms: Arc<RwLock<HashMap<RoomId, Arc<Room>>>>,
    stats: Arc<RwLock<RelayStats>>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            rooms: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(RelayStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Accept connections forever. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("relay listening on {}", self.config.bind_addr);

        tokio::spawn(Self::sweep_rooms(self.rooms.clone(), self.config.heartbeat_interval));

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, rooms, stats, config).await {
                    log::error!("connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Evict peers whose heartbeat lapsed, even when their leave notice
    /// never arrived (abrupt network loss).
    async fn sweep_rooms(rooms: Arc<RwLock<HashMap<RoomId, Arc<Room>>>>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let snapshot: Vec<(RoomId, Arc<Room>)> =
                rooms.read().await.iter().map(|(id, r)| (*id, r.clone())).collect();
            for (room_id, room) in snapshot {
                let evicted = room.presence.lock().await.evict_stale();
                if evicted.is_empty() {
                    continue;
                }
                for info in &evicted {
                    room.broadcast.remove_peer(info.client_id).await;
                    let _ = room.broadcast.broadcast(&WireMessage::leave(info.client_id, room_id));
                }
                let entries = room.presence.lock().await.snapshot();
                let _ = room
                    .broadcast
                    .broadcast(&WireMessage::presence_snapshot(room_id, &entries));
                log::info!("room {room_id}: evicted {} silent peer(s)", evicted.len());
            }
        }
    }

    async fn get_or_create(
        rooms: &Arc<RwLock<HashMap<RoomId, Arc<Room>>>>,
        id: RoomId,
        config: &RelayConfig,
    ) -> Arc<Room> {
        // Fast path: read lock.
        {
            if let Some(room) = rooms.read().await.get(&id) {
                return room.clone();
            }
        }
        // Slow path: create under the write lock, double-checked.
        let mut rooms_w = rooms.write().await;
        rooms_w.entry(id).or_insert_with(|| Arc::new(Room::new(config))).clone()
    }

    /// Refuse a join: nil-origin leave notice, then close.
    async fn refuse<S>(sink: &mut S, room: RoomId)
    where
        S: futures_util::Sink<Message> + Unpin,
    {
        if let Ok(frame) = WireMessage::leave(Uuid::nil(), room).encode() {
            let _ = sink.send(Message::Binary(frame.into())).await;
        }
        let _ = sink.send(Message::Close(None)).await;
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Arc<RwLock<HashMap<RoomId, Arc<Room>>>>,
        stats: Arc<RwLock<RelayStats>>,
        config: RelayConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws = tokio_tungstenite::accept_async(stream).await?;
        let (mut sink, mut read) = ws.split();

        log::debug!("websocket established from {addr}");
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Set on a successful join.
        let mut joined: Option<(RoomId, Uuid, Arc<Room>)> = None;
        let mut broadcast_rx: Option<broadcast::Receiver<Arc<Vec<u8>>>> = None;
        let mut deliberate_leave = false;

        loop {
            tokio::select! {
                frame = read.next() => match frame {
                    Some(Ok(Message::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        {
                            let mut s = stats.write().await;
                            s.total_frames += 1;
                            s.total_bytes += bytes.len() as u64;
                        }
                        let msg = match WireMessage::decode(&bytes) {
                            Ok(msg) => msg,
                            Err(e) => {
                                log::warn!("undecodable frame from {addr}: {e}");
                                continue;
                            }
                        };

                        match msg.kind {
                            MessageKind::Join => {
                                if joined.is_some() {
                                    log::debug!("duplicate join from {addr} ignored");
                                    continue;
                                }
                                let request = match msg.join_request() {
                                    Ok(request) => request,
                                    Err(e) => {
                                        log::warn!("bad join payload from {addr}: {e}");
                                        continue;
                                    }
                                };
                                if config.auth_token.is_some()
                                    && request.auth_token != config.auth_token
                                {
                                    log::warn!("join rejected for {addr}: bad token");
                                    Self::refuse(&mut sink, msg.room).await;
                                    break;
                                }

                                let room = Self::get_or_create(&rooms, msg.room, &config).await;
                                if room.broadcast.peer_count().await >= config.max_peers_per_room {
                                    log::warn!("join rejected for {addr}: room {} full", msg.room);
                                    Self::refuse(&mut sink, msg.room).await;
                                    break;
                                }

                                let mut info = PeerInfo {
                                    client_id: msg.origin,
                                    user_id: request.user_id,
                                    username: request.username.clone(),
                                    color: PALETTE[0],
                                };
                                info.color = room.presence.lock().await.join(info.clone());
                                broadcast_rx = Some(room.broadcast.add_peer(info).await);
                                // From here on, teardown must remove the peer
                                // again — break on socket errors, never return.
                                joined = Some((msg.room, msg.origin, room.clone()));

                                // Snapshot, then full document state — directly
                                // to the joiner, in order, so the client's
                                // resync step is deterministic.
                                let entries = room.presence.lock().await.snapshot();
                                let snap = match WireMessage::presence_snapshot(msg.room, &entries)
                                    .encode()
                                {
                                    Ok(snap) => snap,
                                    Err(e) => {
                                        log::error!("room {}: snapshot encode: {e}", msg.room);
                                        break;
                                    }
                                };
                                if sink.send(Message::Binary(snap.clone().into())).await.is_err() {
                                    break;
                                }
                                let full = room.document.lock().await.full_state();
                                let state =
                                    match WireMessage::update(Uuid::nil(), msg.room, 0, full)
                                        .encode()
                                    {
                                        Ok(state) => state,
                                        Err(e) => {
                                            log::error!("room {}: state encode: {e}", msg.room);
                                            break;
                                        }
                                    };
                                if sink.send(Message::Binary(state.into())).await.is_err() {
                                    break;
                                }

                                // Everyone else learns the membership change.
                                room.broadcast.broadcast_raw(Arc::new(snap));

                                {
                                    let mut s = stats.write().await;
                                    s.active_rooms = rooms.read().await.len();
                                }
                                log::info!(
                                    "peer {} ({}) joined room {}",
                                    request.username,
                                    msg.origin,
                                    msg.room
                                );
                            }

                            MessageKind::Update => {
                                if let Some((room_id, client, room)) = &joined {
                                    let merged =
                                        room.document.lock().await.merge_remote_update(&msg.payload);
                                    match merged {
                                        Ok(_) => {
                                            room.broadcast.broadcast_raw(Arc::new(bytes));
                                        }
                                        Err(e) => {
                                            // Dropped, never fanned out: one
                                            // malformed frame must not poison
                                            // the other replicas.
                                            log::warn!(
                                                "room {room_id}: dropped update from {client}: {e}"
                                            );
                                        }
                                    }
                                    room.presence.lock().await.heartbeat(*client);
                                }
                            }

                            MessageKind::Cursor => {
                                if let Some((room_id, _, room)) = &joined {
                                    match msg.cursor_state() {
                                        Ok(cursor) => {
                                            room.presence
                                                .lock()
                                                .await
                                                .update_cursor(cursor, msg.timestamp);
                                            room.broadcast.broadcast_raw(Arc::new(bytes));
                                        }
                                        Err(e) => {
                                            log::warn!("room {room_id}: bad cursor frame: {e}");
                                        }
                                    }
                                }
                            }

                            MessageKind::Heartbeat => {
                                if let Some((_, client, room)) = &joined {
                                    room.presence.lock().await.heartbeat(*client);
                                    // Fanned out so client-side liveness
                                    // tracking sees quiet-but-alive peers.
                                    room.broadcast.broadcast_raw(Arc::new(bytes));
                                }
                            }

                            MessageKind::Leave => {
                                deliberate_leave = true;
                                break;
                            }

                            MessageKind::PresenceSnapshot => {
                                log::debug!("client-sent presence snapshot from {addr} ignored");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sink.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        log::debug!("socket error from {addr}: {e}");
                        break;
                    }
                    _ => {}
                },

                inbound = async {
                    match broadcast_rx {
                        Some(ref mut rx) => rx.recv().await,
                        // Not in a room yet: nothing to forward.
                        None => std::future::pending().await,
                    }
                } => match inbound {
                    Ok(frame) => {
                        // Never echo a frame back to its origin.
                        if let Some((_, client, _)) = &joined {
                            if let Ok(peek) = WireMessage::decode(&frame) {
                                if peek.origin == *client {
                                    continue;
                                }
                            }
                        }
                        if sink.send(Message::Binary(frame.to_vec().into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("peer at {addr} lagged by {n} frames");
                    }
                    Err(_) => break,
                },
            }
        }

        // Teardown: leave notice or abrupt loss, same cleanup either way.
        if let Some((room_id, client, room)) = joined {
            room.presence.lock().await.leave(client);
            room.broadcast.remove_peer(client).await;
            let _ = room.broadcast.broadcast(&WireMessage::leave(client, room_id));
            let entries = room.presence.lock().await.snapshot();
            let _ = room.broadcast.broadcast(&WireMessage::presence_snapshot(room_id, &entries));

            if room.broadcast.peer_count().await == 0 {
                rooms.write().await.remove(&room_id);
                log::info!("room {room_id} disposed (last peer left)");
            }
            log::info!(
                "peer {client} left room {room_id} ({})",
                if deliberate_leave { "leave notice" } else { "connection lost" }
            );
        }

        {
            let mut s = stats.write().await;
            s.active_connections -= 1;
            s.active_rooms = rooms.read().await.len();
        }
        Ok(())
    }
}
