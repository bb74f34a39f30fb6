//! Client session transport: the network lifecycle of one room.
//!
//! ```text
//! Connecting ──join──► Resyncing ──full state──► Synced
//!     ▲                                            │
//!     │            unexpected close / bad merge    │
//!     └────────── Disconnected ◄───────────────────┘
//!          (exponential backoff, then retry)
//! ```
//!
//! A [`Session`] owns the connection for one `(project, file)` room,
//! dispatches inbound traffic to the room's [`SharedDocument`] and
//! [`PresenceManager`], and emits [`SessionEvent`]s for the editor
//! binding and the UI. There is no global connection state: every room
//! gets its own explicit session object.
//!
//! Resynchronization is always a full-state exchange — a reconnecting
//! client never asks for a replay of individually missed updates; merge
//! idempotence makes the snapshot sufficient in both directions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use tandem_core::{DocumentUpdate, MergeError, SharedDocument, TextDelta};

use crate::presence::{CursorState, PeerInfo, PresenceManager};
use crate::protocol::{JoinRequest, MessageKind, RoomId, TransportError, WireMessage};

/// Connection state of a session, surfaced to the UI as a non-blocking
/// status indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Synced,
    Resyncing,
    Disconnected,
}

/// Events emitted by a session for the editor binding and the UI.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Connection state transition.
    StateChanged(SessionState),
    /// A remote edit was merged into the replica; apply this delta to the
    /// visible editor buffer.
    DocumentEdited(TextDelta),
    /// A remote peer's cursor moved.
    CursorMoved(CursorState),
    /// Room membership changed (snapshot applied, peer left, eviction).
    PresenceChanged,
}

/// Per-session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub server_url: String,
    pub room: RoomId,
    pub user_id: Uuid,
    pub username: String,
    pub auth_token: Option<String>,
    pub heartbeat_interval: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl SessionConfig {
    pub fn new(
        server_url: impl Into<String>,
        room: RoomId,
        user_id: Uuid,
        username: impl Into<String>,
    ) -> Self {
        Self {
            server_url: server_url.into(),
            room,
            user_id,
            username: username.into(),
            auth_token: None,
            heartbeat_interval: Duration::from_secs(10),
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(30),
        }
    }
}

/// Capped exponential backoff with jitter.
///
/// Half the deterministic delay plus a random half drawn from fresh UUID
/// entropy, so reconnecting clients spread out instead of stampeding.
fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exp = (base.as_millis()).saturating_mul(1u128 << attempt.min(16));
    let capped = exp.min(cap.as_millis()).max(1);
    let half = capped / 2;
    let jitter = if half == 0 { 0 } else { Uuid::new_v4().as_u128() % (half + 1) };
    Duration::from_millis((half + jitter) as u64)
}

fn next_timestamp(clock: &AtomicU64) -> u64 {
    clock.fetch_add(1, Ordering::SeqCst) + 1
}

/// Everything the connection tasks share. Cheap to clone; all hot state
/// sits behind `Arc`s.
#[derive(Clone)]
struct SessionCtx {
    config: SessionConfig,
    document: Arc<Mutex<SharedDocument>>,
    presence: Arc<Mutex<PresenceManager>>,
    state: Arc<RwLock<SessionState>>,
    client_id: Arc<RwLock<Uuid>>,
    clock: Arc<AtomicU64>,
    outgoing: Arc<RwLock<Option<mpsc::Sender<Vec<u8>>>>>,
    event_tx: mpsc::Sender<SessionEvent>,
}

impl SessionCtx {
    async fn set_state(&self, next: SessionState) {
        let mut state = self.state.write().await;
        if *state != next {
            *state = next;
            drop(state);
            let _ = self.event_tx.send(SessionEvent::StateChanged(next)).await;
        }
    }

    /// Supervisor loop: connect, run, back off, retry — forever, until
    /// the whole task is aborted by a deliberate leave.
    async fn run(self) {
        let mut attempt: u32 = 0;
        loop {
            self.set_state(SessionState::Connecting).await;

            // A fresh client id per connection attempt.
            let client_id = Uuid::new_v4();
            *self.client_id.write().await = client_id;
            self.presence.lock().await.set_local_client(client_id);

            match tokio_tungstenite::connect_async(&self.config.server_url).await {
                Ok((stream, _)) => {
                    attempt = 0;
                    if let Err(e) = self.run_connection(stream, client_id).await {
                        log::warn!("session {}: connection ended: {e}", self.config.room);
                    }
                }
                Err(e) => {
                    log::warn!("session {}: connect failed: {e}", self.config.room);
                }
            }

            *self.outgoing.write().await = None;
            self.set_state(SessionState::Disconnected).await;

            let delay = backoff_delay(attempt, self.config.backoff_base, self.config.backoff_cap);
            attempt = attempt.saturating_add(1);
            log::debug!(
                "session {}: reconnect attempt {} in {:?}",
                self.config.room,
                attempt,
                delay
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Drive one live connection until it drops.
    async fn run_connection(
        &self,
        stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
        client_id: Uuid,
    ) -> Result<(), TransportError> {
        let (mut sink, mut read) = stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        *self.outgoing.write().await = Some(out_tx.clone());

        let request = JoinRequest {
            user_id: self.config.user_id,
            username: self.config.username.clone(),
            auth_token: self.config.auth_token.clone(),
        };
        let join = WireMessage::join(client_id, self.config.room, &request).encode()?;
        sink.send(Message::Binary(join.into()))
            .await
            .map_err(|_| TransportError::ConnectionClosed)?;

        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);

        loop {
            tokio::select! {
                outbound = out_rx.recv() => match outbound {
                    Some(data) => {
                        sink.send(Message::Binary(data.into()))
                            .await
                            .map_err(|_| TransportError::ConnectionClosed)?;
                    }
                    None => return Err(TransportError::ConnectionClosed),
                },

                frame = read.next() => match frame {
                    Some(Ok(Message::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        match WireMessage::decode(&bytes) {
                            Ok(msg) => self.handle_frame(msg, client_id, &out_tx).await?,
                            Err(e) => {
                                log::warn!("session {}: undecodable frame: {e}", self.config.room);
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        sink.send(Message::Pong(data))
                            .await
                            .map_err(|_| TransportError::ConnectionClosed)?;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return Err(TransportError::ConnectionClosed);
                    }
                    Some(Err(_)) => return Err(TransportError::ConnectionClosed),
                    _ => {}
                },

                _ = ticker.tick() => {
                    let hb = WireMessage::heartbeat(client_id, self.config.room).encode()?;
                    let _ = out_tx.send(hb).await;
                    // Peers that stopped heartbeating are gone even if
                    // their leave notice never arrived.
                    let evicted = self.presence.lock().await.evict_stale();
                    if !evicted.is_empty() {
                        let _ = self.event_tx.send(SessionEvent::PresenceChanged).await;
                    }
                }
            }
        }
    }

    async fn handle_frame(
        &self,
        msg: WireMessage,
        client_id: Uuid,
        out_tx: &mpsc::Sender<Vec<u8>>,
    ) -> Result<(), TransportError> {
        // Local echo suppression: never re-apply anything we originated.
        if msg.origin == client_id {
            return Ok(());
        }

        match msg.kind {
            MessageKind::PresenceSnapshot => match msg.presence_entries() {
                Ok(entries) => {
                    self.presence.lock().await.apply_snapshot(entries);
                    if *self.state.read().await == SessionState::Connecting {
                        // The first snapshot acknowledges the join.
                        self.set_state(SessionState::Resyncing).await;
                        // Send our full state so edits made while offline
                        // reach the room; the relay's full state arrives as
                        // the next update.
                        let full = self.document.lock().await.full_state();
                        let ts = next_timestamp(&self.clock);
                        let frame =
                            WireMessage::update(client_id, self.config.room, ts, full).encode()?;
                        out_tx
                            .send(frame)
                            .await
                            .map_err(|_| TransportError::ConnectionClosed)?;
                    }
                    let _ = self.event_tx.send(SessionEvent::PresenceChanged).await;
                }
                Err(e) => {
                    log::warn!("session {}: bad presence snapshot: {e}", self.config.room);
                }
            },

            MessageKind::Update => {
                let resyncing = *self.state.read().await == SessionState::Resyncing;
                if resyncing {
                    let applied = self.document.lock().await.apply_full_state(&msg.payload);
                    match applied {
                        Ok(delta) => {
                            self.set_state(SessionState::Synced).await;
                            if let Some(delta) = delta {
                                let _ =
                                    self.event_tx.send(SessionEvent::DocumentEdited(delta)).await;
                            }
                        }
                        Err(e) => {
                            // Corrupt snapshot: tear down and resync from
                            // scratch on the next connect.
                            log::error!("session {}: {e}", self.config.room);
                            return Err(TransportError::ConnectionClosed);
                        }
                    }
                } else {
                    let merged = self.document.lock().await.merge_remote_update(&msg.payload);
                    match merged {
                        Ok(Some(delta)) => {
                            let _ = self.event_tx.send(SessionEvent::DocumentEdited(delta)).await;
                        }
                        Ok(None) => {}
                        Err(e @ MergeError::Malformed(_)) => {
                            log::warn!(
                                "session {}: dropped update from {}: {e}",
                                self.config.room,
                                msg.origin
                            );
                        }
                        Err(e @ MergeError::ApplyFailed(_)) => {
                            // The local replica can no longer be trusted; a
                            // full reconnect re-bases it on the relay state.
                            log::error!("session {}: {e}", self.config.room);
                            return Err(TransportError::ConnectionClosed);
                        }
                    }
                }
                self.presence.lock().await.heartbeat(msg.origin);
            }

            MessageKind::Cursor => match msg.cursor_state() {
                Ok(cursor) => {
                    let applied = self
                        .presence
                        .lock()
                        .await
                        .update_cursor(cursor.clone(), msg.timestamp);
                    if applied {
                        let _ = self.event_tx.send(SessionEvent::CursorMoved(cursor)).await;
                    }
                }
                Err(e) => {
                    log::warn!("session {}: bad cursor from {}: {e}", self.config.room, msg.origin);
                }
            },

            MessageKind::Leave => {
                if msg.origin.is_nil() {
                    // The relay refuses a join (bad token, full room) with a
                    // nil-origin leave before closing.
                    return Err(TransportError::AuthRejected);
                }
                if self.presence.lock().await.leave(msg.origin).is_some() {
                    let _ = self.event_tx.send(SessionEvent::PresenceChanged).await;
                }
            }

            MessageKind::Heartbeat => {
                self.presence.lock().await.heartbeat(msg.origin);
            }

            MessageKind::Join => {
                log::debug!("session {}: stray join frame ignored", self.config.room);
            }
        }
        Ok(())
    }
}

/// Cheap handle for producers of outbound traffic (the editor binding).
///
/// Sends are silently dropped while no connection is up: a document edit
/// survives in the replica and reaches the room through the full-state
/// exchange on reconnect; a dropped cursor frame is superseded by the
/// next one anyway.
#[derive(Clone)]
pub struct SessionHandle {
    room: RoomId,
    state: Arc<RwLock<SessionState>>,
    client_id: Arc<RwLock<Uuid>>,
    clock: Arc<AtomicU64>,
    outgoing: Arc<RwLock<Option<mpsc::Sender<Vec<u8>>>>>,
}

impl SessionHandle {
    pub fn room(&self) -> RoomId {
        self.room
    }

    pub async fn connection_state(&self) -> SessionState {
        *self.state.read().await
    }

    pub async fn client_id(&self) -> Uuid {
        *self.client_id.read().await
    }

    /// Forward a local document update to the room.
    pub async fn send_update(&self, update: DocumentUpdate) -> Result<(), TransportError> {
        let outgoing = self.outgoing.read().await;
        if let Some(tx) = outgoing.as_ref() {
            let ts = next_timestamp(&self.clock);
            let origin = *self.client_id.read().await;
            let frame = WireMessage::update(origin, self.room, ts, update).encode()?;
            tx.send(frame)
                .await
                .map_err(|_| TransportError::ConnectionClosed)?;
        }
        Ok(())
    }

    /// Forward a local cursor/selection change to the room.
    pub async fn send_cursor(&self, cursor: &CursorState) -> Result<(), TransportError> {
        let outgoing = self.outgoing.read().await;
        if let Some(tx) = outgoing.as_ref() {
            let ts = next_timestamp(&self.clock);
            let origin = *self.client_id.read().await;
            let frame = WireMessage::cursor(origin, self.room, ts, cursor).encode()?;
            tx.send(frame)
                .await
                .map_err(|_| TransportError::ConnectionClosed)?;
        }
        Ok(())
    }
}

/// The session: owns the room's document replica, presence set, and the
/// connection supervisor.
pub struct Session {
    ctx: SessionCtx,
    event_rx: Option<mpsc::Receiver<SessionEvent>>,
    supervisor: Option<JoinHandle<()>>,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        let client_id = Uuid::new_v4();
        let presence = PresenceManager::with_intervals(
            client_id,
            config.heartbeat_interval,
            Duration::from_millis(100),
        );
        let ctx = SessionCtx {
            config,
            document: Arc::new(Mutex::new(SharedDocument::new())),
            presence: Arc::new(Mutex::new(presence)),
            state: Arc::new(RwLock::new(SessionState::Disconnected)),
            client_id: Arc::new(RwLock::new(client_id)),
            clock: Arc::new(AtomicU64::new(0)),
            outgoing: Arc::new(RwLock::new(None)),
            event_tx,
        };
        Self { ctx, event_rx: Some(event_rx), supervisor: None }
    }

    /// The room's document replica, shared with the editor binding.
    pub fn document(&self) -> Arc<Mutex<SharedDocument>> {
        self.ctx.document.clone()
    }

    /// The room's presence set, shared with the editor binding.
    pub fn presence(&self) -> Arc<Mutex<PresenceManager>> {
        self.ctx.presence.clone()
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            room: self.ctx.config.room,
            state: self.ctx.state.clone(),
            client_id: self.ctx.client_id.clone(),
            clock: self.ctx.clock.clone(),
            outgoing: self.ctx.outgoing.clone(),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.event_rx.take()
    }

    pub fn room(&self) -> RoomId {
        self.ctx.config.room
    }

    pub async fn connection_state(&self) -> SessionState {
        *self.ctx.state.read().await
    }

    pub async fn client_id(&self) -> Uuid {
        *self.ctx.client_id.read().await
    }

    /// Current collaborator list for the UI.
    pub async fn collaborators(&self) -> Vec<PeerInfo> {
        self.ctx.presence.lock().await.peers()
    }

    /// Spawn the connection supervisor. Reconnects with backoff until
    /// [`Session::leave`] is called.
    pub fn connect(&mut self) {
        if self.supervisor.is_some() {
            return;
        }
        let ctx = self.ctx.clone();
        self.supervisor = Some(tokio::spawn(ctx.run()));
    }

    /// Deliberate leave: best-effort leave notice, then cancel every task
    /// and timer immediately. No update generated after this is sent.
    pub async fn leave(&mut self) {
        if let Some(task) = self.supervisor.take() {
            let client_id = *self.ctx.client_id.read().await;
            if let Some(tx) = self.ctx.outgoing.read().await.as_ref() {
                if let Ok(frame) = WireMessage::leave(client_id, self.ctx.config.room).encode() {
                    let _ = tx.send(frame).await;
                }
            }
            // Give the socket a beat to flush the notice; absence of it is
            // covered by the peer-side heartbeat timeout regardless.
            tokio::time::sleep(Duration::from_millis(20)).await;
            task.abort();
        }
        *self.ctx.outgoing.write().await = None;
        self.ctx.set_state(SessionState::Disconnected).await;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(task) = &self.supervisor {
            task.abort();
        }
    }
}
