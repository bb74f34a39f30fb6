//! Binary wire protocol for room synchronization.
//!
//! Every frame on the wire is one bincode-encoded [`WireMessage`]:
//!
//! ```text
//! ┌──────┬───────────────┬──────────┬───────────┬──────────┐
//! │ kind │ room          │ origin   │ timestamp │ payload  │
//! │ 1 B  │ 32 B          │ 16 B     │ 8 B       │ variable │
//! └──────┴───────────────┴──────────┴───────────┴──────────┘
//! ```
//!
//! The payload is opaque to the transport: document updates are yrs
//! deltas meaningful only to the document store, cursor frames carry a
//! [`CursorState`], presence snapshots a peer list. `origin` tags every
//! frame with the sending client so receivers can drop their own echo.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::presence::{CursorState, PresenceEntry};

/// Frame kinds carried over a room connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageKind {
    /// Authenticated join request for a room.
    Join = 1,
    /// Deliberate leave notice (best-effort; heartbeat timeout is the
    /// backstop for abrupt disconnects).
    Leave = 2,
    /// Document update: incremental CRDT delta or full-state snapshot —
    /// indistinguishable on purpose, merges are idempotent.
    Update = 3,
    /// Cursor/selection change.
    Cursor = 4,
    /// Full presence list, sent to a joiner and on membership changes.
    PresenceSnapshot = 5,
    /// Liveness signal.
    Heartbeat = 6,
}

/// A collaboration room, scoped to one file of one project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoomId {
    pub project_id: Uuid,
    pub file_id: Uuid,
}

impl RoomId {
    pub fn new(project_id: Uuid, file_id: Uuid) -> Self {
        Self { project_id, file_id }
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.project_id, self.file_id)
    }
}

/// Join payload. The room itself rides in the envelope; authentication
/// happens before join — the host application supplies the token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub user_id: Uuid,
    pub username: String,
    pub auth_token: Option<String>,
}

/// Top-level protocol frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub kind: MessageKind,
    pub room: RoomId,
    /// Client that produced this frame. `Uuid::nil()` for relay-originated
    /// frames (presence snapshots, full-state updates to a joiner).
    pub origin: Uuid,
    /// Sender-local logical clock, monotonic per connection. Cursor
    /// last-write-wins uses it to reject reordered stale updates.
    pub timestamp: u64,
    pub payload: Vec<u8>,
}

impl WireMessage {
    /// Create a join request frame.
    pub fn join(origin: Uuid, room: RoomId, request: &JoinRequest) -> Self {
        let payload = bincode::serde::encode_to_vec(request, bincode::config::standard())
            .unwrap_or_default();
        Self { kind: MessageKind::Join, room, origin, timestamp: 0, payload }
    }

    /// Create a leave notice.
    pub fn leave(origin: Uuid, room: RoomId) -> Self {
        Self { kind: MessageKind::Leave, room, origin, timestamp: 0, payload: Vec::new() }
    }

    /// Create a document update frame.
    pub fn update(origin: Uuid, room: RoomId, timestamp: u64, update: Vec<u8>) -> Self {
        Self { kind: MessageKind::Update, room, origin, timestamp, payload: update }
    }

    /// Create a cursor update frame.
    pub fn cursor(origin: Uuid, room: RoomId, timestamp: u64, cursor: &CursorState) -> Self {
        let payload = bincode::serde::encode_to_vec(cursor, bincode::config::standard())
            .unwrap_or_default();
        Self { kind: MessageKind::Cursor, room, origin, timestamp, payload }
    }

    /// Create a presence snapshot frame (relay-originated).
    pub fn presence_snapshot(room: RoomId, entries: &[PresenceEntry]) -> Self {
        let payload = bincode::serde::encode_to_vec(entries, bincode::config::standard())
            .unwrap_or_default();
        Self {
            kind: MessageKind::PresenceSnapshot,
            room,
            origin: Uuid::nil(),
            timestamp: 0,
            payload,
        }
    }

    /// Create a heartbeat frame.
    pub fn heartbeat(origin: Uuid, room: RoomId) -> Self {
        Self { kind: MessageKind::Heartbeat, room, origin, timestamp: 0, payload: Vec::new() }
    }

    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| TransportError::Encode(e.to_string()))
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, TransportError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| TransportError::Decode(e.to_string()))?;
        Ok(msg)
    }

    /// Parse a join payload.
    pub fn join_request(&self) -> Result<JoinRequest, TransportError> {
        if self.kind != MessageKind::Join {
            return Err(TransportError::UnexpectedKind);
        }
        let (req, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| TransportError::Decode(e.to_string()))?;
        Ok(req)
    }

    /// Parse a cursor payload. The envelope origin is authoritative for
    /// the peer identity, so it overrides whatever the payload claims.
    pub fn cursor_state(&self) -> Result<CursorState, TransportError> {
        if self.kind != MessageKind::Cursor {
            return Err(TransportError::UnexpectedKind);
        }
        let (mut cursor, _): (CursorState, _) =
            bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
                .map_err(|e| TransportError::Decode(e.to_string()))?;
        cursor.client_id = self.origin;
        Ok(cursor)
    }

    /// Parse a presence snapshot payload.
    pub fn presence_entries(&self) -> Result<Vec<PresenceEntry>, TransportError> {
        if self.kind != MessageKind::PresenceSnapshot {
            return Err(TransportError::UnexpectedKind);
        }
        let (entries, _) =
            bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
                .map_err(|e| TransportError::Decode(e.to_string()))?;
        Ok(entries)
    }
}

/// Transport-level failures. All of them are recovered locally — at worst
/// by the reconnect-with-backoff cycle — and surface to the UI only as a
/// connection state indicator.
#[derive(Debug, Clone)]
pub enum TransportError {
    Encode(String),
    Decode(String),
    UnexpectedKind,
    ConnectionClosed,
    AuthRejected,
    Timeout,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Encode(e) => write!(f, "encode error: {e}"),
            Self::Decode(e) => write!(f, "decode error: {e}"),
            Self::UnexpectedKind => write!(f, "unexpected message kind"),
            Self::ConnectionClosed => write!(f, "connection closed"),
            Self::AuthRejected => write!(f, "join rejected by relay"),
            Self::Timeout => write!(f, "connection timeout"),
        }
    }
}

impl std::error::Error for TransportError {}
