//! # tandem-collab — Real-time collaboration transport for tandem
//!
//! WebSocket-based multiplayer editing: one [`session::Session`] per open
//! file on the client, one room per `(project, file)` on the relay.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐      WebSocket      ┌─────────────┐
//! │   Session   │ ◄─────────────────► │ RelayServer │
//! │ (per room)  │     Binary Proto    │  (central)  │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌──────────────┐                    ┌──────────────┐
//! │SharedDocument│                    │ Room         │
//! │+ Presence    │                    │ doc+presence │
//! └──────────────┘                    └──────┬───────┘
//!                                            │
//!                                    ┌───────┴───────┐
//!                                    │BroadcastGroup │
//!                                    │  (fan-out)    │
//!                                    └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — binary wire envelope (bincode-encoded [`protocol::WireMessage`])
//! - [`presence`] — ephemeral per-peer state: cursors, colors, liveness
//! - [`session`] — client session: handshake, resync, reconnect, heartbeat
//! - [`broadcast`] — room-based fan-out with backpressure
//! - [`server`] — the relay

pub mod broadcast;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod session;

pub use broadcast::{BroadcastGroup, BroadcastStats};
pub use presence::{
    CursorState, PeerColor, PeerInfo, PresenceEntry, PresenceManager, Selection,
};
pub use protocol::{JoinRequest, MessageKind, RoomId, TransportError, WireMessage};
pub use server::{RelayConfig, RelayServer, RelayStats};
pub use session::{Session, SessionConfig, SessionEvent, SessionHandle, SessionState};
