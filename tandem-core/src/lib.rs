//! # tandem-core — Shared document store for real-time collaboration
//!
//! One [`SharedDocument`] per open file: a CRDT-backed text replica that
//! merges concurrent edits from any number of peers without central
//! sequencing.
//!
//! ```text
//! local keystroke                     remote peer
//!       │                                  │
//!       ▼                                  ▼
//! apply_local_edit()  ── update ──► merge_remote_update()
//!       │                                  │
//!       ▼                                  ▼
//! DocumentUpdate (broadcast)        TextDelta (to editor)
//! ```
//!
//! Merging is commutative, associative, and idempotent: applying the same
//! update twice, or two updates in either order, yields identical text on
//! every replica.
//!
//! ## Modules
//!
//! - [`document`] — the replica itself (`yrs`-backed)
//! - [`delta`] — minimal text deltas and line/column mapping

pub mod delta;
pub mod document;

pub use delta::{offset_to_position, position_to_offset, Position, TextDelta};
pub use document::{
    DocumentUpdate, EditError, MergeError, ResyncError, SharedDocument,
};
