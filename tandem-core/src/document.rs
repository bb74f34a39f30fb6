//! The shared text replica.
//!
//! Exactly one [`SharedDocument`] exists per room per client process. All
//! mutation goes through the owning process's handlers — local edits via
//! [`SharedDocument::apply_local_edit`], remote updates via
//! [`SharedDocument::merge_remote_update`] — so the replica needs no
//! internal locking of its own.
//!
//! Reference: Kleppmann, Chapter 5 — Replication

use std::ops::Range;

use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, TextRef, Transact, Update};

use crate::delta::TextDelta;

/// An opaque, commutative, associative, idempotent CRDT delta.
///
/// Produced by a local edit, merged by every other replica. The transport
/// never looks inside.
pub type DocumentUpdate = Vec<u8>;

/// A local edit that cannot be applied to the current text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditError {
    OutOfBounds { start: usize, end: usize, len: usize },
    NotCharBoundary(usize),
}

impl std::fmt::Display for EditError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OutOfBounds { start, end, len } => {
                write!(f, "edit range {start}..{end} out of bounds for document of {len} bytes")
            }
            Self::NotCharBoundary(at) => {
                write!(f, "edit boundary {at} is not a char boundary")
            }
        }
    }
}

impl std::error::Error for EditError {}

/// A remote update that could not be merged.
///
/// Malformed updates are dropped and logged by the caller; a failing
/// apply means the local replica can no longer be trusted and the session
/// answers with a full resync.
#[derive(Debug, Clone)]
pub enum MergeError {
    Malformed(String),
    ApplyFailed(String),
}

impl std::fmt::Display for MergeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(e) => write!(f, "malformed update: {e}"),
            Self::ApplyFailed(e) => write!(f, "update could not be applied: {e}"),
        }
    }
}

impl std::error::Error for MergeError {}

/// A full-state snapshot that could not be applied during resync.
#[derive(Debug, Clone)]
pub struct ResyncError(pub MergeError);

impl std::fmt::Display for ResyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "resync failed: {}", self.0)
    }
}

impl std::error::Error for ResyncError {}

impl From<MergeError> for ResyncError {
    fn from(e: MergeError) -> Self {
        Self(e)
    }
}

/// One converging text replica for one file.
pub struct SharedDocument {
    doc: Doc,
    text: TextRef,
}

impl SharedDocument {
    pub fn new() -> Self {
        let doc = Doc::new();
        let text = doc.get_or_insert_text("content");
        Self { doc, text }
    }

    /// Create a replica seeded with initial text (e.g. file contents
    /// loaded by the host application).
    pub fn with_text(initial: &str) -> Self {
        let this = Self::new();
        if !initial.is_empty() {
            let mut txn = this.doc.transact_mut();
            this.text.insert(&mut txn, 0, initial);
        }
        this
    }

    /// Current text of the replica.
    pub fn text(&self) -> String {
        let txn = self.doc.transact();
        self.text.get_string(&txn)
    }

    /// Length of the current text in bytes.
    pub fn len(&self) -> usize {
        self.text().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Convert a local text edit into a CRDT update.
    ///
    /// The edit is applied to the local replica immediately (optimistic
    /// local apply); the returned update is what gets broadcast. Purely
    /// in-memory, never blocks.
    pub fn apply_local_edit(
        &mut self,
        range: Range<usize>,
        replacement: &str,
    ) -> Result<DocumentUpdate, EditError> {
        let current = self.text();
        if range.start > range.end || range.end > current.len() {
            return Err(EditError::OutOfBounds {
                start: range.start,
                end: range.end,
                len: current.len(),
            });
        }
        for at in [range.start, range.end] {
            if !current.is_char_boundary(at) {
                return Err(EditError::NotCharBoundary(at));
            }
        }

        let mut txn = self.doc.transact_mut();
        if range.end > range.start {
            self.text
                .remove_range(&mut txn, range.start as u32, (range.end - range.start) as u32);
        }
        if !replacement.is_empty() {
            self.text.insert(&mut txn, range.start as u32, replacement);
        }
        Ok(txn.encode_update_v1())
    }

    /// Merge an update received from a peer.
    ///
    /// Returns the minimal text delta to apply to the visible editor, or
    /// `None` when the merge changed nothing (duplicate or already-seen
    /// update — merging is idempotent).
    pub fn merge_remote_update(&mut self, update: &[u8]) -> Result<Option<TextDelta>, MergeError> {
        let parsed = Update::decode_v1(update).map_err(|e| MergeError::Malformed(e.to_string()))?;
        let before = self.text();
        {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(parsed)
                .map_err(|e| MergeError::ApplyFailed(e.to_string()))?;
        }
        let after = self.text();
        Ok(TextDelta::diff(&before, &after))
    }

    /// Encode the complete replica state.
    ///
    /// Used only at connection establishment: a joining peer receives the
    /// room's full state, and sends its own, instead of any replay of
    /// individual missed updates.
    pub fn full_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Merge a full-state snapshot during resync.
    ///
    /// A snapshot is an ordinary (large) update, so this is the same
    /// idempotent merge — local edits made while offline survive it.
    pub fn apply_full_state(&mut self, snapshot: &[u8]) -> Result<Option<TextDelta>, ResyncError> {
        log::debug!("applying full-state snapshot ({} bytes)", snapshot.len());
        self.merge_remote_update(snapshot).map_err(ResyncError::from)
    }
}

impl Default for SharedDocument {
    fn default() -> Self {
        Self::new()
    }
}
