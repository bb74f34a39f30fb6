//! # tandem-editor — binds a room session to a visible text editor
//!
//! The editor widget stays the source of truth for the local view; the
//! shared replica mirrors it. This adapter is the only place the two
//! meet:
//!
//! ```text
//! local keystroke                      session event
//!       │                                   │
//!       ▼                                   ▼
//! EditorBinding::on_local_edit()   EditorBinding::on_session_event()
//!       │                                   │
//!       ├─ apply_local_edit() ─► update ─►  │
//!       │        (never touches the         ├─ surface.apply_edit(delta)
//!       │         editor buffer)            ├─ remap marker anchors
//!       ▼                                   ▼
//!  SessionHandle::send_update()      surface.set_markers(...)
//! ```
//!
//! Remote cursors are kept as byte-offset anchors that are remapped
//! across every local and remote delta, so a marker moves with the text
//! it sits in — no cursor message required when someone edits above it.

use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::sync::Arc;

use tokio::sync::Mutex;
use uuid::Uuid;

use tandem_collab::presence::{CursorState, PeerColor, PresenceManager, Selection};
use tandem_collab::session::{Session, SessionEvent, SessionHandle};
use tandem_core::{
    offset_to_position, position_to_offset, Position, SharedDocument, TextDelta,
};

/// The widget side of the binding.
///
/// Implemented by whatever renders the document: a terminal pane, a GUI
/// text area, a headless buffer in tests.
pub trait EditorSurface {
    /// Splice a remote edit into the visible buffer.
    ///
    /// The delta is a single replace; positions after it shift, positions
    /// before it — including the local caret — stay put unless they lie
    /// inside the replaced range.
    fn apply_edit(&mut self, delta: &TextDelta);

    /// Replace the set of remote cursor decorations.
    fn set_markers(&mut self, markers: &[RemoteMarker]);
}

/// A remote peer's cursor, ready to draw: label, color, position.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteMarker {
    pub client_id: Uuid,
    pub username: String,
    pub color: PeerColor,
    pub position: Position,
    pub selection: Option<(Position, Position)>,
}

/// Byte-offset anchor for one remote cursor, remapped across edits.
#[derive(Debug, Clone, Copy)]
struct MarkerAnchor {
    offset: usize,
    selection: Option<(usize, usize)>,
}

impl MarkerAnchor {
    fn remap(&mut self, delta: &TextDelta) {
        self.offset = delta.map_offset(self.offset);
        if let Some((anchor, head)) = self.selection {
            self.selection = Some((delta.map_offset(anchor), delta.map_offset(head)));
        }
    }
}

/// Wires one room session to one editor widget.
pub struct EditorBinding<S: EditorSurface> {
    document: Arc<Mutex<SharedDocument>>,
    presence: Arc<Mutex<PresenceManager>>,
    handle: SessionHandle,
    surface: S,
    anchors: HashMap<Uuid, MarkerAnchor>,
}

impl<S: EditorSurface> EditorBinding<S> {
    pub fn new(session: &Session, surface: S) -> Self {
        Self {
            document: session.document(),
            presence: session.presence(),
            handle: session.handle(),
            surface,
            anchors: HashMap::new(),
        }
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn surface_mut(&mut self) -> &mut S {
        &mut self.surface
    }

    /// The editor buffer changed locally.
    ///
    /// Mirrors the edit into the replica and forwards the resulting
    /// update; the editor's own buffer is deliberately left alone — it
    /// already shows the edit.
    pub async fn on_local_edit(&mut self, range: Range<usize>, text: &str) {
        let update = {
            let mut doc = self.document.lock().await;
            match doc.apply_local_edit(range.clone(), text) {
                Ok(update) => update,
                Err(e) => {
                    log::warn!("room {}: rejected local edit: {e}", self.handle.room());
                    return;
                }
            }
        };
        if let Err(e) = self.handle.send_update(update).await {
            log::warn!("room {}: update not sent: {e}", self.handle.room());
        }

        // Remote markers sitting after the edit shift with it.
        let delta = TextDelta::replace(range, text);
        self.remap_anchors(&delta);
        self.render_markers().await;
    }

    /// The local caret or selection moved. Throttled through the presence
    /// manager so fast cursor motion cannot flood the room.
    pub async fn on_local_cursor(&mut self, position: Position, selection: Option<Selection>) {
        let cursor = self.presence.lock().await.update_local_cursor(position, selection);
        if let Some(cursor) = cursor {
            if let Err(e) = self.handle.send_cursor(&cursor).await {
                log::debug!("room {}: cursor not sent: {e}", self.handle.room());
            }
        }
    }

    /// Dispatch one session event into the editor.
    pub async fn on_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::DocumentEdited(delta) => {
                self.surface.apply_edit(&delta);
                self.remap_anchors(&delta);
                self.render_markers().await;
            }
            SessionEvent::CursorMoved(cursor) => {
                self.set_anchor(&cursor).await;
                self.render_markers().await;
            }
            SessionEvent::PresenceChanged => {
                self.reconcile_anchors().await;
                self.render_markers().await;
            }
            SessionEvent::StateChanged(state) => {
                log::debug!("room {}: connection {state:?}", self.handle.room());
            }
        }
    }

    /// Resolve a freshly received cursor against the current text.
    async fn set_anchor(&mut self, cursor: &CursorState) {
        let text = self.document.lock().await.text();
        let offset = position_to_offset(&text, cursor.position).unwrap_or(text.len());
        let selection = cursor.selection.map(|sel| {
            (
                position_to_offset(&text, sel.anchor).unwrap_or(text.len()),
                position_to_offset(&text, sel.head).unwrap_or(text.len()),
            )
        });
        self.anchors.insert(cursor.client_id, MarkerAnchor { offset, selection });
    }

    fn remap_anchors(&mut self, delta: &TextDelta) {
        for anchor in self.anchors.values_mut() {
            anchor.remap(delta);
        }
    }

    /// Sync the anchor set with room membership: drop markers of departed
    /// peers, pick up cursors of peers we have not anchored yet. Existing
    /// anchors are kept — they are fresher than snapshot coordinates.
    async fn reconcile_anchors(&mut self) {
        let entries = self.presence.lock().await.snapshot();
        let text = self.document.lock().await.text();

        let mut present = HashSet::with_capacity(entries.len());
        for entry in &entries {
            present.insert(entry.peer.client_id);
            if self.anchors.contains_key(&entry.peer.client_id) {
                continue;
            }
            if let Some(cursor) = &entry.cursor {
                let offset = position_to_offset(&text, cursor.position).unwrap_or(text.len());
                let selection = cursor.selection.map(|sel| {
                    (
                        position_to_offset(&text, sel.anchor).unwrap_or(text.len()),
                        position_to_offset(&text, sel.head).unwrap_or(text.len()),
                    )
                });
                self.anchors.insert(entry.peer.client_id, MarkerAnchor { offset, selection });
            }
        }
        self.anchors.retain(|client_id, _| present.contains(client_id));
    }

    /// Rebuild the decoration set from anchors and push it to the widget.
    async fn render_markers(&mut self) {
        let infos: HashMap<Uuid, _> = self
            .presence
            .lock()
            .await
            .peers()
            .into_iter()
            .map(|p| (p.client_id, p))
            .collect();
        let text = self.document.lock().await.text();

        let mut markers: Vec<RemoteMarker> = self
            .anchors
            .iter()
            .filter_map(|(client_id, anchor)| {
                let info = infos.get(client_id)?;
                Some(RemoteMarker {
                    client_id: *client_id,
                    username: info.username.clone(),
                    color: info.color,
                    position: offset_to_position(&text, anchor.offset),
                    selection: anchor.selection.map(|(a, h)| {
                        (offset_to_position(&text, a), offset_to_position(&text, h))
                    }),
                })
            })
            .collect();
        markers.sort_by_key(|m| (m.position.line, m.position.column));
        self.surface.set_markers(&markers);
    }
}
