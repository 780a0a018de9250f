//! Shared CRDT document handles and their per-note lifecycle.
//!
//! One [`DocumentHandle`] owns one `yrs::Doc` for the lifetime of the
//! collaboration on a note. Handles are acquired through [`DocumentArena`] so
//! that two views of the same note share a single replica, and the replica is
//! dropped once the last view releases it.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::sync::Arc;
use uuid::Uuid;
use yrs::ReadTxn;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;

/// A note's CRDT document replica.
pub struct DocumentHandle {
    note_id: Uuid,
    doc: yrs::Doc,
}

impl DocumentHandle {
    pub fn new(note_id: Uuid) -> Self {
        Self {
            note_id,
            doc: yrs::Doc::new(),
        }
    }

    pub fn note_id(&self) -> Uuid {
        self.note_id
    }

    /// Deterministic session address: two peers opening the same note always
    /// join the same session.
    pub fn session_name(&self) -> String {
        format!("note-{}", self.note_id)
    }

    /// The underlying document, for the editor binding layer.
    pub fn doc(&self) -> &yrs::Doc {
        &self.doc
    }

    /// Encoded state vector, sent to the server to request a history diff.
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = yrs::Transact::transact(&self.doc);
        txn.state_vector().encode_v1()
    }

    /// Apply a remote update. CRDT merges are commutative, so ordering
    /// relative to local edits needs no coordination here.
    pub fn apply_update(&self, bytes: &[u8]) -> Result<(), DocumentError> {
        let update = yrs::Update::decode_v1(bytes)
            .map_err(|e| DocumentError::MalformedUpdate(e.to_string()))?;
        let mut txn = yrs::Transact::transact_mut(&self.doc);
        txn.apply_update(update)
            .map_err(|e| DocumentError::MalformedUpdate(e.to_string()))
    }

    /// Full document state as a single update.
    pub fn encode_full_update(&self) -> Vec<u8> {
        let txn = yrs::Transact::transact(&self.doc);
        txn.encode_state_as_update_v1(&yrs::StateVector::default())
    }

    /// Diff against a remote state vector; an undecodable vector falls back
    /// to the full state.
    pub fn diff(&self, remote_state_vector: &[u8]) -> Vec<u8> {
        let txn = yrs::Transact::transact(&self.doc);
        let sv = yrs::StateVector::decode_v1(remote_state_vector).unwrap_or_default();
        txn.encode_diff_v1(&sv)
    }
}

/// Document errors.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentError {
    MalformedUpdate(String),
}

impl std::fmt::Display for DocumentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedUpdate(e) => write!(f, "malformed document update: {e}"),
        }
    }
}

impl std::error::Error for DocumentError {}

struct ArenaEntry {
    handle: Arc<DocumentHandle>,
    refs: usize,
}

/// Reference-counted registry of live document handles, keyed by note id.
///
/// Each note-view scope acquires on mount and must release on every exit
/// path; the replica is destroyed when the last scope lets go.
pub struct DocumentArena {
    inner: Mutex<HashMap<Uuid, ArenaEntry>>,
}

impl DocumentArena {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Get or create the handle for a note, bumping its reference count.
    pub fn acquire(&self, note_id: Uuid) -> Arc<DocumentHandle> {
        let mut docs = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = docs.entry(note_id).or_insert_with(|| ArenaEntry {
            handle: Arc::new(DocumentHandle::new(note_id)),
            refs: 0,
        });
        entry.refs += 1;
        entry.handle.clone()
    }

    /// Drop one reference; the handle is removed when none remain.
    /// Releasing an unknown note is a no-op.
    pub fn release(&self, note_id: Uuid) {
        let mut docs = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = docs.get_mut(&note_id) {
            entry.refs = entry.refs.saturating_sub(1);
            if entry.refs == 0 {
                docs.remove(&note_id);
                log::debug!("released document replica for note {note_id}");
            }
        }
    }

    pub fn contains(&self, note_id: Uuid) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&note_id)
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DocumentArena {
    fn default() -> Self {
        Self::new()
    }
}
