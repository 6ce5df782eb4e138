//! CRDT merge engine for a single live document.
//!
//! A `Document` owns one `yrs::Doc`. Every mutation is a merge of an incoming
//! update fragment; the async mutex serializes merges of the same document
//! while unrelated documents proceed in parallel. No `.await` happens while a
//! yrs transaction is open.
//!
//! Outcome of `apply`:
//!
//! | state changed | pending grew | outcome    | version | forwarded |
//! |---------------|--------------|------------|---------|-----------|
//! | yes           | -            | `Merged`   | +1      | yes       |
//! | no            | yes          | `Deferred` | -       | yes       |
//! | no            | no           | `Duplicate`| -       | no        |
//!
//! `Deferred` covers fragments the CRDT buffered because their causal
//! dependencies are missing: peers that already hold those dependencies can
//! integrate them immediately. A window of recent fragment digests
//! short-circuits exact resends before they are decoded.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use crate::broadcast::BroadcastGroup;
use crate::protocol::{DocumentKey, ServerMessage};

/// Fragment digests remembered for the resend fast path.
const RECENT_DIGESTS: usize = 1024;

/// Merge errors. The document state is untouched when one is returned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MergeError {
    #[error("malformed update fragment: {0}")]
    MalformedUpdate(String),
    #[error("malformed state vector: {0}")]
    MalformedStateVector(String),
    #[error("update rejected by CRDT: {0}")]
    Rejected(String),
    #[error("could not encode outbound frame: {0}")]
    Encode(String),
}

/// Result of merging one fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// State changed; fragment forwarded and journaled under `journal_seq`
    Merged { version: u64, journal_seq: u64 },
    /// Buffered by the CRDT pending dependencies; forwarded and journaled
    Deferred { journal_seq: u64 },
    /// Already merged; nothing forwarded
    Duplicate,
}

impl ApplyOutcome {
    /// Journal sequence assigned to the fragment, if it must be persisted.
    pub fn journal_seq(&self) -> Option<u64> {
        match self {
            ApplyOutcome::Merged { journal_seq, .. } | ApplyOutcome::Deferred { journal_seq } => {
                Some(*journal_seq)
            }
            ApplyOutcome::Duplicate => None,
        }
    }

    pub fn is_merged(&self) -> bool {
        matches!(self, ApplyOutcome::Merged { .. })
    }
}

/// Point-in-time state captured for a flush.
#[derive(Debug, Clone)]
pub struct FlushSnapshot {
    pub state: Vec<u8>,
    /// Version the state corresponds to
    pub version: u64,
    /// Every journal entry below this sequence is contained in `state`
    pub journal_bound: u64,
}

/// Bounded set of recently applied fragment digests.
#[derive(Default)]
struct RecentDigests {
    order: VecDeque<u64>,
    set: HashSet<u64>,
}

impl RecentDigests {
    fn contains(&self, digest: u64) -> bool {
        self.set.contains(&digest)
    }

    fn insert(&mut self, digest: u64) {
        if !self.set.insert(digest) {
            return;
        }
        self.order.push_back(digest);
        if self.order.len() > RECENT_DIGESTS {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
    }
}

struct DocState {
    doc: Doc,
    recent: RecentDigests,
    next_journal_seq: u64,
}

/// A live, shared document.
pub struct Document {
    key: DocumentKey,
    state: Mutex<DocState>,
    version: AtomicU64,
    flushed_version: AtomicU64,
    group: BroadcastGroup,
}

impl Document {
    /// Empty document with a broadcast group of `capacity`.
    pub fn new(key: DocumentKey, capacity: usize) -> Self {
        Self {
            key,
            state: Mutex::new(DocState {
                doc: Doc::new(),
                recent: RecentDigests::default(),
                next_journal_seq: 0,
            }),
            version: AtomicU64::new(0),
            flushed_version: AtomicU64::new(0),
            group: BroadcastGroup::new(capacity),
        }
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn group(&self) -> &BroadcastGroup {
        &self.group
    }

    /// Merges that changed state since creation.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Version covered by the last successful flush.
    pub fn flushed_version(&self) -> u64 {
        self.flushed_version.load(Ordering::SeqCst)
    }

    /// Whether in-memory state is ahead of storage.
    pub fn is_dirty(&self) -> bool {
        self.version() > self.flushed_version()
    }

    /// Record a successful flush of `version`. Never moves backwards.
    pub fn mark_flushed(&self, version: u64) {
        self.flushed_version.fetch_max(version, Ordering::SeqCst);
    }

    /// Restore persisted state on cold load. Nothing is broadcast.
    ///
    /// Returns the number of journal entries applied. When the journal adds
    /// anything beyond the snapshot the document is left dirty so the next
    /// flush folds it in.
    pub async fn restore(&self, snapshot: Option<&[u8]>, journal: &[(u64, Vec<u8>)]) -> usize {
        let mut state = self.state.lock().await;
        if let Some(bytes) = snapshot {
            if let Err(e) = apply_bytes(&state.doc, bytes) {
                log::warn!("Ignoring unreadable snapshot for {}: {e}", self.key);
            }
        }
        let before = state.doc.transact().snapshot();
        let mut applied = 0;
        for (seq, fragment) in journal {
            match apply_bytes(&state.doc, fragment) {
                Ok(_) => {
                    state.recent.insert(digest(fragment));
                    applied += 1;
                }
                Err(e) => log::warn!("Skipping journal entry {seq} for {}: {e}", self.key),
            }
            state.next_journal_seq = state.next_journal_seq.max(seq + 1);
        }
        if state.doc.transact().snapshot() != before {
            self.version.fetch_add(1, Ordering::SeqCst);
        }
        applied
    }

    /// Merge a fragment from session `origin` and forward it to the other
    /// sessions of this document.
    pub async fn apply(&self, origin: Uuid, fragment: &[u8]) -> Result<ApplyOutcome, MergeError> {
        let fingerprint = digest(fragment);
        let frame = ServerMessage::Update(fragment.to_vec())
            .encode()
            .map_err(|e| MergeError::Encode(e.to_string()))?;

        let mut state = self.state.lock().await;
        if state.recent.contains(fingerprint) {
            return Ok(ApplyOutcome::Duplicate);
        }
        // Decoded under the lock: yrs blocks are not Send
        let update =
            Update::decode_v1(fragment).map_err(|e| MergeError::MalformedUpdate(e.to_string()))?;
        let (changed, buffered) = {
            let mut txn = state.doc.transact_mut();
            let before = txn.snapshot();
            let pending_before = pending_state(&txn);
            txn.apply_update(update)
                .map_err(|e| MergeError::Rejected(e.to_string()))?;
            (txn.snapshot() != before, pending_state(&txn) != pending_before)
        };

        let outcome = if changed {
            let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
            ApplyOutcome::Merged {
                version,
                journal_seq: state.next_journal_seq,
            }
        } else if buffered {
            ApplyOutcome::Deferred {
                journal_seq: state.next_journal_seq,
            }
        } else {
            state.recent.insert(fingerprint);
            return Ok(ApplyOutcome::Duplicate);
        };
        state.next_journal_seq += 1;
        state.recent.insert(fingerprint);

        // Sent under the lock so every receiver sees merge order
        let receivers = self.group.broadcast_raw(origin, Arc::new(frame));
        log::trace!("{}: {outcome:?} from {origin} to {receivers} receivers", self.key);
        Ok(outcome)
    }

    /// Full state as a single update.
    pub async fn encode_full_state(&self) -> Vec<u8> {
        let state = self.state.lock().await;
        let txn = state.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Full state plus the version and journal bound it covers.
    pub async fn snapshot_for_flush(&self) -> FlushSnapshot {
        let state = self.state.lock().await;
        let version = self.version();
        let journal_bound = state.next_journal_seq;
        let txn = state.doc.transact();
        FlushSnapshot {
            state: txn.encode_state_as_update_v1(&StateVector::default()),
            version,
            journal_bound,
        }
    }

    /// Updates missing from a peer with the given encoded state vector.
    pub async fn encode_diff(&self, state_vector: &[u8]) -> Result<Vec<u8>, MergeError> {
        let remote = StateVector::decode_v1(state_vector)
            .map_err(|e| MergeError::MalformedStateVector(e.to_string()))?;
        let state = self.state.lock().await;
        let txn = state.doc.transact();
        Ok(txn.encode_diff_v1(&remote))
    }

}

fn apply_bytes(doc: &Doc, bytes: &[u8]) -> Result<(), MergeError> {
    let update = Update::decode_v1(bytes).map_err(|e| MergeError::MalformedUpdate(e.to_string()))?;
    let mut txn = doc.transact_mut();
    txn.apply_update(update)
        .map_err(|e| MergeError::Rejected(e.to_string()))
}

/// Encoded blocks and deletions the CRDT holds back for missing dependencies.
fn pending_state<T: ReadTxn>(txn: &T) -> (Option<Vec<u8>>, Option<Vec<u8>>) {
    let store = ReadTxn::store(txn);
    (
        store.pending_update().map(|pending| pending.update.encode_v1()),
        store.pending_ds().map(|ds| ds.encode_v1()),
    )
}

fn digest(bytes: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}
