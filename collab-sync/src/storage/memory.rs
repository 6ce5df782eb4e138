//! In-process store. Used when no storage path is configured, and in tests.

use super::{SnapshotRecord, SnapshotStore, StorageError};
use crate::protocol::DocumentKey;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::RwLock;

/// Volatile snapshot store with a journal.
#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshots: RwLock<HashMap<DocumentKey, SnapshotRecord>>,
    journal: RwLock<HashMap<DocumentKey, BTreeMap<u64, Vec<u8>>>>,
    store_calls: AtomicU64,
    failing_stores: AtomicUsize,
    failing_loads: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls to `store` fail.
    pub fn fail_next_stores(&self, n: usize) {
        self.failing_stores.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` calls to `load` fail.
    pub fn fail_next_loads(&self, n: usize) {
        self.failing_loads.store(n, Ordering::SeqCst);
    }

    /// Number of `store` calls, failed ones included.
    pub fn store_calls(&self) -> u64 {
        self.store_calls.load(Ordering::SeqCst)
    }

    /// Number of journal entries held for `key`.
    pub fn journal_len(&self, key: &DocumentKey) -> usize {
        self.journal
            .read()
            .map(|journal| journal.get(key).map_or(0, BTreeMap::len))
            .unwrap_or(0)
    }

    fn take_failure(pending: &AtomicUsize) -> bool {
        pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn poisoned<T>(_: T) -> StorageError {
    StorageError::Unavailable("memory store lock poisoned".into())
}

impl SnapshotStore for MemoryStore {
    fn load(&self, key: &DocumentKey) -> Result<Option<SnapshotRecord>, StorageError> {
        if Self::take_failure(&self.failing_loads) {
            return Err(StorageError::Unavailable("injected load failure".into()));
        }
        Ok(self.snapshots.read().map_err(poisoned)?.get(key).cloned())
    }

    fn store(&self, key: &DocumentKey, state: &[u8]) -> Result<(), StorageError> {
        self.store_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.failing_stores) {
            return Err(StorageError::Unavailable("injected store failure".into()));
        }
        self.snapshots
            .write()
            .map_err(poisoned)?
            .insert(key.clone(), SnapshotRecord::new(key, state.to_vec()));
        Ok(())
    }

    fn append_update(&self, key: &DocumentKey, seq: u64, fragment: &[u8]) -> Result<(), StorageError> {
        self.journal
            .write()
            .map_err(poisoned)?
            .entry(key.clone())
            .or_default()
            .insert(seq, fragment.to_vec());
        Ok(())
    }

    fn load_updates(&self, key: &DocumentKey) -> Result<Vec<(u64, Vec<u8>)>, StorageError> {
        let journal = self.journal.read().map_err(poisoned)?;
        Ok(journal
            .get(key)
            .map(|entries| entries.iter().map(|(seq, f)| (*seq, f.clone())).collect())
            .unwrap_or_default())
    }

    fn truncate_updates(&self, key: &DocumentKey, below: u64) -> Result<u64, StorageError> {
        let mut journal = self.journal.write().map_err(poisoned)?;
        let Some(entries) = journal.get_mut(key) else {
            return Ok(0);
        };
        let kept = entries.split_off(&below);
        let removed = entries.len() as u64;
        *entries = kept;
        if entries.is_empty() {
            journal.remove(key);
        }
        Ok(removed)
    }
}
