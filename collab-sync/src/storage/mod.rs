//! Persistence adapter for document state.
//!
//! ```text
//! ┌──────────────────┐   flush (snapshot)   ┌──────────────────────────────┐
//! │ DocumentRegistry │ ───────────────────► │ SnapshotStore                │
//! │ (live documents) │   append (fragment)  │   RocksStore | MemoryStore   │
//! └────────┬─────────┘ ───────────────────► └──────────────┬───────────────┘
//!          │ cold load                                     │
//!          ▼                                               ▼
//!   snapshot, then journal                 snapshots: key -> SnapshotRecord
//!   fragments in sequence order            journal:   key\0seq -> fragment
//! ```
//!
//! Stores see state only as opaque bytes. All methods are blocking; the
//! registry calls them from `spawn_blocking`.

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

use crate::protocol::DocumentKey;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// One persisted snapshot row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub tenant_id: String,
    pub entity_type: String,
    pub entity_id: String,
    /// Encoded CRDT state
    pub state: Vec<u8>,
    /// Last write (seconds since epoch)
    pub updated_at: u64,
}

impl SnapshotRecord {
    /// Build a row for `key` stamped with the current time.
    pub fn new(key: &DocumentKey, state: Vec<u8>) -> Self {
        Self {
            tenant_id: key.tenant_id().to_string(),
            entity_type: key.entity_type().to_string(),
            entity_id: key.entity_id().to_string(),
            state,
            updated_at: unix_now(),
        }
    }

    pub(crate) fn encode(&self) -> Result<Vec<u8>, StorageError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StorageError::Serialization(e.to_string()))
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StorageError::Deserialization(e.to_string()))?;
        Ok(record)
    }
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

impl From<rocksdb::Error> for StorageError {
    fn from(e: rocksdb::Error) -> Self {
        StorageError::Database(e.to_string())
    }
}

/// Backend holding snapshots and the update journal.
///
/// Journal methods default to no-ops so a snapshot-only backend only has to
/// implement `load` and `store`.
pub trait SnapshotStore: Send + Sync {
    /// Stored snapshot for `key`, if any.
    fn load(&self, key: &DocumentKey) -> Result<Option<SnapshotRecord>, StorageError>;

    /// Replace the snapshot for `key`.
    fn store(&self, key: &DocumentKey, state: &[u8]) -> Result<(), StorageError>;

    /// Journal one merged fragment under `seq`.
    fn append_update(&self, _key: &DocumentKey, _seq: u64, _fragment: &[u8]) -> Result<(), StorageError> {
        Ok(())
    }

    /// Journaled fragments for `key` in sequence order.
    fn load_updates(&self, _key: &DocumentKey) -> Result<Vec<(u64, Vec<u8>)>, StorageError> {
        Ok(Vec::new())
    }

    /// Drop journal entries with `seq < below`. Returns how many were removed.
    fn truncate_updates(&self, _key: &DocumentKey, _below: u64) -> Result<u64, StorageError> {
        Ok(0)
    }

    /// Push buffered writes to durable media. Called once at shutdown.
    fn sync(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Journal key: `{document key}\0{seq as 8 bytes big-endian}`.
///
/// Document keys never contain control characters, so the NUL keeps one
/// document's entries a contiguous, correctly ordered prefix range.
pub(crate) fn journal_prefix(key: &DocumentKey) -> Vec<u8> {
    let mut prefix = key.to_string().into_bytes();
    prefix.push(0);
    prefix
}

pub(crate) fn journal_key(key: &DocumentKey, seq: u64) -> Vec<u8> {
    let mut out = journal_prefix(key);
    out.extend_from_slice(&seq.to_be_bytes());
    out
}

pub(crate) fn journal_seq(prefix: &[u8], key: &[u8]) -> Option<u64> {
    let suffix = key.strip_prefix(prefix)?;
    let bytes: [u8; 8] = suffix.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}
