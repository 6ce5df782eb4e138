//! Server-wide counters.
//!
//! Updated with relaxed atomics from sessions and the registry; read through
//! `SyncServer::stats()` as a plain snapshot.

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub merged_fragments: u64,
    pub duplicate_fragments: u64,
    pub flushes: u64,
    pub failed_flushes: u64,
    pub lagged_receivers: u64,
    pub live_documents: usize,
}

#[derive(Debug, Default)]
pub struct StatsCounters {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
    merged_fragments: AtomicU64,
    duplicate_fragments: AtomicU64,
    flushes: AtomicU64,
    failed_flushes: AtomicU64,
    lagged_receivers: AtomicU64,
}

impl StatsCounters {
    pub fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connection_rejected(&self) {
        self.rejected_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_received(&self, bytes: usize) {
        self.total_messages.fetch_add(1, Ordering::Relaxed);
        self.total_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn fragment_merged(&self) {
        self.merged_fragments.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fragment_duplicate(&self) {
        self.duplicate_fragments.fetch_add(1, Ordering::Relaxed);
    }

    pub fn flush_succeeded(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn flush_failed(&self) {
        self.failed_flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn receiver_lagged(&self) {
        self.lagged_receivers.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot; `live_documents` comes from the registry.
    pub fn snapshot(&self, live_documents: usize) -> ServerStats {
        ServerStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            rejected_connections: self.rejected_connections.load(Ordering::Relaxed),
            total_messages: self.total_messages.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            merged_fragments: self.merged_fragments.load(Ordering::Relaxed),
            duplicate_fragments: self.duplicate_fragments.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            failed_flushes: self.failed_flushes.load(Ordering::Relaxed),
            lagged_receivers: self.lagged_receivers.load(Ordering::Relaxed),
            live_documents,
        }
    }
}
