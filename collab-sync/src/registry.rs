//! Document registry: key -> live document, with reference counting,
//! debounced flushing and drain-on-last-detach.
//!
//! ```text
//! resolve(key) ──► map lookup ──► hit:  refs += 1
//!                      │
//!                      └──► miss: insert empty slot, refs = 1
//!                                 └─► load once (snapshot, then journal)
//!
//! detach ──► refs -= 1 ──► refs == 0 ──► drain task: flush (retry once)
//!                                          └─► evict if still refs == 0
//!                                              and no newer drain started
//! ```
//!
//! The map lock is only held for lookup, insert and evict. Loads and flushes
//! run storage calls on the blocking pool.

use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, OnceCell, RwLock};
use uuid::Uuid;

use crate::document::{ApplyOutcome, Document, FlushSnapshot, MergeError};
use crate::protocol::DocumentKey;
use crate::stats::StatsCounters;
use crate::storage::{SnapshotStore, StorageError};

/// A registered document plus its load and flush bookkeeping.
struct Slot {
    document: Document,
    loaded: OnceCell<()>,
    flush_lock: Mutex<()>,
    flush_scheduled: AtomicBool,
}

struct Entry {
    slot: Arc<Slot>,
    refs: usize,
    /// Bumped every time `refs` drops to zero
    drain_epoch: u64,
}

/// Counts flushes and drains in flight; decrements on drop.
struct FlushTicket {
    counter: Arc<watch::Sender<usize>>,
}

impl FlushTicket {
    fn new(counter: &Arc<watch::Sender<usize>>) -> Self {
        counter.send_modify(|n| *n += 1);
        Self {
            counter: counter.clone(),
        }
    }
}

impl Drop for FlushTicket {
    fn drop(&mut self) {
        self.counter.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Map of live documents shared by every session.
pub struct DocumentRegistry {
    store: Arc<dyn SnapshotStore>,
    entries: RwLock<HashMap<DocumentKey, Entry>>,
    flush_debounce: Duration,
    broadcast_capacity: usize,
    stats: Arc<StatsCounters>,
    in_flight: Arc<watch::Sender<usize>>,
    closed: AtomicBool,
}

impl DocumentRegistry {
    pub fn new(
        store: Arc<dyn SnapshotStore>,
        flush_debounce: Duration,
        broadcast_capacity: usize,
        stats: Arc<StatsCounters>,
    ) -> Self {
        let (in_flight, _) = watch::channel(0usize);
        Self {
            store,
            entries: RwLock::new(HashMap::new()),
            flush_debounce,
            broadcast_capacity,
            stats,
            in_flight: Arc::new(in_flight),
            closed: AtomicBool::new(false),
        }
    }

    /// Attach to the live document for `key`, loading it on first use.
    ///
    /// Concurrent resolvers of a cold key share a single load.
    pub async fn resolve(self: &Arc<Self>, key: DocumentKey) -> DocumentHandle {
        let slot = {
            let mut entries = self.entries.write().await;
            match entries.get_mut(&key) {
                Some(entry) => {
                    entry.refs += 1;
                    entry.slot.clone()
                }
                None => {
                    let slot = Arc::new(Slot {
                        document: Document::new(key.clone(), self.broadcast_capacity),
                        loaded: OnceCell::new(),
                        flush_lock: Mutex::new(()),
                        flush_scheduled: AtomicBool::new(false),
                    });
                    entries.insert(
                        key.clone(),
                        Entry {
                            slot: slot.clone(),
                            refs: 1,
                            drain_epoch: 0,
                        },
                    );
                    slot
                }
            }
        };

        slot.loaded.get_or_init(|| self.load(&slot)).await;

        DocumentHandle {
            slot,
            registry: self.clone(),
            detached: false,
        }
    }

    /// Cold load: snapshot, then journal. Failures leave the document empty.
    async fn load(&self, slot: &Slot) {
        let key = slot.document.key().clone();

        let snapshot_key = key.clone();
        let snapshot = self
            .blocking(move |store| store.load(&snapshot_key))
            .await
            .unwrap_or_else(|e| {
                log::warn!("Could not load snapshot for {key}, starting empty: {e}");
                None
            });
        let journal_key = key.clone();
        let journal = self
            .blocking(move |store| store.load_updates(&journal_key))
            .await
            .unwrap_or_else(|e| {
                log::warn!("Could not load journal for {key}: {e}");
                Vec::new()
            });

        let replayed = slot
            .document
            .restore(snapshot.as_ref().map(|r| r.state.as_slice()), &journal)
            .await;
        match snapshot {
            Some(record) => log::info!(
                "Loaded {key}: {} byte snapshot from {}, {replayed} journaled updates",
                record.state.len(),
                record.updated_at
            ),
            None => log::info!("Created {key} ({replayed} journaled updates)"),
        }
    }

    /// Run a storage call on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn SnapshotStore) -> Result<T, StorageError> + Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || f(store.as_ref()))
            .await
            .map_err(|e| StorageError::Unavailable(format!("storage task failed: {e}")))?
    }

    /// Bookkeeping after a merge: stats, journal append, debounce.
    fn after_apply(self: &Arc<Self>, slot: &Arc<Slot>, fragment: &[u8], outcome: ApplyOutcome) {
        match outcome {
            ApplyOutcome::Duplicate => {
                self.stats.fragment_duplicate();
                return;
            }
            ApplyOutcome::Merged { .. } => self.stats.fragment_merged(),
            ApplyOutcome::Deferred { .. } => {}
        }

        if let Some(seq) = outcome.journal_seq() {
            let store = self.store.clone();
            let key = slot.document.key().clone();
            let fragment = fragment.to_vec();
            tokio::task::spawn_blocking(move || {
                if let Err(e) = store.append_update(&key, seq, &fragment) {
                    log::warn!("Journal append {seq} for {key} failed: {e}");
                }
            });
        }

        self.schedule_flush(slot);
    }

    /// Start the debounce timer unless one is already pending.
    fn schedule_flush(self: &Arc<Self>, slot: &Arc<Slot>) {
        if self.flush_debounce.is_zero() || slot.flush_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let registry = self.clone();
        let slot = slot.clone();
        tokio::spawn(async move {
            tokio::time::sleep(registry.flush_debounce).await;
            slot.flush_scheduled.store(false, Ordering::SeqCst);
            if registry.closed.load(Ordering::SeqCst) {
                return;
            }
            let _ticket = FlushTicket::new(&registry.in_flight);
            if let Err(e) = registry.flush_slot(&slot).await {
                log::warn!("Debounced flush of {} failed: {e}", slot.document.key());
            }
        });
    }

    /// Persist a slot if it has unflushed merges.
    ///
    /// Returns `Ok(false)` when there was nothing to write. Serialized per
    /// document; the snapshot is taken under the document lock and written
    /// outside it.
    async fn flush_slot(&self, slot: &Slot) -> Result<bool, StorageError> {
        let _guard = slot.flush_lock.lock().await;
        let document = &slot.document;
        if !document.is_dirty() {
            return Ok(false);
        }

        let FlushSnapshot {
            state,
            version,
            journal_bound,
        } = document.snapshot_for_flush().await;
        let key = document.key().clone();
        let bytes = state.len();

        let store_key = key.clone();
        let stored = self
            .blocking(move |store| {
                store.store(&store_key, &state)?;
                Ok(store.truncate_updates(&store_key, journal_bound))
            })
            .await;

        match stored {
            Ok(truncated) => {
                document.mark_flushed(version);
                self.stats.flush_succeeded();
                if let Err(e) = truncated {
                    log::warn!("Journal truncation for {key} failed: {e}");
                }
                log::info!("Flushed {key} at version {version} ({bytes} bytes)");
                Ok(true)
            }
            Err(e) => {
                self.stats.flush_failed();
                Err(e)
            }
        }
    }

    /// Drop one reference; the last one starts the drain.
    async fn release(self: &Arc<Self>, key: &DocumentKey) {
        let (slot, epoch) = {
            let mut entries = self.entries.write().await;
            let Some(entry) = entries.get_mut(key) else {
                return;
            };
            entry.refs = entry.refs.saturating_sub(1);
            if entry.refs > 0 {
                return;
            }
            entry.drain_epoch += 1;
            (entry.slot.clone(), entry.drain_epoch)
        };

        let ticket = FlushTicket::new(&self.in_flight);
        let registry = self.clone();
        tokio::spawn(async move {
            let _ticket = ticket;
            registry.drain(slot, epoch).await;
        });
    }

    /// Final flush, then evict unless the document was picked up again.
    async fn drain(&self, slot: Arc<Slot>, epoch: u64) {
        let key = slot.document.key().clone();
        if let Err(first) = self.flush_slot(&slot).await {
            log::warn!("Final flush of {key} failed, retrying: {first}");
            if let Err(second) = self.flush_slot(&slot).await {
                log::error!("Abandoning final flush of {key}: {second}");
            }
        }

        let mut entries = self.entries.write().await;
        let evict = entries.get(&key).is_some_and(|entry| {
            entry.refs == 0 && entry.drain_epoch == epoch && Arc::ptr_eq(&entry.slot, &slot)
        });
        if evict {
            entries.remove(&key);
            log::info!("Evicted {key}");
        } else {
            log::debug!("Eviction of {key} cancelled, document is in use again");
        }
    }

    /// Flush every live document. Returns `(flushed, failed)`.
    pub async fn flush_all(&self) -> (usize, usize) {
        let slots: Vec<Arc<Slot>> = {
            let entries = self.entries.read().await;
            entries.values().map(|entry| entry.slot.clone()).collect()
        };
        let _ticket = FlushTicket::new(&self.in_flight);
        let results = join_all(slots.iter().map(|slot| self.flush_slot(slot))).await;

        let mut flushed = 0;
        let mut failed = 0;
        for (slot, result) in slots.iter().zip(results) {
            match result {
                Ok(true) => flushed += 1,
                Ok(false) => {}
                Err(e) => {
                    failed += 1;
                    log::error!("Flush of {} failed: {e}", slot.document.key());
                }
            }
        }
        (flushed, failed)
    }

    /// Stop scheduling timer flushes.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Wait until no flush or drain is running. `false` on timeout.
    pub async fn wait_for_flushes(&self, timeout: Duration) -> bool {
        let mut rx = self.in_flight.subscribe();
        let idle = tokio::time::timeout(timeout, async move {
            rx.wait_for(|n| *n == 0).await.is_ok()
        })
        .await;
        matches!(idle, Ok(true))
    }

    /// Flushes and drains currently running.
    pub fn flushes_in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }

    pub async fn live_documents(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn contains(&self, key: &DocumentKey) -> bool {
        self.entries.read().await.contains_key(key)
    }

    /// Attached sessions for `key`; 0 when not live.
    pub async fn ref_count(&self, key: &DocumentKey) -> usize {
        self.entries.read().await.get(key).map_or(0, |entry| entry.refs)
    }
}

/// A session's attachment to a live document.
///
/// Call [`DocumentHandle::detach`] when the session ends. Dropping an
/// attached handle detaches it from a spawned task.
pub struct DocumentHandle {
    slot: Arc<Slot>,
    registry: Arc<DocumentRegistry>,
    detached: bool,
}

impl DocumentHandle {
    pub fn document(&self) -> &Document {
        &self.slot.document
    }

    pub fn key(&self) -> &DocumentKey {
        self.slot.document.key()
    }

    /// Merge a fragment from `origin`, forward it and schedule persistence.
    pub async fn apply(&self, origin: Uuid, fragment: &[u8]) -> Result<ApplyOutcome, MergeError> {
        let outcome = self.slot.document.apply(origin, fragment).await?;
        self.registry.after_apply(&self.slot, fragment, outcome);
        Ok(outcome)
    }

    /// Whether two handles share one document instance.
    pub fn same_document(&self, other: &DocumentHandle) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }

    /// Release this attachment.
    pub async fn detach(mut self) {
        self.detached = true;
        let key = self.key().clone();
        self.registry.release(&key).await;
    }
}

impl Drop for DocumentHandle {
    fn drop(&mut self) {
        if self.detached {
            return;
        }
        let registry = self.registry.clone();
        let key = self.key().clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { registry.release(&key).await });
            }
            Err(_) => log::warn!("Handle for {key} dropped outside a runtime; not released"),
        }
    }
}
