//! RocksDB-backed snapshot store.
//!
//! Column families:
//! - `snapshots`: one `SnapshotRecord` per document key (bincode, LZ4 compressed)
//! - `journal`: merged fragments keyed by `{document key}\0{seq}` (LZ4 compressed)

use super::{journal_key, journal_prefix, journal_seq, SnapshotRecord, SnapshotStore, StorageError};
use crate::protocol::DocumentKey;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::path::{Path, PathBuf};

const CF_SNAPSHOTS: &str = "snapshots";
const CF_JOURNAL: &str = "journal";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_JOURNAL];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 256MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("collab_data"),
            block_cache_size: 256 * 1024 * 1024, // 256MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024, // 64MB
        }
    }
}

impl StoreConfig {
    /// Default tuning at `path`.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Create config for testing (small caches).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024, // 8MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024, // 4MB
        }
    }
}

/// RocksDB snapshot store.
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StorageError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.set_max_total_wal_size(128 * 1024 * 1024);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("Opened snapshot store at {}", config.path.display());

        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        // Values are already LZ4 framed by us
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_SNAPSHOTS => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_JOURNAL => {
                // Many small appends, prefix-scanned on load and truncate
                opts.set_max_write_buffer_number(4);
            }
            _ => {}
        }

        opts
    }

    /// Database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StorageError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::Database(format!("Column family '{name}' not found")))
    }

    fn write_opts(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    /// Journal entries for `key`, still compressed.
    fn journal_entries(&self, key: &DocumentKey) -> Result<Vec<(u64, Box<[u8]>)>, StorageError> {
        let cf = self.cf(CF_JOURNAL)?;
        let prefix = journal_prefix(key);
        let mut entries = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (raw_key, value) = item?;
            if !raw_key.starts_with(&prefix) {
                break;
            }
            match journal_seq(&prefix, &raw_key) {
                Some(seq) => entries.push((seq, value)),
                None => log::warn!("Skipping malformed journal key for {key}"),
            }
        }
        Ok(entries)
    }
}

impl SnapshotStore for RocksStore {
    fn load(&self, key: &DocumentKey) -> Result<Option<SnapshotRecord>, StorageError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        match self.db.get_cf(cf, key.to_string())? {
            Some(compressed) => {
                let raw = lz4_flex::decompress_size_prepended(&compressed)
                    .map_err(|e| StorageError::Compression(e.to_string()))?;
                SnapshotRecord::decode(&raw).map(Some)
            }
            None => Ok(None),
        }
    }

    fn store(&self, key: &DocumentKey, state: &[u8]) -> Result<(), StorageError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let record = SnapshotRecord::new(key, state.to_vec());
        let compressed = lz4_flex::compress_prepend_size(&record.encode()?);
        self.db
            .put_cf_opt(cf, key.to_string(), &compressed, &self.write_opts())?;
        log::debug!(
            "Stored snapshot {key}: {} bytes ({} compressed)",
            state.len(),
            compressed.len()
        );
        Ok(())
    }

    fn append_update(&self, key: &DocumentKey, seq: u64, fragment: &[u8]) -> Result<(), StorageError> {
        let cf = self.cf(CF_JOURNAL)?;
        let compressed = lz4_flex::compress_prepend_size(fragment);
        self.db
            .put_cf_opt(cf, journal_key(key, seq), &compressed, &self.write_opts())?;
        Ok(())
    }

    fn load_updates(&self, key: &DocumentKey) -> Result<Vec<(u64, Vec<u8>)>, StorageError> {
        self.journal_entries(key)?
            .into_iter()
            .map(|(seq, compressed)| {
                lz4_flex::decompress_size_prepended(&compressed)
                    .map(|fragment| (seq, fragment))
                    .map_err(|e| StorageError::Compression(e.to_string()))
            })
            .collect()
    }

    fn truncate_updates(&self, key: &DocumentKey, below: u64) -> Result<u64, StorageError> {
        let cf = self.cf(CF_JOURNAL)?;
        let mut batch = WriteBatch::default();
        let mut count = 0u64;
        for (seq, _) in self.journal_entries(key)? {
            if seq >= below {
                break;
            }
            batch.delete_cf(cf, journal_key(key, seq));
            count += 1;
        }
        if count > 0 {
            self.db.write_opt(batch, &self.write_opts())?;
        }
        Ok(count)
    }

    /// Flush memtables to disk.
    fn sync(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

/// Number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
