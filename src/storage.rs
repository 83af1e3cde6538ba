//! RocksDB-backed adapter.
//!
//! Column families:
//! - `snapshots` — LZ4-compressed JSON server copies, keyed by room
//! - `metadata`  — per-room bookkeeping (revision count, sizes, timestamps)
//!
//! This is the durable counterpart to [`MemoryAdapter`]: `store_data`
//! overwrites the room's snapshot, `get_data` decompresses it or falls
//! back to the configured seed for rooms that were never stored. Edit
//! batches are not persisted — the latest server copy is the contract.
//!
//! [`MemoryAdapter`]: crate::adapter::MemoryAdapter

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteOptions,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::adapter::{Adapter, AdapterError, AdapterResult};
use crate::protocol::Edit;

const CF_SNAPSHOTS: &str = "snapshots";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_METADATA];

/// Storage configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Seed document for rooms without a stored snapshot
    pub seed: Value,
    /// Block cache size in bytes
    pub block_cache_size: usize,
    /// fsync on every write (off by default; RocksDB batches)
    pub sync_writes: bool,
    /// Max open files for RocksDB
    pub max_open_files: i32,
}

impl StorageConfig {
    pub fn new(path: impl Into<PathBuf>, seed: Value) -> Self {
        Self {
            path: path.into(),
            seed,
            block_cache_size: 64 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 256,
        }
    }
}

/// Per-room metadata stored alongside snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMetadata {
    /// Number of snapshots written for this room
    pub revisions: u64,
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    /// Compressed snapshot size in bytes
    pub compressed_size: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last write timestamp (seconds since epoch)
    pub updated_at: u64,
    /// User id of the last writer
    pub updated_by: String,
}

impl DocumentMetadata {
    fn new() -> Self {
        let now = unix_now();
        Self {
            revisions: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
            updated_by: String::new(),
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Storage errors.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("decompression error: {0}")]
    Decompression(String),
    #[error("missing column family {0}")]
    MissingColumnFamily(&'static str),
}

impl From<rocksdb::Error> for StorageError {
    fn from(e: rocksdb::Error) -> Self {
        StorageError::Database(e.to_string())
    }
}

impl From<StorageError> for AdapterError {
    fn from(e: StorageError) -> Self {
        AdapterError::new(e.to_string())
    }
}

/// RocksDB-backed room snapshot store.
pub struct RocksAdapter {
    /// RocksDB instance (single-threaded mode — concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: StorageConfig,
    snapshots_written: AtomicU64,
}

impl RocksAdapter {
    /// Open the store at the configured path, creating the database and
    /// column families as needed.
    pub fn open(config: StorageConfig) -> Result<Self, StorageError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(&config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Self {
            db,
            config,
            snapshots_written: AtomicU64::new(0),
        })
    }

    fn cf_options(config: &StorageConfig) -> Options {
        let mut opts = Options::default();
        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        opts.set_block_based_table_factory(&block_opts);
        // Snapshots are LZ4-compressed by us; skip double compression.
        opts.set_compression_type(DBCompressionType::None);
        opts
    }

    fn cf(&self, name: &'static str) -> Result<&rocksdb::ColumnFamily, StorageError> {
        self.db
            .cf_handle(name)
            .ok_or(StorageError::MissingColumnFamily(name))
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    /// Load the stored snapshot for `room`, if any.
    pub fn load_snapshot(&self, room: &str) -> Result<Option<Value>, StorageError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let Some(compressed) = self.db.get_cf(cf, room.as_bytes())? else {
            return Ok(None);
        };
        let raw = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StorageError::Decompression(e.to_string()))?;
        let value = serde_json::from_slice(&raw)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        Ok(Some(value))
    }

    /// Persist a snapshot and refresh the room's metadata.
    pub fn save_snapshot(
        &self,
        room: &str,
        user_id: &str,
        server_copy: &Value,
    ) -> Result<(), StorageError> {
        let raw = serde_json::to_vec(server_copy)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&raw);

        let snapshots = self.cf(CF_SNAPSHOTS)?;
        self.db
            .put_cf_opt(snapshots, room.as_bytes(), &compressed, &self.write_options())?;

        let mut meta = self.metadata(room)?.unwrap_or_else(DocumentMetadata::new);
        meta.revisions += 1;
        meta.snapshot_size = raw.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = unix_now();
        meta.updated_by = user_id.to_string();

        let encoded = serde_json::to_vec(&meta)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        let metadata = self.cf(CF_METADATA)?;
        self.db
            .put_cf_opt(metadata, room.as_bytes(), &encoded, &self.write_options())?;

        self.snapshots_written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Stored metadata for `room`, if any.
    pub fn metadata(&self, room: &str) -> Result<Option<DocumentMetadata>, StorageError> {
        let cf = self.cf(CF_METADATA)?;
        let Some(bytes) = self.db.get_cf(cf, room.as_bytes())? else {
            return Ok(None);
        };
        let meta = serde_json::from_slice(&bytes)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        Ok(Some(meta))
    }

    /// All rooms with a stored snapshot.
    pub fn list_rooms(&self) -> Result<Vec<String>, StorageError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let mut rooms = Vec::new();
        for entry in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = entry?;
            rooms.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(rooms)
    }

    /// Snapshots written since this adapter was opened.
    pub fn snapshots_written(&self) -> u64 {
        self.snapshots_written.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Adapter for RocksAdapter {
    async fn get_data(&self, room: &str, _user_id: &str) -> AdapterResult<Value> {
        match self.load_snapshot(room)? {
            Some(value) => Ok(value),
            None => Ok(self.config.seed.clone()),
        }
    }

    async fn store_data(
        &self,
        room: &str,
        user_id: &str,
        server_copy: &Value,
        edits: &[Edit],
    ) -> AdapterResult<()> {
        log::trace!("persisting {room}: {} triggering edits", edits.len());
        self.save_snapshot(room, user_id, server_copy)?;
        Ok(())
    }
}
