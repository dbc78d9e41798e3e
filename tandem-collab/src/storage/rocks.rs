//! RocksDB-backed durable store.
//!
//! Column families:
//! - `checkpoints` — full document state per document (LZ4 compressed)
//! - `oplog`       — applied operations, keyed by `doc_id:version`
//! - `metadata`    — per-document summary (versions, record counts)
//!
//! Log keys are `<doc_id:16 bytes><version:8 bytes big-endian>` so a forward
//! iterator from `(doc_id, v)` yields that document's records in version
//! order.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::record::{CheckpointRecord, LogRecord};
use super::{DurableStore, StoreError};

const CF_CHECKPOINTS: &str = "checkpoints";
const CF_OPLOG: &str = "oplog";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_CHECKPOINTS, CF_OPLOG, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every write before it is acknowledged (default: true)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tandem_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Small caches, no fsync.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Per-document summary kept next to the checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub document_id: Uuid,
    /// Version of the stored checkpoint (0 = none yet)
    pub checkpoint_version: u64,
    /// Highest version appended to the log
    pub last_version: u64,
    /// Log records currently retained
    pub log_records: u64,
    /// Compressed checkpoint size in bytes
    pub checkpoint_bytes: u64,
    /// Seconds since epoch
    pub created_at: u64,
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(document_id: Uuid) -> Self {
        let now = unix_secs();
        Self {
            document_id,
            checkpoint_version: 0,
            last_version: 0,
            log_records: 0,
            checkpoint_bytes: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

/// RocksDB-backed [`DurableStore`].
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
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
        log::info!("Opened durable store at {}", config.path.display());

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
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_CHECKPOINTS => {
                // Values are already LZ4-compressed.
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_OPLOG => {
                // Many small appends, prefix-scanned by doc_id
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Load per-document metadata.
    pub fn metadata(&self, document_id: Uuid) -> Result<Option<DocumentMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, document_id.as_bytes())? {
            Some(bytes) => DocumentMetadata::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Force memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    /// `doc_id (16 bytes) + version (8 bytes big-endian)`.
    fn log_key(document_id: Uuid, version: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(document_id.as_bytes());
        key.extend_from_slice(&version.to_be_bytes());
        key
    }

    /// Iterate this document's log keys and values with `version >= from`.
    fn scan_log(
        &self,
        document_id: Uuid,
        from: u64,
        mut visit: impl FnMut(u64, &[u8], &[u8]) -> Result<bool, StoreError>,
    ) -> Result<(), StoreError> {
        let cf = self.cf(CF_OPLOG)?;
        let start_key = Self::log_key(document_id, from);
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start_key, Direction::Forward));

        for item in iter {
            let (key, value) = item?;
            if key.len() != 24 || &key[..16] != document_id.as_bytes() {
                break;
            }
            let mut ver_buf = [0u8; 8];
            ver_buf.copy_from_slice(&key[16..24]);
            if !visit(u64::from_be_bytes(ver_buf), &key, &value)? {
                break;
            }
        }
        Ok(())
    }
}

impl DurableStore for RocksStore {
    fn append(&self, record: &LogRecord) -> Result<(), StoreError> {
        let cf_log = self.cf(CF_OPLOG)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut meta = self
            .metadata(record.document_id)?
            .unwrap_or_else(|| DocumentMetadata::new(record.document_id));
        meta.last_version = meta.last_version.max(record.version);
        meta.log_records += 1;
        meta.updated_at = unix_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(
            cf_log,
            Self::log_key(record.document_id, record.version),
            record.encode()?,
        );
        batch.put_cf(cf_meta, record.document_id.as_bytes(), meta.encode()?);
        self.write(batch)
    }

    fn flush(&self, checkpoint: &CheckpointRecord) -> Result<u64, StoreError> {
        let document_id = checkpoint.document_id;
        let cf_cp = self.cf(CF_CHECKPOINTS)?;
        let cf_log = self.cf(CF_OPLOG)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut meta = self
            .metadata(document_id)?
            .unwrap_or_else(|| DocumentMetadata::new(document_id));
        let has_checkpoint = self.db.get_cf(cf_cp, document_id.as_bytes())?.is_some();
        if has_checkpoint && meta.checkpoint_version >= checkpoint.version {
            log::debug!(
                "Skipping checkpoint {} for {document_id}: stored is {}",
                checkpoint.version,
                meta.checkpoint_version
            );
            return Ok(0);
        }

        let compressed = checkpoint.encode()?;
        let mut batch = WriteBatch::default();
        batch.put_cf(cf_cp, document_id.as_bytes(), &compressed);

        let mut dropped = 0u64;
        self.scan_log(document_id, 0, |version, key, _| {
            if version > checkpoint.version {
                return Ok(false);
            }
            batch.delete_cf(cf_log, key);
            dropped += 1;
            Ok(true)
        })?;

        meta.checkpoint_version = checkpoint.version;
        meta.last_version = meta.last_version.max(checkpoint.version);
        meta.log_records = meta.log_records.saturating_sub(dropped);
        meta.checkpoint_bytes = compressed.len() as u64;
        meta.updated_at = unix_secs();
        batch.put_cf(cf_meta, document_id.as_bytes(), meta.encode()?);

        self.write(batch)?;
        Ok(dropped)
    }

    fn load(&self, document_id: Uuid) -> Result<Option<CheckpointRecord>, StoreError> {
        let cf = self.cf(CF_CHECKPOINTS)?;
        match self.db.get_cf(cf, document_id.as_bytes())? {
            Some(bytes) => CheckpointRecord::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn replay_from(&self, document_id: Uuid, after: u64) -> Result<Vec<LogRecord>, StoreError> {
        let mut records = Vec::new();
        self.scan_log(document_id, after.saturating_add(1), |_, _, value| {
            records.push(LogRecord::decode(value)?);
            Ok(true)
        })?;
        Ok(records)
    }

    fn list_documents(&self) -> Result<Vec<Uuid>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let bytes: [u8; 16] = key
                .as_ref()
                .try_into()
                .map_err(|_| StoreError::Deserialization("Invalid document key".into()))?;
            ids.push(Uuid::from_bytes(bytes));
        }
        Ok(ids)
    }
}

fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
