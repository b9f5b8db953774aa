//! RocksDB-backed persistent document store.
//!
//! Column families:
//! - `documents`        — canonical CRDT state + timestamps, keyed by doc_id
//! - `snapshots`        — snapshot history, keyed by doc_id:created_at:order:snapshot_id
//! - `views`            — materialized view (JSON), keyed by doc_id
//! - `character_counts` — hourly additions/deletions, keyed by doc_id:contributor:bucket
//! - `activity`         — updated/compacted timestamps only, keyed by doc_id; scanned
//!                        to find compaction work without decoding CRDT state
//!
//! Every collection pass and every compaction is written as one atomic
//! `WriteBatch`.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

use super::codec::{compress_payload, decode_record, decompress_payload, encode_record};
use crate::document::CrdtState;
use crate::view::{DocumentKind, MaterializedView};

const CF_DOCUMENTS: &str = "documents";
const CF_SNAPSHOTS: &str = "snapshots";
const CF_VIEWS: &str = "views";
const CF_CHARACTER_COUNTS: &str = "character_counts";
const CF_ACTIVITY: &str = "activity";

const COLUMN_FAMILIES: &[&str] = &[
    CF_DOCUMENTS,
    CF_SNAPSHOTS,
    CF_VIEWS,
    CF_CHARACTER_COUNTS,
    CF_ACTIVITY,
];

/// Snapshot key length: doc_id (16) + created_at (8) + order (4) + snapshot_id (16).
const SNAPSHOT_KEY_LEN: usize = 44;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 256MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every commit
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("folio_data"),
            block_cache_size: 256 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, no fsync).
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

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("document not found: {0}")]
    NotFound(Uuid),
    #[error("document already exists: {0}")]
    AlreadyExists(Uuid),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// A document's canonical state and bookkeeping timestamps (ms since epoch).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: Uuid,
    pub kind: DocumentKind,
    pub state: CrdtState,
    pub created_at_ms: i64,
    /// Last collection that produced a snapshot
    pub updated_at_ms: i64,
    pub compacted_at_ms: Option<i64>,
}

impl DocumentRecord {
    /// Updated since the last compaction.
    pub fn needs_compaction(&self) -> bool {
        Activity::of(self).needs_compaction()
    }
}

/// A persisted snapshot. `payload` is the LZ4-compressed snapshot token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub id: Uuid,
    pub document_id: Uuid,
    pub created_at_ms: i64,
    pub order: u32,
    pub payload: Vec<u8>,
    pub contributors: Vec<Uuid>,
}

impl SnapshotRecord {
    /// Decompressed snapshot token bytes.
    pub fn token(&self) -> Result<Vec<u8>, StoreError> {
        decompress_payload(&self.payload)
    }
}

/// A snapshot about to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSnapshot {
    pub created_at_ms: i64,
    pub order: u32,
    /// Encoded snapshot token, uncompressed
    pub token: Vec<u8>,
    pub contributors: Vec<Uuid>,
}

/// Characters one contributor added and removed within one hourly bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacterCount {
    pub contributor: Uuid,
    pub bucket_ms: i64,
    pub additions: u64,
    pub deletions: u64,
}

/// Timestamps mirrored out of [`DocumentRecord`] for the compaction scan.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct Activity {
    updated_at_ms: i64,
    compacted_at_ms: Option<i64>,
}

impl Activity {
    fn of(record: &DocumentRecord) -> Self {
        Self {
            updated_at_ms: record.updated_at_ms,
            compacted_at_ms: record.compacted_at_ms,
        }
    }

    fn needs_compaction(&self) -> bool {
        self.compacted_at_ms
            .map_or(true, |compacted| self.updated_at_ms > compacted)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct CountValue {
    additions: u64,
    deletions: u64,
}

/// Everything one collection pass writes.
#[derive(Debug, Clone)]
pub struct CollectionCommit {
    pub document_id: Uuid,
    pub state: CrdtState,
    pub snapshots: Vec<NewSnapshot>,
    /// Accumulated onto existing buckets
    pub character_counts: Vec<CharacterCount>,
    pub view: Option<MaterializedView>,
    pub committed_at_ms: i64,
}

/// RocksDB-backed document store.
pub struct DocumentStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl DocumentStore {
    /// Open the document store, creating the database and column families
    /// if they don't exist.
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

        log::info!("Opened document store at {}", config.path.display());
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

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENTS | CF_VIEWS | CF_ACTIVITY => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_SNAPSHOTS | CF_CHARACTER_COUNTS => {
                // prefix-scanned by doc_id
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
                // payloads are already LZ4-compressed
                if name == CF_SNAPSHOTS {
                    opts.set_compression_type(DBCompressionType::None);
                }
            }
            _ => {}
        }

        opts
    }

    // ─── Documents ────────────────────────────────────────────────────

    /// Register a new document with an initial state.
    pub fn create_document(
        &self,
        id: Uuid,
        kind: DocumentKind,
        initial: CrdtState,
        now_ms: i64,
    ) -> Result<DocumentRecord, StoreError> {
        if self.document_exists(id)? {
            return Err(StoreError::AlreadyExists(id));
        }
        let record = DocumentRecord {
            id,
            kind,
            state: initial,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
            compacted_at_ms: None,
        };
        let mut batch = WriteBatch::default();
        self.put_record(&mut batch, &record)?;
        self.db.write_opt(batch, &self.write_options())?;
        Ok(record)
    }

    pub fn load_document(&self, id: Uuid) -> Result<DocumentRecord, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(&cf, id.as_bytes())? {
            Some(bytes) => decode_record(&bytes),
            None => Err(StoreError::NotFound(id)),
        }
    }

    pub fn document_exists(&self, id: Uuid) -> Result<bool, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        Ok(self.db.get_cf(&cf, id.as_bytes())?.is_some())
    }

    /// Documents updated since their last compaction and idle for at least
    /// `idle_ms`. Reads only the `activity` rows, never the CRDT state.
    pub fn documents_due_for_compaction(
        &self,
        now_ms: i64,
        idle_ms: i64,
    ) -> Result<Vec<Uuid>, StoreError> {
        let cf = self.cf(CF_ACTIVITY)?;
        let mut due = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, value) = item?;
            let Ok(id) = Uuid::from_slice(&key) else {
                log::warn!("Skipping activity row with malformed key ({} bytes)", key.len());
                continue;
            };
            let activity: Activity = match decode_record(&value) {
                Ok(activity) => activity,
                Err(e) => {
                    log::warn!("Skipping unreadable activity row for document {id}: {e}");
                    continue;
                }
            };
            if activity.needs_compaction() && now_ms - activity.updated_at_ms >= idle_ms {
                due.push(id);
            }
        }
        Ok(due)
    }

    // ─── Snapshots ────────────────────────────────────────────────────

    /// Snapshot history in `(created_at, order)` order. Rows that fail to
    /// decode are logged and left out.
    pub fn list_snapshots(&self, document: Uuid) -> Result<Vec<SnapshotRecord>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let mut snapshots = Vec::new();
        for item in self.db.iterator_cf(
            &cf,
            IteratorMode::From(document.as_bytes(), Direction::Forward),
        ) {
            let (key, value) = item?;
            if key.len() < 16 || &key[..16] != document.as_bytes() {
                break;
            }
            match decode_record(&value) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => log::warn!("Skipping unreadable snapshot row for document {document}: {e}"),
            }
        }
        Ok(snapshots)
    }

    /// Creation time of the newest snapshot, read from its key.
    pub fn last_snapshot_at(&self, document: Uuid) -> Result<Option<i64>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let mut upper = [0xFFu8; SNAPSHOT_KEY_LEN];
        upper[..16].copy_from_slice(document.as_bytes());

        let mut iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&upper, Direction::Reverse));
        match iter.next() {
            Some(item) => {
                let (key, _) = item?;
                if key.len() < 24 || &key[..16] != document.as_bytes() {
                    return Ok(None);
                }
                Ok(Some(read_i64(&key[16..24])))
            }
            None => Ok(None),
        }
    }

    // ─── Views & counters ─────────────────────────────────────────────

    pub fn load_view(&self, document: Uuid) -> Result<MaterializedView, StoreError> {
        let cf = self.cf(CF_VIEWS)?;
        match self.db.get_cf(&cf, document.as_bytes())? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| StoreError::Deserialization(e.to_string())),
            None => Err(StoreError::NotFound(document)),
        }
    }

    pub fn character_counts(&self, document: Uuid) -> Result<Vec<CharacterCount>, StoreError> {
        let cf = self.cf(CF_CHARACTER_COUNTS)?;
        let mut counts = Vec::new();
        for item in self.db.iterator_cf(
            &cf,
            IteratorMode::From(document.as_bytes(), Direction::Forward),
        ) {
            let (key, value) = item?;
            if key.len() != 40 || &key[..16] != document.as_bytes() {
                break;
            }
            let contributor = Uuid::from_slice(&key[16..32])
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
            let bucket_ms = read_i64(&key[32..40]);
            let value: CountValue = decode_record(&value)?;
            counts.push(CharacterCount {
                contributor,
                bucket_ms,
                additions: value.additions,
                deletions: value.deletions,
            });
        }
        Ok(counts)
    }

    // ─── Commits ──────────────────────────────────────────────────────

    /// Persist one collection pass atomically: canonical state, new
    /// snapshots, accumulated character counts and the view.
    pub fn commit_collection(&self, commit: CollectionCommit) -> Result<(), StoreError> {
        let mut record = self.load_document(commit.document_id)?;
        record.state = commit.state;
        if !commit.snapshots.is_empty() {
            record.updated_at_ms = commit.committed_at_ms;
        }

        let cf_snapshots = self.cf(CF_SNAPSHOTS)?;
        let cf_counts = self.cf(CF_CHARACTER_COUNTS)?;
        let cf_views = self.cf(CF_VIEWS)?;

        let mut batch = WriteBatch::default();
        self.put_record(&mut batch, &record)?;
        for snapshot in commit.snapshots {
            let (key, value) = Self::snapshot_entry(commit.document_id, snapshot)?;
            batch.put_cf(&cf_snapshots, key, value);
        }

        let mut merged: HashMap<Vec<u8>, CountValue> = HashMap::new();
        for count in commit.character_counts {
            let key = Self::count_key(commit.document_id, count.contributor, count.bucket_ms);
            let entry = match merged.get(&key) {
                Some(existing) => *existing,
                None => match self.db.get_cf(&cf_counts, &key)? {
                    Some(bytes) => decode_record(&bytes)?,
                    None => CountValue::default(),
                },
            };
            merged.insert(
                key,
                CountValue {
                    additions: entry.additions + count.additions,
                    deletions: entry.deletions + count.deletions,
                },
            );
        }
        for (key, value) in merged {
            batch.put_cf(&cf_counts, key, encode_record(&value)?);
        }

        if let Some(view) = commit.view {
            let json = serde_json::to_vec(&view).map_err(|e| StoreError::Serialization(e.to_string()))?;
            batch.put_cf(&cf_views, commit.document_id.as_bytes(), json);
        }

        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }

    /// Replace a document's snapshot history and canonical state atomically.
    pub fn commit_compaction(
        &self,
        document: Uuid,
        state: CrdtState,
        snapshots: Vec<NewSnapshot>,
        compacted_at_ms: i64,
    ) -> Result<(), StoreError> {
        let mut record = self.load_document(document)?;
        record.state = state;
        record.compacted_at_ms = Some(compacted_at_ms);

        let cf_snapshots = self.cf(CF_SNAPSHOTS)?;

        let mut batch = WriteBatch::default();
        for item in self.db.iterator_cf(
            &cf_snapshots,
            IteratorMode::From(document.as_bytes(), Direction::Forward),
        ) {
            let (key, _) = item?;
            if key.len() < 16 || &key[..16] != document.as_bytes() {
                break;
            }
            batch.delete_cf(&cf_snapshots, &key);
        }
        for snapshot in snapshots {
            let (key, value) = Self::snapshot_entry(document, snapshot)?;
            batch.put_cf(&cf_snapshots, key, value);
        }
        self.put_record(&mut batch, &record)?;

        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }

    /// Record that compaction ran without changing anything.
    pub fn mark_compacted(&self, document: Uuid, compacted_at_ms: i64) -> Result<(), StoreError> {
        let mut record = self.load_document(document)?;
        record.compacted_at_ms = Some(compacted_at_ms);
        let mut batch = WriteBatch::default();
        self.put_record(&mut batch, &record)?;
        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    /// Stage a document record together with its activity row.
    fn put_record(&self, batch: &mut WriteBatch, record: &DocumentRecord) -> Result<(), StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_activity = self.cf(CF_ACTIVITY)?;
        batch.put_cf(&cf_docs, record.id.as_bytes(), encode_record(record)?);
        batch.put_cf(&cf_activity, record.id.as_bytes(), encode_record(&Activity::of(record))?);
        Ok(())
    }

    fn write_options(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }

    fn snapshot_entry(
        document: Uuid,
        snapshot: NewSnapshot,
    ) -> Result<(Vec<u8>, Vec<u8>), StoreError> {
        let record = SnapshotRecord {
            id: Uuid::new_v4(),
            document_id: document,
            created_at_ms: snapshot.created_at_ms,
            order: snapshot.order,
            payload: compress_payload(&snapshot.token),
            contributors: snapshot.contributors,
        };
        let key = Self::snapshot_key(&record);
        Ok((key, encode_record(&record)?))
    }

    /// doc_id (16) + created_at (8, BE) + order (4, BE) + snapshot_id (16).
    fn snapshot_key(record: &SnapshotRecord) -> Vec<u8> {
        let mut key = Vec::with_capacity(SNAPSHOT_KEY_LEN);
        key.extend_from_slice(record.document_id.as_bytes());
        key.extend_from_slice(&sortable_i64(record.created_at_ms));
        key.extend_from_slice(&record.order.to_be_bytes());
        key.extend_from_slice(record.id.as_bytes());
        key
    }

    /// doc_id (16) + contributor (16) + bucket (8, BE).
    fn count_key(document: Uuid, contributor: Uuid, bucket_ms: i64) -> Vec<u8> {
        let mut key = Vec::with_capacity(40);
        key.extend_from_slice(document.as_bytes());
        key.extend_from_slice(contributor.as_bytes());
        key.extend_from_slice(&sortable_i64(bucket_ms));
        key
    }
}

/// Big-endian encoding that sorts signed values correctly.
fn sortable_i64(value: i64) -> [u8; 8] {
    ((value as u64) ^ (1 << 63)).to_be_bytes()
}

fn read_i64(bytes: &[u8]) -> i64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    (u64::from_be_bytes(buf) ^ (1 << 63)) as i64
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
