//! Persistent storage for documents, snapshot history and derived data.
//!
//! ```text
//! ┌─────────────┐  commit_collection  ┌──────────────────────────────────────┐
//! │ Collector   │ ──────────────────► │ DocumentStore (RocksDB)              │
//! └─────────────┘                     │  CF "documents"        canonical state│
//! ┌─────────────┐  commit_compaction  │  CF "snapshots"        LZ4 tokens    │
//! │ Compactor   │ ──────────────────► │  CF "views"            JSON view     │
//! └─────────────┘                     │  CF "character_counts" hourly usage  │
//!                                     │  CF "activity"         timestamps    │
//!                                     └──────────────────────────────────────┘
//! ```

pub mod codec;
pub mod rocks;

pub use rocks::{
    CharacterCount, CollectionCommit, DocumentRecord, DocumentStore, NewSnapshot, SnapshotRecord,
    StoreConfig, StoreError,
};
