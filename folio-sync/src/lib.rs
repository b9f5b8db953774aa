//! # folio-sync — collaborative document sync and history compaction
//!
//! Many clients edit one document concurrently over WebSocket; their CRDT
//! edits are fanned out immediately and folded into a durable, attributed
//! snapshot history in the background.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────┐  UPDATE   ┌──────────────┐  fan-out (bus)  ┌─────────┐
//! │ Client  │ ────────► │ RelayHandler │ ──────────────► │ Clients │
//! └─────────┘           └──────┬───────┘                 └─────────┘
//!                              │ append + enqueue
//!                              ▼
//!                       ┌──────────────┐   drain   ┌───────────┐
//!                       │ UpdateBuffer │ ◄──────── │ Collector │──► notify
//!                       └──────────────┘           └─────┬─────┘
//!                                                        │ one batch
//!                       ┌──────────────┐  rewrite  ┌─────▼─────────┐
//!                       │ Compactor    │ ────────► │ DocumentStore │
//!                       └──────────────┘           │ (RocksDB)     │
//!                                                  └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`document`] — CRDT document: merge, diff, snapshot, reconstruct, revert
//! - [`view`] — Materialized view and character deltas
//! - [`protocol`] — Binary wire frames and bus envelopes
//! - [`relay`] — Session state machine, fan-out registry, WebSocket server
//! - [`buffer`] — Pending edits per document
//! - [`collector`] — Merges pending edits into snapshots
//! - [`compactor`] — Time-decayed snapshot retention
//! - [`worker`] — Job execution, retries and periodic scans
//! - [`storage`] — RocksDB persistence

pub mod buffer;
pub mod bus;
pub mod collector;
pub mod compactor;
pub mod config;
pub mod document;
pub mod engine;
pub mod ephemeral;
pub mod lock;
pub mod notify;
pub mod protocol;
pub mod queue;
pub mod relay;
pub mod storage;
pub mod view;
pub mod worker;

// Re-exports for convenience
pub use buffer::{BufferError, PendingEdit, UpdateBuffer};
pub use bus::{Bus, BusStats, LocalBus, RELAY_TOPIC};
pub use collector::{CollectError, CollectOutcome, Collector};
pub use compactor::{retain, CompactError, CompactOutcome, Compactor, RetentionKey, RetentionPolicy};
pub use config::{ConfigError, EngineConfig};
pub use document::{CrdtState, DocumentError, SnapshotToken, SyncDocument};
pub use engine::{EngineError, SyncEngine};
pub use ephemeral::{EphemeralKv, EphemeralStore};
pub use lock::{DocumentLock, LockConfig, LockError, LockGuard};
pub use notify::{BusNotifier, DownstreamEvent, Notifier, NotifyError};
pub use protocol::{BusEnvelope, Frame, MessageKind, ProtocolError};
pub use queue::{Job, JobQueue, QueuedJob};
pub use relay::{
    AllowAll, PermissionCheck, RelayConfig, RelayError, RelayHandler, RelayServer, Session,
    SessionRegistry, StaticPermissions, TokenExchange,
};
pub use storage::{
    CharacterCount, CollectionCommit, DocumentRecord, DocumentStore, NewSnapshot, SnapshotRecord,
    StoreConfig, StoreError,
};
pub use view::{CharacterDelta, DocumentKind, MaterializedView};
pub use worker::{JobError, Worker, WorkerConfig};
