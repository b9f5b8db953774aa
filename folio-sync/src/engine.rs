//! Wires every component of the sync engine together.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::buffer::UpdateBuffer;
use crate::bus::{Bus, LocalBus};
use crate::collector::Collector;
use crate::compactor::Compactor;
use crate::config::EngineConfig;
use crate::document::CrdtState;
use crate::ephemeral::{EphemeralKv, EphemeralStore};
use crate::lock::DocumentLock;
use crate::notify::{BusNotifier, Notifier};
use crate::queue::JobQueue;
use crate::relay::{AllowAll, PermissionCheck, RelayError, RelayHandler, RelayServer, SessionRegistry, TokenExchange};
use crate::storage::{DocumentRecord, DocumentStore, StoreError};
use crate::view::DocumentKind;
use crate::worker::Worker;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Relay(#[from] RelayError),
}

/// Relay, collector, compactor and worker sharing one store, bus and
/// ephemeral store.
pub struct SyncEngine {
    config: EngineConfig,
    store: Arc<DocumentStore>,
    ephemeral: Arc<dyn EphemeralKv>,
    bus: Arc<dyn Bus>,
    buffer: Arc<UpdateBuffer>,
    queue: Arc<JobQueue>,
    lock: Arc<DocumentLock>,
    tokens: Arc<TokenExchange>,
    registry: Arc<SessionRegistry>,
    notifier: Arc<dyn Notifier>,
    permissions: Arc<dyn PermissionCheck>,
}

impl SyncEngine {
    /// Open with the in-process ephemeral store and bus.
    pub fn open(config: EngineConfig) -> Result<Self, EngineError> {
        let bus = Arc::new(LocalBus::new(config.relay.broadcast_capacity));
        Self::open_with(config, Arc::new(EphemeralStore::new()), bus)
    }

    /// Open on a shared ephemeral store and bus, as replicas of one
    /// deployment do.
    pub fn open_with(
        config: EngineConfig,
        ephemeral: Arc<dyn EphemeralKv>,
        bus: Arc<dyn Bus>,
    ) -> Result<Self, EngineError> {
        let store = Arc::new(DocumentStore::open(config.store.clone())?);
        let buffer = Arc::new(UpdateBuffer::new(ephemeral.clone()));
        let lock = Arc::new(DocumentLock::new(ephemeral.clone(), config.lock.clone()));
        let tokens = Arc::new(TokenExchange::new(ephemeral.clone(), config.relay.token_ttl));
        let registry = Arc::new(SessionRegistry::new(config.relay.broadcast_capacity));
        let notifier: Arc<dyn Notifier> = Arc::new(BusNotifier::new(bus.clone()));

        Ok(Self {
            config,
            store,
            ephemeral,
            bus,
            buffer,
            queue: Arc::new(JobQueue::new()),
            lock,
            tokens,
            registry,
            notifier,
            permissions: Arc::new(AllowAll),
        })
    }

    /// Replace the permission collaborator (defaults to allow-all).
    pub fn with_permissions(mut self, permissions: Arc<dyn PermissionCheck>) -> Self {
        self.permissions = permissions;
        self
    }

    /// Replace the downstream notifier (defaults to publishing on the bus).
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Register a new empty document.
    pub fn create_document(&self, id: Uuid, kind: DocumentKind) -> Result<DocumentRecord, StoreError> {
        self.store
            .create_document(id, kind, CrdtState::default(), Utc::now().timestamp_millis())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }

    pub fn ephemeral(&self) -> &Arc<dyn EphemeralKv> {
        &self.ephemeral
    }

    pub fn bus(&self) -> &Arc<dyn Bus> {
        &self.bus
    }

    pub fn buffer(&self) -> &Arc<UpdateBuffer> {
        &self.buffer
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn tokens(&self) -> &Arc<TokenExchange> {
        &self.tokens
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn collector(&self) -> Collector {
        Collector::new(
            self.store.clone(),
            self.buffer.clone(),
            self.lock.clone(),
            self.notifier.clone(),
        )
    }

    pub fn compactor(&self) -> Compactor {
        Compactor::new(
            self.store.clone(),
            self.lock.clone(),
            self.config.retention.clone(),
        )
    }

    pub fn worker(&self) -> Worker {
        Worker::new(
            self.queue.clone(),
            Arc::new(self.collector()),
            Arc::new(self.compactor()),
            self.buffer.clone(),
            self.store.clone(),
            self.config.worker.clone(),
        )
    }

    pub fn relay(&self) -> RelayServer {
        let handler = RelayHandler::new(
            self.tokens.clone(),
            self.permissions.clone(),
            self.registry.clone(),
            self.bus.clone(),
            self.buffer.clone(),
            self.queue.clone(),
            self.store.clone(),
        );
        RelayServer::new(self.config.relay.clone(), Arc::new(handler), self.bus.clone())
    }

    /// Bind the configured address and run relay and worker until `shutdown`.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), EngineError> {
        let listener = TcpListener::bind(&self.config.relay.bind_addr)
            .await
            .map_err(RelayError::from)?;
        self.serve(listener, shutdown).await
    }

    /// Run relay and worker on an already bound listener.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<(), EngineError> {
        let worker = tokio::spawn(Arc::new(self.worker()).run(shutdown.clone()));
        let relayed = self.relay().serve(listener, shutdown.clone()).await;

        shutdown.cancel();
        if let Err(e) = worker.await {
            log::error!("Worker task failed: {e}");
        }
        relayed?;
        Ok(())
    }
}
