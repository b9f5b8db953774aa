//! Per-connection state machine.
//!
//! `Unauthenticated → Established(user) → Bound(user, document)`.
//! [`RelayHandler::handle`] consumes one decoded frame and returns the
//! actions the transport must carry out, keeping the socket loop free of
//! protocol rules.

use std::sync::Arc;

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::buffer::UpdateBuffer;
use crate::bus::{Bus, RELAY_TOPIC};
use crate::document::SyncDocument;
use crate::protocol::{BusEnvelope, Frame};
use crate::queue::{Job, JobQueue};
use crate::relay::auth::{PermissionCheck, TokenExchange};
use crate::relay::registry::SessionRegistry;
use crate::storage::{DocumentStore, StoreError};

pub const CLOSE_BAD_REQUEST: u16 = 3400;
pub const CLOSE_UNAUTHORIZED: u16 = 3401;
pub const CLOSE_FORBIDDEN: u16 = 3403;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Established { user: Uuid },
    Bound { user: Uuid, document: Uuid },
}

#[derive(Debug)]
pub struct Session {
    pub connection_id: Uuid,
    pub state: SessionState,
}

impl Session {
    pub fn new() -> Self {
        Self {
            connection_id: Uuid::new_v4(),
            state: SessionState::Unauthenticated,
        }
    }

    pub fn user(&self) -> Option<Uuid> {
        match self.state {
            SessionState::Unauthenticated => None,
            SessionState::Established { user } | SessionState::Bound { user, .. } => Some(user),
        }
    }

    pub fn document(&self) -> Option<Uuid> {
        match self.state {
            SessionState::Bound { document, .. } => Some(document),
            _ => None,
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// What the transport does in response to a frame.
#[derive(Debug)]
pub enum SessionAction {
    Reply(Frame),
    /// Start forwarding this document's fan-out to the client
    Attach(broadcast::Receiver<Arc<Vec<u8>>>),
    StartHeartbeat,
    Close { code: u16, reason: &'static str },
}

impl SessionAction {
    fn close(code: u16, reason: &'static str) -> Vec<Self> {
        vec![Self::Close { code, reason }]
    }
}

pub struct RelayHandler {
    tokens: Arc<TokenExchange>,
    permissions: Arc<dyn PermissionCheck>,
    registry: Arc<SessionRegistry>,
    bus: Arc<dyn Bus>,
    buffer: Arc<UpdateBuffer>,
    queue: Arc<JobQueue>,
    store: Arc<DocumentStore>,
}

impl RelayHandler {
    pub fn new(
        tokens: Arc<TokenExchange>,
        permissions: Arc<dyn PermissionCheck>,
        registry: Arc<SessionRegistry>,
        bus: Arc<dyn Bus>,
        buffer: Arc<UpdateBuffer>,
        queue: Arc<JobQueue>,
        store: Arc<DocumentStore>,
    ) -> Self {
        Self {
            tokens,
            permissions,
            registry,
            bus,
            buffer,
            queue,
            store,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub async fn handle(&self, session: &mut Session, frame: Frame) -> Vec<SessionAction> {
        match (session.state, frame) {
            (SessionState::Unauthenticated, Frame::Establish(token)) => {
                match self.tokens.redeem(&token).await {
                    Some(user) => {
                        log::info!("Connection {} established as {user}", session.connection_id);
                        session.state = SessionState::Established { user };
                        vec![
                            SessionAction::Reply(Frame::Establish(String::new())),
                            SessionAction::StartHeartbeat,
                        ]
                    }
                    None => {
                        log::info!("Connection {} presented an invalid token", session.connection_id);
                        SessionAction::close(CLOSE_UNAUTHORIZED, "Unauthorized")
                    }
                }
            }
            (SessionState::Unauthenticated, frame) => {
                log::debug!("Unauthenticated {:?} frame", frame.kind());
                SessionAction::close(CLOSE_UNAUTHORIZED, "Unauthorized")
            }

            (SessionState::Established { user }, Frame::Init(Some(document))) => {
                self.bind(session, user, document).await
            }
            (SessionState::Established { .. }, Frame::Init(None) | Frame::Establish(_))
            | (SessionState::Bound { .. }, Frame::Init(_) | Frame::Establish(_)) => {
                SessionAction::close(CLOSE_BAD_REQUEST, "Bad Request")
            }

            (SessionState::Bound { document, .. }, Frame::Update(delta)) => {
                self.update(session, document, delta).await;
                Vec::new()
            }
            (SessionState::Bound { document, .. }, Frame::Vector(vector)) => {
                self.vector(document, &vector).await
            }
            (SessionState::Bound { document, .. }, Frame::Awareness(payload)) => {
                self.publish(document, Frame::Awareness(payload)).await;
                Vec::new()
            }

            (_, frame) => {
                log::debug!(
                    "Ignoring {:?} frame on connection {}",
                    frame.kind(),
                    session.connection_id
                );
                Vec::new()
            }
        }
    }

    /// Remove the session from its document's fan-out set.
    pub async fn disconnect(&self, session: &Session) {
        if let SessionState::Bound { document, .. } = session.state {
            self.registry.unregister(document, session.connection_id).await;
            log::info!(
                "Connection {} left document {document} ({} sessions remain)",
                session.connection_id,
                self.registry.session_count(document).await
            );
        }
    }

    async fn bind(&self, session: &mut Session, user: Uuid, document: Uuid) -> Vec<SessionAction> {
        if !self.permissions.can_edit(user, document).await {
            log::info!("User {user} denied access to document {document}");
            return SessionAction::close(CLOSE_FORBIDDEN, "Forbidden");
        }

        let receiver = self
            .registry
            .register(document, session.connection_id, user)
            .await;
        session.state = SessionState::Bound { user, document };
        log::info!(
            "Connection {} bound to document {document} ({} sessions)",
            session.connection_id,
            self.registry.session_count(document).await
        );

        self.publish(document, Frame::Presence(user.as_bytes().to_vec()))
            .await;
        vec![
            SessionAction::Attach(receiver),
            SessionAction::Reply(Frame::Init(None)),
        ]
    }

    async fn update(&self, session: &Session, document: Uuid, delta: Vec<u8>) {
        if delta.is_empty() {
            log::debug!("Ignoring empty update on document {document}");
            return;
        }
        let Some(user) = session.user() else { return };

        self.publish(document, Frame::Update(delta.clone())).await;
        self.buffer.append(document, user, delta).await;
        self.queue.enqueue(Job::Collect(document)).await;
    }

    /// Answer a client's state vector against canonical state plus
    /// everything still buffered.
    async fn vector(&self, document: Uuid, remote: &[u8]) -> Vec<SessionAction> {
        let canonical = match self.store.load_document(document) {
            Ok(record) => Some(record.state),
            Err(StoreError::NotFound(_)) => None,
            Err(e) => {
                log::error!("Failed to load document {document}: {e}");
                return Vec::new();
            }
        };
        let pending = self.buffer.drain(document).await;

        let effective = match canonical {
            Some(state) => SyncDocument::from_state(&state),
            None => Ok(SyncDocument::new()),
        };
        let effective = match effective {
            Ok(doc) => doc,
            Err(e) => {
                log::error!("Canonical state of document {document} is unreadable: {e}");
                return Vec::new();
            }
        };
        for edit in &pending {
            if let Err(e) = effective.merge(&edit.payload) {
                log::debug!("Skipping undecodable buffered edit: {e}");
            }
        }

        match effective.diff_since(remote) {
            Ok(diff) => vec![
                SessionAction::Reply(Frame::Update(diff)),
                SessionAction::Reply(Frame::Vector(effective.state_vector())),
            ],
            Err(e) => {
                log::debug!("Malformed state vector for document {document}: {e}");
                SessionAction::close(CLOSE_BAD_REQUEST, "Bad Request")
            }
        }
    }

    async fn publish(&self, document: Uuid, frame: Frame) {
        let envelope = BusEnvelope::new(document, frame);
        self.bus.publish(RELAY_TOPIC, envelope.encode()).await;
    }
}
