//! Downstream notifications emitted after a snapshot-producing collection.
//!
//! Delivery is best-effort: a failed notification is logged and never rolls
//! back the committed collection.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::bus::Bus;
use crate::view::DocumentKind;

pub const DOCUMENT_UPDATED_TOPIC: &str = "site:update";
pub const USAGE_UPDATED_TOPIC: &str = "site:usage:update";
pub const INDEX_REQUESTED_TOPIC: &str = "search:index";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DownstreamEvent {
    /// Live UI refresh
    DocumentUpdated { document: Uuid, kind: DocumentKind },
    /// Usage counters (character counts, blob size) changed
    UsageUpdated { document: Uuid },
    /// Search index should re-read the document
    IndexRequested { document: Uuid },
}

impl DownstreamEvent {
    /// The three events a snapshot-producing collection emits.
    pub fn after_collection(document: Uuid, kind: DocumentKind) -> Vec<Self> {
        vec![
            Self::DocumentUpdated { document, kind },
            Self::UsageUpdated { document },
            Self::IndexRequested { document },
        ]
    }

    pub fn topic(&self) -> &'static str {
        match self {
            Self::DocumentUpdated { .. } => DOCUMENT_UPDATED_TOPIC,
            Self::UsageUpdated { .. } => USAGE_UPDATED_TOPIC,
            Self::IndexRequested { .. } => INDEX_REQUESTED_TOPIC,
        }
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("notification rejected: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: DownstreamEvent) -> Result<(), NotifyError>;
}

/// Publishes events as JSON on the bus, one topic per event type.
pub struct BusNotifier {
    bus: Arc<dyn Bus>,
}

impl BusNotifier {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl Notifier for BusNotifier {
    async fn notify(&self, event: DownstreamEvent) -> Result<(), NotifyError> {
        let payload = serde_json::to_vec(&event)?;
        let receivers = self.bus.publish(event.topic(), payload).await;
        log::trace!("Published {} to {receivers} subscribers", event.topic());
        Ok(())
    }
}

/// Deliver every event, logging failures instead of propagating them.
pub async fn notify_all(notifier: &dyn Notifier, events: Vec<DownstreamEvent>) {
    for event in events {
        let topic = event.topic();
        if let Err(e) = notifier.notify(event).await {
            log::warn!("Downstream notification on {topic} failed: {e}");
        }
    }
}
