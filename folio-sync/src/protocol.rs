//! Binary wire protocol between clients and the relay.
//!
//! Wire format:
//! ```text
//! ┌──────────┬──────────────────┐
//! │ kind     │ payload          │
//! │ 1 byte   │ variable         │
//! └──────────┴──────────────────┘
//! ```
//!
//! Relay replicas exchange frames over the bus wrapped in an envelope:
//! ```text
//! ┌──────────────────────┬──────┬──────────┬──────────┐
//! │ document id (UTF-8)  │ 0x00 │ kind     │ payload  │
//! │ 36 bytes             │      │ 1 byte   │ variable │
//! └──────────────────────┴──────┴──────────┴──────────┘
//! ```

use thiserror::Error;
use uuid::Uuid;

/// Frame kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// One-time token exchange (client) / acknowledgement (server)
    Establish = 0,
    /// Server liveness tick carrying an RFC 3339 timestamp
    Heartbeat = 1,
    /// Bind to a document (client) / acknowledgement (server)
    Init = 2,
    /// CRDT delta
    Update = 3,
    /// State vector
    Vector = 4,
    /// Ephemeral cursor/selection data, never persisted
    Awareness = 5,
    /// A session joined the document
    Presence = 6,
}

impl TryFrom<u8> for MessageKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Establish,
            1 => Self::Heartbeat,
            2 => Self::Init,
            3 => Self::Update,
            4 => Self::Vector,
            5 => Self::Awareness,
            6 => Self::Presence,
            other => return Err(ProtocolError::UnknownKind(other)),
        })
    }
}

/// A decoded frame. Payload decoding is per kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Token from the client; empty when sent by the server as an ack.
    Establish(String),
    Heartbeat(String),
    /// Document to bind; `None` when sent by the server as an ack.
    Init(Option<Uuid>),
    Update(Vec<u8>),
    Vector(Vec<u8>),
    Awareness(Vec<u8>),
    Presence(Vec<u8>),
}

impl Frame {
    pub fn kind(&self) -> MessageKind {
        match self {
            Frame::Establish(_) => MessageKind::Establish,
            Frame::Heartbeat(_) => MessageKind::Heartbeat,
            Frame::Init(_) => MessageKind::Init,
            Frame::Update(_) => MessageKind::Update,
            Frame::Vector(_) => MessageKind::Vector,
            Frame::Awareness(_) => MessageKind::Awareness,
            Frame::Presence(_) => MessageKind::Presence,
        }
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            Frame::Establish(text) | Frame::Heartbeat(text) => text.as_bytes().to_vec(),
            Frame::Init(Some(id)) => id.hyphenated().to_string().into_bytes(),
            Frame::Init(None) => Vec::new(),
            Frame::Update(bytes)
            | Frame::Vector(bytes)
            | Frame::Awareness(bytes)
            | Frame::Presence(bytes) => bytes.clone(),
        }
    }

    /// Serialize to `[kind][payload]`.
    pub fn encode(&self) -> Vec<u8> {
        let payload = self.payload();
        let mut out = Vec::with_capacity(1 + payload.len());
        out.push(self.kind() as u8);
        out.extend_from_slice(&payload);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (&kind, payload) = bytes.split_first().ok_or(ProtocolError::Empty)?;
        Ok(match MessageKind::try_from(kind)? {
            MessageKind::Establish => Frame::Establish(utf8(payload)?),
            MessageKind::Heartbeat => Frame::Heartbeat(utf8(payload)?),
            MessageKind::Init if payload.is_empty() => Frame::Init(None),
            MessageKind::Init => Frame::Init(Some(parse_document_id(payload)?)),
            MessageKind::Update => Frame::Update(payload.to_vec()),
            MessageKind::Vector => Frame::Vector(payload.to_vec()),
            MessageKind::Awareness => Frame::Awareness(payload.to_vec()),
            MessageKind::Presence => Frame::Presence(payload.to_vec()),
        })
    }
}

/// A frame addressed to every session bound to `document_id`, in any relay process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusEnvelope {
    pub document_id: Uuid,
    pub frame: Frame,
}

impl BusEnvelope {
    pub fn new(document_id: Uuid, frame: Frame) -> Self {
        Self { document_id, frame }
    }

    pub fn encode(&self) -> Vec<u8> {
        let id = self.document_id.hyphenated().to_string();
        let frame = self.frame.encode();
        let mut out = Vec::with_capacity(id.len() + 1 + frame.len());
        out.extend_from_slice(id.as_bytes());
        out.push(0);
        out.extend_from_slice(&frame);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let split = bytes
            .iter()
            .position(|&b| b == 0)
            .ok_or(ProtocolError::MissingSeparator)?;
        Ok(Self {
            document_id: parse_document_id(&bytes[..split])?,
            frame: Frame::decode(&bytes[split + 1..])?,
        })
    }
}

fn utf8(payload: &[u8]) -> Result<String, ProtocolError> {
    String::from_utf8(payload.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
}

fn parse_document_id(payload: &[u8]) -> Result<Uuid, ProtocolError> {
    let text = std::str::from_utf8(payload).map_err(|_| ProtocolError::InvalidUtf8)?;
    Uuid::parse_str(text).map_err(|_| ProtocolError::InvalidDocumentId(text.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("empty frame")]
    Empty,
    #[error("unknown message kind {0}")]
    UnknownKind(u8),
    #[error("payload is not valid UTF-8")]
    InvalidUtf8,
    #[error("invalid document id: {0:?}")]
    InvalidDocumentId(String),
    #[error("bus envelope has no separator")]
    MissingSeparator,
}
