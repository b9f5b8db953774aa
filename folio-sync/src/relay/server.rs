//! WebSocket relay server.
//!
//! ```text
//! Client A ──┐                                   ┌── Client A
//!             ├─ RelayHandler ─► bus "sync:relay" ─► SessionRegistry ─┤
//! Client B ──┘        │                          └── Client B
//!                     └─► UpdateBuffer ─► JobQueue (collect)
//! ```
//!
//! Every frame a session fans out goes through the bus, including frames
//! for sessions on this process, so replicas sharing a bus stay consistent.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use crate::bus::{Bus, RELAY_TOPIC};
use crate::protocol::{BusEnvelope, Frame, ProtocolError};
use crate::relay::registry::SessionRegistry;
use crate::relay::session::{RelayHandler, Session, SessionAction, CLOSE_BAD_REQUEST};

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Fan-out channel capacity per document
    pub broadcast_capacity: usize,
    /// Heartbeat interval after ESTABLISH
    pub heartbeat_interval: Duration,
    /// Lifetime of an unredeemed one-time token
    pub token_ttl: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            heartbeat_interval: Duration::from_secs(1),
            token_ttl: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

pub struct RelayServer {
    config: RelayConfig,
    handler: Arc<RelayHandler>,
    bus: Arc<dyn Bus>,
}

impl RelayServer {
    pub fn new(config: RelayConfig, handler: Arc<RelayHandler>, bus: Arc<dyn Bus>) -> Self {
        Self {
            config,
            handler,
            bus,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Bind the configured address and serve until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), RelayError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(
        &self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), RelayError> {
        log::info!("Relay listening on {}", listener.local_addr()?);

        let forwarder = tokio::spawn(forward_bus(
            self.bus.subscribe(RELAY_TOPIC).await,
            self.handler.registry().clone(),
        ));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    log::debug!("New TCP connection from {addr}");

                    let handler = self.handler.clone();
                    let heartbeat = self.config.heartbeat_interval;
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, handler, heartbeat, shutdown).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
            }
        }

        forwarder.abort();
        let registry = self.handler.registry().stats().await;
        let bus = self.bus.stats().await;
        log::info!(
            "Relay stopped: {} frames fanned out, {} sessions on {} documents still bound, {} bus messages on {} topics",
            registry.frames_sent,
            registry.sessions,
            registry.documents,
            bus.messages_published,
            bus.topics
        );
        Ok(())
    }
}

/// Deliver bus envelopes to the sessions bound on this process.
async fn forward_bus(
    mut receiver: broadcast::Receiver<Arc<Vec<u8>>>,
    registry: Arc<SessionRegistry>,
) {
    loop {
        match receiver.recv().await {
            Ok(bytes) => match BusEnvelope::decode(&bytes) {
                Ok(envelope) => {
                    let frame = Arc::new(envelope.frame.encode());
                    registry.broadcast(envelope.document_id, frame).await;
                }
                Err(e) => log::warn!("Dropping malformed bus envelope: {e}"),
            },
            Err(broadcast::error::RecvError::Lagged(n)) => {
                log::warn!("Relay bus forwarder lagged by {n} messages");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    handler: Arc<RelayHandler>,
    heartbeat: Duration,
    shutdown: CancellationToken,
) -> Result<(), RelayError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    log::info!("WebSocket connection established from {addr}");

    let mut session = Session::new();
    let result = run_session(ws_stream, &handler, &mut session, heartbeat, shutdown).await;

    handler.disconnect(&session).await;
    log::info!("Connection closed from {addr}");
    result
}

async fn run_session(
    ws_stream: WebSocketStream<TcpStream>,
    handler: &RelayHandler,
    session: &mut Session,
    heartbeat_every: Duration,
    shutdown: CancellationToken,
) -> Result<(), RelayError> {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let mut fanout: Option<broadcast::Receiver<Arc<Vec<u8>>>> = None;
    let mut heartbeat: Option<Interval> = None;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = ws_sender.send(Message::Close(None)).await;
                return Ok(());
            }

            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        let frame = match Frame::decode(&bytes) {
                            Ok(frame) => frame,
                            Err(e) => {
                                log::warn!("Malformed frame on connection {}: {e}", session.connection_id);
                                ws_sender.send(close_message(CLOSE_BAD_REQUEST, "Bad Request")).await?;
                                return Ok(());
                            }
                        };
                        log::trace!("{:?} frame on connection {}", frame.kind(), session.connection_id);

                        for action in handler.handle(session, frame).await {
                            match action {
                                SessionAction::Reply(frame) => {
                                    ws_sender.send(Message::Binary(frame.encode().into())).await?;
                                }
                                SessionAction::Attach(receiver) => fanout = Some(receiver),
                                SessionAction::StartHeartbeat => {
                                    let mut ticks = interval_at(Instant::now() + heartbeat_every, heartbeat_every);
                                    ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
                                    heartbeat = Some(ticks);
                                }
                                SessionAction::Close { code, reason } => {
                                    ws_sender.send(close_message(code, reason)).await?;
                                    return Ok(());
                                }
                            }
                        }
                    }

                    Some(Ok(Message::Close(_))) | None => return Ok(()),

                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }

                    Some(Err(e)) => return Err(e.into()),

                    _ => {}
                }
            }

            // Frames fanned out to this document
            msg = async {
                if let Some(ref mut rx) = fanout {
                    rx.recv().await
                } else {
                    std::future::pending().await
                }
            } => {
                match msg {
                    Ok(data) => {
                        ws_sender.send(Message::Binary(data.as_ref().clone().into())).await?;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Connection {} lagged by {n} frames", session.connection_id);
                    }
                    Err(broadcast::error::RecvError::Closed) => fanout = None,
                }
            }

            _ = async {
                if let Some(ref mut ticks) = heartbeat {
                    ticks.tick().await
                } else {
                    std::future::pending().await
                }
            } => {
                let beat = Frame::Heartbeat(Utc::now().to_rfc3339());
                ws_sender.send(Message::Binary(beat.encode().into())).await?;
            }
        }
    }
}

fn close_message(code: u16, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: reason.into(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBus;

    #[test]
    fn test_relay_config_default() {
        let config = RelayConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(config.token_ttl, Duration::from_secs(60));
    }

    #[test]
    fn test_close_message_carries_code() {
        let Message::Close(Some(frame)) = close_message(3401, "Unauthorized") else {
            panic!("expected close frame");
        };
        assert_eq!(u16::from(frame.code), 3401);
        assert_eq!(frame.reason.as_str(), "Unauthorized");
    }

    #[tokio::test]
    async fn test_forward_bus_routes_by_document() {
        let bus = LocalBus::new(16);
        let registry = Arc::new(SessionRegistry::new(16));
        let doc = uuid::Uuid::new_v4();
        let mut rx = registry.register(doc, uuid::Uuid::new_v4(), uuid::Uuid::new_v4()).await;

        let forwarder = tokio::spawn(forward_bus(bus.subscribe(RELAY_TOPIC).await, registry.clone()));
        bus.publish(RELAY_TOPIC, vec![0xFF]).await;
        bus.publish(RELAY_TOPIC, BusEnvelope::new(doc, Frame::Awareness(vec![9])).encode())
            .await;

        let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(Frame::decode(&frame).unwrap(), Frame::Awareness(vec![9]));
        forwarder.abort();
    }
}
