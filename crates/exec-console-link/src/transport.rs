//! Transport seam between the connection manager and the wire.

use async_trait::async_trait;
use exec_console_events::{ClientCommand, ServerEvent};
use thiserror::Error;
use tokio::sync::mpsc;

/// Transport error.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One live session over the persistent connection.
///
/// Commands are enqueued without awaiting; dropping the sender tears the
/// session down. An `Err` item on `events`, or the receiver running dry,
/// signals an involuntary drop.
pub struct TransportSession {
    pub commands: mpsc::UnboundedSender<ClientCommand>,
    pub events: mpsc::UnboundedReceiver<Result<ServerEvent, TransportError>>,
}

/// Dials the console endpoint and produces transport sessions.
///
/// The seam exists so the connection state machine is exercised in tests
/// against a scripted fake instead of real network I/O.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        url: &str,
        bearer_token: &str,
    ) -> Result<TransportSession, TransportError>;
}
