//! WebSocket transport for the console's push endpoint.

use async_trait::async_trait;
use exec_console_events::{ClientCommand, ServerEvent};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::protocol::Message;

use crate::transport::{Connector, TransportError, TransportSession};

/// Connects to the console over WebSocket.
///
/// Commands are JSON-encoded text frames; events are decoded from text
/// frames, with unparseable frames skipped.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl WsConnector {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(
        &self,
        url: &str,
        bearer_token: &str,
    ) -> Result<TransportSession, TransportError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| TransportError::Negotiation(format!("invalid endpoint: {e}")))?;
        let header = HeaderValue::from_str(&format!("Bearer {bearer_token}"))
            .map_err(|e| TransportError::Negotiation(format!("invalid bearer token: {e}")))?;
        request.headers_mut().insert(AUTHORIZATION, header);

        let (socket, _response) = connect_async(request)
            .await
            .map_err(|e| TransportError::Negotiation(e.to_string()))?;
        let (mut sink, mut stream) = socket.split();

        let (command_tx, mut command_rx) = mpsc::unbounded_channel::<ClientCommand>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        // Writer: drains queued commands into the socket. Ends when the
        // link drops the command sender or the socket rejects a write.
        tokio::spawn(async move {
            while let Some(cmd) = command_rx.recv().await {
                let json = match serde_json::to_string(&cmd) {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to serialize command");
                        continue;
                    }
                };
                if sink.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // Reader: decodes inbound frames into server events.
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<ServerEvent>(text.as_str()) {
                            Ok(event) => {
                                if event_tx.send(Ok(event)).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "skipping unparseable frame");
                            }
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        let _ = event_tx.send(Err(TransportError::ConnectionLost(e.to_string())));
                        break;
                    }
                }
            }
        });

        Ok(TransportSession {
            commands: command_tx,
            events: event_rx,
        })
    }
}
