//! Persistent link to the console's push endpoint.
//!
//! Provides:
//! - `Link` - Connection lifecycle manager with backoff reconnection
//! - `ChannelRegistry` - Join/leave membership per execution/session channel
//! - `Connector`/`TransportSession` - Pluggable transport seam
//! - `WsConnector` - WebSocket transport (feature: websocket)

pub mod auth;
pub mod channels;
pub mod connection;
pub mod transport;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use auth::{AuthError, StaticToken, TokenProvider};
pub use channels::MembershipState;
pub use connection::{ConnectionState, Link, LinkConfig, LinkError};
pub use transport::{Connector, TransportError, TransportSession};

#[cfg(feature = "websocket")]
pub use websocket::WsConnector;
