//! Event model for the execution console's real-time client.
//!
//! This crate provides the fundamental building blocks:
//! - `ServerEvent` / `ClientCommand` - Wire protocol over the push channel
//! - `RunStatus` - Execution lifecycle taxonomy
//! - `ChannelLog` - Replay/live reconciliation per channel
//! - `EventDispatcher` - Typed subscription registry with ordered fan-out

pub mod dispatch;
pub mod log;
pub mod protocol;
pub mod status;

pub use dispatch::{EventDispatcher, Subscription};
pub use log::{ChannelLog, LogEntry, LogOrigin, LogStream};
pub use protocol::{ChannelId, ClientCommand, EventKind, ReplayEntry, ServerEvent};
pub use status::RunStatus;
