//! Wire protocol for the console's persistent push channel.

use serde::{Deserialize, Serialize};

use crate::log::LogStream;
use crate::status::RunStatus;

/// Identifier of a logical channel (an execution or interactive session id).
pub type ChannelId = String;

/// Command from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    /// Join a channel to receive its replay and live events.
    Join { channel_id: ChannelId },
    /// Leave a previously joined channel.
    Leave { channel_id: ChannelId },
}

impl ClientCommand {
    /// Channel the command addresses.
    #[must_use]
    pub fn channel_id(&self) -> &str {
        match self {
            Self::Join { channel_id } | Self::Leave { channel_id } => channel_id,
        }
    }
}

/// One historical entry inside an initial replay batch.
///
/// Replayed entries carry no display timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayEntry {
    /// Stream the entry belongs to.
    pub stream: LogStream,
    /// Entry text.
    pub text: String,
}

/// Event pushed from server to client, correlated by channel id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// One-time bounded history batch sent after a successful join.
    InitialReplay {
        channel_id: ChannelId,
        entries: Vec<ReplayEntry>,
    },
    /// Live standard-output line.
    Output {
        channel_id: ChannelId,
        text: String,
        /// Epoch milliseconds, when the server attaches one.
        timestamp: Option<i64>,
    },
    /// Live error-output line.
    Error {
        channel_id: ChannelId,
        text: String,
        timestamp: Option<i64>,
    },
    /// The entity's lifecycle status changed.
    StatusChanged {
        channel_id: ChannelId,
        status: RunStatus,
    },
    /// The entity reached a terminal status.
    Completed {
        channel_id: ChannelId,
        status: RunStatus,
        exit_code: Option<i32>,
        error_message: Option<String>,
        /// Epoch milliseconds.
        completed_at: i64,
    },
    /// Server acknowledgment of a join.
    MembershipAck { channel_id: ChannelId },
}

impl ServerEvent {
    /// Channel the event is correlated to.
    #[must_use]
    pub fn channel_id(&self) -> &str {
        match self {
            Self::InitialReplay { channel_id, .. }
            | Self::Output { channel_id, .. }
            | Self::Error { channel_id, .. }
            | Self::StatusChanged { channel_id, .. }
            | Self::Completed { channel_id, .. }
            | Self::MembershipAck { channel_id } => channel_id,
        }
    }

    /// Fieldless discriminant, used as the dispatcher registry key.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::InitialReplay { .. } => EventKind::InitialReplay,
            Self::Output { .. } => EventKind::Output,
            Self::Error { .. } => EventKind::Error,
            Self::StatusChanged { .. } => EventKind::StatusChanged,
            Self::Completed { .. } => EventKind::Completed,
            Self::MembershipAck { .. } => EventKind::MembershipAck,
        }
    }

    /// Whether this event is live traffic, only trusted for joined channels.
    ///
    /// `MembershipAck` and `InitialReplay` are part of the join handshake
    /// and are accepted while membership is still pending.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        matches!(
            self,
            Self::Output { .. }
                | Self::Error { .. }
                | Self::StatusChanged { .. }
                | Self::Completed { .. }
        )
    }
}

/// Discriminant of [`ServerEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    InitialReplay,
    Output,
    Error,
    StatusChanged,
    Completed,
    MembershipAck,
}
