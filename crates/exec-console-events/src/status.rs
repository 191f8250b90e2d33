//! Execution lifecycle taxonomy.

use serde::{Deserialize, Serialize};

/// Lifecycle status of an execution or interactive session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Queued but not yet started.
    Pending,
    /// Currently running.
    Running,
    /// Completed successfully.
    Completed,
    /// Failed.
    Failed,
    /// Cancelled by an operator.
    Cancelled,
    /// Exceeded its deadline.
    TimedOut,
}

impl RunStatus {
    /// Whether no further transition can occur from this status.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }
}
