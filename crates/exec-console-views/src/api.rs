//! REST collaborators consumed by attached views.
//!
//! The console backend exposes plain request/response endpoints for the
//! fields the push channel does not carry. Views depend only on this trait
//! and the minimal response shapes below; the HTTP client lives elsewhere.

use async_trait::async_trait;
use exec_console_events::{ReplayEntry, RunStatus};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Collaborator call error.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("execution not found: {0}")]
    NotFound(String),
    #[error("request failed: {0}")]
    Request(String),
}

/// Result payload of a finished execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub exit_code: Option<i32>,
    pub output: Option<String>,
    pub error: Option<String>,
}

/// Point-in-time view of one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    pub id: String,
    pub status: RunStatus,
    /// Epoch milliseconds.
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    /// Present once the execution is terminal.
    pub result: Option<ExecutionResult>,
}

/// One produced output file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputFile {
    pub name: String,
    pub size: u64,
}

/// Request/response endpoints for execution data.
#[async_trait]
pub trait ExecutionApi: Send + Sync {
    /// Fetch the current snapshot of an execution.
    async fn fetch_execution(&self, id: &str) -> Result<ExecutionSnapshot, ApiError>;

    /// Fetch a bounded log snapshot, oldest first.
    async fn fetch_log_snapshot(
        &self,
        id: &str,
        limit: usize,
    ) -> Result<Vec<ReplayEntry>, ApiError>;

    /// List the execution's output files.
    async fn fetch_output_listing(&self, id: &str) -> Result<Vec<OutputFile>, ApiError>;

    /// Request that a running execution be stopped.
    async fn stop_execution(&self, id: &str) -> Result<(), ApiError>;
}
