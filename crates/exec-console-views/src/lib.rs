//! Attached execution views over the console link.
//!
//! Provides:
//! - `ExecutionApi` - REST collaborator seam (fetches and stop)
//! - `Attachment` - Live/static mode control for one execution view

pub mod api;
pub mod attach;

pub use api::{ApiError, ExecutionApi, ExecutionResult, ExecutionSnapshot, OutputFile};
pub use attach::{AttachError, AttachOptions, Attachment, ViewMode, ViewState, attach};
