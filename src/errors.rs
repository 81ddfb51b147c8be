//! Error taxonomy for the orchestrator
//!
//! Typed errors are reserved for reference mistakes at the public API
//! boundary (a model or mode name that was never registered). Failures inside
//! the state machine itself are communicated as boolean returns plus a
//! per-model `error_detail`, so partial failures in batch operations stay
//! inspectable.

use std::time::Duration;

/// Errors surfaced at the orchestrator's public API boundary.
#[derive(Debug, thiserror::Error)]
pub enum GantryError {
    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("unknown mode: {0}")]
    UnknownMode(String),
}

/// Failures from calls to an inference backend.
///
/// These never cross the public boundary directly; they are rendered into a
/// model's `error_detail` field.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend unreachable: {0}")]
    Unreachable(String),

    #[error("backend call timed out after {0:?}")]
    Timeout(Duration),

    #[error("backend returned status {0}")]
    Status(u16),

    #[error("unexpected backend response: {0}")]
    InvalidResponse(String),

    #[error("operation not supported by this backend")]
    Unsupported,
}
