//! Domain error taxonomy.

use thiserror::Error;

/// Errors surfaced by tandem operations.
///
/// Cancellation is deliberately absent: an aborted run ends `idle`, it does
/// not fail.
#[derive(Debug, Error)]
pub enum TandemError {
    /// Missing or malformed request input. Nothing was created.
    #[error("invalid request: {0}")]
    Validation(String),

    /// Unknown session or permission slot. No side effects.
    #[error("{0} not found")]
    NotFound(String),

    /// A run is already active for the tracking id.
    #[error("a run is already active for {0}")]
    Conflict(String),

    /// The provider backend failed to start or run.
    #[error("provider error: {0}")]
    Provider(String),

    /// The sidecar process failed to start or listen.
    #[error("sidecar unavailable: {0}")]
    Infrastructure(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl TandemError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider(msg.into())
    }

    pub fn infrastructure(msg: impl Into<String>) -> Self {
        Self::Infrastructure(msg.into())
    }
}

pub type Result<T, E = TandemError> = std::result::Result<T, E>;
