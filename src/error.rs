use thiserror::Error;

use crate::tasks::model::Phase;

/// Result alias for the synchronous store / registry surface.
pub type Result<T> = std::result::Result<T, FactoryError>;

/// Error taxonomy for the task store, registry, and validation layer.
///
/// Async services (supervisor, queue, planning) use `anyhow` and fold these
/// in via `?`; the transport layer maps each variant to a response code.
#[derive(Error, Debug)]
pub enum FactoryError {
    /// Malformed frontmatter, illegal field values, criterion caps,
    /// configuration parse failures.
    #[error("validation error: {0}")]
    Validation(String),

    /// Phase transition denied. Carries a human-readable reason usable by
    /// the UI (e.g. "planning still running").
    #[error("invalid transition {from} -> {to}: {reason}")]
    InvalidTransition {
        from: Phase,
        to: Phase,
        reason: String,
    },

    /// Task, workspace, or draft id does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Filesystem failure. Best-effort recovery (rename, retry) happens
    /// inside the store before this surfaces.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Task document failed to parse or serialize.
    #[error("task document error: {0}")]
    Document(#[from] serde_yaml::Error),
}

impl FactoryError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, Self::InvalidTransition { .. })
    }
}
