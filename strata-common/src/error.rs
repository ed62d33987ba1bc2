//! Error types shared across the workspace.
//!
//! Write paths treat the structured tier as the source of truth and surface
//! its failures directly; the other tiers degrade, so their failures are
//! classified as recoverable and handled at the call site.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// A storage tier cannot be reached or refused the operation.
    #[error("tier '{tier}' unavailable: {reason}")]
    TierUnavailable { tier: String, reason: String },

    /// Input rejected before any write happened.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A write disagrees with already-stored state (same id, different content).
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Wrap an error with additional context.
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Error::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    pub fn unavailable(tier: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::TierUnavailable {
            tier: tier.into(),
            reason: reason.to_string(),
        }
    }

    /// True when the failure is transient and a read path may fall back to
    /// another tier instead of propagating.
    pub fn is_unavailable(&self) -> bool {
        match self {
            Error::TierUnavailable { .. } | Error::Timeout(_) => true,
            Error::WithContext { source, .. } => source.is_unavailable(),
            _ => false,
        }
    }
}

/// Extension trait for converting errors with context.
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_context(context))
    }
}
