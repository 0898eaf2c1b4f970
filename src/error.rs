//! Error types for tdl.
//!
//! All errors are strongly typed using thiserror. Each layer owns its enum
//! (`ConfigError`, `StorageError`, `SessionError`, `ClientError`) and
//! `TdlError` ties them together for the command shell, which alone decides
//! how much of the chain to show.

use thiserror::Error;

use crate::session::SessionError;
use crate::storage::{ConfigError, DriverKind, StorageError};

/// Top-level error type for tdl.
#[derive(Debug, Error)]
pub enum TdlError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("migration from {from} to {to} failed: {source}")]
    Migration {
        from: DriverKind,
        to: DriverKind,
        #[source]
        source: Box<TdlError>,
    },

    #[error("{0}")]
    Session(#[from] SessionError),

    /// A primary failure plus a failure while cleaning up after it.
    #[error("{primary}; additionally: {secondary}")]
    Aggregate {
        primary: Box<TdlError>,
        secondary: Box<TdlError>,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl TdlError {
    /// Wraps an I/O error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Wraps a failure of the driver migration path.
    pub fn migration(from: DriverKind, to: DriverKind, source: impl Into<TdlError>) -> Self {
        Self::Migration {
            from,
            to,
            source: Box::new(source.into()),
        }
    }

    /// Returns true if this is a configuration error.
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Returns true if this is a migration error.
    #[must_use]
    pub const fn is_migration(&self) -> bool {
        matches!(self, Self::Migration { .. })
    }

    /// Returns true if the shared cancellation context caused this error.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Storage(e) => e.is_cancelled(),
            Self::Session(e) => e.is_cancelled(),
            Self::Migration { source, .. } => source.is_cancelled(),
            Self::Aggregate { primary, .. } => primary.is_cancelled(),
            Self::Config(_) | Self::Io { .. } => false,
        }
    }

    /// Returns true if retrying the same invocation later can succeed.
    ///
    /// Migration never mutates its source, and authentication failures
    /// never leave partial credentials behind.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Config(_) => false,
            Self::Storage(e) => matches!(e, StorageError::Locked(_) | StorageError::Cancelled),
            Self::Migration { .. } => true,
            Self::Session(e) => e.is_retryable(),
            Self::Aggregate { primary, .. } => primary.is_retryable(),
            Self::Io { .. } => false,
        }
    }
}

/// Merges a primary result with a cleanup result.
///
/// The cleanup error is never dropped: it becomes the error if the primary
/// succeeded, or is attached to the primary error otherwise.
pub fn join<T, C>(primary: Result<T, TdlError>, cleanup: Result<(), C>) -> Result<T, TdlError>
where
    C: Into<TdlError>,
{
    match (primary, cleanup) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(secondary)) => Err(secondary.into()),
        (Err(primary), Ok(())) => Err(primary),
        (Err(primary), Err(secondary)) => Err(TdlError::Aggregate {
            primary: Box::new(primary),
            secondary: Box::new(secondary.into()),
        }),
    }
}

/// Result type alias for tdl operations.
pub type TdlResult<T> = Result<T, TdlError>;
