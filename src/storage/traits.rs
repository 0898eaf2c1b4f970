//! Abstract storage traits for tdl.
//!
//! A [`Driver`] is one backend technology. It hands out [`Namespace`]s, each a
//! flat key-value partition holding one account's session data. By using
//! traits, we enable:
//! - A flat-file legacy backend kept for migration
//! - A WAL + segment backend as the current default
//! - An in-memory backend for tests and dry runs

use std::sync::Arc;

use thiserror::Error;

use crate::cancel::Cancelled;
use crate::storage::config::DriverKind;
use crate::storage::snapshot::Snapshot;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Filesystem error with the operation that hit it.
    #[error("{context}: {source}")]
    Io {
        /// What the driver was doing.
        context: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Another process holds the store.
    #[error("storage at {0} is locked by another process")]
    Locked(String),

    /// Write attempted on a store opened read-only.
    #[error("storage is read-only")]
    ReadOnly,

    /// The engine or driver has been closed.
    #[error("storage is closed")]
    Closed,

    /// Namespace name rejected.
    #[error("invalid namespace name '{name}': {reason}")]
    InvalidNamespace {
        /// Offending name.
        name: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Backend error.
    #[error("Storage backend error: {0}")]
    Backend(String),

    /// The shared cancellation context fired.
    #[error("storage operation cancelled")]
    Cancelled,
}

impl StorageError {
    /// Wraps an I/O error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Returns true if the error came from the cancellation context.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<Cancelled> for StorageError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

/// A single namespace's key-value partition.
///
/// Keys are unique within a namespace; distinct namespaces never observe each
/// other's keys.
pub trait Namespace: Send + Sync {
    /// Namespace name.
    fn name(&self) -> &str;

    /// Get a value by key.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Insert or overwrite a value.
    fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Remove a key. Removing a missing key is not an error.
    fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// All keys, ascending.
    fn keys(&self) -> Result<Vec<String>, StorageError>;
}

/// A storage backend.
///
/// # Safety Considerations
/// - Repeated `open` calls for one name must reach the same underlying data
/// - Implementations must serialize access to shared files internally
/// - `close` must be idempotent
pub trait Driver: Send + Sync {
    /// Which technology this driver implements.
    fn kind(&self) -> DriverKind;

    /// Open (creating if needed) a namespace.
    fn open(&self, namespace: &str) -> Result<Arc<dyn Namespace>, StorageError>;

    /// Names of every persisted namespace, ascending.
    fn namespaces(&self) -> Result<Vec<String>, StorageError>;

    /// Snapshot every namespace into a driver-independent form.
    fn export(&self) -> Result<Snapshot, StorageError>;

    /// Apply a snapshot, creating namespaces as needed.
    fn import(&self, snapshot: &Snapshot) -> Result<(), StorageError>;

    /// Release backend resources.
    fn close(&self) -> Result<(), StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    // Compile-time test: ensure traits are object-safe
    fn _assert_driver_object_safe(_: &dyn Driver) {}
    fn _assert_namespace_object_safe(_: &dyn Namespace) {}

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::Locked("/tmp/x".to_string());
        assert!(err.to_string().contains("locked"));

        let err = StorageError::io(
            "failed to read namespace",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(err.to_string().contains("failed to read namespace"));
        assert!(err.to_string().contains("denied"));
    }

    #[test]
    fn test_cancelled_converts() {
        let err: StorageError = Cancelled.into();
        assert!(err.is_cancelled());
        assert!(!StorageError::Closed.is_cancelled());
    }
}
