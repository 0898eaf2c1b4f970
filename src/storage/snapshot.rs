//! Driver-independent export format used for migration and backups.

use std::collections::BTreeMap;
use std::io::{Cursor, Read};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::codec;
use super::config::DriverKind;
use super::traits::StorageError;

/// Keys and values of one namespace, ascending by key.
pub type Entries = BTreeMap<String, Vec<u8>>;

/// Snapshot of every namespace's contents.
///
/// Importing a snapshot into a fresh engine of any driver reproduces the
/// exact namespace set and key/value pairs of the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Driver the snapshot was taken from.
    pub source: DriverKind,
    /// When the snapshot was taken.
    pub created_at: DateTime<Utc>,
    namespaces: BTreeMap<String, Entries>,
}

impl Snapshot {
    /// Empty snapshot attributed to `source`.
    #[must_use]
    pub fn new(source: DriverKind) -> Self {
        Self {
            source,
            created_at: Utc::now(),
            namespaces: BTreeMap::new(),
        }
    }

    /// Adds (or replaces) one namespace's entries.
    pub fn insert_namespace(&mut self, name: impl Into<String>, entries: Entries) {
        self.namespaces.insert(name.into(), entries);
    }

    /// Namespaces and their entries, ascending by name.
    #[must_use]
    pub fn namespaces(&self) -> &BTreeMap<String, Entries> {
        &self.namespaces
    }

    /// Number of namespaces.
    #[must_use]
    pub fn len(&self) -> usize {
        self.namespaces.len()
    }

    /// True when no namespace was captured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.namespaces.is_empty()
    }

    /// Total key count across namespaces.
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.namespaces.values().map(BTreeMap::len).sum()
    }

    /// Header-prefixed, CRC-framed bytes suitable for a backup file.
    pub fn to_bytes(&self) -> Result<Vec<u8>, StorageError> {
        let mut out = Vec::new();
        codec::write_header(&mut out)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        let body = codec::encode(self).map_err(|e| StorageError::Serialization(e.to_string()))?;
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Parses bytes produced by [`to_bytes`](Self::to_bytes).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StorageError> {
        Self::read_from(&mut Cursor::new(bytes))
    }

    /// Reads a snapshot from a stream, verifying header and checksum.
    pub fn read_from(reader: &mut impl Read) -> Result<Self, StorageError> {
        codec::read_header(reader).map_err(|e| StorageError::Serialization(e.to_string()))?;
        codec::decode(reader).map_err(|e| StorageError::Serialization(e.to_string()))
    }
}
