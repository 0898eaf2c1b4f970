//! Embedded sorted store (the `sorted` driver).
//!
//! This module provides durable, crash-safe storage with:
//! - Write-Ahead Logging (WAL) for crash recovery
//! - File locking for single-process access
//! - CRC32 checksums for corruption detection
//! - Snapshot segments so the WAL stays small
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        SortedDriver                           │
//! ├──────────────────────────────────────────────────────────────┤
//! │         BTreeMap<namespace, BTreeMap<key, value>>             │
//! │  ┌─────────────────┐  ┌─────────────────┐                    │
//! │  │ Wal             │  │ Segments        │                    │
//! │  │ (append-only)   │  │ (snapshots)     │                    │
//! │  └────────┬────────┘  └────────┬────────┘                    │
//! │           └──────────┬─────────┘                             │
//! │                      ↓                                       │
//! │           ┌─────────────────────┐                            │
//! │           │   FileLock (flock)  │                            │
//! │           └─────────────────────┘                            │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod segment;
mod store;
mod wal;

pub use segment::{Segment, SegmentData, SegmentMeta, Segments};
pub use store::{SortedDriver, SortedNamespace};
pub use wal::{Op, Record, Wal};

/// WAL file name inside the store directory.
pub const WAL_FILE: &str = "kv.wal";
/// Segment directory name inside the store directory.
pub const SEGMENTS_DIR: &str = "segments";
