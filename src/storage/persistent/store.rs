//! Sorted key-value store on top of the WAL and segments.
//!
//! The whole dataset lives in an in-memory `BTreeMap` of namespaces. Every
//! mutation is appended to the WAL first and applied to the map second,
//! both under the state write lock, so the log order always matches the
//! in-memory order. Once the WAL grows past the configured size the map is
//! written out as a new segment and the WAL is truncated.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockWriteGuard};

use crate::storage::config::{DriverKind, SortedConfig};
use crate::storage::file_lock::FileLock;
use crate::storage::snapshot::{Entries, Snapshot};
use crate::storage::traits::{Driver, Namespace, StorageError};

use super::segment::{SegmentData, Segments};
use super::wal::{Op, Wal};
use super::{SEGMENTS_DIR, WAL_FILE};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::Backend(format!("poisoned lock: {context}"))
}

fn apply(state: &mut SegmentData, op: &Op) {
    match op {
        Op::Create { namespace } => {
            state.entry(namespace.clone()).or_default();
        }
        Op::Put {
            namespace,
            key,
            value,
        } => {
            state
                .entry(namespace.clone())
                .or_default()
                .insert(key.clone(), value.clone());
        }
        Op::Delete { namespace, key } => {
            if let Some(entries) = state.get_mut(namespace) {
                entries.remove(key);
            }
        }
        Op::Import { namespace, entries } => {
            let target = state.entry(namespace.clone()).or_default();
            for (key, value) in entries {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

struct Shared {
    dir: PathBuf,
    config: SortedConfig,
    state: RwLock<SegmentData>,
    wal: Wal,
    segments: Mutex<Segments>,
    lock: Mutex<Option<FileLock>>,
    closed: AtomicBool,
}

impl Shared {
    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    fn write_state(&self) -> Result<RwLockWriteGuard<'_, SegmentData>, StorageError> {
        self.ensure_open()?;
        self.state.write().map_err(|_| lock_err("sorted state"))
    }

    /// Logs then applies one mutation. Caller holds the state write lock.
    ///
    /// The mutation is committed once the WAL append succeeds. A failed
    /// compaction afterwards is logged and retried on the next write; the
    /// WAL still holds every record, so nothing is lost.
    fn commit(&self, state: &mut SegmentData, op: Op) -> Result<(), StorageError> {
        self.wal
            .append(op.clone())
            .map_err(|e| StorageError::io("failed to append to WAL", e))?;
        apply(state, &op);
        if let Err(e) = self.maybe_compact(state) {
            tracing::warn!(error = %e, "compaction failed, keeping WAL");
        }
        Ok(())
    }

    fn maybe_compact(&self, state: &SegmentData) -> Result<(), StorageError> {
        let size = self
            .wal
            .len()
            .map_err(|e| StorageError::io("failed to stat WAL", e))?;
        if size <= self.config.max_wal_size {
            return Ok(());
        }
        self.compact(state)
    }

    fn compact(&self, state: &SegmentData) -> Result<(), StorageError> {
        let mut segments = self.segments.lock().map_err(|_| lock_err("sorted segments"))?;
        let segment = segments
            .write(state)
            .map_err(|e| StorageError::io("failed to write segment", e))?;
        tracing::debug!(
            path = %segment.path().display(),
            namespaces = segment.meta().namespaces,
            keys = segment.meta().keys,
            "compacted WAL into segment"
        );
        self.wal
            .truncate()
            .map_err(|e| StorageError::io("failed to truncate WAL", e))
    }
}

/// Namespace view into a [`SortedDriver`].
pub struct SortedNamespace {
    name: String,
    shared: Arc<Shared>,
}

impl Namespace for SortedNamespace {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.shared.ensure_open()?;
        let state = self.shared.state.read().map_err(|_| lock_err("sorted state"))?;
        Ok(state.get(&self.name).and_then(|e| e.get(key)).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let mut state = self.shared.write_state()?;
        self.shared.commit(
            &mut state,
            Op::Put {
                namespace: self.name.clone(),
                key: key.to_string(),
                value: value.to_vec(),
            },
        )
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut state = self.shared.write_state()?;
        let present = state.get(&self.name).map_or(false, |e| e.contains_key(key));
        if !present {
            return Ok(());
        }
        self.shared.commit(
            &mut state,
            Op::Delete {
                namespace: self.name.clone(),
                key: key.to_string(),
            },
        )
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        self.shared.ensure_open()?;
        let state = self.shared.state.read().map_err(|_| lock_err("sorted state"))?;
        Ok(state
            .get(&self.name)
            .map(|e| e.keys().cloned().collect())
            .unwrap_or_default())
    }
}

/// WAL + segment driver. The current default.
pub struct SortedDriver {
    shared: Arc<Shared>,
}

impl SortedDriver {
    /// Open or create a store directory.
    ///
    /// # Errors
    /// - If the path cannot be created or accessed
    /// - If another process holds the lock
    /// - If the newest segment is unreadable
    pub fn open(config: SortedConfig) -> Result<Self, StorageError> {
        let dir = config.path.clone();
        std::fs::create_dir_all(&dir)
            .map_err(|e| StorageError::io(format!("failed to create {}", dir.display()), e))?;

        let lock = FileLock::acquire_store(&dir)?;

        let segments = Segments::open(&dir.join(SEGMENTS_DIR))
            .map_err(|e| StorageError::io("failed to open segments", e))?;
        let mut state = segments
            .load_latest()
            .map_err(|e| StorageError::io("failed to load segment", e))?;

        let (wal, replay) = Wal::open(&dir.join(WAL_FILE), config.sync_on_write)
            .map_err(|e| StorageError::io("failed to open WAL", e))?;
        let replayed = replay.len();
        for record in &replay {
            apply(&mut state, &record.op);
        }

        tracing::debug!(
            path = %dir.display(),
            namespaces = state.len(),
            replayed,
            "opened sorted store"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                dir,
                config,
                state: RwLock::new(state),
                wal,
                segments: Mutex::new(segments),
                lock: Mutex::new(Some(lock)),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Store directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.shared.dir
    }

    /// Force the current state into a segment and empty the WAL.
    pub fn checkpoint(&self) -> Result<(), StorageError> {
        let state = self.shared.write_state()?;
        self.shared.compact(&state)
    }
}

impl Driver for SortedDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Sorted
    }

    fn open(&self, namespace: &str) -> Result<Arc<dyn Namespace>, StorageError> {
        let mut state = self.shared.write_state()?;
        if !state.contains_key(namespace) {
            self.shared.commit(
                &mut state,
                Op::Create {
                    namespace: namespace.to_string(),
                },
            )?;
        }
        Ok(Arc::new(SortedNamespace {
            name: namespace.to_string(),
            shared: Arc::clone(&self.shared),
        }))
    }

    fn namespaces(&self) -> Result<Vec<String>, StorageError> {
        self.shared.ensure_open()?;
        let state = self.shared.state.read().map_err(|_| lock_err("sorted state"))?;
        Ok(state.keys().cloned().collect())
    }

    fn export(&self) -> Result<Snapshot, StorageError> {
        self.shared.ensure_open()?;
        let state = self.shared.state.read().map_err(|_| lock_err("sorted state"))?;
        let mut snapshot = Snapshot::new(DriverKind::Sorted);
        for (name, entries) in state.iter() {
            snapshot.insert_namespace(name.clone(), entries.clone());
        }
        Ok(snapshot)
    }

    fn import(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        let mut state = self.shared.write_state()?;
        for (name, entries) in snapshot.namespaces() {
            self.shared.commit(
                &mut state,
                Op::Import {
                    namespace: name.clone(),
                    entries: Entries::clone(entries),
                },
            )?;
        }
        Ok(())
    }

    fn close(&self) -> Result<(), StorageError> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self
            .shared
            .wal
            .close()
            .map_err(|e| StorageError::io("failed to close WAL", e));
        // Release the directory lock even if the final flush failed.
        self.shared.lock.lock().map_err(|_| lock_err("sorted lock"))?.take();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config(dir: &Path) -> SortedConfig {
        SortedConfig {
            path: dir.to_path_buf(),
            sync_on_write: false,
            max_wal_size: SortedConfig::MIN_WAL_SIZE,
        }
    }

    #[test]
    fn test_values_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let driver = SortedDriver::open(config(dir.path())).unwrap();
            let ns = driver.open("default").unwrap();
            ns.set("session", b"abc").unwrap();
            ns.set("gone", b"x").unwrap();
            ns.delete("gone").unwrap();
            driver.close().unwrap();
        }

        let driver = SortedDriver::open(config(dir.path())).unwrap();
        let ns = driver.open("default").unwrap();
        assert_eq!(ns.get("session").unwrap(), Some(b"abc".to_vec()));
        assert_eq!(ns.keys().unwrap(), vec!["session"]);
    }

    #[test]
    fn test_compaction_keeps_data() {
        let dir = tempdir().unwrap();
        {
            let driver = SortedDriver::open(config(dir.path())).unwrap();
            let ns = driver.open("work").unwrap();
            // Each put is well over 100 bytes, so the 4 KiB WAL rolls several times.
            for i in 0..200 {
                ns.set(&format!("key-{i:03}"), &[7u8; 64]).unwrap();
            }
            driver.close().unwrap();
        }

        assert!(dir.path().join(SEGMENTS_DIR).read_dir().unwrap().next().is_some());
        let driver = SortedDriver::open(config(dir.path())).unwrap();
        let ns = driver.open("work").unwrap();
        assert_eq!(ns.keys().unwrap().len(), 200);
        assert_eq!(ns.get("key-199").unwrap(), Some(vec![7u8; 64]));
    }

    #[test]
    fn test_checkpoint_empties_wal() {
        let dir = tempdir().unwrap();
        let driver = SortedDriver::open(SortedConfig::new(dir.path())).unwrap();
        driver.open("default").unwrap().set("k", b"v").unwrap();
        driver.checkpoint().unwrap();
        assert!(driver.shared.wal.is_empty().unwrap());
        driver.close().unwrap();

        let driver = SortedDriver::open(SortedConfig::new(dir.path())).unwrap();
        assert_eq!(driver.namespaces().unwrap(), vec!["default"]);
    }

    #[test]
    fn test_failed_compaction_keeps_write() {
        let dir = tempdir().unwrap();
        let segments = dir.path().join(SEGMENTS_DIR);
        {
            let driver = SortedDriver::open(config(dir.path())).unwrap();
            // Segment writes fail while a plain file sits where the directory was.
            std::fs::remove_dir_all(&segments).unwrap();
            std::fs::write(&segments, b"").unwrap();

            let ns = driver.open("default").unwrap();
            for i in 0..100 {
                ns.set(&format!("key-{i:03}"), &[1u8; 64]).unwrap();
            }
            assert_eq!(ns.keys().unwrap().len(), 100);
            assert!(!driver.shared.wal.is_empty().unwrap());
            driver.close().unwrap();
        }

        std::fs::remove_file(&segments).unwrap();
        let driver = SortedDriver::open(config(dir.path())).unwrap();
        let ns = driver.open("default").unwrap();
        assert_eq!(ns.keys().unwrap().len(), 100);
        assert_eq!(ns.get("key-099").unwrap(), Some(vec![1u8; 64]));
    }

    #[test]
    fn test_second_writer_is_locked_out() {
        let dir = tempdir().unwrap();
        let first = SortedDriver::open(config(dir.path())).unwrap();
        assert!(matches!(
            SortedDriver::open(config(dir.path())),
            Err(StorageError::Locked(_))
        ));
        first.close().unwrap();
        first.close().unwrap();
        assert!(SortedDriver::open(config(dir.path())).is_ok());
    }
}
