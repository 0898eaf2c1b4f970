//! Flat-file storage backend (the old default).
//!
//! Layout: one JSON document per namespace inside the store directory.
//!
//! ```text
//! <dir>/.lock            (writable mode only)
//! <dir>/default.json     {"version":1,"entries":{"session":[...]}}
//! <dir>/work.json
//! ```
//!
//! Every write rewrites the namespace file through a temp file and an atomic
//! rename, so a crash leaves either the old or the new document. Opened with
//! `read_only`, the driver never creates, locks or writes anything; the
//! migration path relies on that to keep the source store untouched.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::config::{DriverKind, LegacyConfig};
use super::engine::validate_namespace;
use super::file_lock::FileLock;
use super::snapshot::{Entries, Snapshot};
use super::traits::{Driver, Namespace, StorageError};

const FILE_VERSION: u32 = 1;
const EXTENSION: &str = "json";

fn lock_err(context: &'static str) -> StorageError {
    StorageError::Backend(format!("poisoned lock: {context}"))
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct NamespaceFile {
    version: u32,
    entries: Entries,
}

#[derive(Debug)]
struct Shared {
    dir: PathBuf,
    read_only: bool,
    closed: AtomicBool,
}

impl Shared {
    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<(), StorageError> {
        self.ensure_open()?;
        if self.read_only {
            return Err(StorageError::ReadOnly);
        }
        Ok(())
    }

    fn file_path(&self, namespace: &str) -> PathBuf {
        self.dir.join(format!("{namespace}.{EXTENSION}"))
    }
}

fn read_entries(path: &Path) -> Result<Option<Entries>, StorageError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StorageError::io(format!("failed to read {}", path.display()), e)),
    };
    let doc: NamespaceFile = serde_json::from_reader(BufReader::new(file)).map_err(|e| {
        StorageError::Serialization(format!("corrupt namespace file {}: {e}", path.display()))
    })?;
    if doc.version != FILE_VERSION {
        return Err(StorageError::Serialization(format!(
            "unsupported namespace file version {} in {}",
            doc.version,
            path.display()
        )));
    }
    Ok(Some(doc.entries))
}

fn write_entries(path: &Path, entries: &Entries) -> Result<(), StorageError> {
    let doc = NamespaceFile {
        version: FILE_VERSION,
        entries: entries.clone(),
    };
    let bytes = serde_json::to_vec(&doc).map_err(|e| StorageError::Serialization(e.to_string()))?;

    let temp_path = path.with_extension(format!("{EXTENSION}.tmp.{}", Uuid::new_v4()));
    let result = (|| -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        fs::rename(&temp_path, path)
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&temp_path);
        return Err(StorageError::io(format!("failed to write {}", path.display()), e));
    }
    Ok(())
}

/// One namespace file, cached in memory.
#[derive(Debug)]
pub struct LegacyNamespace {
    name: String,
    path: PathBuf,
    entries: Mutex<Entries>,
    shared: Arc<Shared>,
}

impl LegacyNamespace {
    fn snapshot(&self) -> Result<Entries, StorageError> {
        Ok(self.entries.lock().map_err(|_| lock_err("legacy entries"))?.clone())
    }

    fn apply(&self, updates: &Entries) -> Result<(), StorageError> {
        self.shared.ensure_writable()?;
        let mut guard = self.entries.lock().map_err(|_| lock_err("legacy entries"))?;
        let mut next = guard.clone();
        for (key, value) in updates {
            next.insert(key.clone(), value.clone());
        }
        write_entries(&self.path, &next)?;
        *guard = next;
        Ok(())
    }
}

impl Namespace for LegacyNamespace {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.shared.ensure_open()?;
        let guard = self.entries.lock().map_err(|_| lock_err("legacy entries"))?;
        Ok(guard.get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let mut update = Entries::new();
        update.insert(key.to_string(), value.to_vec());
        self.apply(&update)
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.shared.ensure_writable()?;
        let mut guard = self.entries.lock().map_err(|_| lock_err("legacy entries"))?;
        if !guard.contains_key(key) {
            return Ok(());
        }
        let mut next = guard.clone();
        next.remove(key);
        write_entries(&self.path, &next)?;
        *guard = next;
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        self.shared.ensure_open()?;
        let guard = self.entries.lock().map_err(|_| lock_err("legacy entries"))?;
        Ok(guard.keys().cloned().collect())
    }
}

/// Flat-file driver.
#[derive(Debug)]
pub struct LegacyDriver {
    shared: Arc<Shared>,
    open: Mutex<HashMap<String, Arc<LegacyNamespace>>>,
    lock: Mutex<Option<FileLock>>,
}

impl LegacyDriver {
    /// Opens the store directory.
    ///
    /// Writable stores create the directory and take the directory lock.
    /// Read-only stores require the directory to exist already.
    pub fn open(config: &LegacyConfig) -> Result<Self, StorageError> {
        let dir = config.path.clone();
        let lock = if config.read_only {
            if !dir.is_dir() {
                return Err(StorageError::io(
                    format!("legacy store {} is not a directory", dir.display()),
                    std::io::Error::from(ErrorKind::NotFound),
                ));
            }
            None
        } else {
            fs::create_dir_all(&dir).map_err(|e| {
                StorageError::io(format!("failed to create {}", dir.display()), e)
            })?;
            Some(FileLock::acquire_store(&dir)?)
        };

        tracing::debug!(path = %dir.display(), read_only = config.read_only, "opened legacy store");

        Ok(Self {
            shared: Arc::new(Shared {
                dir,
                read_only: config.read_only,
                closed: AtomicBool::new(false),
            }),
            open: Mutex::new(HashMap::new()),
            lock: Mutex::new(lock),
        })
    }

    fn namespace(&self, name: &str) -> Result<Arc<LegacyNamespace>, StorageError> {
        self.shared.ensure_open()?;
        let mut open = self.open.lock().map_err(|_| lock_err("legacy namespaces"))?;
        if let Some(ns) = open.get(name) {
            return Ok(Arc::clone(ns));
        }

        let path = self.shared.file_path(name);
        let entries = match read_entries(&path)? {
            Some(entries) => entries,
            None => {
                let entries = Entries::new();
                if !self.shared.read_only {
                    write_entries(&path, &entries)?;
                }
                entries
            }
        };

        let ns = Arc::new(LegacyNamespace {
            name: name.to_string(),
            path,
            entries: Mutex::new(entries),
            shared: Arc::clone(&self.shared),
        });
        open.insert(name.to_string(), Arc::clone(&ns));
        Ok(ns)
    }
}

impl Driver for LegacyDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Legacy
    }

    fn open(&self, namespace: &str) -> Result<Arc<dyn Namespace>, StorageError> {
        let ns: Arc<dyn Namespace> = self.namespace(namespace)?;
        Ok(ns)
    }

    fn namespaces(&self) -> Result<Vec<String>, StorageError> {
        self.shared.ensure_open()?;
        let dir = &self.shared.dir;
        let read_err = |e| StorageError::io(format!("failed to list {}", dir.display()), e);

        let mut names = Vec::new();
        for entry in fs::read_dir(dir).map_err(read_err)? {
            let path = entry.map_err(read_err)?.path();
            if path.extension().map_or(false, |e| e == EXTENSION) {
                let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                // Files no namespace could have written are left alone.
                match validate_namespace(stem) {
                    Ok(()) => names.push(stem.to_string()),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "ignoring stray file in legacy store");
                    }
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn export(&self) -> Result<Snapshot, StorageError> {
        let mut snapshot = Snapshot::new(DriverKind::Legacy);
        for name in self.namespaces()? {
            let entries = self.namespace(&name)?.snapshot()?;
            snapshot.insert_namespace(name, entries);
        }
        Ok(snapshot)
    }

    fn import(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        self.shared.ensure_writable()?;
        for (name, entries) in snapshot.namespaces() {
            self.namespace(name)?.apply(entries)?;
        }
        Ok(())
    }

    fn close(&self) -> Result<(), StorageError> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.open.lock().map_err(|_| lock_err("legacy namespaces"))?.clear();
        self.lock.lock().map_err(|_| lock_err("legacy lock"))?.take();
        Ok(())
    }
}
