//! In-memory storage backend.
//!
//! This module provides a thread-safe in-memory implementation of the storage
//! traits. It is intended for tests, dry runs and as a reference
//! implementation of the driver contract.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use super::config::DriverKind;
use super::snapshot::{Entries, Snapshot};
use super::traits::{Driver, Namespace, StorageError};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::Backend(format!("poisoned lock: {context}"))
}

#[derive(Debug, Default)]
struct Shared {
    namespaces: RwLock<BTreeMap<String, Entries>>,
    closed: AtomicBool,
}

impl Shared {
    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }
}

/// Driver keeping every namespace in process memory.
#[derive(Debug, Default)]
pub struct MemoryDriver {
    shared: Arc<Shared>,
}

impl MemoryDriver {
    /// Creates an empty driver.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// Namespace view into a [`MemoryDriver`].
#[derive(Debug)]
pub struct MemoryNamespace {
    name: String,
    shared: Arc<Shared>,
}

impl Namespace for MemoryNamespace {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.shared.ensure_open()?;
        let guard = self
            .shared
            .namespaces
            .read()
            .map_err(|_| lock_err("memory namespaces"))?;
        Ok(guard.get(&self.name).and_then(|e| e.get(key)).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.shared.ensure_open()?;
        let mut guard = self
            .shared
            .namespaces
            .write()
            .map_err(|_| lock_err("memory namespaces"))?;
        guard
            .entry(self.name.clone())
            .or_default()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.shared.ensure_open()?;
        let mut guard = self
            .shared
            .namespaces
            .write()
            .map_err(|_| lock_err("memory namespaces"))?;
        if let Some(entries) = guard.get_mut(&self.name) {
            entries.remove(key);
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        self.shared.ensure_open()?;
        let guard = self
            .shared
            .namespaces
            .read()
            .map_err(|_| lock_err("memory namespaces"))?;
        Ok(guard
            .get(&self.name)
            .map(|e| e.keys().cloned().collect())
            .unwrap_or_default())
    }
}

impl Driver for MemoryDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Memory
    }

    fn open(&self, namespace: &str) -> Result<Arc<dyn Namespace>, StorageError> {
        self.shared.ensure_open()?;
        self.shared
            .namespaces
            .write()
            .map_err(|_| lock_err("memory namespaces"))?
            .entry(namespace.to_string())
            .or_default();
        Ok(Arc::new(MemoryNamespace {
            name: namespace.to_string(),
            shared: Arc::clone(&self.shared),
        }))
    }

    fn namespaces(&self) -> Result<Vec<String>, StorageError> {
        self.shared.ensure_open()?;
        let guard = self
            .shared
            .namespaces
            .read()
            .map_err(|_| lock_err("memory namespaces"))?;
        Ok(guard.keys().cloned().collect())
    }

    fn export(&self) -> Result<Snapshot, StorageError> {
        self.shared.ensure_open()?;
        let guard = self
            .shared
            .namespaces
            .read()
            .map_err(|_| lock_err("memory namespaces"))?;
        let mut snapshot = Snapshot::new(DriverKind::Memory);
        for (name, entries) in guard.iter() {
            snapshot.insert_namespace(name.clone(), entries.clone());
        }
        Ok(snapshot)
    }

    fn import(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        self.shared.ensure_open()?;
        let mut guard = self
            .shared
            .namespaces
            .write()
            .map_err(|_| lock_err("memory namespaces"))?;
        for (name, entries) in snapshot.namespaces() {
            let target = guard.entry(name.clone()).or_default();
            for (key, value) in entries {
                target.insert(key.clone(), value.clone());
            }
        }
        Ok(())
    }

    fn close(&self) -> Result<(), StorageError> {
        self.shared.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
