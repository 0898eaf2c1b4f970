//! Storage engine: the single owner of one driver per process.
//!
//! The engine is created once at process entry and passed explicitly (as
//! `Arc<Engine>`) to every component that needs storage. On top of a bare
//! [`Driver`] it adds:
//! - namespace name validation
//! - a handle cache, so repeated opens share one underlying store
//! - cancellation checks before every operation
//! - idempotent, exactly-once close

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use regex::Regex;

use crate::cancel::Cancellation;
use crate::error::TdlError;

use super::config::{DriverKind, StorageConfig};
use super::legacy::LegacyDriver;
use super::memory::MemoryDriver;
use super::persistent::SortedDriver;
use super::snapshot::Snapshot;
use super::traits::{Driver, Namespace, StorageError};

/// Namespace used when the caller does not pick one.
pub const DEFAULT_NAMESPACE: &str = "default";

const MAX_NAMESPACE_LEN: usize = 64;

static NAMESPACE_RE: OnceLock<Regex> = OnceLock::new();

/// Rejects names that are empty, too long, hidden or not filename-safe.
pub fn validate_namespace(name: &str) -> Result<(), StorageError> {
    let invalid = |reason| StorageError::InvalidNamespace {
        name: name.to_string(),
        reason,
    };
    if name.is_empty() {
        return Err(invalid("name is empty"));
    }
    if name.len() > MAX_NAMESPACE_LEN {
        return Err(invalid("name is longer than 64 characters"));
    }
    if name.starts_with('.') {
        return Err(invalid("name must not start with '.'"));
    }
    let re = NAMESPACE_RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9._-]+$").expect("namespace regex is valid")
    });
    if !re.is_match(name) {
        return Err(invalid("only letters, digits, '.', '_' and '-' are allowed"));
    }
    Ok(())
}

/// Handle to one namespace's key-value partition.
///
/// Cheap to clone; clones share the same underlying store. Every operation
/// fails with [`StorageError::Cancelled`] once the shared context fired.
#[derive(Clone)]
pub struct NamespaceHandle {
    inner: Arc<dyn Namespace>,
    cancel: Cancellation,
}

impl std::fmt::Debug for NamespaceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamespaceHandle")
            .field("name", &self.inner.name())
            .finish()
    }
}

impl NamespaceHandle {
    /// Namespace name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Value stored under `key`, if any.
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.cancel.check()?;
        self.inner.get(key)
    }

    /// Stores `value` under `key`, replacing any previous value.
    pub fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.cancel.check()?;
        self.inner.set(key, value)
    }

    /// Removes `key`. Missing keys are not an error.
    pub fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.cancel.check()?;
        self.inner.delete(key)
    }

    /// Every key in the namespace, sorted.
    pub fn keys(&self) -> Result<Vec<String>, StorageError> {
        self.cancel.check()?;
        self.inner.keys()
    }

    /// True when both handles reach the same underlying store.
    #[must_use]
    pub fn same_store(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Process-wide owner of one storage driver.
pub struct Engine {
    driver: Box<dyn Driver>,
    config: Option<StorageConfig>,
    cancel: Cancellation,
    handles: Mutex<HashMap<String, NamespaceHandle>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("driver", &self.driver.kind())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Engine {
    /// Builds the driver selected by `config`.
    ///
    /// # Errors
    /// Backend failures while opening the store (lock held, permission
    /// denied, unreadable segment).
    pub fn create(config: &StorageConfig, cancel: Cancellation) -> Result<Self, StorageError> {
        cancel.check()?;
        let driver: Box<dyn Driver> = match config {
            StorageConfig::Legacy(c) => Box::new(LegacyDriver::open(c)?),
            StorageConfig::Sorted(c) => Box::new(SortedDriver::open(c.clone())?),
            StorageConfig::Memory => Box::new(MemoryDriver::new()),
        };
        tracing::info!(storage = %config, "storage engine created");
        let mut engine = Self::with_driver(driver, cancel);
        engine.config = Some(config.clone());
        Ok(engine)
    }

    /// Parses an option bag and builds the engine.
    ///
    /// # Errors
    /// `TdlError::Config` for unknown drivers or missing options,
    /// `TdlError::Storage` for backend failures.
    pub fn from_options(
        options: &BTreeMap<String, String>,
        cancel: Cancellation,
    ) -> Result<Self, TdlError> {
        let config = StorageConfig::from_options(options)?;
        Ok(Self::create(&config, cancel)?)
    }

    /// Wraps an already constructed driver.
    #[must_use]
    pub fn with_driver(driver: Box<dyn Driver>, cancel: Cancellation) -> Self {
        Self {
            driver,
            config: None,
            cancel,
            handles: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Driver tag; never changes after construction.
    #[must_use]
    pub fn kind(&self) -> DriverKind {
        self.driver.kind()
    }

    /// Configuration the engine was created from, if any.
    #[must_use]
    pub fn config(&self) -> Option<&StorageConfig> {
        self.config.as_ref()
    }

    /// Cancellation context shared with handles.
    #[must_use]
    pub fn cancellation(&self) -> &Cancellation {
        &self.cancel
    }

    /// True once [`close`](Self::close) ran.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        self.cancel.check()?;
        if self.is_closed() {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    /// Opens (creating if needed) a namespace.
    ///
    /// Repeated opens of one name return handles to the same store.
    pub fn open(&self, namespace: &str) -> Result<NamespaceHandle, StorageError> {
        self.ensure_open()?;
        validate_namespace(namespace)?;

        let mut handles = self
            .handles
            .lock()
            .map_err(|_| StorageError::Backend("poisoned lock: engine handles".to_string()))?;
        if let Some(handle) = handles.get(namespace) {
            return Ok(handle.clone());
        }

        let handle = NamespaceHandle {
            inner: self.driver.open(namespace)?,
            cancel: self.cancel.clone(),
        };
        handles.insert(namespace.to_string(), handle.clone());
        tracing::debug!(namespace, driver = %self.kind(), "namespace opened");
        Ok(handle)
    }

    /// Every persisted namespace name, ascending.
    pub fn namespaces(&self) -> Result<Vec<String>, StorageError> {
        self.ensure_open()?;
        self.driver.namespaces()
    }

    /// Snapshot all namespaces (MigrateTo).
    pub fn export(&self) -> Result<Snapshot, StorageError> {
        self.ensure_open()?;
        self.driver.export()
    }

    /// Apply a snapshot, creating namespaces as needed (MigrateFrom).
    pub fn import(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        self.ensure_open()?;
        for name in snapshot.namespaces().keys() {
            validate_namespace(name)?;
        }
        self.driver.import(snapshot)?;
        tracing::debug!(
            namespaces = snapshot.len(),
            keys = snapshot.key_count(),
            source = %snapshot.source,
            target = %self.kind(),
            "snapshot imported"
        );
        Ok(())
    }

    /// Releases backend resources. Only the first call reaches the driver.
    pub fn close(&self) -> Result<(), StorageError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Ok(mut handles) = self.handles.lock() {
            handles.clear();
        }
        tracing::info!(driver = %self.kind(), "storage engine closed");
        self.driver.close()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "failed to close storage engine on drop");
        }
    }
}
