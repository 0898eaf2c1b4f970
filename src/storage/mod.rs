//! Namespaced key-value storage.
//!
//! A [`Driver`] implements one backend technology; the [`Engine`] owns exactly
//! one driver for the lifetime of the process and hands out
//! [`NamespaceHandle`]s. [`Snapshot`] is the driver-independent form used to
//! move data between drivers.

mod codec;
mod config;
mod engine;
mod file_lock;
mod legacy;
mod memory;
pub mod persistent;
mod snapshot;
mod traits;

pub use config::{ConfigError, DriverKind, LegacyConfig, SortedConfig, StorageConfig};
pub use engine::{validate_namespace, Engine, NamespaceHandle, DEFAULT_NAMESPACE};
pub use file_lock::FileLock;
pub use legacy::{LegacyDriver, LegacyNamespace};
pub use memory::{MemoryDriver, MemoryNamespace};
pub use persistent::{SortedDriver, SortedNamespace};
pub use snapshot::{Entries, Snapshot};
pub use traits::{Driver, Namespace, StorageError};
