//! Driver selection and typed driver configuration.
//!
//! Configuration arrives as a flat option bag (`driver=sorted,path=/x`) from
//! the command line or environment. [`StorageConfig::from_options`] is the
//! registry: it maps the `driver` tag to a variant and validates that
//! variant's own keys.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Option key selecting the driver.
pub const DRIVER_KEY: &str = "driver";
/// Option key for file-backed drivers.
pub const PATH_KEY: &str = "path";

/// Configuration errors, all fatal at startup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown storage driver '{0}' (expected one of: legacy, sorted, memory)")]
    UnknownDriver(String),

    #[error("storage driver '{driver}' requires option '{option}'")]
    MissingOption {
        driver: DriverKind,
        option: &'static str,
    },

    #[error("storage driver '{driver}' does not accept option '{option}'")]
    UnknownOption {
        driver: DriverKind,
        option: String,
    },

    #[error("invalid value '{value}' for option '{option}': {reason}")]
    InvalidValue {
        option: String,
        value: String,
        reason: String,
    },

    #[error("storage configuration requires option 'driver'")]
    MissingDriver,

    #[error("malformed storage option '{0}' (expected key=value)")]
    Malformed(String),
}

/// Backend technology tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// Flat files, one JSON document per namespace. Old default.
    Legacy,
    /// WAL plus snapshot segments. Current default.
    Sorted,
    /// Process-local maps.
    Memory,
}

impl DriverKind {
    /// Every known driver.
    pub const ALL: [DriverKind; 3] = [DriverKind::Legacy, DriverKind::Sorted, DriverKind::Memory];

    /// Tag as written in configuration.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Legacy => "legacy",
            Self::Sorted => "sorted",
            Self::Memory => "memory",
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DriverKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "legacy" => Ok(Self::Legacy),
            "sorted" => Ok(Self::Sorted),
            "memory" => Ok(Self::Memory),
            other => Err(ConfigError::UnknownDriver(other.to_string())),
        }
    }
}

/// Flat-file driver configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyConfig {
    /// Directory holding one file per namespace.
    pub path: PathBuf,
    /// Never create, lock or write anything.
    pub read_only: bool,
}

/// WAL + segment driver configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortedConfig {
    /// Database directory.
    pub path: PathBuf,
    /// Whether to fsync after every write (slower but safer).
    pub sync_on_write: bool,
    /// Maximum WAL size before compaction (bytes).
    pub max_wal_size: u64,
}

impl SortedConfig {
    /// 4 KiB minimum to avoid degenerate compaction loops.
    pub const MIN_WAL_SIZE: u64 = 4 * 1024;
    /// 64 MiB.
    pub const DEFAULT_WAL_SIZE: u64 = 64 * 1024 * 1024;

    /// Defaults for a directory.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            sync_on_write: true,
            max_wal_size: Self::DEFAULT_WAL_SIZE,
        }
    }

    /// Rejects a WAL limit below [`MIN_WAL_SIZE`](Self::MIN_WAL_SIZE).
    ///
    /// # Errors
    /// `ConfigError::InvalidValue` naming `max_wal_size`.
    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.max_wal_size < Self::MIN_WAL_SIZE {
            return Err(ConfigError::InvalidValue {
                option: "max_wal_size".to_string(),
                value: self.max_wal_size.to_string(),
                reason: format!("must be at least {} bytes", Self::MIN_WAL_SIZE),
            });
        }
        Ok(self)
    }
}

/// Validated storage configuration, one variant per driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageConfig {
    Legacy(LegacyConfig),
    Sorted(SortedConfig),
    Memory,
}

impl StorageConfig {
    /// Driver tag of this configuration.
    #[must_use]
    pub const fn kind(&self) -> DriverKind {
        match self {
            Self::Legacy(_) => DriverKind::Legacy,
            Self::Sorted(_) => DriverKind::Sorted,
            Self::Memory => DriverKind::Memory,
        }
    }

    /// Filesystem location, for file-backed drivers.
    #[must_use]
    pub fn path(&self) -> Option<&std::path::Path> {
        match self {
            Self::Legacy(c) => Some(&c.path),
            Self::Sorted(c) => Some(&c.path),
            Self::Memory => None,
        }
    }

    /// Writable flat-file configuration.
    pub fn legacy(path: impl Into<PathBuf>) -> Self {
        Self::Legacy(LegacyConfig {
            path: path.into(),
            read_only: false,
        })
    }

    /// Default WAL + segment configuration.
    pub fn sorted(path: impl Into<PathBuf>) -> Self {
        Self::Sorted(SortedConfig::new(path))
    }

    /// Parses the textual form `driver=sorted,path=/x`.
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        let mut options = BTreeMap::new();
        for pair in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| ConfigError::Malformed(pair.to_string()))?;
            options.insert(key.trim().to_string(), value.trim().to_string());
        }
        Self::from_options(&options)
    }

    /// Builds a typed configuration from an option bag.
    ///
    /// # Errors
    /// - `MissingDriver` if `driver` is absent
    /// - `MissingOption` if a driver's required key is absent
    /// - `UnknownDriver` for an unrecognized tag
    /// - `UnknownOption` for keys the selected driver does not define
    /// - `InvalidValue` for unparsable values
    pub fn from_options(options: &BTreeMap<String, String>) -> Result<Self, ConfigError> {
        let tag = options.get(DRIVER_KEY).ok_or(ConfigError::MissingDriver)?;
        let kind: DriverKind = tag.parse()?;

        let allowed: &[&str] = match kind {
            DriverKind::Legacy => &[DRIVER_KEY, PATH_KEY, "read_only"],
            DriverKind::Sorted => &[DRIVER_KEY, PATH_KEY, "sync", "max_wal_size"],
            DriverKind::Memory => &[DRIVER_KEY],
        };
        if let Some(extra) = options.keys().find(|k| !allowed.contains(&k.as_str())) {
            return Err(ConfigError::UnknownOption {
                driver: kind,
                option: extra.clone(),
            });
        }

        let path = || -> Result<PathBuf, ConfigError> {
            match options.get(PATH_KEY) {
                Some(p) if !p.is_empty() => Ok(PathBuf::from(p)),
                _ => Err(ConfigError::MissingOption {
                    driver: kind,
                    option: PATH_KEY,
                }),
            }
        };

        match kind {
            DriverKind::Legacy => Ok(Self::Legacy(LegacyConfig {
                path: path()?,
                read_only: parse_bool(options, "read_only")?.unwrap_or(false),
            })),
            DriverKind::Sorted => {
                let mut cfg = SortedConfig::new(path()?);
                if let Some(sync) = parse_bool(options, "sync")? {
                    cfg.sync_on_write = sync;
                }
                if let Some(raw) = options.get("max_wal_size") {
                    cfg.max_wal_size = raw.parse().map_err(|e: std::num::ParseIntError| {
                        ConfigError::InvalidValue {
                            option: "max_wal_size".to_string(),
                            value: raw.clone(),
                            reason: e.to_string(),
                        }
                    })?;
                }
                Ok(Self::Sorted(cfg.validate()?))
            }
            DriverKind::Memory => Ok(Self::Memory),
        }
    }
}

impl fmt::Display for StorageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.path() {
            Some(path) => write!(f, "driver={},path={}", self.kind(), path.display()),
            None => write!(f, "driver={}", self.kind()),
        }
    }
}

fn parse_bool(options: &BTreeMap<String, String>, key: &str) -> Result<Option<bool>, ConfigError> {
    let Some(raw) = options.get(key) else {
        return Ok(None);
    };
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(Some(true)),
        "false" | "0" | "no" => Ok(Some(false)),
        _ => Err(ConfigError::InvalidValue {
            option: key.to_string(),
            value: raw.clone(),
            reason: "expected a boolean".to_string(),
        }),
    }
}
