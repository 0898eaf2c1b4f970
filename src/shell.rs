//! Command shell: everything that happens around a command body.
//!
//! [`Shell::start`] installs logging, runs the one-shot migration when the
//! default storage is in use, and creates the process-wide [`Engine`].
//! [`Shell::run`] hands the body a [`Context`] and then tears down through a
//! [`Teardown`] guard, so the engine is closed and the log writer flushed
//! exactly once whether the body returns, fails, panics or is interrupted.

use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing_appender::non_blocking::WorkerGuard;

use crate::cancel::Cancellation;
use crate::error::{join, TdlError, TdlResult};
use crate::logging;
use crate::migrate::{self, MigrationOutcome};
use crate::session::{Bootstrap, SessionConfig};
use crate::storage::{ConfigError, Engine, SortedConfig, StorageConfig, StorageError};

/// Environment variable overriding the data directory.
pub const HOME_ENV: &str = "TDL_HOME";

const HOME_DIR: &str = ".tdl";
const LEGACY_DIR: &str = "kv";
const DATA_DIR: &str = "data";
const LOG_DIR: &str = "log";

/// Resolves the data directory from `TDL_HOME` or the user's home.
///
/// # Errors
/// `ConfigError::Malformed` when neither is set.
pub fn resolve_home() -> Result<PathBuf, ConfigError> {
    #[cfg(windows)]
    let user_home = std::env::var_os("USERPROFILE");
    #[cfg(not(windows))]
    let user_home = std::env::var_os("HOME");
    home_from(std::env::var_os(HOME_ENV), user_home)
}

fn home_from(explicit: Option<OsString>, user_home: Option<OsString>) -> Result<PathBuf, ConfigError> {
    if let Some(dir) = explicit.filter(|d| !d.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    user_home
        .filter(|d| !d.is_empty())
        .map(|d| PathBuf::from(d).join(HOME_DIR))
        .ok_or_else(|| {
            ConfigError::Malformed(format!("cannot locate data directory: set {HOME_ENV} or HOME"))
        })
}

/// Parses durations such as `300`, `45s`, `500ms`, `5m` or `1h`.
///
/// A bare number is seconds. `0` means no limit where a timeout is expected.
///
/// # Errors
/// `ConfigError::InvalidValue` for anything else.
pub fn parse_duration(raw: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::InvalidValue {
        option: "duration".to_string(),
        value: raw.to_string(),
        reason: "expected a number with optional ms, s, m or h suffix".to_string(),
    };
    let s = raw.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let n: u64 = number.parse().map_err(|_| invalid())?;
    match unit {
        "ms" => Ok(Duration::from_millis(n)),
        "" | "s" => Ok(Duration::from_secs(n)),
        "m" => n.checked_mul(60).map(Duration::from_secs).ok_or_else(invalid),
        "h" => n.checked_mul(3600).map(Duration::from_secs).ok_or_else(invalid),
        _ => Err(invalid()),
    }
}

/// Everything the shell needs before it can create the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellSettings {
    /// Data directory holding the default stores and logs.
    pub home: PathBuf,
    /// Storage configuration chosen by the caller, if any.
    pub storage: Option<StorageConfig>,
    /// Session settings for commands that connect.
    pub session: SessionConfig,
    /// Debug logging plus a log file.
    pub verbose: bool,
}

impl ShellSettings {
    /// Settings with default storage under `home`.
    #[must_use]
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            storage: None,
            session: SessionConfig::default(),
            verbose: false,
        }
    }

    /// Legacy default store location.
    #[must_use]
    pub fn legacy_path(&self) -> PathBuf {
        self.home.join(LEGACY_DIR)
    }

    /// Current default store location.
    #[must_use]
    pub fn data_path(&self) -> PathBuf {
        self.home.join(DATA_DIR)
    }

    /// Directory for the rolling debug log.
    #[must_use]
    pub fn log_dir(&self) -> PathBuf {
        self.home.join(LOG_DIR)
    }

    /// True when the caller picked the storage configuration.
    #[must_use]
    pub fn is_explicit(&self) -> bool {
        self.storage.is_some()
    }

    /// The configuration the engine will be created from.
    #[must_use]
    pub fn storage_config(&self) -> StorageConfig {
        self.storage
            .clone()
            .unwrap_or_else(|| StorageConfig::Sorted(SortedConfig::new(self.data_path())))
    }

    /// Checks session settings and any explicit storage options.
    ///
    /// # Errors
    /// Invalid session settings or storage options.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(StorageConfig::Sorted(config)) = &self.storage {
            config.clone().validate()?;
        }
        self.session.validate()
    }
}

/// What a command body gets to work with.
#[derive(Debug, Clone)]
pub struct Context {
    /// The process-wide storage engine.
    pub engine: Arc<Engine>,
    /// Shared cancellation context.
    pub cancel: Cancellation,
    /// Session settings from the command line.
    pub session: SessionConfig,
}

impl Context {
    /// Bootstrap preconfigured with this invocation's session settings.
    #[must_use]
    pub fn bootstrap(&self) -> Bootstrap<'_> {
        Bootstrap::new(&self.engine, &self.cancel).config(self.session.clone())
    }
}

/// Closes the engine and flushes logs exactly once.
///
/// [`finish`](Self::finish) is the normal path and reports close errors;
/// `Drop` covers panics and only logs them.
pub struct Teardown {
    engine: Option<Arc<Engine>>,
    log_guard: Option<WorkerGuard>,
}

impl Teardown {
    /// Guards `engine` and the optional log writer.
    #[must_use]
    pub fn new(engine: Arc<Engine>, log_guard: Option<WorkerGuard>) -> Self {
        Self {
            engine: Some(engine),
            log_guard,
        }
    }

    fn close(&mut self) -> Result<(), StorageError> {
        let result = match self.engine.take() {
            Some(engine) => engine.close(),
            None => Ok(()),
        };
        if let Err(e) = &result {
            tracing::error!(error = %e, "failed to close storage");
        }
        // Flush after the last event above.
        self.log_guard.take();
        result
    }

    /// Tears down and merges any close error into `result`.
    ///
    /// # Errors
    /// The body's error, the close error, or both as `TdlError::Aggregate`.
    pub fn finish<T>(mut self, result: TdlResult<T>) -> TdlResult<T> {
        let closed = self.close();
        join(result, closed)
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        if self.engine.is_some() {
            tracing::warn!("command did not finish, closing storage");
        }
        let _ = self.close();
    }
}

/// A started shell, ready to run one command.
pub struct Shell {
    engine: Arc<Engine>,
    cancel: Cancellation,
    session: SessionConfig,
    migration: MigrationOutcome,
    log_guard: Option<WorkerGuard>,
}

impl std::fmt::Debug for Shell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shell")
            .field("engine", &self.engine)
            .field("migration", &self.migration)
            .finish_non_exhaustive()
    }
}

impl Shell {
    /// Installs logging, migrates if needed and creates the engine.
    ///
    /// # Errors
    /// Configuration errors, a failed migration, or engine creation errors.
    pub fn start(settings: ShellSettings, cancel: Cancellation) -> TdlResult<Self> {
        let log_dir = settings.log_dir();
        let log_guard = logging::init(settings.verbose, Some(&log_dir))?;
        Self::start_with_logger(settings, cancel, log_guard)
    }

    /// Like [`start`](Self::start) but with logging already set up.
    ///
    /// # Errors
    /// Same as [`start`](Self::start).
    pub fn start_with_logger(
        settings: ShellSettings,
        cancel: Cancellation,
        log_guard: Option<WorkerGuard>,
    ) -> TdlResult<Self> {
        settings.validate()?;

        let migration = migrate::auto_migrate(
            settings.is_explicit(),
            &settings.legacy_path(),
            &SortedConfig::new(settings.data_path()),
            &cancel,
        )?;

        let config = settings.storage_config();
        ensure_parent(&config)?;
        let engine = Engine::create(&config, cancel.clone())?;

        Ok(Self {
            engine: Arc::new(engine),
            cancel,
            session: settings.session,
            migration,
            log_guard,
        })
    }

    /// What the startup migration did.
    #[must_use]
    pub fn migration(&self) -> MigrationOutcome {
        self.migration
    }

    /// The engine every command runs against.
    #[must_use]
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Runs `body`, then closes the engine and flushes logs.
    ///
    /// # Errors
    /// The body's error merged with any close error.
    pub fn run<T, F>(self, body: F) -> TdlResult<T>
    where
        F: FnOnce(&Context) -> TdlResult<T>,
    {
        let context = Context {
            engine: Arc::clone(&self.engine),
            cancel: self.cancel.clone(),
            session: self.session.clone(),
        };
        let teardown = Teardown::new(self.engine, self.log_guard);
        let result = body(&context);
        drop(context);
        teardown.finish(result)
    }
}

fn ensure_parent(config: &StorageConfig) -> TdlResult<()> {
    if let StorageConfig::Sorted(sorted) = config {
        if let Some(parent) = sorted.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                TdlError::io(format!("failed to create {}", parent.display()), e)
            })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_home_resolution() {
        assert_eq!(
            home_from(Some("/srv/tdl".into()), Some("/home/u".into())).unwrap(),
            PathBuf::from("/srv/tdl")
        );
        assert_eq!(
            home_from(None, Some("/home/u".into())).unwrap(),
            PathBuf::from("/home/u").join(".tdl")
        );
        assert_eq!(
            home_from(Some("".into()), Some("/home/u".into())).unwrap(),
            PathBuf::from("/home/u").join(".tdl")
        );
        assert!(home_from(None, None).is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_duration("45s").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("5d").is_err());
        assert!(parse_duration("m").is_err());
    }

    #[test]
    fn test_settings_paths() {
        let settings = ShellSettings::new("/x");
        assert_eq!(settings.legacy_path(), PathBuf::from("/x/kv"));
        assert_eq!(settings.data_path(), PathBuf::from("/x/data"));
        assert_eq!(settings.log_dir(), PathBuf::from("/x/log"));
        assert!(!settings.is_explicit());
        assert_eq!(settings.storage_config(), StorageConfig::sorted("/x/data"));
    }

    #[test]
    fn test_run_closes_engine_once() {
        let dir = tempdir().unwrap();
        let shell = Shell::start_with_logger(ShellSettings::new(dir.path()), Cancellation::new(), None)
            .unwrap();
        let engine = Arc::clone(shell.engine());
        let value = shell
            .run(|ctx| {
                ctx.engine.open("default")?.set("k", b"v")?;
                Ok(7)
            })
            .unwrap();
        assert_eq!(value, 7);
        assert!(engine.is_closed());
    }

    #[test]
    fn test_run_propagates_body_error_and_still_closes() {
        let dir = tempdir().unwrap();
        let shell = Shell::start_with_logger(ShellSettings::new(dir.path()), Cancellation::new(), None)
            .unwrap();
        let engine = Arc::clone(shell.engine());
        let err = shell
            .run(|_| -> TdlResult<()> { Err(StorageError::ReadOnly.into()) })
            .unwrap_err();
        assert!(matches!(err, TdlError::Storage(StorageError::ReadOnly)));
        assert!(engine.is_closed());
    }

    #[test]
    fn test_panicking_body_still_closes() {
        let dir = tempdir().unwrap();
        let shell = Shell::start_with_logger(ShellSettings::new(dir.path()), Cancellation::new(), None)
            .unwrap();
        let engine = Arc::clone(shell.engine());
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            shell.run(|_| -> TdlResult<()> { panic!("boom") })
        }));
        assert!(outcome.is_err());
        assert!(engine.is_closed());
    }

    #[test]
    fn test_invalid_session_settings_fail_startup() {
        let dir = tempdir().unwrap();
        let mut settings = ShellSettings::new(dir.path());
        settings.session.namespace = ".bad".to_string();
        let err = Shell::start_with_logger(settings, Cancellation::new(), None).unwrap_err();
        assert!(err.is_config());
    }
}
