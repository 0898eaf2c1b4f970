//! Moving data between drivers.
//!
//! [`auto_migrate`] runs once at startup and carries an existing legacy
//! store over to the sorted driver. The new store is built in a staging
//! directory next to its final location and renamed into place only after
//! both engines closed cleanly, so an interrupted or failed migration leaves
//! no half-written store behind and never touches the legacy files.
//!
//! [`backup`], [`recover`] and [`copy_to`] are the explicit counterparts used
//! by the `backup`, `recover` and `migrate --to` commands.

use std::fs::{self, OpenOptions};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::cancel::Cancellation;
use crate::error::{join, TdlError, TdlResult};
use crate::storage::{
    DriverKind, Engine, LegacyConfig, Snapshot, SortedConfig, StorageConfig, StorageError,
};

const STAGING_MARKER: &str = ".migrating-";

/// What [`auto_migrate`] decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// The caller chose a storage configuration explicitly.
    SkippedExplicit,
    /// The new-format store already exists.
    SkippedExisting,
    /// There is no legacy store to carry over.
    SkippedFresh,
    /// Data was copied into the new store.
    Migrated {
        /// Namespaces copied.
        namespaces: usize,
        /// Keys copied across all namespaces.
        keys: usize,
    },
}

/// Copies the legacy store at `legacy_path` into a new sorted store at
/// `target.path`, unless the caller overrode storage or there is nothing
/// to do.
///
/// # Errors
/// `TdlError::Migration` wrapping the first failure. The target location is
/// left absent and the legacy store untouched, so the call can be retried.
pub fn auto_migrate(
    explicit: bool,
    legacy_path: &Path,
    target: &SortedConfig,
    cancel: &Cancellation,
) -> TdlResult<MigrationOutcome> {
    if explicit {
        tracing::debug!("storage configured explicitly, skipping migration");
        return Ok(MigrationOutcome::SkippedExplicit);
    }
    if target.path.exists() {
        tracing::debug!(path = %target.path.display(), "store exists, skipping migration");
        return Ok(MigrationOutcome::SkippedExisting);
    }
    if !legacy_path.is_dir() {
        tracing::debug!(path = %legacy_path.display(), "no legacy store, skipping migration");
        return Ok(MigrationOutcome::SkippedFresh);
    }

    tracing::info!(
        from = %legacy_path.display(),
        to = %target.path.display(),
        "migrating legacy storage"
    );

    let wrap = |e: TdlError| TdlError::migration(DriverKind::Legacy, DriverKind::Sorted, e);
    remove_stale_staging(&target.path);

    let staging = staging_path(&target.path).map_err(wrap)?;
    let result = stage(legacy_path, target, &staging, cancel).and_then(|snapshot| {
        fs::rename(&staging, &target.path).map_err(|e| {
            TdlError::io(
                format!(
                    "failed to move {} to {}",
                    staging.display(),
                    target.path.display()
                ),
                e,
            )
        })?;
        Ok(snapshot)
    });

    match result {
        Ok(snapshot) => {
            let outcome = MigrationOutcome::Migrated {
                namespaces: snapshot.len(),
                keys: snapshot.key_count(),
            };
            tracing::info!(?outcome, "migration complete");
            Ok(outcome)
        }
        Err(e) => {
            if staging.exists() {
                if let Err(cleanup) = fs::remove_dir_all(&staging) {
                    tracing::warn!(
                        path = %staging.display(),
                        error = %cleanup,
                        "failed to remove migration staging directory"
                    );
                }
            }
            Err(wrap(e))
        }
    }
}

/// Exports legacy, imports into `staging`, closes both engines.
fn stage(
    legacy_path: &Path,
    target: &SortedConfig,
    staging: &Path,
    cancel: &Cancellation,
) -> TdlResult<Snapshot> {
    let source = Engine::create(
        &StorageConfig::Legacy(LegacyConfig {
            path: legacy_path.to_path_buf(),
            read_only: true,
        }),
        cancel.clone(),
    )?;
    let staged = match Engine::create(
        &StorageConfig::Sorted(SortedConfig {
            path: staging.to_path_buf(),
            ..target.clone()
        }),
        cancel.clone(),
    ) {
        Ok(staged) => staged,
        Err(e) => return join(Err(e.into()), source.close()),
    };

    let copied = source
        .export()
        .and_then(|snapshot| staged.import(&snapshot).map(|()| snapshot))
        .map_err(TdlError::from);
    let copied = join(copied, source.close());
    join(copied, staged.close())
}

fn staging_path(target: &Path) -> TdlResult<PathBuf> {
    let name = target.file_name().ok_or_else(|| {
        TdlError::from(StorageError::Backend(format!(
            "store path {} has no file name",
            target.display()
        )))
    })?;
    let parent = target.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .map_err(|e| TdlError::io(format!("failed to create {}", parent.display()), e))?;
    Ok(parent.join(format!(
        "{}{STAGING_MARKER}{}",
        name.to_string_lossy(),
        Uuid::new_v4().simple()
    )))
}

/// Removes staging directories left by an earlier crashed migration.
fn remove_stale_staging(target: &Path) {
    let (Some(parent), Some(name)) = (target.parent(), target.file_name()) else {
        return;
    };
    let prefix = format!("{}{STAGING_MARKER}", name.to_string_lossy());
    let Ok(entries) = fs::read_dir(parent) else {
        return;
    };
    for entry in entries.flatten() {
        if entry.file_name().to_string_lossy().starts_with(&prefix) {
            let path = entry.path();
            tracing::debug!(path = %path.display(), "removing stale migration staging directory");
            if let Err(e) = fs::remove_dir_all(&path) {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove stale staging directory");
            }
        }
    }
}

/// Writes every namespace of `engine` to `file`.
///
/// The file is written through a temp file and renamed, so an existing
/// backup is only replaced by a complete one.
///
/// # Errors
/// Export failures or I/O errors writing the file.
pub fn backup(engine: &Engine, file: &Path) -> TdlResult<Snapshot> {
    let snapshot = engine.export()?;
    let bytes = snapshot.to_bytes()?;

    let parent = match file.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let temp = parent.join(format!(".tdl-backup.tmp.{}", Uuid::new_v4().simple()));
    let written = (|| {
        let mut out = OpenOptions::new().write(true).create_new(true).open(&temp)?;
        out.write_all(&bytes)?;
        out.sync_all()?;
        fs::rename(&temp, file)
    })();
    if let Err(e) = written {
        let _ = fs::remove_file(&temp);
        return Err(TdlError::io(format!("failed to write backup {}", file.display()), e));
    }

    tracing::info!(
        file = %file.display(),
        namespaces = snapshot.len(),
        keys = snapshot.key_count(),
        "backup written"
    );
    Ok(snapshot)
}

/// Imports a file produced by [`backup`] into `engine`.
///
/// # Errors
/// I/O errors, a bad header or checksum, or import failures.
pub fn recover(engine: &Engine, file: &Path) -> TdlResult<Snapshot> {
    let handle = fs::File::open(file)
        .map_err(|e| TdlError::io(format!("failed to open backup {}", file.display()), e))?;
    let snapshot = Snapshot::read_from(&mut BufReader::new(handle))?;
    engine.import(&snapshot)?;
    tracing::info!(
        file = %file.display(),
        source = %snapshot.source,
        namespaces = snapshot.len(),
        keys = snapshot.key_count(),
        "backup recovered"
    );
    Ok(snapshot)
}

/// Copies every namespace of `engine` into a store built from `target`.
///
/// # Errors
/// `TdlError::Migration` wrapping export, open, import or close failures.
pub fn copy_to(engine: &Engine, target: &StorageConfig) -> TdlResult<Snapshot> {
    let from = engine.kind();
    let wrap = |e: TdlError| TdlError::migration(from, target.kind(), e);

    if let (Some(src), Some(dst)) = (
        engine_path(engine),
        target.path().map(Path::to_path_buf),
    ) {
        if src == dst {
            return Err(wrap(
                StorageError::Backend(format!("{} is already the current store", dst.display())).into(),
            ));
        }
    }

    let snapshot = engine.export().map_err(|e| wrap(e.into()))?;
    let destination =
        Engine::create(target, engine.cancellation().clone()).map_err(|e| wrap(e.into()))?;
    let imported = destination.import(&snapshot).map_err(TdlError::from);
    join(imported, destination.close()).map_err(wrap)?;

    tracing::info!(
        target = %target,
        namespaces = snapshot.len(),
        keys = snapshot.key_count(),
        "storage copied"
    );
    Ok(snapshot)
}

fn engine_path(engine: &Engine) -> Option<PathBuf> {
    engine.config().and_then(StorageConfig::path).map(Path::to_path_buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn seed_legacy(path: &Path) {
        let engine = Engine::create(&StorageConfig::legacy(path), Cancellation::new()).unwrap();
        engine.open("default").unwrap().set("session", b"alpha").unwrap();
        engine.open("work").unwrap().set("session", b"beta").unwrap();
        engine.close().unwrap();
    }

    #[test]
    fn test_skips_when_explicit() {
        let dir = tempdir().unwrap();
        seed_legacy(&dir.path().join("kv"));
        let target = SortedConfig::new(dir.path().join("data"));
        let outcome =
            auto_migrate(true, &dir.path().join("kv"), &target, &Cancellation::new()).unwrap();
        assert_eq!(outcome, MigrationOutcome::SkippedExplicit);
        assert!(!target.path.exists());
    }

    #[test]
    fn test_skips_fresh_install() {
        let dir = tempdir().unwrap();
        let target = SortedConfig::new(dir.path().join("data"));
        let outcome =
            auto_migrate(false, &dir.path().join("kv"), &target, &Cancellation::new()).unwrap();
        assert_eq!(outcome, MigrationOutcome::SkippedFresh);
        assert!(!target.path.exists());
    }

    #[test]
    fn test_migrates_then_skips() {
        let dir = tempdir().unwrap();
        let legacy = dir.path().join("kv");
        seed_legacy(&legacy);
        let target = SortedConfig::new(dir.path().join("data"));

        let first = auto_migrate(false, &legacy, &target, &Cancellation::new()).unwrap();
        assert_eq!(
            first,
            MigrationOutcome::Migrated {
                namespaces: 2,
                keys: 2
            }
        );
        let second = auto_migrate(false, &legacy, &target, &Cancellation::new()).unwrap();
        assert_eq!(second, MigrationOutcome::SkippedExisting);

        let engine = Engine::create(&StorageConfig::Sorted(target), Cancellation::new()).unwrap();
        assert_eq!(engine.namespaces().unwrap(), vec!["default", "work"]);
        assert_eq!(
            engine.open("work").unwrap().get("session").unwrap(),
            Some(b"beta".to_vec())
        );
    }

    #[test]
    fn test_cancelled_migration_leaves_no_target() {
        let dir = tempdir().unwrap();
        let legacy = dir.path().join("kv");
        seed_legacy(&legacy);
        let target = SortedConfig::new(dir.path().join("data"));
        let cancel = Cancellation::new();
        cancel.cancel();

        let err = auto_migrate(false, &legacy, &target, &cancel).unwrap_err();
        assert!(err.is_migration());
        assert!(err.is_cancelled());
        assert!(!target.path.exists());
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().contains(STAGING_MARKER))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_stale_staging_is_removed() {
        let dir = tempdir().unwrap();
        let legacy = dir.path().join("kv");
        seed_legacy(&legacy);
        let stale = dir.path().join(format!("data{STAGING_MARKER}dead"));
        fs::create_dir_all(&stale).unwrap();

        let target = SortedConfig::new(dir.path().join("data"));
        auto_migrate(false, &legacy, &target, &Cancellation::new()).unwrap();
        assert!(!stale.exists());
        assert!(target.path.is_dir());
    }

    #[test]
    fn test_backup_and_recover() {
        let dir = tempdir().unwrap();
        let source = Engine::create(&StorageConfig::Memory, Cancellation::new()).unwrap();
        source.open("default").unwrap().set("session", b"x").unwrap();
        let file = dir.path().join("backup.tdl");
        backup(&source, &file).unwrap();

        let target = Engine::create(&StorageConfig::Memory, Cancellation::new()).unwrap();
        let snapshot = recover(&target, &file).unwrap();
        assert_eq!(snapshot.source, DriverKind::Memory);
        assert_eq!(
            target.open("default").unwrap().get("session").unwrap(),
            Some(b"x".to_vec())
        );
    }

    #[test]
    fn test_recover_rejects_corrupt_file() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("broken.tdl");
        fs::write(&file, b"definitely not a backup").unwrap();
        let engine = Engine::create(&StorageConfig::Memory, Cancellation::new()).unwrap();
        assert!(recover(&engine, &file).is_err());
        assert!(engine.namespaces().unwrap().is_empty());
    }

    #[test]
    fn test_copy_to_rejects_same_store() {
        let dir = tempdir().unwrap();
        let config = StorageConfig::sorted(dir.path().join("data"));
        let engine = Engine::create(&config, Cancellation::new()).unwrap();
        let err = copy_to(&engine, &config).unwrap_err();
        assert!(err.is_migration());
    }

    #[test]
    fn test_copy_to_sorted() {
        let dir = tempdir().unwrap();
        let engine = Engine::create(&StorageConfig::Memory, Cancellation::new()).unwrap();
        engine.open("default").unwrap().set("session", b"s").unwrap();
        let target = StorageConfig::sorted(dir.path().join("copy"));
        copy_to(&engine, &target).unwrap();

        let copied = Engine::create(&target, Cancellation::new()).unwrap();
        assert_eq!(
            copied.open("default").unwrap().get("session").unwrap(),
            Some(b"s".to_vec())
        );
    }
}
