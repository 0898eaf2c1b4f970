//! Driver contract tests across every backend.

use std::path::Path;
use std::sync::Arc;
use std::thread;

use tdl::storage::{DriverKind, Engine, SortedConfig, StorageConfig, StorageError};
use tdl::Cancellation;
use tempfile::tempdir;

fn config_for(kind: DriverKind, dir: &Path) -> StorageConfig {
    match kind {
        DriverKind::Legacy => StorageConfig::legacy(dir.join("legacy")),
        DriverKind::Sorted => StorageConfig::sorted(dir.join("sorted")),
        DriverKind::Memory => StorageConfig::Memory,
    }
}

fn seed(engine: &Engine) {
    let default = engine.open("default").unwrap();
    default.set("session", b"auth-default").unwrap();
    default.set("app", b"desktop").unwrap();
    let work = engine.open("work").unwrap();
    work.set("session", &[0u8, 159, 146, 150]).unwrap();
    engine.open("empty").unwrap();
}

#[test]
fn test_every_driver_creates_and_closes_idempotently() {
    for kind in DriverKind::ALL {
        let dir = tempdir().unwrap();
        let engine = Engine::create(&config_for(kind, dir.path()), Cancellation::new()).unwrap();
        assert_eq!(engine.kind(), kind);
        engine.close().unwrap();
        engine.close().unwrap();
        assert!(matches!(engine.namespaces(), Err(StorageError::Closed)));
    }
}

#[test]
fn test_roundtrip_for_every_driver_pair() {
    for from in DriverKind::ALL {
        for to in DriverKind::ALL {
            let dir = tempdir().unwrap();
            let source_dir = dir.path().join("src");
            let target_dir = dir.path().join("dst");

            let source = Engine::create(&config_for(from, &source_dir), Cancellation::new()).unwrap();
            seed(&source);
            let snapshot = source.export().unwrap();
            assert_eq!(snapshot.source, from);

            let target = Engine::create(&config_for(to, &target_dir), Cancellation::new()).unwrap();
            target.import(&snapshot).unwrap();

            assert_eq!(
                target.namespaces().unwrap(),
                vec!["default", "empty", "work"],
                "{from} -> {to}"
            );
            let work = target.open("work").unwrap();
            assert_eq!(work.get("session").unwrap(), Some(vec![0u8, 159, 146, 150]));
            assert!(target.open("empty").unwrap().keys().unwrap().is_empty());
            assert_eq!(target.export().unwrap().namespaces(), snapshot.namespaces());
        }
    }
}

#[test]
fn test_export_of_empty_engine() {
    for kind in DriverKind::ALL {
        let dir = tempdir().unwrap();
        let engine = Engine::create(&config_for(kind, dir.path()), Cancellation::new()).unwrap();
        let snapshot = engine.export().unwrap();
        assert!(snapshot.is_empty());

        let other = Engine::create(&StorageConfig::Memory, Cancellation::new()).unwrap();
        other.import(&snapshot).unwrap();
        assert!(other.namespaces().unwrap().is_empty());
    }
}

#[test]
fn test_namespace_isolation() {
    for kind in DriverKind::ALL {
        let dir = tempdir().unwrap();
        let engine = Engine::create(&config_for(kind, dir.path()), Cancellation::new()).unwrap();
        let a = engine.open("a").unwrap();
        let b = engine.open("b").unwrap();
        a.set("session", b"alpha").unwrap();
        assert_eq!(b.get("session").unwrap(), None);
        b.set("session", b"beta").unwrap();
        a.delete("session").unwrap();
        assert_eq!(b.get("session").unwrap(), Some(b"beta".to_vec()));
        assert_eq!(a.get("session").unwrap(), None);
    }
}

#[test]
fn test_file_drivers_persist_namespaces() {
    for kind in [DriverKind::Legacy, DriverKind::Sorted] {
        let dir = tempdir().unwrap();
        let config = config_for(kind, dir.path());
        {
            let engine = Engine::create(&config, Cancellation::new()).unwrap();
            seed(&engine);
            engine.close().unwrap();
        }
        let engine = Engine::create(&config, Cancellation::new()).unwrap();
        assert_eq!(engine.namespaces().unwrap(), vec!["default", "empty", "work"]);
        assert_eq!(
            engine.open("default").unwrap().get("app").unwrap(),
            Some(b"desktop".to_vec())
        );
    }
}

#[test]
fn test_second_engine_on_same_directory_is_locked() {
    for kind in [DriverKind::Legacy, DriverKind::Sorted] {
        let dir = tempdir().unwrap();
        let config = config_for(kind, dir.path());
        let first = Engine::create(&config, Cancellation::new()).unwrap();
        let err = Engine::create(&config, Cancellation::new()).unwrap_err();
        assert!(matches!(err, StorageError::Locked(_)), "{kind}: {err}");
        first.close().unwrap();
        Engine::create(&config, Cancellation::new()).unwrap();
    }
}

#[test]
fn test_option_bag_selects_driver() {
    let dir = tempdir().unwrap();
    let spec = format!("driver=sorted,path={},sync=false", dir.path().join("db").display());
    let config = StorageConfig::parse(&spec).unwrap();
    let engine = Engine::create(&config, Cancellation::new()).unwrap();
    assert_eq!(engine.kind(), DriverKind::Sorted);

    assert!(StorageConfig::parse("driver=bolt,path=/tmp/x").is_err());
    assert!(StorageConfig::parse("driver=sorted").is_err());
    assert!(StorageConfig::parse("driver=memory,path=/x").is_err());
}

#[test]
fn test_concurrent_opens_keep_every_write() {
    const THREADS: usize = 8;
    const WRITES: usize = 100;
    const NAMESPACES: [&str; 3] = ["default", "work", "alt"];

    for kind in [DriverKind::Legacy, DriverKind::Sorted] {
        let dir = tempdir().unwrap();
        let config = match kind {
            // A small WAL makes compaction run while threads write.
            DriverKind::Sorted => StorageConfig::Sorted(SortedConfig {
                sync_on_write: false,
                max_wal_size: SortedConfig::MIN_WAL_SIZE,
                ..SortedConfig::new(dir.path().join("sorted"))
            }),
            _ => config_for(kind, dir.path()),
        };
        let engine = Arc::new(Engine::create(&config, Cancellation::new()).unwrap());

        let workers: Vec<_> = (0..THREADS)
            .map(|t| {
                let engine = Arc::clone(&engine);
                thread::spawn(move || {
                    for i in 0..WRITES {
                        let ns = engine.open(NAMESPACES[(t + i) % NAMESPACES.len()]).unwrap();
                        ns.set(&format!("t{t}-k{i:03}"), format!("{t}:{i}").as_bytes())
                            .unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        engine.close().unwrap();

        let engine = Engine::create(&config, Cancellation::new()).unwrap();
        assert_eq!(engine.namespaces().unwrap(), vec!["alt", "default", "work"]);
        let mut total = 0;
        for name in NAMESPACES {
            let ns = engine.open(name).unwrap();
            for key in ns.keys().unwrap() {
                let (t, i) = key[1..].split_once("-k").unwrap();
                let (t, i): (usize, usize) = (t.parse().unwrap(), i.parse().unwrap());
                assert_eq!(NAMESPACES[(t + i) % NAMESPACES.len()], name, "{kind:?} {key}");
                assert_eq!(ns.get(&key).unwrap(), Some(format!("{t}:{i}").into_bytes()));
                total += 1;
            }
        }
        assert_eq!(total, THREADS * WRITES, "{kind:?}");
        engine.close().unwrap();
    }
}
