use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use modcache_service::caching::{CacheError, EntryStatus};
use modcache_service::modules::ModuleBuilds;
use modcache_test as test;

use crate::{
    CountingBuilder, FakeModule, TempDir, assert_status, open_manager, slow_builder, spill_files,
    wait_for_deletion, wait_for_spill,
};

/// Builds and spills `k1` in a cache created with `init_stamp`, then shuts the manager down.
async fn populate(init_stamp: u64) -> (TempDir, String) {
    test::setup();
    let work_dir = test::tempdir();
    let manager = open_manager(work_dir.path(), init_stamp);

    let table = manager.current().table("layers");
    let calls = Arc::new(AtomicUsize::new(0));
    table
        .get_or_compute("k1", slow_builder(calls, Duration::ZERO, b"persisted"))
        .await
        .unwrap();
    let entry = table.entries().get("k1").unwrap();
    wait_for_spill(&entry).await;
    let spilled = entry.spill_name().unwrap().to_string();

    manager.shutdown().await;
    (work_dir, spilled)
}

async fn is_reused(work_dir: &Path, restart_stamp: u64) -> bool {
    let manager = open_manager(work_dir, restart_stamp);
    let reused = manager.current().table("layers").entries().get("k1").is_some();
    manager.shutdown().await;
    reused
}

#[tokio::test]
async fn test_same_stamp_reuses_cache() {
    let (work_dir, spilled) = populate(5).await;
    let manager = open_manager(work_dir.path(), 5);

    let table = manager.current().table("layers");
    let entry = table.entries().get("k1").unwrap();
    assert_status(entry.status(), EntryStatus::Spilled);
    assert_eq!(entry.spill_name().as_deref(), Some(spilled.as_str()));

    let build = table
        .get_or_compute("k1", || async {
            Err(CacheError::build_failure("must be read from disk"))
        })
        .await
        .unwrap();
    assert_eq!(build.content.as_ref(), &Bytes::from_static(b"persisted"));
    assert!(build.from_cache);
}

#[tokio::test]
async fn test_restart_reuse_rule() {
    let (work_dir, _) = populate(5).await;
    assert!(is_reused(work_dir.path(), 4).await);

    let (work_dir, _) = populate(5).await;
    assert!(!is_reused(work_dir.path(), 6).await);

    let (work_dir, _) = populate(5).await;
    assert!(!is_reused(work_dir.path(), 0).await);

    let (work_dir, _) = populate(0).await;
    assert!(is_reused(work_dir.path(), 0).await);

    let (work_dir, _) = populate(0).await;
    assert!(!is_reused(work_dir.path(), 1).await);
}

#[tokio::test]
async fn test_discarded_cache_is_swept() {
    let (work_dir, spilled) = populate(5).await;
    let manager = open_manager(work_dir.path(), 6);
    assert_eq!(manager.current().control().init_stamp, 6);
    wait_for_deletion(&manager, &spilled).await;
    assert!(spill_files(&manager).is_empty());
}

#[tokio::test]
async fn test_unreadable_metadata_is_cold_start() {
    let (work_dir, _) = populate(0).await;
    let metadata = work_dir.path().join("cache").join("metadata.json");
    std::fs::write(&metadata, "{\"version\": 1, \"created\"").unwrap();

    let manager = open_manager(work_dir.path(), 0);
    assert!(manager.current().table("layers").entries().is_empty());
}

#[tokio::test]
async fn test_vanished_spill_file_is_rebuilt() {
    let (work_dir, spilled) = populate(0).await;
    std::fs::remove_file(work_dir.path().join("cache").join(&spilled)).unwrap();

    let manager = open_manager(work_dir.path(), 0);
    let calls = Arc::new(AtomicUsize::new(0));
    let build = manager
        .current()
        .table("layers")
        .get_or_compute("k1", slow_builder(calls.clone(), Duration::ZERO, b"rebuilt"))
        .await
        .unwrap();
    assert_eq!(build.content.as_ref(), &Bytes::from_static(b"rebuilt"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_module_builds_survive_restart() {
    test::setup();
    let work_dir = test::tempdir();
    let source = FakeModule::new("app.js");
    let conditions = Default::default();

    let manager = open_manager(work_dir.path(), 0);
    let modules = ModuleBuilds::new(manager.clone(), false);
    let builder = Arc::new(CountingBuilder::new().examining(&["ie"]));
    let build = modules
        .get_build(&source, builder.clone(), &conditions, false)
        .await
        .unwrap();
    let record = manager.current().module_builds().get("app.js").unwrap();
    let entry = record.builds().entries().get(&build.key).unwrap();
    wait_for_spill(&entry).await;
    manager.shutdown().await;

    let manager = open_manager(work_dir.path(), 0);
    let modules = ModuleBuilds::new(manager.clone(), false);
    let builder = Arc::new(CountingBuilder::new().examining(&["ie"]));
    let restored = modules
        .get_build(&source, builder.clone(), &conditions, false)
        .await
        .unwrap();
    assert!(restored.from_cache);
    assert_eq!(restored.content, build.content);
    assert_eq!(restored.after(), ["app.js.css".to_owned()]);
    assert!(!restored.key_generators.is_provisional());
    assert_eq!(builder.calls(), 0);
}
