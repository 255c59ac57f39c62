use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use modcache_service::caching::{ControlChange, EntryStatus};
use modcache_service::modules::ModuleBuilds;

use crate::{
    CountingBuilder, FakeModule, assert_status, setup_manager, slow_builder, spill_files,
    wait_for_deletion, wait_for_spill,
};

#[tokio::test]
async fn test_config_change_invalidates() {
    let (manager, _work_dir) = setup_manager(0);
    let calls = Arc::new(AtomicUsize::new(0));

    // the first config load only records the baseline
    assert!(!manager.invalidate_if_changed(ControlChange::Config("oldtext".into()), 1));

    let table = manager.current().table("layers");
    table
        .get_or_compute("k1", slow_builder(calls.clone(), Duration::ZERO, b"1"))
        .await
        .unwrap();
    let entry = table.entries().get("k1").unwrap();
    wait_for_spill(&entry).await;
    let spilled = entry.spill_name().unwrap();

    let retired = manager.current();
    assert!(manager.invalidate_if_changed(ControlChange::Config("newtext".into()), 2));
    assert!(!Arc::ptr_eq(&retired, &manager.current()));
    assert_status(entry.status(), EntryStatus::Evicted);

    let build = manager
        .current()
        .table("layers")
        .get_or_compute("k1", slow_builder(calls.clone(), Duration::ZERO, b"2"))
        .await
        .unwrap();
    assert!(!build.from_cache);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // the new snapshot inherits the recorded config
    let control = manager.current().control();
    assert_eq!(control.raw_config.as_deref(), Some("newtext"));

    // the retired snapshot's file goes away after the grace delay
    wait_for_deletion(&manager, &spilled).await;
}

#[tokio::test]
async fn test_first_value_without_baseline_keeps_builds() {
    let (manager, _work_dir) = setup_manager(0);
    let calls = Arc::new(AtomicUsize::new(0));
    let table = manager.current().table("layers");
    table
        .get_or_compute("k1", slow_builder(calls.clone(), Duration::ZERO, b"1"))
        .await
        .unwrap();

    // nothing was recorded before, so this only becomes the baseline
    assert!(!manager.invalidate_if_changed(ControlChange::Config("newtext".into()), 2));
    let build = manager
        .current()
        .table("layers")
        .get_or_compute("k1", slow_builder(calls.clone(), Duration::ZERO, b"2"))
        .await
        .unwrap();
    assert!(build.from_cache);
    assert_eq!(
        manager.current().control().raw_config.as_deref(),
        Some("newtext")
    );

    assert!(manager.invalidate_if_changed(ControlChange::Config("newertext".into()), 3));
    let build = manager
        .current()
        .table("layers")
        .get_or_compute("k1", slow_builder(calls.clone(), Duration::ZERO, b"3"))
        .await
        .unwrap();
    assert!(!build.from_cache);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_retired_snapshot_handle_writes_no_files() {
    let (manager, _work_dir) = setup_manager(0);
    manager.invalidate_if_changed(ControlChange::Dependencies(1), 1);
    let retired = manager.current();
    assert!(manager.invalidate_if_changed(ControlChange::Dependencies(2), 2));

    let calls = Arc::new(AtomicUsize::new(0));
    let build = retired
        .table("layers")
        .get_or_compute("k1", slow_builder(calls.clone(), Duration::ZERO, b"1"))
        .await
        .unwrap();
    assert_eq!(&build.content[..], b"1");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(retired.table("layers").entries().is_empty());
    assert!(spill_files(&manager).is_empty());
}

#[tokio::test]
async fn test_unchanged_value_keeps_snapshot() {
    let (manager, _work_dir) = setup_manager(0);
    manager.invalidate_if_changed(ControlChange::Dependencies(7), 1);
    let before = manager.current();

    assert!(!manager.invalidate_if_changed(ControlChange::Dependencies(7), 2));
    assert!(Arc::ptr_eq(&before, &manager.current()));
}

#[tokio::test]
async fn test_stale_sequence_does_not_clear() {
    let (manager, _work_dir) = setup_manager(0);
    manager.invalidate_if_changed(ControlChange::Config("a".into()), 1);
    manager.invalidate_if_changed(ControlChange::Options(Default::default()), 1);
    assert!(manager.invalidate_if_changed(ControlChange::Config("b".into()), 5));
    let live = manager.current();

    // A near-simultaneous change reported with an older sequence is dropped.
    let options = [("hasFeature".to_owned(), "true".to_owned())].into();
    assert!(!manager.invalidate_if_changed(ControlChange::Options(options), 4));
    assert!(Arc::ptr_eq(&live, &manager.current()));
    assert_eq!(manager.current().control().options, Some(Default::default()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_in_flight_build_completes_against_old_snapshot() {
    let (manager, _work_dir) = setup_manager(0);
    manager.invalidate_if_changed(ControlChange::Dependencies(1), 1);

    let modules = ModuleBuilds::new(manager.clone(), false);
    let source = Arc::new(FakeModule::new("app.js"));
    let builder = Arc::new(CountingBuilder::new().with_delay(Duration::from_millis(100)));

    let in_flight = {
        let modules = modules.clone();
        let source = source.clone();
        let builder = builder.clone();
        tokio::spawn(async move {
            modules
                .get_build(source.as_ref(), builder, &Default::default(), false)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let retired = manager.current();
    assert_eq!(retired.module_builds().len(), 1);

    assert!(manager.invalidate_if_changed(ControlChange::Dependencies(2), 2));
    assert!(manager.current().module_builds().is_empty());

    let build = in_flight.await.unwrap().unwrap();
    assert_eq!(*build.content, "app.js#1");
    assert!(!build.from_cache);

    // Neither snapshot holds the result: the old one was cleared, the new one never saw it.
    assert!(retired.module_builds().is_empty());
    assert!(manager.current().module_builds().is_empty());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(spill_files(&manager).is_empty());

    let build = modules
        .get_build(source.as_ref(), builder.clone(), &Default::default(), false)
        .await
        .unwrap();
    assert_eq!(*build.content, "app.js#2");
}
