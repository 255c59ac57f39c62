use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use modcache_service::caching::{BuildOutput, CacheError};
use modcache_service::modules::ModuleBuilds;

use crate::{CountingBuilder, FakeModule, setup_manager, slow_builder, wait_for_spill};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_concurrent_gzip_requests() {
    let (manager, _work_dir) = setup_manager(0);
    let calls = Arc::new(AtomicUsize::new(0));

    let requests = (0..2).map(|_| {
        let table = manager.current().compressed_builds().clone();
        let builder = slow_builder(calls.clone(), Duration::from_millis(50), b"X");
        tokio::spawn(async move { table.get_or_compute("m1.js:gzip", builder).await })
    });

    for result in futures::future::join_all(requests).await {
        let build = result.unwrap().unwrap();
        assert_eq!(build.content.as_ref(), &Bytes::from_static(b"X"));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_failures_share_one_error() {
    let (manager, _work_dir) = setup_manager(0);
    let modules = ModuleBuilds::new(manager.clone(), false);
    let source = Arc::new(FakeModule::new("broken.js"));
    let builder = Arc::new(
        CountingBuilder::new()
            .with_delay(Duration::from_millis(50))
            .failing("unexpected token"),
    );

    let requests = (0..8).map(|_| {
        let modules = modules.clone();
        let source = source.clone();
        let builder = builder.clone();
        tokio::spawn(async move {
            modules
                .get_build(source.as_ref(), builder, &Default::default(), false)
                .await
        })
    });

    for result in futures::future::join_all(requests).await {
        let err = result.unwrap().unwrap_err();
        assert_eq!(err, CacheError::BuildFailure("unexpected token".into()));
    }
    assert_eq!(builder.calls(), 1);

    // the failure is not cached
    modules
        .get_build(source.as_ref(), builder.clone(), &Default::default(), false)
        .await
        .unwrap_err();
    assert_eq!(builder.calls(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_readers_never_see_half_written_entries() {
    let (manager, _work_dir) = setup_manager(0);
    let table = manager.current().table("layers");

    table
        .get_or_compute("k1", || async {
            Ok(BuildOutput::new(Bytes::from(vec![b'x'; 64 * 1024])))
        })
        .await
        .unwrap();

    // Readers race the spill. None of them may ever end up building again.
    let readers = (0..8).map(|_| {
        let table = table.clone();
        tokio::spawn(async move {
            for _ in 0..100 {
                let build = table
                    .get_or_compute("k1", || async {
                        Err(CacheError::build_failure("content was not readable"))
                    })
                    .await
                    .unwrap();
                assert_eq!(build.content.len(), 64 * 1024);
                assert!(build.from_cache);
                tokio::task::yield_now().await;
            }
        })
    });
    for reader in futures::future::join_all(readers).await {
        reader.unwrap();
    }

    let entry = table.entries().get("k1").unwrap();
    wait_for_spill(&entry).await;
    let build = table
        .get_or_compute("k1", || async { Err(CacheError::InternalError) })
        .await
        .unwrap();
    assert!(build.from_cache);
}

#[tokio::test]
async fn test_timed_out_waiter_still_fills_cache() {
    let (manager, _work_dir) = setup_manager(0);
    let calls = Arc::new(AtomicUsize::new(0));

    let table = manager.current().converted_resources().clone();
    let slow = table.get_or_compute(
        "logo.svg:base64",
        slow_builder(calls.clone(), Duration::from_millis(50), b"PHN2Zz4="),
    );
    assert!(
        tokio::time::timeout(Duration::from_millis(5), slow)
            .await
            .is_err()
    );

    let build = table
        .get_or_compute(
            "logo.svg:base64",
            slow_builder(calls.clone(), Duration::ZERO, b"other"),
        )
        .await
        .unwrap();
    assert_eq!(build.content.as_ref(), &Bytes::from_static(b"PHN2Zz4="));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
