use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use flate2::read::GzDecoder;
use modcache_service::caching::{CacheResult, ControlChange};
use modcache_service::resources::{ResourceCaches, ResourceConverter};

use crate::{FakeResource, open_manager, setup_manager, wait_for_spill};

struct Upper;

#[async_trait]
impl ResourceConverter for Upper {
    fn name(&self) -> &str {
        "upper"
    }

    async fn convert(&self, _resource: &str, contents: Bytes) -> CacheResult<Bytes> {
        Ok(contents.to_ascii_uppercase().into())
    }
}

fn gunzip(bytes: &[u8]) -> String {
    let mut decoded = String::new();
    GzDecoder::new(bytes).read_to_string(&mut decoded).unwrap();
    decoded
}

#[tokio::test]
async fn test_compressed_survives_restart() {
    let (manager, work_dir) = setup_manager(3);
    let resource = Arc::new(FakeResource::new("css/main.css", b"body { color: red }"));

    let build = ResourceCaches::new(manager.clone())
        .compressed(resource.clone())
        .await
        .unwrap();
    assert!(!build.from_cache);
    let entry = manager
        .current()
        .compressed_builds()
        .entries()
        .get("css/main.css:gzip")
        .unwrap();
    wait_for_spill(&entry).await;
    manager.shutdown().await;

    let manager = open_manager(work_dir.path(), 3);
    let build = ResourceCaches::new(manager.clone())
        .compressed(resource.clone())
        .await
        .unwrap();
    assert!(build.from_cache);
    assert_eq!(gunzip(&build.content), "body { color: red }");
    assert_eq!(resource.reads(), 1);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_changed_resource_is_recompressed() {
    let (manager, _work_dir) = setup_manager(0);
    let caches = ResourceCaches::new(manager.clone());
    let resource = Arc::new(FakeResource::new("dojo/dom.js", b"define([], {})"));

    caches.compressed(resource.clone()).await.unwrap();
    // within the mtime tolerance
    resource.touch(Duration::from_millis(500));
    assert!(caches.compressed(resource.clone()).await.unwrap().from_cache);

    resource.touch(Duration::from_secs(10));
    let build = caches.compressed(resource.clone()).await.unwrap();
    assert!(!build.from_cache);
    assert_eq!(resource.reads(), 2);
    assert_eq!(manager.current().compressed_builds().entries().len(), 1);
}

#[tokio::test]
async fn test_converted_is_cleared_by_invalidation() {
    let (manager, _work_dir) = setup_manager(0);
    let caches = ResourceCaches::new(manager.clone());
    let resource = Arc::new(FakeResource::new("img/logo.svg", b"<svg/>"));
    let converter = Arc::new(Upper);

    let build = caches
        .converted(resource.clone(), converter.clone())
        .await
        .unwrap();
    assert_eq!(build.content.as_ref(), &Bytes::from_static(b"<SVG/>"));
    assert!(
        caches
            .converted(resource.clone(), converter.clone())
            .await
            .unwrap()
            .from_cache
    );

    manager.invalidate_if_changed(ControlChange::Dependencies(1), 1);
    assert!(manager.invalidate_if_changed(ControlChange::Dependencies(2), 2));

    let build = caches.converted(resource.clone(), converter).await.unwrap();
    assert!(!build.from_cache);
    assert_eq!(resource.reads(), 2);
}
