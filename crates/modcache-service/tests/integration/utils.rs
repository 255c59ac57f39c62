use std::path::Path;
use std::sync::Arc;

use modcache_service::caching::{CacheManager, EntryStatus};
use modcache_test as test;

pub use test::{
    CountingBuilder, FakeModule, FakeResource, TempDir, slow_builder, wait_for_spill,
};

/// Setup tests and open a cache manager in a fresh work directory.
///
/// The directory is cleaned up when the [`TempDir`] instance is dropped. Keep it as guard until
/// the test has finished.
pub fn setup_manager(restart_stamp: u64) -> (Arc<CacheManager>, TempDir) {
    test::setup();
    let work_dir = test::tempdir();
    let manager = open_manager(work_dir.path(), restart_stamp);
    (manager, work_dir)
}

pub fn open_manager(work_dir: &Path, restart_stamp: u64) -> Arc<CacheManager> {
    CacheManager::open(work_dir, restart_stamp, &test::cache_config()).unwrap()
}

/// The names of all spill files in the cache directory.
pub fn spill_files(manager: &CacheManager) -> Vec<String> {
    manager
        .files()
        .list_cache_files()
        .unwrap()
        .into_iter()
        .filter(|name| name.ends_with(".cache"))
        .collect()
}

/// Waits until the spill file `name` is gone.
pub async fn wait_for_deletion(manager: &CacheManager, name: &str) {
    for _ in 0..200 {
        if !manager.files().path(name).exists() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("`{name}` was never deleted");
}

pub fn assert_status(status: EntryStatus, expected: EntryStatus) {
    assert_eq!(status, expected, "unexpected entry status");
}
