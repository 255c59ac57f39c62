use std::fmt;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::persist::{read_persisted, write_persisted};
use super::{CacheControl, CacheFiles, CacheSnapshot, ControlChange, OpenError};
use crate::config::CacheConfig;

/// Name of the cache directory below the work dir.
pub const CACHE_DIR: &str = "cache";

/// Owns the current [`CacheSnapshot`], persists it and replaces it whenever one of the inputs
/// affecting all builds changes.
pub struct CacheManager {
    config: CacheConfig,
    files: CacheFiles,
    current: RwLock<Arc<CacheSnapshot>>,
    /// The highest sequence number that caused an invalidation.
    highest_sequence: Mutex<u64>,
    /// Serializes metadata writes.
    persist_lock: Mutex<()>,
    shutdown: CancellationToken,
    is_shut_down: AtomicBool,
}

impl fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheManager")
            .field("cache_dir", &self.files.cache_dir())
            .field("current", &self.current())
            .finish()
    }
}

impl CacheManager {
    /// Opens the cache in `<work_dir>/cache`.
    ///
    /// The persisted snapshot is reused if it was produced with a `restart_stamp` that is not
    /// older than the given one. Otherwise a fresh snapshot is started and the files of the old
    /// one are swept once the delete delay has passed.
    ///
    /// This has to be called from within a tokio runtime, as it starts the periodic persistence.
    pub fn open(
        work_dir: &Path,
        restart_stamp: u64,
        config: &CacheConfig,
    ) -> Result<Arc<Self>, OpenError> {
        let cache_dir = work_dir.join(CACHE_DIR);
        let files = CacheFiles::create(cache_dir.clone(), config).map_err(|source| {
            OpenError::DirectoryCreation {
                path: cache_dir.clone(),
                source,
            }
        })?;

        let snapshot = match read_persisted(&cache_dir)? {
            Some(persisted) if persisted.control.is_reusable_for(restart_stamp) => {
                tracing::info!(
                    init_stamp = persisted.control.init_stamp,
                    restart_stamp,
                    "Reusing persisted cache"
                );
                CacheSnapshot::from_persisted(files.clone(), persisted)
            }
            persisted => {
                if let Some(persisted) = persisted {
                    tracing::info!(
                        init_stamp = persisted.control.init_stamp,
                        restart_stamp,
                        "Discarding persisted cache"
                    );
                }
                match files.list_cache_files() {
                    Ok(stale) if !stale.is_empty() => {
                        files.delete_all_delayed(stale, config.delete_delay);
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(
                        error = &e as &dyn std::error::Error,
                        "Failed to list stale cache files"
                    ),
                }
                CacheSnapshot::new(files.clone(), CacheControl::new(restart_stamp))
            }
        };

        let manager = Arc::new(Self {
            config: config.clone(),
            files,
            current: RwLock::new(Arc::new(snapshot)),
            highest_sequence: Mutex::new(0),
            persist_lock: Mutex::new(()),
            shutdown: CancellationToken::new(),
            is_shut_down: AtomicBool::new(false),
        });

        spawn_persist_task(
            Arc::downgrade(&manager),
            config.persist_interval,
            manager.shutdown.clone(),
        );
        Ok(manager)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn files(&self) -> &CacheFiles {
        &self.files
    }

    /// The live snapshot.
    ///
    /// The lock is only held for cloning the reference, it never waits on builds or I/O.
    pub fn current(&self) -> Arc<CacheSnapshot> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Reacts to a reload of one of the inputs affecting all builds.
    ///
    /// The first value ever reported for a kind only establishes the baseline, whatever its
    /// `sequence`. On a fresh cache a changed value therefore only takes effect if the previous
    /// one was reported before it. A value that differs from the recorded one replaces the whole
    /// snapshot, unless `sequence` is not greater than the sequence of the last invalidation.
    /// Returns whether the snapshot was replaced.
    pub fn invalidate_if_changed(self: &Arc<Self>, change: ControlChange, sequence: u64) -> bool {
        let kind = change.kind();
        let mut highest_sequence = self
            .highest_sequence
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        let retired = self.current();
        let control = {
            let mut control = retired.lock_control();
            if !control.differs(&change) {
                return false;
            }
            if !control.has_recorded(kind) {
                tracing::debug!("Recording initial {kind}");
                control.apply(change);
                return false;
            }
            if sequence <= *highest_sequence {
                tracing::debug!(
                    sequence,
                    highest_sequence = *highest_sequence,
                    "Ignoring out-of-order {kind} change"
                );
                return false;
            }
            control.with_change(change)
        };
        *highest_sequence = sequence;

        let snapshot = Arc::new(CacheSnapshot::new(self.files.clone(), control));
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = snapshot;
        drop(highest_sequence);

        let spilled = retired.clear();
        if !spilled.is_empty() {
            self.files
                .delete_all_delayed(spilled, self.config.delete_delay);
        }

        metric!(counter("caches.invalidation") += 1, "kind" => kind.as_ref());
        tracing::info!(sequence, "Cache cleared because the {kind} changed");

        self.schedule_persist();
        true
    }

    /// Writes the metadata of the live snapshot.
    ///
    /// Failures are logged; the cache keeps working, it just won't survive a restart.
    pub fn persist(&self) {
        if let Err(e) = self.try_persist() {
            tracing::error!(
                error = &e as &dyn std::error::Error,
                "Failed to persist cache metadata"
            );
        }
    }

    fn try_persist(&self) -> io::Result<()> {
        let _guard = self.persist_lock.lock().unwrap_or_else(|e| e.into_inner());
        let persisted = self.current().to_persisted();
        let start = SystemTime::now();
        write_persisted(self.files.cache_dir(), &persisted)?;
        tracing::debug!(
            modules = persisted.modules.len(),
            elapsed = ?start.elapsed().unwrap_or_default(),
            "Persisted cache metadata"
        );
        Ok(())
    }

    fn schedule_persist(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::task::spawn_blocking(move || this.persist());
    }

    /// Stops the periodic persistence and writes the metadata one last time.
    ///
    /// Calling this more than once is a no-op.
    pub async fn shutdown(self: &Arc<Self>) {
        if self.is_shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();

        let this = Arc::clone(self);
        let task = tokio::task::spawn_blocking(move || this.persist());
        match tokio::time::timeout(self.config.shutdown_timeout, task).await {
            Ok(Ok(())) => tracing::info!("Cache metadata persisted on shutdown"),
            Ok(Err(e)) => tracing::error!(
                error = &e as &dyn std::error::Error,
                "Final cache persistence panicked"
            ),
            Err(_) => tracing::warn!("Timed out persisting the cache on shutdown"),
        }
    }

    /// Spills `contents` to a new file in the cache directory, see [`CacheFiles::submit_spill`].
    pub fn submit_spill<F>(
        &self,
        prefix: &str,
        contents: Bytes,
        on_complete: F,
    ) -> JoinHandle<()>
    where
        F: FnOnce(io::Result<String>) + Send + 'static,
    {
        self.files.submit_spill(prefix, contents, None, on_complete)
    }

    /// Deletes a file from the cache directory after `delay`.
    pub fn delete_delayed(&self, filename: &str, delay: Duration) -> JoinHandle<()> {
        self.files.delete_delayed(filename, delay)
    }
}

fn spawn_persist_task(manager: Weak<CacheManager>, interval: Duration, token: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick completes right away
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let Some(manager) = manager.upgrade() else {
                break;
            };
            let task = tokio::task::spawn_blocking(move || manager.persist());
            if let Err(e) = task.await {
                tracing::error!(error = &e as &dyn std::error::Error, "Persist task failed");
            }
        }
        tracing::trace!("Periodic cache persistence stopped");
    });
}
