use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use filetime::FileTime;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::config::CacheConfig;

/// Name of the file holding the persisted snapshot metadata.
pub const METADATA_FILENAME: &str = "metadata.json";

/// Suffix of every spill file.
pub const SPILL_SUFFIX: &str = ".cache";

/// Prefix of in-progress writes, which are never referenced by metadata.
const TEMP_PREFIX: &str = ".tmp";

/// Spills, reads and deletes files in the cache directory.
///
/// All writes run on the blocking pool, bounded by `max_concurrent_spills`.
#[derive(Debug, Clone)]
pub struct CacheFiles {
    inner: Arc<CacheFilesInner>,
}

#[derive(Debug)]
struct CacheFilesInner {
    cache_dir: PathBuf,
    delete_delay: Duration,
    spill_permits: Arc<Semaphore>,
}

impl CacheFiles {
    /// Creates the cache directory if it does not exist yet.
    pub fn create(cache_dir: PathBuf, config: &CacheConfig) -> io::Result<Self> {
        fs::create_dir_all(&cache_dir)?;
        Ok(Self {
            inner: Arc::new(CacheFilesInner {
                cache_dir,
                delete_delay: config.delete_delay,
                spill_permits: Arc::new(Semaphore::new(config.max_concurrent_spills.max(1))),
            }),
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.inner.cache_dir
    }

    /// The grace period used by [`delete_delayed`](Self::delete_delayed) callers by default.
    pub fn delete_delay(&self) -> Duration {
        self.inner.delete_delay
    }

    pub fn path(&self, filename: &str) -> PathBuf {
        self.inner.cache_dir.join(filename)
    }

    /// Asynchronously writes `contents` to a fresh file named `<prefix><random>.cache`.
    ///
    /// Returns immediately. `on_complete` receives the chosen file name, or the error that
    /// prevented the file from being written. When `modified` is given, the file's mtime is set
    /// to it so that stale spills can be told apart on disk.
    pub fn submit_spill<F>(
        &self,
        prefix: &str,
        contents: Bytes,
        modified: Option<SystemTime>,
        on_complete: F,
    ) -> JoinHandle<()>
    where
        F: FnOnce(io::Result<String>) + Send + 'static,
    {
        let this = self.clone();
        let prefix = safe_file_prefix(prefix);
        tokio::spawn(async move {
            let result = match this.inner.spill_permits.clone().acquire_owned().await {
                Ok(permit) => {
                    let task = tokio::task::spawn_blocking(move || {
                        let _permit = permit;
                        this.write_spill(&prefix, &contents, modified)
                    });
                    match task.await {
                        Ok(result) => result,
                        Err(e) => Err(io::Error::other(e)),
                    }
                }
                Err(e) => Err(io::Error::other(e)),
            };
            on_complete(result);
        })
    }

    fn write_spill(
        &self,
        prefix: &str,
        contents: &[u8],
        modified: Option<SystemTime>,
    ) -> io::Result<String> {
        let dir = self.cache_dir();
        // The directory might have been swept underneath us.
        fs::create_dir_all(dir)?;

        let mut temp_file = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(dir)?;
        temp_file.write_all(contents)?;
        temp_file.as_file().sync_data()?;

        // Reserve a collision-free final name, then atomically move the written file over it.
        let (_, final_path) = tempfile::Builder::new()
            .prefix(prefix)
            .suffix(SPILL_SUFFIX)
            .tempfile_in(dir)?
            .keep()
            .map_err(|e| e.error)?;
        temp_file.persist(&final_path).map_err(|e| e.error)?;

        if let Some(modified) = modified {
            filetime::set_file_mtime(&final_path, FileTime::from_system_time(modified))?;
        }

        let filename = final_path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| io::Error::other("spill file name is not valid utf-8"))?
            .to_owned();

        metric!(histogram("caches.file.size") = contents.len() as u64);
        tracing::trace!("Spilled {} bytes to {}", contents.len(), filename);
        Ok(filename)
    }

    /// Reads a spilled file back.
    pub async fn read(&self, filename: &str) -> io::Result<Bytes> {
        let contents = tokio::fs::read(self.path(filename)).await?;
        Ok(Bytes::from(contents))
    }

    /// Deletes `filename` after `delay`, giving in-flight readers time to finish.
    pub fn delete_delayed(&self, filename: &str, delay: Duration) -> JoinHandle<()> {
        self.delete_all_delayed(vec![filename.to_owned()], delay)
    }

    /// Deletes all the given files after `delay`.
    pub fn delete_all_delayed(&self, filenames: Vec<String>, delay: Duration) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let task = tokio::task::spawn_blocking(move || {
                for filename in filenames {
                    this.delete_now(&filename);
                }
            });
            if let Err(e) = task.await {
                tracing::error!(error = &e as &dyn std::error::Error, "Delete task failed");
            }
        })
    }

    /// Deletes a file right away. Failures are logged and swallowed.
    pub fn delete_now(&self, filename: &str) {
        let path = self.path(filename);
        if let Err(e) = fs::remove_file(&path) {
            // A missing file is exactly what we wanted.
            if e.kind() != io::ErrorKind::NotFound {
                metric!(counter("caches.file.delete_failure") += 1);
                tracing::warn!(
                    error = &e as &dyn std::error::Error,
                    path = %path.display(),
                    "Failed to delete cache file",
                );
            }
        }
    }

    /// Lists all spill files and leftover temp files currently in the cache directory.
    pub fn list_cache_files(&self) -> io::Result<Vec<String>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(self.cache_dir())? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if name.ends_with(SPILL_SUFFIX) || name.starts_with(TEMP_PREFIX) {
                files.push(name);
            }
        }
        files.sort();
        Ok(files)
    }
}

/// Protect against:
/// * ".."
/// * absolute paths
/// * ":" (not a threat on POSIX filesystems, but confuses OS X Finder)
fn safe_file_prefix(s: &str) -> String {
    let mut prefix = s.replace(['/', '\\', ':'], "_");
    if prefix.starts_with('.') {
        prefix.replace_range(..1, "_");
    }
    prefix
}
