use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::io::{self, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use regex::Regex;

use super::entry::{BuildDetails, BuildEntry, BuildOutput, CachePayload, CachedBuild};
use super::persist::PersistedEntry;
use super::{CacheError, CacheFiles, CacheResult, KeyGeneratorSet};

/// A thread-safe, string-keyed mapping for one logical cache domain.
///
/// New values are only ever created through [`insert_if_absent`](Self::insert_if_absent), so a
/// key never holds two live values.
pub struct NamedTable<V> {
    name: Arc<str>,
    map: Arc<DashMap<String, V>>,
}

impl<V> Clone for NamedTable<V> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            map: Arc::clone(&self.map),
        }
    }
}

impl<V> fmt::Debug for NamedTable<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedTable")
            .field("name", &self.name)
            .field("entries", &self.map.len())
            .finish()
    }
}

impl<V: Clone> NamedTable<V> {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            map: Default::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.map.get(key).map(|value| value.clone())
    }

    /// Returns the value stored under `key`, creating it with `make` if there is none.
    ///
    /// The boolean tells whether `make` was used.
    pub fn insert_if_absent<F>(&self, key: &str, make: F) -> (V, bool)
    where
        F: FnOnce() -> V,
    {
        match self.map.entry(key.to_owned()) {
            Entry::Occupied(occupied) => (occupied.get().clone(), false),
            Entry::Vacant(vacant) => (vacant.insert(make()).clone(), true),
        }
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        self.map.remove(key).map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// All keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.map.iter().map(|item| item.key().clone()).collect();
        keys.sort();
        keys
    }

    /// A sorted copy of all entries.
    pub fn entries(&self) -> BTreeMap<String, V> {
        self.map
            .iter()
            .map(|item| (item.key().clone(), item.value().clone()))
            .collect()
    }

    /// Removes and returns all values.
    pub fn drain(&self) -> Vec<V> {
        let keys = self.keys();
        keys.iter().filter_map(|key| self.remove(key)).collect()
    }
}

impl<T> NamedTable<Arc<T>> {
    /// Removes `key` only if it still maps to this very `value`.
    pub fn remove_if_same(&self, key: &str, value: &Arc<T>) -> bool {
        self.map
            .remove_if(key, |_, current| Arc::ptr_eq(current, value))
            .is_some()
    }
}

/// Marks a table as retired, on its own or together with everything below a common parent.
#[derive(Debug, Default)]
pub struct Retirement {
    retired: AtomicBool,
    parent: Option<Arc<Retirement>>,
}

impl Retirement {
    pub fn new() -> Arc<Self> {
        Arc::default()
    }

    /// A retirement that also takes effect when `self` is retired.
    pub fn child(self: &Arc<Self>) -> Arc<Self> {
        Arc::new(Self {
            retired: AtomicBool::new(false),
            parent: Some(Arc::clone(self)),
        })
    }

    pub fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
            || self.parent.as_ref().is_some_and(|parent| parent.is_retired())
    }
}

/// A [`NamedTable`] of [`BuildEntry`]s providing single-flight `get_or_compute`.
///
/// Once retired, a table no longer files anything. Builds started on it still run for their
/// callers, but the results are never kept or spilled.
pub struct BuildTable<T> {
    entries: NamedTable<Arc<BuildEntry<T>>>,
    files: CacheFiles,
    retirement: Arc<Retirement>,
}

impl<T> Clone for BuildTable<T> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
            files: self.files.clone(),
            retirement: Arc::clone(&self.retirement),
        }
    }
}

impl<T> fmt::Debug for BuildTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BuildTable").field(&self.entries).finish()
    }
}

impl<T: CachePayload> BuildTable<T> {
    pub fn new(name: impl Into<Arc<str>>, files: CacheFiles) -> Self {
        Self::with_retirement(name, files, Retirement::new())
    }

    pub fn with_retirement(
        name: impl Into<Arc<str>>,
        files: CacheFiles,
        retirement: Arc<Retirement>,
    ) -> Self {
        Self {
            entries: NamedTable::new(name),
            files,
            retirement,
        }
    }

    pub fn is_retired(&self) -> bool {
        self.retirement.is_retired()
    }

    pub fn name(&self) -> &str {
        self.entries.name()
    }

    pub fn entries(&self) -> &NamedTable<Arc<BuildEntry<T>>> {
        &self.entries
    }

    pub fn files(&self) -> &CacheFiles {
        &self.files
    }

    /// Creates a fresh, empty entry for the artifact `name`.
    pub fn new_entry(&self, name: &str) -> Arc<BuildEntry<T>> {
        Arc::new(BuildEntry::new(name.into(), self.files.clone()))
    }

    /// Returns the build filed under `key`, computing it with `builder` if there is none.
    ///
    /// At most one `builder` runs per key at any time. Every concurrent caller receives the
    /// result, or the error, of that one invocation. Successful builds are spilled to disk
    /// asynchronously.
    pub async fn get_or_compute<F, Fut>(&self, key: &str, builder: F) -> CacheResult<CachedBuild<T>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = CacheResult<BuildOutput<T>>> + Send + 'static,
    {
        self.get_or_compute_with(key, key, builder, |_, _| true).await
    }

    /// Like [`get_or_compute`](Self::get_or_compute), with control over spilling.
    ///
    /// `artifact` names the source artifact and prefixes the spill file. `on_built` runs inside
    /// the exclusive section right after a successful build and before the entry is spilled. It
    /// receives the discovered key generators and returns whether the entry should be spilled.
    pub async fn get_or_compute_with<F, Fut, H>(
        &self,
        artifact: &str,
        key: &str,
        builder: F,
        on_built: H,
    ) -> CacheResult<CachedBuild<T>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = CacheResult<BuildOutput<T>>> + Send + 'static,
        H: FnOnce(&Arc<BuildEntry<T>>, Option<&KeyGeneratorSet>) -> bool + Send + 'static,
    {
        let name = self.name().to_owned();
        metric!(counter("caches.access") += 1, "cache" => &name);

        if let Some(existing) = self.entries.get(key) {
            match existing.try_read().await {
                Some(Ok(build)) => {
                    metric!(counter("caches.memory.hit") += 1, "cache" => &name);
                    tracing::trace!("Returning cached `{name}` build with key `{key}`");
                    return Ok(build);
                }
                Some(Err(CacheError::Unreadable(_))) => {
                    self.entries.remove_if_same(key, &existing);
                }
                // Failed entries remove themselves, a fresh attempt follows below.
                Some(Err(_)) | None => {}
            }
        }

        let (entry, _) = self
            .entries
            .insert_if_absent(key, || self.new_entry(artifact));
        // Retirement is marked before the table is drained, so an entry filed after the drain
        // is always seen here.
        if self.is_retired() {
            self.entries.remove_if_same(key, &entry);
            entry.evict();
        }

        let section = entry.lock_section().await;

        // Another caller may have finished while we were waiting.
        match entry.try_read().await {
            Some(Ok(build)) => return Ok(build),
            Some(Err(CacheError::Unreadable(_))) | None => {}
            Some(Err(err)) => return Err(err),
        }

        entry.start_computing();

        let entries = self.entries.clone();
        let key = key.to_owned();
        let prefix = format!("{artifact}.{name}.");
        let task = async move {
            // The section stays held until the build is filed, even if the caller went away.
            let _section = section;
            metric!(counter("caches.computation") += 1, "cache" => &name);

            match builder().await {
                Ok(output) => {
                    let (build, discovered) = entry.complete(output);
                    if on_built(&entry, discovered.as_ref()) {
                        entry.spill(&prefix);
                    }
                    Ok(build)
                }
                Err(err) => {
                    metric!(counter("caches.build.failure") += 1, "cache" => &name);
                    tracing::debug!("Build of `{key}` in `{name}` failed: {err}");
                    entry.fail(err.clone());
                    entries.remove_if_same(&key, &entry);
                    Err(err)
                }
            }
        };

        // Running the build as its own task means a caller that stops waiting does not cancel
        // it, and the result still lands in the cache.
        match tokio::spawn(task).await {
            Ok(result) => result,
            Err(e) => Err(CacheError::from_std_error(e)),
        }
    }

    /// Files a restored entry. Used when rebuilding a persisted snapshot.
    pub(crate) fn restore(&self, artifact: &str, key: &str, persisted: PersistedEntry) {
        let PersistedEntry {
            spill_name,
            details,
        } = persisted;
        let entry = BuildEntry::restored(artifact.into(), self.files.clone(), &spill_name, details);
        self.entries.insert_if_absent(key, || Arc::new(entry));
    }

    /// Describes every spilled entry for persistence. In-memory entries are skipped.
    pub(crate) fn persisted_entries(&self) -> BTreeMap<String, PersistedEntry> {
        let mut persisted = BTreeMap::new();
        for (key, entry) in self.entries.entries() {
            let (Some(spill_name), Some(details)) = (entry.spill_name(), entry.details()) else {
                continue;
            };
            persisted.insert(
                key,
                PersistedEntry {
                    spill_name: spill_name.to_string(),
                    details: BuildDetails::clone(&details),
                },
            );
        }
        persisted
    }

    /// Evicts and removes every entry.
    ///
    /// The table is retired first. Spill files are left alone. The names of the files the
    /// entries referenced are returned, the owner of the table decides what happens to them.
    pub fn clear(&self) -> Vec<String> {
        self.retirement.retire();
        self.entries
            .drain()
            .into_iter()
            .filter_map(|entry| entry.evict())
            .map(|filename| filename.to_string())
            .collect()
    }

    /// Evicts and removes every entry, scheduling deletion of their spill files.
    pub fn delete_all(&self) {
        self.retirement.retire();
        for entry in self.entries.drain() {
            entry.delete();
        }
    }

    /// Writes a human readable description of all entries whose key matches `filter`.
    pub fn dump(&self, writer: &mut dyn Write, filter: Option<&Regex>) -> io::Result<()> {
        for (key, entry) in self.entries.entries() {
            if let Some(filter) = filter {
                if !filter.is_match(&key) {
                    continue;
                }
            }
            write!(writer, "{} key: {key}\n\tstatus: {}", self.name(), entry.status())?;
            if let Some(spill_name) = entry.spill_name() {
                write!(writer, "\n\tfile: {spill_name}")?;
            }
            writeln!(writer)?;
        }
        Ok(())
    }
}
