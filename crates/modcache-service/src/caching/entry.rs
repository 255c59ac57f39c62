use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::SystemTime;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{CacheError, CacheFiles, CacheResult, KeyGeneratorSet};

/// A build result that can be spilled to and read back from the cache directory.
pub trait CachePayload: Send + Sync + 'static + Sized {
    /// Serializes the payload for spilling.
    fn to_spill(&self) -> Bytes;

    /// Restores a payload from spilled bytes.
    fn from_spill(bytes: Bytes) -> CacheResult<Self>;
}

impl CachePayload for Bytes {
    fn to_spill(&self) -> Bytes {
        self.clone()
    }

    fn from_spill(bytes: Bytes) -> CacheResult<Self> {
        Ok(bytes)
    }
}

impl CachePayload for String {
    fn to_spill(&self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }

    fn from_spill(bytes: Bytes) -> CacheResult<Self> {
        String::from_utf8(bytes.to_vec()).map_err(|e| CacheError::Unreadable(e.to_string()))
    }
}

/// What a builder callback produces.
#[derive(Debug, Clone)]
pub struct BuildOutput<T> {
    pub payload: T,
    /// Artifacts that must be emitted right before this one.
    pub before: Vec<String>,
    /// Artifacts that must be emitted right after this one.
    pub after: Vec<String>,
    /// The key generators describing the conditions the build actually examined.
    pub discovered: Option<KeyGeneratorSet>,
    /// The modification time of the source the build was made from.
    pub source_modified: Option<SystemTime>,
}

impl<T> BuildOutput<T> {
    pub fn new(payload: T) -> Self {
        Self {
            payload,
            before: Vec::new(),
            after: Vec::new(),
            discovered: None,
            source_modified: None,
        }
    }

    pub fn with_before(mut self, before: Vec<String>) -> Self {
        self.before = before;
        self
    }

    pub fn with_after(mut self, after: Vec<String>) -> Self {
        self.after = after;
        self
    }

    pub fn with_discovered(mut self, discovered: KeyGeneratorSet) -> Self {
        self.discovered = Some(discovered);
        self
    }

    pub fn with_source_modified(mut self, modified: SystemTime) -> Self {
        self.source_modified = Some(modified);
        self
    }
}

/// Everything about a finished build besides the payload itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildDetails {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub before: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub after: Vec<String>,
    #[serde(default)]
    pub source_modified: Option<SystemTime>,
}

/// A readable build, either straight from memory or read back from its spill file.
#[derive(Debug, Clone)]
pub struct CachedBuild<T> {
    pub content: Arc<T>,
    pub details: Arc<BuildDetails>,
    /// `false` if this very call ran the builder.
    pub from_cache: bool,
}

/// The observable state of a [`BuildEntry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Empty,
    Computing,
    InMemory,
    Spilled,
    Failed,
    Evicted,
}

impl EntryStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::InMemory | Self::Spilled)
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Empty => "empty",
            Self::Computing => "computing",
            Self::InMemory => "in-memory",
            Self::Spilled => "spilled",
            Self::Failed => "failed",
            Self::Evicted => "evicted",
        })
    }
}

enum EntryState<T> {
    Empty,
    Computing,
    InMemory {
        payload: Arc<T>,
        details: Arc<BuildDetails>,
    },
    Spilled {
        filename: Arc<str>,
        details: Arc<BuildDetails>,
    },
    Failed(CacheError),
}

/// The state of an entry together with whether it was removed from its table.
///
/// An evicted entry keeps its last state, so callers still holding it can read a build that
/// finished after the eviction. It is never spilled again.
struct Slot<T> {
    state: EntryState<T>,
    evicted: bool,
}

impl<T> Slot<T> {
    fn status(&self) -> EntryStatus {
        if self.evicted {
            return EntryStatus::Evicted;
        }
        match self.state {
            EntryState::Empty => EntryStatus::Empty,
            EntryState::Computing => EntryStatus::Computing,
            EntryState::InMemory { .. } => EntryStatus::InMemory,
            EntryState::Spilled { .. } => EntryStatus::Spilled,
            EntryState::Failed(_) => EntryStatus::Failed,
        }
    }
}

/// The single-flight, disk-spillable unit of caching for one `(artifact, key)` pair.
///
/// The state moves `Empty -> Computing -> InMemory -> Spilled`, or ends in `Failed`. Retired
/// or superseded entries are additionally marked `Evicted`. Every transition happens atomically
/// under the state lock, which is only ever held for the duration of a field swap, so a reader
/// always sees either the in-memory payload or the spill file name once the entry is ready.
///
/// Building is serialized by a separate per-entry section, so different entries never contend.
pub struct BuildEntry<T> {
    name: Arc<str>,
    slot: RwLock<Slot<T>>,
    section: Arc<Mutex<()>>,
    files: CacheFiles,
}

impl<T: CachePayload> fmt::Debug for BuildEntry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildEntry")
            .field("name", &self.name)
            .field("status", &self.status())
            .field("spill_name", &self.spill_name())
            .finish()
    }
}

impl<T: CachePayload> BuildEntry<T> {
    pub fn new(name: Arc<str>, files: CacheFiles) -> Self {
        Self::with_state(name, files, EntryState::Empty)
    }

    /// Recreates an entry whose content was spilled by a previous process.
    pub fn restored(
        name: Arc<str>,
        files: CacheFiles,
        filename: &str,
        details: BuildDetails,
    ) -> Self {
        let state = EntryState::Spilled {
            filename: filename.into(),
            details: Arc::new(details),
        };
        Self::with_state(name, files, state)
    }

    fn with_state(name: Arc<str>, files: CacheFiles, state: EntryState<T>) -> Self {
        Self {
            name,
            slot: RwLock::new(Slot {
                state,
                evicted: false,
            }),
            section: Arc::new(Mutex::new(())),
            files,
        }
    }

    fn read_slot(&self) -> RwLockReadGuard<'_, Slot<T>> {
        self.slot.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_slot(&self) -> RwLockWriteGuard<'_, Slot<T>> {
        self.slot.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> EntryStatus {
        self.read_slot().status()
    }

    /// The spill file name, once the content lives on disk only.
    ///
    /// An evicted entry no longer owns its file and reports none.
    pub fn spill_name(&self) -> Option<Arc<str>> {
        match &*self.read_slot() {
            Slot {
                state: EntryState::Spilled { filename, .. },
                evicted: false,
            } => Some(filename.clone()),
            _ => None,
        }
    }

    pub fn details(&self) -> Option<Arc<BuildDetails>> {
        match &self.read_slot().state {
            EntryState::InMemory { details, .. } | EntryState::Spilled { details, .. } => {
                Some(details.clone())
            }
            _ => None,
        }
    }

    /// Returns the content if the entry is ready or the recorded failure.
    ///
    /// Returns `None` while the entry is not computed yet. A spilled file that cannot be read
    /// back yields [`CacheError::Unreadable`], which callers treat as a miss. Evicted entries
    /// stay readable for as long as someone holds them.
    pub async fn try_read(&self) -> Option<CacheResult<CachedBuild<T>>> {
        let (filename, details) = match &self.read_slot().state {
            EntryState::InMemory { payload, details } => {
                return Some(Ok(CachedBuild {
                    content: payload.clone(),
                    details: details.clone(),
                    from_cache: true,
                }));
            }
            EntryState::Spilled { filename, details } => (filename.clone(), details.clone()),
            EntryState::Failed(err) => return Some(Err(err.clone())),
            EntryState::Empty | EntryState::Computing => return None,
        };

        // The state lock is released here, reading the file does not block anyone.
        let result = match self.files.read(&filename).await {
            Ok(bytes) => T::from_spill(bytes).map(|payload| CachedBuild {
                content: Arc::new(payload),
                details,
                from_cache: true,
            }),
            Err(e) => {
                tracing::debug!(
                    error = &e as &dyn std::error::Error,
                    "Spilled content of `{}` vanished",
                    self.name
                );
                Err(CacheError::Unreadable(format!("{filename}: {e}")))
            }
        };
        if result.is_ok() {
            metric!(counter("caches.file.hit") += 1);
        }
        Some(result)
    }

    /// Enters the exclusive build section of this entry.
    pub(crate) async fn lock_section(&self) -> OwnedMutexGuard<()> {
        self.section.clone().lock_owned().await
    }

    pub(crate) fn start_computing(&self) {
        self.write_slot().state = EntryState::Computing;
    }

    /// Stores a successful build in memory.
    ///
    /// An entry that was evicted while building stays evicted. The build is kept anyway, so
    /// callers already waiting on the section receive it instead of building again.
    pub(crate) fn complete(
        &self,
        output: BuildOutput<T>,
    ) -> (CachedBuild<T>, Option<KeyGeneratorSet>) {
        let BuildOutput {
            payload,
            before,
            after,
            discovered,
            source_modified,
        } = output;
        let payload = Arc::new(payload);
        let details = Arc::new(BuildDetails {
            before,
            after,
            source_modified,
        });

        self.write_slot().state = EntryState::InMemory {
            payload: payload.clone(),
            details: details.clone(),
        };

        let build = CachedBuild {
            content: payload,
            details,
            from_cache: false,
        };
        (build, discovered)
    }

    /// Records a build failure. The failure is terminal for this entry.
    pub(crate) fn fail(&self, err: CacheError) {
        self.write_slot().state = EntryState::Failed(err);
    }

    /// Asynchronously spills the in-memory payload.
    ///
    /// Once the file is written the payload is swapped for the file name in one step. If the
    /// entry was evicted meanwhile, the freshly written file is deleted right away.
    pub(crate) fn spill(self: &Arc<Self>, prefix: &str) {
        let (contents, modified) = match &*self.read_slot() {
            Slot {
                state: EntryState::InMemory { payload, details },
                evicted: false,
            } => (payload.to_spill(), details.source_modified),
            _ => return,
        };

        let this = Arc::clone(self);
        self.files
            .submit_spill(prefix, contents, modified, move |result| match result {
                Ok(filename) => {
                    let mut slot = this.write_slot();
                    match &slot.state {
                        EntryState::InMemory { details, .. } if !slot.evicted => {
                            let details = details.clone();
                            slot.state = EntryState::Spilled {
                                filename: filename.as_str().into(),
                                details,
                            };
                            metric!(counter("caches.file.write") += 1);
                        }
                        _ => {
                            drop(slot);
                            tracing::trace!("Dropping spill of retired entry `{}`", this.name);
                            this.files.delete_now(&filename);
                        }
                    }
                }
                Err(e) => {
                    // The entry stays valid, it just never leaves memory.
                    metric!(counter("caches.spill.failure") += 1);
                    tracing::error!(
                        error = &e as &dyn std::error::Error,
                        "Failed to spill `{}`",
                        this.name
                    );
                }
            });
    }

    /// Evicts the entry. The payload is released once the last holder drops the entry.
    ///
    /// Returns the spill file name the entry referenced, if any. Only the first eviction
    /// hands it out.
    pub fn evict(&self) -> Option<Arc<str>> {
        let mut slot = self.write_slot();
        if std::mem::replace(&mut slot.evicted, true) {
            return None;
        }
        match &slot.state {
            EntryState::Spilled { filename, .. } => Some(filename.clone()),
            _ => None,
        }
    }

    /// Evicts the entry and deletes its spill file after the configured grace delay.
    pub fn delete(&self) {
        if let Some(filename) = self.evict() {
            self.files
                .delete_delayed(&filename, self.files.delete_delay());
        }
    }
}
