//! The build cache.
//!
//! A [`CacheManager`] owns the live [`CacheSnapshot`], which bundles one [`BuildTable`] per
//! cache domain. Each table maps cache keys to single-flight [`BuildEntry`]s whose content is
//! computed at most once and then spilled to the cache directory in the background.
//!
//! Whenever one of the inputs that affect every build changes (see [`ControlChange`]), the
//! manager swaps in a fresh, empty snapshot. A call that already obtained the previous snapshot
//! finishes against it.

mod cache_error;
mod cache_key;
mod cleanup;
mod control;
mod entry;
mod files;
mod manager;
pub mod persist;
pub mod snapshot;
mod table;

pub use cache_error::{CacheError, CacheResult, OpenError};
pub use cache_key::{Conditions, KeyGenerator, KeyGeneratorSet};
pub use cleanup::{CleanupStats, cleanup};
pub use control::{CacheControl, ChangeKind, ControlChange};
pub use entry::{BuildDetails, BuildEntry, BuildOutput, CachePayload, CachedBuild, EntryStatus};
pub use files::{CacheFiles, METADATA_FILENAME, SPILL_SUFFIX};
pub use manager::{CACHE_DIR, CacheManager};
pub use snapshot::CacheSnapshot;
pub use table::{BuildTable, NamedTable, Retirement};
