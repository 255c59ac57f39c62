use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// An error attached to a single cache entry.
///
/// Every caller waiting on the same single-flight computation receives a clone of the very same
/// error, which is why this type is [`Clone`] and does not carry any non-cloneable sources.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The source artifact of the requested build does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// The builder callback failed.
    ///
    /// The failing entry is evicted from its table. The next request starts a fresh attempt.
    #[error("build failed: {0}")]
    BuildFailure(String),
    /// Content that was previously spilled to disk can no longer be read back.
    #[error("unreadable cache content: {0}")]
    Unreadable(String),
    /// An unexpected error in the cache itself.
    #[error("internal error")]
    InternalError,
}

impl From<io::Error> for CacheError {
    #[track_caller]
    fn from(err: io::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl From<serde_json::Error> for CacheError {
    #[track_caller]
    fn from(err: serde_json::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl CacheError {
    /// Creates a [`BuildFailure`](Self::BuildFailure) from anything printable.
    pub fn build_failure(err: impl std::fmt::Display) -> Self {
        Self::BuildFailure(err.to_string())
    }

    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }
}

/// The result of a cache lookup or computation.
pub type CacheResult<T> = Result<T, CacheError>;

/// Fatal errors while opening a [`CacheManager`](super::CacheManager).
#[derive(Debug, Error)]
pub enum OpenError {
    /// The cache directory does not exist and cannot be created.
    #[error("failed to create cache directory {}", path.display())]
    DirectoryCreation {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// Any other I/O error reading the persisted cache.
    #[error("failed to read persisted cache")]
    Io(#[from] io::Error),
}
