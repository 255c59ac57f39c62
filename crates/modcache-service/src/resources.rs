//! Caches derived from plain resources: gzipped and converted variants.
//!
//! Both are instances of the same pattern. An entry is keyed `<resource>:<variant>` and remembers
//! the modification time of the resource it was made from, so a changed resource is noticed on
//! the next request.

use std::io::{self, Write};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use flate2::Compression;
use flate2::write::GzEncoder;

use crate::caching::{BuildOutput, BuildTable, CacheError, CacheManager, CacheResult, CachedBuild};

/// Platforms round modification times differently, so smaller differences are ignored.
const MTIME_TOLERANCE: Duration = Duration::from_secs(1);

/// A resource whose content can be cached in a derived form.
#[async_trait]
pub trait ResourceSource: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn last_modified(&self) -> Option<SystemTime>;

    async fn read(&self) -> io::Result<Bytes>;
}

/// Turns the content of a resource into another representation.
#[async_trait]
pub trait ResourceConverter: Send + Sync + 'static {
    /// Identifies the conversion in cache keys, e.g. `base64`.
    fn name(&self) -> &str;

    async fn convert(&self, resource: &str, contents: Bytes) -> CacheResult<Bytes>;
}

fn is_stale(built_from: Option<SystemTime>, current: Option<SystemTime>) -> bool {
    match (built_from, current) {
        (Some(built_from), Some(current)) => {
            let difference = built_from
                .duration_since(current)
                .or_else(|_| current.duration_since(built_from))
                .unwrap_or_default();
            difference > MTIME_TOLERANCE
        }
        (None, None) => false,
        _ => true,
    }
}

async fn read_source(source: &dyn ResourceSource) -> CacheResult<Bytes> {
    match source.read().await {
        Ok(contents) => Ok(contents),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            Err(CacheError::NotFound(source.name().to_owned()))
        }
        Err(e) => Err(e.into()),
    }
}

fn gzip(contents: &[u8]) -> io::Result<Bytes> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(contents.len() / 2), Compression::best());
    encoder.write_all(contents)?;
    Ok(Bytes::from(encoder.finish()?))
}

/// Looks up `key`, first discarding the entry if it was built from another version of the
/// resource.
async fn get_fresh<F, Fut>(
    table: &BuildTable<Bytes>,
    artifact: &str,
    key: &str,
    modified: Option<SystemTime>,
    builder: F,
) -> CacheResult<CachedBuild<Bytes>>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = CacheResult<BuildOutput<Bytes>>> + Send + 'static,
{
    if let Some(entry) = table.entries().get(key) {
        let stale = entry
            .details()
            .is_some_and(|details| is_stale(details.source_modified, modified));
        if stale && table.entries().remove_if_same(key, &entry) {
            metric!(counter("caches.stale") += 1, "cache" => table.name());
            tracing::debug!("`{artifact}` changed, discarding `{key}`");
            entry.delete();
        }
    }
    table
        .get_or_compute_with(artifact, key, builder, |_, _| true)
        .await
}

/// Returns the gzipped content of `source`, keyed `<name>:gzip`.
pub async fn compressed(
    table: &BuildTable<Bytes>,
    source: Arc<dyn ResourceSource>,
) -> CacheResult<CachedBuild<Bytes>> {
    let name = source.name().to_owned();
    let key = format!("{name}:gzip");
    let modified = source.last_modified();

    let build = move || async move {
        let contents = read_source(source.as_ref()).await?;
        let compressed = tokio::task::spawn_blocking(move || gzip(&contents))
            .await
            .map_err(CacheError::from_std_error)??;
        let mut output = BuildOutput::new(compressed);
        output.source_modified = modified;
        Ok(output)
    };
    get_fresh(table, &name, &key, modified, build).await
}

/// Returns `source` converted by `converter`, keyed `<name>:<converter>`.
pub async fn converted(
    table: &BuildTable<Bytes>,
    source: Arc<dyn ResourceSource>,
    converter: Arc<dyn ResourceConverter>,
) -> CacheResult<CachedBuild<Bytes>> {
    let name = source.name().to_owned();
    let key = format!("{name}:{}", converter.name());
    let modified = source.last_modified();

    let build = {
        let name = name.clone();
        move || async move {
            let contents = read_source(source.as_ref()).await?;
            let converted = converter.convert(&name, contents).await?;
            let mut output = BuildOutput::new(converted);
            output.source_modified = modified;
            Ok(output)
        }
    };
    get_fresh(table, &name, &key, modified, build).await
}

/// Derived resource caches served from the current snapshot of a [`CacheManager`].
#[derive(Debug, Clone)]
pub struct ResourceCaches {
    manager: Arc<CacheManager>,
}

impl ResourceCaches {
    pub fn new(manager: Arc<CacheManager>) -> Self {
        Self { manager }
    }

    pub async fn compressed(
        &self,
        source: Arc<dyn ResourceSource>,
    ) -> CacheResult<CachedBuild<Bytes>> {
        let snapshot = self.manager.current();
        compressed(snapshot.compressed_builds(), source).await
    }

    pub async fn converted(
        &self,
        source: Arc<dyn ResourceSource>,
        converter: Arc<dyn ResourceConverter>,
    ) -> CacheResult<CachedBuild<Bytes>> {
        let snapshot = self.manager.current();
        converted(snapshot.converted_resources(), source, converter).await
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::sync::Mutex;

    use flate2::read::GzDecoder;

    use super::*;
    use crate::caching::CacheFiles;
    use crate::config::CacheConfig;

    struct Resource {
        contents: &'static [u8],
        modified: Mutex<Option<SystemTime>>,
    }

    #[async_trait]
    impl ResourceSource for Resource {
        fn name(&self) -> &str {
            "css/main.css"
        }

        fn last_modified(&self) -> Option<SystemTime> {
            *self.modified.lock().unwrap()
        }

        async fn read(&self) -> io::Result<Bytes> {
            Ok(Bytes::from_static(self.contents))
        }
    }

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

    fn table(dir: &std::path::Path, name: &str) -> BuildTable<Bytes> {
        let files = CacheFiles::create(dir.into(), &CacheConfig::default()).unwrap();
        BuildTable::new(name, files)
    }

    #[test]
    fn test_is_stale() {
        let t = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        assert!(!is_stale(Some(t), Some(t + Duration::from_millis(999))));
        assert!(!is_stale(Some(t + Duration::from_millis(999)), Some(t)));
        assert!(is_stale(Some(t), Some(t + Duration::from_secs(2))));
        assert!(is_stale(None, Some(t)));
        assert!(!is_stale(None, None));
    }

    #[tokio::test]
    async fn test_compressed() {
        let tempdir = tempfile::tempdir().unwrap();
        let table = table(tempdir.path(), "compressed");
        let t = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        let resource = Arc::new(Resource {
            contents: b"body { color: red }",
            modified: Mutex::new(Some(t)),
        });

        let build = compressed(&table, resource.clone()).await.unwrap();
        let mut decoded = String::new();
        GzDecoder::new(&build.content[..])
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, "body { color: red }");
        assert_eq!(table.entries().keys(), vec!["css/main.css:gzip".to_owned()]);

        let build = compressed(&table, resource.clone()).await.unwrap();
        assert!(build.from_cache);

        *resource.modified.lock().unwrap() = Some(t + Duration::from_secs(5));
        let build = compressed(&table, resource.clone()).await.unwrap();
        assert!(!build.from_cache);
        assert_eq!(
            build.details.source_modified,
            Some(t + Duration::from_secs(5))
        );
    }

    #[tokio::test]
    async fn test_converted() {
        let tempdir = tempfile::tempdir().unwrap();
        let table = table(tempdir.path(), "converted");
        let resource = Arc::new(Resource {
            contents: b"abc",
            modified: Mutex::new(None),
        });

        let build = converted(&table, resource, Arc::new(Upper)).await.unwrap();
        assert_eq!(build.content.as_ref(), &Bytes::from_static(b"ABC"));
        assert_eq!(table.entries().keys(), vec!["css/main.css:upper".to_owned()]);
    }
}
