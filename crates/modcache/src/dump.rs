use std::io::Write;

use anyhow::{Context, Result};
use modcache_service::caching::persist::read_persisted;
use modcache_service::caching::{CacheFiles, CacheSnapshot};
use modcache_service::config::Config;
use regex::Regex;

/// Writes the entries of the persisted cache whose key matches `filter`.
///
/// Only the metadata is loaded. Nothing is built and the cache directory is left untouched.
pub fn dump(config: &Config, filter: Option<&str>, writer: &mut dyn Write) -> Result<()> {
    let filter = filter
        .map(Regex::new)
        .transpose()
        .context("invalid filter")?;

    let cache_dir = config.cache_dir();
    let Some(persisted) = read_persisted(&cache_dir).context("failed to read cache metadata")?
    else {
        writeln!(writer, "no persisted cache in {}", cache_dir.display())?;
        return Ok(());
    };

    let files = CacheFiles::create(cache_dir, &config.caches)?;
    let snapshot = CacheSnapshot::from_persisted(files, persisted);
    snapshot.dump(writer, filter.as_ref())?;
    Ok(())
}
