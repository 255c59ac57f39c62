use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::Path;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};

use super::files::{METADATA_FILENAME, SPILL_SUFFIX};
use super::persist::read_persisted;
use crate::config::Config;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupStats {
    pub removed_files: usize,
    pub removed_bytes: u64,

    pub retained_files: usize,
    pub retained_bytes: u64,
}

/// Entry function for the cleanup command.
///
/// Deletes the cache files the persisted metadata does not reference, and temp files older
/// than the configured delete delay. If `dry_run` is `true`, no files will actually be deleted.
///
/// An unreferenced cache file is only deleted if it was written at least the delete delay
/// before the metadata was. Spills a running process made since its last persist are kept.
pub fn cleanup(config: &Config, dry_run: bool) -> Result<CleanupStats> {
    let cache_dir = config.cache_dir();
    tracing::info!("Cleaning up cache in {}", cache_dir.display());

    let stats = cleanup_directory(&cache_dir, config.caches.delete_delay, dry_run)
        .with_context(|| format!("failed to clean up {}", cache_dir.display()))?;

    tracing::info!(
        "Retained {} files, totaling {} bytes",
        stats.retained_files,
        stats.retained_bytes,
    );
    tracing::info!(
        "Removed {} files, totaling {} bytes",
        stats.removed_files,
        stats.removed_bytes
    );
    metric!(gauge("caches.size.files") = stats.retained_files as u64);
    metric!(gauge("caches.size.bytes") = stats.retained_bytes);
    Ok(stats)
}

/// When a file was last placed in the cache directory.
///
/// Spill files carry the modification time of their source, so the status change time is used.
#[cfg(unix)]
fn written_at(metadata: &fs::Metadata) -> Option<SystemTime> {
    use std::os::unix::fs::MetadataExt;

    let secs = u64::try_from(metadata.ctime()).ok()?;
    let nanos = u32::try_from(metadata.ctime_nsec()).ok()?;
    Some(SystemTime::UNIX_EPOCH + Duration::new(secs, nanos))
}

#[cfg(not(unix))]
fn written_at(metadata: &fs::Metadata) -> Option<SystemTime> {
    metadata.created().ok()
}

/// How long before `reference` the file was written. `None` if it is newer or unknown.
fn written_before(metadata: &fs::Metadata, reference: SystemTime) -> Option<Duration> {
    reference.duration_since(written_at(metadata)?).ok()
}

fn cleanup_directory(
    cache_dir: &Path,
    min_age: Duration,
    dry_run: bool,
) -> io::Result<CleanupStats> {
    let mut stats = CleanupStats::default();
    if !cache_dir.exists() {
        return Ok(stats);
    }

    let referenced: BTreeSet<String> = match read_persisted(cache_dir)? {
        Some(persisted) => persisted
            .spill_names()
            .into_iter()
            .map(str::to_owned)
            .collect(),
        None => BTreeSet::new(),
    };
    let persisted_at = fs::metadata(cache_dir.join(METADATA_FILENAME))
        .and_then(|metadata| metadata.modified())
        .unwrap_or_else(|_| SystemTime::now());

    for entry in fs::read_dir(cache_dir)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if !metadata.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == METADATA_FILENAME {
            continue;
        }

        let orphaned = if name.ends_with(SPILL_SUFFIX) {
            !referenced.contains(&name)
                && written_before(&metadata, persisted_at).is_some_and(|age| age >= min_age)
        } else if name.starts_with(".tmp") {
            // a young temp file may still be written to
            let age = metadata
                .modified()
                .ok()
                .map(|modified| SystemTime::now().duration_since(modified).unwrap_or_default());
            age.is_some_and(|age| age >= min_age)
        } else {
            false
        };

        if !orphaned {
            stats.retained_files += 1;
            stats.retained_bytes += metadata.len();
            continue;
        }

        tracing::debug!("Removing orphaned cache file {name}");
        stats.removed_files += 1;
        stats.removed_bytes += metadata.len();
        if !dry_run {
            if let Err(e) = fs::remove_file(entry.path()) {
                if e.kind() != io::ErrorKind::NotFound {
                    return Err(e);
                }
            }
        }
    }
    Ok(stats)
}
