//! The on-disk metadata describing a snapshot.
//!
//! Only spilled entries are recorded. Entries still held in memory are simply rebuilt after a
//! restart.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use super::entry::BuildDetails;
use super::files::METADATA_FILENAME;
use super::{CacheControl, KeyGeneratorSet};

/// Bumped whenever the layout below changes incompatibly.
pub const PERSIST_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedSnapshot {
    pub version: u32,
    pub created: SystemTime,
    pub control: CacheControl,
    #[serde(default)]
    pub modules: BTreeMap<String, PersistedModule>,
    #[serde(default)]
    pub compressed: BTreeMap<String, PersistedEntry>,
    #[serde(default)]
    pub converted: BTreeMap<String, PersistedEntry>,
    #[serde(default)]
    pub named: BTreeMap<String, BTreeMap<String, PersistedEntry>>,
}

impl PersistedSnapshot {
    /// All spill files referenced by this metadata.
    pub fn spill_names(&self) -> Vec<&str> {
        let modules = self.modules.values().flat_map(|module| module.builds.values());
        let tables = self
            .compressed
            .values()
            .chain(self.converted.values())
            .chain(self.named.values().flat_map(|table| table.values()));
        modules
            .chain(tables)
            .map(|entry| entry.spill_name.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedModule {
    pub last_modified: Option<SystemTime>,
    pub key_generators: Option<KeyGeneratorSet>,
    #[serde(default)]
    pub builds: BTreeMap<String, PersistedEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedEntry {
    pub spill_name: String,
    #[serde(flatten)]
    pub details: BuildDetails,
}

/// Reads the metadata file from `cache_dir`.
///
/// A missing file, a file that cannot be parsed and a file of another version all yield `None`.
/// Other I/O errors are returned.
pub fn read_persisted(cache_dir: &Path) -> io::Result<Option<PersistedSnapshot>> {
    let path = cache_dir.join(METADATA_FILENAME);
    let file = match File::open(&path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    match serde_json::from_reader::<_, PersistedSnapshot>(BufReader::new(file)) {
        Ok(persisted) if persisted.version == PERSIST_VERSION => Ok(Some(persisted)),
        Ok(persisted) => {
            tracing::info!(
                version = persisted.version,
                "Ignoring persisted cache of incompatible version"
            );
            Ok(None)
        }
        Err(e) if e.is_io() => Err(e.into()),
        Err(e) => {
            tracing::info!(
                error = &e as &dyn std::error::Error,
                "Ignoring unreadable persisted cache"
            );
            Ok(None)
        }
    }
}

/// Atomically replaces the metadata file in `cache_dir`.
pub fn write_persisted(cache_dir: &Path, persisted: &PersistedSnapshot) -> io::Result<()> {
    let temp_file = tempfile::Builder::new()
        .prefix(".tmp")
        .tempfile_in(cache_dir)?;
    let mut writer = BufWriter::new(temp_file);
    serde_json::to_writer(&mut writer, persisted)?;
    writer.flush()?;
    let temp_file = writer.into_inner().map_err(|e| e.into_error())?;
    temp_file.as_file().sync_data()?;
    temp_file
        .persist(cache_dir.join(METADATA_FILENAME))
        .map_err(|e| e.error)?;
    Ok(())
}
