use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use bytes::Bytes;
use dashmap::DashMap;
use regex::Regex;

use super::persist::{PERSIST_VERSION, PersistedSnapshot};
use super::{BuildTable, CacheControl, CacheFiles, NamedTable, Retirement};
use crate::modules::ModuleRecord;

/// Name of the table holding module builds.
pub const MODULES: &str = "modules";
/// Name of the table holding compressed resources.
pub const COMPRESSED: &str = "compressed";
/// Name of the table holding converted resources.
pub const CONVERTED: &str = "converted";

/// The complete set of cache tables that is current at one point in time.
///
/// A snapshot is never edited as a whole. Invalidation replaces it with a fresh one and
/// [`clear`](Self::clear)s the retired one.
#[derive(Debug)]
pub struct CacheSnapshot {
    created: SystemTime,
    files: CacheFiles,
    module_builds: NamedTable<Arc<ModuleRecord>>,
    compressed_builds: BuildTable<Bytes>,
    converted_resources: BuildTable<Bytes>,
    named: DashMap<String, BuildTable<Bytes>>,
    control: Mutex<CacheControl>,
    retirement: Arc<Retirement>,
}

impl CacheSnapshot {
    pub fn new(files: CacheFiles, control: CacheControl) -> Self {
        let retirement = Retirement::new();
        Self {
            created: SystemTime::now(),
            module_builds: NamedTable::new(MODULES),
            compressed_builds: BuildTable::with_retirement(
                COMPRESSED,
                files.clone(),
                retirement.child(),
            ),
            converted_resources: BuildTable::with_retirement(
                CONVERTED,
                files.clone(),
                retirement.child(),
            ),
            named: DashMap::new(),
            control: Mutex::new(control),
            files,
            retirement,
        }
    }

    /// Rebuilds a snapshot from persisted metadata.
    ///
    /// Spill files are not checked here. A file that has gone missing is detected on first read
    /// and recomputed.
    pub fn from_persisted(files: CacheFiles, persisted: PersistedSnapshot) -> Self {
        let PersistedSnapshot {
            created,
            control,
            modules,
            compressed,
            converted,
            named,
            ..
        } = persisted;

        let mut snapshot = Self::new(files, control);
        snapshot.created = created;

        for (module_id, module) in modules {
            let record = ModuleRecord::restore(
                &module_id,
                snapshot.files.clone(),
                &snapshot.retirement,
                module,
            );
            snapshot
                .module_builds
                .insert_if_absent(&module_id, || Arc::new(record));
        }
        for (key, entry) in compressed {
            snapshot
                .compressed_builds
                .restore(artifact_of(&key), &key, entry);
        }
        for (key, entry) in converted {
            snapshot
                .converted_resources
                .restore(artifact_of(&key), &key, entry);
        }
        for (name, entries) in named {
            let table = snapshot.table(&name);
            for (key, entry) in entries {
                table.restore(artifact_of(&key), &key, entry);
            }
        }
        snapshot
    }

    /// Describes the spilled content of this snapshot for the metadata file.
    pub fn to_persisted(&self) -> PersistedSnapshot {
        let modules = self
            .module_builds
            .entries()
            .into_iter()
            .map(|(module_id, record)| (module_id, record.to_persisted()))
            .collect();
        let named = self
            .named
            .iter()
            .map(|table| (table.key().clone(), table.value().persisted_entries()))
            .collect();

        PersistedSnapshot {
            version: PERSIST_VERSION,
            created: self.created,
            control: self.control(),
            modules,
            compressed: self.compressed_builds.persisted_entries(),
            converted: self.converted_resources.persisted_entries(),
            named,
        }
    }

    pub fn created(&self) -> SystemTime {
        self.created
    }

    pub fn files(&self) -> &CacheFiles {
        &self.files
    }

    pub fn module_builds(&self) -> &NamedTable<Arc<ModuleRecord>> {
        &self.module_builds
    }

    pub fn compressed_builds(&self) -> &BuildTable<Bytes> {
        &self.compressed_builds
    }

    pub fn converted_resources(&self) -> &BuildTable<Bytes> {
        &self.converted_resources
    }

    /// Returns the table called `name`, creating an empty one if it does not exist yet.
    ///
    /// A retired snapshot hands out fresh tables that are retired already.
    pub fn table(&self, name: &str) -> BuildTable<Bytes> {
        let create = || {
            BuildTable::with_retirement(name, self.files.clone(), self.retirement.child())
        };
        match name {
            COMPRESSED => self.compressed_builds.clone(),
            CONVERTED => self.converted_resources.clone(),
            _ if self.is_retired() => create(),
            _ => self
                .named
                .entry(name.to_owned())
                .or_insert_with(create)
                .clone(),
        }
    }

    pub fn is_retired(&self) -> bool {
        self.retirement.is_retired()
    }

    /// The retirement every table of this snapshot descends from.
    pub(crate) fn retirement(&self) -> &Arc<Retirement> {
        &self.retirement
    }

    /// A copy of the control record.
    pub fn control(&self) -> CacheControl {
        self.lock_control().clone()
    }

    pub(crate) fn lock_control(&self) -> MutexGuard<'_, CacheControl> {
        self.control.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Retires the snapshot: every entry is evicted and every table emptied.
    ///
    /// In-flight builds still complete for their callers, but their results are neither kept
    /// nor spilled. Returns the spill files the evicted entries referenced, which stay on disk
    /// until the caller deletes them.
    pub fn clear(&self) -> Vec<String> {
        self.retirement.retire();
        let mut spilled = Vec::new();
        for record in self.module_builds.drain() {
            spilled.extend(record.clear());
        }
        spilled.extend(self.compressed_builds.clear());
        spilled.extend(self.converted_resources.clear());
        for table in self.named.iter() {
            spilled.extend(table.clear());
        }
        self.named.clear();
        spilled
    }

    /// Writes a description of every entry whose key matches `filter`.
    pub fn dump(&self, writer: &mut dyn Write, filter: Option<&Regex>) -> io::Result<()> {
        let control = self.control();
        writeln!(
            writer,
            "snapshot created: {}",
            humantime::format_rfc3339_seconds(self.created)
        )?;
        writeln!(writer, "init stamp: {}", control.init_stamp)?;
        if let Some(version) = control.dependencies_version {
            writeln!(writer, "dependencies version: {version}")?;
        }

        for (module_id, record) in self.module_builds.entries() {
            record.dump(&module_id, writer, filter)?;
        }
        self.compressed_builds.dump(writer, filter)?;
        self.converted_resources.dump(writer, filter)?;

        let mut names: Vec<_> = self.named.iter().map(|table| table.key().clone()).collect();
        names.sort();
        for name in names {
            if let Some(table) = self.named.get(&name).map(|table| table.clone()) {
                table.dump(writer, filter)?;
            }
        }
        Ok(())
    }
}

/// The artifact part of a `<artifact>:<variant>` key.
fn artifact_of(key: &str) -> &str {
    key.rsplit_once(':').map_or(key, |(artifact, _)| artifact)
}
