//! Cached module builds.
//!
//! Every module owns a table of builds, one per distinct cache key. The key space is described by
//! a [`KeyGeneratorSet`], which may start out provisional and gets refined by the conditions the
//! first build actually examined.

use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use async_trait::async_trait;
use regex::Regex;

use crate::caching::persist::PersistedModule;
use crate::caching::snapshot::MODULES;
use crate::caching::{
    BuildDetails, BuildEntry, BuildOutput, BuildTable, CacheError, CacheFiles, CacheManager,
    CacheResult, CacheSnapshot, Conditions, EntryStatus, KeyGeneratorSet, Retirement,
};

/// Access to the source of a module, used for staleness decisions.
pub trait ModuleSource: Send + Sync {
    fn module_id(&self) -> &str;

    fn exists(&self) -> bool;

    /// The modification time of the source, if known.
    fn last_modified(&self) -> Option<SystemTime>;
}

/// Turns a module source into its build output.
#[async_trait]
pub trait ModuleBuilder: Send + Sync + 'static {
    /// The generators used to key the first build of a module.
    ///
    /// These may be provisional when the builder only learns during building which conditions
    /// affect its output.
    fn key_generators(&self, module_id: &str) -> KeyGeneratorSet {
        let _ = module_id;
        KeyGeneratorSet::default()
    }

    /// Builds the module. The returned [`BuildOutput::discovered`] generators describe the
    /// conditions that were actually examined.
    async fn build(
        &self,
        module_id: &str,
        conditions: &Conditions,
    ) -> CacheResult<BuildOutput<String>>;
}

/// A finished module build handed to the layer assembly.
#[derive(Debug, Clone)]
pub struct ModuleBuildReader {
    pub module_id: Arc<str>,
    pub key: String,
    pub content: Arc<String>,
    pub details: Arc<BuildDetails>,
    pub key_generators: KeyGeneratorSet,
    pub from_cache: bool,
}

impl ModuleBuildReader {
    pub fn before(&self) -> &[String] {
        &self.details.before
    }

    pub fn after(&self) -> &[String] {
        &self.details.after
    }
}

struct ModuleState {
    last_modified: Option<SystemTime>,
    key_generators: Option<KeyGeneratorSet>,
    builds: BuildTable<String>,
}

/// The cached builds of one module.
pub struct ModuleRecord {
    module_id: Arc<str>,
    files: CacheFiles,
    retirement: Arc<Retirement>,
    state: Mutex<ModuleState>,
}

impl std::fmt::Debug for ModuleRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock_state();
        f.debug_struct("ModuleRecord")
            .field("module_id", &self.module_id)
            .field("last_modified", &state.last_modified)
            .field("key_generators", &state.key_generators)
            .field("builds", &state.builds)
            .finish()
    }
}

impl ModuleRecord {
    /// Creates an empty record. Its build tables are retired together with `snapshot`.
    pub fn new(module_id: &str, files: CacheFiles, snapshot: &Arc<Retirement>) -> Self {
        Self {
            module_id: module_id.into(),
            state: Mutex::new(ModuleState {
                last_modified: None,
                key_generators: None,
                builds: BuildTable::with_retirement(MODULES, files.clone(), snapshot.child()),
            }),
            files,
            retirement: Arc::clone(snapshot),
        }
    }

    pub(crate) fn restore(
        module_id: &str,
        files: CacheFiles,
        snapshot: &Arc<Retirement>,
        persisted: PersistedModule,
    ) -> Self {
        let record = Self::new(module_id, files, snapshot);
        {
            let mut state = record.lock_state();
            state.last_modified = persisted.last_modified;
            state.key_generators = persisted.key_generators;
            for (key, entry) in persisted.builds {
                state.builds.restore(module_id, &key, entry);
            }
        }
        record
    }

    pub(crate) fn to_persisted(&self) -> PersistedModule {
        let state = self.lock_state();
        PersistedModule {
            last_modified: state.last_modified,
            key_generators: state.key_generators.clone(),
            builds: state.builds.persisted_entries(),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ModuleState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn module_id(&self) -> &str {
        &self.module_id
    }

    /// The key generators currently in effect, if any build was ever started.
    pub fn key_generators(&self) -> Option<KeyGeneratorSet> {
        self.lock_state().key_generators.clone()
    }

    pub fn builds(&self) -> BuildTable<String> {
        self.lock_state().builds.clone()
    }

    /// Drops every build of a module whose source changed.
    ///
    /// Returns the table that has to be used from now on.
    fn refresh(
        &self,
        last_modified: Option<SystemTime>,
        initial: impl FnOnce() -> KeyGeneratorSet,
    ) -> (BuildTable<String>, KeyGeneratorSet) {
        let mut state = self.lock_state();
        if state.last_modified != last_modified {
            if !state.builds.entries().is_empty() {
                metric!(counter("caches.stale") += 1, "cache" => MODULES);
                tracing::debug!(
                    "Source of `{}` changed, discarding {} cached builds",
                    self.module_id,
                    state.builds.entries().len()
                );
            }
            let fresh =
                BuildTable::with_retirement(MODULES, self.files.clone(), self.retirement.child());
            let stale = std::mem::replace(&mut state.builds, fresh);
            stale.delete_all();
            state.key_generators = None;
            state.last_modified = last_modified;
        }
        let generators = state.key_generators.get_or_insert_with(initial).clone();
        (state.builds.clone(), generators)
    }

    /// Refines the key generators with the ones a build discovered and refiles the entry if
    /// its key changed.
    ///
    /// Returns whether `entry` should be spilled.
    fn rekey(
        &self,
        builds: &BuildTable<String>,
        entry: &Arc<BuildEntry<String>>,
        key: &str,
        conditions: &Conditions,
        discovered: &KeyGeneratorSet,
    ) -> bool {
        // The source changed while building, the whole table is gone.
        if entry.status() == EntryStatus::Evicted {
            return false;
        }

        let combined = {
            let mut state = self.lock_state();
            let current = state
                .key_generators
                .get_or_insert_with(|| discovered.clone());
            let combined = current.combine(discovered);
            if combined != *current {
                tracing::debug!(
                    old = %current,
                    new = %combined,
                    "Updating key generators of `{}`",
                    self.module_id
                );
                state.key_generators = Some(combined.clone());
            }
            combined
        };

        let new_key = combined.generate_key(conditions);
        if new_key == key {
            return true;
        }

        metric!(counter("caches.rekey") += 1, "cache" => MODULES);
        tracing::debug!("Moving build of `{}` from `{key}` to `{new_key}`", self.module_id);

        let (_, inserted) = builds.entries().insert_if_absent(&new_key, || entry.clone());
        builds.entries().remove_if_same(key, entry);
        if !inserted {
            tracing::trace!("`{new_key}` of `{}` was already built", self.module_id);
            // Only the entry filed under the new key may own a spill file.
            if entry.spill_name().is_some() {
                entry.delete();
            }
            return false;
        }
        true
    }

    /// Evicts all builds, returning the spill files they referenced.
    pub fn clear(&self) -> Vec<String> {
        self.lock_state().builds.clear()
    }

    pub fn dump(
        &self,
        module_id: &str,
        writer: &mut dyn Write,
        filter: Option<&Regex>,
    ) -> io::Result<()> {
        if let Some(filter) = filter {
            if !filter.is_match(module_id) {
                return Ok(());
            }
        }
        let (last_modified, key_generators, builds) = {
            let state = self.lock_state();
            (
                state.last_modified,
                state.key_generators.clone(),
                state.builds.clone(),
            )
        };
        writeln!(writer, "module: {module_id}")?;
        if let Some(last_modified) = last_modified {
            writeln!(
                writer,
                "\tmodified: {}",
                humantime::format_rfc3339_seconds(last_modified)
            )?;
        }
        if let Some(key_generators) = key_generators {
            writeln!(writer, "\tkey generators: {key_generators}")?;
        }
        builds.dump(writer, None)
    }
}

/// Builds a module using the builds cached in `snapshot`.
///
/// A module whose source is newer or older than the one its builds were made from has all its
/// builds discarded first. With `ignore_cached` the builder runs without touching the cache.
pub async fn get_build(
    snapshot: &CacheSnapshot,
    source: &dyn ModuleSource,
    builder: Arc<dyn ModuleBuilder>,
    conditions: &Conditions,
    ignore_cached: bool,
) -> CacheResult<ModuleBuildReader> {
    let module_id = source.module_id();
    if !source.exists() {
        return Err(CacheError::NotFound(module_id.to_owned()));
    }
    let last_modified = source.last_modified();

    if ignore_cached {
        let mut output = builder.build(module_id, conditions).await?;
        if output.source_modified.is_none() {
            output.source_modified = last_modified;
        }
        let key_generators = match output.discovered.take() {
            Some(discovered) => discovered,
            None => builder.key_generators(module_id),
        };
        return Ok(ModuleBuildReader {
            module_id: module_id.into(),
            key: key_generators.generate_key(conditions),
            content: Arc::new(output.payload),
            details: Arc::new(BuildDetails {
                before: output.before,
                after: output.after,
                source_modified: output.source_modified,
            }),
            key_generators,
            from_cache: false,
        });
    }

    let files = snapshot.files().clone();
    let (record, _) = snapshot.module_builds().insert_if_absent(module_id, || {
        Arc::new(ModuleRecord::new(module_id, files, snapshot.retirement()))
    });

    let (builds, generators) =
        record.refresh(last_modified, || builder.key_generators(module_id));
    let key = generators.generate_key(conditions);

    let build = {
        let builder = builder.clone();
        let module_id = module_id.to_owned();
        let conditions = conditions.clone();
        move || async move {
            let mut output = builder.build(&module_id, &conditions).await?;
            if output.source_modified.is_none() {
                output.source_modified = last_modified;
            }
            Ok(output)
        }
    };

    let on_built = {
        let record = record.clone();
        let builds = builds.clone();
        let key = key.clone();
        let conditions = conditions.clone();
        move |entry: &Arc<BuildEntry<String>>, discovered: Option<&KeyGeneratorSet>| {
            match discovered {
                Some(discovered) => record.rekey(&builds, entry, &key, &conditions, discovered),
                None => true,
            }
        }
    };

    let cached = builds
        .get_or_compute_with(module_id, &key, build, on_built)
        .await?;

    let key_generators = record.key_generators().unwrap_or(generators);
    Ok(ModuleBuildReader {
        module_id: module_id.into(),
        key: key_generators.generate_key(conditions),
        content: cached.content,
        details: cached.details,
        key_generators,
        from_cache: cached.from_cache,
    })
}

/// Module builds served from the current snapshot of a [`CacheManager`].
#[derive(Debug, Clone)]
pub struct ModuleBuilds {
    manager: Arc<CacheManager>,
    development_mode: bool,
}

impl ModuleBuilds {
    pub fn new(manager: Arc<CacheManager>, development_mode: bool) -> Self {
        Self {
            manager,
            development_mode,
        }
    }

    /// Returns the build of `source` for `conditions`.
    ///
    /// The whole call runs against the snapshot that was current when it started.
    /// `ignore_cached` is only honored in development mode.
    pub async fn get_build(
        &self,
        source: &dyn ModuleSource,
        builder: Arc<dyn ModuleBuilder>,
        conditions: &Conditions,
        ignore_cached: bool,
    ) -> CacheResult<ModuleBuildReader> {
        let snapshot = self.manager.current();
        let ignore_cached = ignore_cached && self.development_mode;
        get_build(&snapshot, source, builder, conditions, ignore_cached).await
    }
}
