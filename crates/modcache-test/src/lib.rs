//! Helpers for testing the build cache.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. Spills and delayed deletes keep running in the background and
//!    will fail noisily once the directory is gone.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

use modcache_service::caching::{
    BuildEntry, BuildOutput, CachePayload, CacheError, CacheResult, Conditions, EntryStatus,
    KeyGenerator, KeyGeneratorSet,
};
use modcache_service::config::CacheConfig;
use modcache_service::modules::{ModuleBuilder, ModuleSource};
use modcache_service::resources::ResourceSource;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the cache crates and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("modcache_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// A cache config with short delays, suitable for tests.
pub fn cache_config() -> CacheConfig {
    CacheConfig {
        delete_delay: Duration::from_millis(20),
        ..Default::default()
    }
}

/// Polls `entry` until its content lives on disk.
///
/// # Panics
///
/// Panics if the entry is not spilled within a second.
pub async fn wait_for_spill<T: CachePayload>(entry: &BuildEntry<T>) {
    for _ in 0..200 {
        if entry.status() == EntryStatus::Spilled {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("`{}` was never spilled", entry.name());
}

/// The future returned by [`slow_builder`].
pub type BoxedBuild = Pin<Box<dyn Future<Output = CacheResult<BuildOutput<Bytes>>> + Send>>;

/// A builder for the plain byte tables that sleeps, counts its invocations and returns `output`.
pub fn slow_builder(
    calls: Arc<AtomicUsize>,
    delay: Duration,
    output: &'static [u8],
) -> impl FnOnce() -> BoxedBuild + Send + 'static {
    move || {
        Box::pin(async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            Ok(BuildOutput::new(Bytes::from_static(output)))
        })
    }
}

/// A resource with fixed contents that counts how often it was read.
#[derive(Debug)]
pub struct FakeResource {
    name: String,
    contents: Bytes,
    modified: Mutex<Option<SystemTime>>,
    reads: AtomicUsize,
}

impl FakeResource {
    pub fn new(name: &str, contents: &'static [u8]) -> Self {
        Self {
            name: name.to_owned(),
            contents: Bytes::from_static(contents),
            modified: Mutex::new(Some(SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000))),
            reads: AtomicUsize::new(0),
        }
    }

    /// Moves the modification time forward by `by`.
    pub fn touch(&self, by: Duration) {
        let mut modified = self.modified.lock().unwrap();
        *modified = modified.map(|modified| modified + by);
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResourceSource for FakeResource {
    fn name(&self) -> &str {
        &self.name
    }

    fn last_modified(&self) -> Option<SystemTime> {
        *self.modified.lock().unwrap()
    }

    async fn read(&self) -> io::Result<Bytes> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.contents.clone())
    }
}

/// A module source whose modification time can be changed while a test runs.
#[derive(Debug)]
pub struct FakeModule {
    module_id: String,
    modified: Mutex<Option<SystemTime>>,
    exists: Mutex<bool>,
}

impl FakeModule {
    pub fn new(module_id: &str) -> Self {
        Self {
            module_id: module_id.to_owned(),
            modified: Mutex::new(Some(SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000))),
            exists: Mutex::new(true),
        }
    }

    /// Moves the modification time forward by `by`.
    pub fn touch(&self, by: Duration) {
        let mut modified = self.modified.lock().unwrap();
        *modified = modified.map(|modified| modified + by);
    }

    pub fn delete(&self) {
        *self.exists.lock().unwrap() = false;
    }
}

impl ModuleSource for FakeModule {
    fn module_id(&self) -> &str {
        &self.module_id
    }

    fn exists(&self) -> bool {
        *self.exists.lock().unwrap()
    }

    fn last_modified(&self) -> Option<SystemTime> {
        *self.modified.lock().unwrap()
    }
}

/// A module builder that counts its invocations.
///
/// The output names the requested values of the features the builder is told to examine.
#[derive(Debug, Default)]
pub struct CountingBuilder {
    calls: AtomicUsize,
    delay: Duration,
    examines: Option<Vec<String>>,
    fail_with: Option<String>,
}

impl CountingBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every build take `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Starts out with a provisional generator and reports `features` as examined.
    pub fn examining(mut self, features: &[&str]) -> Self {
        self.examines = Some(features.iter().map(|f| f.to_string()).collect());
        self
    }

    /// Makes every build fail.
    pub fn failing(mut self, message: &str) -> Self {
        self.fail_with = Some(message.to_owned());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModuleBuilder for CountingBuilder {
    fn key_generators(&self, _module_id: &str) -> KeyGeneratorSet {
        match self.examines {
            Some(_) => vec![KeyGenerator::FeatureSet {
                features: None,
                provisional: true,
            }]
            .into(),
            None => KeyGeneratorSet::default(),
        }
    }

    async fn build(
        &self,
        module_id: &str,
        conditions: &Conditions,
    ) -> CacheResult<BuildOutput<String>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(message) = &self.fail_with {
            return Err(CacheError::build_failure(message));
        }

        let mut payload = format!("{module_id}#{call}");
        let mut output = match &self.examines {
            Some(features) => {
                for feature in features {
                    let value = conditions.feature(feature).unwrap_or(false);
                    payload.push_str(&format!(" {feature}={value}"));
                }
                BuildOutput::new(payload).with_discovered(
                    vec![KeyGenerator::features(features.iter().cloned(), false)].into(),
                )
            }
            None => BuildOutput::new(payload),
        };
        output.after = vec![format!("{module_id}.css")];
        Ok(output)
    }
}
