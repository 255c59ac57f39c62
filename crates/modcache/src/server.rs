use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use modcache_service::caching::{CacheManager, ControlChange};
use modcache_service::config::Config;
use modcache_service::metric;

/// Reports the raw text of the configuration file to the cache whenever it changes.
///
/// The first text read becomes the cache's baseline. Every later change carries a higher
/// sequence number than the one before.
#[derive(Debug)]
pub struct ConfigWatcher {
    path: PathBuf,
    sequence: u64,
    last: Option<String>,
}

impl ConfigWatcher {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            sequence: 0,
            last: None,
        }
    }

    /// Re-reads the configuration file and returns whether the cache was invalidated.
    pub async fn poll(&mut self, manager: &Arc<CacheManager>) -> Result<bool> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        if self.last.as_deref() == Some(text.as_str()) {
            return Ok(false);
        }

        self.sequence += 1;
        tracing::debug!(sequence = self.sequence, "Configuration file changed");
        let invalidated =
            manager.invalidate_if_changed(ControlChange::Config(text.clone()), self.sequence);
        self.last = Some(text);
        Ok(invalidated)
    }

    async fn run(mut self, manager: Arc<CacheManager>) {
        let mut ticker = tokio::time::interval(manager.config().config_poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = self.poll(&manager).await {
                tracing::warn!(error = ?e, "Failed to reload configuration");
            }
        }
    }
}

/// Hosts the cache until the process is interrupted.
pub fn run(config: Config, config_path: Option<PathBuf>) -> Result<()> {
    metric!(counter("server.starting") += 1);

    let megs = 1024 * 1024;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("modcache-io")
        .enable_all()
        .thread_stack_size(8 * megs)
        .build()?;

    runtime.block_on(async move {
        let manager = CacheManager::open(&config.work_dir, config.restart_stamp, &config.caches)
            .context("failed to open the cache")?;
        tracing::info!(
            cache_dir = %manager.files().cache_dir().display(),
            "Cache ready"
        );

        let watcher = config_path.map(|path| {
            tracing::info!("Watching {} for changes", path.display());
            tokio::spawn(ConfigWatcher::new(path).run(Arc::clone(&manager)))
        });

        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for shutdown signal")?;
        tracing::info!("Shutting down");

        if let Some(watcher) = watcher {
            watcher.abort();
        }
        manager.shutdown().await;
        Ok::<_, anyhow::Error>(())
    })?;

    tracing::info!("System shutdown complete");
    Ok(())
}
