//! Exposes the command line application.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use modcache_service::caching;
use modcache_service::config::Config;
use modcache_service::metrics;

use crate::{dump, logging, server};

/// Modcache commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Host the build cache until interrupted.
    Run,

    /// Delete cache files that the persisted metadata does not reference.
    ///
    /// Files written since the last metadata write are kept, so this is safe next to `run`.
    Cleanup {
        /// Only report what would be deleted.
        #[arg(long)]
        dry_run: bool,
    },

    /// Print the persisted cache entries.
    Dump {
        /// Only print entries whose key matches this regular expression.
        #[arg(long, short, value_name = "REGEX")]
        filter: Option<String>,
    },
}

/// Command line interface parser.
#[derive(Parser, Debug)]
#[command(name = "modcache", version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: Nothing else runs yet, the runtime is only started by the commands below.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        let mut tags = config.metrics.custom_tags.clone();
        if let Some(tag) = config.metrics.hostname_tag.clone() {
            if let Some(hostname) = hostname::get().ok().and_then(|s| s.into_string().ok()) {
                tags.insert(tag, hostname);
            }
        }
        metrics::configure_statsd(&config.metrics.prefix, statsd, tags)
            .context("failed to configure statsd")?;
    }

    match cli.command {
        Command::Run => {
            server::run(config, cli.config.clone()).context("failed to run the cache")?
        }
        Command::Cleanup { dry_run } => {
            caching::cleanup(&config, dry_run).context("failed to clean up caches")?;
        }
        Command::Dump { filter } => {
            let stdout = std::io::stdout();
            dump::dump(&config, filter.as_deref(), &mut stdout.lock())
                .context("failed to dump the cache")?
        }
    }

    Ok(())
}
