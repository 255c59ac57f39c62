use std::env;

use modcache_service::config::{Config, LogFormat};
use modcache_service::logging::{default_filter, init_json_logging};
use sentry::integrations::tracing::{EventFilter, SentryLayer};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;

/// How log lines end up on the console.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Output {
    Pretty,
    Compact,
    Json,
}

/// `Auto` renders for humans on a terminal and compact lines everywhere else.
fn output_for(format: LogFormat, attended: bool) -> Output {
    match (format, attended) {
        (LogFormat::Auto, true) | (LogFormat::Pretty, _) => Output::Pretty,
        (LogFormat::Auto, false) | (LogFormat::Simplified, _) => Output::Compact,
        (LogFormat::Json, _) => Output::Json,
    }
}

/// Errors become Sentry events, everything down to `INFO` is kept as breadcrumb.
fn sentry_layer<S>() -> SentryLayer<S>
where
    S: tracing::Subscriber + for<'span> LookupSpan<'span>,
{
    sentry::integrations::tracing::layer().event_filter(|md| match *md.level() {
        tracing::Level::ERROR => EventFilter::Event | EventFilter::Log,
        tracing::Level::WARN | tracing::Level::INFO => EventFilter::Log,
        tracing::Level::DEBUG | tracing::Level::TRACE => EventFilter::Ignore,
    })
}

/// Installs the global log subscriber.
///
/// `RUST_LOG` wins over the configured level. With
/// [`enable_backtraces`](modcache_service::config::Logging::enable_backtraces) set,
/// `RUST_BACKTRACE` is turned on as well.
///
/// # Safety
/// This function uses [`std::env::set_var`], which may only be called while no other thread
/// reads or writes the environment.
pub unsafe fn init_logging(config: &Config) {
    if config.logging.enable_backtraces {
        // SAFETY: Upheld by the caller.
        unsafe { env::set_var("RUST_BACKTRACE", "1") };
    }

    let filter =
        env::var("RUST_LOG").unwrap_or_else(|_| default_filter(config.logging.level).to_owned());

    let layer = tracing_subscriber::fmt::layer()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true);
    let console = match output_for(config.logging.format, console::user_attended()) {
        Output::Pretty => layer.pretty().boxed(),
        Output::Compact => layer.compact().with_ansi(false).boxed(),
        Output::Json => return init_json_logging(&filter, std::io::stdout),
    };

    tracing_subscriber::registry()
        .with(console.with_filter(EnvFilter::new(&filter)))
        .with(sentry_layer())
        .init();
}

/// Reports a fatal error through the logger, or on `stderr` if errors would not be logged.
pub fn ensure_log_error(error: &anyhow::Error) {
    let logged = tracing::Level::ERROR <= tracing::level_filters::STATIC_MAX_LEVEL
        && tracing::Level::ERROR <= LevelFilter::current();
    if logged {
        tracing::error!("{error:?}");
    } else {
        eprintln!("{error:?}");
    }
}
