//! Modcache.
//!
//! Modcache keeps the results of expensive module builds, compressed resources and converted
//! resources across requests and restarts. The `run` command hosts the cache and follows changes
//! to its configuration file, while `dump` and `cleanup` inspect and sweep a cache directory.

#![warn(
    missing_docs,
    missing_debug_implementations,
    unused_crate_dependencies,
    clippy::all
)]

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

mod cli;
mod dump;
mod logging;
mod server;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
