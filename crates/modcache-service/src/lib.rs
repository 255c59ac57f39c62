//! Build caching for a server that assembles script and style modules into layers.
//!
//! See [`caching`] for the cache itself, and [`modules`] and [`resources`] for the caches built
//! on top of it.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod logging;
pub mod modules;
pub mod resources;
