// See <https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html>

pub mod invalidation;
pub mod modules;
pub mod resources;
pub mod restart;
pub mod single_flight;
pub mod utils;

pub use utils::*;
