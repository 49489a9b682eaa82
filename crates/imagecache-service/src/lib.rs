#[macro_use]
pub mod metrics;

pub mod caching;
pub mod clock;
pub mod config;
pub mod download;
pub mod services;
pub mod utils;
