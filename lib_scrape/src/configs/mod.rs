//! # Configuration Modules
//!
//! The scrape definition model: resources, their sensors, and the validation
//! that turns raw files into a configuration the coordinator can run.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Resource and sensor definitions, validation and file loading.
pub mod config_scrape;

pub use config_scrape::{
    AuthKind, ConfigError, ResourceConfig, ScrapeFile, SensorConfig,
    DEFAULT_CLEAR_UPDATED_AFTER_HOURS, DEFAULT_ENCODING, DEFAULT_SCAN_INTERVAL_MINUTES,
    DEFAULT_TIMEOUT_SECS, MAX_CLEAR_UPDATED_AFTER_HOURS, MAX_SCAN_INTERVAL_MINUTES,
    MAX_TIMEOUT_SECS,
};
