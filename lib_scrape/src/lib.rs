//! # lib_scrape
//!
//! Periodic scraping of remote documents with change detection.
//!
//! A resource is fetched on an interval; every sensor configured on it
//! extracts one value from the document, optionally transforms it with a value
//! template, and feeds it to its tracker, which decides whether the value is
//! new, changed, repeated or has aged out of its "changed" state.

#[cfg(feature = "configs")]
pub mod configs;
#[cfg(feature = "core")]
pub mod core;
#[cfg(feature = "extract")]
pub mod extract;
#[cfg(feature = "retrieve")]
pub mod retrieve;

#[cfg(feature = "configs")]
pub use configs::{ConfigError, ResourceConfig, ScrapeFile, SensorConfig};
#[cfg(feature = "core")]
pub use self::core::{
    Coordinator, CoordinatorHandle, CoordinatorSnapshot, Registry, RegistryError, SensorState,
    Transition, UpdateEvent,
};
#[cfg(feature = "extract")]
pub use extract::{Extractor, SearchType, ValueTemplate};
#[cfg(feature = "retrieve")]
pub use retrieve::{DocumentSource, FetchError, FetchedDocument, HttpFetcher};
