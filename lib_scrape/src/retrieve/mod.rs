//! # Data Retrieval Module
//!
//! Fetching the raw documents that sensors are extracted from.
//!
//! ## Contained Modules:
//!
//! - **`fetcher`**: the `DocumentSource` seam the coordinator pulls documents
//!   through, and `HttpFetcher`, its `reqwest` implementation with retry
//!   middleware (exponential backoff, 3 retries), basic auth, custom headers
//!   and charset fallback.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Document sources and the HTTP fetcher with retry middleware.
pub mod fetcher;

pub use fetcher::{DocumentSource, FetchError, FetchedDocument, HttpFetcher};
