//! # Extraction Module
//!
//! Turns a fetched document into the candidate value fed to the value tracker.
//!
//! ## Contained Modules:
//! - **`extractor`**: the three selection strategies (`select`, `find`,
//!   `find_string`) over a parsed HTML document.
//! - **`template`**: the optional `value_template` transform applied to the
//!   extracted string before change detection.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// HTML selection strategies.
pub mod extractor;
/// Post-extraction value transform.
pub mod template;

// --- Public API Re-exports ---
pub use extractor::{ExtractionError, Extractor, QueryError, SearchType};
pub use template::{TemplateError, ValueTemplate};
