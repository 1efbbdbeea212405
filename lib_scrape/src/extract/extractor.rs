//! # HTML Value Extractor
//!
//! Pulls a single scalar string out of a parsed HTML document. Every tracked
//! sensor owns one `Extractor`, compiled once from its configuration, and runs
//! it against the document shared by all sensors of the same resource.
//!
//! ## Search Types:
//! - **`select`**: a CSS query. The `index`-th match yields either the value of
//!   the configured attribute or the element's full text. `style`, `script` and
//!   `template` elements yield their literal string content instead.
//! - **`find`**: a tag-level query. The `index`-th match yields its direct
//!   string, i.e. the single text child (descending through single-child
//!   elements).
//! - **`find_string`**: a regular expression searched against every text node.
//!   The `index`-th matching node yields its content.
//!
//! A failed extraction never aborts a fetch cycle: `extract_logged` reduces every
//! `ExtractionError` to an absent value. Index and attribute misses are logged as
//! warnings; silent misses from `find`/`find_string` only at debug level.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use regex::Regex;
use scraper::{ElementRef, Html, Node, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Elements whose literal content is returned instead of their text.
const LITERAL_CONTENT_TAGS: [&str; 3] = ["style", "script", "template"];

/// # Search Type
///
/// Selection strategy applied to the fetched document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchType {
    /// CSS selector query with optional attribute lookup.
    #[default]
    Select,
    /// Tag-level query returning the element's direct string.
    Find,
    /// Regular expression over text nodes.
    FindString,
}

impl SearchType {
    /// The configuration spelling of this search type.
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchType::Select => "select",
            SearchType::Find => "find",
            SearchType::FindString => "find_string",
        }
    }
}

/// # Extraction Error
///
/// Why a single extraction produced no value. None of these are fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractionError {
    /// Fewer than `index + 1` elements matched the query.
    #[error("index {index} not found ({matches} matches)")]
    IndexNotFound {
        /// The requested 0-based occurrence.
        index: usize,
        /// How many elements actually matched.
        matches: usize,
    },
    /// The matched element does not carry the requested attribute.
    #[error("attribute '{0}' not found")]
    AttributeNotFound(String),
    /// No match, or the match has no textual content.
    #[error("no match or no textual content")]
    SilentMiss,
}

/// Raised when a selector or pattern cannot be compiled.
#[derive(Debug, Clone, Error)]
pub enum QueryError {
    /// The CSS selector (or tag query) failed to parse.
    #[error("invalid selector '{selector}': {reason}")]
    InvalidSelector {
        /// The offending selector text.
        selector: String,
        /// Parser diagnostic.
        reason: String,
    },
    /// The regular expression failed to compile.
    #[error("invalid pattern '{pattern}': {source}")]
    InvalidPattern {
        /// The offending pattern text.
        pattern: String,
        /// Compiler diagnostic.
        #[source]
        source: regex::Error,
    },
}

#[derive(Debug, Clone)]
enum Query {
    Css(Selector),
    Pattern(Regex),
}

/// # Extractor
///
/// A compiled extraction query for one sensor.
#[derive(Debug, Clone)]
pub struct Extractor {
    search_type: SearchType,
    query: Query,
    attribute: Option<String>,
    index: usize,
}

impl Extractor {
    /// Compiles the query for `search_type`.
    ///
    /// `select` and `find` parse `selector` as CSS; `find_string` compiles it as
    /// a regular expression. `attribute` is only consulted by `select`.
    pub fn new(
        search_type: SearchType,
        selector: &str,
        attribute: Option<String>,
        index: usize,
    ) -> Result<Self, QueryError> {
        let query = match search_type {
            SearchType::Select | SearchType::Find => {
                let css = Selector::parse(selector).map_err(|e| QueryError::InvalidSelector {
                    selector: selector.to_string(),
                    reason: e.to_string(),
                })?;
                Query::Css(css)
            }
            SearchType::FindString => {
                let pattern = Regex::new(selector).map_err(|source| QueryError::InvalidPattern {
                    pattern: selector.to_string(),
                    source,
                })?;
                Query::Pattern(pattern)
            }
        };

        Ok(Self {
            search_type,
            query,
            attribute,
            index,
        })
    }

    /// The strategy this extractor was compiled for.
    pub fn search_type(&self) -> SearchType {
        self.search_type
    }

    /// Runs the query against `document`.
    pub fn extract(&self, document: &Html) -> Result<String, ExtractionError> {
        match &self.query {
            Query::Css(selector) if self.search_type == SearchType::Select => {
                self.select(document, selector)
            }
            Query::Css(selector) => self.find(document, selector),
            Query::Pattern(pattern) => self.find_string(document, pattern),
        }
    }

    /// Runs the query and reduces any failure to `None`, logging it on behalf of `sensor`.
    pub fn extract_logged(&self, document: &Html, sensor: &str) -> Option<String> {
        match self.extract(document) {
            Ok(value) => {
                log::debug!("Parsed value for '{}': {}", sensor, value);
                Some(value)
            }
            Err(ExtractionError::SilentMiss) => {
                log::debug!(
                    "No {} match with content for '{}'",
                    self.search_type.as_str(),
                    sensor
                );
                None
            }
            Err(e @ ExtractionError::IndexNotFound { .. }) => {
                log::warn!("Index '{}' not found in '{}': {}", self.index, sensor, e);
                None
            }
            Err(e @ ExtractionError::AttributeNotFound(_)) => {
                log::warn!("Extraction failed in '{}': {}", sensor, e);
                None
            }
        }
    }

    fn select(&self, document: &Html, selector: &Selector) -> Result<String, ExtractionError> {
        let element = document
            .select(selector)
            .nth(self.index)
            .ok_or_else(|| ExtractionError::IndexNotFound {
                index: self.index,
                matches: document.select(selector).count(),
            })?;

        if let Some(attribute) = &self.attribute {
            return element
                .value()
                .attr(attribute)
                .map(str::to_owned)
                .ok_or_else(|| ExtractionError::AttributeNotFound(attribute.clone()));
        }

        if LITERAL_CONTENT_TAGS.contains(&element.value().name()) {
            return direct_string(element).ok_or(ExtractionError::SilentMiss);
        }

        Ok(element.text().collect())
    }

    fn find(&self, document: &Html, selector: &Selector) -> Result<String, ExtractionError> {
        document
            .select(selector)
            .nth(self.index)
            .and_then(direct_string)
            .ok_or(ExtractionError::SilentMiss)
    }

    fn find_string(&self, document: &Html, pattern: &Regex) -> Result<String, ExtractionError> {
        document
            .tree
            .root()
            .descendants()
            .filter_map(|node| match node.value() {
                Node::Text(text) if pattern.is_match(text) => Some(text.to_string()),
                _ => None,
            })
            .nth(self.index)
            .ok_or(ExtractionError::SilentMiss)
    }
}

/// The single string directly under `element`, descending through elements
/// that have exactly one child. `None` when there are zero or several children.
fn direct_string(element: ElementRef<'_>) -> Option<String> {
    let mut children = element.children();
    let only = children.next()?;
    if children.next().is_some() {
        return None;
    }
    match only.value() {
        Node::Text(text) => Some(text.to_string()),
        Node::Element(_) => ElementRef::wrap(only).and_then(direct_string),
        _ => None,
    }
}
