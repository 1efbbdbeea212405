//! # Scrape Definitions
//!
//! The configuration model for resources (one fetched document each) and the
//! sensors tracked on them, plus validation and JSON/YAML file loading.
//!
//! Validation normalises as it checks: names and the resource URL are trimmed
//! and every optional field carries its default afterwards. Validating an
//! already validated configuration is the identity, so a configuration can be
//! validated, serialised, reloaded and validated again without drift.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;
use std::fs;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::extract::{Extractor, QueryError, SearchType, TemplateError, ValueTemplate};

/// Minutes between fetches when `scan_interval` is not given.
pub const DEFAULT_SCAN_INTERVAL_MINUTES: u64 = 10;
/// Seconds before an HTTP request is abandoned.
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;
/// Hours a "changed" flag stays raised before it is cleared.
pub const DEFAULT_CLEAR_UPDATED_AFTER_HOURS: f64 = 24.0;
/// Charset used when the response does not declare one.
pub const DEFAULT_ENCODING: &str = "UTF-8";
/// Longest accepted `scan_interval`, one year in minutes.
pub const MAX_SCAN_INTERVAL_MINUTES: u64 = 365 * 24 * 60;
/// Longest accepted `timeout`, one day in seconds.
pub const MAX_TIMEOUT_SECS: u64 = 24 * 3600;
/// Longest accepted `clear_updated_after_hours`, ten years.
pub const MAX_CLEAR_UPDATED_AFTER_HOURS: f64 = 10.0 * 365.0 * 24.0;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error occurred: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yml::Error),

    #[error("Unsupported scrape file format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid resource URL '{url}': {reason}")]
    InvalidResource { url: String, reason: String },

    #[error("Field '{0}' must not be empty")]
    EmptyField(&'static str),

    #[error("Field '{0}' must be greater than zero")]
    NonPositive(&'static str),

    #[error("Field '{field}' must be at most {max}, got {value}")]
    OutOfRange {
        field: &'static str,
        value: f64,
        max: f64,
    },

    #[error("Authentication scheme '{0}' is not supported")]
    UnsupportedAuthentication(&'static str),

    #[error("A password was given without a username")]
    IncompleteCredentials,

    #[error("Sensor '{sensor}': {source}")]
    InvalidQuery {
        sensor: String,
        #[source]
        source: QueryError,
    },

    #[error("Sensor '{sensor}': {source}")]
    InvalidTemplate {
        sensor: String,
        #[source]
        source: TemplateError,
    },

    #[error("Sensor '{sensor}': clear_updated_after_hours must be finite and between 0 and {max}, got {value}")]
    InvalidClearAfter { sensor: String, value: f64, max: f64 },

    #[error("Duplicate sensor name '{0}' on one resource")]
    DuplicateSensor(String),
}

/// HTTP authentication scheme for `username`/`password`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthKind {
    #[default]
    Basic,
    /// Accepted in files, rejected by validation.
    Digest,
}

impl AuthKind {
    /// The configuration spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthKind::Basic => "basic",
            AuthKind::Digest => "digest",
        }
    }
}

/// # Scrape File
///
/// Top-level document of a scrape definition file.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScrapeFile {
    /// One entry per fetched resource.
    #[serde(default)]
    pub scrape: Vec<ResourceConfig>,
}

/// # Resource Config
///
/// A single remote document and the sensors extracted from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceConfig {
    /// Absolute http(s) URL of the document.
    pub resource: String,
    /// Friendly label used in logs and descriptions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    /// Minutes between scheduled fetches.
    #[serde(default = "default_scan_interval")]
    pub scan_interval: u64,
    /// Extra request headers.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// Scheme used with the credentials, basic when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<AuthKind>,
    /// HTTP auth user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// HTTP auth password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Reject invalid TLS certificates.
    #[serde(default = "default_verify_ssl")]
    pub verify_ssl: bool,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Fallback charset for decoding the body.
    #[serde(default = "default_encoding")]
    pub encoding: String,
    /// Tracked items on this resource.
    #[serde(default)]
    pub sensor: Vec<SensorConfig>,
}

/// # Sensor Config
///
/// One tracked item. `name` is its identity within the resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SensorConfig {
    /// Stable identity key.
    pub name: String,
    /// Optional globally unique id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_id: Option<String>,
    /// Selector, tag query or pattern, depending on `search_type`.
    pub select: String,
    /// Selection strategy.
    #[serde(default)]
    pub search_type: SearchType,
    /// Attribute to read instead of text (`select` only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
    /// 0-based occurrence.
    #[serde(default)]
    pub index: usize,
    /// Post-extraction transform.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_template: Option<String>,
    /// Hours before a raised "changed" flag is cleared.
    #[serde(
        default = "default_clear_updated_after_hours",
        alias = "clear_updated_bin_sensor_after"
    )]
    pub clear_updated_after_hours: f64,
    /// Unit passed through to consumers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_of_measurement: Option<String>,
}

fn default_scan_interval() -> u64 {
    DEFAULT_SCAN_INTERVAL_MINUTES
}

fn default_verify_ssl() -> bool {
    true
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_encoding() -> String {
    DEFAULT_ENCODING.to_string()
}

fn default_clear_updated_after_hours() -> f64 {
    DEFAULT_CLEAR_UPDATED_AFTER_HOURS
}

impl ScrapeFile {
    /// Reads a scrape file, choosing the format from the extension
    /// (`.json`, `.yaml` or `.yml`). The result is not yet validated.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        match extension.as_str() {
            "json" => Ok(serde_json::from_str(&text)?),
            "yaml" | "yml" => Ok(serde_yml::from_str(&text)?),
            other => Err(ConfigError::UnsupportedFormat(other.to_string())),
        }
    }

    /// Validates every resource.
    pub fn validate(&self) -> Result<ScrapeFile, ConfigError> {
        let scrape = self
            .scrape
            .iter()
            .map(ResourceConfig::validate)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ScrapeFile { scrape })
    }
}

impl ResourceConfig {
    /// Checks the resource and all of its sensors, returning the normalised copy.
    pub fn validate(&self) -> Result<ResourceConfig, ConfigError> {
        let resource = self.resource.trim().to_string();
        let url = Url::parse(&resource).map_err(|e| ConfigError::InvalidResource {
            url: resource.clone(),
            reason: e.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidResource {
                url: resource,
                reason: format!("unsupported scheme '{}'", url.scheme()),
            });
        }

        if self.scan_interval == 0 {
            return Err(ConfigError::NonPositive("scan_interval"));
        }
        if self.scan_interval > MAX_SCAN_INTERVAL_MINUTES {
            return Err(ConfigError::OutOfRange {
                field: "scan_interval",
                value: self.scan_interval as f64,
                max: MAX_SCAN_INTERVAL_MINUTES as f64,
            });
        }
        if self.timeout == 0 {
            return Err(ConfigError::NonPositive("timeout"));
        }
        if self.timeout > MAX_TIMEOUT_SECS {
            return Err(ConfigError::OutOfRange {
                field: "timeout",
                value: self.timeout as f64,
                max: MAX_TIMEOUT_SECS as f64,
            });
        }
        if let Some(kind @ AuthKind::Digest) = self.authentication {
            return Err(ConfigError::UnsupportedAuthentication(kind.as_str()));
        }
        if self.password.is_some() && self.username.is_none() {
            return Err(ConfigError::IncompleteCredentials);
        }

        let encoding = self.encoding.trim();
        if encoding.is_empty() {
            return Err(ConfigError::EmptyField("encoding"));
        }

        let mut seen = HashSet::new();
        let mut sensor = Vec::with_capacity(self.sensor.len());
        for raw in &self.sensor {
            let validated = raw.validate()?;
            if !seen.insert(validated.name.clone()) {
                return Err(ConfigError::DuplicateSensor(validated.name));
            }
            sensor.push(validated);
        }

        Ok(ResourceConfig {
            resource,
            nickname: self
                .nickname
                .as_deref()
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_owned),
            encoding: encoding.to_string(),
            sensor,
            ..self.clone()
        })
    }

    /// Time between scheduled fetches. Saturates instead of overflowing on
    /// unvalidated input.
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval.saturating_mul(60))
    }

    /// Request timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// Nickname if set, otherwise the resource URL.
    pub fn display_name(&self) -> &str {
        self.nickname.as_deref().unwrap_or(&self.resource)
    }
}

impl SensorConfig {
    /// Checks the sensor and compiles its query and template once to prove they are valid.
    pub fn validate(&self) -> Result<SensorConfig, ConfigError> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(ConfigError::EmptyField("name"));
        }
        if self.select.trim().is_empty() {
            return Err(ConfigError::EmptyField("select"));
        }
        let hours = self.clear_updated_after_hours;
        if !hours.is_finite() || !(0.0..=MAX_CLEAR_UPDATED_AFTER_HOURS).contains(&hours) {
            return Err(ConfigError::InvalidClearAfter {
                sensor: name,
                value: hours,
                max: MAX_CLEAR_UPDATED_AFTER_HOURS,
            });
        }
        if self.attribute.is_some() && self.search_type != SearchType::Select {
            log::warn!(
                "Sensor '{}': attribute is ignored for search type '{}'",
                name,
                self.search_type.as_str()
            );
        }

        let validated = SensorConfig {
            name,
            unique_id: self
                .unique_id
                .as_deref()
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_owned),
            ..self.clone()
        };
        validated.build_extractor()?;
        validated.build_template()?;
        Ok(validated)
    }

    /// Compiles the configured query.
    pub fn build_extractor(&self) -> Result<Extractor, ConfigError> {
        Extractor::new(
            self.search_type,
            &self.select,
            self.attribute.clone(),
            self.index,
        )
        .map_err(|source| ConfigError::InvalidQuery {
            sensor: self.name.clone(),
            source,
        })
    }

    /// Compiles the configured `value_template`, if any.
    pub fn build_template(&self) -> Result<Option<ValueTemplate>, ConfigError> {
        self.value_template
            .as_deref()
            .map(ValueTemplate::parse)
            .transpose()
            .map_err(|source| ConfigError::InvalidTemplate {
                sensor: self.name.clone(),
                source,
            })
    }

    /// How long a raised "changed" flag survives. Unrepresentable values
    /// saturate: negative or NaN to zero, too large to `Duration::MAX`.
    pub fn clear_after(&self) -> Duration {
        let secs = self.clear_updated_after_hours * 3600.0;
        match Duration::try_from_secs_f64(secs) {
            Ok(duration) => duration,
            Err(_) if secs > 0.0 => Duration::MAX,
            Err(_) => Duration::ZERO,
        }
    }

    /// Identity of the derived "updated" view, `<unique_id>_updated`.
    pub fn updated_unique_id(&self) -> Option<String> {
        self.unique_id.as_ref().map(|id| format!("{}_updated", id))
    }
}
