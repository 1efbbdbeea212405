//! # Published State
//!
//! Immutable views a coordinator publishes after every cycle. Consumers never
//! see `TrackedItem` itself, only these snapshots and events.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::tracker::{CycleOrigin, Transition, TrackedItem};
use crate::configs::SensorConfig;
use crate::retrieve::FetchedDocument;

const ICON_CHANGED: &str = "mdi:eye-plus-outline";
const ICON_IDLE: &str = "mdi:eye-outline";

/// # Sensor State
///
/// Everything a consumer shows for one sensor: the value view and the derived
/// "updated" view.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorState {
    pub name: String,
    pub unique_id: Option<String>,
    /// Identity of the "updated" view, `<unique_id>_updated`.
    pub updated_unique_id: Option<String>,
    pub native_value: Option<String>,
    pub is_changed: bool,
    /// Current value, `""` before the first observation.
    pub new_value: String,
    pub old_value: String,
    pub changed_at: Option<DateTime<Utc>>,
    pub pending_reconcile: bool,
    pub icon: &'static str,
    pub unit_of_measurement: Option<String>,
    /// Whether the last fetch succeeded.
    pub available: bool,
    /// Markdown summary of the value and its last change.
    pub description: String,
}

impl SensorState {
    /// Builds the view of `item` for the sensor described by `config`.
    pub fn new(config: &SensorConfig, item: &TrackedItem, resource: &str, available: bool) -> Self {
        let new_value = item.current_value().unwrap_or_default().to_string();
        let old_value = item.previous_value().to_string();
        let icon = if old_value.is_empty() { ICON_IDLE } else { ICON_CHANGED };

        let description = if old_value.is_empty() {
            format!(
                "<font color= dodgerblue><ha-icon icon=\"{}\"></ha-icon></font> [{}]({}) value **'{}'**",
                icon,
                capitalize(&config.name),
                resource,
                new_value
            )
        } else {
            format!(
                "<font color= dodgerblue><ha-icon icon=\"{}\"></ha-icon></font> [{}]({}) value updated to **'{}'** from '{}'",
                icon,
                capitalize(&config.name),
                resource,
                new_value,
                old_value
            )
        };

        Self {
            name: config.name.clone(),
            unique_id: config.unique_id.clone(),
            updated_unique_id: config.updated_unique_id(),
            native_value: item.current_value().map(str::to_owned),
            is_changed: item.is_changed(),
            new_value,
            old_value,
            changed_at: item.changed_at(),
            pending_reconcile: item.pending_reconcile(),
            icon,
            unit_of_measurement: config.unit_of_measurement.clone(),
            available,
            description,
        }
    }
}

/// First character upper-cased, the rest lower-cased.
fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

/// # Coordinator Snapshot
///
/// State of one resource after its latest cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CoordinatorSnapshot {
    pub resource: String,
    pub nickname: Option<String>,
    pub last_update_success: bool,
    pub last_updated: Option<DateTime<Utc>>,
    pub sensors: Vec<SensorState>,
    /// The latest successfully fetched document.
    #[serde(skip)]
    pub document: Option<FetchedDocument>,
}

impl CoordinatorSnapshot {
    /// Looks up a sensor by name.
    pub fn sensor(&self, name: &str) -> Option<&SensorState> {
        self.sensors.iter().find(|s| s.name == name)
    }
}

/// One sensor's outcome within a cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorTransition {
    pub name: String,
    pub transition: Transition,
}

/// # Update Event
///
/// Broadcast after every cycle, successful or not.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UpdateEvent {
    /// A document was fetched and every sensor re-evaluated.
    Updated {
        resource: String,
        origin: CycleOrigin,
        at: DateTime<Utc>,
        transitions: Vec<SensorTransition>,
    },
    /// The fetch failed; sensor state is untouched.
    FetchFailed {
        resource: String,
        at: DateTime<Utc>,
        error: String,
    },
}

impl UpdateEvent {
    /// The resource the event belongs to.
    pub fn resource(&self) -> &str {
        match self {
            UpdateEvent::Updated { resource, .. } | UpdateEvent::FetchFailed { resource, .. } => {
                resource
            }
        }
    }

    /// Sensors whose outcome was `transition`.
    pub fn sensors_with(&self, transition: Transition) -> Vec<&str> {
        match self {
            UpdateEvent::Updated { transitions, .. } => transitions
                .iter()
                .filter(|t| t.transition == transition)
                .map(|t| t.name.as_str())
                .collect(),
            UpdateEvent::FetchFailed { .. } => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::SearchType;
    use std::time::Duration;

    fn config() -> SensorConfig {
        SensorConfig {
            name: "latest RELEASE".into(),
            unique_id: Some("rel".into()),
            select: ".v".into(),
            search_type: SearchType::Select,
            attribute: None,
            index: 0,
            value_template: None,
            clear_updated_after_hours: 24.0,
            unit_of_measurement: None,
        }
    }

    #[test]
    fn describes_unchanged_and_changed_values() {
        let mut item = TrackedItem::new(Duration::from_secs(3600));
        item.observe(Some("1.0"), Utc::now(), CycleOrigin::Scheduled);

        let idle = SensorState::new(&config(), &item, "https://example.org", true);
        assert_eq!(idle.icon, ICON_IDLE);
        assert_eq!(idle.updated_unique_id.as_deref(), Some("rel_updated"));
        assert_eq!(
            idle.description,
            "<font color= dodgerblue><ha-icon icon=\"mdi:eye-outline\"></ha-icon></font> [Latest release](https://example.org) value **'1.0'**"
        );

        item.observe(Some("1.1"), Utc::now(), CycleOrigin::Scheduled);
        let changed = SensorState::new(&config(), &item, "https://example.org", true);
        assert!(changed.is_changed);
        assert_eq!(changed.icon, ICON_CHANGED);
        assert!(changed.description.ends_with("value updated to **'1.1'** from '1.0'"));
    }

    #[test]
    fn fresh_item_reports_empty_values() {
        let item = TrackedItem::new(Duration::from_secs(3600));
        let state = SensorState::new(&config(), &item, "r", false);
        assert_eq!(state.native_value, None);
        assert_eq!(state.new_value, "");
        assert!(!state.available);
    }
}
