//! # Value Tracker
//!
//! Per-sensor change history and the transitions applied to every freshly
//! extracted value.
//!
//! ## Transition Order
//! For a non-absent candidate `v`:
//! 1. A refresh-origin cycle first resolves an outstanding reconcile.
//! 2. **First observation**: nothing recorded yet, so `v` becomes current.
//! 3. **Reconcile gate**: a change is still flagged, no reconcile is queued and
//!    `v` differs again. The stale flag is withdrawn and a corrective refresh is
//!    requested; `v` itself is not applied.
//! 4. **Change**: `v` differs from the current value.
//! 5. **Expiry**: the flag has been raised for at least `clear_after`.
//! 6. **Re-affirm**: a previous value is still held, so the flag stays raised.
//!
//! An absent candidate never touches the item.

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

/// What triggered the cycle a candidate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOrigin {
    /// The regular interval tick.
    Scheduled,
    /// A refresh request, corrective or external.
    Refresh,
}

/// # Transition
///
/// The outcome of feeding one candidate to a `TrackedItem`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    /// Absent candidate, nothing changed.
    Skipped,
    /// The first value was recorded.
    FirstObservation,
    /// A second change raced an unobserved one; a corrective refresh is owed.
    ReconcileRequested,
    /// The value changed and the flag was raised.
    Changed,
    /// The flag aged out and was cleared.
    Expired,
    /// A still-pending change was re-affirmed.
    Reaffirmed,
    /// Nothing to do.
    Unchanged,
}

/// # Tracked Item
///
/// Change-detection state of one sensor. Owned and mutated by a single
/// coordinator task.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedItem {
    current_value: Option<String>,
    previous_value: String,
    changed: bool,
    changed_at: Option<DateTime<Utc>>,
    pending_reconcile: bool,
    reconcile_requested_at: Option<DateTime<Utc>>,
    clear_after: TimeDelta,
}

impl TrackedItem {
    /// A fresh item whose changed flag expires after `clear_after`.
    pub fn new(clear_after: std::time::Duration) -> Self {
        Self {
            current_value: None,
            previous_value: String::new(),
            changed: false,
            changed_at: None,
            pending_reconcile: false,
            reconcile_requested_at: None,
            clear_after: TimeDelta::from_std(clear_after).unwrap_or(TimeDelta::MAX),
        }
    }

    /// Most recently confirmed value.
    pub fn current_value(&self) -> Option<&str> {
        self.current_value.as_deref()
    }

    /// Value held before the last detected change, `""` when none is pending.
    pub fn previous_value(&self) -> &str {
        &self.previous_value
    }

    /// Whether a change is being reported.
    pub fn is_changed(&self) -> bool {
        self.changed
    }

    /// When the current value or the changed flag was last set.
    pub fn changed_at(&self) -> Option<DateTime<Utc>> {
        self.changed_at
    }

    /// Whether a corrective refresh is queued and unresolved.
    pub fn pending_reconcile(&self) -> bool {
        self.pending_reconcile
    }

    /// When the outstanding corrective refresh was requested.
    pub fn reconcile_requested_at(&self) -> Option<DateTime<Utc>> {
        self.reconcile_requested_at
    }

    /// True if a reconcile has been pending for longer than `bound`.
    pub fn reconcile_overdue(&self, now: DateTime<Utc>, bound: TimeDelta) -> bool {
        match (self.pending_reconcile, self.reconcile_requested_at) {
            (true, Some(at)) => now.signed_duration_since(at) > bound,
            _ => false,
        }
    }

    /// Applies one candidate value observed at `now`.
    pub fn observe(
        &mut self,
        candidate: Option<&str>,
        now: DateTime<Utc>,
        origin: CycleOrigin,
    ) -> Transition {
        let Some(value) = candidate else {
            return Transition::Skipped;
        };

        if origin == CycleOrigin::Refresh && self.pending_reconcile {
            self.pending_reconcile = false;
            self.reconcile_requested_at = None;
        }

        let Some(current) = self.current_value.as_deref() else {
            self.current_value = Some(value.to_string());
            self.previous_value.clear();
            self.changed = false;
            self.stamp(now);
            return Transition::FirstObservation;
        };

        let differs = current != value;

        if differs && self.changed && !self.pending_reconcile {
            self.pending_reconcile = true;
            self.reconcile_requested_at = Some(now);
            self.previous_value.clear();
            self.changed = false;
            return Transition::ReconcileRequested;
        }

        if differs {
            self.previous_value = current.to_string();
            self.current_value = Some(value.to_string());
            self.changed = true;
            self.stamp(now);
            return Transition::Changed;
        }

        if self.changed && self.expired(now) {
            self.previous_value.clear();
            self.changed = false;
            return Transition::Expired;
        }

        if !self.previous_value.is_empty() {
            self.changed = true;
            return Transition::Reaffirmed;
        }

        Transition::Unchanged
    }

    fn expired(&self, now: DateTime<Utc>) -> bool {
        self.changed_at
            .and_then(|at| at.checked_add_signed(self.clear_after))
            .is_some_and(|deadline| now >= deadline)
    }

    // Never moves backwards, even if the wall clock does.
    fn stamp(&mut self, now: DateTime<Utc>) {
        self.changed_at = Some(match self.changed_at {
            Some(prev) if prev > now => prev,
            _ => now,
        });
    }
}
