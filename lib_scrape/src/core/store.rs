//! # Item Store
//!
//! Name-keyed `TrackedItem`s of one resource, owned by its coordinator.

use std::collections::BTreeMap;
use std::time::Duration;

use super::tracker::TrackedItem;

/// Per-resource state store. Only the owning coordinator task writes to it.
#[derive(Debug, Default, Clone)]
pub struct ItemStore {
    items: BTreeMap<String, TrackedItem>,
}

impl ItemStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// The item for `name`, created with `clear_after` on first access.
    pub fn entry(&mut self, name: &str, clear_after: Duration) -> &mut TrackedItem {
        self.items
            .entry(name.to_string())
            .or_insert_with(|| TrackedItem::new(clear_after))
    }

    /// Looks up an item.
    pub fn get(&self, name: &str) -> Option<&TrackedItem> {
        self.items.get(name)
    }

    /// Items in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &TrackedItem)> {
        self.items.iter().map(|(name, item)| (name.as_str(), item))
    }

    /// Number of tracked items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when nothing is tracked yet.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
