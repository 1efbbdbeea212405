//! # Core Engine Module
//!
//! Change detection and the machinery that drives it.
//!
//! ## Core Components:
//!
//! - **`tracker`**: `TrackedItem`, the per-sensor change state and its
//!   transition rules, including the corrective refresh gate.
//! - **`store`**: the name-keyed `ItemStore` a coordinator owns.
//! - **`state`**: immutable snapshots and update events published to consumers.
//! - **`coordinator`**: the per-resource fetch loop, the single writer of its
//!   sensors' state.
//! - **`registry`**: loads, unloads and reloads coordinators by entry id.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Per-resource fetch loop and its consumer handle.
pub mod coordinator;
/// Coordinator lifecycle keyed by entry id.
pub mod registry;
/// Published snapshots and events.
pub mod state;
/// Name-keyed tracked items.
pub mod store;
/// Change-detection state machine.
pub mod tracker;

pub use coordinator::{Coordinator, CoordinatorCommand, CoordinatorHandle};
pub use registry::{Registry, RegistryError};
pub use state::{CoordinatorSnapshot, SensorState, SensorTransition, UpdateEvent};
pub use store::ItemStore;
pub use tracker::{CycleOrigin, TrackedItem, Transition};
