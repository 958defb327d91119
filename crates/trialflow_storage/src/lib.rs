//! TRIALFLOW Storage
//!
//! Experiment snapshots: the JSON save format for authoring graphs and a
//! directory store for snapshot files.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod snapshot;
pub mod store;

pub use snapshot::{ExperimentSnapshot, SnapshotError, DEFAULT_BACKGROUND, SNAPSHOT_VERSION};
pub use store::{load_snapshot, save_snapshot, SnapshotStore, StoreConfig};
