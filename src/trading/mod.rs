//! Trade coordination: order intake, delivery tracking, settlement

pub mod coordinator;
pub mod placer;
pub mod watcher;

pub use coordinator::OrderCoordinator;
pub use placer::OrderPlacer;
pub use watcher::{EnergyWatcher, WatchOutcome};
