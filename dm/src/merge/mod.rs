//! Dynamic fan-in of a stream of streams
//!
//! [`MergeCoordinator`] consumes the outer stream and does the accounting;
//! a [`FanInEngine`] (by default [`MergeEngine`]) subscribes to each inner
//! stream and multiplexes their values to a single downstream subscriber.

mod coordinator;
mod demand;
mod engine;
mod environment;
mod fan_in;
mod in_flight;
mod stats;

pub use coordinator::{DEFAULT_CAPACITY, MergeCoordinator};
pub use demand::{DemandAccumulator, combine};
pub use engine::{FanInEngine, SourceTracker};
pub use environment::{DispatcherKind, Environment};
pub use fan_in::MergeEngine;
pub use in_flight::InFlightCounter;
pub use stats::MergeStats;
