//! dynmerge - Dynamic fan-in merges of stream-of-streams
//!
//! dynmerge coordinates a merge stage whose inputs arrive at runtime: an outer
//! producer emits inner producers, and every value of every inner producer is
//! delivered to a single downstream subscriber under backpressure.
//!
//! # Core Concepts
//!
//! - **Demand flows upstream**: downstream requests are parked until the outer
//!   producer's control handle exists, then forwarded without loss
//! - **In-flight accounting**: each inner stream is counted from arrival until it
//!   terminates; underflow is a reported error, never a wrap
//! - **Single completion**: the merged output completes exactly once, after the
//!   outer producer and every inner stream are done
//! - **Lock-free**: shared state is atomics; no call blocks
//!
//! # Modules
//!
//! - [`merge`] - Coordinator, default engine and their accounting primitives
//! - [`reactive`] - Publisher/Subscriber/Subscription protocol and helpers
//! - [`error`] - Error type
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod cli;
pub mod config;
pub mod error;
pub mod merge;
pub mod reactive;

// Re-export commonly used types
pub use config::{Config, DemoConfig, MergeConfig};
pub use error::MergeError;
pub use merge::{
    DEFAULT_CAPACITY, DispatcherKind, Environment, FanInEngine, MergeCoordinator, MergeEngine, MergeStats,
    SourceTracker,
};
pub use reactive::{
    BoxPublisher, ChannelSubscriber, FailedPublisher, IterPublisher, Publisher, Signal, Subscriber, Subscription,
    UNBOUNDED,
};
