//! The seam between the merge coordinator and the multiplexing engine
//!
//! The coordinator drives an engine through [`FanInEngine`]; the engine calls
//! back into the coordinator through [`SourceTracker`]. The back-reference is a
//! `Weak` installed once via [`FanInEngine::bind`] while the coordinator is
//! being constructed.

use std::sync::{Arc, Weak};

use crate::error::MergeError;
use crate::reactive::{BoxPublisher, Publisher};

use super::environment::Environment;

/// Callbacks an engine issues against the coordinator that owns it
pub trait SourceTracker: Send + Sync {
    /// One inner stream reached a terminal state; returns the remaining in-flight count
    fn decrement_wip(&self) -> Result<usize, MergeError>;

    /// Downstream wants `elements` more; route it to the outer producer
    fn accumulate_demand(&self, elements: u64, outer_terminated: bool);

    /// Downstream cancelled; stop the outer producer
    fn cancel_upstream(&self);
}

/// Multiplexing engine that owns inner-stream subscriptions and the downstream consumer
pub trait FanInEngine<T>: Publisher<T> + 'static {
    /// Install the coordinator back-reference; an engine serves exactly one coordinator
    fn bind(&self, tracker: Weak<dyn SourceTracker>) -> Result<(), MergeError>;

    /// Subscribe to a newly arrived inner stream
    fn add_source(&self, source: BoxPublisher<T>);

    /// Fail the merged stream with `cause`
    fn on_error(&self, cause: MergeError);

    /// Complete downstream once everything already accepted has been delivered
    fn schedule_completion(&self);

    /// Bound internal buffering / per-source prefetch
    fn capacity(&self, elements: u64);

    /// Execution context for inner subscriptions
    fn environment(&self, environment: Arc<Environment>);
}
