//! Publisher / Subscriber / Subscription traits

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::MergeError;

/// Demand value meaning "emit without limit"
pub const UNBOUNDED: u64 = u64::MAX;

/// Control handle a subscriber uses to talk back to its producer
pub trait Subscription: Send + Sync {
    /// Request up to `n` more elements; `UNBOUNDED` lifts the limit
    fn request(&self, n: u64);

    /// Stop the producer; no further signals are required after this
    fn cancel(&self);
}

/// Consumer of a stream of `T`
pub trait Subscriber<T>: Send + Sync {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>);
    fn on_next(&self, value: T);
    fn on_error(&self, cause: MergeError);
    fn on_complete(&self);
}

/// Producer of a stream of `T`
pub trait Publisher<T>: Send + Sync {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>);
}

/// Type-erased publisher, the element type of a stream of streams
pub type BoxPublisher<T> = Arc<dyn Publisher<T>>;

/// Subscription that ignores every signal
///
/// Handed to subscribers that are rejected before they can receive data.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSubscription;

impl Subscription for NoopSubscription {
    fn request(&self, _n: u64) {}

    fn cancel(&self) {}
}

/// Add `n` to an outstanding-demand counter, saturating at `UNBOUNDED`
///
/// Returns the value before the addition.
pub fn add_demand(counter: &AtomicU64, n: u64) -> u64 {
    match counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
        if current == UNBOUNDED {
            None
        } else {
            Some(current.saturating_add(n))
        }
    }) {
        Ok(previous) => previous,
        Err(previous) => previous,
    }
}
