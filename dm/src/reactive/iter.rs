//! Cold publishers backed by in-memory data

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use super::protocol::{NoopSubscription, Publisher, Subscriber, Subscription, UNBOUNDED, add_demand};
use crate::error::MergeError;

/// Publisher that replays a fixed list of values to every subscriber, honoring demand
pub struct IterPublisher<T> {
    items: Arc<Vec<T>>,
}

impl<T> IterPublisher<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self { items: Arc::new(items) }
    }

    /// Number of values each subscriber will receive
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<T> Publisher<T> for IterPublisher<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        debug!(len = self.items.len(), "IterPublisher::subscribe: called");
        let subscription = IterSubscription::new(self.items.clone(), subscriber.clone());
        subscriber.on_subscribe(subscription.clone());
        // An empty source completes without waiting for demand
        subscription.drain();
    }
}

struct IterSubscription<T> {
    items: Arc<Vec<T>>,
    index: AtomicUsize,
    /// Cleared on termination so the subscriber/subscription cycle is broken
    subscriber: Mutex<Option<Arc<dyn Subscriber<T>>>>,
    requested: AtomicU64,
    wip: AtomicUsize,
    cancelled: AtomicBool,
}

impl<T> IterSubscription<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn new(items: Arc<Vec<T>>, subscriber: Arc<dyn Subscriber<T>>) -> Arc<Self> {
        Arc::new(Self {
            items,
            index: AtomicUsize::new(0),
            subscriber: Mutex::new(Some(subscriber)),
            requested: AtomicU64::new(0),
            wip: AtomicUsize::new(0),
            cancelled: AtomicBool::new(false),
        })
    }

    fn drain(&self) {
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }

        let mut missed = 1;
        loop {
            let subscriber = self.subscriber.lock().clone();
            if let Some(subscriber) = subscriber {
                self.emit(&subscriber);
            }

            missed = self.wip.fetch_sub(missed, Ordering::AcqRel) - missed;
            if missed == 0 {
                break;
            }
        }
    }

    /// Emit up to the current demand; clears the subscriber slot on termination
    fn emit(&self, subscriber: &Arc<dyn Subscriber<T>>) {
        let requested = self.requested.load(Ordering::Acquire);
        let mut emitted = 0u64;

        loop {
            if self.cancelled.load(Ordering::Acquire) {
                self.subscriber.lock().take();
                return;
            }

            let index = self.index.load(Ordering::Relaxed);
            if index == self.items.len() {
                self.subscriber.lock().take();
                subscriber.on_complete();
                return;
            }

            if emitted == requested {
                break;
            }

            self.index.store(index + 1, Ordering::Relaxed);
            subscriber.on_next(self.items[index].clone());
            emitted += 1;
        }

        if emitted > 0 && requested != UNBOUNDED {
            self.requested.fetch_sub(emitted, Ordering::AcqRel);
        }
    }
}

impl<T> Subscription for IterSubscription<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn request(&self, n: u64) {
        if n == 0 {
            self.cancelled.store(true, Ordering::Release);
            let subscriber = self.subscriber.lock().take();
            if let Some(subscriber) = subscriber {
                subscriber.on_error(MergeError::InvalidDemand { requested: n });
            }
            return;
        }

        add_demand(&self.requested, n);
        self.drain();
    }

    fn cancel(&self) {
        debug!("IterSubscription::cancel: called");
        self.cancelled.store(true, Ordering::Release);
        self.subscriber.lock().take();
    }
}

/// Publisher that fails every subscriber immediately
pub struct FailedPublisher {
    error: MergeError,
}

impl FailedPublisher {
    pub fn new(error: MergeError) -> Self {
        Self { error }
    }
}

impl<T> Publisher<T> for FailedPublisher {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        debug!(error = %self.error, "FailedPublisher::subscribe: called");
        subscriber.on_subscribe(Arc::new(NoopSubscription));
        subscriber.on_error(self.error.clone());
    }
}
