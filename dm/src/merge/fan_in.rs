//! Default multiplexing engine
//!
//! Inner streams push into one lock-free queue; a work-in-progress counter
//! serializes delivery to the single downstream subscriber so `on_next` is never
//! called concurrently and never beyond granted demand. Each inner stream is
//! prefetched up to the configured capacity and replenished as its values are
//! delivered, which keeps per-stream order intact.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use arc_swap::ArcSwapOption;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::MergeError;
use crate::reactive::{BoxPublisher, NoopSubscription, Publisher, Subscriber, Subscription, UNBOUNDED, add_demand};

use super::coordinator::DEFAULT_CAPACITY;
use super::engine::{FanInEngine, SourceTracker};
use super::environment::Environment;

/// Value waiting for downstream demand, tagged with the stream it came from
struct Queued<T> {
    value: T,
    inner: Arc<InnerSubscriber<T>>,
}

struct Shared<T> {
    tracker: OnceLock<Weak<dyn SourceTracker>>,
    downstream: OnceLock<Arc<dyn Subscriber<T>>>,
    /// Set once `on_subscribe` has returned to the downstream subscriber
    downstream_ready: AtomicBool,
    queue_tx: Sender<Queued<T>>,
    queue_rx: Receiver<Queued<T>>,
    requested: AtomicU64,
    wip: AtomicUsize,
    completion_scheduled: AtomicBool,
    error: OnceLock<MergeError>,
    terminated: AtomicBool,
    cancelled: AtomicBool,
    capacity: AtomicU64,
    environment: ArcSwapOption<Environment>,
    inners: Mutex<HashMap<u64, Arc<InnerSubscriber<T>>>>,
    next_inner_id: AtomicU64,
    emitted: AtomicU64,
}

impl<T> Shared<T>
where
    T: Send + 'static,
{
    fn tracker(&self) -> Option<Arc<dyn SourceTracker>> {
        self.tracker.get().and_then(Weak::upgrade)
    }

    fn is_done(&self) -> bool {
        self.cancelled.load(Ordering::Acquire) || self.terminated.load(Ordering::Acquire) || self.error.get().is_some()
    }

    fn fail(&self, cause: MergeError) {
        debug!(%cause, "MergeEngine::fail: called");
        if self.error.set(cause).is_ok() {
            self.cancel_inners();
            if let Some(tracker) = self.tracker() {
                tracker.cancel_upstream();
            }
        }
        self.drain();
    }

    fn cancel_inners(&self) {
        let inners: Vec<_> = self.inners.lock().drain().map(|(_, inner)| inner).collect();
        debug!(count = inners.len(), "MergeEngine::cancel_inners: called");
        for inner in inners {
            if inner.cancel() {
                self.release_source(inner.id);
            }
        }
    }

    /// Account for an inner stream that will never signal a terminal event
    fn release_source(&self, id: u64) {
        debug!(id, "MergeEngine::release_source: called");
        match self.tracker() {
            Some(tracker) => {
                if let Err(e) = tracker.decrement_wip() {
                    warn!(id, error = %e, "Failed to release stopped inner stream");
                }
            }
            None => warn!(id, "Inner stream released but no coordinator is attached"),
        }
    }

    fn inner_terminated(&self, id: u64, cause: Option<MergeError>) {
        debug!(id, failed = cause.is_some(), "MergeEngine::inner_terminated: called");
        self.inners.lock().remove(&id);

        if let Some(cause) = cause {
            self.fail(cause);
        }

        match self.tracker() {
            Some(tracker) => {
                if let Err(e) = tracker.decrement_wip() {
                    self.fail(e);
                }
            }
            None => warn!(id, "Inner stream finished but no coordinator is attached"),
        }

        self.drain();
    }

    fn clear_queue(&self) {
        while self.queue_rx.try_recv().is_ok() {}
    }

    fn drain(&self) {
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }

        let mut missed = 1;
        loop {
            if self.downstream_ready.load(Ordering::Acquire)
                && let Some(downstream) = self.downstream.get()
            {
                self.drain_once(downstream);
            }

            missed = self.wip.fetch_sub(missed, Ordering::AcqRel) - missed;
            if missed == 0 {
                break;
            }
        }
    }

    fn drain_once(&self, downstream: &Arc<dyn Subscriber<T>>) {
        if self.terminated.load(Ordering::Acquire) || self.cancelled.load(Ordering::Acquire) {
            self.clear_queue();
            return;
        }

        let requested = self.requested.load(Ordering::Acquire);
        let mut emitted = 0u64;

        loop {
            if self.cancelled.load(Ordering::Acquire) {
                self.clear_queue();
                return;
            }

            // Errors cut ahead of buffered values
            if let Some(cause) = self.error.get() {
                self.clear_queue();
                if !self.terminated.swap(true, Ordering::AcqRel) {
                    debug!(%cause, "MergeEngine::drain: signalling error downstream");
                    downstream.on_error(cause.clone());
                }
                return;
            }

            if emitted == requested {
                break;
            }

            match self.queue_rx.try_recv() {
                Ok(queued) => {
                    downstream.on_next(queued.value);
                    queued.inner.consumed();
                    emitted += 1;
                }
                Err(_) => break,
            }
        }

        if emitted > 0 {
            if requested != UNBOUNDED {
                self.requested.fetch_sub(emitted, Ordering::AcqRel);
            }
            self.emitted.fetch_add(emitted, Ordering::Relaxed);
        }

        if self.completion_scheduled.load(Ordering::Acquire)
            && self.queue_rx.is_empty()
            && self.error.get().is_none()
            && !self.terminated.swap(true, Ordering::AcqRel)
        {
            debug!("MergeEngine::drain: signalling completion downstream");
            downstream.on_complete();
        }
    }
}

/// Subscriber attached to one inner stream
struct InnerSubscriber<T> {
    id: u64,
    me: Weak<InnerSubscriber<T>>,
    shared: Weak<Shared<T>>,
    subscription: OnceLock<Arc<dyn Subscription>>,
    prefetch: u64,
    /// Replenish after this many deliveries
    limit: u64,
    consumed: AtomicU64,
    done: AtomicBool,
}

impl<T> InnerSubscriber<T>
where
    T: Send + 'static,
{
    fn new(id: u64, shared: Weak<Shared<T>>, prefetch: u64) -> Arc<Self> {
        let limit = if prefetch == UNBOUNDED {
            UNBOUNDED
        } else {
            (prefetch - prefetch / 4).max(1)
        };
        Arc::new_cyclic(|me| Self {
            id,
            me: me.clone(),
            shared,
            subscription: OnceLock::new(),
            prefetch,
            limit,
            consumed: AtomicU64::new(0),
            done: AtomicBool::new(false),
        })
    }

    /// One of our values reached downstream; only called from the drain loop
    fn consumed(&self) {
        if self.prefetch == UNBOUNDED {
            return;
        }
        let consumed = self.consumed.fetch_add(1, Ordering::Relaxed) + 1;
        if consumed == self.limit {
            self.consumed.store(0, Ordering::Relaxed);
            if let Some(subscription) = self.subscription.get() {
                subscription.request(self.limit);
            }
        }
    }

    /// Stop the inner stream; true if it had not terminated yet
    fn cancel(&self) -> bool {
        let live = !self.done.swap(true, Ordering::AcqRel);
        if let Some(subscription) = self.subscription.get() {
            subscription.cancel();
        }
        live
    }
}

impl<T> Subscriber<T> for InnerSubscriber<T>
where
    T: Send + 'static,
{
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        debug!(id = self.id, prefetch = self.prefetch, "InnerSubscriber::on_subscribe: called");
        if self.subscription.set(subscription.clone()).is_err() {
            warn!(id = self.id, "Inner stream subscribed twice, cancelling the new subscription");
            subscription.cancel();
            return;
        }

        let Some(shared) = self.shared.upgrade() else {
            subscription.cancel();
            return;
        };
        if shared.is_done() {
            // Stopped between registration and subscription; settle it here
            subscription.cancel();
            if !self.done.swap(true, Ordering::AcqRel) {
                shared.inners.lock().remove(&self.id);
                shared.release_source(self.id);
            }
            return;
        }
        if self.done.load(Ordering::Acquire) {
            subscription.cancel();
            return;
        }
        subscription.request(self.prefetch);
    }

    fn on_next(&self, value: T) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        let (Some(shared), Some(me)) = (self.shared.upgrade(), self.me.upgrade()) else {
            return;
        };
        let _ = shared.queue_tx.send(Queued { value, inner: me });
        shared.drain();
    }

    fn on_error(&self, cause: MergeError) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(shared) = self.shared.upgrade() {
            shared.inner_terminated(self.id, Some(cause));
        }
    }

    fn on_complete(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(shared) = self.shared.upgrade() {
            shared.inner_terminated(self.id, None);
        }
    }
}

/// Control handle given to the downstream subscriber
struct DownstreamSubscription<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Subscription for DownstreamSubscription<T>
where
    T: Send + 'static,
{
    fn request(&self, n: u64) {
        debug!(n, "DownstreamSubscription::request: called");
        if n == 0 {
            self.shared.fail(MergeError::InvalidDemand { requested: n });
            return;
        }

        add_demand(&self.shared.requested, n);
        if let Some(tracker) = self.shared.tracker() {
            tracker.accumulate_demand(n, self.shared.is_done());
        }
        self.shared.drain();
    }

    fn cancel(&self) {
        debug!("DownstreamSubscription::cancel: called");
        if self.shared.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.cancel_inners();
        if let Some(tracker) = self.shared.tracker() {
            tracker.cancel_upstream();
        }
        self.shared.drain();
    }
}

/// Default single-subscriber fan-in engine
pub struct MergeEngine<T> {
    shared: Arc<Shared<T>>,
}

impl<T> MergeEngine<T>
where
    T: Send + 'static,
{
    pub fn new() -> Self {
        debug!("MergeEngine::new: called");
        let (queue_tx, queue_rx) = crossbeam_channel::unbounded();
        Self {
            shared: Arc::new(Shared {
                tracker: OnceLock::new(),
                downstream: OnceLock::new(),
                downstream_ready: AtomicBool::new(false),
                queue_tx,
                queue_rx,
                requested: AtomicU64::new(0),
                wip: AtomicUsize::new(0),
                completion_scheduled: AtomicBool::new(false),
                error: OnceLock::new(),
                terminated: AtomicBool::new(false),
                cancelled: AtomicBool::new(false),
                capacity: AtomicU64::new(DEFAULT_CAPACITY),
                environment: ArcSwapOption::new(None),
                inners: Mutex::new(HashMap::new()),
                next_inner_id: AtomicU64::new(0),
                emitted: AtomicU64::new(0),
            }),
        }
    }

    /// Inner streams currently subscribed
    pub fn active_sources(&self) -> usize {
        self.shared.inners.lock().len()
    }

    /// Values delivered downstream so far
    pub fn emitted(&self) -> u64 {
        self.shared.emitted.load(Ordering::Relaxed)
    }

    /// Values received from inner streams but not yet delivered
    pub fn buffered(&self) -> usize {
        self.shared.queue_rx.len()
    }

    /// True once downstream has seen a terminal signal
    pub fn is_terminated(&self) -> bool {
        self.shared.terminated.load(Ordering::Acquire)
    }
}

impl<T> Default for MergeEngine<T>
where
    T: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Publisher<T> for MergeEngine<T>
where
    T: Send + 'static,
{
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        debug!("MergeEngine::subscribe: called");
        if self.shared.downstream.set(subscriber.clone()).is_err() {
            warn!("Merged stream already has a subscriber, rejecting");
            subscriber.on_subscribe(Arc::new(NoopSubscription));
            subscriber.on_error(MergeError::AlreadySubscribed);
            return;
        }

        subscriber.on_subscribe(Arc::new(DownstreamSubscription {
            shared: self.shared.clone(),
        }));
        self.shared.downstream_ready.store(true, Ordering::Release);
        self.shared.drain();
    }
}

impl<T> FanInEngine<T> for MergeEngine<T>
where
    T: Send + 'static,
{
    fn bind(&self, tracker: Weak<dyn SourceTracker>) -> Result<(), MergeError> {
        debug!("MergeEngine::bind: called");
        self.shared
            .tracker
            .set(tracker)
            .map_err(|_| MergeError::EngineAlreadyBound)
    }

    fn add_source(&self, source: BoxPublisher<T>) {
        let id = self.shared.next_inner_id.fetch_add(1, Ordering::Relaxed);
        if self.shared.is_done() {
            debug!(id, "MergeEngine::add_source: merged stream already finished, dropping source");
            self.shared.release_source(id);
            return;
        }

        let prefetch = self.shared.capacity.load(Ordering::Acquire);
        debug!(id, prefetch, "MergeEngine::add_source: called");

        let inner = InnerSubscriber::new(id, Arc::downgrade(&self.shared), prefetch);
        self.shared.inners.lock().insert(id, inner.clone());

        match self.shared.environment.load_full() {
            Some(environment) => environment.dispatch(move || source.subscribe(inner)),
            None => source.subscribe(inner),
        }
    }

    fn on_error(&self, cause: MergeError) {
        self.shared.fail(cause);
    }

    fn schedule_completion(&self) {
        debug!("MergeEngine::schedule_completion: called");
        self.shared.completion_scheduled.store(true, Ordering::Release);
        self.shared.drain();
    }

    fn capacity(&self, elements: u64) {
        debug!(elements, "MergeEngine::capacity: called");
        self.shared.capacity.store(elements.max(1), Ordering::Release);
    }

    fn environment(&self, environment: Arc<Environment>) {
        debug!(kind = ?environment.kind(), "MergeEngine::environment: called");
        self.shared.environment.store(Some(environment));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::merge::MergeCoordinator;
    use crate::reactive::{ChannelSubscriber, FailedPublisher, IterPublisher, Signal};

    /// Downstream subscriber driven by hand
    #[derive(Default)]
    struct ManualSubscriber {
        subscription: Mutex<Option<Arc<dyn Subscription>>>,
        values: Mutex<Vec<u32>>,
        errors: Mutex<Vec<MergeError>>,
        completions: AtomicUsize,
    }

    impl ManualSubscriber {
        fn request(&self, n: u64) {
            let subscription = self.subscription.lock().clone();
            if let Some(subscription) = subscription {
                subscription.request(n);
            }
        }

        fn cancel(&self) {
            let subscription = self.subscription.lock().clone();
            if let Some(subscription) = subscription {
                subscription.cancel();
            }
        }

        fn values(&self) -> Vec<u32> {
            self.values.lock().clone()
        }
    }

    impl Subscriber<u32> for ManualSubscriber {
        fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
            *self.subscription.lock() = Some(subscription);
        }

        fn on_next(&self, value: u32) {
            self.values.lock().push(value);
        }

        fn on_error(&self, cause: MergeError) {
            self.errors.lock().push(cause);
        }

        fn on_complete(&self) {
            self.completions.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Outer handle that records requests and cancellation
    #[derive(Default)]
    struct OuterProbe {
        requests: Mutex<Vec<u64>>,
        cancelled: AtomicBool,
    }

    impl Subscription for OuterProbe {
        fn request(&self, n: u64) {
            self.requests.lock().push(n);
        }

        fn cancel(&self) {
            self.cancelled.store(true, Ordering::SeqCst);
        }
    }

    fn source(values: Vec<u32>) -> BoxPublisher<u32> {
        Arc::new(IterPublisher::new(values))
    }

    fn outer(inners: Vec<BoxPublisher<u32>>) -> IterPublisher<BoxPublisher<u32>> {
        IterPublisher::new(inners)
    }

    async fn collect(mut rx: tokio::sync::mpsc::UnboundedReceiver<Signal<u32>>) -> (Vec<u32>, Signal<u32>) {
        let mut values = Vec::new();
        loop {
            let signal = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("merge did not terminate in time")
                .expect("channel closed before a terminal signal");
            match signal {
                Signal::Next(v) => values.push(v),
                terminal => return (values, terminal),
            }
        }
    }

    #[tokio::test]
    async fn test_merges_all_inner_values_and_completes() {
        let coordinator = MergeCoordinator::<u32>::new();
        let (subscriber, rx) = ChannelSubscriber::new(4);
        coordinator.subscribe(subscriber);

        outer(vec![source(vec![1, 2, 3]), source(vec![10, 20]), source(vec![100])]).subscribe(coordinator.clone());

        let (mut values, terminal) = collect(rx).await;
        assert!(matches!(terminal, Signal::Complete));
        values.sort();
        assert_eq!(values, vec![1, 2, 3, 10, 20, 100]);
        assert_eq!(coordinator.in_flight(), 0);
        assert!(coordinator.stats().completion_requested);
        assert_eq!(coordinator.engine().emitted(), 6);
        assert_eq!(coordinator.engine().active_sources(), 0);
    }

    #[tokio::test]
    async fn test_per_stream_order_is_preserved() {
        let coordinator = MergeCoordinator::<u32>::new();
        coordinator.capacity(2);
        let (subscriber, rx) = ChannelSubscriber::new(3);
        coordinator.subscribe(subscriber);

        outer(vec![source((0..20).collect()), source((100..120).collect())]).subscribe(coordinator.clone());

        let (values, terminal) = collect(rx).await;
        assert!(matches!(terminal, Signal::Complete));

        let low: Vec<_> = values.iter().copied().filter(|v| *v < 100).collect();
        let high: Vec<_> = values.iter().copied().filter(|v| *v >= 100).collect();
        assert_eq!(low, (0..20).collect::<Vec<_>>());
        assert_eq!(high, (100..120).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_empty_outer_completes() {
        let coordinator = MergeCoordinator::<u32>::new();
        let (subscriber, rx) = ChannelSubscriber::new(1);
        coordinator.subscribe(subscriber);

        outer(vec![]).subscribe(coordinator.clone());

        let (values, terminal) = collect(rx).await;
        assert!(values.is_empty());
        assert!(matches!(terminal, Signal::Complete));
    }

    #[tokio::test]
    async fn test_inner_error_fails_merged_stream() {
        let coordinator = MergeCoordinator::<u32>::new();
        let (subscriber, rx) = ChannelSubscriber::new(16);
        coordinator.subscribe(subscriber);

        let failing: BoxPublisher<u32> = Arc::new(FailedPublisher::new(MergeError::InvalidDemand { requested: 0 }));
        outer(vec![source(vec![1]), failing, source(vec![2])]).subscribe(coordinator.clone());

        let (_values, terminal) = collect(rx).await;
        match terminal {
            Signal::Error(MergeError::InvalidDemand { requested }) => assert_eq!(requested, 0),
            other => panic!("expected the inner error, got {other:?}"),
        }
        assert!(coordinator.engine().is_terminated());
    }

    #[test]
    fn test_outer_error_reaches_downstream_once() {
        let coordinator = MergeCoordinator::<u32>::new();
        let downstream = Arc::new(ManualSubscriber::default());
        coordinator.subscribe(downstream.clone());

        let probe = Arc::new(OuterProbe::default());
        coordinator.on_outer_subscribed(probe.clone()).unwrap();
        coordinator.on_outer_error(MergeError::AlreadySubscribed);
        coordinator.on_outer_error(MergeError::InFlightUnderflow);

        let errors = downstream.errors.lock().clone();
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], MergeError::AlreadySubscribed));
        assert_eq!(downstream.completions.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_values_wait_for_demand() {
        let coordinator = MergeCoordinator::<u32>::new();
        let downstream = Arc::new(ManualSubscriber::default());
        coordinator.subscribe(downstream.clone());

        let probe = Arc::new(OuterProbe::default());
        coordinator.on_outer_subscribed(probe.clone()).unwrap();
        coordinator.on_outer_next(source(vec![1, 2, 3, 4]));
        coordinator.on_outer_complete();

        // Prefetched into the engine, nothing delivered yet
        assert!(downstream.values().is_empty());
        assert_eq!(coordinator.engine().buffered(), 4);

        downstream.request(3);
        assert_eq!(downstream.values(), vec![1, 2, 3]);
        assert_eq!(downstream.completions.load(Ordering::SeqCst), 0);

        downstream.request(1);
        assert_eq!(downstream.values(), vec![1, 2, 3, 4]);
        assert_eq!(downstream.completions.load(Ordering::SeqCst), 1);

        // The outer producer already completed, so downstream demand stays parked
        assert!(probe.requests.lock().is_empty());
        assert_eq!(coordinator.pending_demand(), 4);
    }

    #[test]
    fn test_demand_reaches_outer_until_it_completes() {
        let coordinator = MergeCoordinator::<u32>::new();
        let downstream = Arc::new(ManualSubscriber::default());
        coordinator.subscribe(downstream.clone());

        let probe = Arc::new(OuterProbe::default());
        coordinator.on_outer_subscribed(probe.clone()).unwrap();
        downstream.request(2);
        assert_eq!(*probe.requests.lock(), vec![2]);

        coordinator.on_outer_next(source(vec![1, 2, 3, 4]));
        coordinator.on_outer_complete();
        downstream.request(2);

        assert_eq!(*probe.requests.lock(), vec![2]);
        assert_eq!(coordinator.pending_demand(), 2);
        assert_eq!(downstream.values(), vec![1, 2, 3, 4]);
        assert_eq!(downstream.completions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_zero_request_fails_stream() {
        let coordinator = MergeCoordinator::<u32>::new();
        let downstream = Arc::new(ManualSubscriber::default());
        coordinator.subscribe(downstream.clone());

        downstream.request(0);
        let errors = downstream.errors.lock().clone();
        assert!(matches!(errors.as_slice(), [MergeError::InvalidDemand { requested: 0 }]));
    }

    #[test]
    fn test_second_subscriber_is_rejected() {
        let coordinator = MergeCoordinator::<u32>::new();
        let first = Arc::new(ManualSubscriber::default());
        let second = Arc::new(ManualSubscriber::default());
        coordinator.subscribe(first.clone());
        coordinator.subscribe(second.clone());

        assert!(first.errors.lock().is_empty());
        let errors = second.errors.lock().clone();
        assert!(matches!(errors.as_slice(), [MergeError::AlreadySubscribed]));
    }

    #[test]
    fn test_cancel_stops_inner_and_outer() {
        let coordinator = MergeCoordinator::<u32>::new();
        coordinator.capacity(1);
        let downstream = Arc::new(ManualSubscriber::default());
        coordinator.subscribe(downstream.clone());

        let probe = Arc::new(OuterProbe::default());
        coordinator.on_outer_subscribed(probe.clone()).unwrap();
        coordinator.on_outer_next(source(vec![1, 2, 3]));
        assert_eq!(coordinator.engine().active_sources(), 1);

        assert_eq!(coordinator.in_flight(), 1);

        downstream.cancel();
        assert!(probe.cancelled.load(Ordering::SeqCst));
        assert_eq!(coordinator.engine().active_sources(), 0);
        // The cancelled inner stream is no longer counted as in flight
        assert_eq!(coordinator.in_flight(), 0);

        // Nothing flows after cancellation
        downstream.request(10);
        assert!(downstream.values().is_empty());
        assert_eq!(downstream.completions.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_sources_after_cancel_are_released() {
        let coordinator = MergeCoordinator::<u32>::new();
        let downstream = Arc::new(ManualSubscriber::default());
        coordinator.subscribe(downstream.clone());

        let probe = Arc::new(OuterProbe::default());
        coordinator.on_outer_subscribed(probe.clone()).unwrap();
        downstream.cancel();

        coordinator.on_outer_next(source(vec![4]));
        coordinator.on_outer_next(source(vec![5]));

        assert_eq!(coordinator.engine().active_sources(), 0);
        assert_eq!(coordinator.in_flight(), 0);
        assert_eq!(coordinator.to_string(), "{wip=0, requested=0}");

        let stats = coordinator.stats();
        assert_eq!(stats.inner_accepted, 2);
        assert_eq!(stats.inner_finished, 2);
        assert!(downstream.values().is_empty());
    }

    #[test]
    fn test_inner_error_releases_sibling_streams() {
        let coordinator = MergeCoordinator::<u32>::new();
        coordinator.capacity(1);
        let downstream = Arc::new(ManualSubscriber::default());
        coordinator.subscribe(downstream.clone());

        let probe = Arc::new(OuterProbe::default());
        coordinator.on_outer_subscribed(probe.clone()).unwrap();
        coordinator.on_outer_next(source(vec![1, 2, 3]));
        coordinator.on_outer_next(source(vec![4, 5, 6]));
        assert_eq!(coordinator.in_flight(), 2);

        let failing: BoxPublisher<u32> = Arc::new(FailedPublisher::new(MergeError::InFlightUnderflow));
        coordinator.on_outer_next(failing);

        let errors = downstream.errors.lock().clone();
        assert!(matches!(errors.as_slice(), [MergeError::InFlightUnderflow]));
        assert_eq!(coordinator.in_flight(), 0);
        assert_eq!(coordinator.engine().active_sources(), 0);
        assert!(probe.cancelled.load(Ordering::SeqCst));
    }

    #[test]
    fn test_demand_before_outer_subscription_is_flushed() {
        let coordinator = MergeCoordinator::<u32>::new();
        let downstream = Arc::new(ManualSubscriber::default());
        coordinator.subscribe(downstream.clone());

        downstream.request(5);
        assert_eq!(coordinator.pending_demand(), 5);

        let probe = Arc::new(OuterProbe::default());
        coordinator.on_outer_subscribed(probe.clone()).unwrap();
        assert_eq!(*probe.requests.lock(), vec![5]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_tokio_environment_merges_concurrently() {
        let coordinator = MergeCoordinator::<u32>::new();
        coordinator
            .capacity(8)
            .environment(Environment::tokio(tokio::runtime::Handle::current()));

        let (subscriber, rx) = ChannelSubscriber::new(16);
        coordinator.subscribe(subscriber);

        let inners: Vec<_> = (0..32u32).map(|i| source((i * 1000..i * 1000 + 50).collect())).collect();
        outer(inners).subscribe(coordinator.clone());

        let (values, terminal) = collect(rx).await;
        assert!(matches!(terminal, Signal::Complete));
        assert_eq!(values.len(), 32 * 50);
        assert_eq!(coordinator.in_flight(), 0);
        assert_eq!(coordinator.stats().inner_finished, 32);
    }
}
