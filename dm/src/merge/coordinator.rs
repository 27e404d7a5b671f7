//! Merge coordinator: the outer-stream side of a dynamic fan-in
//!
//! The coordinator subscribes to a stream of streams. It counts inner streams
//! in flight, parks downstream demand until the outer producer's control handle
//! exists, and decides when the merged output may complete. Everything it
//! shares across threads is an atomic; no call blocks.
//!
//! Completion policy: when the outer producer completes while inner streams are
//! still in flight, the coordinator remembers that and requests completion
//! itself from `decrement_wip` on the transition to zero. A latch guarantees
//! the engine sees at most one completion request.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwapOption;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::MergeError;
use crate::reactive::{BoxPublisher, Publisher, Subscriber, Subscription};

use super::demand::{DemandAccumulator, combine};
use super::engine::{FanInEngine, SourceTracker};
use super::environment::Environment;
use super::fan_in::MergeEngine;
use super::in_flight::InFlightCounter;
use super::stats::MergeStats;

/// Prefetch per inner stream when nothing else is configured
pub const DEFAULT_CAPACITY: u64 = 128;

/// The outer producer's control handle
struct OuterHandle(Arc<dyn Subscription>);

/// Configuration the stage applies to itself after forwarding to the engine
struct StageSettings {
    capacity: AtomicU64,
    environment: ArcSwapOption<Environment>,
}

/// Coordinates the outer stream-of-streams against a multiplexing engine
pub struct MergeCoordinator<T, E = MergeEngine<T>>
where
    T: Send + 'static,
    E: FanInEngine<T>,
{
    stage_id: String,
    engine: Arc<E>,
    in_flight: InFlightCounter,
    pending: DemandAccumulator,
    /// Set once, never cleared
    outer: ArcSwapOption<OuterHandle>,
    /// Published after `outer` is stored; pairs with the pending-demand recheck
    outer_ready: AtomicBool,
    outer_completed: AtomicBool,
    completion_requested: AtomicBool,
    inner_accepted: AtomicU64,
    inner_finished: AtomicU64,
    settings: StageSettings,
    _marker: PhantomData<fn(T)>,
}

impl<T> MergeCoordinator<T, MergeEngine<T>>
where
    T: Send + 'static,
{
    /// Create a coordinator wired to a fresh default engine
    pub fn new() -> Arc<Self> {
        debug!("MergeCoordinator::new: called");
        let (coordinator, bound) = Self::wire(Arc::new(MergeEngine::new()));
        // A fresh engine has no tracker yet
        debug_assert!(bound.is_ok());
        coordinator
    }
}

impl<T, E> MergeCoordinator<T, E>
where
    T: Send + 'static,
    E: FanInEngine<T>,
{
    /// Create a coordinator around a caller-supplied engine
    ///
    /// Fails with `EngineAlreadyBound` when the engine already serves another coordinator.
    pub fn with_engine(engine: Arc<E>) -> Result<Arc<Self>, MergeError> {
        debug!("MergeCoordinator::with_engine: called");
        let (coordinator, bound) = Self::wire(engine);
        bound.map(|_| coordinator)
    }

    /// Build the coordinator and hand the engine its back-reference in one step
    fn wire(engine: Arc<E>) -> (Arc<Self>, Result<(), MergeError>) {
        let mut bound = Ok(());
        let coordinator = Arc::new_cyclic(|weak: &Weak<Self>| {
            let tracker: Weak<dyn SourceTracker> = weak.clone();
            bound = engine.bind(tracker);
            Self {
                stage_id: Uuid::now_v7().to_string(),
                engine,
                in_flight: InFlightCounter::new(),
                pending: DemandAccumulator::new(),
                outer: ArcSwapOption::new(None),
                outer_ready: AtomicBool::new(false),
                outer_completed: AtomicBool::new(false),
                completion_requested: AtomicBool::new(false),
                inner_accepted: AtomicU64::new(0),
                inner_finished: AtomicU64::new(0),
                settings: StageSettings {
                    capacity: AtomicU64::new(DEFAULT_CAPACITY),
                    environment: ArcSwapOption::new(None),
                },
                _marker: PhantomData,
            }
        });
        if let Err(e) = &bound {
            error!(error = %e, "MergeCoordinator::wire: engine refused binding");
        }
        (coordinator, bound)
    }

    pub fn stage_id(&self) -> &str {
        &self.stage_id
    }

    /// The engine that produces the merged output
    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.get()
    }

    pub fn pending_demand(&self) -> u64 {
        self.pending.get()
    }

    /// True while the outer producer is attached or inner streams are still running
    pub fn has_producer(&self) -> bool {
        self.outer_ready.load(Ordering::SeqCst) || !self.in_flight.is_idle()
    }

    /// Subscribe the final consumer; the engine is the producer of record
    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        debug!(stage_id = %self.stage_id, "MergeCoordinator::subscribe: called");
        self.engine.subscribe(subscriber);
    }

    /// The outer producer acknowledged our subscription
    ///
    /// Stores the handle and flushes demand parked before it existed. A second
    /// handle is cancelled and reported as `HandleAlreadySet`.
    pub fn on_outer_subscribed(&self, handle: Arc<dyn Subscription>) -> Result<(), MergeError> {
        debug!(stage_id = %self.stage_id, "MergeCoordinator::on_outer_subscribed: called");
        let none: Option<Arc<OuterHandle>> = None;
        let previous = self
            .outer
            .compare_and_swap(&none, Some(Arc::new(OuterHandle(handle.clone()))));
        if previous.is_some() {
            warn!(stage_id = %self.stage_id, "Outer control handle already set, cancelling the new one");
            handle.cancel();
            return Err(MergeError::HandleAlreadySet);
        }
        self.outer_ready.store(true, Ordering::SeqCst);
        info!(stage_id = %self.stage_id, "Outer producer subscribed");

        let to_request = self.pending.take();
        if to_request > 0 {
            debug!(stage_id = %self.stage_id, to_request, "MergeCoordinator::on_outer_subscribed: flushing parked demand");
            handle.request(to_request);
        }
        Ok(())
    }

    /// Accept one inner stream from the outer producer
    pub fn on_outer_next(&self, inner: BoxPublisher<T>) {
        let in_flight = self.in_flight.increment();
        self.inner_accepted.fetch_add(1, Ordering::Relaxed);
        debug!(stage_id = %self.stage_id, in_flight, "MergeCoordinator::on_outer_next: registering inner stream");
        self.engine.add_source(inner);
    }

    /// The outer producer will send no more inner streams
    pub fn on_outer_complete(&self) {
        debug!(stage_id = %self.stage_id, "MergeCoordinator::on_outer_complete: called");
        self.outer_completed.store(true, Ordering::SeqCst);
        if self.in_flight.is_idle() {
            self.request_completion();
        } else {
            debug!(
                stage_id = %self.stage_id,
                in_flight = self.in_flight.get(),
                "MergeCoordinator::on_outer_complete: inner streams still running, deferring completion"
            );
        }
    }

    /// The outer producer failed; forwarded to the engine untouched
    pub fn on_outer_error(&self, cause: MergeError) {
        warn!(stage_id = %self.stage_id, %cause, "Outer producer failed");
        self.engine.on_error(cause);
    }

    /// Never valid: the engine, not the coordinator, owns the downstream subscription
    pub fn create_subscription(
        &self,
        _subscriber: Arc<dyn Subscriber<T>>,
    ) -> Result<Arc<dyn Subscription>, MergeError> {
        error!(stage_id = %self.stage_id, "MergeCoordinator::create_subscription: wiring defect, coordinator never owns a subscription");
        Err(MergeError::UnsupportedOperation {
            operation: "create_subscription",
        })
    }

    /// Set per-source capacity on the engine, then on this stage; zero is raised to one
    pub fn capacity(&self, elements: u64) -> &Self {
        debug!(stage_id = %self.stage_id, elements, "MergeCoordinator::capacity: called");
        let elements = elements.max(1);
        self.engine.capacity(elements);
        self.settings.capacity.store(elements, Ordering::Release);
        self
    }

    /// Set the execution environment on the engine, then on this stage
    pub fn environment(&self, environment: Environment) -> &Self {
        debug!(stage_id = %self.stage_id, kind = ?environment.kind(), "MergeCoordinator::environment: called");
        let environment = Arc::new(environment);
        self.engine.environment(environment.clone());
        self.settings.environment.store(Some(environment));
        self
    }

    pub fn current_capacity(&self) -> u64 {
        self.settings.capacity.load(Ordering::Acquire)
    }

    pub fn current_environment(&self) -> Option<Arc<Environment>> {
        self.settings.environment.load_full()
    }

    pub fn stats(&self) -> MergeStats {
        MergeStats {
            stage_id: self.stage_id.clone(),
            in_flight: self.in_flight.get(),
            pending_demand: self.pending.get(),
            inner_accepted: self.inner_accepted.load(Ordering::Relaxed),
            inner_finished: self.inner_finished.load(Ordering::Relaxed),
            outer_subscribed: self.outer_ready.load(Ordering::SeqCst),
            outer_completed: self.outer_completed.load(Ordering::SeqCst),
            completion_requested: self.completion_requested.load(Ordering::SeqCst),
        }
    }

    fn outer_handle(&self) -> Option<Arc<dyn Subscription>> {
        if !self.outer_ready.load(Ordering::SeqCst) {
            return None;
        }
        self.outer.load_full().map(|h| h.0.clone())
    }

    fn request_completion(&self) {
        if self.completion_requested.swap(true, Ordering::SeqCst) {
            debug!(stage_id = %self.stage_id, "MergeCoordinator::request_completion: already requested");
            return;
        }
        info!(stage_id = %self.stage_id, "All inner streams finished, scheduling completion");
        self.engine.schedule_completion();
    }
}

impl<T, E> SourceTracker for MergeCoordinator<T, E>
where
    T: Send + 'static,
    E: FanInEngine<T>,
{
    fn decrement_wip(&self) -> Result<usize, MergeError> {
        let remaining = match self.in_flight.decrement() {
            Ok(remaining) => remaining,
            Err(e) => {
                error!(stage_id = %self.stage_id, error = %e, "MergeCoordinator::decrement_wip: accounting violated");
                return Err(e);
            }
        };
        self.inner_finished.fetch_add(1, Ordering::Relaxed);
        debug!(stage_id = %self.stage_id, remaining, "MergeCoordinator::decrement_wip: inner stream finished");

        if remaining == 0 && self.outer_completed.load(Ordering::SeqCst) {
            self.request_completion();
        }
        Ok(remaining)
    }

    fn accumulate_demand(&self, elements: u64, outer_terminated: bool) {
        debug!(stage_id = %self.stage_id, elements, outer_terminated, "MergeCoordinator::accumulate_demand: called");
        if elements == 0 {
            return;
        }

        // A completed outer producer takes no more demand; keep it parked
        let terminated = outer_terminated || self.outer_completed.load(Ordering::SeqCst);

        if !terminated && let Some(handle) = self.outer_handle() {
            let residual = self.pending.take();
            let (forward, shortfall) = combine(elements, residual);
            if shortfall > 0 {
                debug!(stage_id = %self.stage_id, shortfall, "MergeCoordinator::accumulate_demand: demand saturated, parking shortfall");
                self.pending.add(shortfall);
            }
            handle.request(forward);
            return;
        }

        self.pending.add(elements);

        // The handle may have been published between the check above and the add;
        // whoever swaps the accumulator first forwards it
        if !terminated
            && let Some(handle) = self.outer_handle()
        {
            let parked = self.pending.take();
            if parked > 0 {
                handle.request(parked);
            }
        }
    }

    fn cancel_upstream(&self) {
        debug!(stage_id = %self.stage_id, "MergeCoordinator::cancel_upstream: called");
        if let Some(handle) = self.outer_handle() {
            handle.cancel();
        }
    }
}

impl<T, E> Subscriber<BoxPublisher<T>> for MergeCoordinator<T, E>
where
    T: Send + 'static,
    E: FanInEngine<T>,
{
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        if let Err(e) = self.on_outer_subscribed(subscription) {
            warn!(stage_id = %self.stage_id, error = %e, "Rejected outer subscription");
        }
    }

    fn on_next(&self, inner: BoxPublisher<T>) {
        self.on_outer_next(inner);
    }

    fn on_error(&self, cause: MergeError) {
        self.on_outer_error(cause);
    }

    fn on_complete(&self) {
        self.on_outer_complete();
    }
}

impl<T, E> Publisher<T> for MergeCoordinator<T, E>
where
    T: Send + 'static,
    E: FanInEngine<T>,
{
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        MergeCoordinator::subscribe(self, subscriber);
    }
}

impl<T, E> fmt::Display for MergeCoordinator<T, E>
where
    T: Send + 'static,
    E: FanInEngine<T>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{wip={}, requested={}}}", self.in_flight.get(), self.pending.get())
    }
}
