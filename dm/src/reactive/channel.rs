//! Subscriber that forwards signals into a tokio channel

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwapOption;
use tokio::sync::mpsc;
use tracing::debug;

use super::protocol::{Subscriber, Subscription, UNBOUNDED};
use crate::error::MergeError;

/// Signal observed by a [`ChannelSubscriber`]
#[derive(Debug, Clone)]
pub enum Signal<T> {
    Next(T),
    Error(MergeError),
    Complete,
}

impl<T> Signal<T> {
    /// True for `Error` and `Complete`
    pub fn is_terminal(&self) -> bool {
        matches!(self, Signal::Error(_) | Signal::Complete)
    }
}

/// Handle stored so the subscriber can replenish demand or cancel
struct Upstream(Arc<dyn Subscription>);

/// Subscriber that requests in batches and forwards every signal to an unbounded channel
///
/// A `batch` of [`UNBOUNDED`] requests everything up front.
pub struct ChannelSubscriber<T> {
    tx: mpsc::UnboundedSender<Signal<T>>,
    batch: u64,
    received: AtomicU64,
    upstream: ArcSwapOption<Upstream>,
}

impl<T> ChannelSubscriber<T>
where
    T: Send + 'static,
{
    /// Create a subscriber plus the receiving end of its signal channel
    pub fn new(batch: u64) -> (Arc<Self>, mpsc::UnboundedReceiver<Signal<T>>) {
        debug!(batch, "ChannelSubscriber::new: called");
        let (tx, rx) = mpsc::unbounded_channel();
        let subscriber = Arc::new(Self {
            tx,
            batch: batch.max(1),
            received: AtomicU64::new(0),
            upstream: ArcSwapOption::new(None),
        });
        (subscriber, rx)
    }

    /// Request more elements from the producer, if subscribed
    pub fn request(&self, n: u64) {
        debug!(n, "ChannelSubscriber::request: called");
        if let Some(upstream) = self.upstream.load_full() {
            upstream.0.request(n);
        }
    }

    /// Cancel the producer, if subscribed
    pub fn cancel(&self) {
        debug!("ChannelSubscriber::cancel: called");
        if let Some(upstream) = self.upstream.swap(None) {
            upstream.0.cancel();
        }
    }
}

impl<T> Subscriber<T> for ChannelSubscriber<T>
where
    T: Send + 'static,
{
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        debug!(batch = self.batch, "ChannelSubscriber::on_subscribe: called");
        self.upstream.store(Some(Arc::new(Upstream(subscription.clone()))));
        subscription.request(self.batch);
    }

    fn on_next(&self, value: T) {
        let _ = self.tx.send(Signal::Next(value));

        if self.batch == UNBOUNDED {
            return;
        }
        let received = self.received.fetch_add(1, Ordering::AcqRel) + 1;
        if received % self.batch == 0 {
            self.request(self.batch);
        }
    }

    fn on_error(&self, cause: MergeError) {
        debug!(%cause, "ChannelSubscriber::on_error: called");
        self.upstream.store(None);
        let _ = self.tx.send(Signal::Error(cause));
    }

    fn on_complete(&self) {
        debug!("ChannelSubscriber::on_complete: called");
        self.upstream.store(None);
        let _ = self.tx.send(Signal::Complete);
    }
}
