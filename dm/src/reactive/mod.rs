//! Push/pull stream protocol primitives
//!
//! A minimal Reactive-Streams-style contract:
//! - **Publisher:** accepts subscribers
//! - **Subscription:** the control handle a subscriber uses to signal demand or cancel
//! - **Subscriber:** receives `on_subscribe`, then any number of `on_next`, then at most
//!   one terminal `on_error` or `on_complete`
//!
//! Demand is a `u64`; [`UNBOUNDED`] means "no limit".

mod channel;
mod iter;
mod protocol;

pub use channel::{ChannelSubscriber, Signal};
pub use iter::{FailedPublisher, IterPublisher};
pub use protocol::{BoxPublisher, NoopSubscription, Publisher, Subscriber, Subscription, UNBOUNDED, add_demand};
