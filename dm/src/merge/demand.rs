//! Pending upstream demand
//!
//! Demand issued by the downstream consumer that could not be forwarded to the
//! outer producer yet, either because its control handle has not arrived or
//! because the outer producer already finished. The accumulator only grows
//! (saturating at `u64::MAX`) until it is drained with a single atomic swap.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

/// Saturating, lock-free demand accumulator
#[derive(Debug, Default)]
pub struct DemandAccumulator {
    pending: AtomicU64,
}

impl DemandAccumulator {
    pub const fn new() -> Self {
        Self {
            pending: AtomicU64::new(0),
        }
    }

    /// Add `elements`, saturating at `u64::MAX`; returns the new total
    pub fn add(&self, elements: u64) -> u64 {
        debug!(elements, "DemandAccumulator::add: called");
        let previous = match self
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(current.saturating_add(elements))
            }) {
            Ok(previous) => previous,
            Err(previous) => previous,
        };
        previous.saturating_add(elements)
    }

    /// Read and reset to zero in one atomic step
    pub fn take(&self) -> u64 {
        let taken = self.pending.swap(0, Ordering::SeqCst);
        debug!(taken, "DemandAccumulator::take: called");
        taken
    }

    /// Current pending total
    pub fn get(&self) -> u64 {
        self.pending.load(Ordering::SeqCst)
    }
}

/// Combine fresh demand with a residual amount
///
/// Returns `(forward, shortfall)`: the amount to forward upstream, capped at
/// `u64::MAX`, and whatever did not fit.
pub fn combine(elements: u64, residual: u64) -> (u64, u64) {
    match elements.checked_add(residual) {
        Some(total) => (total, 0),
        // elements + residual - MAX, computed without overflowing
        None => (u64::MAX, elements - (u64::MAX - residual)),
    }
}
