//! Count of inner streams that are registered but not yet terminated

use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{debug, error};

use crate::error::MergeError;

/// Lock-free in-flight counter that refuses to go negative
#[derive(Debug, Default)]
pub struct InFlightCounter {
    count: AtomicUsize,
}

impl InFlightCounter {
    pub const fn new() -> Self {
        Self {
            count: AtomicUsize::new(0),
        }
    }

    /// Register one inner stream; returns the post-increment count
    pub fn increment(&self) -> usize {
        let count = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(count, "InFlightCounter::increment: called");
        count
    }

    /// Retire one inner stream; returns the post-decrement count
    ///
    /// A decrement at zero leaves the counter untouched and returns
    /// `MergeError::InFlightUnderflow`.
    pub fn decrement(&self) -> Result<usize, MergeError> {
        match self
            .count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| current.checked_sub(1))
        {
            Ok(previous) => {
                let count = previous - 1;
                debug!(count, "InFlightCounter::decrement: called");
                Ok(count)
            }
            Err(_) => {
                error!("InFlightCounter::decrement: underflow, more terminations than registrations");
                Err(MergeError::InFlightUnderflow)
            }
        }
    }

    pub fn get(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn is_idle(&self) -> bool {
        self.get() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_increment_decrement() {
        let counter = InFlightCounter::new();
        assert!(counter.is_idle());

        assert_eq!(counter.increment(), 1);
        assert_eq!(counter.increment(), 2);
        assert_eq!(counter.decrement().unwrap(), 1);
        assert_eq!(counter.decrement().unwrap(), 0);
        assert!(counter.is_idle());
    }

    #[test]
    fn test_underflow_is_an_error_not_a_clamp() {
        let counter = InFlightCounter::new();
        let err = counter.decrement().unwrap_err();
        assert!(matches!(err, MergeError::InFlightUnderflow));
        assert!(err.is_fatal());
        assert_eq!(counter.get(), 0);

        // A later registration still counts from zero
        counter.increment();
        assert_eq!(counter.get(), 1);
    }

    #[test]
    fn test_concurrent_decrements_never_go_negative() {
        let counter = Arc::new(InFlightCounter::new());
        for _ in 0..1_000 {
            counter.increment();
        }

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let counter = counter.clone();
                thread::spawn(move || {
                    let mut ok = 0;
                    let mut underflows = 0;
                    for _ in 0..200 {
                        match counter.decrement() {
                            Ok(_) => ok += 1,
                            Err(_) => underflows += 1,
                        }
                    }
                    (ok, underflows)
                })
            })
            .collect();

        let (ok, underflows) = workers
            .into_iter()
            .map(|w| w.join().unwrap())
            .fold((0, 0), |acc, r| (acc.0 + r.0, acc.1 + r.1));

        // 1600 attempts against 1000 registrations
        assert_eq!(ok, 1_000);
        assert_eq!(underflows, 600);
        assert_eq!(counter.get(), 0);
    }
}
