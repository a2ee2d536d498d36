//! Dependency barrier counter.
//!
//! A task created with `n` outstanding dependencies carries a counter
//! starting at `n`. Each dependency, on completion, either decrements the
//! counter by one (`notify_ready`, used when a dependency resolves
//! individually after the task was constructed) or the constructor
//! subtracts the count of dependencies that were already complete in one
//! shot (`subtract`, used for the dependencies that raced ahead of
//! `add_waiter` during construction). Both paths detect "this decrement
//! is the one that brought the counter to zero" by comparing the *previous*
//! value returned by `fetch_sub` against the amount subtracted — this
//! mirrors the original's `Atomic<uint32_t>::Decrement()`/`Sub()`, which
//! likewise report the pre-operation value.

use std::sync::atomic::{AtomicU32, Ordering};

pub struct Barrier {
    count: AtomicU32,
}

impl Barrier {
    pub fn new(count: u32) -> Self {
        Self {
            count: AtomicU32::new(count),
        }
    }

    /// Decrement by one. Returns `true` if this call crossed the counter
    /// to zero (i.e. the task is now ready to run).
    pub fn notify_ready(&self) -> bool {
        self.count.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Subtract `amount` in one shot. Returns `true` if this call crossed
    /// the counter to zero.
    pub fn subtract(&self, amount: u32) -> bool {
        if amount == 0 {
            return false;
        }
        self.count.fetch_sub(amount, Ordering::AcqRel) == amount
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_decrement_to_zero_reports_true() {
        let b = Barrier::new(1);
        assert!(b.notify_ready());
    }

    #[test]
    fn decrements_before_zero_report_false() {
        let b = Barrier::new(3);
        assert!(!b.notify_ready());
        assert!(!b.notify_ready());
        assert!(b.notify_ready());
    }

    #[test]
    fn bulk_subtract_crossing_zero_reports_true() {
        let b = Barrier::new(5);
        assert!(!b.subtract(3));
        assert!(b.subtract(2));
    }

    #[test]
    fn zero_amount_subtract_never_reports_true() {
        let b = Barrier::new(0);
        assert!(!b.subtract(0));
    }
}
