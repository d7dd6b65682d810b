//! Per-tenant throughput guard
//!
//! A full-reset token bucket: the scheduler calls `refill` once per tick and
//! the budget jumps straight back to `capacity`. Within one tick a tenant can
//! push at most `capacity` bytes upstream, then it waits for the next refill.
//! A capacity of 0 means unlimited and skips all bookkeeping.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Upper bound on how long a denied consumer sleeps before re-checking
pub const RETRY_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug)]
struct Bucket {
    budget: u64,
    last_refill: Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    capacity: u64,
    bucket: Mutex<Bucket>,
    refilled: Notify,
}

impl RateLimiter {
    /// Create a limiter granting `capacity` bytes per refill (0 = unlimited)
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            bucket: Mutex::new(Bucket {
                budget: capacity,
                last_refill: Instant::now(),
            }),
            refilled: Notify::new(),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn is_unlimited(&self) -> bool {
        self.capacity == 0
    }

    /// Bytes left in the current window (`u64::MAX` when unlimited)
    pub fn available(&self) -> u64 {
        if self.is_unlimited() {
            return u64::MAX;
        }
        self.bucket().budget
    }

    pub fn last_refill(&self) -> Instant {
        self.bucket().last_refill
    }

    /// Take `n` bytes from the budget, all or nothing
    pub fn try_consume(&self, n: u64) -> bool {
        if self.is_unlimited() {
            return true;
        }

        let mut bucket = self.bucket();
        if bucket.budget >= n {
            bucket.budget -= n;
            true
        } else {
            false
        }
    }

    /// Take as much of `max` as the budget allows and return the amount granted
    pub fn try_consume_up_to(&self, max: u64) -> u64 {
        if self.is_unlimited() {
            return max;
        }

        let mut bucket = self.bucket();
        let granted = bucket.budget.min(max);
        bucket.budget -= granted;
        granted
    }

    /// Wait until `n` bytes can be taken in one piece
    ///
    /// Never completes when `n` exceeds a non-zero capacity.
    pub async fn acquire(&self, n: u64) {
        self.wait_until(|| self.try_consume(n).then_some(())).await
    }

    /// Wait until a non-zero part of `max` can be granted
    pub async fn acquire_up_to(&self, max: u64) -> u64 {
        if max == 0 {
            return 0;
        }

        self.wait_until(|| {
            let granted = self.try_consume_up_to(max);
            (granted > 0).then_some(granted)
        })
        .await
    }

    /// Retry `attempt` after every refill, re-checking at most every `RETRY_INTERVAL`
    async fn wait_until<T>(&self, mut attempt: impl FnMut() -> Option<T>) -> T {
        loop {
            let notified = self.refilled.notified();
            tokio::pin!(notified);
            // Register before checking so a refill between the check and the
            // await is not missed.
            notified.as_mut().enable();

            if let Some(granted) = attempt() {
                return granted;
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(RETRY_INTERVAL) => {}
            }
        }
    }

    /// Reset the budget to full capacity and wake every waiter
    pub fn refill(&self) {
        if self.is_unlimited() {
            return;
        }

        {
            let mut bucket = self.bucket();
            bucket.budget = self.capacity;
            bucket.last_refill = Instant::now();
        }
        // waiters only run after the new budget is visible
        self.refilled.notify_waiters();
    }

    fn bucket(&self) -> MutexGuard<'_, Bucket> {
        self.bucket.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
