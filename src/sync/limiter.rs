//! Shared REST rate limiter
//!
//! One gate per collector, shared by every symbol's controller. Slot times
//! are handed out under a fair mutex so waiters are served FIFO and a mass
//! resync cannot starve any single symbol.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};

/// Fixed-interval gate: at most one grant per `min_interval`
#[derive(Debug)]
pub struct RestRateLimiter {
    min_interval: Duration,
    next_slot: Mutex<Instant>,
}

impl RestRateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            next_slot: Mutex::new(Instant::now()),
        }
    }

    /// Wait for the next free slot. Never fails; a resync waits for its
    /// token rather than erroring out.
    pub async fn acquire(&self) {
        let slot = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = (*next).max(now);
            *next = slot + self.min_interval;
            slot
        };
        // Sleep outside the lock; slots are monotonic so order is preserved
        sleep_until(slot).await;
    }
}
