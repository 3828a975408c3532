//! Shared throttle for calls to external services.
//!
//! One [`Throttle`] is created per process and cloned into every
//! collaborator wrapper, so embedding, search, fetch, and completion calls
//! all draw from the same concurrency budget no matter which component
//! issued them. Optionally enforces a minimum spacing between call starts.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::config::LimitsConfig;

#[derive(Clone)]
pub struct Throttle {
    permits: Arc<Semaphore>,
    min_interval: Duration,
    next_start: Arc<Mutex<Instant>>,
}

impl Throttle {
    pub fn new(max_concurrency: usize, min_interval: Duration) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
            min_interval,
            next_start: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn from_config(limits: &LimitsConfig) -> Self {
        Self::new(
            limits.max_concurrency,
            Duration::from_millis(limits.min_interval_ms),
        )
    }

    /// No concurrency cap worth mentioning and no spacing. Used in tests.
    pub fn unlimited() -> Self {
        Self::new(Semaphore::MAX_PERMITS, Duration::ZERO)
    }

    /// Wait for a slot. The call counts against the cap until the returned
    /// permit is dropped.
    pub async fn acquire(&self) -> OwnedSemaphorePermit {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .expect("throttle semaphore is never closed");

        if !self.min_interval.is_zero() {
            let wait_until = {
                let mut next = self.next_start.lock().await;
                let now = Instant::now();
                let slot = (*next).max(now);
                *next = slot + self.min_interval;
                slot
            };
            tokio::time::sleep_until(wait_until).await;
        }

        permit
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}
