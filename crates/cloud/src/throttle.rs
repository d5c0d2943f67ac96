//! Client-side request throttling.
//!
//! Spaces provider calls evenly so a full-fleet scan does not burst past the
//! provider's rate limit. Server-side throttling signals push the next free
//! slot further out via [`Throttle::penalize`].

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Shared request pacer.
#[derive(Debug)]
pub struct Throttle {
    interval: Duration,
    next_slot: Mutex<Instant>,
}

impl Throttle {
    /// Allow at most `requests_per_second` requests per second.
    ///
    /// Zero disables throttling.
    #[must_use]
    pub fn per_second(requests_per_second: u32) -> Self {
        let interval = if requests_per_second == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs(1) / requests_per_second
        };

        Self {
            interval,
            next_slot: Mutex::new(Instant::now()),
        }
    }

    /// A throttle that never waits (unless penalized).
    #[must_use]
    pub fn unlimited() -> Self {
        Self::per_second(0)
    }

    /// Minimum spacing between requests.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait for the next request slot.
    pub async fn acquire(&self) {
        let slot = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = (*next).max(now);
            *next = slot + self.interval;
            slot
        };

        if slot > Instant::now() {
            debug!(
                wait_ms = (slot - Instant::now()).as_millis(),
                "Throttling provider request"
            );
            tokio::time::sleep_until(slot).await;
        }
    }

    /// Hold all requests back for at least `delay`.
    pub async fn penalize(&self, delay: Duration) {
        let mut next = self.next_slot.lock().await;
        let until = Instant::now() + delay;
        if until > *next {
            *next = until;
        }
    }
}

impl Default for Throttle {
    fn default() -> Self {
        Self::unlimited()
    }
}
