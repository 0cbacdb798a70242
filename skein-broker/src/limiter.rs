//! Token-bucket request pacing shared by REST client implementations.

use std::num::NonZeroU32;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as Governor};
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

/// Paces REST calls with a windowed quota plus a minimum spacing between
/// consecutive requests, so a full burst allowance cannot be spent at once.
pub struct RateLimiter {
    bucket: Governor<NotKeyed, InMemoryState, DefaultClock>,
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl RateLimiter {
    /// Allow at most `max_requests` per `window`, spaced at least
    /// `min_interval` apart.
    #[must_use]
    pub fn new(max_requests: u32, window: Duration, min_interval: Duration) -> Self {
        let burst = NonZeroU32::new(max_requests).unwrap_or(NonZeroU32::MIN);
        let replenish = window / burst.get();
        let quota = Quota::with_period(replenish)
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN))
            .allow_burst(burst);
        Self {
            bucket: Governor::direct(quota),
            min_interval,
            last_request: Mutex::new(None),
        }
    }

    /// Wait until a request may be issued.
    pub async fn acquire(&self) {
        self.bucket.until_ready().await;
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}
