//! Client-side rate limiting for venue calls.
//!
//! Token bucket kept conservatively under the venue's published request
//! limit. Exchange-facing calls are the only suspension points in the
//! system, and they all pass through here.

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;

pub struct GatewayRateLimiter {
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

impl GatewayRateLimiter {
    /// `requests_per_second` should sit below the venue's advertised limit;
    /// zero is coerced to one.
    pub fn new(requests_per_second: u32) -> Self {
        let rps = NonZeroU32::new(requests_per_second.max(1)).expect("coerced to >= 1");
        Self {
            limiter: RateLimiter::direct(Quota::per_second(rps)),
        }
    }

    /// Wait until a request slot is available.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    /// Non-blocking probe, used by tests and health reporting.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }
}

impl std::fmt::Debug for GatewayRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("GatewayRateLimiter")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_exhausts_bucket() {
        let limiter = GatewayRateLimiter::new(2);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[tokio::test]
    async fn test_acquire_waits_and_succeeds() {
        let limiter = GatewayRateLimiter::new(100);
        // Plenty of capacity: must not hang.
        limiter.acquire().await;
        limiter.acquire().await;
    }
}
