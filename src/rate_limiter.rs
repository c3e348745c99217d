use crate::{Error, Result};
use governor::{Quota, RateLimiter as Governor};
use std::num::NonZeroU32;
use std::time::Duration;
use tokio::sync::Mutex;

pub const DEFAULT_RATE_LIMIT_TIMEOUT: Duration = Duration::from_secs(2);

type DirectRateLimiter = Governor<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Token bucket guarding one outbound resource (exchange API, Telegram API)
///
/// Acquisitions are serialized so callers are served in arrival order.
pub struct RateLimiter {
    limiter: DirectRateLimiter,
    timeout: Duration,
    gate: Mutex<()>,
}

impl RateLimiter {
    /// `per_second` tokens refill every second, up to `burst` stored
    pub fn new(per_second: u32, burst: u32, timeout: Duration) -> Result<Self> {
        let rate = NonZeroU32::new(per_second)
            .ok_or_else(|| Error::Config("rate limit must be greater than zero".to_string()))?;
        let burst = NonZeroU32::new(burst)
            .ok_or_else(|| Error::Config("rate limit burst must be greater than zero".to_string()))?;

        Ok(Self {
            limiter: Governor::direct(Quota::per_second(rate).allow_burst(burst)),
            timeout,
            gate: Mutex::new(()),
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wait until `weight` tokens are available
    ///
    /// Fails with `RateLimitExceeded` when the wait would exceed the
    /// configured timeout or the weight can never fit in the bucket.
    pub async fn acquire(&self, weight: u32) -> Result<()> {
        let Some(weight) = NonZeroU32::new(weight) else {
            return Ok(());
        };

        let wait = async {
            let _guard = self.gate.lock().await;
            self.limiter.until_n_ready(weight).await
        };

        match tokio::time::timeout(self.timeout, wait).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(insufficient)) => {
                tracing::warn!(
                    weight = weight.get(),
                    error = %insufficient,
                    "Rate limit weight exceeds bucket capacity"
                );
                Err(Error::RateLimitExceeded(Duration::ZERO))
            }
            Err(_) => Err(Error::RateLimitExceeded(self.timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_zero_rate_is_config_error() {
        assert!(matches!(
            RateLimiter::new(0, 1, DEFAULT_RATE_LIMIT_TIMEOUT),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            RateLimiter::new(1, 0, DEFAULT_RATE_LIMIT_TIMEOUT),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_burst_is_available_immediately() {
        let limiter = RateLimiter::new(1, 5, Duration::from_millis(50)).unwrap();
        assert_ok!(limiter.acquire(5).await);
    }

    #[tokio::test]
    async fn test_timeout_when_bucket_empty() {
        let limiter = RateLimiter::new(1, 1, Duration::from_millis(20)).unwrap();
        assert_ok!(limiter.acquire(1).await);

        let err = assert_err!(limiter.acquire(1).await);
        assert!(matches!(err, Error::RateLimitExceeded(d) if d == Duration::from_millis(20)));
    }

    #[tokio::test]
    async fn test_weight_above_burst_fails() {
        let limiter = RateLimiter::new(10, 2, Duration::from_millis(50)).unwrap();
        assert!(matches!(
            limiter.acquire(3).await,
            Err(Error::RateLimitExceeded(_))
        ));
    }

    #[tokio::test]
    async fn test_waits_for_refill() {
        let limiter = RateLimiter::new(50, 1, Duration::from_secs(1)).unwrap();
        assert_ok!(limiter.acquire(1).await);
        // 50/s refills one token every 20ms
        assert_ok!(limiter.acquire(1).await);
    }

    #[tokio::test]
    async fn test_zero_weight_is_free() {
        let limiter = RateLimiter::new(1, 1, Duration::from_millis(10)).unwrap();
        assert_ok!(limiter.acquire(1).await);
        assert_ok!(limiter.acquire(0).await);
    }
}
