//! Request rate limiting using a token bucket
//!
//! The [`RequestLimiter`] caps how many requests per second all workers together
//! send to the remote endpoint. It is lock-free: the bucket lives in atomics and
//! waiting callers sleep instead of spinning.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Bucket units per request; sub-request precision keeps slow rates accurate
const UNITS_PER_REQUEST: u64 = 1_000;

/// Request limiter shared by every worker of a run
///
/// # Algorithm
///
/// - Tokens represent requests that may be sent now (stored in thousandths)
/// - Tokens refill at a constant rate (`limit_rps`), capped at one second's worth
/// - Each request acquires one token before it is sent
/// - Without a token the caller sleeps until the next refill
#[derive(Clone)]
pub struct RequestLimiter {
    /// Requests per second (0 = unlimited)
    limit_rps: Arc<AtomicU64>,
    /// Available tokens in thousandths of a request
    tokens: Arc<AtomicU64>,
    /// Last refill timestamp (nanoseconds since an arbitrary epoch)
    last_refill: Arc<AtomicU64>,
}

impl std::fmt::Debug for RequestLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestLimiter")
            .field("limit_rps", &self.get_limit())
            .finish()
    }
}

impl RequestLimiter {
    /// Create a limiter allowing `limit_rps` requests per second (None = unlimited)
    ///
    /// ```
    /// use replay_archiver::rate_limiter::RequestLimiter;
    ///
    /// let polite = RequestLimiter::new(Some(5));
    /// let unlimited = RequestLimiter::new(None);
    /// assert_eq!(unlimited.get_limit(), None);
    /// # let _ = polite;
    /// ```
    #[must_use]
    pub fn new(limit_rps: Option<u32>) -> Self {
        let limit = u64::from(limit_rps.unwrap_or(0));

        Self {
            limit_rps: Arc::new(AtomicU64::new(limit)),
            tokens: Arc::new(AtomicU64::new(limit * UNITS_PER_REQUEST)),
            last_refill: Arc::new(AtomicU64::new(Self::now_nanos())),
        }
    }

    /// Current limit in requests per second, None if unlimited
    pub fn get_limit(&self) -> Option<u32> {
        let limit = self.limit_rps.load(Ordering::Relaxed);
        if limit == 0 {
            None
        } else {
            Some(u32::try_from(limit).unwrap_or(u32::MAX))
        }
    }

    /// Wait until one request may be sent
    ///
    /// Returns immediately when unlimited.
    pub async fn acquire(&self) {
        loop {
            let limit = self.limit_rps.load(Ordering::Relaxed);
            if limit == 0 {
                return;
            }

            self.refill_tokens();

            let current = self.tokens.load(Ordering::SeqCst);
            if current >= UNITS_PER_REQUEST {
                if self
                    .tokens
                    .compare_exchange(
                        current,
                        current - UNITS_PER_REQUEST,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_ok()
                {
                    return;
                }
                // Lost the race to another worker
                continue;
            }

            let missing = UNITS_PER_REQUEST - current;
            let wait_ms = missing * 1_000 / (limit * UNITS_PER_REQUEST);
            tokio::time::sleep(Duration::from_millis(wait_ms.clamp(1, 100))).await;
        }
    }

    fn refill_tokens(&self) {
        let limit = self.limit_rps.load(Ordering::Relaxed);
        if limit == 0 {
            return;
        }

        let now = Self::now_nanos();
        let last = self.last_refill.load(Ordering::SeqCst);
        let elapsed_nanos = now.saturating_sub(last);

        // limit requests/s == limit * UNITS_PER_REQUEST units per 1e9 ns
        let units = (u128::from(elapsed_nanos) * u128::from(limit * UNITS_PER_REQUEST)
            / 1_000_000_000) as u64;

        if units > 0
            && self
                .last_refill
                .compare_exchange(last, now, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            let capacity = limit * UNITS_PER_REQUEST;
            let current = self.tokens.load(Ordering::SeqCst);
            self.tokens
                .store(current.saturating_add(units).min(capacity), Ordering::SeqCst);
        }
    }

    fn now_nanos() -> u64 {
        static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
        let start = START.get_or_init(Instant::now);
        start.elapsed().as_nanos() as u64
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_none_is_unlimited() {
        let limiter = RequestLimiter::new(None);
        assert_eq!(limiter.get_limit(), None);
        assert_eq!(limiter.limit_rps.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_bucket_starts_full() {
        let limiter = RequestLimiter::new(Some(4));
        assert_eq!(limiter.get_limit(), Some(4));
        assert_eq!(limiter.tokens.load(Ordering::Relaxed), 4 * UNITS_PER_REQUEST);
    }

    #[tokio::test]
    async fn test_acquire_unlimited_is_immediate() {
        let limiter = RequestLimiter::new(None);

        let start = Instant::now();
        for _ in 0..1_000 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_burst_up_to_capacity_is_immediate() {
        let limiter = RequestLimiter::new(Some(10));

        let start = Instant::now();
        for _ in 0..10 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_acquire_beyond_capacity_waits() {
        let limiter = RequestLimiter::new(Some(10));
        for _ in 0..10 {
            limiter.acquire().await;
        }

        // Five more requests at 10/s need roughly half a second of refill
        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire().await;
        }
        let elapsed = start.elapsed();
        assert!(
            elapsed >= Duration::from_millis(350),
            "expected throttling, took {:?}",
            elapsed
        );
    }

    #[tokio::test]
    async fn test_shared_between_clones() {
        let limiter = RequestLimiter::new(Some(3));
        let other = limiter.clone();

        limiter.acquire().await;
        other.acquire().await;

        let remaining = limiter.tokens.load(Ordering::Relaxed);
        assert!(
            remaining < 2 * UNITS_PER_REQUEST,
            "both clones draw from one bucket, {remaining} units left"
        );
    }
}
