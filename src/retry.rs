//! Backoff policy for transient failures
//!
//! The coordinator drives retries as an explicit per-ID state machine; this
//! module only answers two questions: is a failure worth retrying, and how long
//! to wait before the next attempt.
//!
//! Delays grow exponentially from `initial_delay` by `backoff_multiplier` per
//! failed attempt, capped at `max_delay`. With jitter enabled the capped delay
//! is stretched by a uniform factor in `[1, 2]` so workers that failed together
//! don't retry together.
//!
//! ```
//! use replay_archiver::config::RetryConfig;
//! use replay_archiver::retry::backoff_delay;
//! use std::time::Duration;
//!
//! let config = RetryConfig {
//!     initial_delay: Duration::from_secs(1),
//!     max_delay: Duration::from_secs(10),
//!     backoff_multiplier: 2.0,
//!     ..RetryConfig::default()
//! };
//! assert_eq!(backoff_delay(&config, 1), Duration::from_secs(1));
//! assert_eq!(backoff_delay(&config, 3), Duration::from_secs(4));
//! assert_eq!(backoff_delay(&config, 10), Duration::from_secs(10));
//! ```

use crate::config::RetryConfig;
use crate::error::Error;
use rand::Rng;
use std::time::Duration;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (timeouts, connection resets, bad payloads) return `true`.
/// Local persistence failures (disk full, ledger unavailable) return `false`:
/// retrying them would only hide a systemic problem.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            // A payload that failed verification is refetched
            Error::Integrity(_) => true,
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::Interrupted
            ),
            // Discovery is advisory and re-queried on the next tick
            Error::Discovery(_) => true,
            Error::Storage(_) | Error::Database(_) => false,
            Error::Config { .. } | Error::InvalidRange { .. } => false,
            Error::NotFound(_) | Error::Serialization(_) => false,
            Error::ShuttingDown => false,
        }
    }
}

/// Deterministic backoff after the `attempt`-th failed attempt (1-based)
///
/// `initial_delay * backoff_multiplier^(attempt - 1)`, capped at `max_delay`.
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
    let secs = config.initial_delay.as_secs_f64() * config.backoff_multiplier.powi(exponent);

    match Duration::try_from_secs_f64(secs) {
        Ok(delay) => delay.min(config.max_delay),
        // Overflowed to infinity
        Err(_) => config.max_delay,
    }
}

/// Delay actually waited after the `attempt`-th failure, jittered if configured
pub fn retry_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let delay = backoff_delay(config, attempt);
    if config.jitter {
        add_jitter(delay)
    } else {
        delay
    }
}

/// Add random jitter to a delay to prevent thundering herd
///
/// Jitter is uniformly distributed between 0% and 100% of the delay, so the
/// result lies between `delay` and `2 * delay`.
pub fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    let jittered_secs = delay.as_secs_f64() * (1.0 + jitter_factor);
    Duration::try_from_secs_f64(jittered_secs).unwrap_or(delay)
}
