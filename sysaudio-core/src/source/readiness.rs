//! Bounded retry helpers for asynchronously initializing OS audio objects.
//!
//! OS audio objects become usable some time after their creation call
//! returns, and expose no blocking "ready" primitive. Both the readiness
//! check and the format read therefore poll with a hard attempt cap.

use std::thread;
use std::time::Duration;

/// Interval between `is_alive` polls.
pub const READINESS_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Total time spent waiting for the compound object to report alive.
pub const READINESS_TIMEOUT: Duration = Duration::from_secs(2);
/// Number of native-format reads before giving up.
pub const FORMAT_READ_ATTEMPTS: u32 = 3;
/// Delay between native-format reads.
pub const FORMAT_READ_DELAY: Duration = Duration::from_millis(20);

/// Fixed-interval retry parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Sleep between consecutive attempts (never after the last one).
    pub interval: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub const fn new(interval: Duration, max_attempts: u32) -> Self {
        Self { interval, max_attempts }
    }

    /// Attempts at `interval` covering `timeout`, with the first one at t = 0.
    pub fn spanning(interval: Duration, timeout: Duration) -> Self {
        let max_attempts = match interval.as_nanos() {
            0 => 1,
            step => (timeout.as_nanos() / step) as u32 + 1,
        };
        Self { interval, max_attempts }
    }

    /// Upper bound on time spent sleeping across all attempts.
    pub fn max_wait(&self) -> Duration {
        self.interval * self.max_attempts.saturating_sub(1)
    }
}

/// Polling parameters used while acquiring a capture source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub alive_poll: RetryPolicy,
    pub format_read: RetryPolicy,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            alive_poll: RetryPolicy::spanning(READINESS_POLL_INTERVAL, READINESS_TIMEOUT),
            format_read: RetryPolicy::new(FORMAT_READ_DELAY, FORMAT_READ_ATTEMPTS),
        }
    }
}

/// All attempts of [`retry`] failed.
#[derive(Debug, Clone, PartialEq)]
pub struct Exhausted<E> {
    pub last_error: E,
    pub attempts: u32,
}

/// Call `predicate` until it returns true or the attempts run out.
///
/// Returns the 1-based attempt that succeeded, or `None`.
pub fn poll_until(policy: RetryPolicy, mut predicate: impl FnMut() -> bool) -> Option<u32> {
    for attempt in 1..=policy.max_attempts {
        if predicate() {
            return Some(attempt);
        }
        if attempt < policy.max_attempts {
            thread::sleep(policy.interval);
        }
    }
    None
}

/// Run `op` until it succeeds or the attempts run out.
///
/// `op` receives the 1-based attempt number.
pub fn retry<T, E>(policy: RetryPolicy, mut op: impl FnMut(u32) -> Result<T, E>) -> Result<T, Exhausted<E>> {
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(last_error) if attempt >= attempts => {
                return Err(Exhausted { last_error, attempts });
            }
            Err(_) => {
                thread::sleep(policy.interval);
                attempt += 1;
            }
        }
    }
}
