//! Retry strategies applied around subscription deliveries and other
//! fallible operations.
//!
//! A [RetryPolicy] can be consumed two ways: as a wrapping combinator
//! ([`RetryPolicy::retry`]) or as a plain iterator of delays
//! ([`RetryPolicy::delays`]) for callers that drive the loop themselves, like
//! the subscription workers, which must not advance their position while a
//! delivery is being retried.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;

/// Retry policy: no retries, fixed delay, or capped exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// Fail on the first error, no retries.
    pub fn none() -> Self {
        RetryPolicy {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            max_attempts: Some(1),
        }
    }

    /// Retry forever with a fixed delay between attempts.
    pub fn fixed(delay: Duration) -> Self {
        RetryPolicy {
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            max_attempts: None,
        }
    }

    /// Retry forever with exponentially growing delays, capped at
    /// `max_delay`.
    pub fn exponential(initial_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        RetryPolicy {
            initial_delay,
            max_delay,
            multiplier,
            max_attempts: None,
        }
    }

    /// Caps the total number of attempts (the first call included).
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    /// The delay to sleep before retry number `attempt` (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 || self.multiplier == 1.0 {
            return self.initial_delay;
        }

        let millis = self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let delay = Duration::from_millis(millis as u64);

        delay.min(self.max_delay)
    }

    /// The delays between attempts, one per retry the policy still allows.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        let retries = self.max_attempts.map(|attempts| attempts.saturating_sub(1));

        (0u32..)
            .take_while(move |attempt| retries.map_or(true, |r| *attempt < r))
            .map(|attempt| self.delay_for_attempt(attempt))
    }

    /// Runs `op`, retrying failed attempts for which `should_retry` returns
    /// true, sleeping the policy's delay in between. Returns the first
    /// success, or the last error once attempts are exhausted or
    /// `should_retry` declines.
    pub async fn retry<T, E, F, Fut>(
        &self,
        should_retry: impl Fn(&E) -> bool,
        mut op: F,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut delays = self.delays();

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if !should_retry(&error) {
                        return Err(error);
                    }
                    match delays.next() {
                        Some(delay) => sleep(delay).await,
                        None => return Err(error),
                    }
                },
            }
        }
    }
}

impl Default for RetryPolicy {
    /// Fixed 200ms delay, retrying forever.
    fn default() -> Self {
        RetryPolicy::fixed(Duration::from_millis(200))
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn fixed_policy_produces_constant_delays() {
        let policy = RetryPolicy::fixed(Duration::from_millis(50)).with_max_attempts(4);
        let delays: Vec<_> = policy.delays().collect();

        assert_eq!(delays, vec![Duration::from_millis(50); 3]);
    }

    #[test]
    fn exponential_policy_grows_and_caps() {
        let policy = RetryPolicy::exponential(
            Duration::from_millis(100),
            Duration::from_millis(450),
            2.0,
        );
        let delays: Vec<_> = policy.delays().take(4).collect();

        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(450),
            ]
        );
    }

    #[test]
    fn none_policy_allows_a_single_attempt() {
        let policy = RetryPolicy::none();
        assert_eq!(policy.delays().count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_returns_first_success() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy::fixed(Duration::from_millis(10));

        let result: Result<u32, &str> = policy
            .retry(
                |_| true,
                || {
                    let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if attempt < 2 {
                            Err("not yet")
                        } else {
                            Ok(attempt)
                        }
                    }
                },
            )
            .await;

        assert_eq!(result, Ok(2));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_gives_up_after_max_attempts() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy::fixed(Duration::from_millis(10)).with_max_attempts(3);

        let result: Result<(), &str> = policy
            .retry(
                |_| true,
                || {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    async { Err("always") }
                },
            )
            .await;

        assert_eq!(result, Err("always"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_respects_the_predicate() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy::fixed(Duration::from_millis(10));

        let result: Result<(), &str> = policy
            .retry(
                |error| *error != "fatal",
                || {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    async { Err("fatal") }
                },
            )
            .await;

        assert_eq!(result, Err("fatal"));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
