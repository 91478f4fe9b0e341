//! Exponential backoff for pool establishment.
//!
//! Attempt `n` (1-based) that fails is followed by a sleep of
//! `initial_delay * 2^(n-1)` before attempt `n + 1`. No sleep follows the
//! final attempt: once the budget is spent the last error is returned.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Largest exponent applied to the initial delay; keeps the multiplier finite.
const MAX_SHIFT: u32 = 16;

/// Retry budget and schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    attempts: u32,
    initial_delay: Duration,
}

/// Why [`Backoff::retry`] gave up.
#[derive(Debug)]
pub enum RetryError<E> {
    /// Every attempt failed; carries the count and the last error.
    Exhausted {
        /// Number of attempts made.
        attempts: u32,
        /// Error from the final attempt.
        last: E,
    },
    /// The cancellation token fired between attempts.
    Cancelled,
}

impl Backoff {
    /// Create a schedule of `attempts` tries starting at `initial_delay`.
    ///
    /// A zero attempt budget is treated as one attempt.
    pub const fn new(attempts: u32, initial_delay: Duration) -> Self {
        Self {
            attempts: if attempts == 0 { 1 } else { attempts },
            initial_delay,
        }
    }

    /// Total attempts in the budget.
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay slept after failed attempt `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(MAX_SHIFT);
        self.initial_delay.saturating_mul(1_u32 << shift)
    }

    /// The full list of sleeps between attempts.
    pub fn schedule(&self) -> Vec<Duration> {
        (1..self.attempts).map(|n| self.delay_after(n)).collect()
    }

    /// Run `op` until it succeeds, the budget is exhausted, or `cancel` fires.
    ///
    /// `op` receives the 1-based attempt number. Each failure is logged with
    /// its attempt number and the delay before the next try.
    pub async fn retry<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: core::fmt::Display,
    {
        let mut attempt: u32 = 1;
        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled);
            }
            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if attempt >= self.attempts {
                tracing::error!(
                    attempt,
                    max_attempts = self.attempts,
                    error = %err,
                    "Giving up after final attempt"
                );
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: err,
                });
            }
            let delay = self.delay_after(attempt);
            tracing::warn!(
                attempt,
                max_attempts = self.attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "Attempt failed, backing off"
            );
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(RetryError::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
            attempt = attempt.saturating_add(1);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::time::Instant;

    use super::*;

    #[test]
    fn default_schedule_doubles() {
        let backoff = Backoff::new(5, Duration::from_secs(1));
        assert_eq!(
            backoff.schedule(),
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
            ]
        );
        assert_eq!(backoff.delay_after(5), Duration::from_secs(16));
    }

    #[test]
    fn zero_budget_still_tries_once() {
        assert_eq!(Backoff::new(0, Duration::from_millis(5)).attempts(), 1);
    }

    #[test]
    fn huge_attempt_numbers_do_not_overflow() {
        let backoff = Backoff::new(u32::MAX, Duration::from_secs(1));
        assert_eq!(backoff.delay_after(u32::MAX), Duration::from_secs(1 << 16));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_exactly_the_budget_with_matching_waits() {
        let backoff = Backoff::new(5, Duration::from_secs(1));
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();
        let seen: Arc<std::sync::Mutex<Vec<Duration>>> = Arc::default();

        let result: Result<(), _> = backoff
            .retry(&CancellationToken::new(), |attempt| {
                let calls = Arc::clone(&calls);
                let seen = Arc::clone(&seen);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    seen.lock().unwrap().push(started.elapsed());
                    Err::<(), _>(format!("refused on attempt {attempt}"))
                }
            })
            .await;

        match result {
            Err(RetryError::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 5);
                assert_eq!(last, "refused on attempt 5");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        let offsets: Vec<u64> = seen.lock().unwrap().iter().map(Duration::as_secs).collect();
        assert_eq!(offsets, vec![0, 1, 3, 7, 15]);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_a_later_attempt() {
        let backoff = Backoff::new(5, Duration::from_millis(100));
        let result = backoff
            .retry(&CancellationToken::new(), |attempt| async move {
                if attempt < 3 { Err("not yet") } else { Ok(attempt) }
            })
            .await
            .unwrap();
        assert_eq!(result, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff() {
        let backoff = Backoff::new(5, Duration::from_secs(60));
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });
        let result: Result<(), _> = backoff
            .retry(&token, |_| async { Err::<(), _>("down") })
            .await;
        assert!(matches!(result, Err(RetryError::Cancelled)));
    }
}
