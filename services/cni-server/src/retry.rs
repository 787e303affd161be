//! Retry-until-ready combinator with exponential backoff.
//!
//! Used to wait for eventually-consistent external state (the pod network
//! annotation) without inlining the loop at every call site.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tracing::debug;

/// Exponential backoff schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    /// Delay before the second attempt.
    pub initial: Duration,

    /// Multiplier applied after every sleep.
    pub factor: f64,

    /// Maximum number of attempts.
    pub steps: u32,

    /// Jitter fraction (0.0 to 1.0), applied as +/- of each delay.
    pub jitter: f64,
}

impl Backoff {
    /// Schedule for waiting on the pod network annotation.
    ///
    /// Sleeps roughly 1 + 1.5 + 2.25 + 3.375 + 5.06 + 7.59 = 20.8s in total.
    pub fn annotation() -> Self {
        Self {
            initial: Duration::from_secs(1),
            factor: 1.5,
            steps: 7,
            jitter: 0.1,
        }
    }

    /// Remove jitter (deterministic delays).
    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// Nominal delay after the given (zero-based) attempt, before jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        self.initial.mul_f64(self.factor.powi(attempt as i32))
    }

    /// Delay after the given attempt, with jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base_delay(attempt).as_secs_f64();
        let jitter = if self.jitter > 0.0 {
            rand::rng().random_range(-self.jitter..=self.jitter)
        } else {
            0.0
        };
        Duration::from_secs_f64((delay * (1.0 + jitter)).max(0.0))
    }

    /// Sum of all sleeps for a run that never succeeds, before jitter.
    pub fn total_base_delay(&self) -> Duration {
        (0..self.steps.saturating_sub(1))
            .map(|attempt| self.base_delay(attempt))
            .sum()
    }
}

/// Outcome of a failed retry loop.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Condition never became true within the budget.
    #[error("condition not met after {attempts} attempts")]
    Exhausted { attempts: u32 },

    /// The operation reported an unrecoverable error.
    #[error(transparent)]
    Aborted(E),
}

/// Run `op` until it yields a value, fails, or the budget runs out.
///
/// `op` returns `Ok(Some(value))` when done, `Ok(None)` when not ready yet
/// and `Err(e)` for errors that retrying cannot fix. There is no sleep after
/// the final attempt.
pub async fn retry_until<T, E, F, Fut>(backoff: &Backoff, mut op: F) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    for attempt in 0..backoff.steps {
        if let Some(value) = op(attempt).await.map_err(RetryError::Aborted)? {
            return Ok(value);
        }

        if attempt + 1 < backoff.steps {
            let delay = backoff.delay(attempt);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "not ready, backing off");
            tokio::time::sleep(delay).await;
        }
    }

    Err(RetryError::Exhausted {
        attempts: backoff.steps,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_annotation_schedule() {
        let backoff = Backoff::annotation();
        assert_eq!(backoff.base_delay(0), Duration::from_secs(1));
        assert_eq!(backoff.base_delay(1), Duration::from_millis(1500));
        assert_eq!(backoff.base_delay(2), Duration::from_millis(2250));

        let total = backoff.total_base_delay().as_secs_f64();
        assert!(total > 20.7 && total < 20.9, "total = {total}");
    }

    #[test]
    fn test_jitter_bounds() {
        let backoff = Backoff::annotation();
        for _ in 0..100 {
            let d = backoff.delay(2).as_secs_f64();
            assert!((2.02..=2.48).contains(&d), "delay = {d}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_waits_full_schedule() {
        let backoff = Backoff::annotation().without_jitter();
        let start = tokio::time::Instant::now();
        let mut calls = 0;

        let result: Result<(), RetryError<()>> = retry_until(&backoff, |_| {
            calls += 1;
            async { Ok(None) }
        })
        .await;

        assert!(matches!(result, Err(RetryError::Exhausted { attempts: 7 })));
        assert_eq!(calls, 7);
        assert!(start.elapsed() >= Duration::from_millis(20_780));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_stops_immediately() {
        let backoff = Backoff::annotation();
        let start = tokio::time::Instant::now();
        let mut calls = 0;

        let result: Result<(), RetryError<&str>> = retry_until(&backoff, |_| {
            calls += 1;
            async { Err("bad payload") }
        })
        .await;

        assert!(matches!(result, Err(RetryError::Aborted("bad payload"))));
        assert_eq!(calls, 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_on_third_attempt() {
        let backoff = Backoff::annotation().without_jitter();

        let value: Result<u32, RetryError<()>> = retry_until(&backoff, |attempt| async move {
            Ok((attempt == 2).then_some(attempt))
        })
        .await;

        assert_eq!(value.unwrap(), 2);
    }
}
