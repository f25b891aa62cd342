use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout_at, Instant};

/// Fixed-interval retry budget used while waiting for a function listener.
///
/// There is no backoff: attempt `n + 1` starts `interval` after attempt `n`
/// failed. The whole loop is cut off at [`FixedRetry::deadline`], so slow
/// attempts cannot stretch it past the budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedRetry {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for FixedRetry {
    fn default() -> Self {
        Self::gateway_default()
    }
}

/// Outcome of a single attempt that did not succeed.
#[derive(Debug)]
pub enum AttemptError<E> {
    /// Try again after the interval.
    Transient(E),
    /// Stop retrying.
    Permanent(E),
}

#[derive(Debug)]
pub enum RetryError<E> {
    Exhausted {
        attempts: u32,
        elapsed: Duration,
        last: Option<E>,
    },
    Aborted {
        attempt: u32,
        error: E,
    },
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Exhausted {
                attempts,
                elapsed,
                last: Some(last),
            } => write!(f, "gave up after {attempts} attempts ({elapsed:?}): {last}"),
            RetryError::Exhausted {
                attempts, elapsed, ..
            } => write!(f, "gave up after {attempts} attempts ({elapsed:?})"),
            RetryError::Aborted { attempt, error } => {
                write!(f, "attempt {attempt} failed permanently: {error}")
            }
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RetryError<E> {}

impl FixedRetry {
    pub const fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }

    /// 200 attempts, 10 ms apart.
    pub const fn gateway_default() -> Self {
        Self::new(200, Duration::from_millis(10))
    }

    /// Total time spent sleeping when every attempt fails.
    pub fn budget(&self) -> Duration {
        self.interval * self.max_attempts.saturating_sub(1)
    }

    /// Upper bound on the time [`FixedRetry::run`] takes to give up.
    pub fn deadline(&self) -> Duration {
        self.budget() + self.interval
    }

    /// Runs `attempt` (called with the 1-based attempt number) until it
    /// succeeds, fails permanently, or the budget is used up. On success the
    /// value is returned with the number of attempts it took.
    pub async fn run<T, E, F, Fut>(&self, mut attempt: F) -> Result<(T, u32), RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, AttemptError<E>>>,
    {
        let started = Instant::now();
        let deadline = started + self.deadline();
        let mut last = None;

        for n in 1..=self.max_attempts {
            let Ok(outcome) = timeout_at(deadline, attempt(n)).await else {
                return Err(RetryError::Exhausted {
                    attempts: n,
                    elapsed: started.elapsed(),
                    last,
                });
            };
            match outcome {
                Ok(value) => return Ok((value, n)),
                Err(AttemptError::Permanent(error)) => {
                    return Err(RetryError::Aborted { attempt: n, error })
                }
                Err(AttemptError::Transient(error)) => last = Some(error),
            }
            if n < self.max_attempts {
                sleep(self.interval).await;
            }
        }

        Err(RetryError::Exhausted {
            attempts: self.max_attempts,
            elapsed: started.elapsed(),
            last,
        })
    }
}
