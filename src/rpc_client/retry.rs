use std::future::Future;
use std::time::{Duration, Instant};

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use super::{Error, ErrorKind, Result, RetryConfig};

/// Exponential backoff with jitter, shared by every provider call site.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    rate_limit_multiplier: u32,
    jitter_millis: u64,
    deadline: Option<Duration>,
}

impl RetryPolicy {
    pub fn new(cfg: &RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.get(),
            base_delay: Duration::from_millis(cfg.base_delay_millis),
            max_delay: Duration::from_millis(cfg.max_delay_millis),
            rate_limit_multiplier: cfg.rate_limit_multiplier.max(1),
            jitter_millis: cfg.jitter_millis,
            deadline: cfg.deadline_millis.map(|ms| Duration::from_millis(ms.get())),
        }
    }

    /// Delay to wait after the failed attempt number `attempt` (starting at 1), without jitter.
    pub fn backoff(&self, attempt: u32, kind: ErrorKind) -> Duration {
        let exp = 2u32.saturating_pow(attempt.saturating_sub(1));
        let mut delay = self.base_delay.saturating_mul(exp).min(self.max_delay);

        if kind == ErrorKind::RateLimited {
            delay = delay.saturating_mul(self.rate_limit_multiplier);
        }

        delay
    }

    fn jitter(&self) -> Duration {
        if self.jitter_millis == 0 {
            return Duration::ZERO;
        }

        Duration::from_millis(fastrange_rs::fastrange_64(rand::random(), self.jitter_millis))
    }

    /// Runs `op` until it succeeds, fails with a non retryable error, runs out of attempts
    /// or the deadline would be passed by the next backoff.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let mut attempt = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            attempt += 1;

            let err = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                res = op() => match res {
                    Ok(v) => return Ok(v),
                    Err(e) => e,
                },
            };

            let kind = err.kind();
            if !kind.is_retryable() {
                return Err(err);
            }

            if attempt >= self.max_attempts {
                return Err(Error::RetriesFailed {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            let delay = self.backoff(attempt, kind) + self.jitter();

            if let Some(deadline) = self.deadline {
                if started.elapsed() + delay > deadline {
                    return Err(Error::DeadlineExceeded {
                        deadline,
                        last: Box::new(err),
                    });
                }
            }

            log::debug!(
                "attempt {}/{} failed ({:?}), retrying in {:?}: {}",
                attempt,
                self.max_attempts,
                kind,
                delay,
                err
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = sleep(delay) => {}
            }
        }
    }
}
