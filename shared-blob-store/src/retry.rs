//! Retry and backoff policies.
//!
//! Every loop that talks to the backend goes through [`retry`], so attempt
//! ceilings and sleeps live in one place and tests can swap the clock.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::clock::Clock;
use crate::error::{BackendError, BlobError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    /// `base * 2^attempt`, capped at `max`.
    Exponential { base: Duration, max: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub const fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed(delay),
        }
    }

    pub const fn exponential(max_attempts: u32, base: Duration, max: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Exponential { base, max },
        }
    }

    /// Delay to wait after the failed attempt number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { base, max } => base
                .saturating_mul(2u32.saturating_pow(attempt.min(31)))
                .min(max),
        }
    }

    /// Upper bound of the time spent sleeping when every attempt fails.
    pub fn max_total_delay(&self) -> Duration {
        (0..self.max_attempts.saturating_sub(1))
            .map(|attempt| self.delay_for(attempt))
            .sum()
    }
}

/// Why a retried operation gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError {
    /// A non-transient error; returned on first sight.
    Fatal(BackendError),
    /// Transient errors until the attempt ceiling.
    Exhausted { attempts: u32, last: BackendError },
    Cancelled,
}

impl From<RetryError> for BlobError {
    fn from(err: RetryError) -> Self {
        match err {
            RetryError::Fatal(e) => BlobError::Backend(e),
            RetryError::Exhausted { attempts, last } => BlobError::TransientExhausted {
                attempts,
                source: last,
            },
            RetryError::Cancelled => BlobError::Cancelled,
        }
    }
}

/// Sleeps through `clock`, returning early with `Cancelled`.
pub async fn pause(
    clock: &dyn Clock,
    delay: Duration,
    cancel: &CancellationToken,
) -> Result<(), BlobError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(BlobError::Cancelled),
        _ = clock.sleep(delay) => Ok(()),
    }
}

/// Runs `op` until it succeeds, fails with a non-transient error, or the
/// policy runs out of attempts.
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    clock: &dyn Clock,
    cancel: &CancellationToken,
    what: &str,
    mut op: F,
) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }

        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => e,
            Err(e) => return Err(RetryError::Fatal(e)),
        };

        attempt += 1;
        if attempt >= max_attempts {
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last: err,
            });
        }

        let delay = policy.delay_for(attempt - 1);
        debug!(attempt, ?delay, error = %err, "{what} failed, retrying");
        if pause(clock, delay, cancel).await.is_err() {
            return Err(RetryError::Cancelled);
        }
    }
}
