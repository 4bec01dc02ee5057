//! Fixed-delay retry for user-actionable failures
//!
//! Media capture is the one operation retried without bound: a denied camera
//! may be granted a moment later. Delays come from a `backon` constant
//! backoff; the actual waiting goes through a [`Sleeper`] so tests can
//! observe every pause without real timers.

use async_trait::async_trait;
use backon::{BackoffBuilder, ConstantBuilder};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::{Error, Result};

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Sleeps on the tokio timer
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub delay: Duration,
    /// Total attempts including the first; `None` retries forever
    pub max_attempts: Option<usize>,
}

impl RetryPolicy {
    #[must_use]
    pub const fn unbounded(delay: Duration) -> Self {
        Self {
            delay,
            max_attempts: None,
        }
    }

    #[must_use]
    pub const fn bounded(delay: Duration, max_attempts: usize) -> Self {
        Self {
            delay,
            max_attempts: Some(max_attempts),
        }
    }

    fn delays(&self) -> impl Iterator<Item = Duration> {
        let retries = self
            .max_attempts
            .map_or(usize::MAX, |attempts| attempts.saturating_sub(1));
        ConstantBuilder::default()
            .with_delay(self.delay)
            .with_max_times(retries)
            .build()
    }
}

/// Run `op` until it succeeds or the policy runs out of attempts.
///
/// `op` receives the 1-based attempt number. The error of the last attempt
/// is returned when the policy is exhausted.
pub async fn retry<T, F, Fut>(policy: RetryPolicy, sleeper: &dyn Sleeper, mut op: F) -> Result<T>
where
    F: FnMut(usize) -> Fut + Send,
    Fut: Future<Output = Result<T>> + Send,
    T: Send,
{
    let mut delays = policy.delays();
    let mut attempt = 0usize;

    loop {
        attempt += 1;
        let error: Error = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        let Some(delay) = delays.next() else {
            return Err(error);
        };
        warn!(
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %error,
            "Attempt failed, retrying"
        );
        sleeper.sleep(delay).await;
    }
}
