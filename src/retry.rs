//! Retry logic with exponential backoff
//!
//! Transient failures are retried with exponential backoff and optional jitter.
//! The number of retries is not a property of the loop: every task owns one
//! retry budget shared by all of its stages, represented here by
//! [`RetryBudget`]. Each retry consumes one unit of the budget.
//!
//! # Example
//!
//! ```no_run
//! use transfer_engine::retry::{with_retry, FixedBudget};
//! use transfer_engine::config::RetryConfig;
//! use transfer_engine::error::Error;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Error> {
//! let config = RetryConfig::default();
//! let budget = FixedBudget::new(3);
//! let cancel = CancellationToken::new();
//! let value = with_retry(&config, &budget, &cancel, || async {
//!     Ok::<_, Error>(42)
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

use crate::config::RetryConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use rand::Rng;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (network timeouts, server busy, connection reset) should return `true`.
/// Permanent failures (authentication failed, disk full, corrupt data) should return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Backend { transient, .. } => *transient,
            Error::Network(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().is_some_and(|s| {
                        s.is_server_error() || s == reqwest::StatusCode::TOO_MANY_REQUESTS
                    })
            }
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::UnexpectedEof
            ),
            Error::Processing { retryable, .. } => *retryable,
            Error::Upload { transient, .. } => *transient,
            // Retry on timeouts and busy states, not on missing binaries
            Error::ExternalTool(msg) => {
                msg.contains("timeout") || msg.contains("busy") || msg.contains("temporary")
            }
            // Need user action (free space, configure backend, ...)
            Error::ResourceExhausted(_)
            | Error::InsufficientSpace { .. }
            | Error::Unsupported { .. }
            | Error::Config { .. } => false,
            Error::Cancelled | Error::ShuttingDown => false,
            Error::NotFound(_) | Error::InvalidState { .. } => false,
            Error::Extraction(_) => false,
            Error::Database(_) | Error::Sqlx(_) | Error::Serialization(_) => false,
        }
    }
}

/// A retry allowance shared by all retry loops of one task
#[async_trait]
pub trait RetryBudget: Send + Sync {
    /// Consume one retry for `error`; returns the 1-based retry number, or None when exhausted
    async fn try_consume(&self, error: &Error) -> Option<u32>;

    /// Called after a retry was granted, before the backoff sleep
    async fn retry_scheduled(&self, _attempt: u32, _delay: Duration, _error: &Error) {}
}

/// Standalone budget allowing a fixed number of retries
#[derive(Debug)]
pub struct FixedBudget {
    max: u32,
    used: AtomicU32,
}

impl FixedBudget {
    /// Budget of `max` retries
    pub fn new(max: u32) -> Self {
        Self {
            max,
            used: AtomicU32::new(0),
        }
    }

    /// Retries consumed so far
    pub fn used(&self) -> u32 {
        self.used.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RetryBudget for FixedBudget {
    async fn try_consume(&self, _error: &Error) -> Option<u32> {
        self.used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                (used < self.max).then_some(used + 1)
            })
            .ok()
            .map(|prev| prev + 1)
    }
}

/// Backoff before retry number `attempt` (1-based), capped at `max_delay`
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(63) as i32;
    let secs = config.initial_delay.as_secs_f64() * config.backoff_multiplier.powi(exponent);
    let base = if secs.is_finite() {
        Duration::from_secs_f64(secs.min(config.max_delay.as_secs_f64()))
    } else {
        config.max_delay
    };
    let delay = if config.jitter { add_jitter(base) } else { base };
    delay.min(config.max_delay)
}

/// Execute an async operation, retrying transient failures against `budget`
///
/// Cancellation is checked before every attempt and during every backoff
/// sleep; a cancelled token turns into [`Error::Cancelled`].
pub async fn with_retry<F, Fut, T>(
    config: &RetryConfig,
    budget: &dyn RetryBudget,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut retries = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let err = match operation().await {
            Ok(result) => {
                if retries > 0 {
                    tracing::info!(attempts = retries + 1, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) => e,
        };

        if !err.is_retryable() {
            tracing::debug!(error = %err, "Operation failed with non-retryable error");
            return Err(err);
        }

        let Some(attempt) = budget.try_consume(&err).await else {
            tracing::warn!(
                error = %err,
                attempts = retries + 1,
                "Operation failed after retry budget exhausted"
            );
            return Err(err);
        };
        retries += 1;

        let delay = backoff_delay(config, attempt);
        tracing::warn!(
            error = %err,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Operation failed, retrying"
        );
        budget.retry_scheduled(attempt, delay, &err).await;

        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Add random jitter to a delay to prevent thundering herd
///
/// The result is uniformly distributed between `delay` and `2 * delay`.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + jitter_factor))
}
