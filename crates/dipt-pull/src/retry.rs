//! Bounded retries with backoff.
//!
//! Attempt 0 runs immediately. After a failed attempt `n`, if `n` is below
//! the retry budget, the executor sleeps for `delay(n + 1)` and tries again.
//! Every attempt is reported to the injected [`EventSink`]; the executor
//! itself never logs or classifies.

use std::fmt::Display;
use std::future::Future;

use async_trait::async_trait;
use dipt_core::{AttemptEvent, AttemptOutcome, EventSink, PullEvent};
use thiserror::Error;

use crate::backoff::{self, BackoffConfig};

/// Failure of a retried operation. Wraps the last raw error.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Every attempt failed.
    #[error("{label} failed after {retries} retries: {source}")]
    Exhausted {
        /// Operation label.
        label: String,
        /// Retries performed after the first attempt.
        retries: u32,
        /// Error of the last attempt.
        #[source]
        source: E,
    },

    /// The operation declared its error not worth retrying.
    #[error("{label} failed on attempt {attempt}: {source}")]
    Aborted {
        /// Operation label.
        label: String,
        /// Zero-based attempt that failed.
        attempt: u32,
        /// The error.
        #[source]
        source: E,
    },
}

impl<E> RetryError<E> {
    /// The last raw error.
    pub const fn last_error(&self) -> &E {
        match self {
            Self::Exhausted { source, .. } | Self::Aborted { source, .. } => source,
        }
    }

    /// Consumes the wrapper, returning the last raw error.
    pub fn into_inner(self) -> E {
        match self {
            Self::Exhausted { source, .. } | Self::Aborted { source, .. } => source,
        }
    }

    /// Total number of attempts made.
    pub const fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { retries, .. } => *retries + 1,
            Self::Aborted { attempt, .. } => *attempt + 1,
        }
    }
}

/// An operation that knows its name and which errors are worth retrying.
#[async_trait]
pub trait RetryableOperation: Send + Sync {
    /// Success value.
    type Output: Send;
    /// Raw failure.
    type Error: Display + Send;

    /// Label used in attempt events and errors.
    fn name(&self) -> &str;

    /// Runs one attempt.
    async fn execute(&self) -> Result<Self::Output, Self::Error>;

    /// Returns false to stop retrying immediately.
    fn should_retry(&self, _error: &Self::Error) -> bool {
        true
    }
}

/// Runs `op` until it succeeds or the retry budget is spent.
///
/// # Errors
///
/// Returns [`RetryError::Exhausted`] wrapping the last error after
/// `max_retries + 1` failed attempts.
///
/// # Examples
///
/// ```
/// use dipt_core::NoopSink;
/// use dipt_pull::{with_retry, BackoffConfig};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let config = BackoffConfig::builder().max_retries(0).build().unwrap();
/// let result: Result<u8, _> = with_retry(|| async { Err::<u8, _>("offline") }, &config, "ping", &NoopSink).await;
/// assert_eq!(result.unwrap_err().attempts(), 1);
/// # }
/// ```
pub async fn with_retry<T, E, F, Fut>(
    mut op: F,
    config: &BackoffConfig,
    label: &str,
    sink: &dyn EventSink,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    run_attempts(label, config, sink, &mut op, |_| true).await
}

/// Runs a [`RetryableOperation`] with the given policy.
///
/// # Errors
///
/// Returns [`RetryError::Aborted`] as soon as `should_retry` rejects an
/// error, or [`RetryError::Exhausted`] once the budget is spent.
pub async fn execute_with_retry<O>(
    op: &O,
    config: &BackoffConfig,
    sink: &dyn EventSink,
) -> Result<O::Output, RetryError<O::Error>>
where
    O: RetryableOperation + ?Sized,
{
    run_attempts(op.name(), config, sink, &mut || op.execute(), |e| {
        op.should_retry(e)
    })
    .await
}

async fn run_attempts<T, E, F, Fut, S>(
    label: &str,
    config: &BackoffConfig,
    sink: &dyn EventSink,
    op: &mut F,
    should_retry: S,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    S: Fn(&E) -> bool,
{
    let max_retries = config.max_retries();
    let report = |attempt: u32, outcome: AttemptOutcome, delay| {
        sink.emit(PullEvent::Attempt(AttemptEvent {
            label: label.to_string(),
            attempt,
            max_retries,
            outcome,
            delay,
        }));
    };

    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => {
                report(attempt, AttemptOutcome::Succeeded, None);
                return Ok(value);
            }
            Err(source) if !should_retry(&source) => {
                report(attempt, AttemptOutcome::Failed(source.to_string()), None);
                return Err(RetryError::Aborted {
                    label: label.to_string(),
                    attempt,
                    source,
                });
            }
            Err(source) if attempt >= max_retries => {
                report(attempt, AttemptOutcome::Failed(source.to_string()), None);
                return Err(RetryError::Exhausted {
                    label: label.to_string(),
                    retries: max_retries,
                    source,
                });
            }
            Err(source) => {
                let wait = backoff::delay(attempt + 1, config);
                report(attempt, AttemptOutcome::Failed(source.to_string()), Some(wait));
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
        }
    }
}
