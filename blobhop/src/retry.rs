//! The single retry policy through which every range download and part upload goes.
//!
//! The heavy lifting of computing delays and sleeping is done by the `again` crate.  This wrapper
//! adds the things the transfer pipeline needs on top of that: a caller-provided classifier which
//! decides which errors are worth retrying, a timeout on every individual attempt, and reporting
//! of how many attempts were actually made.
use crate::{Config, StoreError};
use std::fmt::{Debug, Display};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Marker error produced when a single attempt runs longer than the attempt timeout.
///
/// Error types used with [`RetryPolicy`] must be convertible from this; a timed out attempt is
/// normally treated as transient.
#[derive(Clone, Debug)]
pub struct AttemptTimedOut {
    pub operation: String,
    pub timeout: Duration,
}

impl From<AttemptTimedOut> for StoreError {
    fn from(value: AttemptTimedOut) -> Self {
        StoreError::TimedOut {
            operation: value.operation,
            timeout: value.timeout,
        }
    }
}

/// A successful result and the number of attempts it took to get it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: usize,
}

/// The error from the last attempt, after the policy gave up
#[derive(Debug)]
pub struct RetryFailure<E> {
    pub error: E,

    /// How many attempts were made in total, including the first
    pub attempts: usize,

    /// `true` if the last error was transient and the policy gave up only because it ran out of
    /// retries; `false` if the error was permanent
    pub exhausted: bool,
}

/// Bounded retry with exponential backoff and jitter.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    max_retries: usize,
    backoff_base: Duration,
    backoff_cap: Duration,
    attempt_timeout: Option<Duration>,
}

impl RetryPolicy {
    pub fn new(max_retries: usize, backoff_base: Duration, backoff_cap: Duration) -> Self {
        Self {
            max_retries,
            backoff_base,
            backoff_cap,
            attempt_timeout: None,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.max_retries,
            config.backoff_base(),
            config.backoff_cap(),
        )
        .with_attempt_timeout(config.attempt_timeout())
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    pub fn max_attempts(&self) -> usize {
        self.max_retries + 1
    }

    /// Run `task` until it succeeds, fails with an error `is_transient` rejects, or runs out of
    /// attempts.
    ///
    /// `task` is called with the 1-based number of the attempt being made.
    pub async fn run<T, E, F, Fut, C>(
        &self,
        operation: &str,
        mut task: F,
        is_transient: C,
    ) -> Result<Attempted<T>, RetryFailure<E>>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> bool,
        E: From<AttemptTimedOut> + Debug + Display,
    {
        let policy = again::RetryPolicy::exponential(self.backoff_base)
            .with_jitter(true)
            .with_max_delay(self.backoff_cap)
            .with_max_retries(self.max_retries);

        let attempts = AtomicUsize::new(0);
        let max_attempts = self.max_attempts();
        let attempt_timeout = self.attempt_timeout;

        let result = policy
            .retry_if(
                || {
                    let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    let fut = task(attempt);

                    async move {
                        match attempt_timeout {
                            Some(timeout) => match tokio::time::timeout(timeout, fut).await {
                                Ok(result) => result,
                                Err(_) => Err(E::from(AttemptTimedOut {
                                    operation: operation.to_string(),
                                    timeout,
                                })),
                            },
                            None => fut.await,
                        }
                    }
                },
                |e: &E| {
                    let attempt = attempts.load(Ordering::SeqCst);

                    if !is_transient(e) {
                        debug!(operation, attempt, err = %e, "Permanent failure; not retrying");
                        false
                    } else {
                        if attempt < max_attempts {
                            warn!(operation, attempt, max_attempts, err = %e, "Transient failure; retrying after backoff");
                        }
                        true
                    }
                },
            )
            .await;

        let attempts = attempts.load(Ordering::SeqCst);

        match result {
            Ok(value) => Ok(Attempted { value, attempts }),
            Err(error) => {
                let exhausted = is_transient(&error);
                if exhausted {
                    warn!(operation, attempts, err = %error, "Giving up after exhausting all retries");
                }

                Err(RetryFailure {
                    error,
                    attempts,
                    exhausted,
                })
            }
        }
    }

    /// Convenience form of [`Self::run`] for [`StoreError`], which knows its own classification
    pub async fn run_store<T, F, Fut>(
        &self,
        operation: &str,
        task: F,
    ) -> Result<Attempted<T>, RetryFailure<StoreError>>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        self.run(operation, task, StoreError::is_transient).await
    }
}
