//! Fixed-attempt, fixed-delay retry for broker connection establishment.
//!
//! Only connection setup is retried. Message processing never is: a failing
//! handler is expressed through the delivery's ack/nack outcome instead.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use backon::{ConstantBuilder, Retryable};
use tracing::{error, info, warn};

/// Connection attempts made before giving up.
pub const CONNECTION_ATTEMPTS: u32 = 9;
/// Pause between connection attempts.
pub const CONNECTION_DELAY: Duration = Duration::from_secs(5);

/// Retry policy: run an operation up to `attempts` times, sleeping `delay`
/// between consecutive attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    attempts: u32,
    delay: Duration,
}

impl RetryPolicy {
    /// At least one attempt is always made.
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }

    /// Broker connection policy: 9 attempts, 5 seconds apart.
    pub fn connection() -> Self {
        Self::new(CONNECTION_ATTEMPTS, CONNECTION_DELAY)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Run `op` under this policy.
    ///
    /// Every error is treated as retryable. Returns the first success, or the
    /// last error once the attempt budget is spent.
    pub async fn run<T, E, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, RetryError<E>>
    where
        E: fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let attempt = AtomicU32::new(0);
        let max_attempts = self.attempts;

        let backoff = ConstantBuilder::default()
            .with_delay(self.delay)
            .with_max_times((self.attempts - 1) as usize);

        let result = (|| {
            attempt.fetch_add(1, Ordering::SeqCst);
            op()
        })
        .retry(backoff)
        .sleep(tokio::time::sleep)
        .notify(|e: &E, delay: Duration| {
            warn!(
                operation,
                attempt = attempt.load(Ordering::SeqCst),
                max_attempts,
                error = %e,
                "Attempt failed, retrying in {:?}",
                delay
            );
        })
        .await;

        let attempts = attempt.load(Ordering::SeqCst);
        match result {
            Ok(value) => {
                if attempts > 1 {
                    info!(operation, attempts, "Succeeded after retrying");
                }
                Ok(value)
            }
            Err(last) => {
                error!(operation, attempts, error = %last, "Giving up");
                Err(RetryError { attempts, last })
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::connection()
    }
}

/// The attempt budget was exhausted.
#[derive(Debug)]
pub struct RetryError<E> {
    /// Attempts made, including the first.
    pub attempts: u32,
    /// Error of the final attempt.
    pub last: E,
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gave up after {} attempts: {}", self.attempts, self.last)
    }
}

impl<E: std::error::Error + 'static> std::error::Error for RetryError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.last)
    }
}
