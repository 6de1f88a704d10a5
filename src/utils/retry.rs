//! Bounded retry with cancellation
//!
//! Runs an async operation until it succeeds, the retry budget runs out, or
//! the run is cancelled. The pause between attempts is computed per attempt
//! so callers can use a fixed delay or a growing backoff.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How long to pause after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same pause after every attempt
    Fixed(Duration),
    /// `base * (attempt + 1)`
    Linear(Duration),
}

impl Backoff {
    /// Pause after the zero-based `attempt`
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Self::Fixed(delay) => delay,
            Self::Linear(base) => base.saturating_mul(attempt.saturating_add(1)),
        }
    }
}

/// Why a retried operation gave up
#[derive(Debug)]
pub enum RetryError<E> {
    /// Every attempt failed; carries the last error
    Exhausted {
        /// Attempts made
        attempts: u32,
        /// Error of the final attempt
        last: E,
    },
    /// Cancelled before an attempt succeeded
    Cancelled,
}

/// Wait for `delay` unless `cancel` fires first
///
/// Returns `false` when cancelled.
pub async fn pause(delay: Duration, cancel: &CancellationToken) -> bool {
    if delay.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        biased;
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(delay) => true,
    }
}

/// Run `op` once, then up to `retries` more times
pub async fn retry<T, E, F, Fut>(
    what: &str,
    retries: u32,
    backoff: Backoff,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(RetryError::Cancelled),
            outcome = op(attempt) => outcome,
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= retries => {
                return Err(RetryError::Exhausted {
                    attempts: attempt + 1,
                    last: e,
                });
            }
            Err(e) => {
                debug!("{what} failed (attempt {}): {e}", attempt + 1);
                if !pause(backoff.delay(attempt), cancel).await {
                    return Err(RetryError::Cancelled);
                }
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_delays() {
        let linear = Backoff::Linear(Duration::from_millis(100));
        assert_eq!(linear.delay(0), Duration::from_millis(100));
        assert_eq!(linear.delay(3), Duration::from_millis(400));
        assert_eq!(Backoff::Fixed(Duration::from_millis(7)).delay(9), Duration::from_millis(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_failures() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let result: Result<u32, RetryError<String>> = retry(
            "op",
            5,
            Backoff::Fixed(Duration::from_millis(100)),
            &cancel,
            |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err("not yet".to_string())
                    } else {
                        Ok(attempt)
                    }
                }
            },
        )
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_budget() {
        let cancel = CancellationToken::new();
        let result: Result<(), RetryError<&str>> = retry(
            "op",
            5,
            Backoff::Fixed(Duration::from_millis(400)),
            &cancel,
            |_| async { Err("nope") },
        )
        .await;
        match result {
            Err(RetryError::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 6);
                assert_eq!(last, "nope");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<(), RetryError<&str>> =
            retry("op", 5, Backoff::Fixed(Duration::ZERO), &cancel, |_| async { Ok(()) }).await;
        assert!(matches!(result, Err(RetryError::Cancelled)));
    }
}
