//! Bounded retries with a fixed delay.
//!
//! Transient infrastructure failures (an SSH daemon that is not up yet, a
//! rate-limited API) are retried at the call site a small, fixed number of
//! times. Each call site owns its [`RetryPolicy`]; the defaults live in the
//! `[retry]` table of the config file.

use std::future::Future;
use std::time::{Duration, Instant};

use tokio::time::sleep;
use tracing::{debug, warn};

/// Errors that may succeed when the operation is repeated.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for anyhow::Error {
    fn is_retryable(&self) -> bool {
        true
    }
}

/// Fixed-delay retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one (minimum 1).
    pub attempts: u32,
    /// Pause between attempts.
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }

    /// A policy that tries exactly once.
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    fn max_attempts(&self) -> u32 {
        self.attempts.max(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(2))
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempts are used up. Returns the last error.
pub async fn retry<F, Fut, T, E>(phase: &str, policy: &RetryPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    let max_attempts = policy.max_attempts();
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(phase, attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                warn!(phase, attempt, max_attempts, error = %err, "Attempt failed, retrying");
                sleep(policy.delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Retries `op` every `delay` until it succeeds or `timeout` has elapsed,
/// then returns the last error.
pub async fn retry_until<F, Fut, T, E>(
    phase: &str,
    timeout: Duration,
    delay: Duration,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let deadline = Instant::now() + timeout;
    let mut attempt = 1u32;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if Instant::now() + delay < deadline => {
                debug!(phase, attempt, error = %err, "Not ready yet");
                sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                warn!(phase, attempt, error = %err, "Giving up after timeout");
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[derive(Debug)]
    enum Flaky {
        Transient,
        Fatal,
    }

    impl std::fmt::Display for Flaky {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Flaky::Transient => write!(f, "transient"),
                Flaky::Fatal => write!(f, "fatal"),
            }
        }
    }

    impl Retryable for Flaky {
        fn is_retryable(&self) -> bool {
            matches!(self, Flaky::Transient)
        }
    }

    fn fast(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_retry_succeeds_on_third_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result = retry("ssh", &fast(5), move || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Flaky::Transient)
                } else {
                    Ok(7u32)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_stops_at_attempt_limit() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result: Result<(), Flaky> = retry("create", &fast(3), move || {
            c.fetch_add(1, Ordering::SeqCst);
            async { Err(Flaky::Transient) }
        })
        .await;

        assert!(matches!(result, Err(Flaky::Transient)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_fails_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result: Result<(), Flaky> = retry("copy", &fast(5), move || {
            c.fetch_add(1, Ordering::SeqCst);
            async { Err(Flaky::Fatal) }
        })
        .await;

        assert!(matches!(result, Err(Flaky::Fatal)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_attempts_still_tries_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let _: Result<(), Flaky> = retry("x", &fast(0), move || {
            c.fetch_add(1, Ordering::SeqCst);
            async { Err(Flaky::Transient) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_until_gives_up_after_timeout() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let started = Instant::now();

        let result: Result<(), String> = retry_until(
            "probe",
            Duration::from_millis(50),
            Duration::from_millis(10),
            move || {
                c.fetch_add(1, Ordering::SeqCst);
                async { Err("not booted".to_string()) }
            },
        )
        .await;

        assert_eq!(result.unwrap_err(), "not booted");
        assert!(started.elapsed() < Duration::from_secs(1));
        let n = calls.load(Ordering::SeqCst);
        assert!((2..=6).contains(&n), "unexpected call count {n}");
    }

    #[tokio::test]
    async fn test_retry_until_returns_first_success() {
        let result: Result<u8, String> = retry_until(
            "probe",
            Duration::from_secs(5),
            Duration::from_millis(1),
            || async { Ok(1) },
        )
        .await;
        assert_eq!(result.unwrap(), 1);
    }
}
