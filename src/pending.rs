//! Polling wrapper for long-running provider operations.
//!
//! Backends that start work asynchronously (image uploads, instance creation)
//! wrap the returned operation in a [`Pending`] and block on
//! [`wait`](Pending::wait). Polling happens on a fixed interval; transient
//! poll errors are tolerated up to a small limit. The timeout is advisory:
//! the default progress callback uses it to declare the operation overdue,
//! a custom callback may ignore it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Poll errors tolerated before [`Pending::wait`] gives up.
pub const MAX_POLL_FAILURES: usize = 5;

/// Lifecycle of a provider-side operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Pending,
    Running,
    Done,
}

/// One observation of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationStatus {
    pub state: OperationState,
    /// Structured sub-errors reported by the provider.
    pub errors: Vec<String>,
    /// The provider marked the operation failed.
    pub failed: bool,
}

impl OperationStatus {
    pub fn new(state: OperationState) -> Self {
        Self {
            state,
            errors: Vec::new(),
            failed: false,
        }
    }

    pub fn done() -> Self {
        Self::new(OperationState::Done)
    }

    pub fn running() -> Self {
        Self::new(OperationState::Running)
    }

    pub fn with_error(mut self, err: impl Into<String>) -> Self {
        self.errors.push(err.into());
        self.failed = true;
        self
    }

    pub fn with_failed(mut self, failed: bool) -> Self {
        self.failed = failed;
        self
    }

    pub fn is_done(&self) -> bool {
        self.state == OperationState::Done
    }
}

/// Something that can report on its own progress.
#[async_trait]
pub trait Operation: Send + Sync {
    async fn poll(&self) -> anyhow::Result<OperationStatus>;
}

#[derive(Debug, thiserror::Error)]
pub enum PendingError {
    #[error("failed polling operation {desc}: {source:#}")]
    PollFailed {
        desc: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("operation {desc} failed: {}", .errors.join("; "))]
    Failed { desc: String, errors: Vec<String> },

    #[error("operation {desc} failed to start")]
    FailedToStart { desc: String },

    #[error("operation {desc} did not finish within {timeout:?}")]
    TimedOut { desc: String, timeout: Duration },
}

/// Called after every successful poll with the elapsed time. An error ends
/// the wait.
pub type ProgressFn =
    Arc<dyn Fn(&str, Duration, &OperationStatus) -> Result<(), PendingError> + Send + Sync>;

/// An in-flight provider operation.
pub struct Pending<O> {
    desc: String,
    op: O,
    interval: Duration,
    timeout: Duration,
    progress: Option<ProgressFn>,
}

impl<O: Operation> Pending<O> {
    /// Polls every 10 seconds with a 20 minute advisory timeout.
    pub fn new(desc: impl Into<String>, op: O) -> Self {
        Self {
            desc: desc.into(),
            op,
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(20 * 60),
            progress: None,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Replaces the default progress callback.
    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Polls until the operation is done and converts its final status.
    pub async fn wait(self) -> Result<(), PendingError> {
        let started = Instant::now();
        let mut failures = 0;

        let status = loop {
            match self.op.poll().await {
                Ok(status) => {
                    self.report(started.elapsed(), &status)?;
                    if status.is_done() {
                        break status;
                    }
                }
                Err(e) => {
                    failures += 1;
                    if failures > MAX_POLL_FAILURES {
                        return Err(PendingError::PollFailed {
                            desc: self.desc,
                            source: e,
                        });
                    }
                    warn!(op = %self.desc, failures, error = %e, "Poll failed");
                }
            }
            sleep(self.interval).await;
        };

        if !status.errors.is_empty() {
            return Err(PendingError::Failed {
                desc: self.desc,
                errors: status.errors,
            });
        }
        if status.failed {
            return Err(PendingError::FailedToStart { desc: self.desc });
        }
        debug!(op = %self.desc, elapsed = ?started.elapsed(), "Operation done");
        Ok(())
    }

    fn report(&self, elapsed: Duration, status: &OperationStatus) -> Result<(), PendingError> {
        match &self.progress {
            Some(progress) => progress(&self.desc, elapsed, status),
            None => {
                if elapsed > self.timeout {
                    return Err(PendingError::TimedOut {
                        desc: self.desc.clone(),
                        timeout: self.timeout,
                    });
                }
                info!(op = %self.desc, state = ?status.state, elapsed = ?elapsed, "Waiting");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::anyhow;

    use super::*;

    /// Replays a script of poll results, repeating the last one.
    struct Scripted {
        script: Mutex<VecDeque<anyhow::Result<OperationStatus>>>,
        polls: AtomicUsize,
    }

    impl Scripted {
        fn new(script: Vec<anyhow::Result<OperationStatus>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                polls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Operation for Scripted {
        async fn poll(&self) -> anyhow::Result<OperationStatus> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                script.pop_front().unwrap()
            } else {
                match script.front().unwrap() {
                    Ok(s) => Ok(s.clone()),
                    Err(e) => Err(anyhow!("{e}")),
                }
            }
        }
    }

    fn fast<O: Operation>(op: O) -> Pending<O> {
        Pending::new("op-1", op).with_interval(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_wait_until_done() {
        let op = Scripted::new(vec![
            Ok(OperationStatus::new(OperationState::Pending)),
            Ok(OperationStatus::running()),
            Err(anyhow!("flaky")),
            Ok(OperationStatus::done()),
        ]);
        fast(op).wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_poll_failures_abort() {
        let op = Arc::new(Scripted::new(vec![Err(anyhow!("api down"))]));

        struct Shared(Arc<Scripted>);
        #[async_trait]
        impl Operation for Shared {
            async fn poll(&self) -> anyhow::Result<OperationStatus> {
                self.0.poll().await
            }
        }

        let err = fast(Shared(op.clone())).wait().await.unwrap_err();
        assert!(matches!(err, PendingError::PollFailed { .. }));
        assert_eq!(op.polls.load(Ordering::SeqCst), MAX_POLL_FAILURES + 1);
        assert!(err.to_string().contains("api down"));
    }

    #[tokio::test]
    async fn test_structured_errors_are_joined() {
        let op = Scripted::new(vec![Ok(OperationStatus::done()
            .with_error("QUOTA_EXCEEDED")
            .with_error("ZONE_RESOURCE_POOL_EXHAUSTED"))]);
        let err = fast(op).wait().await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "operation op-1 failed: QUOTA_EXCEEDED; ZONE_RESOURCE_POOL_EXHAUSTED"
        );
    }

    #[tokio::test]
    async fn test_failure_without_detail() {
        let op = Scripted::new(vec![Ok(OperationStatus::done().with_failed(true))]);
        let err = fast(op).wait().await.unwrap_err();
        assert!(matches!(err, PendingError::FailedToStart { .. }));
    }

    #[tokio::test]
    async fn test_default_progress_times_out() {
        let op = Scripted::new(vec![Ok(OperationStatus::running())]);
        let err = fast(op)
            .with_timeout(Duration::from_millis(20))
            .wait()
            .await
            .unwrap_err();
        assert!(matches!(err, PendingError::TimedOut { .. }));
    }

    #[tokio::test]
    async fn test_custom_progress_sees_every_poll() {
        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        let op = Scripted::new(vec![
            Ok(OperationStatus::running()),
            Ok(OperationStatus::running()),
            Ok(OperationStatus::done()),
        ]);

        fast(op)
            .with_timeout(Duration::ZERO)
            .with_progress(Arc::new(move |desc, _elapsed, _status| {
                assert_eq!(desc, "op-1");
                s.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .wait()
            .await
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }
}
