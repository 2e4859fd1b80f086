//! Bounded fan-out for independent remote operations.
//!
//! A [`WorkerGroup`] runs at most `limit` units of work at once and keeps the
//! first error any of them returns. The first error also cancels the group's
//! token; work already running is expected to notice the cancellation and
//! return, it is never aborted.
//!
//! ```no_run
//! use convoy::worker::WorkerGroup;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(machines: Vec<String>) -> Result<(), convoy::worker::WorkerError> {
//! let mut group = WorkerGroup::new(&CancellationToken::new(), 4);
//! for m in machines {
//!     if let Err(e) = group.start(move |token| async move {
//!         tokio::select! {
//!             _ = token.cancelled() => Ok(()),
//!             _ = reboot(&m) => Ok(()),
//!         }
//!     }).await {
//!         return group.wait_error(e).await;
//!     }
//! }
//! group.wait().await
//! # }
//! # async fn reboot(_m: &str) {}
//! ```

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::harness::{lock, panic_message};

/// The first failure recorded by a [`WorkerGroup`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum WorkerError {
    #[error("{0:#}")]
    Work(Arc<anyhow::Error>),

    #[error("worker panicked: {0}")]
    Panicked(String),

    #[error("worker group cancelled")]
    Cancelled,
}

impl From<anyhow::Error> for WorkerError {
    fn from(e: anyhow::Error) -> Self {
        WorkerError::Work(Arc::new(e))
    }
}

/// Runs closures concurrently up to a fixed limit, capturing the first error.
pub struct WorkerGroup {
    token: CancellationToken,
    permits: Arc<Semaphore>,
    tasks: JoinSet<()>,
    first_error: Arc<Mutex<Option<WorkerError>>>,
}

impl WorkerGroup {
    /// Creates a group whose token is a child of `parent`. `limit` is
    /// clamped to at least 1.
    pub fn new(parent: &CancellationToken, limit: usize) -> Self {
        Self {
            token: parent.child_token(),
            permits: Arc::new(Semaphore::new(limit.max(1))),
            tasks: JoinSet::new(),
            first_error: Arc::new(Mutex::new(None)),
        }
    }

    /// The token handed to every unit of work.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Waits for a free slot and starts `work` on it.
    ///
    /// Returns the first recorded error without starting anything once the
    /// group has failed or been cancelled.
    pub async fn start<F, Fut>(&mut self, work: F) -> Result<(), WorkerError>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if let Some(err) = self.recorded() {
            return Err(err);
        }

        let permit = tokio::select! {
            biased;
            _ = self.token.cancelled() => None,
            permit = self.permits.clone().acquire_owned() => permit.ok(),
        };
        let Some(permit) = permit else {
            return Err(self.recorded().unwrap_or(WorkerError::Cancelled));
        };

        let token = self.token.clone();
        let first_error = self.first_error.clone();
        self.tasks.spawn(async move {
            let outcome = match std::panic::catch_unwind(AssertUnwindSafe(|| work(token.clone()))) {
                Ok(fut) => AssertUnwindSafe(fut).catch_unwind().await,
                Err(panic) => Err(panic),
            };
            let err = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(WorkerError::from(e)),
                Err(panic) => Some(WorkerError::Panicked(panic_message(panic.as_ref()))),
            };
            if let Some(err) = err {
                record(&first_error, &token, err);
            }
            drop(permit);
        });
        Ok(())
    }

    /// Waits for all started work and returns the first error, if any.
    pub async fn wait(mut self) -> Result<(), WorkerError> {
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                // Panics are caught inside the task; this is an abort or a
                // runtime shutdown.
                record(
                    &self.first_error,
                    &self.token,
                    WorkerError::Panicked(e.to_string()),
                );
            }
        }
        self.token.cancel();
        match self.recorded() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Drains in-flight work after a failed [`start`](Self::start), then
    /// returns the group's first error, or `err` if none was recorded.
    pub async fn wait_error(self, err: WorkerError) -> Result<(), WorkerError> {
        self.wait().await?;
        Err(err)
    }

    fn recorded(&self) -> Option<WorkerError> {
        lock(&self.first_error).clone()
    }
}

fn record(slot: &Mutex<Option<WorkerError>>, token: &CancellationToken, err: WorkerError) {
    let mut first = lock(slot);
    if first.is_none() {
        debug!(error = %err, "Worker failed, cancelling group");
        *first = Some(err);
        token.cancel();
    } else {
        warn!(error = %err, "Additional worker failure");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use anyhow::anyhow;

    use super::*;

    struct Gauge {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Gauge {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            })
        }

        fn enter(&self) {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
        }

        fn exit(&self) {
            self.current.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_limit_and_first_error() {
        let gauge = Gauge::new();
        let started = Arc::new(AtomicUsize::new(0));
        let mut group = WorkerGroup::new(&CancellationToken::new(), 2);

        let mut start_err = None;
        for i in 0..8 {
            let gauge = gauge.clone();
            let started = started.clone();
            let res = group
                .start(move |_token| async move {
                    started.fetch_add(1, Ordering::SeqCst);
                    gauge.enter();
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    gauge.exit();
                    if i == 3 {
                        return Err(anyhow!("unit 3 failed"));
                    }
                    Ok(())
                })
                .await;
            if let Err(e) = res {
                start_err = Some(e);
                break;
            }
        }

        let err = match start_err {
            Some(e) => group.wait_error(e).await.unwrap_err(),
            None => group.wait().await.unwrap_err(),
        };
        assert_eq!(err.to_string(), "unit 3 failed");
        assert!(gauge.peak.load(Ordering::SeqCst) <= 2);
        assert!(started.load(Ordering::SeqCst) >= 4);
    }

    #[tokio::test]
    async fn test_all_succeed() {
        let gauge = Gauge::new();
        let mut group = WorkerGroup::new(&CancellationToken::new(), 3);
        for _ in 0..10 {
            let gauge = gauge.clone();
            group
                .start(move |_| async move {
                    gauge.enter();
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    gauge.exit();
                    Ok(())
                })
                .await
                .unwrap();
        }
        group.wait().await.unwrap();
        let peak = gauge.peak.load(Ordering::SeqCst);
        assert!((1..=3).contains(&peak));
    }

    #[tokio::test]
    async fn test_start_short_circuits_after_failure() {
        let mut group = WorkerGroup::new(&CancellationToken::new(), 4);
        let token = group.token();
        group
            .start(|_| async { Err(anyhow!("boom")) })
            .await
            .unwrap();
        token.cancelled().await;

        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        let err = group
            .start(move |_| async move {
                ran2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "boom");

        let err = group.wait_error(err).await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_in_flight_work_observes_cancellation() {
        let mut group = WorkerGroup::new(&CancellationToken::new(), 2);
        let observed = Arc::new(AtomicUsize::new(0));

        let seen = observed.clone();
        group
            .start(move |token| async move {
                token.cancelled().await;
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();
        group
            .start(|_| async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Err(anyhow!("second failed"))
            })
            .await
            .unwrap();

        let err = group.wait().await.unwrap_err();
        assert_eq!(err.to_string(), "second failed");
        assert_eq!(observed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panic_becomes_error() {
        let mut group = WorkerGroup::new(&CancellationToken::new(), 1);
        group
            .start(|_| async {
                if true {
                    panic!("worker exploded");
                }
                Ok(())
            })
            .await
            .unwrap();

        match group.wait().await {
            Err(WorkerError::Panicked(msg)) => assert_eq!(msg, "worker exploded"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_parent_cancellation_stops_start() {
        let parent = CancellationToken::new();
        let mut group = WorkerGroup::new(&parent, 1);
        parent.cancel();

        let err = group.start(|_| async { Ok(()) }).await.unwrap_err();
        assert!(matches!(err, WorkerError::Cancelled));
        group.wait().await.unwrap();
    }
}
