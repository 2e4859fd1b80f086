use std::any::Any;
use std::future::Future;
use std::io::Write;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::FutureExt;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::arena::{Arena, Node, NodeId, NodeState, ROOT, Yield};
use super::{Body, SuiteOptions, TestError, TestFnResult, TestOutcome, TestResult, lock};
use crate::harness::slots::{Acquire, Slots};
use crate::report::Reporter;

/// Logged by siblings skipped under fail-fast.
pub const PREVIOUS_FAILURE: &str = "A previous test has already failed";

const INDENT: &str = "    ";

pub(crate) struct Shared {
    opts: SuiteOptions,
    slots: Slots,
    arena: Mutex<Arena>,
    out: Mutex<Box<dyn Write + Send>>,
    reporter: Arc<dyn Reporter>,
    results: Mutex<Vec<TestResult>>,
}

impl Shared {
    pub(crate) fn new(
        opts: SuiteOptions,
        reporter: Arc<dyn Reporter>,
        out: Box<dyn Write + Send>,
        token: CancellationToken,
    ) -> Arc<Self> {
        let slots = Slots::new(opts.parallel);
        Arc::new(Self {
            opts,
            slots,
            arena: Mutex::new(Arena::new(token)),
            out: Mutex::new(out),
            reporter,
            results: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn take_results(&self) -> Vec<TestResult> {
        std::mem::take(&mut *lock(&self.results))
    }

    fn print(&self, text: &str) {
        let mut out = lock(&self.out);
        if let Err(e) = out.write_all(text.as_bytes()).and_then(|_| out.flush()) {
            warn!("Failed to write test output: {}", e);
        }
    }
}

/// Handle to one node of the running test tree.
///
/// Cloning is cheap; all clones refer to the same node.
#[derive(Clone)]
pub struct H {
    shared: Arc<Shared>,
    id: NodeId,
}

impl H {
    /// The root handle. It holds the first concurrency slot.
    pub(crate) fn root(shared: Arc<Shared>) -> Self {
        if let Acquire::Queued(_) = shared.slots.try_acquire() {
            warn!("Root test started without a free slot");
        }
        Self { shared, id: ROOT }
    }

    fn with_node<R>(&self, f: impl FnOnce(&mut Node) -> R) -> R {
        let mut arena = lock(&self.shared.arena);
        f(arena.get_mut(self.id))
    }

    /// Path-qualified name, e.g. `parent/child`.
    pub fn name(&self) -> String {
        self.with_node(|n| n.name.clone())
    }

    /// Depth in the tree; top-level tests are at level 1.
    pub fn level(&self) -> usize {
        self.with_node(|n| n.level)
    }

    pub fn state(&self) -> NodeState {
        self.with_node(|n| n.state)
    }

    /// Appends a message to this test's log.
    pub fn log(&self, msg: impl AsRef<str>) {
        let msg = msg.as_ref();
        self.with_node(|n| {
            for line in msg.lines() {
                n.log.push_str(line);
                n.log.push('\n');
                n.output.push_str(INDENT);
                n.output.push_str(line);
                n.output.push('\n');
            }
        });
    }

    /// Logs a message and marks the test failed, without stopping it.
    pub fn error(&self, msg: impl AsRef<str>) {
        self.log(msg);
        self.fail();
    }

    /// Marks the test failed, without stopping it.
    pub fn fail(&self) {
        self.with_node(|n| n.failed = true);
    }

    pub fn failed(&self) -> bool {
        self.with_node(|n| n.failed)
    }

    pub fn skipped(&self) -> bool {
        self.with_node(|n| n.skipped)
    }

    /// Builds the error that ends the body as a failure.
    ///
    /// ```ignore
    /// return Err(h.fatal("machine never came up"));
    /// ```
    pub fn fatal(&self, msg: impl Into<String>) -> TestError {
        TestError::Fail(msg.into())
    }

    /// Builds the error that ends the body as a skip.
    pub fn skip(&self, msg: impl Into<String>) -> TestError {
        TestError::Skip(msg.into())
    }

    /// Once a child has failed, later children are skipped instead of run.
    pub fn set_fail_fast(&self, on: bool) {
        self.with_node(|n| n.fail_fast = on);
    }

    /// Cancelled when this node completes or any ancestor is cancelled.
    pub fn token(&self) -> CancellationToken {
        self.with_node(|n| n.token.clone())
    }

    pub fn verbose(&self) -> bool {
        self.shared.opts.verbose
    }

    /// Directory for this test's artifacts, created on first use.
    pub fn output_dir(&self) -> std::io::Result<PathBuf> {
        let dir = self.shared.opts.output_dir.join(self.name());
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Lets the parent continue and runs this test alongside its parallel
    /// siblings once the parent's body has returned and a slot is free.
    ///
    /// Must be called at most once, before any sub-tests are started.
    pub async fn parallel(&self) -> TestFnResult {
        let (signal, mut barrier) = {
            let mut arena = lock(&self.shared.arena);
            let node = arena.get_mut(self.id);
            if node.is_parallel {
                return Err(TestError::Fail(
                    "parallel() called more than once".to_string(),
                ));
            }
            let Some(parent) = node.parent else {
                return Err(TestError::Fail(
                    "parallel() called on the root test".to_string(),
                ));
            };
            node.is_parallel = true;
            node.duration += node.started.elapsed();
            node.state = NodeState::WaitingToStart;
            let signal = node.signal.take();
            (signal, arena.get(parent).barrier.subscribe())
        };

        if let Some(signal) = signal {
            let _ = signal.send(Yield::Parallel);
        }

        // An error means the parent is gone, which only happens at shutdown.
        let _ = barrier.wait_for(|open| *open).await;
        self.shared.slots.acquire().await;

        self.with_node(|n| {
            n.started = Instant::now();
            n.state = NodeState::Running;
        });
        Ok(())
    }

    /// Runs `body` as a sub-test named `name`.
    ///
    /// Returns once the sub-test completes or calls [`parallel`](Self::parallel).
    /// The result is `false` if the sub-test has failed by then.
    pub async fn run<F, Fut>(&self, name: &str, body: F) -> bool
    where
        F: FnOnce(H) -> Fut + Send + 'static,
        Fut: Future<Output = TestFnResult> + Send + 'static,
    {
        self.run_boxed(name, Box::new(move |h| Box::pin(body(h))))
            .await
    }

    pub(crate) async fn run_boxed(&self, name: &str, body: Body) -> bool {
        let (tx, rx) = oneshot::channel();
        let (child, skip) = {
            let mut arena = lock(&self.shared.arena);
            let parent = arena.get(self.id);
            let skip = parent.fail_fast && parent.child_failed;
            let id = arena.add_child(self.id, name, tx);
            (
                H {
                    shared: self.shared.clone(),
                    id,
                },
                skip,
            )
        };

        let child_name = child.name();
        if self.shared.opts.verbose {
            self.shared.print(&format!("=== RUN   {child_name}\n"));
        }
        if child.level() == 1 {
            self.shared.reporter.on_test_start(&child_name).await;
        }
        debug!(test = %child_name, skip, "Starting test");

        let body: Body = if skip {
            Box::new(|_h| Box::pin(async { Err(TestError::Skip(PREVIOUS_FAILURE.to_string())) }))
        } else {
            body
        };

        let task = tokio::spawn(t_runner(child.clone(), body));
        match rx.await {
            Ok(Yield::Parallel) => {
                self.with_node(|n| n.parallel_subs.push(task));
                !child.failed()
            }
            Ok(Yield::Done) | Err(_) => {
                if let Err(e) = task.await {
                    child.error(format!("test task aborted: {e}"));
                }
                !child.failed()
            }
        }
    }

    /// Waits for parallel children, restores slot accounting and reports.
    async fn finish(&self) {
        let (subs, is_parallel) = self.with_node(|n| {
            n.barrier.send_replace(true);
            (std::mem::take(&mut n.parallel_subs), n.is_parallel)
        });

        if !subs.is_empty() {
            self.shared.slots.release();
            for sub in subs {
                if let Err(e) = sub.await {
                    self.error(format!("parallel sub-test task aborted: {e}"));
                }
            }
            if !is_parallel {
                self.shared.slots.acquire().await;
            }
        } else if is_parallel {
            self.shared.slots.release();
        }

        self.report().await;

        let signal = self.with_node(|n| {
            n.state = NodeState::Done;
            n.token.cancel();
            n.signal.take()
        });
        if let Some(signal) = signal {
            let _ = signal.send(Yield::Done);
        }
    }

    /// Flushes this node's outcome to its parent (or stdout for top-level
    /// tests) and propagates failure upwards.
    async fn report(&self) {
        let verbose = self.shared.opts.verbose;
        let report = {
            let mut arena = lock(&self.shared.arena);
            let node = arena.get_mut(self.id);
            node.duration += node.started.elapsed();
            let Some(parent) = node.parent else {
                return;
            };

            let outcome = if node.failed {
                TestOutcome::Failed
            } else if node.skipped {
                TestOutcome::Skipped
            } else {
                TestOutcome::Passed
            };

            let mut block = String::new();
            if node.failed || verbose {
                block = format!(
                    "--- {}: {} ({:.2}s)\n",
                    outcome.label(),
                    node.name,
                    node.duration.as_secs_f64()
                );
                block.push_str(&node.output);
            }

            let report = Report {
                name: node.name.clone(),
                level: node.level,
                outcome,
                duration: node.duration,
                log: std::mem::take(&mut node.log),
                block,
            };
            node.output = String::new();

            let failed = node.failed;
            let parent = arena.get_mut(parent);
            if failed {
                parent.failed = true;
                parent.child_failed = true;
            }
            if report.level > 1 {
                parent.output.push_str(&indent(&report.block));
            }
            report
        };

        if report.level == 1 && !report.block.is_empty() {
            self.shared.print(&report.block);
        }
        self.save_log(&report).await;

        if report.level == 1 {
            let mut result = TestResult::new(&report.name, report.outcome)
                .with_duration(report.duration)
                .with_output(report.log.clone());
            if report.outcome != TestOutcome::Passed {
                if let Some(last) = report.log.lines().rev().find(|l| !l.trim().is_empty()) {
                    result = result.with_message(last);
                }
            }
            self.shared.reporter.on_test_complete(&result).await;
            lock(&self.shared.results).push(result);
        }
    }

    async fn save_log(&self, report: &Report) {
        if report.log.is_empty() {
            return;
        }
        let dir = self.shared.opts.output_dir.join(&report.name);
        let written = async {
            tokio::fs::create_dir_all(&dir).await?;
            tokio::fs::write(dir.join("test.log"), &report.log).await
        };
        if let Err(e) = written.await {
            warn!(test = %report.name, "Failed to save test log: {}", e);
        }
    }
}

struct Report {
    name: String,
    level: usize,
    outcome: TestOutcome,
    duration: std::time::Duration,
    log: String,
    block: String,
}

/// Runs one node's body and everything that follows it.
pub(crate) async fn t_runner(h: H, body: Body) {
    h.with_node(|n| {
        n.state = NodeState::Running;
        n.started = Instant::now();
    });

    let outcome = match std::panic::catch_unwind(AssertUnwindSafe(|| body(h.clone()))) {
        Ok(fut) => AssertUnwindSafe(fut).catch_unwind().await,
        Err(panic) => Err(panic),
    };

    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(TestError::Skip(msg))) => {
            if !msg.is_empty() {
                h.log(msg);
            }
            h.with_node(|n| n.skipped = true);
        }
        Ok(Err(TestError::Fail(msg))) => h.error(msg),
        Ok(Err(TestError::Other(e))) => h.error(format!("{e:#}")),
        Err(panic) => h.error(format!("panic: {}", panic_message(panic.as_ref()))),
    }

    h.finish().await;
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn indent(block: &str) -> String {
    block
        .lines()
        .map(|l| format!("{INDENT}{l}\n"))
        .collect()
}
