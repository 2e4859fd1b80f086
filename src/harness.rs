//! Parallel test-tree scheduler.
//!
//! A [`Suite`] runs a set of named top-level tests. Each test receives an
//! [`H`] handle through which it can log, fail, skip, declare itself parallel
//! and spawn nested sub-tests. Parallelism is bounded by a single shared
//! [`Slots`] context; sequential children borrow their parent's slot while
//! parallel children wait for their parent's body to return and then compete
//! for a free slot.
//!
//! # Outcomes
//!
//! | Body returns | Node outcome |
//! |--------------|--------------|
//! | `Ok(())` | passed, unless `error`/`fail` was called |
//! | `Err(TestError::Skip(_))` | skipped |
//! | `Err(TestError::Fail(_))` or `Err(TestError::Other(_))` | failed |
//! | panics | failed, with the panic message logged |
//!
//! Failure is sticky and reaches the parent once the child has completed.
//!
//! # Example
//!
//! ```no_run
//! use convoy::harness::{Suite, SuiteOptions};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut suite = Suite::new(SuiteOptions::new("_harness_out").with_parallel(4));
//!     suite.add("math", |h| async move {
//!         h.run("add", |h| async move {
//!             h.parallel().await?;
//!             if 1 + 1 != 2 {
//!                 return Err(h.fatal("arithmetic is broken"));
//!             }
//!             Ok(())
//!         })
//!         .await;
//!         Ok(())
//!     });
//!
//!     let result = suite.run().await?;
//!     std::process::exit(result.exit_code());
//! }
//! ```

pub mod arena;
mod handle;
pub mod slots;

use std::future::Future;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::report::{NullReporter, Reporter};

pub use arena::{NodeId, NodeState};
pub use handle::{H, PREVIOUS_FAILURE};
pub(crate) use handle::panic_message;
pub use slots::{Acquire, Slots};

/// Result returned by test bodies.
pub type TestFnResult<T = ()> = Result<T, TestError>;

/// A boxed test body, run at most once.
pub type Body = Box<dyn FnOnce(H) -> BoxFuture<'static, TestFnResult> + Send>;

/// Why a test body stopped early.
#[derive(Debug, thiserror::Error)]
pub enum TestError {
    /// The test does not apply here. Not a failure.
    #[error("{0}")]
    Skip(String),

    /// An assertion or required step failed.
    #[error("{0}")]
    Fail(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Final status of one top-level test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestOutcome {
    Passed,
    Failed,
    Skipped,
}

impl TestOutcome {
    /// Passed and skipped tests do not fail the run.
    pub fn is_success(&self) -> bool {
        matches!(self, TestOutcome::Passed | TestOutcome::Skipped)
    }

    pub fn label(&self) -> &'static str {
        match self {
            TestOutcome::Passed => "PASS",
            TestOutcome::Failed => "FAIL",
            TestOutcome::Skipped => "SKIP",
        }
    }
}

/// The recorded result of one top-level test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub name: String,
    pub outcome: TestOutcome,
    pub duration: Duration,
    /// Everything the test and its sub-tests logged.
    pub output: String,
    /// The last line logged before a failure or skip.
    pub message: Option<String>,
}

impl TestResult {
    pub fn new(name: impl Into<String>, outcome: TestOutcome) -> Self {
        Self {
            name: name.into(),
            outcome,
            duration: Duration::ZERO,
            output: String::new(),
            message: None,
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Aggregated results of one suite run.
///
/// | Exit code | Meaning |
/// |-----------|---------|
/// | 0 | No selected test failed |
/// | 1 | At least one test failed |
#[derive(Debug, Clone, Default)]
pub struct RunResult {
    pub total_tests: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub duration: Duration,
    pub output_dir: PathBuf,
    /// Per-test results, sorted by name.
    pub results: Vec<TestResult>,
}

impl RunResult {
    /// Builds a summary from per-test results.
    pub fn from_results(
        mut results: Vec<TestResult>,
        duration: Duration,
        output_dir: PathBuf,
    ) -> Self {
        results.sort_by(|a, b| a.name.cmp(&b.name));
        let count = |o: TestOutcome| results.iter().filter(|r| r.outcome == o).count();
        Self {
            total_tests: results.len(),
            passed: count(TestOutcome::Passed),
            failed: count(TestOutcome::Failed),
            skipped: count(TestOutcome::Skipped),
            duration,
            output_dir,
            results,
        }
    }

    pub fn success(&self) -> bool {
        self.failed == 0
    }

    pub fn exit_code(&self) -> i32 {
        if self.success() { 0 } else { 1 }
    }
}

/// Settings for one harness run.
#[derive(Debug, Clone)]
pub struct SuiteOptions {
    /// Maximum number of tests running at once.
    pub parallel: usize,
    /// Print `=== RUN` markers and the logs and headers of passing tests.
    pub verbose: bool,
    /// Wiped and recreated at the start of the run.
    pub output_dir: PathBuf,
}

impl SuiteOptions {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            parallel: 1,
            verbose: true,
            output_dir: output_dir.into(),
        }
    }

    pub fn with_parallel(mut self, parallel: usize) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

/// A set of top-level tests plus where their output goes.
pub struct Suite {
    opts: SuiteOptions,
    tests: Vec<(String, Body)>,
    reporter: Arc<dyn Reporter>,
    out: Box<dyn Write + Send>,
    token: CancellationToken,
}

impl Suite {
    pub fn new(opts: SuiteOptions) -> Self {
        Self {
            opts,
            tests: Vec::new(),
            reporter: Arc::new(NullReporter),
            out: Box::new(std::io::stdout()),
            token: CancellationToken::new(),
        }
    }

    /// Adds a top-level test. Tests run in the order they were added.
    pub fn add<F, Fut>(&mut self, name: impl Into<String>, body: F)
    where
        F: FnOnce(H) -> Fut + Send + 'static,
        Fut: Future<Output = TestFnResult> + Send + 'static,
    {
        self.tests
            .push((name.into(), Box::new(move |h| Box::pin(body(h)))));
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Redirects progress output (stdout by default).
    pub fn with_output(mut self, out: impl Write + Send + 'static) -> Self {
        self.out = Box::new(out);
        self
    }

    /// Cancelled tokens handed to every node derive from this one.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    /// Runs every test and waits for the whole tree to finish.
    ///
    /// # Errors
    ///
    /// Only setup problems (the output directory cannot be recreated) are
    /// errors; test failures are reported through the returned [`RunResult`].
    pub async fn run(self) -> Result<RunResult> {
        let started = Instant::now();
        let Suite {
            opts,
            tests,
            reporter,
            out,
            token,
        } = self;

        reset_dir(&opts.output_dir)?;

        let names: Vec<String> = tests.iter().map(|(n, _)| n.clone()).collect();
        reporter.on_run_start(&names).await;
        info!(tests = names.len(), parallel = opts.parallel, "Starting suite");

        let output_dir = opts.output_dir.clone();
        let shared = handle::Shared::new(opts, reporter.clone(), out, token);
        let root = H::root(shared.clone());

        handle::t_runner(
            root,
            Box::new(move |h| {
                Box::pin(async move {
                    for (name, body) in tests {
                        h.run_boxed(&name, body).await;
                    }
                    Ok(())
                })
            }),
        )
        .await;

        let result = RunResult::from_results(shared.take_results(), started.elapsed(), output_dir);
        debug!(
            passed = result.passed,
            failed = result.failed,
            skipped = result.skipped,
            "Suite finished"
        );
        reporter.on_run_complete(&result).await;
        Ok(result)
    }
}

fn reset_dir(dir: &std::path::Path) -> Result<()> {
    if dir.exists() {
        std::fs::remove_dir_all(dir)
            .with_context(|| format!("Failed to clear output directory {}", dir.display()))?;
    }
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create output directory {}", dir.display()))
}

/// Locks a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
