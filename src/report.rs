//! Result reporting.
//!
//! The harness drives a [`Reporter`] as top-level tests start and finish.
//! Built-in reporters write TAP (the run's summary file), JSON and JUnit XML;
//! [`print_summary`] renders the final counts on the console.

pub mod json;
pub mod junit;
pub mod tap;

use async_trait::async_trait;

use crate::harness::{RunResult, TestResult};

pub use json::JsonReporter;
pub use junit::JUnitReporter;
pub use tap::TapReporter;

/// Receives progress events for top-level tests.
#[async_trait]
pub trait Reporter: Send + Sync {
    /// Called once with the names of every test about to run.
    async fn on_run_start(&self, tests: &[String]);

    /// Called when a top-level test starts.
    async fn on_test_start(&self, name: &str);

    /// Called when a top-level test and all of its sub-tests have finished.
    async fn on_test_complete(&self, result: &TestResult);

    /// Called when all tests have completed.
    async fn on_run_complete(&self, result: &RunResult);
}

/// A reporter that does nothing.
pub struct NullReporter;

#[async_trait]
impl Reporter for NullReporter {
    async fn on_run_start(&self, _tests: &[String]) {}
    async fn on_test_start(&self, _name: &str) {}
    async fn on_test_complete(&self, _result: &TestResult) {}
    async fn on_run_complete(&self, _result: &RunResult) {}
}

/// Fans every event out to several reporters, in order.
#[derive(Default)]
pub struct MultiReporter {
    reporters: Vec<Box<dyn Reporter>>,
}

impl MultiReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reporter<R: Reporter + 'static>(mut self, reporter: R) -> Self {
        self.reporters.push(Box::new(reporter));
        self
    }

    pub fn len(&self) -> usize {
        self.reporters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reporters.is_empty()
    }
}

#[async_trait]
impl Reporter for MultiReporter {
    async fn on_run_start(&self, tests: &[String]) {
        for reporter in &self.reporters {
            reporter.on_run_start(tests).await;
        }
    }

    async fn on_test_start(&self, name: &str) {
        for reporter in &self.reporters {
            reporter.on_test_start(name).await;
        }
    }

    async fn on_test_complete(&self, result: &TestResult) {
        for reporter in &self.reporters {
            reporter.on_test_complete(result).await;
        }
    }

    async fn on_run_complete(&self, result: &RunResult) {
        for reporter in &self.reporters {
            reporter.on_run_complete(result).await;
        }
    }
}

/// Prints pass/fail/skip counts and the names of failed tests.
pub fn print_summary(result: &RunResult) {
    println!();
    println!("Test Results:");
    println!("  Total:   {}", result.total_tests);
    println!("  Passed:  {}", console::style(result.passed).green());
    println!("  Failed:  {}", console::style(result.failed).red());
    println!("  Skipped: {}", console::style(result.skipped).yellow());
    println!("  Duration: {:.2?}", result.duration);

    if result.success() {
        return;
    }

    println!();
    println!("Failed tests:");
    for r in result.results.iter().filter(|r| !r.outcome.is_success()) {
        println!("  - {}", r.name);
        if let Some(msg) = &r.message {
            println!("    {}", console::style(msg).dim());
        }
    }
}
