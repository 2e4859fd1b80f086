//! TAP (Test Anything Protocol) summary file.
//!
//! ```text
//! 1..3
//! ok 1 - basic.ssh
//! not ok 2 - basic.native
//! ok 3 - basic.manual.sleep # SKIP
//! ```
//!
//! Lines are numbered in completion order.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::{error, info};

use super::Reporter;
use crate::harness::{RunResult, TestOutcome, TestResult, lock};

/// Name of the summary file inside the run's output directory.
pub const TAP_FILE: &str = "test.tap";

struct TapState {
    planned: usize,
    lines: Vec<String>,
}

/// Writes a TAP summary when the run completes.
pub struct TapReporter {
    output_path: PathBuf,
    state: Mutex<TapState>,
}

impl TapReporter {
    pub fn new(output_path: PathBuf) -> Self {
        Self {
            output_path,
            state: Mutex::new(TapState {
                planned: 0,
                lines: Vec::new(),
            }),
        }
    }

    /// Reporter writing `test.tap` inside `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(TAP_FILE))
    }

    /// The TAP document collected so far.
    pub fn render(&self) -> String {
        let state = lock(&self.state);
        let mut out = format!("1..{}\n", state.planned);
        for line in &state.lines {
            out.push_str(line);
            out.push('\n');
        }
        out
    }
}

fn tap_line(n: usize, result: &TestResult) -> String {
    match result.outcome {
        TestOutcome::Passed => format!("ok {n} - {}", result.name),
        TestOutcome::Failed => format!("not ok {n} - {}", result.name),
        TestOutcome::Skipped => format!("ok {n} - {} # SKIP", result.name),
    }
}

#[async_trait]
impl Reporter for TapReporter {
    async fn on_run_start(&self, tests: &[String]) {
        let mut state = lock(&self.state);
        state.planned = tests.len();
        state.lines.clear();
    }

    async fn on_test_start(&self, _name: &str) {}

    async fn on_test_complete(&self, result: &TestResult) {
        let mut state = lock(&self.state);
        let n = state.lines.len() + 1;
        state.lines.push(tap_line(n, result));
    }

    async fn on_run_complete(&self, _result: &RunResult) {
        let doc = self.render();
        if let Some(parent) = self.output_path.parent()
            && let Err(e) = tokio::fs::create_dir_all(parent).await
        {
            error!("Failed to create TAP directory: {}", e);
            return;
        }
        match tokio::fs::write(&self.output_path, doc).await {
            Ok(()) => info!("TAP written to: {}", self.output_path.display()),
            Err(e) => error!("Failed to write TAP file: {}", e),
        }
    }
}
