//! Machine-readable JSON run report.

use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info};

use super::Reporter;
use crate::harness::{RunResult, TestOutcome, TestResult, lock};

#[derive(Debug, Serialize)]
struct JsonTest<'a> {
    name: &'a str,
    outcome: TestOutcome,
    duration_secs: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct JsonReport<'a> {
    started_at: Option<DateTime<Utc>>,
    finished_at: DateTime<Utc>,
    duration_secs: f64,
    total: usize,
    passed: usize,
    failed: usize,
    skipped: usize,
    output_dir: String,
    tests: Vec<JsonTest<'a>>,
}

/// Writes a JSON summary of the run to `output_path`.
pub struct JsonReporter {
    output_path: PathBuf,
    started_at: Mutex<Option<DateTime<Utc>>>,
}

impl JsonReporter {
    pub fn new(output_path: PathBuf) -> Self {
        Self {
            output_path,
            started_at: Mutex::new(None),
        }
    }

    fn render(&self, result: &RunResult) -> serde_json::Result<String> {
        let report = JsonReport {
            started_at: *lock(&self.started_at),
            finished_at: Utc::now(),
            duration_secs: result.duration.as_secs_f64(),
            total: result.total_tests,
            passed: result.passed,
            failed: result.failed,
            skipped: result.skipped,
            output_dir: result.output_dir.display().to_string(),
            tests: result
                .results
                .iter()
                .map(|r| JsonTest {
                    name: &r.name,
                    outcome: r.outcome,
                    duration_secs: r.duration.as_secs_f64(),
                    message: r.message.as_deref(),
                })
                .collect(),
        };
        serde_json::to_string_pretty(&report)
    }
}

#[async_trait]
impl Reporter for JsonReporter {
    async fn on_run_start(&self, _tests: &[String]) {
        *lock(&self.started_at) = Some(Utc::now());
    }

    async fn on_test_start(&self, _name: &str) {}

    async fn on_test_complete(&self, _result: &TestResult) {}

    async fn on_run_complete(&self, result: &RunResult) {
        let json = match self.render(result) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to render JSON report: {}", e);
                return;
            }
        };
        if let Some(parent) = self.output_path.parent()
            && let Err(e) = tokio::fs::create_dir_all(parent).await
        {
            error!("Failed to create report directory: {}", e);
            return;
        }
        match tokio::fs::write(&self.output_path, json).await {
            Ok(()) => info!("JSON report written to: {}", self.output_path.display()),
            Err(e) => error!("Failed to write JSON report: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_json_report_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reports/report.json");
        let reporter = JsonReporter::new(path.clone());

        reporter.on_run_start(&[]).await;
        let result = RunResult::from_results(
            vec![
                TestResult::new("ok.one", TestOutcome::Passed).with_duration(Duration::from_millis(1500)),
                TestResult::new("bad.one", TestOutcome::Failed).with_message("exit status 1"),
            ],
            Duration::from_secs(3),
            PathBuf::from("_convoy_temp"),
        );
        reporter.on_run_complete(&result).await;

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(value["total"], 2);
        assert_eq!(value["failed"], 1);
        assert_eq!(value["tests"][0]["name"], "bad.one");
        assert_eq!(value["tests"][0]["outcome"], "failed");
        assert_eq!(value["tests"][0]["message"], "exit status 1");
        assert_eq!(value["tests"][1]["duration_secs"], 1.5);
        assert!(value["tests"][1].get("message").is_none());
        assert!(value["started_at"].is_string());
    }
}
