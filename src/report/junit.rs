//! JUnit XML report generation.
//!
//! Generates JUnit XML for CI dashboards. Each top-level test becomes one
//! `<testcase>`; the dotted test name is split at its last dot into the
//! classname and the case name.
//!
//! # Format
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <testsuites tests="3" failures="1" errors="0" time="41.204">
//!   <testsuite name="convoy" tests="3" failures="1" errors="0" skipped="1" time="41.204">
//!     <testcase classname="basic" name="ssh" time="12.010"/>
//!     <testcase classname="basic" name="native" time="20.113">
//!       <failure message="exit status 1" type="TestFailure">...</failure>
//!     </testcase>
//!     <testcase classname="basic.manual" name="sleep" time="0.000">
//!       <skipped/>
//!     </testcase>
//!   </testsuite>
//! </testsuites>
//! ```
//!
//! # Example
//!
//! ```
//! use convoy::report::JUnitReporter;
//!
//! let reporter = JUnitReporter::new("test-results/junit.xml".into())
//!     .with_testsuite_name("nightly");
//! ```

use std::path::PathBuf;

use async_trait::async_trait;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

use super::Reporter;
use crate::harness::{RunResult, TestOutcome, TestResult};

/// Reporter that writes a JUnit XML file when the run completes.
///
/// Parent directories are created if they don't exist.
pub struct JUnitReporter {
    output_path: PathBuf,
    testsuite_name: String,
}

impl JUnitReporter {
    pub fn new(output_path: PathBuf) -> Self {
        Self {
            output_path,
            testsuite_name: "convoy".to_string(),
        }
    }

    /// Sets the `<testsuite name>` attribute. Defaults to `"convoy"`.
    pub fn with_testsuite_name(mut self, name: impl Into<String>) -> Self {
        self.testsuite_name = name.into();
        self
    }

    fn generate_xml(&self, run_result: &RunResult) -> anyhow::Result<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        let tests = run_result.total_tests.to_string();
        let failures = run_result.failed.to_string();
        let skipped = run_result.skipped.to_string();
        let time = format!("{:.3}", run_result.duration.as_secs_f64());

        let mut testsuites = BytesStart::new("testsuites");
        testsuites.push_attribute(("tests", tests.as_str()));
        testsuites.push_attribute(("failures", failures.as_str()));
        testsuites.push_attribute(("errors", "0"));
        testsuites.push_attribute(("time", time.as_str()));
        writer.write_event(Event::Start(testsuites))?;

        let mut testsuite = BytesStart::new("testsuite");
        testsuite.push_attribute(("name", self.testsuite_name.as_str()));
        testsuite.push_attribute(("tests", tests.as_str()));
        testsuite.push_attribute(("failures", failures.as_str()));
        testsuite.push_attribute(("errors", "0"));
        testsuite.push_attribute(("skipped", skipped.as_str()));
        testsuite.push_attribute(("time", time.as_str()));
        writer.write_event(Event::Start(testsuite))?;

        for result in &run_result.results {
            write_testcase(&mut writer, result)?;
        }

        writer.write_event(Event::End(BytesEnd::new("testsuite")))?;
        writer.write_event(Event::End(BytesEnd::new("testsuites")))?;

        Ok(String::from_utf8(writer.into_inner())?)
    }
}

fn write_testcase<W: std::io::Write>(
    writer: &mut Writer<W>,
    result: &TestResult,
) -> anyhow::Result<()> {
    let (classname, name) = split_test_name(&result.name);

    let mut testcase = BytesStart::new("testcase");
    testcase.push_attribute(("classname", classname));
    testcase.push_attribute(("name", name));
    testcase.push_attribute((
        "time",
        format!("{:.3}", result.duration.as_secs_f64()).as_str(),
    ));

    match result.outcome {
        TestOutcome::Passed => {
            writer.write_event(Event::Empty(testcase))?;
        }
        TestOutcome::Failed => {
            writer.write_event(Event::Start(testcase))?;

            let mut failure = BytesStart::new("failure");
            if let Some(msg) = &result.message {
                failure.push_attribute(("message", xml_chars(msg).as_str()));
            }
            failure.push_attribute(("type", "TestFailure"));
            writer.write_event(Event::Start(failure))?;
            if !result.output.is_empty() {
                writer.write_event(Event::Text(BytesText::new(&xml_chars(&result.output))))?;
            }
            writer.write_event(Event::End(BytesEnd::new("failure")))?;

            writer.write_event(Event::End(BytesEnd::new("testcase")))?;
        }
        TestOutcome::Skipped => {
            writer.write_event(Event::Start(testcase))?;

            let mut skipped = BytesStart::new("skipped");
            if let Some(msg) = &result.message {
                skipped.push_attribute(("message", xml_chars(msg).as_str()));
            }
            writer.write_event(Event::Empty(skipped))?;

            writer.write_event(Event::End(BytesEnd::new("testcase")))?;
        }
    }

    Ok(())
}

#[async_trait]
impl Reporter for JUnitReporter {
    async fn on_run_start(&self, _tests: &[String]) {}

    async fn on_test_start(&self, _name: &str) {}

    async fn on_test_complete(&self, _result: &TestResult) {}

    async fn on_run_complete(&self, result: &RunResult) {
        match self.generate_xml(result) {
            Ok(xml) => {
                if let Some(parent) = self.output_path.parent()
                    && !parent.as_os_str().is_empty()
                    && let Err(e) = std::fs::create_dir_all(parent)
                {
                    tracing::error!("Failed to create output directory: {}", e);
                    return;
                }

                if let Err(e) = std::fs::write(&self.output_path, xml) {
                    tracing::error!("Failed to write JUnit XML: {}", e);
                } else {
                    tracing::info!("JUnit XML written to: {}", self.output_path.display());
                }
            }
            Err(e) => {
                tracing::error!("Failed to generate JUnit XML: {}", e);
            }
        }
    }
}

/// `basic.manual.sleep` becomes (`basic.manual`, `sleep`).
fn split_test_name(full: &str) -> (&str, &str) {
    match full.rsplit_once('.') {
        Some((class, name)) if !class.is_empty() && !name.is_empty() => (class, name),
        _ => ("convoy", full),
    }
}

/// Drops characters XML 1.0 cannot carry. Escaping is left to the writer.
fn xml_chars(s: &str) -> String {
    s.chars()
        .filter(|c| matches!(c, '\t' | '\n' | '\r' | ' '..='\u{D7FF}' | '\u{E000}'..='\u{FFFD}'))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_split_test_name() {
        assert_eq!(split_test_name("basic.ssh"), ("basic", "ssh"));
        assert_eq!(split_test_name("basic.manual.sleep"), ("basic.manual", "sleep"));
        assert_eq!(split_test_name("plain"), ("convoy", "plain"));
        assert_eq!(split_test_name("trailing."), ("convoy", "trailing."));
    }

    #[test]
    fn test_xml_chars_strips_control_characters() {
        assert_eq!(xml_chars("a\u{1b}[31mb\n"), "a[31mb\n");
    }

    #[test]
    fn test_generate_xml() {
        let reporter = JUnitReporter::new(PathBuf::from("unused.xml"));
        let run = RunResult::from_results(
            vec![
                TestResult::new("basic.ssh", TestOutcome::Passed)
                    .with_duration(Duration::from_millis(1250)),
                TestResult::new("basic.native", TestOutcome::Failed)
                    .with_message("exit status <1>")
                    .with_output("    harness.rs: boom & bust\n"),
                TestResult::new("basic.manual.sleep", TestOutcome::Skipped),
            ],
            Duration::from_secs(2),
            PathBuf::from("_convoy_temp"),
        );

        let xml = reporter.generate_xml(&run).unwrap();
        assert!(xml.contains(r#"<testsuites tests="3" failures="1" errors="0" time="2.000">"#));
        assert!(xml.contains(r#"skipped="1""#));
        assert!(xml.contains(r#"<testcase classname="basic" name="ssh" time="1.250"/>"#));
        assert!(xml.contains(r#"message="exit status &lt;1&gt;""#));
        assert!(xml.contains("boom &amp; bust"));
        assert!(xml.contains("<skipped/>"));
    }

    #[tokio::test]
    async fn test_writes_file_on_run_complete() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/junit.xml");
        let reporter = JUnitReporter::new(path.clone()).with_testsuite_name("nightly");

        reporter.on_run_complete(&RunResult::default()).await;

        let xml = std::fs::read_to_string(path).unwrap();
        assert!(xml.starts_with("<?xml"));
        assert!(xml.contains(r#"name="nightly""#));
    }
}
