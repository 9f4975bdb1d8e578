//! JUnit XML report generation.
//!
//! Writes the final verdicts in the JUnit format CI systems understand. Each
//! configured group becomes one `<testsuite>`; every test is one
//! `<testcase>` whose `classname` is the test's file and whose `name` is
//! its scope.
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <testsuites tests="3" failures="1" skipped="1" time="4.200">
//!   <testsuite name="unit" tests="3" failures="1" errors="0" skipped="1" time="4.200">
//!     <testcase classname="spec/a_spec.rb" name="1:1" time="0.100"/>
//!     <testcase classname="spec/a_spec.rb" name="1:2" time="3.000">
//!       <failure message="expected 2, got 3" type="assertion">spec/a_spec.rb:9</failure>
//!     </testcase>
//!     <testcase classname="spec/b_spec.rb" name="1" time="0.000">
//!       <skipped message="pending"/>
//!     </testcase>
//!   </testsuite>
//! </testsuites>
//! ```
//!
//! Flaky tests are written as passing cases with a `<system-out>` note, so
//! they stay visible without failing the CI job. Pending tests are skipped
//! cases; unexpectedly passing ones are failures of type `pending_fixed`.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

use super::Reporter;
use crate::model::{Attempt, ClassifiedResult, DiscoveredTest, Outcome, TestId};
use crate::orchestrator::RunReport;

/// Reporter that writes a JUnit XML file when the run completes.
///
/// The file is created or overwritten; parent directories are created as
/// needed.
pub struct JUnitReporter {
    output_path: PathBuf,
}

impl JUnitReporter {
    pub fn new(output_path: PathBuf) -> Self {
        Self { output_path }
    }

    /// Generate JUnit XML content from a run report.
    pub fn generate_xml(report: &RunReport) -> anyhow::Result<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        let mut groups: BTreeMap<&str, Vec<&ClassifiedResult>> = BTreeMap::new();
        for result in &report.results {
            groups.entry(result.group.as_str()).or_default().push(result);
        }

        let totals = Totals::of(report.results.iter());
        let mut testsuites = BytesStart::new("testsuites");
        testsuites.push_attribute(("tests", totals.tests.to_string().as_str()));
        testsuites.push_attribute(("failures", totals.failures.to_string().as_str()));
        testsuites.push_attribute(("skipped", totals.skipped.to_string().as_str()));
        testsuites.push_attribute(("time", format!("{:.3}", totals.time).as_str()));
        writer.write_event(Event::Start(testsuites))?;

        for (group, results) in groups {
            let totals = Totals::of(results.iter().copied());
            let mut testsuite = BytesStart::new("testsuite");
            testsuite.push_attribute(("name", group));
            testsuite.push_attribute(("tests", totals.tests.to_string().as_str()));
            testsuite.push_attribute(("failures", totals.failures.to_string().as_str()));
            testsuite.push_attribute(("errors", "0"));
            testsuite.push_attribute(("skipped", totals.skipped.to_string().as_str()));
            testsuite.push_attribute(("time", format!("{:.3}", totals.time).as_str()));
            writer.write_event(Event::Start(testsuite))?;

            for result in results {
                write_testcase(&mut writer, result)?;
            }

            writer.write_event(Event::End(BytesEnd::new("testsuite")))?;
        }

        writer.write_event(Event::End(BytesEnd::new("testsuites")))?;

        let xml = String::from_utf8(writer.into_inner())?;
        Ok(xml)
    }
}

struct Totals {
    tests: usize,
    failures: usize,
    skipped: usize,
    time: f64,
}

impl Totals {
    fn of<'a>(results: impl Iterator<Item = &'a ClassifiedResult>) -> Self {
        let mut totals = Totals {
            tests: 0,
            failures: 0,
            skipped: 0,
            time: 0.0,
        };
        for result in results {
            totals.tests += 1;
            totals.time += result.total_duration().as_secs_f64();
            if result.counts_as_failure() {
                totals.failures += 1;
            } else if matches!(result.outcome, Outcome::Skipped | Outcome::Pending) {
                totals.skipped += 1;
            }
        }
        totals
    }
}

/// Write a single test case element.
fn write_testcase<W: std::io::Write>(
    writer: &mut Writer<W>,
    result: &ClassifiedResult,
) -> anyhow::Result<()> {
    let mut testcase = BytesStart::new("testcase");
    testcase.push_attribute(("classname", clean(&result.id.file).as_str()));
    testcase.push_attribute(("name", clean(testcase_name(result)).as_str()));
    testcase.push_attribute((
        "time",
        format!("{:.3}", result.total_duration().as_secs_f64()).as_str(),
    ));

    let last = result.last_attempt();
    match result.outcome {
        Outcome::Passed => {
            writer.write_event(Event::Empty(testcase))?;
        }
        Outcome::Flaky => {
            writer.write_event(Event::Start(testcase))?;
            let note = format!("flaky: passed on attempt {}", result.attempts.len());
            writer.write_event(Event::Start(BytesStart::new("system-out")))?;
            writer.write_event(Event::Text(BytesText::new(&note)))?;
            writer.write_event(Event::End(BytesEnd::new("system-out")))?;
            writer.write_event(Event::End(BytesEnd::new("testcase")))?;
        }
        Outcome::Skipped | Outcome::Pending => {
            writer.write_event(Event::Start(testcase))?;
            let mut skipped = BytesStart::new("skipped");
            skipped.push_attribute(("message", result.outcome.as_str()));
            writer.write_event(Event::Empty(skipped))?;
            writer.write_event(Event::End(BytesEnd::new("testcase")))?;
        }
        Outcome::Failed | Outcome::UnexpectedlyPassed => {
            writer.write_event(Event::Start(testcase))?;

            let detail = last.and_then(|a| a.failure.as_ref());
            let mut failure = BytesStart::new("failure");
            if let Some(detail) = detail {
                failure.push_attribute(("message", clean(&detail.message).as_str()));
            }
            let kind = result
                .failure_reason
                .map(|r| r.as_str())
                .unwrap_or(result.outcome.as_str());
            failure.push_attribute(("type", kind));
            writer.write_event(Event::Start(failure))?;

            let body = failure_body(result, last);
            if !body.is_empty() {
                writer.write_event(Event::Text(BytesText::new(&clean(&body))))?;
            }

            writer.write_event(Event::End(BytesEnd::new("failure")))?;
            writer.write_event(Event::End(BytesEnd::new("testcase")))?;
        }
    }

    Ok(())
}

fn testcase_name(result: &ClassifiedResult) -> &str {
    if result.id.scope.is_empty() {
        &result.name
    } else {
        &result.id.scope
    }
}

fn failure_body(result: &ClassifiedResult, last: Option<&Attempt>) -> String {
    let mut lines = Vec::new();
    if let Some(detail) = last.and_then(|a| a.failure.as_ref()) {
        if let Some(class) = &detail.exception_class {
            lines.push(class.clone());
        }
        if let Some(location) = &detail.location {
            lines.push(location.clone());
        }
    }
    if result.muted {
        lines.push("muted".to_string());
    }
    if result.attempts.len() > 1 {
        lines.push(format!("failed {} attempt(s)", result.attempts.len()));
    }
    lines.join("\n")
}

/// Drops characters that are not allowed in XML 1.0. Escaping is left to
/// quick-xml.
fn clean(s: &str) -> String {
    s.chars()
        .filter(|c| matches!(c, '\t' | '\n' | '\r' | ' '..='\u{D7FF}' | '\u{E000}'..='\u{FFFD}'))
        .collect()
}

#[async_trait]
impl Reporter for JUnitReporter {
    async fn on_discovery_complete(&self, _tests: &[DiscoveredTest]) {}

    async fn on_attempt(&self, _group: &str, _id: &TestId, _attempt: &Attempt) {}

    async fn on_test_complete(&self, _result: &ClassifiedResult) {}

    async fn on_run_complete(&self, report: &RunReport) {
        match Self::generate_xml(report) {
            Ok(xml) => {
                if let Some(parent) = self.output_path.parent()
                    && !parent.as_os_str().is_empty()
                    && !parent.exists()
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
