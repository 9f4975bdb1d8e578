//! Playwright Test adapter.
//!
//! Tests are `test()` blocks, identified by file and `line:title path`.
//! Discovery parses `playwright test --list --reporter=json` from stdout.
//! Execution points the JSON reporter at the result file through
//! `PLAYWRIGHT_JSON_OUTPUT_NAME` and selects tests with `file:line` filters.
//!
//! A spec runs once per configured project. Each project's test is mapped
//! on its own and the spec takes the worst of them, so a spec fails if any
//! project fails.
//!
//! | `expectedStatus` | Last result | Raw status |
//! |------------------|-------------|------------|
//! | `skipped` | any | `not-executed-skipped` |
//! | `failed` (`test.fail`) | `passed` | `ran-pending-passed` |
//! | `failed` (`test.fail`) | anything else | `ran-pending-failed` |
//! | `passed` | `passed` | `ran-passed` |
//! | `passed` | `skipped` | `not-executed-skipped` |
//! | `passed` | `failed`, `timedOut`, `interrupted` | `ran-failed` |

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::{FrameworkError, FrameworkResult, TestFramework, crash, render_command, run_discovery};
use crate::config::PlaywrightConfig;
use crate::model::{DiscoveredTest, Execution, FailureDetail, RawStatus, TestId};
use crate::provider::{Command, ExecResult, Launcher};

const OUTPUT_ENV: &str = "PLAYWRIGHT_JSON_OUTPUT_NAME";

#[derive(Debug, Deserialize)]
struct Report {
    #[serde(default)]
    suites: Vec<Suite>,
    #[serde(default)]
    errors: Vec<ReportError>,
}

#[derive(Debug, Deserialize)]
struct Suite {
    #[serde(default)]
    title: String,
    file: Option<String>,
    #[serde(default)]
    specs: Vec<Spec>,
    #[serde(default)]
    suites: Vec<Suite>,
}

#[derive(Debug, Deserialize)]
struct Spec {
    title: String,
    file: String,
    line: u32,
    #[serde(default)]
    tests: Vec<ProjectTest>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectTest {
    #[serde(default)]
    expected_status: String,
    #[serde(default)]
    project_name: String,
    #[serde(default)]
    results: Vec<TestRun>,
}

#[derive(Debug, Deserialize)]
struct TestRun {
    status: String,
    /// Milliseconds.
    #[serde(default)]
    duration: u64,
    error: Option<ReportError>,
}

#[derive(Debug, Deserialize)]
struct ReportError {
    message: Option<String>,
    location: Option<ErrorLocation>,
}

#[derive(Debug, Deserialize)]
struct ErrorLocation {
    file: String,
    line: u32,
}

/// A spec together with the describe titles that enclose it.
struct SpecEntry<'a> {
    spec: &'a Spec,
    titles: Vec<&'a str>,
}

impl SpecEntry<'_> {
    fn test_id(&self) -> TestId {
        let mut path = self.titles.clone();
        path.push(&self.spec.title);
        TestId::new(
            &self.spec.file,
            format!("{}:{}", self.spec.line, path.join(" > ")),
        )
    }

    fn display_name(&self) -> String {
        let mut path = self.titles.clone();
        path.push(&self.spec.title);
        path.join(" > ")
    }
}

fn collect_specs<'a>(suites: &'a [Suite], titles: &[&'a str], out: &mut Vec<SpecEntry<'a>>) {
    for suite in suites {
        // File-level suites are titled with the file name; leave it out of
        // the title path.
        let mut titles = titles.to_vec();
        if suite.file.as_deref() != Some(suite.title.as_str()) && !suite.title.is_empty() {
            titles.push(&suite.title);
        }
        for spec in &suite.specs {
            out.push(SpecEntry {
                spec,
                titles: titles.clone(),
            });
        }
        collect_specs(&suite.suites, &titles, out);
    }
}

fn parse_report(content: &str) -> FrameworkResult<Report> {
    // Some setups print banners before the JSON document.
    let start = content.find('{').unwrap_or(0);
    serde_json::from_str(&content[start..])
        .map_err(|e| FrameworkError::ParseError(format!("invalid Playwright JSON report: {}", e)))
}

/// Severity order used to combine projects: later wins.
fn rank(status: RawStatus) -> u8 {
    match status {
        RawStatus::NotExecutedSkipped => 0,
        RawStatus::NotExecutedPendingDeclared => 1,
        RawStatus::RanPassed => 2,
        RawStatus::RanPendingFailed => 3,
        RawStatus::RanPendingPassed => 4,
        RawStatus::RanFailed => 5,
    }
}

fn map_project(test: &ProjectTest) -> Option<(RawStatus, Duration, Option<FailureDetail>)> {
    if test.expected_status == "skipped" {
        return Some((RawStatus::NotExecutedSkipped, Duration::ZERO, None));
    }
    let last = test.results.last()?;
    let duration: Duration = test
        .results
        .iter()
        .map(|r| Duration::from_millis(r.duration))
        .sum();

    let detail = || {
        let error = last.error.as_ref();
        let mut detail = FailureDetail::new(
            error
                .and_then(|e| e.message.clone())
                .unwrap_or_else(|| format!("test {}", last.status)),
        );
        if let Some(loc) = error.and_then(|e| e.location.as_ref()) {
            detail = detail.with_location(format!("{}:{}", loc.file, loc.line));
        }
        if !test.project_name.is_empty() {
            detail.exception_class = Some(format!("[{}]", test.project_name));
        }
        detail
    };

    let mapped = match (test.expected_status.as_str(), last.status.as_str()) {
        (_, "skipped") => (RawStatus::NotExecutedSkipped, duration, None),
        ("failed", "passed") => (
            RawStatus::RanPendingPassed,
            duration,
            Some(FailureDetail::new("expected to fail, but passed")),
        ),
        ("failed", _) => (RawStatus::RanPendingFailed, duration, None),
        (_, "passed") => (RawStatus::RanPassed, duration, None),
        _ => (RawStatus::RanFailed, duration, Some(detail())),
    };
    Some(mapped)
}

/// Playwright Test adapter. See the module docs for the status mapping.
pub struct PlaywrightFramework {
    config: PlaywrightConfig,
}

impl PlaywrightFramework {
    pub fn new(config: PlaywrightConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl TestFramework for PlaywrightFramework {
    fn name(&self) -> &'static str {
        "playwright"
    }

    async fn discover(&self, launcher: &dyn Launcher) -> FrameworkResult<Vec<DiscoveredTest>> {
        let cmd = render_command(&self.config.discover_command, &[], None)?;
        let output = run_discovery(launcher, &cmd).await?;
        let report = parse_report(&output.stdout)
            .map_err(|e| FrameworkError::DiscoveryFailed(e.to_string()))?;

        let mut entries = Vec::new();
        collect_specs(&report.suites, &[], &mut entries);
        let tests = entries
            .iter()
            .map(|entry| {
                let test = DiscoveredTest::new(entry.test_id(), entry.display_name());
                let skipped = !entry.spec.tests.is_empty()
                    && entry
                        .spec
                        .tests
                        .iter()
                        .all(|t| t.expected_status == "skipped");
                if skipped { test.skip_declared() } else { test }
            })
            .collect();
        Ok(tests)
    }

    fn produce_test_execution_command(
        &self,
        tests: &[TestId],
        retry: bool,
    ) -> FrameworkResult<Command> {
        let template = match (&self.config.retry_command, retry) {
            (Some(retry_command), true) => retry_command,
            _ => &self.config.run_command,
        };
        let mut selectors: Vec<String> = Vec::with_capacity(tests.len());
        for id in tests {
            let line = id.scope.split(':').next().unwrap_or_default();
            let selector = if line.is_empty() {
                id.file.clone()
            } else {
                format!("{}:{}", id.file, line)
            };
            if !selectors.contains(&selector) {
                selectors.push(selector);
            }
        }
        let cmd = render_command(template, &selectors, Some(&self.config.result_path))?;
        Ok(cmd.env(
            OUTPUT_ENV,
            self.config.result_path.to_string_lossy().into_owned(),
        ))
    }

    fn result_path(&self) -> Option<&Path> {
        Some(&self.config.result_path)
    }

    fn parse_results(
        &self,
        _tests: &[TestId],
        output: &ExecResult,
        result_file: Option<&str>,
        _streamed: &[TestId],
    ) -> FrameworkResult<Vec<Execution>> {
        let Some(content) = result_file else {
            return Err(crash(output, "Playwright wrote no JSON report"));
        };
        let report = match parse_report(content) {
            Ok(report) => report,
            Err(e) => return Err(crash(output, &e.to_string())),
        };
        if report.suites.is_empty() && !report.errors.is_empty() {
            let message = report
                .errors
                .iter()
                .filter_map(|e| e.message.as_deref())
                .collect::<Vec<_>>()
                .join("\n");
            return Err(crash(output, &message));
        }

        let mut entries = Vec::new();
        collect_specs(&report.suites, &[], &mut entries);

        let mut executions = Vec::new();
        for entry in &entries {
            let mut combined: Option<(RawStatus, Duration, Option<FailureDetail>)> = None;
            for test in &entry.spec.tests {
                let Some((status, duration, failure)) = map_project(test) else {
                    continue;
                };
                combined = Some(match combined {
                    None => (status, duration, failure),
                    Some((prev, total, prev_failure)) => {
                        if rank(status) > rank(prev) {
                            (status, total + duration, failure)
                        } else {
                            (prev, total + duration, prev_failure)
                        }
                    }
                });
            }
            // Specs outside the requested subset appear without results.
            let Some((status, duration, failure)) = combined else {
                continue;
            };
            let mut execution = Execution::new(entry.test_id(), status).with_duration(duration);
            if let Some(failure) = failure {
                execution = execution.with_failure(failure);
            }
            executions.push(execution);
        }
        Ok(executions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedLauncher, ScriptedRun};

    const REPORT: &str = r#"{
      "config": {},
      "suites": [{
        "title": "login.spec.ts", "file": "login.spec.ts", "line": 0, "column": 0,
        "specs": [
          {"title": "shows form", "file": "login.spec.ts", "line": 3, "tests": [
            {"expectedStatus": "passed", "projectName": "chromium", "results": [{"status": "passed", "duration": 120}]},
            {"expectedStatus": "passed", "projectName": "firefox", "results": [
              {"status": "failed", "duration": 80, "error": {"message": "Timeout", "location": {"file": "login.spec.ts", "line": 5}}}
            ]}
          ]},
          {"title": "later", "file": "login.spec.ts", "line": 9, "tests": [
            {"expectedStatus": "skipped", "projectName": "chromium", "results": []}
          ]}
        ],
        "suites": [{
          "title": "known bugs", "file": "login.spec.ts", "line": 12,
          "specs": [
            {"title": "still broken", "file": "login.spec.ts", "line": 13, "tests": [
              {"expectedStatus": "failed", "projectName": "chromium", "results": [{"status": "failed", "duration": 10}]}
            ]},
            {"title": "now fixed", "file": "login.spec.ts", "line": 17, "tests": [
              {"expectedStatus": "failed", "projectName": "chromium", "results": [{"status": "passed", "duration": 10}]}
            ]}
          ]
        }]
      }],
      "errors": []
    }"#;

    fn framework() -> PlaywrightFramework {
        PlaywrightFramework::new(PlaywrightConfig::default())
    }

    #[test]
    fn test_status_mapping_across_projects() {
        let execs = framework()
            .parse_results(&[], &ExecResult::default(), Some(REPORT), &[])
            .unwrap();
        assert_eq!(execs.len(), 4);

        assert_eq!(execs[0].id, TestId::new("login.spec.ts", "3:shows form"));
        assert_eq!(execs[0].status, RawStatus::RanFailed);
        assert_eq!(execs[0].duration, Duration::from_millis(200));
        let failure = execs[0].failure.as_ref().unwrap();
        assert_eq!(failure.message, "Timeout");
        assert_eq!(failure.location.as_deref(), Some("login.spec.ts:5"));

        assert_eq!(execs[1].status, RawStatus::NotExecutedSkipped);

        assert_eq!(
            execs[2].id,
            TestId::new("login.spec.ts", "13:known bugs > still broken")
        );
        assert_eq!(execs[2].status, RawStatus::RanPendingFailed);
        assert_eq!(execs[3].status, RawStatus::RanPendingPassed);
    }

    #[test]
    fn test_command_sets_output_env_and_dedupes_lines() {
        let cmd = framework()
            .produce_test_execution_command(
                &[
                    TestId::new("a.spec.ts", "3:x"),
                    TestId::new("a.spec.ts", "3:x [row 2]"),
                    TestId::new("b.spec.ts", "7:y"),
                ],
                false,
            )
            .unwrap();
        assert_eq!(
            cmd.args,
            vec!["playwright", "test", "--reporter=json", "a.spec.ts:3", "b.spec.ts:7"]
        );
        assert!(
            cmd.env
                .iter()
                .any(|(k, v)| k == OUTPUT_ENV && v == "tmp/verdict-playwright.json")
        );
    }

    #[test]
    fn test_global_error_is_crash() {
        let report = r#"{"suites": [], "errors": [{"message": "Error: Cannot find module"}]}"#;
        let output = ExecResult {
            exit_code: 1,
            ..Default::default()
        };
        let err = framework()
            .parse_results(&[], &output, Some(report), &[])
            .unwrap_err();
        assert!(matches!(err, FrameworkError::AdapterCrash { .. }));
    }

    #[tokio::test]
    async fn test_discover_from_list_output() {
        let launcher = ScriptedLauncher::new();
        launcher.on_command("--list", |_| ScriptedRun::exit(0).stdout(REPORT));

        let tests = framework().discover(&launcher).await.unwrap();
        assert_eq!(tests.len(), 4);
        assert_eq!(tests[0].name, "shows form");
        assert!(tests[1].skip_declared);
        assert_eq!(tests[2].name, "known bugs > still broken");
    }
}
