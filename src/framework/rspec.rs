//! RSpec adapter.
//!
//! Tests are individual examples, addressed by RSpec's own example ids
//! (`./spec/models/user_spec.rb[1:2:1]`). Discovery runs the suite with
//! `--dry-run` and the JSON formatter, which lists every example without
//! running any of them. Execution passes the example ids back to RSpec and
//! reads the JSON formatter's report.
//!
//! # Status Mapping
//!
//! | RSpec `status` | Detail | Raw status |
//! |----------------|--------|------------|
//! | `passed` | | `ran-passed` |
//! | `failed` | `PendingExampleFixedError` | `ran-pending-passed` |
//! | `failed` | any other exception | `ran-failed` |
//! | `pending` | message `Temporarily skipped...` (`xit`, `skip`) | `not-executed-skipped` |
//! | `pending` | message `Not yet implemented` (no body) | `not-executed-pending-declared` |
//! | `pending` | any other message (`pending` with a body) | `ran-pending-failed` |

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;

use super::{
    FrameworkError, FrameworkResult, TestFramework, crash, render_command, run_discovery,
    scratch_path, take_discovery_report,
};
use crate::config::RspecConfig;
use crate::model::{DiscoveredTest, Execution, FailureDetail, FailureReason, RawStatus, TestId};
use crate::provider::{Command, ExecResult, Launcher};

const PENDING_FIXED_ERROR: &str = "RSpec::Core::Pending::PendingExampleFixedError";
const SKIPPED_PREFIX: &str = "Temporarily skipped";
const NOT_IMPLEMENTED: &str = "Not yet implemented";

/// Matches `path[1:2:3]` example ids.
fn example_id_regex() -> FrameworkResult<Regex> {
    Regex::new(r"^(.*)\[([\d:]+)\]$")
        .map_err(|e| FrameworkError::ParseError(format!("Invalid regex pattern: {}", e)))
}

/// Report written by `--format json`.
#[derive(Debug, Deserialize)]
struct RspecReport {
    #[serde(default)]
    examples: Vec<RspecExample>,
    #[serde(default)]
    summary: RspecSummary,
}

#[derive(Debug, Default, Deserialize)]
struct RspecSummary {
    #[serde(default)]
    errors_outside_of_examples_count: u32,
}

#[derive(Debug, Deserialize)]
struct RspecExample {
    id: String,
    #[serde(default)]
    full_description: String,
    status: String,
    file_path: String,
    #[serde(default)]
    line_number: u32,
    #[serde(default)]
    run_time: f64,
    pending_message: Option<String>,
    exception: Option<RspecException>,
}

#[derive(Debug, Deserialize)]
struct RspecException {
    class: String,
    #[serde(default)]
    message: String,
}

impl RspecExample {
    fn test_id(&self, example_id: &Regex) -> TestId {
        match example_id.captures(&self.id) {
            Some(caps) => TestId::new(&caps[1], &caps[2]),
            None => TestId::new(&self.file_path, self.line_number.to_string()),
        }
    }

    fn location(&self) -> String {
        format!("{}:{}", self.file_path, self.line_number)
    }

    fn to_execution(&self, example_id: &Regex) -> Execution {
        let id = self.test_id(example_id);
        let duration = Duration::try_from_secs_f64(self.run_time).unwrap_or(Duration::ZERO);
        let pending_message = self.pending_message.as_deref().unwrap_or("");

        let execution = match self.status.as_str() {
            "passed" => Execution::new(id, RawStatus::RanPassed),
            "failed" => {
                let (class, message) = self
                    .exception
                    .as_ref()
                    .map(|e| (e.class.as_str(), e.message.as_str()))
                    .unwrap_or(("", ""));
                let mut detail = FailureDetail::new(message).with_location(self.location());
                if !class.is_empty() {
                    detail = detail.with_exception_class(class);
                }
                if class == PENDING_FIXED_ERROR {
                    Execution::new(id, RawStatus::RanPendingPassed)
                        .with_failure(detail.with_reason(FailureReason::PendingFixed))
                } else {
                    Execution::new(id, RawStatus::RanFailed).with_failure(detail)
                }
            }
            "pending" if pending_message.starts_with(SKIPPED_PREFIX) => {
                Execution::new(id, RawStatus::NotExecutedSkipped)
            }
            "pending" if pending_message.starts_with(NOT_IMPLEMENTED) => {
                Execution::new(id, RawStatus::NotExecutedPendingDeclared)
            }
            "pending" => Execution::new(id, RawStatus::RanPendingFailed),
            other => {
                tracing::debug!("Unknown RSpec status {:?} for {}", other, self.id);
                Execution::new(id, RawStatus::RanFailed).with_failure(
                    FailureDetail::new(format!("unknown RSpec status: {}", other))
                        .with_location(self.location()),
                )
            }
        };
        execution.with_duration(duration)
    }
}

fn parse_report(content: &str) -> FrameworkResult<RspecReport> {
    serde_json::from_str(content)
        .map_err(|e| FrameworkError::ParseError(format!("invalid RSpec JSON report: {}", e)))
}

/// The selector RSpec accepts on the command line.
fn selector(id: &TestId) -> String {
    if id.scope.is_empty() {
        id.file.clone()
    } else {
        format!("{}[{}]", id.file, id.scope)
    }
}

/// RSpec adapter. See the module docs for the status mapping.
pub struct RspecFramework {
    config: RspecConfig,
}

impl RspecFramework {
    pub fn new(config: RspecConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl TestFramework for RspecFramework {
    fn name(&self) -> &'static str {
        "rspec"
    }

    async fn discover(&self, launcher: &dyn Launcher) -> FrameworkResult<Vec<DiscoveredTest>> {
        let report_path = scratch_path("verdict-rspec-dry-run");
        let cmd = render_command(&self.config.discover_command, &[], Some(&report_path))?;
        run_discovery(launcher, &cmd).await?;

        let report = parse_report(&take_discovery_report(launcher, &report_path).await?)?;
        let example_id = example_id_regex()?;
        let tests = report
            .examples
            .iter()
            .map(|example| {
                let test = DiscoveredTest::new(example.test_id(&example_id), &example.full_description);
                let skipped = example.status == "pending"
                    && example
                        .pending_message
                        .as_deref()
                        .is_some_and(|m| m.starts_with(SKIPPED_PREFIX));
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
        let selectors: Vec<String> = tests.iter().map(selector).collect();
        render_command(template, &selectors, Some(&self.config.result_path))
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
            return Err(crash(output, "RSpec wrote no JSON report"));
        };
        let report = match parse_report(content) {
            Ok(report) => report,
            Err(e) => return Err(crash(output, &e.to_string())),
        };
        if report.examples.is_empty() && report.summary.errors_outside_of_examples_count > 0 {
            return Err(crash(output, "RSpec failed to load the suite"));
        }
        let example_id = example_id_regex()?;
        Ok(report
            .examples
            .iter()
            .map(|example| example.to_execution(&example_id))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedLauncher;

    const REPORT: &str = r#"{
      "version": "3.13.0",
      "examples": [
        {"id": "./spec/a_spec.rb[1:1]", "description": "adds", "full_description": "Math adds",
         "status": "passed", "file_path": "./spec/a_spec.rb", "line_number": 2, "run_time": 0.5,
         "pending_message": null},
        {"id": "./spec/a_spec.rb[1:2]", "description": "subtracts", "full_description": "Math subtracts",
         "status": "failed", "file_path": "./spec/a_spec.rb", "line_number": 5, "run_time": 0.1,
         "pending_message": null,
         "exception": {"class": "RSpec::Expectations::ExpectationNotMetError", "message": "expected 1", "backtrace": []}},
        {"id": "./spec/a_spec.rb[1:3]", "description": "later", "full_description": "Math later",
         "status": "pending", "file_path": "./spec/a_spec.rb", "line_number": 8, "run_time": 0.0,
         "pending_message": "Temporarily skipped with xit"},
        {"id": "./spec/a_spec.rb[1:4]", "description": "todo", "full_description": "Math todo",
         "status": "pending", "file_path": "./spec/a_spec.rb", "line_number": 9, "run_time": 0.0,
         "pending_message": "Not yet implemented"},
        {"id": "./spec/a_spec.rb[1:5]", "description": "known bug", "full_description": "Math known bug",
         "status": "pending", "file_path": "./spec/a_spec.rb", "line_number": 10, "run_time": 0.2,
         "pending_message": "bug #12"},
        {"id": "./spec/a_spec.rb[1:6]", "description": "fixed bug", "full_description": "Math fixed bug",
         "status": "failed", "file_path": "./spec/a_spec.rb", "line_number": 14, "run_time": 0.2,
         "pending_message": "bug #13",
         "exception": {"class": "RSpec::Core::Pending::PendingExampleFixedError", "message": "Expected pending 'bug #13' to fail. No error was raised.", "backtrace": []}}
      ],
      "summary": {"example_count": 6, "failure_count": 2, "pending_count": 3, "errors_outside_of_examples_count": 0}
    }"#;

    fn framework() -> RspecFramework {
        RspecFramework::new(RspecConfig::default())
    }

    #[test]
    fn test_example_id_splits_into_file_and_scope() {
        let report = parse_report(REPORT).unwrap();
        assert_eq!(
            report.examples[0].test_id(&example_id_regex().unwrap()),
            TestId::new("./spec/a_spec.rb", "1:1")
        );
    }

    #[test]
    fn test_status_mapping() {
        let execs = framework()
            .parse_results(&[], &ExecResult::default(), Some(REPORT), &[])
            .unwrap();
        let statuses: Vec<RawStatus> = execs.iter().map(|e| e.status).collect();
        assert_eq!(
            statuses,
            vec![
                RawStatus::RanPassed,
                RawStatus::RanFailed,
                RawStatus::NotExecutedSkipped,
                RawStatus::NotExecutedPendingDeclared,
                RawStatus::RanPendingFailed,
                RawStatus::RanPendingPassed,
            ]
        );

        let failure = execs[1].failure.as_ref().unwrap();
        assert_eq!(failure.message, "expected 1");
        assert_eq!(failure.location.as_deref(), Some("./spec/a_spec.rb:5"));
        assert_eq!(execs[0].duration, Duration::from_millis(500));
    }

    #[test]
    fn test_missing_report_is_crash() {
        let output = ExecResult {
            exit_code: 137,
            ..Default::default()
        };
        let err = framework()
            .parse_results(&[], &output, None, &[])
            .unwrap_err();
        assert!(matches!(err, FrameworkError::AdapterCrash { exit_code: 137, .. }));
    }

    #[test]
    fn test_load_error_is_crash() {
        let report = r#"{"examples": [], "summary": {"errors_outside_of_examples_count": 1}}"#;
        let output = ExecResult {
            exit_code: 1,
            ..Default::default()
        };
        assert!(framework()
            .parse_results(&[], &output, Some(report), &[])
            .is_err());
    }

    #[test]
    fn test_command_uses_example_selectors() {
        let cmd = framework()
            .produce_test_execution_command(&[TestId::new("./spec/a_spec.rb", "1:2")], false)
            .unwrap();
        assert_eq!(cmd.program, "bundle");
        assert!(cmd.args.contains(&"./spec/a_spec.rb[1:2]".to_string()));
        assert!(cmd.args.contains(&"tmp/verdict-rspec.json".to_string()));
    }

    #[test]
    fn test_retry_command_used_on_retry() {
        let fw = RspecFramework::new(RspecConfig {
            retry_command: Some("bin/rspec-retry --out {result_path} {tests}".into()),
            ..Default::default()
        });
        let ids = [TestId::new("./spec/a_spec.rb", "1")];
        assert_eq!(fw.produce_test_execution_command(&ids, false).unwrap().program, "bundle");
        assert_eq!(
            fw.produce_test_execution_command(&ids, true).unwrap().program,
            "bin/rspec-retry"
        );
    }

    #[tokio::test]
    async fn test_discover_reads_dry_run_report() {
        let launcher = ScriptedLauncher::new();
        launcher.on_command("--dry-run", |cmd| {
            let out = cmd
                .args
                .iter()
                .skip_while(|a| *a != "--out")
                .nth(1)
                .cloned()
                .unwrap();
            (0, vec![(out, REPORT.to_string())])
        });

        let tests = framework().discover(&launcher).await.unwrap();
        assert_eq!(tests.len(), 6);
        assert_eq!(tests[0].name, "Math adds");
        assert!(!tests[0].skip_declared);
        assert!(tests[2].skip_declared);
        assert!(!tests[4].skip_declared);
    }

    #[tokio::test]
    async fn test_discover_failure() {
        let launcher = ScriptedLauncher::new();
        launcher.on_command("--dry-run", |_| (1, vec![]));
        let err = framework().discover(&launcher).await.unwrap_err();
        assert!(matches!(err, FrameworkError::DiscoveryFailed(_)));
    }
}
