//! Generic adapter for frameworks driven by custom commands.
//!
//! # Discovery Protocol
//!
//! `discover_command` prints one test id per line, in `file::scope` form:
//!
//! ```text
//! pkg/server::TestHandshake
//! pkg/server::TestTimeout
//! # comments and blank lines are ignored
//! ```
//!
//! Commands are split into argv, not run through a shell. Wrap them in
//! `sh -c '...'` to use pipes or redirects.
//!
//! # Result Sources
//!
//! 1. **Result file** (`result_file`): JUnit XML or a Test Engine JSON
//!    array, per `result_format`. Per-test statuses, durations and failure
//!    messages come from here.
//! 2. **Exit code**: without a result file, every requested test passed on
//!    exit 0 and failed otherwise. Flaky detection still works per batch,
//!    but a failing batch marks every test in it as failed.

use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;

use super::junit::parse_junit_xml;
use super::{FrameworkError, FrameworkResult, TestFramework, crash, render_command, run_discovery};
use crate::config::{GenericConfig, ResultFormat};
use crate::model::{DiscoveredTest, Execution, FailureDetail, RawStatus, TestId};
use crate::provider::{Command, ExecResult, Launcher};

/// Exit codes above this mean the process was killed by a signal.
const SIGNAL_EXIT_BASE: i32 = 128;

/// One entry of a Test Engine JSON report.
#[derive(Debug, Deserialize)]
struct EngineEntry {
    id: Option<String>,
    name: Option<String>,
    #[serde(default)]
    scope: String,
    location: Option<String>,
    file_name: Option<String>,
    result: String,
    failure_reason: Option<String>,
}

impl EngineEntry {
    fn test_id(&self) -> Option<TestId> {
        match &self.file_name {
            Some(file) if !file.is_empty() => Some(TestId::new(file, &self.scope)),
            _ => self.id.as_deref().and_then(|id| id.parse().ok()),
        }
    }

    fn into_execution(self) -> Option<Execution> {
        let Some(id) = self.test_id() else {
            tracing::debug!(
                "Ignoring Test Engine entry without a usable id: {:?}",
                self.name
            );
            return None;
        };
        let status = match self.result.as_str() {
            "passed" => RawStatus::RanPassed,
            "skipped" => RawStatus::NotExecutedSkipped,
            "pending" => RawStatus::NotExecutedPendingDeclared,
            _ => RawStatus::RanFailed,
        };
        let mut execution = Execution::new(id, status);
        if status == RawStatus::RanFailed {
            let mut detail = FailureDetail::new(
                self.failure_reason
                    .unwrap_or_else(|| format!("result: {}", self.result)),
            );
            if let Some(location) = self.location {
                detail = detail.with_location(location);
            }
            execution = execution.with_failure(detail);
        }
        Some(execution)
    }
}

fn parse_test_engine_json(content: &str) -> FrameworkResult<Vec<Execution>> {
    let entries: Vec<EngineEntry> = serde_json::from_str(content)
        .map_err(|e| FrameworkError::ParseError(format!("invalid Test Engine JSON: {}", e)))?;
    Ok(entries
        .into_iter()
        .filter_map(EngineEntry::into_execution)
        .collect())
}

/// Test framework using custom commands.
pub struct GenericFramework {
    config: GenericConfig,
}

impl GenericFramework {
    pub fn new(config: GenericConfig) -> Self {
        Self { config }
    }

    /// Parse discovery output, one id per line.
    fn parse_discover_output(&self, output: &str) -> Vec<DiscoveredTest> {
        output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| match line.parse::<TestId>() {
                Ok(id) => Some(DiscoveredTest::new(id, line)),
                Err(e) => {
                    tracing::warn!("Skipping discovery line: {}", e);
                    None
                }
            })
            .collect()
    }
}

#[async_trait]
impl TestFramework for GenericFramework {
    fn name(&self) -> &'static str {
        "generic"
    }

    async fn discover(&self, launcher: &dyn Launcher) -> FrameworkResult<Vec<DiscoveredTest>> {
        let cmd = render_command(&self.config.discover_command, &[], None)?;
        let output = run_discovery(launcher, &cmd).await?;

        tracing::debug!("Discovery stdout:\n{}", output.stdout);
        let tests = self.parse_discover_output(&output.stdout);

        if tests.is_empty() {
            tracing::warn!(
                "No tests discovered. stdout: {}, stderr: {}",
                output.stdout,
                output.stderr
            );
        }

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
        let selectors: Vec<String> = tests.iter().map(ToString::to_string).collect();
        render_command(template, &selectors, self.config.result_file.as_deref())
    }

    fn result_path(&self) -> Option<&Path> {
        self.config.result_file.as_deref()
    }

    fn parse_results(
        &self,
        tests: &[TestId],
        output: &ExecResult,
        result_file: Option<&str>,
        _streamed: &[TestId],
    ) -> FrameworkResult<Vec<Execution>> {
        if let Some(content) = result_file {
            let parsed = match self.config.result_format {
                ResultFormat::Junit => parse_junit_xml(content, self.config.junit_format),
                ResultFormat::TestEngine => parse_test_engine_json(content),
            };
            return parsed.map_err(|e| crash(output, &e.to_string()));
        }

        if self.config.result_file.is_some() {
            return Err(crash(output, "no result file written"));
        }
        if output.exit_code > SIGNAL_EXIT_BASE {
            return Err(crash(output, "test command was killed"));
        }

        tracing::warn!(
            "No result file configured, inferring {} result(s) from exit code {}",
            tests.len(),
            output.exit_code
        );

        let duration = output.duration / tests.len().max(1) as u32;
        Ok(tests
            .iter()
            .map(|id| {
                let execution = if output.success() {
                    Execution::new(id.clone(), RawStatus::RanPassed)
                } else {
                    Execution::new(id.clone(), RawStatus::RanFailed).with_failure(
                        FailureDetail::new(format!("Exit code: {}", output.exit_code)),
                    )
                };
                execution.with_duration(duration)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use super::*;
    use crate::framework::junit::JunitFormat;
    use crate::testing::{ScriptedLauncher, ScriptedRun};

    fn config() -> GenericConfig {
        GenericConfig {
            discover_command: "./list-tests.sh".into(),
            run_command: "./run-tests.sh {tests}".into(),
            retry_command: None,
            result_file: None,
            result_format: ResultFormat::Junit,
            junit_format: JunitFormat::Default,
        }
    }

    #[tokio::test]
    async fn test_discover_skips_comments_and_bad_lines() {
        let launcher = ScriptedLauncher::new();
        launcher.on_command("list-tests", |_| {
            ScriptedRun::exit(0).stdout("# header\nsuite/a::one\n\n  suite/b::two  \n::broken\n")
        });

        let tests = GenericFramework::new(config())
            .discover(&launcher)
            .await
            .unwrap();
        let ids: Vec<String> = tests.iter().map(|t| t.id.to_string()).collect();
        assert_eq!(ids, vec!["suite/a::one", "suite/b::two"]);
    }

    #[tokio::test]
    async fn test_discover_failure() {
        let launcher = ScriptedLauncher::new();
        launcher.on_command("list-tests", |_| ScriptedRun::exit(2));
        let err = GenericFramework::new(config())
            .discover(&launcher)
            .await
            .unwrap_err();
        assert!(matches!(err, FrameworkError::DiscoveryFailed(_)));
    }

    #[test]
    fn test_exit_code_fallback_marks_every_test() {
        let tests = vec![TestId::new("a", "1"), TestId::new("b", "2")];
        let output = ExecResult {
            exit_code: 1,
            duration: Duration::from_secs(4),
            ..Default::default()
        };
        let execs = GenericFramework::new(config())
            .parse_results(&tests, &output, None, &[])
            .unwrap();
        assert_eq!(execs.len(), 2);
        assert!(execs.iter().all(|e| e.status == RawStatus::RanFailed));
        assert_eq!(execs[0].duration, Duration::from_secs(2));
    }

    #[test]
    fn test_signal_exit_is_crash() {
        let output = ExecResult {
            exit_code: 137,
            ..Default::default()
        };
        let err = GenericFramework::new(config())
            .parse_results(&[TestId::new("a", "1")], &output, None, &[])
            .unwrap_err();
        assert!(matches!(err, FrameworkError::AdapterCrash { exit_code: 137, .. }));
    }

    #[test]
    fn test_missing_configured_result_file_is_crash() {
        let framework = GenericFramework::new(GenericConfig {
            result_file: Some(PathBuf::from("junit.xml")),
            ..config()
        });
        let err = framework
            .parse_results(&[TestId::new("a", "1")], &ExecResult::default(), None, &[])
            .unwrap_err();
        assert!(matches!(err, FrameworkError::AdapterCrash { .. }));
    }

    #[test]
    fn test_test_engine_json() {
        let framework = GenericFramework::new(GenericConfig {
            result_file: Some(PathBuf::from("results.json")),
            result_format: ResultFormat::TestEngine,
            ..config()
        });
        let report = r#"[
          {"id": "x", "name": "adds", "scope": "Math adds", "location": "spec/math.js:3",
           "file_name": "spec/math.js", "result": "passed"},
          {"id": "y", "name": "divides", "scope": "Math divides", "location": "spec/math.js:9",
           "file_name": "spec/math.js", "result": "failed", "failure_reason": "division by zero"},
          {"id": "spec/todo.js::later", "name": "later", "result": "pending"}
        ]"#;
        let execs = framework
            .parse_results(&[], &ExecResult::default(), Some(report), &[])
            .unwrap();

        assert_eq!(execs.len(), 3);
        assert_eq!(execs[0].id, TestId::new("spec/math.js", "Math adds"));
        assert_eq!(execs[0].status, RawStatus::RanPassed);
        let failure = execs[1].failure.as_ref().unwrap();
        assert_eq!(failure.message, "division by zero");
        assert_eq!(failure.location.as_deref(), Some("spec/math.js:9"));
        assert_eq!(execs[2].id, TestId::new("spec/todo.js", "later"));
        assert_eq!(execs[2].status, RawStatus::NotExecutedPendingDeclared);
    }

    #[test]
    fn test_command_uses_result_file_and_retry_template() {
        let framework = GenericFramework::new(GenericConfig {
            run_command: "./run.sh --junit {result_path} {tests}".into(),
            retry_command: Some("./run.sh --retry {tests}".into()),
            result_file: Some(PathBuf::from("out/junit.xml")),
            ..config()
        });
        let ids = [TestId::new("a", "1")];

        let cmd = framework.produce_test_execution_command(&ids, false).unwrap();
        assert_eq!(cmd.args, vec!["--junit", "out/junit.xml", "a::1"]);

        let cmd = framework.produce_test_execution_command(&ids, true).unwrap();
        assert_eq!(cmd.args, vec!["--retry", "a::1"]);
    }
}
