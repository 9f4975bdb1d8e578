//! Cucumber adapter.
//!
//! Tests are scenarios (each row of a scenario outline is its own
//! scenario), identified by feature path and line. Discovery and execution
//! both read the JSON formatter's report.
//!
//! A scenario's status is derived by folding over its steps in order. The
//! fold is a small state machine: once a step fails, signals a skip or
//! signals pending, every later step is recorded as not executed.
//!
//! ```text
//!            passed
//!          ┌────────┐
//!          ▼        │
//!       Running ────┘──── failed / undefined ───► Failed
//!          │  │
//!          │  └────────── pending ──────────────► Pending
//!          │
//!          └───────────── skipped ──────────────► Skipped
//! ```
//!
//! | Fold result | Raw status |
//! |-------------|------------|
//! | Running (every step passed) | `ran-passed` |
//! | Failed | `ran-failed` |
//! | Pending | `ran-pending-failed` (`ran-failed` with `strict = true`) |
//! | Skipped | `not-executed-skipped` |

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::{
    FrameworkError, FrameworkResult, TestFramework, crash, render_command, run_discovery,
    scratch_path, take_discovery_report,
};
use crate::config::CucumberConfig;
use crate::model::{
    DiscoveredTest, Execution, FailureDetail, RawStatus, StepRecord, StepStatus, TestId,
};
use crate::provider::{Command, ExecResult, Launcher};

#[derive(Debug, Deserialize)]
struct Feature {
    uri: String,
    #[serde(default)]
    tags: Vec<Tag>,
    #[serde(default)]
    elements: Vec<Element>,
}

#[derive(Debug, Deserialize)]
struct Element {
    #[serde(default)]
    name: String,
    line: u32,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    tags: Vec<Tag>,
    #[serde(default)]
    before: Vec<Hook>,
    #[serde(default)]
    steps: Vec<Step>,
    #[serde(default)]
    after: Vec<Hook>,
}

#[derive(Debug, Deserialize)]
struct Tag {
    name: String,
}

#[derive(Debug, Deserialize)]
struct Hook {
    result: Option<StepResult>,
    #[serde(rename = "match")]
    matched: Option<StepMatch>,
}

#[derive(Debug, Clone, Deserialize)]
struct Step {
    #[serde(default)]
    keyword: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    line: u32,
    result: Option<StepResult>,
    #[serde(rename = "match")]
    matched: Option<StepMatch>,
}

#[derive(Debug, Clone, Deserialize)]
struct StepResult {
    status: String,
    error_message: Option<String>,
    /// Nanoseconds.
    #[serde(default)]
    duration: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct StepMatch {
    location: Option<String>,
}

impl Element {
    fn is_background(&self) -> bool {
        self.kind == "background"
    }
}

/// Where the step fold currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fold {
    Running,
    Failed,
    Pending,
    Skipped,
}

/// Folds one scenario's hooks and steps into step records and a status.
struct StepFold<'a> {
    uri: &'a str,
    state: Fold,
    records: Vec<StepRecord>,
    failure: Option<FailureDetail>,
    duration: Duration,
}

impl<'a> StepFold<'a> {
    fn new(uri: &'a str) -> Self {
        Self {
            uri,
            state: Fold::Running,
            records: Vec::new(),
            failure: None,
            duration: Duration::ZERO,
        }
    }

    fn hook(&mut self, hook: &Hook, label: &str) {
        let Some(result) = &hook.result else { return };
        self.duration += Duration::from_nanos(result.duration);
        if self.state == Fold::Running && matches!(result.status.as_str(), "failed" | "errored") {
            self.state = Fold::Failed;
            let mut detail = FailureDetail::new(
                result
                    .error_message
                    .clone()
                    .unwrap_or_else(|| format!("{} hook failed", label)),
            );
            if let Some(location) = hook.matched.as_ref().and_then(|m| m.location.clone()) {
                detail = detail.with_location(location);
            }
            self.failure = Some(detail);
        }
    }

    fn step(&mut self, step: &Step) {
        let name = format!("{}{}", step.keyword, step.name).trim().to_string();
        let (status_text, error, nanos) = match &step.result {
            Some(r) => (r.status.as_str(), r.error_message.clone(), r.duration),
            None => ("skipped", None, 0),
        };
        let duration = Duration::from_nanos(nanos);
        self.duration += duration;

        if self.state != Fold::Running {
            self.records
                .push(StepRecord::new(name, StepStatus::NotExecuted).with_duration(duration));
            return;
        }

        let status = match status_text {
            "passed" => StepStatus::Passed,
            "pending" => {
                self.state = Fold::Pending;
                StepStatus::PendingSignaled
            }
            "skipped" => {
                self.state = Fold::Skipped;
                StepStatus::SkipSignaled
            }
            "undefined" => {
                self.state = Fold::Failed;
                self.failure = Some(self.detail(step, format!("Undefined step: {}", name)));
                StepStatus::Undefined
            }
            other => {
                if !matches!(other, "failed" | "errored") {
                    tracing::debug!("Treating Cucumber step status {:?} as failed", other);
                }
                self.state = Fold::Failed;
                let message = error.unwrap_or_else(|| format!("Step {}: {}", other, name));
                self.failure = Some(self.detail(step, message));
                StepStatus::Failed
            }
        };
        self.records
            .push(StepRecord::new(name, status).with_duration(duration));
    }

    fn detail(&self, step: &Step, message: String) -> FailureDetail {
        let location = step
            .matched
            .as_ref()
            .and_then(|m| m.location.clone())
            .unwrap_or_else(|| format!("{}:{}", self.uri, step.line));
        FailureDetail::new(message).with_location(location)
    }

    fn finish(self, id: TestId, strict: bool) -> Execution {
        let status = match self.state {
            Fold::Running => RawStatus::RanPassed,
            Fold::Failed => RawStatus::RanFailed,
            Fold::Pending if strict => RawStatus::RanFailed,
            Fold::Pending => RawStatus::RanPendingFailed,
            Fold::Skipped => RawStatus::NotExecutedSkipped,
        };
        let mut execution = Execution::new(id, status)
            .with_duration(self.duration)
            .with_steps(self.records);
        if let Some(failure) = self.failure {
            execution = execution.with_failure(failure);
        } else if status == RawStatus::RanFailed {
            execution = execution.with_failure(FailureDetail::new("Pending step in strict mode"));
        }
        execution
    }
}

fn parse_report(content: &str) -> FrameworkResult<Vec<Feature>> {
    // An empty run writes nothing at all.
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(content)
        .map_err(|e| FrameworkError::ParseError(format!("invalid Cucumber JSON report: {}", e)))
}

/// Scenarios of every feature, each with the background steps that
/// precede it folded in.
fn scenarios(features: &[Feature]) -> Vec<(&Feature, &Element, Vec<&Step>)> {
    let mut out = Vec::new();
    for feature in features {
        let mut background: Vec<&Step> = Vec::new();
        for element in &feature.elements {
            if element.is_background() {
                background = element.steps.iter().collect();
                continue;
            }
            let mut steps = std::mem::take(&mut background);
            steps.extend(element.steps.iter());
            out.push((feature, element, steps));
        }
    }
    out
}

/// Cucumber adapter. See the module docs for the step fold.
pub struct CucumberFramework {
    config: CucumberConfig,
}

impl CucumberFramework {
    pub fn new(config: CucumberConfig) -> Self {
        Self { config }
    }

    fn is_skip_tagged(&self, feature: &Feature, element: &Element) -> bool {
        feature
            .tags
            .iter()
            .chain(element.tags.iter())
            .any(|tag| self.config.skip_tags.contains(&tag.name))
    }
}

#[async_trait]
impl TestFramework for CucumberFramework {
    fn name(&self) -> &'static str {
        "cucumber"
    }

    async fn discover(&self, launcher: &dyn Launcher) -> FrameworkResult<Vec<DiscoveredTest>> {
        let report_path = scratch_path("verdict-cucumber-dry-run");
        let cmd = render_command(&self.config.discover_command, &[], Some(&report_path))?;
        run_discovery(launcher, &cmd).await?;

        let features = parse_report(&take_discovery_report(launcher, &report_path).await?)?;
        let tests = scenarios(&features)
            .into_iter()
            .map(|(feature, element, _)| {
                let test = DiscoveredTest::new(
                    TestId::new(&feature.uri, element.line.to_string()),
                    &element.name,
                );
                if self.is_skip_tagged(feature, element) {
                    test.skip_declared()
                } else {
                    test
                }
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
        let selectors: Vec<String> = tests
            .iter()
            .map(|id| {
                if id.scope.is_empty() {
                    id.file.clone()
                } else {
                    format!("{}:{}", id.file, id.scope)
                }
            })
            .collect();
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
            return Err(crash(output, "Cucumber wrote no JSON report"));
        };
        let features = match parse_report(content) {
            Ok(features) => features,
            Err(e) => return Err(crash(output, &e.to_string())),
        };

        let executions = scenarios(&features)
            .into_iter()
            .map(|(feature, element, steps)| {
                let mut fold = StepFold::new(&feature.uri);
                for hook in &element.before {
                    fold.hook(hook, "Before");
                }
                for step in steps {
                    fold.step(step);
                }
                for hook in &element.after {
                    fold.hook(hook, "After");
                }
                fold.finish(
                    TestId::new(&feature.uri, element.line.to_string()),
                    self.config.strict,
                )
            })
            .collect();
        Ok(executions)
    }
}
