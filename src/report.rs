//! Test reporting and output generation.

pub mod junit;

use std::path::PathBuf;

use async_trait::async_trait;

use crate::model::{Attempt, ClassifiedResult, DiscoveredTest, Outcome, TestId};
use crate::orchestrator::RunReport;

pub use junit::JUnitReporter;

/// A test reporter receives events during a run.
///
/// Events for different groups interleave; events for one test arrive in
/// order (every `on_attempt`, then one `on_test_complete`).
#[async_trait]
pub trait Reporter: Send + Sync {
    /// Called once discovery (and shard selection) is complete.
    async fn on_discovery_complete(&self, tests: &[DiscoveredTest]);

    /// Called for every attempt as soon as the framework reports it.
    async fn on_attempt(&self, group: &str, id: &TestId, attempt: &Attempt);

    /// Called when a test reaches its final outcome.
    async fn on_test_complete(&self, result: &ClassifiedResult);

    /// Called when all groups have completed.
    async fn on_run_complete(&self, report: &RunReport);
}

/// A reporter that does nothing (for testing or when output is not needed).
pub struct NullReporter;

#[async_trait]
impl Reporter for NullReporter {
    async fn on_discovery_complete(&self, _tests: &[DiscoveredTest]) {}
    async fn on_attempt(&self, _group: &str, _id: &TestId, _attempt: &Attempt) {}
    async fn on_test_complete(&self, _result: &ClassifiedResult) {}
    async fn on_run_complete(&self, _report: &RunReport) {}
}

/// A reporter that combines multiple reporters.
pub struct MultiReporter {
    reporters: Vec<Box<dyn Reporter>>,
}

impl MultiReporter {
    /// Create a new multi-reporter.
    pub fn new() -> Self {
        Self {
            reporters: Vec::new(),
        }
    }

    /// Add a reporter to the multi-reporter.
    pub fn with_reporter<R: Reporter + 'static>(mut self, reporter: R) -> Self {
        self.reporters.push(Box::new(reporter));
        self
    }
}

impl Default for MultiReporter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Reporter for MultiReporter {
    async fn on_discovery_complete(&self, tests: &[DiscoveredTest]) {
        for reporter in &self.reporters {
            reporter.on_discovery_complete(tests).await;
        }
    }

    async fn on_attempt(&self, group: &str, id: &TestId, attempt: &Attempt) {
        for reporter in &self.reporters {
            reporter.on_attempt(group, id, attempt).await;
        }
    }

    async fn on_test_complete(&self, result: &ClassifiedResult) {
        for reporter in &self.reporters {
            reporter.on_test_complete(result).await;
        }
    }

    async fn on_run_complete(&self, report: &RunReport) {
        for reporter in &self.reporters {
            reporter.on_run_complete(report).await;
        }
    }
}

/// Console reporter that shows progress in the terminal.
pub struct ConsoleReporter {
    progress: std::sync::Mutex<Option<indicatif::ProgressBar>>,
    verbose: bool,
}

impl ConsoleReporter {
    /// Create a new console reporter.
    pub fn new(verbose: bool) -> Self {
        Self {
            progress: std::sync::Mutex::new(None),
            verbose,
        }
    }

    fn println(&self, line: String) {
        match self.progress.lock() {
            Ok(guard) => match guard.as_ref() {
                Some(pb) => pb.suspend(|| println!("{}", line)),
                None => println!("{}", line),
            },
            Err(_) => println!("{}", line),
        }
    }
}

fn styled(outcome: Outcome) -> console::StyledObject<&'static str> {
    match outcome {
        Outcome::Passed => console::style("PASS ").green(),
        Outcome::Flaky => console::style("FLAKY").yellow(),
        Outcome::Failed => console::style("FAIL ").red(),
        Outcome::Skipped => console::style("SKIP ").yellow(),
        Outcome::Pending => console::style("PEND ").cyan(),
        Outcome::UnexpectedlyPassed => console::style("FIXED").red().bold(),
    }
}

#[async_trait]
impl Reporter for ConsoleReporter {
    async fn on_discovery_complete(&self, tests: &[DiscoveredTest]) {
        println!("Discovered {} tests", tests.len());

        let pb = indicatif::ProgressBar::new(tests.len() as u64);
        if let Ok(style) = indicatif::ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
        {
            pb.set_style(style.progress_chars("#>-"));
        }

        if let Ok(mut progress) = self.progress.lock() {
            *progress = Some(pb);
        }
    }

    async fn on_attempt(&self, group: &str, id: &TestId, attempt: &Attempt) {
        if self.verbose {
            self.println(format!(
                "[{}] {} attempt {}: {}",
                group, id, attempt.number, attempt.status
            ));
        }
    }

    async fn on_test_complete(&self, result: &ClassifiedResult) {
        if let Ok(progress) = self.progress.lock()
            && let Some(pb) = progress.as_ref()
        {
            pb.inc(1);
        }

        if self.verbose || result.outcome != Outcome::Passed {
            let muted = if result.muted {
                format!(" {}", console::style("(muted)").dim())
            } else {
                String::new()
            };
            self.println(format!("{} {}{}", styled(result.outcome), result.id, muted));
        }
    }

    async fn on_run_complete(&self, report: &RunReport) {
        if let Ok(mut progress) = self.progress.lock()
            && let Some(pb) = progress.take()
        {
            pb.finish_and_clear();
        }

        println!();
        println!("Test Results:");
        println!("  Total:    {}", report.results.len());
        println!("  Passed:   {}", console::style(report.passed).green());
        println!("  Failed:   {}", console::style(report.failed).red());
        if report.flaky > 0 {
            println!("  Flaky:    {}", console::style(report.flaky).yellow());
        }
        println!("  Skipped:  {}", console::style(report.skipped).yellow());
        if report.pending > 0 {
            println!("  Pending:  {}", console::style(report.pending).cyan());
        }
        if report.unexpectedly_passed > 0 {
            println!(
                "  Fixed:    {}",
                console::style(report.unexpectedly_passed).red().bold()
            );
        }
        if report.muted_passed > 0 || report.muted_failures > 0 {
            println!(
                "  Muted:    {} passed, {} failed",
                console::style(report.muted_passed).dim(),
                console::style(report.muted_failures).dim()
            );
        }
        if report.retries_used > 0 {
            println!(
                "  Retries:  {}{}",
                report.retries_used,
                if report.retry_cap_exhausted {
                    " (cap reached)"
                } else {
                    ""
                }
            );
        }
        println!("  Duration: {:?}", report.duration);

        for error in &report.errors {
            println!();
            if error.group.is_empty() {
                println!("{}", console::style(&error.message).red().bold());
            } else {
                println!(
                    "{} {}",
                    console::style(format!("[{}]", error.group)).red().bold(),
                    error.message
                );
            }
        }

        println!();
        if report.success() {
            if report.flaky > 0 {
                println!(
                    "{}",
                    console::style("All tests passed, some only on retry.")
                        .yellow()
                        .bold()
                );
            } else {
                println!("{}", console::style("All tests passed!").green().bold());
            }
            return;
        }

        if report.cancelled {
            println!("{}", console::style("Run was cancelled.").red().bold());
        } else if report.fail_on_no_tests && report.discovered == 0 {
            println!("{}", console::style("No tests were found.").red().bold());
        } else {
            println!("{}", console::style("Some tests failed.").red().bold());
        }

        let failures: Vec<&ClassifiedResult> = report.failures().collect();
        if failures.is_empty() {
            return;
        }
        println!();
        println!("Failed tests:");
        for result in failures {
            let reason = result
                .failure_reason
                .map(|r| format!(" ({})", r))
                .unwrap_or_default();
            println!("  - {}{}", result.id, console::style(reason).dim());
            if let Some(failure) = result.last_attempt().and_then(|a| a.failure.as_ref()) {
                for line in failure.message.lines().take(10) {
                    println!("    {}", console::style(line).dim());
                }
                if let Some(location) = &failure.location {
                    println!("    {}", console::style(location).dim());
                }
            }
        }
    }
}

/// Writes the whole [`RunReport`] as pretty JSON when the run completes.
pub struct JsonReporter {
    output_path: PathBuf,
}

impl JsonReporter {
    pub fn new(output_path: PathBuf) -> Self {
        Self { output_path }
    }

    fn write(&self, report: &RunReport) -> anyhow::Result<()> {
        use anyhow::Context;

        if let Some(parent) = self.output_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(report)?;
        std::fs::write(&self.output_path, json)
            .with_context(|| format!("Failed to write {}", self.output_path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl Reporter for JsonReporter {
    async fn on_discovery_complete(&self, _tests: &[DiscoveredTest]) {}
    async fn on_attempt(&self, _group: &str, _id: &TestId, _attempt: &Attempt) {}
    async fn on_test_complete(&self, _result: &ClassifiedResult) {}

    async fn on_run_complete(&self, report: &RunReport) {
        match self.write(report) {
            Ok(()) => tracing::info!("JSON report written to: {}", self.output_path.display()),
            Err(e) => tracing::error!("Failed to write JSON report: {:#}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::model::{Execution, FailureReason, RawStatus};

    #[derive(Clone, Default)]
    struct Recording {
        events: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Reporter for Recording {
        async fn on_discovery_complete(&self, tests: &[DiscoveredTest]) {
            self.events
                .lock()
                .unwrap()
                .push(format!("discovered {}", tests.len()));
        }
        async fn on_attempt(&self, _group: &str, id: &TestId, attempt: &Attempt) {
            self.events
                .lock()
                .unwrap()
                .push(format!("attempt {} {}", id, attempt.number));
        }
        async fn on_test_complete(&self, result: &ClassifiedResult) {
            self.events
                .lock()
                .unwrap()
                .push(format!("done {} {}", result.id, result.outcome));
        }
        async fn on_run_complete(&self, report: &RunReport) {
            self.events
                .lock()
                .unwrap()
                .push(format!("run {}", report.exit_code()));
        }
    }

    fn failed_result() -> ClassifiedResult {
        let id = TestId::new("spec/a_spec.rb", "1:1");
        ClassifiedResult {
            id: id.clone(),
            name: "a".into(),
            group: "unit".into(),
            outcome: Outcome::Failed,
            failure_reason: Some(FailureReason::Assertion),
            muted: false,
            attempts: vec![Attempt::from_execution(
                1,
                Execution::new(id, RawStatus::RanFailed),
            )],
        }
    }

    #[tokio::test]
    async fn test_multi_reporter_forwards_in_order() {
        let first = Recording::default();
        let second = Recording::default();
        let multi = MultiReporter::new()
            .with_reporter(first.clone())
            .with_reporter(second.clone());

        let result = failed_result();
        multi.on_discovery_complete(&[]).await;
        multi
            .on_attempt("unit", &result.id, &result.attempts[0])
            .await;
        multi.on_test_complete(&result).await;
        multi
            .on_run_complete(&RunReport::from_results(vec![result]))
            .await;

        let expected = vec![
            "discovered 0",
            "attempt spec/a_spec.rb::1:1 1",
            "done spec/a_spec.rb::1:1 failed",
            "run 1",
        ];
        assert_eq!(*first.events.lock().unwrap(), expected);
        assert_eq!(*second.events.lock().unwrap(), expected);
    }

    #[tokio::test]
    async fn test_json_reporter_writes_report() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("verdict.json");
        let reporter = JsonReporter::new(path.clone());

        reporter
            .on_run_complete(&RunReport::from_results(vec![failed_result()]))
            .await;

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["failed"], 1);
        assert_eq!(json["failure_count"], 1);
        assert_eq!(json["muted_passed"], 0);
        assert_eq!(json["muted_failures"], 0);
        assert_eq!(json["results"][0]["id"], "spec/a_spec.rb::1:1");
        assert_eq!(json["results"][0]["failure_reason"], "assertion");
    }

    #[test]
    fn test_console_reporter_survives_full_run() {
        let reporter = ConsoleReporter::new(true);
        let result = failed_result();
        tokio_test::block_on(async {
            reporter
                .on_discovery_complete(&[DiscoveredTest::new(result.id.clone(), "a")])
                .await;
            assert!(reporter.progress.lock().unwrap().is_some());
            reporter
                .on_attempt("unit", &result.id, &result.attempts[0])
                .await;
            reporter.on_test_complete(&result).await;
            reporter
                .on_run_complete(&RunReport::from_results(vec![result.clone()]))
                .await;
        });
        assert!(reporter.progress.lock().unwrap().is_none());
    }
}
