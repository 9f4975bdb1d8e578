//! Run coordination.
//!
//! The [`Coordinator`] ties every piece together for one run:
//!
//! ```text
//!   groups (config)
//!       │ discover()                    all groups concurrently
//!       ▼
//!   Vec<DiscoveredTest> per group
//!       │ partition()                   only when shard_count > 0
//!       ▼
//!   this agent's shard per group
//!       │ RetryOrchestrator::run()      all groups concurrently,
//!       │   round 1, 2, ...             rounds within a group in order
//!       ▼
//!   Vec<ClassifiedResult>
//!       │
//!       ▼
//!   RunReport ──► Reporter::on_run_complete()
//! ```
//!
//! Groups share nothing mutable except the run-wide [`RetryCounter`]. A
//! group whose discovery fails or whose framework crashes records a
//! run-level error; the other groups carry on.
//!
//! # Example
//!
//! ```no_run
//! use verdict::config::load_config;
//! use verdict::orchestrator::Coordinator;
//! use verdict::provider::local::LocalLauncher;
//! use verdict::report::ConsoleReporter;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("verdict.toml"))?;
//!     let launcher = LocalLauncher::new(config.launcher.clone());
//!     let reporter = ConsoleReporter::new(false);
//!
//!     let report = Coordinator::new(&config, &launcher, &reporter).run().await?;
//!     std::process::exit(report.exit_code());
//! }
//! ```

pub mod retry;
pub mod runner;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::framework::{Adapter, TestFramework};
use crate::history::DurationStore;
use crate::model::{ClassifiedResult, DiscoveredTest, Outcome, Shard, TestId};
use crate::partition::{DurationSource, PartitionError, partition};
use crate::provider::{Launcher, OutputLine};
use crate::report::Reporter;

pub use retry::{GroupOutcome, RetryCounter, RetryOrchestrator, TestLedger};
pub use runner::{ExecutionStream, OutputCallback, RoundEnd, execute};

/// Errors that stop a run before any test executes.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Partition(#[from] PartitionError),

    #[error("shard index {index} is out of range for {count} shard(s)")]
    ShardOutOfRange { index: usize, count: usize },
}

/// A run-level problem attributed to a group rather than a test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupError {
    pub group: String,
    pub message: String,
}

/// Aggregated results of an entire run.
///
/// # Exit Codes
///
/// | Code | Meaning |
/// |------|---------|
/// | 0 | No failures and nothing flaky |
/// | 1 | Failures, run-level errors, cancellation, or no tests when `fail_on_no_tests` is set |
/// | 2 | No failures, but some tests only passed on retry |
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    #[serde(with = "crate::model::secs")]
    pub duration: Duration,

    /// Tests discovered (after sharding, this agent's share).
    pub discovered: usize,
    /// Tests handed to a framework at least once.
    pub executed: usize,

    /// Passed on the first attempt.
    pub passed: usize,
    pub failed: usize,
    /// Passed on a retry after failing.
    pub flaky: usize,
    pub skipped: usize,
    pub pending: usize,
    pub unexpectedly_passed: usize,
    /// Muted tests that passed, on the first attempt or on retry.
    pub muted_passed: usize,
    /// Failing outcomes of muted tests; they do not fail the run.
    pub muted_failures: usize,
    /// Failing outcomes that fail the run.
    pub failure_count: usize,

    pub retries_used: u32,
    pub retry_cap_exhausted: bool,
    pub cancelled: bool,
    pub timed_out: bool,

    pub shard_index: Option<usize>,
    pub shard_count: usize,

    pub errors: Vec<GroupError>,
    #[serde(skip)]
    pub fail_on_no_tests: bool,

    pub results: Vec<ClassifiedResult>,
}

impl RunReport {
    /// Builds a report from final results, filling in every count.
    pub fn from_results(results: Vec<ClassifiedResult>) -> Self {
        let mut report = RunReport {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            duration: Duration::ZERO,
            discovered: results.len(),
            executed: 0,
            passed: 0,
            failed: 0,
            flaky: 0,
            skipped: 0,
            pending: 0,
            unexpectedly_passed: 0,
            muted_passed: 0,
            muted_failures: 0,
            failure_count: 0,
            retries_used: 0,
            retry_cap_exhausted: false,
            cancelled: false,
            timed_out: false,
            shard_index: None,
            shard_count: 0,
            errors: Vec::new(),
            fail_on_no_tests: false,
            results: Vec::new(),
        };
        for result in &results {
            match result.outcome {
                Outcome::Passed => report.passed += 1,
                Outcome::Failed => report.failed += 1,
                Outcome::Flaky => report.flaky += 1,
                Outcome::Skipped => report.skipped += 1,
                Outcome::Pending => report.pending += 1,
                Outcome::UnexpectedlyPassed => report.unexpectedly_passed += 1,
            }
            if result.counts_as_failure() {
                report.failure_count += 1;
            } else if result.outcome.is_failure() {
                report.muted_failures += 1;
            } else if result.muted && matches!(result.outcome, Outcome::Passed | Outcome::Flaky) {
                report.muted_passed += 1;
            }
        }
        report.results = results;
        report
    }

    pub fn count(&self, outcome: Outcome) -> usize {
        match outcome {
            Outcome::Passed => self.passed,
            Outcome::Failed => self.failed,
            Outcome::Flaky => self.flaky,
            Outcome::Skipped => self.skipped,
            Outcome::Pending => self.pending,
            Outcome::UnexpectedlyPassed => self.unexpectedly_passed,
        }
    }

    /// Results that fail the run.
    pub fn failures(&self) -> impl Iterator<Item = &ClassifiedResult> {
        self.results.iter().filter(|r| r.counts_as_failure())
    }

    /// Returns `true` if the run should be considered green.
    ///
    /// Flaky tests are successful; muted failures are ignored.
    ///
    /// ```
    /// use verdict::orchestrator::RunReport;
    ///
    /// let report = RunReport::from_results(vec![]);
    /// assert!(report.success());
    /// assert_eq!(report.exit_code(), 0);
    /// ```
    pub fn success(&self) -> bool {
        self.failure_count == 0
            && self.errors.is_empty()
            && !self.cancelled
            && !(self.fail_on_no_tests && self.discovered == 0)
    }

    /// Returns an appropriate process exit code for this report.
    pub fn exit_code(&self) -> i32 {
        if !self.success() {
            1
        } else if self.flaky > 0 {
            2
        } else {
            0
        }
    }
}

/// One configured group after discovery.
pub struct DiscoveredGroup {
    pub name: String,
    pub adapter: Adapter,
    pub tests: Vec<DiscoveredTest>,
}

/// Outcome of discovering every group.
pub struct Discovery {
    pub groups: Vec<DiscoveredGroup>,
    pub errors: Vec<GroupError>,
}

impl Discovery {
    pub fn test_count(&self) -> usize {
        self.groups.iter().map(|g| g.tests.len()).sum()
    }
}

/// Coordinates discovery, sharding, execution and reporting for one run.
pub struct Coordinator<'a> {
    config: &'a Config,
    launcher: &'a dyn Launcher,
    reporter: &'a dyn Reporter,
    cancel: CancellationToken,
}

impl<'a> Coordinator<'a> {
    pub fn new(config: &'a Config, launcher: &'a dyn Launcher, reporter: &'a dyn Reporter) -> Self {
        Self {
            config,
            launcher,
            reporter,
            cancel: CancellationToken::new(),
        }
    }

    /// Sets a token that cancels the run when triggered (Ctrl-C).
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    fn root(&self) -> PathBuf {
        self.config
            .launcher
            .working_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Historical durations, or an empty store.
    pub fn durations(&self) -> DurationStore {
        self.config
            .verdict
            .durations_file
            .as_deref()
            .map(DurationStore::load)
            .unwrap_or_default()
    }

    /// Discovers the tests of every group concurrently.
    pub async fn discover(&self) -> Discovery {
        let root = self.root();
        let adapters: Vec<(String, Adapter)> = self
            .config
            .groups
            .iter()
            .map(|(name, group)| (name.clone(), Adapter::from_config(&group.framework, &root)))
            .collect();

        let launcher = self.launcher;
        let discovered = join_all(adapters.into_iter().map(|(name, adapter)| async move {
            info!("[{}] discovering {} tests", name, adapter.name());
            let result = adapter.discover(launcher).await;
            (name, adapter, result)
        }))
        .await;

        let mut discovery = Discovery {
            groups: Vec::new(),
            errors: Vec::new(),
        };
        for (name, adapter, result) in discovered {
            match result {
                Ok(tests) => {
                    info!("[{}] discovered {} test(s)", name, tests.len());
                    discovery.groups.push(DiscoveredGroup {
                        name,
                        adapter,
                        tests,
                    });
                }
                Err(e) => {
                    error!("[{}] discovery failed: {}", name, e);
                    discovery.errors.push(GroupError {
                        group: name,
                        message: e.to_string(),
                    });
                }
            }
        }
        discovery
    }

    /// Splits every group into `shard_count` shards.
    ///
    /// Groups without tests get empty shards.
    pub fn shards(
        &self,
        discovery: &Discovery,
        shard_count: usize,
        durations: &dyn DurationSource,
    ) -> Result<Vec<(String, Vec<Shard>)>, RunError> {
        let fallback = self.config.verdict.fallback_duration();
        discovery
            .groups
            .iter()
            .map(|group| {
                let ids: Vec<TestId> = group.tests.iter().map(|t| t.id.clone()).collect();
                let shards = if ids.is_empty() {
                    if shard_count == 0 {
                        return Err(PartitionError::InvalidPartitionRequest(
                            "shard count must be at least 1".to_string(),
                        )
                        .into());
                    }
                    (0..shard_count)
                        .map(|index| Shard {
                            index,
                            tests: Vec::new(),
                            estimated: Duration::ZERO,
                        })
                        .collect()
                } else {
                    partition(&ids, shard_count, durations, fallback)?
                };
                Ok((group.name.clone(), shards))
            })
            .collect()
    }

    /// Keeps only this agent's shard of every group.
    fn select_shard(&self, discovery: &mut Discovery) -> Result<(), RunError> {
        let settings = &self.config.verdict;
        let (index, count) = (settings.shard_index, settings.shard_count);
        if index >= count {
            return Err(RunError::ShardOutOfRange { index, count });
        }

        let durations = self.durations();
        let shards = self.shards(discovery, count, &durations)?;
        for (group, (_, shards)) in discovery.groups.iter_mut().zip(shards) {
            let Some(shard) = shards.into_iter().nth(index) else {
                return Err(RunError::ShardOutOfRange { index, count });
            };
            let keep: HashSet<&TestId> = shard.tests.iter().collect();
            group.tests.retain(|t| keep.contains(&t.id));
            info!(
                "[{}] shard {}/{}: {} test(s), estimated {:?}",
                group.name,
                index + 1,
                count,
                group.tests.len(),
                shard.estimated
            );
        }
        Ok(())
    }

    /// Runs every group to completion and reports the result.
    pub async fn run(&self) -> Result<RunReport, RunError> {
        let start = Instant::now();
        let started_at = Utc::now();
        let settings = &self.config.verdict;

        let mut discovery = self.discover().await;
        if settings.shard_count > 0 {
            self.select_shard(&mut discovery)?;
        }

        let all: Vec<DiscoveredTest> = discovery
            .groups
            .iter()
            .flat_map(|g| g.tests.iter().cloned())
            .collect();
        if all.is_empty() {
            warn!("No tests to run");
        }
        self.reporter.on_discovery_complete(&all).await;

        let run_token = self.cancel.child_token();
        let timer = settings.run_timeout().map(|timeout| {
            let token = run_token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                warn!("Run timed out after {:?}, cancelling", timeout);
                token.cancel();
            })
        });

        let counter = RetryCounter::new(settings.max_retries_per_run);
        let budget = settings.retry_budget();
        let muted: HashSet<TestId> = settings.muted_ids().into_iter().collect();
        let callback: Option<OutputCallback> = settings.stream_output.then(|| {
            Arc::new(|group: &str, line: &OutputLine| match line {
                OutputLine::Stdout(s) => println!("[{}] {}", group, s),
                OutputLine::Stderr(s) => eprintln!("[{}] {}", group, s),
                OutputLine::ExitCode(_) => {}
            }) as OutputCallback
        });

        let muted = &muted;
        let counter_ref = &counter;
        let outcomes = join_all(discovery.groups.iter().map(|group| {
            let mut orchestrator = RetryOrchestrator::new(
                &group.name,
                &group.adapter,
                self.launcher,
                self.reporter,
                budget,
                counter_ref,
            )
            .with_cancellation_token(run_token.clone())
            .with_retry_muted(settings.retry_muted);
            if let Some(callback) = &callback {
                orchestrator = orchestrator.with_output_callback(callback.clone());
            }
            async move { orchestrator.run(&group.tests, muted).await }
        }))
        .await;

        if let Some(timer) = timer {
            timer.abort();
        }
        let timed_out = run_token.is_cancelled() && !self.cancel.is_cancelled();

        let mut errors = discovery.errors;
        let mut results = Vec::new();
        let mut executed = 0;
        let mut cancelled = false;
        for (group, outcome) in discovery.groups.iter().zip(outcomes) {
            executed += outcome.executed;
            cancelled |= outcome.cancelled;
            errors.extend(outcome.errors.into_iter().map(|message| GroupError {
                group: group.name.clone(),
                message,
            }));
            results.extend(outcome.results);
        }
        if timed_out {
            errors.push(GroupError {
                group: String::new(),
                message: format!(
                    "run timed out after {}s",
                    settings.run_timeout_secs.unwrap_or_default()
                ),
            });
        }

        if settings.record_durations
            && let Some(path) = &settings.durations_file
        {
            let mut store = DurationStore::load(path);
            store.record(&results);
            if let Err(e) = store.save(path) {
                warn!("Failed to record durations: {:#}", e);
            }
        }

        let mut report = RunReport::from_results(results);
        report.started_at = started_at;
        report.duration = start.elapsed();
        report.discovered = all.len();
        report.executed = executed;
        report.retries_used = counter.used();
        report.retry_cap_exhausted = counter.exhausted();
        report.cancelled = cancelled || self.cancel.is_cancelled();
        report.timed_out = timed_out;
        if settings.shard_count > 0 {
            report.shard_index = Some(settings.shard_index);
            report.shard_count = settings.shard_count;
        }
        report.errors = errors;
        report.fail_on_no_tests = settings.fail_on_no_tests;

        info!(
            "Run {} finished in {:?}: {} passed, {} failed, {} flaky, {} skipped, {} pending",
            report.run_id,
            report.duration,
            report.passed,
            report.failed,
            report.flaky,
            report.skipped,
            report.pending
        );

        self.reporter.on_run_complete(&report).await;
        Ok(report)
    }
}
