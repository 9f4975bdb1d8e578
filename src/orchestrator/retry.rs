//! Bounded retries for one group of tests.
//!
//! Every test moves through `Pending → Attempted → {Resolved, AwaitingRetry}`.
//! A round runs exactly the tests that still await a verdict, in one
//! framework invocation. After the round each test is classified again.
//! Tests that are still deferred need one unit of the run-wide
//! [`RetryCounter`] to get into the next round.
//!
//! | Situation | Effect |
//! |-----------|--------|
//! | Framework did not report a test | synthetic `ran-failed` attempt, reason `not_reported`, retriable |
//! | Report for a test outside the round, or a duplicate | ignored, logged at debug |
//! | Framework crashed | tests without an attempt this round fail with `adapter_crash` |
//! | Run cancelled | tests without an attempt this round, and every unresolved test, fail with `run_cancelled` |
//! | Run-wide cap spent | deferred tests fail with `retry_budget_exhausted` |
//! | Muted test deferred, muted retries off | resolved on its attempts so far, no cap taken |
//! | Declared skipped at discovery | synthetic attempt #1 `not-executed-skipped`, never executed |

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::runner::{OutputCallback, RoundEnd, execute};
use crate::classify::{Classification, classify, failure_reason};
use crate::framework::TestFramework;
use crate::model::{
    Attempt, ClassifiedResult, DiscoveredTest, Execution, FailureDetail, FailureReason, Outcome,
    RawStatus, RetryBudget, TestId,
};
use crate::provider::Launcher;
use crate::report::Reporter;

/// Run-wide retry cap, shared by reference between concurrently running
/// groups.
///
/// ```
/// use verdict::orchestrator::RetryCounter;
///
/// let counter = RetryCounter::new(2);
/// assert!(counter.try_acquire());
/// assert!(counter.try_acquire());
/// assert!(!counter.try_acquire());
/// assert_eq!(counter.used(), 2);
/// ```
#[derive(Debug)]
pub struct RetryCounter {
    cap: u32,
    used: AtomicU32,
    exhausted: AtomicBool,
}

impl RetryCounter {
    pub fn new(cap: u32) -> Self {
        Self {
            cap,
            used: AtomicU32::new(0),
            exhausted: AtomicBool::new(false),
        }
    }

    /// Takes one retry from the cap. Returns `false` once the cap is spent.
    pub fn try_acquire(&self) -> bool {
        let mut current = self.used.load(Ordering::Relaxed);
        loop {
            if current >= self.cap {
                return false;
            }
            match self.used.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Records that a test was denied a retry because the cap was spent.
    pub fn mark_exhausted(&self) {
        self.exhausted.store(true, Ordering::Relaxed);
    }

    pub fn used(&self) -> u32 {
        self.used.load(Ordering::Relaxed)
    }

    /// Whether any test was denied a retry.
    pub fn exhausted(&self) -> bool {
        self.exhausted.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
struct Entry {
    name: String,
    attempts: Vec<Attempt>,
    outcome: Option<Outcome>,
    forced: Option<FailureReason>,
    muted: bool,
}

/// Attempts and verdicts of every test in a group.
///
/// Attempt numbers are assigned here, so they are always `1..=k` without
/// gaps.
#[derive(Debug)]
pub struct TestLedger {
    entries: BTreeMap<TestId, Entry>,
}

impl TestLedger {
    pub fn new(tests: &[DiscoveredTest], muted: &HashSet<TestId>) -> Self {
        let mut ledger = Self {
            entries: BTreeMap::new(),
        };
        for test in tests {
            ledger.entries.entry(test.id.clone()).or_insert_with(|| Entry {
                name: test.name.clone(),
                attempts: Vec::new(),
                outcome: None,
                forced: None,
                muted: muted.contains(&test.id),
            });
            if test.skip_declared {
                ledger.record(Execution::new(test.id.clone(), RawStatus::NotExecutedSkipped));
            }
        }
        ledger.resolve(1);
        ledger
    }

    /// Tests without a verdict yet.
    pub fn unresolved(&self) -> Vec<TestId> {
        self.entries
            .iter()
            .filter(|(_, e)| e.outcome.is_none())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Numbers and stores an execution. Returns `None` for unknown tests.
    pub fn record(&mut self, execution: Execution) -> Option<&Attempt> {
        let entry = self.entries.get_mut(&execution.id)?;
        let number = entry.attempts.len() as u32 + 1;
        entry
            .attempts
            .push(Attempt::from_execution(number, execution));
        entry.attempts.last()
    }

    /// Stores a synthetic failed attempt for a test the framework said
    /// nothing about.
    pub fn record_missing(
        &mut self,
        id: &TestId,
        reason: FailureReason,
        message: impl Into<String>,
    ) -> Option<&Attempt> {
        let execution = Execution::new(id.clone(), RawStatus::RanFailed)
            .with_failure(FailureDetail::new(message).with_reason(reason));
        self.record(execution)
    }

    /// Fails an unresolved test for a reason outside the test itself.
    pub fn force(&mut self, id: &TestId, reason: FailureReason) {
        if let Some(entry) = self.entries.get_mut(id)
            && entry.outcome.is_none()
        {
            entry.outcome = Some(Outcome::Failed);
            entry.forced = Some(reason);
        }
    }

    pub fn is_muted(&self, id: &TestId) -> bool {
        self.entries.get(id).is_some_and(|e| e.muted)
    }

    /// Resolves a deferred test on the attempts it already has, as if its
    /// per-test limit were reached.
    pub fn finalize(&mut self, id: &TestId) {
        if let Some(entry) = self.entries.get_mut(id)
            && entry.outcome.is_none()
            && !entry.attempts.is_empty()
        {
            let limit = entry.attempts.len() as u32;
            if let Classification::Resolved(outcome) = classify(&entry.attempts, limit) {
                entry.outcome = Some(outcome);
            }
        }
    }

    /// Classifies every unresolved test that has attempts. Returns the
    /// tests that are still deferred.
    pub fn resolve(&mut self, max_attempts: u32) -> Vec<TestId> {
        let mut deferred = Vec::new();
        for (id, entry) in &mut self.entries {
            if entry.outcome.is_some() || entry.attempts.is_empty() {
                continue;
            }
            match classify(&entry.attempts, max_attempts) {
                Classification::Resolved(outcome) => entry.outcome = Some(outcome),
                Classification::Deferred => deferred.push(id.clone()),
            }
        }
        deferred
    }

    /// The current verdict of a resolved test.
    pub fn result(&self, id: &TestId, group: &str) -> Option<ClassifiedResult> {
        let entry = self.entries.get(id)?;
        let outcome = entry.outcome?;
        Some(ClassifiedResult {
            id: id.clone(),
            name: entry.name.clone(),
            group: group.to_string(),
            outcome,
            failure_reason: failure_reason(outcome, &entry.attempts, entry.forced),
            muted: entry.muted,
            attempts: entry.attempts.clone(),
        })
    }

    /// Final results, ordered by test id. Tests left without a verdict are
    /// reported as failed with `reason`.
    pub fn into_results(mut self, group: &str, reason: FailureReason) -> Vec<ClassifiedResult> {
        for id in self.unresolved() {
            self.force(&id, reason);
        }
        let ids: Vec<TestId> = self.entries.keys().cloned().collect();
        ids.iter().filter_map(|id| self.result(id, group)).collect()
    }
}

/// What one group's retry loop produced.
#[derive(Debug, Default)]
pub struct GroupOutcome {
    pub results: Vec<ClassifiedResult>,
    /// Adapter crashes, one per crashed round.
    pub errors: Vec<String>,
    /// Tests handed to the framework at least once.
    pub executed: usize,
    pub cancelled: bool,
}

/// Drives the rounds of one group.
pub struct RetryOrchestrator<'a> {
    group: &'a str,
    framework: &'a dyn TestFramework,
    launcher: &'a dyn Launcher,
    reporter: &'a dyn Reporter,
    budget: RetryBudget,
    counter: &'a RetryCounter,
    retry_muted: bool,
    cancel: CancellationToken,
    output_callback: Option<OutputCallback>,
}

impl<'a> RetryOrchestrator<'a> {
    pub fn new(
        group: &'a str,
        framework: &'a dyn TestFramework,
        launcher: &'a dyn Launcher,
        reporter: &'a dyn Reporter,
        budget: RetryBudget,
        counter: &'a RetryCounter,
    ) -> Self {
        Self {
            group,
            framework,
            launcher,
            reporter,
            budget,
            counter,
            retry_muted: true,
            cancel: CancellationToken::new(),
            output_callback: None,
        }
    }

    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Whether failing muted tests are retried. When off they resolve
    /// after their first failing round and never draw on the run-wide cap.
    pub fn with_retry_muted(mut self, retry_muted: bool) -> Self {
        self.retry_muted = retry_muted;
        self
    }

    pub fn with_output_callback(mut self, callback: OutputCallback) -> Self {
        self.output_callback = Some(callback);
        self
    }

    /// Runs `tests` until every one of them has a verdict.
    pub async fn run(&self, tests: &[DiscoveredTest], muted: &HashSet<TestId>) -> GroupOutcome {
        let mut ledger = TestLedger::new(tests, muted);
        let mut outcome = GroupOutcome::default();
        let mut reported: HashSet<TestId> = HashSet::new();

        self.report_resolved(&ledger, &mut reported).await;

        let mut subset = ledger.unresolved();
        outcome.executed = subset.len();
        let mut round = 0u32;

        while !subset.is_empty() {
            round += 1;
            info!(
                "[{}] round {}: running {} test(s)",
                self.group,
                round,
                subset.len()
            );

            let (seen, end) = self.run_round(&mut ledger, &subset, round > 1).await;

            let missing: Vec<&TestId> = subset.iter().filter(|id| !seen.contains(*id)).collect();
            match end {
                RoundEnd::Completed => {
                    for id in missing {
                        debug!("[{}] {} was not reported", self.group, id);
                        let attempt = ledger
                            .record_missing(id, FailureReason::NotReported, "test was not reported by the framework")
                            .cloned();
                        if let Some(attempt) = attempt {
                            self.reporter.on_attempt(self.group, id, &attempt).await;
                        }
                    }
                }
                RoundEnd::Crashed(e) => {
                    warn!("[{}] {}", self.group, e);
                    outcome.errors.push(e.to_string());
                    for id in missing {
                        ledger.record_missing(id, FailureReason::AdapterCrash, e.to_string());
                        ledger.force(id, FailureReason::AdapterCrash);
                    }
                }
                RoundEnd::Cancelled => {
                    warn!("[{}] run cancelled during round {}", self.group, round);
                    for id in missing {
                        ledger.record_missing(id, FailureReason::RunCancelled, "run was cancelled");
                    }
                    ledger.resolve(self.budget.max_attempts_per_test);
                    for id in ledger.unresolved() {
                        ledger.force(&id, FailureReason::RunCancelled);
                    }
                    outcome.cancelled = true;
                    break;
                }
            }

            let deferred = ledger.resolve(self.budget.max_attempts_per_test);

            subset = Vec::with_capacity(deferred.len());
            let mut denied = 0usize;
            for id in deferred {
                if !self.retry_muted && ledger.is_muted(&id) {
                    debug!("[{}] not retrying muted test {}", self.group, id);
                    ledger.finalize(&id);
                } else if self.counter.try_acquire() {
                    subset.push(id);
                } else {
                    ledger.force(&id, FailureReason::RetryBudgetExhausted);
                    self.counter.mark_exhausted();
                    denied += 1;
                }
            }
            if denied > 0 {
                warn!(
                    "[{}] run-wide retry cap reached, {} test(s) will not be retried",
                    self.group, denied
                );
            }
            self.report_resolved(&ledger, &mut reported).await;
        }

        self.report_resolved(&ledger, &mut reported).await;
        outcome.results = ledger.into_results(self.group, FailureReason::RunCancelled);
        outcome
    }

    /// Runs one round and records its executions as attempts.
    async fn run_round(
        &self,
        ledger: &mut TestLedger,
        subset: &[TestId],
        retry: bool,
    ) -> (HashSet<TestId>, RoundEnd) {
        let mut seen: HashSet<TestId> = HashSet::new();
        if self.cancel.is_cancelled() {
            return (seen, RoundEnd::Cancelled);
        }

        let requested: HashSet<&TestId> = subset.iter().collect();
        let mut stream = execute(self.framework, self.launcher, subset, retry)
            .with_cancellation_token(self.cancel.clone());
        if let Some(callback) = &self.output_callback {
            stream = stream.with_output_callback(self.group, callback.clone());
        }

        while let Some(execution) = stream.next().await {
            if !requested.contains(&execution.id) {
                debug!(
                    "[{}] ignoring report for {} outside this round",
                    self.group, execution.id
                );
                continue;
            }
            if !seen.insert(execution.id.clone()) {
                debug!(
                    "[{}] ignoring duplicate report for {}",
                    self.group, execution.id
                );
                continue;
            }
            let id = execution.id.clone();
            if let Some(attempt) = ledger.record(execution).cloned() {
                self.reporter.on_attempt(self.group, &id, &attempt).await;
            }
        }

        (seen, stream.into_end())
    }

    async fn report_resolved(&self, ledger: &TestLedger, reported: &mut HashSet<TestId>) {
        let resolved: Vec<ClassifiedResult> = ledger
            .entries
            .keys()
            .filter(|id| !reported.contains(*id))
            .filter_map(|id| ledger.result(id, self.group))
            .collect();
        for result in resolved {
            reported.insert(result.id.clone());
            self.reporter.on_test_complete(&result).await;
        }
    }
}
