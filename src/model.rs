//! Canonical result model.
//!
//! Every framework speaks its own dialect of "passed", "failed", "skipped"
//! and "pending". Adapters translate those dialects into the vocabulary
//! defined here, and everything downstream (classifier, retry loop,
//! partitioner, reporters) only ever sees these types.
//!
//! # Vocabulary
//!
//! | Type | Produced by | Meaning |
//! |------|-------------|---------|
//! | [`TestId`] | adapters | Stable identity of a test across runs |
//! | [`RawStatus`] | adapters | What happened in one execution |
//! | [`Execution`] | adapters | One unnumbered execution report |
//! | [`Attempt`] | retry orchestrator | A numbered, immutable execution |
//! | [`Outcome`] | classifier | Final verdict for a test |
//! | [`ClassifiedResult`] | coordinator | Verdict plus the attempts behind it |
//! | [`Shard`] | partitioner | The slice of tests one agent runs |

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable identity of a test.
///
/// An identifier is a `(file, scope)` pair. `file` is the spec, feature or
/// test file path. `scope` disambiguates the test inside that file: an
/// example index path for RSpec (`1:2:1`), a scenario line for Cucumber,
/// a `line:title` pair for Playwright. It is empty when the whole file is
/// the unit of execution, as with Cypress spec files.
///
/// The textual form is `file::scope` (or just `file` for an empty scope).
///
/// ```
/// use verdict::model::TestId;
///
/// let id: TestId = "spec/user_spec.rb::1:3".parse().unwrap();
/// assert_eq!(id.file, "spec/user_spec.rb");
/// assert_eq!(id.scope, "1:3");
/// assert_eq!(id.to_string(), "spec/user_spec.rb::1:3");
///
/// let whole_file = TestId::file_only("cypress/e2e/login.cy.js");
/// assert_eq!(whole_file.to_string(), "cypress/e2e/login.cy.js");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TestId {
    /// File or feature path.
    pub file: String,
    /// Position of the test within the file.
    pub scope: String,
}

impl TestId {
    pub fn new(file: impl Into<String>, scope: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            scope: scope.into(),
        }
    }

    /// An identifier whose unit of execution is the whole file.
    pub fn file_only(file: impl Into<String>) -> Self {
        Self::new(file, "")
    }
}

impl fmt::Display for TestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scope.is_empty() {
            write!(f, "{}", self.file)
        } else {
            write!(f, "{}::{}", self.file, self.scope)
        }
    }
}

/// Error returned when a string cannot be read as a [`TestId`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid test identifier: {0:?}")]
pub struct ParseTestIdError(String);

impl FromStr for TestId {
    type Err = ParseTestIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (file, scope) = s.split_once("::").unwrap_or((s, ""));
        if file.is_empty() {
            return Err(ParseTestIdError(s.to_string()));
        }
        Ok(TestId::new(file, scope))
    }
}

impl TryFrom<String> for TestId {
    type Error = ParseTestIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TestId> for String {
    fn from(id: TestId) -> Self {
        id.to_string()
    }
}

/// What a single execution of a test reported, in canonical terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RawStatus {
    /// The body ran and every assertion held.
    RanPassed,
    /// The body ran and failed (assertion, error, timeout).
    RanFailed,
    /// Declared skipped; the body never ran.
    NotExecutedSkipped,
    /// Declared pending without a body to run.
    NotExecutedPendingDeclared,
    /// Declared pending (expected to fail) and it did fail.
    RanPendingFailed,
    /// Declared pending but the body passed.
    RanPendingPassed,
}

impl RawStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RawStatus::RanPassed => "ran-passed",
            RawStatus::RanFailed => "ran-failed",
            RawStatus::NotExecutedSkipped => "not-executed-skipped",
            RawStatus::NotExecutedPendingDeclared => "not-executed-pending-declared",
            RawStatus::RanPendingFailed => "ran-pending-failed",
            RawStatus::RanPendingPassed => "ran-pending-passed",
        }
    }
}

impl fmt::Display for RawStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a test ended up `Failed` (or `UnexpectedlyPassed`).
///
/// CI operators need to tell a real regression apart from infrastructure
/// trouble or an exhausted flake budget, so the reason survives into every
/// report format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The test itself failed (assertion, exception, timeout).
    #[default]
    Assertion,
    /// The framework process died without a usable report.
    AdapterCrash,
    /// The run was cancelled or timed out while the test was unresolved.
    RunCancelled,
    /// The run-level retry cap ran out before the test could be retried.
    RetryBudgetExhausted,
    /// The framework finished normally but never reported this test.
    NotReported,
    /// A pending test passed; the pending marker should be removed.
    PendingFixed,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::Assertion => "assertion",
            FailureReason::AdapterCrash => "adapter_crash",
            FailureReason::RunCancelled => "run_cancelled",
            FailureReason::RetryBudgetExhausted => "retry_budget_exhausted",
            FailureReason::NotReported => "not_reported",
            FailureReason::PendingFixed => "pending_fixed",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Details attached to a failed execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub message: String,
    pub location: Option<String>,
    pub exception_class: Option<String>,
    #[serde(default)]
    pub reason: FailureReason,
}

impl FailureDetail {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            location: None,
            exception_class: None,
            reason: FailureReason::Assertion,
        }
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_exception_class(mut self, class: impl Into<String>) -> Self {
        self.exception_class = Some(class.into());
        self
    }

    pub fn with_reason(mut self, reason: FailureReason) -> Self {
        self.reason = reason;
        self
    }
}

/// Status of one step of a step-based scenario.
///
/// `SkipSignaled` and `PendingSignaled` are control signals raised by the
/// step body. They end the scenario early without being errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Passed,
    Failed,
    SkipSignaled,
    PendingSignaled,
    Undefined,
    NotExecuted,
}

/// One step of a scenario as recorded in an attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub status: StepStatus,
    #[serde(with = "secs")]
    pub duration: Duration,
}

impl StepRecord {
    pub fn new(name: impl Into<String>, status: StepStatus) -> Self {
        Self {
            name: name.into(),
            status,
            duration: Duration::ZERO,
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }
}

/// An execution report emitted by an adapter, before it is numbered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: TestId,
    pub status: RawStatus,
    #[serde(with = "secs")]
    pub duration: Duration,
    pub failure: Option<FailureDetail>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<StepRecord>,
    pub timestamp: DateTime<Utc>,
}

impl Execution {
    pub fn new(id: TestId, status: RawStatus) -> Self {
        Self {
            id,
            status,
            duration: Duration::ZERO,
            failure: None,
            steps: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_failure(mut self, failure: FailureDetail) -> Self {
        self.failure = Some(failure);
        self
    }

    pub fn with_steps(mut self, steps: Vec<StepRecord>) -> Self {
        self.steps = steps;
        self
    }
}

/// One numbered execution of a test within a run.
///
/// Attempt numbers start at 1 and have no gaps. Attempts are never
/// modified after they are recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub number: u32,
    pub status: RawStatus,
    #[serde(with = "secs")]
    pub duration: Duration,
    pub failure: Option<FailureDetail>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<StepRecord>,
    pub timestamp: DateTime<Utc>,
}

impl Attempt {
    /// Numbers an adapter execution.
    pub fn from_execution(number: u32, execution: Execution) -> Self {
        Self {
            number,
            status: execution.status,
            duration: execution.duration,
            failure: execution.failure,
            steps: execution.steps,
            timestamp: execution.timestamp,
        }
    }
}

/// Final canonical verdict for a test.
///
/// | Outcome | Counts as failure |
/// |---------|-------------------|
/// | Passed | no |
/// | Flaky | no |
/// | Skipped | no |
/// | Pending | no |
/// | Failed | yes |
/// | UnexpectedlyPassed | yes |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Passed,
    Failed,
    Flaky,
    Skipped,
    Pending,
    UnexpectedlyPassed,
}

impl Outcome {
    pub const ALL: [Outcome; 6] = [
        Outcome::Passed,
        Outcome::Failed,
        Outcome::Flaky,
        Outcome::Skipped,
        Outcome::Pending,
        Outcome::UnexpectedlyPassed,
    ];

    /// Returns `true` if this outcome fails the run.
    ///
    /// ```
    /// use verdict::model::Outcome;
    ///
    /// assert!(Outcome::Failed.is_failure());
    /// assert!(Outcome::UnexpectedlyPassed.is_failure());
    /// assert!(!Outcome::Pending.is_failure());
    /// assert!(!Outcome::Flaky.is_failure());
    /// ```
    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failed | Outcome::UnexpectedlyPassed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Passed => "passed",
            Outcome::Failed => "failed",
            Outcome::Flaky => "flaky",
            Outcome::Skipped => "skipped",
            Outcome::Pending => "pending",
            Outcome::UnexpectedlyPassed => "unexpectedly_passed",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A test's final verdict together with every attempt behind it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedResult {
    pub id: TestId,
    /// Human-readable name as reported by the framework.
    pub name: String,
    /// Name of the configured group the test belongs to.
    pub group: String,
    pub outcome: Outcome,
    /// Set exactly when the outcome counts as a failure.
    pub failure_reason: Option<FailureReason>,
    /// Muted tests are reported but never fail the run.
    #[serde(default)]
    pub muted: bool,
    pub attempts: Vec<Attempt>,
}

impl ClassifiedResult {
    /// Returns `true` if this result should fail the run.
    pub fn counts_as_failure(&self) -> bool {
        self.outcome.is_failure() && !self.muted
    }

    /// The last recorded attempt.
    pub fn last_attempt(&self) -> Option<&Attempt> {
        self.attempts.last()
    }

    /// Total time spent across all attempts.
    pub fn total_duration(&self) -> Duration {
        self.attempts.iter().map(|a| a.duration).sum()
    }
}

/// Retry policy for a run.
///
/// `max_attempts_per_test` counts the first run, so `1` disables retries.
/// `max_retries_per_run` caps the number of re-executions across all tests
/// of a run, protecting CI minutes when many tests fail at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryBudget {
    pub max_attempts_per_test: u32,
    pub max_retries_per_run: u32,
}

impl RetryBudget {
    pub fn new(max_attempts_per_test: u32, max_retries_per_run: u32) -> Self {
        Self {
            max_attempts_per_test: max_attempts_per_test.max(1),
            max_retries_per_run,
        }
    }
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self::new(1, 0)
    }
}

/// A test as reported by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredTest {
    pub id: TestId,
    pub name: String,
    /// The framework reported the test as skipped before running anything.
    #[serde(default)]
    pub skip_declared: bool,
}

impl DiscoveredTest {
    pub fn new(id: TestId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            skip_declared: false,
        }
    }

    pub fn skip_declared(mut self) -> Self {
        self.skip_declared = true;
        self
    }
}

/// The tests assigned to one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub index: usize,
    pub tests: Vec<TestId>,
    #[serde(with = "secs")]
    pub estimated: Duration,
}

/// Serializes a `Duration` as fractional seconds.
pub(crate) mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO))
    }
}
