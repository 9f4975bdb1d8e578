//! Outcome classification.
//!
//! [`classify`] turns the ordered attempts of one test into a final
//! [`Outcome`], or says that the test deserves another attempt.
//!
//! Only the most recent attempt decides which rule applies. Earlier
//! attempts are consulted for a single purpose: telling `Flaky` apart from
//! `Passed`. A test is flaky when it passed after at least one genuine
//! failure, never by majority vote.
//!
//! | Latest raw status | Result |
//! |-------------------|--------|
//! | `not-executed-skipped` | `Skipped` |
//! | `not-executed-pending-declared` | `Pending` |
//! | `ran-pending-failed` | `Pending` |
//! | `ran-pending-passed` | `UnexpectedlyPassed` |
//! | `ran-passed` after an earlier `ran-failed` | `Flaky` |
//! | `ran-passed` otherwise | `Passed` |
//! | `ran-failed`, attempts exhausted | `Failed` |
//! | `ran-failed`, attempts remain | deferred |

use crate::model::{Attempt, FailureReason, Outcome, RawStatus};

/// Result of classifying a test's attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// The test has a final outcome.
    Resolved(Outcome),
    /// The latest attempt failed and the test may run again.
    Deferred,
}

impl Classification {
    pub fn outcome(&self) -> Option<Outcome> {
        match self {
            Classification::Resolved(outcome) => Some(*outcome),
            Classification::Deferred => None,
        }
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, Classification::Deferred)
    }
}

/// Classifies a test from its attempts, oldest first.
///
/// `max_attempts` is the per-test attempt cap; a failing test is only
/// resolved as `Failed` once it has used all of them. An empty attempt
/// list is deferred.
///
/// ```
/// use verdict::classify::{classify, Classification};
/// use verdict::model::{Attempt, Execution, Outcome, RawStatus, TestId};
///
/// let id = TestId::new("spec/a_spec.rb", "1:1");
/// let attempts = vec![
///     Attempt::from_execution(1, Execution::new(id.clone(), RawStatus::RanFailed)),
///     Attempt::from_execution(2, Execution::new(id, RawStatus::RanPassed)),
/// ];
/// assert_eq!(classify(&attempts, 3), Classification::Resolved(Outcome::Flaky));
/// ```
pub fn classify(attempts: &[Attempt], max_attempts: u32) -> Classification {
    let Some((latest, earlier)) = attempts.split_last() else {
        return Classification::Deferred;
    };

    match latest.status {
        RawStatus::NotExecutedSkipped => Classification::Resolved(Outcome::Skipped),
        RawStatus::RanPendingFailed | RawStatus::NotExecutedPendingDeclared => {
            Classification::Resolved(Outcome::Pending)
        }
        RawStatus::RanPendingPassed => Classification::Resolved(Outcome::UnexpectedlyPassed),
        RawStatus::RanPassed => {
            if earlier.iter().any(|a| a.status == RawStatus::RanFailed) {
                Classification::Resolved(Outcome::Flaky)
            } else {
                Classification::Resolved(Outcome::Passed)
            }
        }
        RawStatus::RanFailed => {
            if attempts.len() as u64 >= u64::from(max_attempts.max(1)) {
                Classification::Resolved(Outcome::Failed)
            } else {
                Classification::Deferred
            }
        }
    }
}

/// Picks the failure reason to report for a failing outcome.
///
/// A reason forced by the orchestrator (crash, cancellation, exhausted
/// budget) wins. Otherwise the reason carried by the last attempt's
/// failure detail is used.
pub fn failure_reason(
    outcome: Outcome,
    attempts: &[Attempt],
    forced: Option<FailureReason>,
) -> Option<FailureReason> {
    match outcome {
        Outcome::UnexpectedlyPassed => Some(FailureReason::PendingFixed),
        Outcome::Failed => Some(forced.unwrap_or_else(|| {
            attempts
                .last()
                .and_then(|a| a.failure.as_ref())
                .map(|f| f.reason)
                .unwrap_or_default()
        })),
        _ => None,
    }
}
