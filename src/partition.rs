//! Duration-balanced sharding.
//!
//! When a suite is spread over N CI agents, the slowest agent decides when
//! the build finishes. [`partition`] therefore balances *estimated time*,
//! not test counts, using greedy longest-processing-time-first packing:
//!
//! 1. sort tests by expected duration, longest first (ties by [`TestId`]);
//! 2. hand each test to the shard with the least accumulated time
//!    (ties to the lowest shard index).
//!
//! Identical inputs always produce identical shards, which lets every
//! agent compute the full partition independently and keep only its own
//! slice.
//!
//! # Example
//!
//! ```
//! use std::collections::HashMap;
//! use std::time::Duration;
//! use verdict::model::TestId;
//! use verdict::partition::partition;
//!
//! let ids: Vec<TestId> = (0..4).map(|i| TestId::new("spec/a_spec.rb", i.to_string())).collect();
//! let mut durations = HashMap::new();
//! durations.insert(ids[0].clone(), Duration::from_secs(9));
//!
//! let shards = partition(&ids, 2, &durations, Duration::from_secs(1)).unwrap();
//! assert_eq!(shards[0].tests, vec![ids[0].clone()]);
//! assert_eq!(shards[1].tests.len(), 3);
//! ```

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use crate::model::{Shard, TestId};

/// Errors from [`partition`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PartitionError {
    /// Zero shards were requested or there is nothing to partition.
    #[error("invalid partition request: {0}")]
    InvalidPartitionRequest(String),
}

/// Read-only lookup of historical test durations.
///
/// A missing entry is normal (a new test) and is not an error.
pub trait DurationSource {
    fn duration_of(&self, id: &TestId) -> Option<Duration>;
}

impl DurationSource for HashMap<TestId, Duration> {
    fn duration_of(&self, id: &TestId) -> Option<Duration> {
        self.get(id).copied()
    }
}

impl<T: DurationSource + ?Sized> DurationSource for &T {
    fn duration_of(&self, id: &TestId) -> Option<Duration> {
        (**self).duration_of(id)
    }
}

/// Splits `ids` into `shard_count` shards balanced by expected duration.
///
/// Duplicate identifiers are collapsed. Tests without history use
/// `fallback`. The result always has exactly `shard_count` entries; some may
/// be empty when there are fewer tests than shards.
///
/// # Errors
///
/// [`PartitionError::InvalidPartitionRequest`] if `shard_count` is zero or
/// `ids` is empty.
pub fn partition(
    ids: &[TestId],
    shard_count: usize,
    durations: &dyn DurationSource,
    fallback: Duration,
) -> Result<Vec<Shard>, PartitionError> {
    if shard_count == 0 {
        return Err(PartitionError::InvalidPartitionRequest(
            "shard count must be at least 1".to_string(),
        ));
    }
    if ids.is_empty() {
        return Err(PartitionError::InvalidPartitionRequest(
            "no test identifiers to partition".to_string(),
        ));
    }

    let unique: BTreeSet<&TestId> = ids.iter().collect();
    let mut weighted: Vec<(Duration, &TestId)> = unique
        .into_iter()
        .map(|id| (durations.duration_of(id).unwrap_or(fallback), id))
        .collect();
    weighted.sort_by(|(da, ia), (db, ib)| db.cmp(da).then_with(|| ia.cmp(ib)));

    let mut shards: Vec<Shard> = (0..shard_count)
        .map(|index| Shard {
            index,
            tests: Vec::new(),
            estimated: Duration::ZERO,
        })
        .collect();

    for (duration, id) in weighted {
        // min_by_key returns the first minimum, i.e. the lowest index.
        let Some(target) = shards.iter_mut().min_by_key(|s| s.estimated) else {
            break;
        };
        target.tests.push(id.clone());
        target.estimated += duration;
    }

    tracing::debug!(
        "Partitioned {} tests into {} shards (max estimate {:?})",
        ids.len(),
        shard_count,
        shards.iter().map(|s| s.estimated).max().unwrap_or_default()
    );

    Ok(shards)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<TestId> {
        (0..n)
            .map(|i| TestId::new(format!("spec/t{i}_spec.rb"), "1"))
            .collect()
    }

    #[test]
    fn test_rejects_zero_shards() {
        let err = partition(&ids(3), 0, &HashMap::new(), Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, PartitionError::InvalidPartitionRequest(_)));
    }

    #[test]
    fn test_rejects_empty_input() {
        let err = partition(&[], 2, &HashMap::new(), Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, PartitionError::InvalidPartitionRequest(_)));
    }

    #[test]
    fn test_lpt_minimizes_max_shard() {
        // One long test and seven short ones across two agents.
        let ids = ids(8);
        let durations: HashMap<TestId, Duration> = ids
            .iter()
            .zip([10u64, 1, 1, 1, 1, 1, 1, 1])
            .map(|(id, s)| (id.clone(), Duration::from_secs(s)))
            .collect();

        let shards = partition(&ids, 2, &durations, Duration::from_secs(1)).unwrap();
        let mut estimates: Vec<_> = shards.iter().map(|s| s.estimated.as_secs()).collect();
        estimates.sort();
        assert_eq!(estimates, vec![7, 10]);

        let long = shards.iter().find(|s| s.estimated.as_secs() == 10).unwrap();
        assert_eq!(long.tests, vec![ids[0].clone()]);
    }

    #[test]
    fn test_unknown_durations_use_fallback_and_lexical_ties() {
        let ids = ids(4);
        let shards = partition(&ids, 2, &HashMap::new(), Duration::from_millis(500)).unwrap();
        assert_eq!(shards[0].tests, vec![ids[0].clone(), ids[2].clone()]);
        assert_eq!(shards[1].tests, vec![ids[1].clone(), ids[3].clone()]);
        assert_eq!(shards[0].estimated, Duration::from_secs(1));
    }

    #[test]
    fn test_more_shards_than_tests() {
        let shards = partition(&ids(2), 4, &HashMap::new(), Duration::from_secs(1)).unwrap();
        assert_eq!(shards.len(), 4);
        assert_eq!(shards.iter().filter(|s| s.tests.is_empty()).count(), 2);
    }

    #[test]
    fn test_duplicates_are_collapsed() {
        let mut input = ids(3);
        input.push(input[0].clone());
        let shards = partition(&input, 1, &HashMap::new(), Duration::from_secs(1)).unwrap();
        assert_eq!(shards[0].tests.len(), 3);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn partition_is_strict_and_deterministic(
                secs in proptest::collection::vec(0u64..100, 1..40),
                shard_count in 1usize..8,
            ) {
                let ids = ids(secs.len());
                let durations: HashMap<TestId, Duration> = ids
                    .iter()
                    .zip(&secs)
                    .map(|(id, s)| (id.clone(), Duration::from_secs(*s)))
                    .collect();

                let first = partition(&ids, shard_count, &durations, Duration::from_secs(1)).unwrap();
                let second = partition(&ids, shard_count, &durations, Duration::from_secs(1)).unwrap();
                prop_assert_eq!(&first, &second);

                let mut seen: Vec<TestId> = first.iter().flat_map(|s| s.tests.clone()).collect();
                let total = seen.len();
                seen.sort();
                seen.dedup();
                prop_assert_eq!(seen.len(), total);

                let mut expected = ids.clone();
                expected.sort();
                prop_assert_eq!(seen, expected);
            }
        }
    }
}
