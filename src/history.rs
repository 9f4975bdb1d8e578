//! File-backed historical duration store.
//!
//! Durations are kept as a JSON object mapping test identifiers to seconds:
//!
//! ```json
//! {
//!   "spec/models/user_spec.rb::1:1": 0.42,
//!   "features/login.feature::12": 3.1
//! }
//! ```
//!
//! The partitioner reads it through [`DurationSource`]. After a run the
//! coordinator can fold observed durations back in with
//! [`DurationStore::record`], so the next run balances shards on fresher
//! data.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use verdict::history::DurationStore;
//! use verdict::partition::DurationSource;
//! use verdict::model::TestId;
//!
//! let store = DurationStore::load(Path::new(".verdict/durations.json"));
//! let id: TestId = "spec/a_spec.rb::1:1".parse().unwrap();
//! if let Some(d) = store.duration_of(&id) {
//!     println!("expected {:?}", d);
//! }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::model::{ClassifiedResult, TestId};
use crate::partition::DurationSource;

/// Historical durations keyed by test identifier.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DurationStore {
    entries: BTreeMap<TestId, f64>,
}

impl DurationStore {
    /// Loads the store from `path`.
    ///
    /// A missing or unreadable file yields an empty store; having no history
    /// is an expected state, not an error.
    pub fn load(path: &Path) -> Self {
        tracing::debug!("Loading duration history from: {}", path.display());

        if !path.exists() {
            tracing::debug!("Duration history does not exist, starting empty");
            return Self::default();
        }

        match fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<BTreeMap<TestId, f64>>(&contents) {
                Ok(entries) => {
                    tracing::debug!("Loaded {} duration entries", entries.len());
                    Self { entries }
                }
                Err(e) => {
                    tracing::warn!("Failed to parse duration history, starting empty: {}", e);
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read duration history, starting empty: {}", e);
                Self::default()
            }
        }
    }

    /// Writes the store to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        tracing::debug!("Saving duration history to: {}", path.display());

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create history directory: {}", parent.display())
            })?;
        }

        let contents = serde_json::to_string_pretty(&self.entries)
            .context("Failed to serialize duration history")?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write duration history: {}", path.display()))?;

        tracing::debug!("Saved {} duration entries", self.entries.len());
        Ok(())
    }

    /// Sets the duration of one test, replacing any previous entry.
    pub fn insert(&mut self, id: TestId, duration: Duration) {
        self.entries.insert(id, duration.as_secs_f64());
    }

    /// Records the duration of the last attempt of every executed result.
    ///
    /// Tests that never ran (skipped, declared pending) keep their previous
    /// entry.
    pub fn record(&mut self, results: &[ClassifiedResult]) {
        for result in results {
            if let Some(attempt) = result.last_attempt()
                && !attempt.duration.is_zero()
            {
                self.insert(result.id.clone(), attempt.duration);
            }
        }
    }

    /// Number of tests with a recorded duration.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no durations are recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl DurationSource for DurationStore {
    fn duration_of(&self, id: &TestId) -> Option<Duration> {
        self.entries
            .get(id)
            .and_then(|secs| Duration::try_from_secs_f64(*secs).ok())
    }
}
