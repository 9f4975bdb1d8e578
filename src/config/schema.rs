//! Configuration schema definitions for verdict.
//!
//! This module defines all configuration types that can be deserialized from
//! TOML configuration files. The schema uses serde for deserialization and a
//! tagged enum for framework selection.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── VerdictConfig          - Retry budget, sharding, history, run limits
//! ├── LauncherConfig         - How framework processes are started
//! ├── groups: name → GroupConfig
//! │   └── FrameworkConfig    - Tagged enum selecting the adapter
//! │       ├── Rspec
//! │       ├── Cucumber
//! │       ├── Playwright
//! │       ├── Cypress
//! │       └── Generic        - Custom shell commands + JUnit / JSON report
//! └── ReportConfig           - Output and reporting settings
//! ```
//!
//! # Command Templates
//!
//! Framework commands are templates split with shell-style quoting rules.
//! Two placeholders are recognized:
//!
//! | Placeholder | Replaced with |
//! |-------------|---------------|
//! | `{tests}` | Selectors of the tests to run, one argument each |
//! | `{result_path}` | Path of the framework's machine-readable report |
//!
//! `run_command` and `retry_command` must contain `{tests}`; otherwise a
//! retry round would re-run the whole suite.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::model::{RetryBudget, TestId};
use crate::framework::junit::JunitFormat;

/// Errors found while validating a parsed configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A setting has a value outside its allowed range.
    #[error("invalid value for `{field}`: {message}")]
    InvalidValue { field: String, message: String },

    /// No `[groups.*]` table was configured.
    #[error("at least one [groups.<name>.framework] table is required")]
    NoGroups,
}

impl ConfigError {
    fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Root configuration structure.
///
/// # TOML Structure
///
/// ```toml
/// [verdict]
/// max_attempts_per_test = 2
/// max_retries_per_run = 50
///
/// [launcher]
/// working_dir = "."
///
/// [groups.unit.framework]
/// type = "rspec"
///
/// [groups.features.framework]
/// type = "cucumber"
/// skip_tags = ["@skip", "@wip"]
///
/// [report]
/// output_dir = "test-results"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Core settings (retry budget, sharding, history, timeouts).
    #[serde(default)]
    pub verdict: VerdictConfig,

    /// How framework processes are launched.
    #[serde(default)]
    pub launcher: LauncherConfig,

    /// Named groups of tests, one adapter each. Groups run concurrently.
    #[serde(default)]
    pub groups: BTreeMap<String, GroupConfig>,

    /// Report configuration for output generation (optional, has defaults).
    #[serde(default)]
    pub report: ReportConfig,
}

impl Config {
    /// Checks invariants that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let v = &self.verdict;
        if v.max_attempts_per_test < 1 {
            return Err(ConfigError::invalid(
                "max_attempts_per_test",
                "must be at least 1",
            ));
        }
        if v.shard_count > 0 && v.shard_index >= v.shard_count {
            return Err(ConfigError::invalid(
                "shard_index",
                format!(
                    "{} is out of range for shard_count {}",
                    v.shard_index, v.shard_count
                ),
            ));
        }
        if v.run_timeout_secs == Some(0) {
            return Err(ConfigError::invalid("run_timeout_secs", "must be positive"));
        }
        for id in &v.muted {
            id.parse::<TestId>()
                .map_err(|e| ConfigError::invalid("muted", e.to_string()))?;
        }

        if self.groups.is_empty() {
            return Err(ConfigError::NoGroups);
        }
        for (name, group) in &self.groups {
            group.framework.validate(name)?;
        }
        Ok(())
    }

    /// Expands `~` and `$VAR` references in configured paths.
    pub fn expand_paths(&mut self) -> anyhow::Result<()> {
        if let Some(path) = &mut self.verdict.durations_file {
            *path = expand(path)?;
        }
        if let Some(path) = &mut self.launcher.working_dir {
            *path = expand(path)?;
        }
        self.report.output_dir = expand(&self.report.output_dir)?;
        Ok(())
    }
}

fn expand(path: &std::path::Path) -> anyhow::Result<PathBuf> {
    let raw = path.to_string_lossy();
    let expanded = shellexpand::full(&raw)
        .with_context(|| format!("Failed to expand path: {}", raw))?;
    Ok(PathBuf::from(expanded.as_ref()))
}

/// Core engine settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `max_attempts_per_test` | 1 (no retries) |
/// | `max_retries_per_run` | 100 |
/// | `shard_count` | 0 (no sharding) |
/// | `shard_index` | 0 |
/// | `fallback_duration_ms` | 1000 |
/// | `run_timeout_secs` | None |
/// | `durations_file` | None |
/// | `record_durations` | false |
/// | `stream_output` | false |
/// | `fail_on_no_tests` | false |
/// | `muted` | `[]` |
/// | `retry_muted` | true |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VerdictConfig {
    /// Attempts per test, including the first run. `1` disables retries.
    #[serde(default = "default_max_attempts")]
    pub max_attempts_per_test: u32,

    /// Total re-executions allowed across the whole run.
    ///
    /// When many tests fail at once (a broken build), retrying all of them
    /// wastes CI minutes. Tests still failing when this cap runs out are
    /// reported as failed with reason `retry_budget_exhausted`.
    #[serde(default = "default_max_retries_per_run")]
    pub max_retries_per_run: u32,

    /// Number of parallel agents sharing the suite. `0` disables sharding.
    #[serde(default)]
    pub shard_count: usize,

    /// Zero-based index of this agent's shard.
    #[serde(default)]
    pub shard_index: usize,

    /// Expected duration for tests without history, in milliseconds.
    #[serde(default = "default_fallback_duration_ms")]
    pub fallback_duration_ms: u64,

    /// Cancel the run after this many seconds. Unresolved tests are
    /// reported as failed with reason `run_cancelled`.
    pub run_timeout_secs: Option<u64>,

    /// JSON file of historical durations used for sharding.
    pub durations_file: Option<PathBuf>,

    /// Write observed durations back to `durations_file` after the run.
    #[serde(default)]
    pub record_durations: bool,

    /// Print framework output as it arrives.
    #[serde(default)]
    pub stream_output: bool,

    /// Treat a run that discovers no tests as a failure.
    #[serde(default)]
    pub fail_on_no_tests: bool,

    /// Tests whose failures are reported but do not fail the run.
    #[serde(default)]
    pub muted: Vec<String>,

    /// Retry failing muted tests like any other test. When off, a muted
    /// test runs once and never draws on `max_retries_per_run`.
    #[serde(default = "default_true")]
    pub retry_muted: bool,
}

impl VerdictConfig {
    pub fn retry_budget(&self) -> RetryBudget {
        RetryBudget::new(self.max_attempts_per_test, self.max_retries_per_run)
    }

    pub fn fallback_duration(&self) -> Duration {
        Duration::from_millis(self.fallback_duration_ms)
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_secs.map(Duration::from_secs)
    }

    /// Muted identifiers. Unparsable entries are rejected by validation.
    pub fn muted_ids(&self) -> Vec<TestId> {
        self.muted.iter().filter_map(|s| s.parse().ok()).collect()
    }
}

impl Default for VerdictConfig {
    fn default() -> Self {
        Self {
            max_attempts_per_test: default_max_attempts(),
            max_retries_per_run: default_max_retries_per_run(),
            shard_count: 0,
            shard_index: 0,
            fallback_duration_ms: default_fallback_duration_ms(),
            run_timeout_secs: None,
            durations_file: None,
            record_durations: false,
            stream_output: false,
            fail_on_no_tests: false,
            muted: Vec::new(),
            retry_muted: true,
        }
    }
}

fn default_max_attempts() -> u32 {
    1
}

fn default_max_retries_per_run() -> u32 {
    100
}

fn default_fallback_duration_ms() -> u64 {
    1000
}

/// Configuration for the local process launcher.
///
/// # Example
///
/// ```toml
/// [launcher]
/// working_dir = "/path/to/project"
/// shell = "/bin/bash"
///
/// [launcher.env]
/// RAILS_ENV = "test"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LauncherConfig {
    /// Working directory for spawned processes and relative report paths.
    ///
    /// If not specified, uses the current working directory.
    pub working_dir: Option<PathBuf>,

    /// Environment variables to set for all framework processes.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Shell used to run commands: `{shell} -c "{command}"`.
    ///
    /// Default: `/bin/sh`
    #[serde(default = "default_shell")]
    pub shell: String,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            working_dir: None,
            env: HashMap::new(),
            shell: default_shell(),
        }
    }
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

/// A named group of tests driven by one adapter.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GroupConfig {
    pub framework: FrameworkConfig,
}

/// Adapter selection, tagged by `type`.
///
/// | Type | Framework | Granularity |
/// |------|-----------|-------------|
/// | `rspec` | RSpec | example |
/// | `cucumber` | Cucumber | scenario |
/// | `playwright` | Playwright Test | test |
/// | `cypress` | Cypress | spec file |
/// | `generic` | anything with a JUnit or JSON report | as reported |
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FrameworkConfig {
    Rspec(RspecConfig),
    Cucumber(CucumberConfig),
    Playwright(PlaywrightConfig),
    Cypress(CypressConfig),
    Generic(GenericConfig),
}

impl FrameworkConfig {
    pub fn type_name(&self) -> &'static str {
        match self {
            FrameworkConfig::Rspec(_) => "rspec",
            FrameworkConfig::Cucumber(_) => "cucumber",
            FrameworkConfig::Playwright(_) => "playwright",
            FrameworkConfig::Cypress(_) => "cypress",
            FrameworkConfig::Generic(_) => "generic",
        }
    }

    fn validate(&self, group: &str) -> Result<(), ConfigError> {
        let (run, retry) = match self {
            FrameworkConfig::Rspec(c) => (&c.run_command, &c.retry_command),
            FrameworkConfig::Cucumber(c) => (&c.run_command, &c.retry_command),
            FrameworkConfig::Playwright(c) => (&c.run_command, &c.retry_command),
            FrameworkConfig::Cypress(c) => (&c.run_command, &c.retry_command),
            FrameworkConfig::Generic(c) => {
                if c.discover_command.trim().is_empty() {
                    return Err(ConfigError::invalid(
                        format!("groups.{group}.framework.discover_command"),
                        "must not be empty",
                    ));
                }
                (&c.run_command, &c.retry_command)
            }
        };

        for (field, template) in [("run_command", Some(run)), ("retry_command", retry.as_ref())] {
            let Some(template) = template else { continue };
            if !template.contains("{tests}") {
                return Err(ConfigError::invalid(
                    format!("groups.{group}.framework.{field}"),
                    "must contain the {tests} placeholder",
                ));
            }
            if let Err(e) = shell_words::split(template) {
                return Err(ConfigError::invalid(
                    format!("groups.{group}.framework.{field}"),
                    e.to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// RSpec adapter settings.
///
/// Discovery runs `--dry-run` with the JSON formatter, which lists every
/// example without executing any of them.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RspecConfig {
    #[serde(default = "default_rspec_discover")]
    pub discover_command: String,

    #[serde(default = "default_rspec_run")]
    pub run_command: String,

    /// Command used for retry rounds. Defaults to `run_command`.
    pub retry_command: Option<String>,

    /// Where the JSON formatter writes its report.
    #[serde(default = "default_rspec_result_path")]
    pub result_path: PathBuf,
}

impl Default for RspecConfig {
    fn default() -> Self {
        Self {
            discover_command: default_rspec_discover(),
            run_command: default_rspec_run(),
            retry_command: None,
            result_path: default_rspec_result_path(),
        }
    }
}

fn default_rspec_discover() -> String {
    "bundle exec rspec --dry-run --format json --out {result_path}".to_string()
}

fn default_rspec_run() -> String {
    "bundle exec rspec --format progress --format json --out {result_path} {tests}".to_string()
}

fn default_rspec_result_path() -> PathBuf {
    PathBuf::from("tmp/verdict-rspec.json")
}

/// Cucumber adapter settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CucumberConfig {
    #[serde(default = "default_cucumber_discover")]
    pub discover_command: String,

    #[serde(default = "default_cucumber_run")]
    pub run_command: String,

    /// Command used for retry rounds. Defaults to `run_command`.
    pub retry_command: Option<String>,

    #[serde(default = "default_cucumber_result_path")]
    pub result_path: PathBuf,

    /// Scenarios carrying any of these tags are skip-declared.
    #[serde(default = "default_skip_tags")]
    pub skip_tags: Vec<String>,

    /// Treat pending steps as failures, like `cucumber --strict`.
    #[serde(default)]
    pub strict: bool,
}

impl Default for CucumberConfig {
    fn default() -> Self {
        Self {
            discover_command: default_cucumber_discover(),
            run_command: default_cucumber_run(),
            retry_command: None,
            result_path: default_cucumber_result_path(),
            skip_tags: default_skip_tags(),
            strict: false,
        }
    }
}

fn default_cucumber_discover() -> String {
    "bundle exec cucumber --dry-run --format json --out {result_path}".to_string()
}

fn default_cucumber_run() -> String {
    "bundle exec cucumber --format progress --format json --out {result_path} {tests}".to_string()
}

fn default_cucumber_result_path() -> PathBuf {
    PathBuf::from("tmp/verdict-cucumber.json")
}

fn default_skip_tags() -> Vec<String> {
    vec!["@skip".to_string()]
}

/// Playwright Test adapter settings.
///
/// The JSON reporter's output location is passed through
/// `PLAYWRIGHT_JSON_OUTPUT_NAME`, so the templates only need
/// `--reporter=json`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PlaywrightConfig {
    #[serde(default = "default_playwright_discover")]
    pub discover_command: String,

    #[serde(default = "default_playwright_run")]
    pub run_command: String,

    /// Command used for retry rounds. Defaults to `run_command`.
    pub retry_command: Option<String>,

    #[serde(default = "default_playwright_result_path")]
    pub result_path: PathBuf,
}

impl Default for PlaywrightConfig {
    fn default() -> Self {
        Self {
            discover_command: default_playwright_discover(),
            run_command: default_playwright_run(),
            retry_command: None,
            result_path: default_playwright_result_path(),
        }
    }
}

fn default_playwright_discover() -> String {
    "npx playwright test --list --reporter=json".to_string()
}

fn default_playwright_run() -> String {
    "npx playwright test --reporter=json {tests}".to_string()
}

fn default_playwright_result_path() -> PathBuf {
    PathBuf::from("tmp/verdict-playwright.json")
}

/// Cypress adapter settings.
///
/// Cypress has no dry-run listing, so discovery globs spec files and each
/// spec file is one test.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CypressConfig {
    /// Glob of spec files, relative to the launcher working directory.
    #[serde(default = "default_cypress_pattern")]
    pub test_file_pattern: String,

    /// Glob of spec files to leave out.
    pub test_file_exclude_pattern: Option<String>,

    /// `{tests}` expands to a single comma-separated argument.
    #[serde(default = "default_cypress_run")]
    pub run_command: String,

    /// Command used for retry rounds. Defaults to `run_command`.
    pub retry_command: Option<String>,
}

impl Default for CypressConfig {
    fn default() -> Self {
        Self {
            test_file_pattern: default_cypress_pattern(),
            test_file_exclude_pattern: None,
            run_command: default_cypress_run(),
            retry_command: None,
        }
    }
}

fn default_cypress_pattern() -> String {
    "cypress/e2e/**/*.cy.{js,jsx,ts,tsx}".to_string()
}

fn default_cypress_run() -> String {
    "npx cypress run --spec {tests}".to_string()
}

/// Report format produced by a generic test command.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResultFormat {
    /// JUnit XML.
    #[default]
    Junit,
    /// JSON array of `{id, name, scope, location, file_name, result}`.
    TestEngine,
}

/// Settings for frameworks driven by custom shell commands.
///
/// # Protocol
///
/// - **discover_command**: prints one test id per line (`file::scope`);
///   lines starting with `#` are ignored
/// - **run_command**: uses `{tests}` (and optionally `{result_path}`)
/// - **result_file**: optional report; without it, results are inferred
///   from the exit code for every requested test
///
/// # Example: Jest
///
/// ```toml
/// [groups.js.framework]
/// type = "generic"
/// discover_command = "npx jest --listTests"
/// run_command = "npx jest --ci --reporters=jest-junit {tests}"
/// result_file = "junit.xml"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GenericConfig {
    pub discover_command: String,

    pub run_command: String,

    /// Command used for retry rounds. Defaults to `run_command`.
    pub retry_command: Option<String>,

    pub result_file: Option<PathBuf>,

    #[serde(default)]
    pub result_format: ResultFormat,

    /// How JUnit `classname`/`name` map back to discovered ids.
    #[serde(default)]
    pub junit_format: JunitFormat,
}

/// Report output configuration.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `output_dir` | `test-results` |
/// | `junit` | true |
/// | `junit_file` | `junit.xml` |
/// | `json` | false |
/// | `json_file` | `verdict.json` |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    /// Directory report files are written into.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Write a JUnit XML report.
    #[serde(default = "default_true")]
    pub junit: bool,

    /// JUnit file name inside `output_dir`.
    #[serde(default = "default_junit_file")]
    pub junit_file: String,

    /// Write the full run report as JSON.
    #[serde(default)]
    pub json: bool,

    /// JSON file name inside `output_dir`.
    #[serde(default = "default_json_file")]
    pub json_file: String,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            junit: true,
            junit_file: default_junit_file(),
            json: false,
            json_file: default_json_file(),
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("test-results")
}

fn default_true() -> bool {
    true
}

fn default_junit_file() -> String {
    "junit.xml".to_string()
}

fn default_json_file() -> String {
    "verdict.json".to_string()
}
