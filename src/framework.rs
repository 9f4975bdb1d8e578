//! Framework adapters.
//!
//! An adapter knows how to talk to one third-party test framework. It lists
//! tests without running them, builds the command that runs a subset of
//! them, and turns whatever the framework reports into canonical
//! [`Execution`]s. Everything after that point (classification, retries,
//! sharding, reporting) is framework-agnostic.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        TestFramework                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  discover(launcher) ─────────► Vec<DiscoveredTest>              │
//! │                                    │                            │
//! │                                    ▼                            │
//! │  produce_test_execution_command(&ids, retry) ──► Command        │
//! │                                    │                            │
//! │                                    ▼ (launcher.exec_stream)     │
//! │  output_parser() ◄──── stdout lines (streaming, optional)       │
//! │  parse_results(output, result_file) ──► Vec<Execution>         │
//! │                                                                 │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The loop that drives these hooks lives in
//! [`orchestrator::runner`](crate::orchestrator::runner).
//!
//! # Built-in Adapters
//!
//! | Adapter | Framework | Discovery | Result source |
//! |---------|-----------|-----------|---------------|
//! | [`rspec::RspecFramework`] | RSpec | `--dry-run --format json` | JSON formatter file |
//! | [`cucumber::CucumberFramework`] | Cucumber | `--dry-run --format json` | JSON formatter file |
//! | [`playwright::PlaywrightFramework`] | Playwright Test | `--list --reporter=json` | JSON reporter file |
//! | [`cypress::CypressFramework`] | Cypress | spec file glob | `(Results)` blocks on stdout |
//! | [`generic::GenericFramework`] | anything | custom command | JUnit XML or JSON |
//!
//! The set is closed: [`Adapter`] is an enum over the built-ins, selected by
//! the `type` field of a group's framework configuration.

pub mod cucumber;
pub mod cypress;
pub mod generic;
pub mod junit;
pub mod playwright;
pub mod rspec;

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::config::FrameworkConfig;
use crate::model::{DiscoveredTest, Execution, TestId};
use crate::provider::{Command, ExecResult, Launcher, ProviderError};

/// Result type for framework operations.
pub type FrameworkResult<T> = Result<T, FrameworkError>;

/// Errors that can occur during discovery, execution and result parsing.
///
/// A test that fails is never a `FrameworkError`; it is an [`Execution`]
/// with a failing status. These errors describe the framework itself
/// misbehaving.
#[derive(Debug, thiserror::Error)]
pub enum FrameworkError {
    /// The listing mechanism failed or produced unusable output.
    #[error("Failed to discover tests: {0}")]
    DiscoveryFailed(String),

    /// A report could not be interpreted.
    #[error("Failed to parse test output: {0}")]
    ParseError(String),

    /// A command template could not be turned into a command.
    #[error("Command execution failed: {0}")]
    ExecFailed(String),

    /// The framework process exited abnormally without a usable report.
    #[error("Framework process crashed (exit code {exit_code}): {message}")]
    AdapterCrash { exit_code: i32, message: String },

    /// I/O error reading files or directories.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The launcher could not run a command or read a file.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Other framework-related errors.
    #[error("Framework error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Incremental parser for frameworks that only report on stdout.
///
/// The runner feeds every stdout line in order; whatever executions a line
/// completes are returned immediately so they reach the retry loop while
/// the process is still running.
pub trait OutputParser: Send {
    fn feed(&mut self, line: &str) -> Vec<Execution>;
}

/// Capability contract for one test framework.
///
/// # Thread Safety
///
/// Frameworks must be `Send + Sync`; groups run concurrently.
#[async_trait]
pub trait TestFramework: Send + Sync {
    /// Short lowercase name used in logs.
    fn name(&self) -> &'static str;

    /// Enumerates tests without executing them.
    async fn discover(&self, launcher: &dyn Launcher) -> FrameworkResult<Vec<DiscoveredTest>>;

    /// Builds the command that runs exactly `tests`.
    ///
    /// `retry` selects the retry command template where one is configured.
    fn produce_test_execution_command(
        &self,
        tests: &[TestId],
        retry: bool,
    ) -> FrameworkResult<Command>;

    /// Report file written by the framework, relative to the launcher's
    /// working directory. The runner deletes it before every execution and
    /// reads it afterwards.
    fn result_path(&self) -> Option<&Path> {
        None
    }

    /// Streaming parser for stdout, for frameworks without a report file.
    fn output_parser(&self, _tests: &[TestId]) -> Option<Box<dyn OutputParser>> {
        None
    }

    /// Converts a finished execution into canonical executions.
    ///
    /// `result_file` holds the contents of [`result_path`](Self::result_path)
    /// if the framework wrote it. `streamed` lists ids already emitted by the
    /// output parser. Returns [`FrameworkError::AdapterCrash`] when the
    /// process died without anything usable.
    fn parse_results(
        &self,
        tests: &[TestId],
        output: &ExecResult,
        result_file: Option<&str>,
        streamed: &[TestId],
    ) -> FrameworkResult<Vec<Execution>>;
}

/// The closed set of built-in adapters.
pub enum Adapter {
    Rspec(rspec::RspecFramework),
    Cucumber(cucumber::CucumberFramework),
    Playwright(playwright::PlaywrightFramework),
    Cypress(cypress::CypressFramework),
    Generic(generic::GenericFramework),
}

impl Adapter {
    /// Builds the adapter selected by `config`.
    ///
    /// `root` is the directory relative paths resolve against (the
    /// launcher's working directory); only file-globbing discovery uses it.
    pub fn from_config(config: &FrameworkConfig, root: &Path) -> Self {
        match config {
            FrameworkConfig::Rspec(c) => Adapter::Rspec(rspec::RspecFramework::new(c.clone())),
            FrameworkConfig::Cucumber(c) => {
                Adapter::Cucumber(cucumber::CucumberFramework::new(c.clone()))
            }
            FrameworkConfig::Playwright(c) => {
                Adapter::Playwright(playwright::PlaywrightFramework::new(c.clone()))
            }
            FrameworkConfig::Cypress(c) => Adapter::Cypress(cypress::CypressFramework::new(
                c.clone(),
                root.to_path_buf(),
            )),
            FrameworkConfig::Generic(c) => {
                Adapter::Generic(generic::GenericFramework::new(c.clone()))
            }
        }
    }

    fn inner(&self) -> &dyn TestFramework {
        match self {
            Adapter::Rspec(f) => f,
            Adapter::Cucumber(f) => f,
            Adapter::Playwright(f) => f,
            Adapter::Cypress(f) => f,
            Adapter::Generic(f) => f,
        }
    }
}

#[async_trait]
impl TestFramework for Adapter {
    fn name(&self) -> &'static str {
        self.inner().name()
    }

    async fn discover(&self, launcher: &dyn Launcher) -> FrameworkResult<Vec<DiscoveredTest>> {
        self.inner().discover(launcher).await
    }

    fn produce_test_execution_command(
        &self,
        tests: &[TestId],
        retry: bool,
    ) -> FrameworkResult<Command> {
        self.inner().produce_test_execution_command(tests, retry)
    }

    fn result_path(&self) -> Option<&Path> {
        self.inner().result_path()
    }

    fn output_parser(&self, tests: &[TestId]) -> Option<Box<dyn OutputParser>> {
        self.inner().output_parser(tests)
    }

    fn parse_results(
        &self,
        tests: &[TestId],
        output: &ExecResult,
        result_file: Option<&str>,
        streamed: &[TestId],
    ) -> FrameworkResult<Vec<Execution>> {
        self.inner()
            .parse_results(tests, output, result_file, streamed)
    }
}

/// Expands a command template into a [`Command`].
///
/// The template is split with shell quoting rules. A word that is exactly
/// `{tests}` becomes one argument per selector. A word that merely contains
/// `{tests}` (for example inside `sh -c '...'`) gets the selectors
/// shell-quoted and space-joined in place. `{result_path}` is replaced
/// inside any word.
///
/// ```
/// use std::path::Path;
/// use verdict::framework::render_command;
///
/// let cmd = render_command(
///     "bundle exec rspec --out {result_path} {tests}",
///     &["spec/a_spec.rb[1:1]".to_string(), "spec/b_spec.rb[2]".to_string()],
///     Some(Path::new("tmp/out.json")),
/// )
/// .unwrap();
///
/// assert_eq!(cmd.program, "bundle");
/// assert_eq!(
///     cmd.args,
///     vec!["exec", "rspec", "--out", "tmp/out.json", "spec/a_spec.rb[1:1]", "spec/b_spec.rb[2]"]
/// );
/// ```
pub fn render_command(
    template: &str,
    selectors: &[String],
    result_path: Option<&Path>,
) -> FrameworkResult<Command> {
    let words = shell_words::split(template)
        .map_err(|e| FrameworkError::ExecFailed(format!("{}: {}", template, e)))?;

    let result_path = result_path.map(|p| p.to_string_lossy().into_owned());
    let quoted = selectors
        .iter()
        .map(|s| shell_words::quote(s).into_owned())
        .collect::<Vec<_>>()
        .join(" ");

    let mut argv = Vec::with_capacity(words.len() + selectors.len());
    for word in words {
        if word == "{tests}" {
            argv.extend(selectors.iter().cloned());
            continue;
        }
        let mut word = word;
        if word.contains("{tests}") {
            word = word.replace("{tests}", &quoted);
        }
        if let Some(path) = &result_path {
            word = word.replace("{result_path}", path);
        }
        argv.push(word);
    }

    Command::from_argv(argv)
        .ok_or_else(|| FrameworkError::ExecFailed(format!("empty command template: {:?}", template)))
}

/// Runs a discovery command and returns its collected output.
///
/// Fails with [`FrameworkError::DiscoveryFailed`] on a non-zero exit.
pub(crate) async fn run_discovery(
    launcher: &dyn Launcher,
    cmd: &Command,
) -> FrameworkResult<ExecResult> {
    tracing::debug!("Discovery command: {}", cmd.to_shell_string());

    let output = launcher
        .exec(cmd)
        .await
        .map_err(|e| FrameworkError::DiscoveryFailed(e.to_string()))?;

    if !output.stderr.is_empty() {
        tracing::debug!("Discovery stderr:\n{}", output.stderr);
    }

    if !output.success() {
        return Err(FrameworkError::DiscoveryFailed(format!(
            "`{}` exited with code {}: {}",
            cmd.to_shell_string(),
            output.exit_code,
            output.stderr.trim()
        )));
    }

    Ok(output)
}

/// Reads a report written by a discovery command, then removes it.
pub(crate) async fn take_discovery_report(
    launcher: &dyn Launcher,
    path: &Path,
) -> FrameworkResult<String> {
    let content = launcher.read_file(path).await?.ok_or_else(|| {
        FrameworkError::DiscoveryFailed(format!("no report written to {}", path.display()))
    })?;
    launcher.remove_file(path).await?;
    Ok(content)
}

/// The error returned when a process produced no usable report.
pub(crate) fn crash(output: &ExecResult, what: &str) -> FrameworkError {
    let tail: Vec<&str> = output.stderr.lines().rev().take(5).collect();
    let tail: Vec<&str> = tail.into_iter().rev().collect();
    FrameworkError::AdapterCrash {
        exit_code: output.exit_code,
        message: if tail.is_empty() {
            what.to_string()
        } else {
            format!("{}: {}", what, tail.join("\n"))
        },
    }
}

/// A scratch path for discovery reports, unique per call.
pub(crate) fn scratch_path(prefix: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{}-{}.json", prefix, uuid::Uuid::new_v4()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_splices_selectors_as_separate_args() {
        let cmd = render_command(
            "npx playwright test --reporter=json {tests}",
            &["a.spec.ts:3".into(), "b spec.ts:9".into()],
            None,
        )
        .unwrap();
        assert_eq!(cmd.program, "npx");
        assert_eq!(
            cmd.args,
            vec!["playwright", "test", "--reporter=json", "a.spec.ts:3", "b spec.ts:9"]
        );
    }

    #[test]
    fn test_render_quotes_selectors_inside_a_word() {
        let cmd = render_command(
            "sh -c './run.sh {tests} > out.log'",
            &["it's.rb".into(), "plain.rb".into()],
            None,
        )
        .unwrap();
        assert_eq!(cmd.args, vec!["-c", "./run.sh 'it'\\''s.rb' plain.rb > out.log"]);
    }

    #[test]
    fn test_render_replaces_result_path_within_words() {
        let cmd = render_command(
            "cucumber --out={result_path} {tests}",
            &["features/a.feature:3".into()],
            Some(Path::new("tmp/c.json")),
        )
        .unwrap();
        assert_eq!(cmd.args, vec!["--out=tmp/c.json", "features/a.feature:3"]);
    }

    #[test]
    fn test_render_rejects_bad_templates() {
        assert!(render_command("", &[], None).is_err());
        assert!(render_command("rspec 'unterminated", &[], None).is_err());
    }

    #[test]
    fn test_crash_keeps_stderr_tail() {
        let output = ExecResult {
            exit_code: 137,
            stderr: "one\ntwo\n".into(),
            ..Default::default()
        };
        let FrameworkError::AdapterCrash { exit_code, message } = crash(&output, "no report")
        else {
            panic!("expected crash");
        };
        assert_eq!(exit_code, 137);
        assert_eq!(message, "no report: one\ntwo");
    }
}
