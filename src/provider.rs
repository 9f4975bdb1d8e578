//! Process invocation collaborator.
//!
//! The engine never spawns processes directly. It asks a [`Launcher`] to
//! run a [`Command`] and consumes the resulting [`OutputStream`] line by
//! line, which keeps adapters and the retry loop testable with a scripted
//! launcher and lets other execution backends be plugged in.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        Launcher                          │
//! │                                                          │
//! │  exec_stream(Command) ───► OutputStream                  │
//! │                              Stdout(..) / Stderr(..)     │
//! │                              ...                         │
//! │                              ExitCode(n)   (always last) │
//! │  exec(Command)        ───► ExecResult  (collected)       │
//! │  read_file(path)      ───► Option<String>                │
//! │  remove_file(path)                                       │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Dropping an [`OutputStream`] before it ends must terminate the
//! underlying process. The coordinator relies on this for cancellation.
//!
//! # Built-in Launchers
//!
//! | Launcher | Module | Description |
//! |----------|--------|-------------|
//! | Local | [`local`] | Run commands as local child processes via a shell |

pub mod local;

use std::path::Path;
use std::pin::Pin;
use std::time::Instant;

use async_trait::async_trait;
use futures::{Stream, StreamExt};

/// Result type for launcher operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Errors that can occur while launching commands or reading their files.
///
/// A command that runs and exits non-zero is NOT an error; its exit code is
/// reported through [`OutputLine::ExitCode`].
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The command could not be started.
    #[error("Failed to execute command: {0}")]
    ExecFailed(String),

    /// A result file exists but could not be read.
    #[error("Failed to read file: {0}")]
    ReadFailed(String),

    /// I/O error during file operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Launcher-specific error not covered by other variants.
    #[error("Launcher error: {0}")]
    Other(#[from] anyhow::Error),
}

/// A command to execute.
///
/// Commands are built using a fluent builder API and can be converted
/// to shell strings for execution.
///
/// # Example
///
/// ```
/// use verdict::provider::Command;
///
/// let cmd = Command::new("bundle")
///     .args(["exec", "rspec"])
///     .arg("spec/models/user_spec.rb[1:2]")
///     .working_dir("/app")
///     .env("RAILS_ENV", "test");
///
/// assert_eq!(cmd.program, "bundle");
/// assert_eq!(cmd.args.len(), 3);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// The program/executable to run.
    pub program: String,

    /// Arguments to pass to the program.
    pub args: Vec<String>,

    /// Working directory for command execution.
    ///
    /// If `None`, uses the launcher's default working directory.
    pub working_dir: Option<String>,

    /// Environment variables to set for this command.
    ///
    /// These are merged with (and override) the launcher's environment.
    pub env: Vec<(String, String)>,
}

impl Command {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
        }
    }

    /// Builds a command from a pre-split argv.
    ///
    /// Returns `None` for an empty argv.
    pub fn from_argv(argv: Vec<String>) -> Option<Self> {
        let mut parts = argv.into_iter();
        let program = parts.next()?;
        Some(Self::new(program).args(parts))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Converts the command to a shell-executable string.
    ///
    /// The program and arguments are escaped for shell execution.
    ///
    /// ```
    /// use verdict::provider::Command;
    /// let cmd = Command::new("echo").arg("hello world");
    /// assert_eq!(cmd.to_shell_string(), "echo 'hello world'");
    /// ```
    pub fn to_shell_string(&self) -> String {
        let mut parts = vec![shell_escape(&self.program)];
        for arg in &self.args {
            parts.push(shell_escape(arg));
        }
        parts.join(" ")
    }
}

/// Collected result of running a command to completion.
#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    /// Exit code of the command. A process killed by signal `n` reports
    /// `128 + n`.
    pub exit_code: i32,

    /// Captured standard output.
    pub stdout: String,

    /// Captured standard error.
    pub stderr: String,

    /// Wall-clock time the command took to execute.
    pub duration: std::time::Duration,
}

impl ExecResult {
    /// Returns `true` if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Appends one streamed line to the captured output.
    pub fn push_line(&mut self, line: &OutputLine) {
        match line {
            OutputLine::Stdout(s) => {
                self.stdout.push_str(s);
                self.stdout.push('\n');
            }
            OutputLine::Stderr(s) => {
                self.stderr.push_str(s);
                self.stderr.push('\n');
            }
            OutputLine::ExitCode(code) => self.exit_code = *code,
        }
    }
}

/// A single line of output from a streaming command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    /// A line from standard output.
    Stdout(String),
    /// A line from standard error.
    Stderr(String),
    /// The exit code of the command (yielded last, after all output).
    ExitCode(i32),
}

/// A stream of output lines from a running command.
pub type OutputStream = Pin<Box<dyn Stream<Item = OutputLine> + Send>>;

/// Injected capability for running framework processes.
///
/// # Thread Safety
///
/// Launchers must be `Send + Sync`; one launcher is shared by every group
/// of a run.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Starts `cmd` and streams its output.
    ///
    /// The stream ends with exactly one [`OutputLine::ExitCode`]. Dropping
    /// the stream early terminates the process.
    async fn exec_stream(&self, cmd: &Command) -> ProviderResult<OutputStream>;

    /// Reads a file produced by a command, relative to the launcher's
    /// working directory. Returns `Ok(None)` if the file does not exist.
    async fn read_file(&self, path: &Path) -> ProviderResult<Option<String>>;

    /// Removes a file if it exists.
    async fn remove_file(&self, path: &Path) -> ProviderResult<()>;

    /// Runs `cmd` to completion and collects its output.
    async fn exec(&self, cmd: &Command) -> ProviderResult<ExecResult> {
        let start = Instant::now();
        let mut stream = self.exec_stream(cmd).await?;
        let mut result = ExecResult::default();
        while let Some(line) = stream.next().await {
            result.push_line(&line);
        }
        result.duration = start.elapsed();
        Ok(result)
    }
}

/// Escape a string for use in a shell command.
fn shell_escape(s: &str) -> String {
    if !s.is_empty()
        && s.chars().all(|c| {
            c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | ':' | '=' | ',' | '@')
        })
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\\''"))
    }
}
