//! One framework process invocation, consumed as a stream of executions.
//!
//! [`execute`] builds an [`ExecutionStream`] for a subset of tests. Nothing
//! runs until the first call to [`next`](ExecutionStream::next); from then
//! on, executions are handed out as soon as they are known. Executions from
//! the adapter's [`OutputParser`] arrive while the process is still
//! running. Executions parsed from the report file arrive after it exits.
//!
//! ```text
//!   next() ──► start: delete stale report, build command, exec_stream
//!                │
//!                ▼
//!   next() ──► stdout line ──► OutputParser::feed ──► Some(Execution)
//!   next() ──► ...
//!                │ (exit)
//!                ▼
//!   next() ──► read report ──► parse_results ──► Some(Execution) ...
//!   next() ──► None
//!
//!   into_end() ──► RoundEnd::{Completed, Crashed, Cancelled}
//! ```
//!
//! A stream is finite and cannot be restarted. Cancelling its token drops
//! the process stream, which terminates the child.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::framework::{FrameworkError, OutputParser, TestFramework};
use crate::model::{Execution, TestId};
use crate::provider::{ExecResult, Launcher, OutputLine, OutputStream};

/// Callback function for streaming test output.
///
/// Called for each line of output during execution with the name of the
/// group the process belongs to.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use verdict::orchestrator::OutputCallback;
/// use verdict::provider::OutputLine;
///
/// let callback: OutputCallback = Arc::new(|group, line| {
///     match line {
///         OutputLine::Stdout(s) => println!("[{}] {}", group, s),
///         OutputLine::Stderr(s) => eprintln!("[{}] {}", group, s),
///         OutputLine::ExitCode(_) => {}
///     }
/// });
/// ```
pub type OutputCallback = Arc<dyn Fn(&str, &OutputLine) + Send + Sync>;

/// How an invocation ended.
#[derive(Debug)]
pub enum RoundEnd {
    /// The process exited and its results were parsed.
    Completed,
    /// The process could not run or left nothing usable behind.
    Crashed(FrameworkError),
    /// The cancellation token fired before the process exited.
    Cancelled,
}

enum State {
    NotStarted,
    Running(OutputStream),
    Finished,
}

enum Step {
    Line(Option<OutputLine>),
    Cancelled,
}

/// Lazy stream of executions from one framework invocation.
pub struct ExecutionStream<'a> {
    framework: &'a dyn TestFramework,
    launcher: &'a dyn Launcher,
    tests: Vec<TestId>,
    retry: bool,
    label: String,
    cancel: CancellationToken,
    output_callback: Option<OutputCallback>,

    state: State,
    parser: Option<Box<dyn OutputParser>>,
    output: ExecResult,
    started: Option<Instant>,
    streamed: Vec<TestId>,
    buffered: VecDeque<Execution>,
    end: Option<RoundEnd>,
}

/// Prepares one invocation of `framework` restricted to `tests`.
///
/// `retry` selects the framework's retry command template.
pub fn execute<'a>(
    framework: &'a dyn TestFramework,
    launcher: &'a dyn Launcher,
    tests: &[TestId],
    retry: bool,
) -> ExecutionStream<'a> {
    ExecutionStream {
        framework,
        launcher,
        tests: tests.to_vec(),
        retry,
        label: framework.name().to_string(),
        cancel: CancellationToken::new(),
        output_callback: None,
        state: State::NotStarted,
        parser: None,
        output: ExecResult::default(),
        started: None,
        streamed: Vec::new(),
        buffered: VecDeque::new(),
        end: None,
    }
}

impl<'a> ExecutionStream<'a> {
    /// Sets a cancellation token for early termination.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Sets a callback that sees every output line, labelled with `label`.
    pub fn with_output_callback(mut self, label: impl Into<String>, callback: OutputCallback) -> Self {
        self.label = label.into();
        self.output_callback = Some(callback);
        self
    }

    /// Returns the next execution, or `None` once the invocation is over.
    pub async fn next(&mut self) -> Option<Execution> {
        loop {
            if let Some(execution) = self.buffered.pop_front() {
                return Some(execution);
            }

            let step = match &mut self.state {
                State::Finished => return None,
                State::NotStarted => {
                    match self.start().await {
                        Ok(stream) => self.state = State::Running(stream),
                        Err(e) => {
                            self.end = Some(RoundEnd::Crashed(e));
                            self.state = State::Finished;
                        }
                    }
                    continue;
                }
                State::Running(stream) => {
                    select! {
                        biased;
                        _ = self.cancel.cancelled() => Step::Cancelled,
                        line = stream.next() => Step::Line(line),
                    }
                }
            };

            match step {
                Step::Cancelled => {
                    debug!("{}: execution cancelled", self.label);
                    self.state = State::Finished;
                    self.end = Some(RoundEnd::Cancelled);
                }
                Step::Line(Some(line)) => self.handle_line(line),
                Step::Line(None) => {
                    self.state = State::Finished;
                    self.finish().await;
                }
            }
        }
    }

    /// Consumes the stream and reports how the invocation ended.
    pub fn into_end(self) -> RoundEnd {
        self.end.unwrap_or(RoundEnd::Completed)
    }

    async fn start(&mut self) -> Result<OutputStream, FrameworkError> {
        let cmd = self
            .framework
            .produce_test_execution_command(&self.tests, self.retry)?;

        // A report left over from an earlier round must not be mistaken for
        // this one's.
        if let Some(path) = self.framework.result_path() {
            self.launcher.remove_file(path).await?;
        }

        self.parser = self.framework.output_parser(&self.tests);
        self.started = Some(Instant::now());

        debug!(
            "{}: running {} test(s): {}",
            self.label,
            self.tests.len(),
            cmd.to_shell_string()
        );
        Ok(self.launcher.exec_stream(&cmd).await?)
    }

    fn handle_line(&mut self, line: OutputLine) {
        if let Some(callback) = &self.output_callback {
            callback(&self.label, &line);
        }
        if let (OutputLine::Stdout(text), Some(parser)) = (&line, self.parser.as_mut()) {
            for execution in parser.feed(text) {
                self.streamed.push(execution.id.clone());
                self.buffered.push_back(execution);
            }
        }
        self.output.push_line(&line);
    }

    async fn finish(&mut self) {
        if let Some(started) = self.started {
            self.output.duration = started.elapsed();
        }
        debug!(
            "{}: exited with code {} after {:?}",
            self.label, self.output.exit_code, self.output.duration
        );

        let result_file = match self.framework.result_path() {
            Some(path) => match self.launcher.read_file(path).await {
                Ok(content) => content,
                Err(e) => {
                    tracing::warn!("{}: cannot read {}: {}", self.label, path.display(), e);
                    None
                }
            },
            None => None,
        };

        match self.framework.parse_results(
            &self.tests,
            &self.output,
            result_file.as_deref(),
            &self.streamed,
        ) {
            Ok(executions) => {
                self.buffered.extend(executions);
                self.end = Some(RoundEnd::Completed);
            }
            Err(e) => self.end = Some(RoundEnd::Crashed(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::config::{CypressConfig, GenericConfig, ResultFormat};
    use crate::framework::cypress::CypressFramework;
    use crate::framework::generic::GenericFramework;
    use crate::framework::junit::JunitFormat;
    use crate::model::RawStatus;
    use crate::testing::{ScriptedLauncher, ScriptedRun};

    fn generic_config(result_file: Option<&str>) -> GenericConfig {
        GenericConfig {
            discover_command: "./list.sh".into(),
            run_command: "./run.sh {tests}".into(),
            retry_command: None,
            result_file: result_file.map(Into::into),
            result_format: ResultFormat::Junit,
            junit_format: JunitFormat::Default,
        }
    }

    fn generic(result_file: Option<&str>) -> GenericFramework {
        GenericFramework::new(generic_config(result_file))
    }

    async fn drain(stream: &mut ExecutionStream<'_>) -> Vec<Execution> {
        let mut out = Vec::new();
        while let Some(execution) = stream.next().await {
            out.push(execution);
        }
        out
    }

    #[tokio::test]
    async fn test_report_file_is_parsed_after_exit() {
        let launcher = ScriptedLauncher::new();
        launcher.on_command("run.sh", |_| {
            ScriptedRun::exit(1).file(
                "junit.xml",
                r#"<testsuite>
                     <testcase name="a::1"/>
                     <testcase name="a::2"><failure message="boom"/></testcase>
                   </testsuite>"#,
            )
        });
        let framework = generic(Some("junit.xml"));
        let ids = [TestId::new("a", "1"), TestId::new("a", "2")];

        let mut stream = execute(&framework, &launcher, &ids, false);
        let execs = drain(&mut stream).await;
        assert_eq!(execs.len(), 2);
        assert_eq!(execs[1].status, RawStatus::RanFailed);
        assert!(matches!(stream.into_end(), RoundEnd::Completed));
    }

    #[tokio::test]
    async fn test_stale_report_is_removed_before_running() {
        let launcher = ScriptedLauncher::new();
        launcher.write_file("junit.xml", "<testsuite><testcase name=\"a::1\"/></testsuite>");
        launcher.on_command("run.sh", |_| ScriptedRun::exit(0));
        let framework = generic(Some("junit.xml"));

        let mut stream = execute(&framework, &launcher, &[TestId::new("a", "1")], false);
        assert!(drain(&mut stream).await.is_empty());
        assert!(matches!(stream.into_end(), RoundEnd::Crashed(_)));
    }

    #[tokio::test]
    async fn test_streamed_results_arrive_before_exit() {
        let launcher = ScriptedLauncher::new();
        launcher.on_command("cypress", |_| {
            ScriptedRun::exit(0).stdout(
                "  (Results)\n  │ Tests: 1 │\n  │ Passing: 1 │\n  │ Spec Ran: a.cy.js │",
            )
        });
        let framework = CypressFramework::new(CypressConfig::default(), ".".into());
        let ids = [TestId::file_only("a.cy.js"), TestId::file_only("b.cy.js")];

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut stream = execute(&framework, &launcher, &ids, false).with_output_callback(
            "e2e",
            Arc::new(move |label: &str, line: &OutputLine| {
                sink.lock().unwrap().push(format!("{}: {:?}", label, line));
            }),
        );

        let first = stream.next().await.unwrap();
        assert_eq!(first.id, ids[0]);
        let rest = drain(&mut stream).await;
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, ids[1]);
        assert!(seen.lock().unwrap().iter().all(|l| l.starts_with("e2e: ")));
    }

    #[tokio::test]
    async fn test_cancellation_stops_a_hung_process() {
        let launcher = ScriptedLauncher::new();
        launcher.on_command("run.sh", |_| ScriptedRun::exit(0).stdout("starting").hang());
        let framework = generic(None);
        let token = CancellationToken::new();
        token.cancel();

        let mut stream = execute(&framework, &launcher, &[TestId::new("a", "1")], false)
            .with_cancellation_token(token);
        assert!(drain(&mut stream).await.is_empty());
        assert!(matches!(stream.into_end(), RoundEnd::Cancelled));
    }

    #[tokio::test]
    async fn test_unmatched_command_fails_every_test() {
        let launcher = ScriptedLauncher::new();
        let framework = generic(None);
        let mut stream = execute(&framework, &launcher, &[TestId::new("a", "1")], false);
        let execs = drain(&mut stream).await;
        // Unmatched commands exit 127, which the exit-code fallback reports
        // as failures rather than a crash.
        assert_eq!(execs.len(), 1);
        assert_eq!(execs[0].status, RawStatus::RanFailed);
        assert!(matches!(stream.into_end(), RoundEnd::Completed));
    }

    #[tokio::test]
    async fn test_retry_selects_retry_template() {
        let launcher = ScriptedLauncher::new();
        launcher.on_command("retry.sh", |_| ScriptedRun::exit(0));
        let framework = GenericFramework::new(GenericConfig {
            retry_command: Some("./retry.sh {tests}".into()),
            ..generic_config(None)
        });
        let mut stream = execute(&framework, &launcher, &[TestId::new("a", "1")], true);
        let execs = drain(&mut stream).await;
        assert_eq!(execs[0].status, RawStatus::RanPassed);
        assert_eq!(launcher.calls()[0].program, "./retry.sh");
    }
}
