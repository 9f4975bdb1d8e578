//! A scripted [`Launcher`] for unit tests.
//!
//! Commands are matched by substring against their shell form. The first
//! registered pattern that matches decides the run; unmatched commands exit
//! with 127 like a missing binary would. Files "written" by a run live in
//! an in-memory map that `read_file` and `remove_file` operate on.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use crate::provider::{Command, Launcher, OutputLine, OutputStream, ProviderResult};

type Handler = Box<dyn Fn(&Command) -> ScriptedRun + Send + Sync>;

/// What one scripted command does.
#[derive(Debug, Clone, Default)]
pub struct ScriptedRun {
    pub exit_code: i32,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub files: Vec<(PathBuf, String)>,
    /// Keep the stream open after the output, as a process that never ends.
    pub hang: bool,
}

impl ScriptedRun {
    pub fn exit(exit_code: i32) -> Self {
        Self {
            exit_code,
            ..Default::default()
        }
    }

    /// Appends stdout; multi-line text is split into lines.
    pub fn stdout(mut self, text: &str) -> Self {
        self.stdout.extend(text.lines().map(str::to_string));
        self
    }

    pub fn stderr(mut self, text: &str) -> Self {
        self.stderr.extend(text.lines().map(str::to_string));
        self
    }

    pub fn file(mut self, path: impl Into<PathBuf>, content: impl Into<String>) -> Self {
        self.files.push((path.into(), content.into()));
        self
    }

    pub fn hang(mut self) -> Self {
        self.hang = true;
        self
    }
}

impl From<(i32, Vec<(String, String)>)> for ScriptedRun {
    fn from((exit_code, files): (i32, Vec<(String, String)>)) -> Self {
        files
            .into_iter()
            .fold(ScriptedRun::exit(exit_code), |run, (path, content)| {
                run.file(path, content)
            })
    }
}

#[derive(Default)]
pub struct ScriptedLauncher {
    handlers: Mutex<Vec<(String, Handler)>>,
    files: Mutex<HashMap<PathBuf, String>>,
    calls: Mutex<Vec<Command>>,
}

impl ScriptedLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_command<F, R>(&self, pattern: &str, handler: F)
    where
        F: Fn(&Command) -> R + Send + Sync + 'static,
        R: Into<ScriptedRun>,
    {
        self.handlers
            .lock()
            .unwrap()
            .push((pattern.to_string(), Box::new(move |cmd| handler(cmd).into())));
    }

    pub fn write_file(&self, path: impl Into<PathBuf>, content: impl Into<String>) {
        self.files
            .lock()
            .unwrap()
            .insert(path.into(), content.into());
    }

    pub fn file(&self, path: impl AsRef<Path>) -> Option<String> {
        self.files.lock().unwrap().get(path.as_ref()).cloned()
    }

    /// Every command launched so far, in order.
    pub fn calls(&self) -> Vec<Command> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Launcher for ScriptedLauncher {
    async fn exec_stream(&self, cmd: &Command) -> ProviderResult<OutputStream> {
        self.calls.lock().unwrap().push(cmd.clone());

        let shell = cmd.to_shell_string();
        let run = {
            let handlers = self.handlers.lock().unwrap();
            handlers
                .iter()
                .find(|(pattern, _)| shell.contains(pattern.as_str()))
                .map(|(_, handler)| handler(cmd))
                .unwrap_or_else(|| {
                    ScriptedRun::exit(127).stderr(&format!("{}: command not found", cmd.program))
                })
        };

        {
            let mut files = self.files.lock().unwrap();
            for (path, content) in &run.files {
                files.insert(path.clone(), content.clone());
            }
        }

        let mut lines: Vec<OutputLine> = run.stdout.into_iter().map(OutputLine::Stdout).collect();
        lines.extend(run.stderr.into_iter().map(OutputLine::Stderr));
        let output = stream::iter(lines);

        if run.hang {
            return Ok(Box::pin(output.chain(stream::pending())));
        }
        Ok(Box::pin(
            output.chain(stream::iter([OutputLine::ExitCode(run.exit_code)])),
        ))
    }

    async fn read_file(&self, path: &Path) -> ProviderResult<Option<String>> {
        Ok(self.files.lock().unwrap().get(path).cloned())
    }

    async fn remove_file(&self, path: &Path) -> ProviderResult<()> {
        self.files.lock().unwrap().remove(path);
        Ok(())
    }
}
