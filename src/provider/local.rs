//! Local process launcher.
//!
//! Runs every command as a child process through a POSIX shell
//! (`{shell} -c "{command}"`), so pipes and redirects in configured
//! command templates work as written.
//!
//! | Feature | Support |
//! |---------|---------|
//! | Isolation | None (shared filesystem and network) |
//! | Streaming output | Yes, stdout and stderr merged line by line |
//! | Cancellation | Child is killed when the output stream is dropped |
//! | Signals | Killed by signal `n` reports exit code `128 + n` |
//!
//! # Example Configuration
//!
//! ```toml
//! [launcher]
//! working_dir = "/path/to/project"
//! shell = "/bin/bash"
//!
//! [launcher.env]
//! RAILS_ENV = "test"
//! ```

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};

use super::{Command, Launcher, OutputLine, OutputStream, ProviderError, ProviderResult};
use crate::config::LauncherConfig;

/// Launcher that runs commands as local child processes.
pub struct LocalLauncher {
    working_dir: PathBuf,
    env: Vec<(String, String)>,
    shell: String,
}

impl LocalLauncher {
    /// Creates a launcher from configuration.
    ///
    /// Without a configured working directory the current directory is used.
    ///
    /// ```
    /// use verdict::config::LauncherConfig;
    /// use verdict::provider::local::LocalLauncher;
    ///
    /// let launcher = LocalLauncher::new(LauncherConfig {
    ///     working_dir: Some("/app".into()),
    ///     shell: "/bin/bash".to_string(),
    ///     ..Default::default()
    /// });
    /// assert_eq!(launcher.working_dir(), std::path::Path::new("/app"));
    /// ```
    pub fn new(config: LauncherConfig) -> Self {
        let working_dir = config
            .working_dir
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));

        let mut env: Vec<(String, String)> = config.env.into_iter().collect();
        env.sort();

        Self {
            working_dir,
            env,
            shell: config.shell,
        }
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.working_dir.join(path)
        }
    }
}

#[async_trait]
impl Launcher for LocalLauncher {
    async fn exec_stream(&self, cmd: &Command) -> ProviderResult<OutputStream> {
        let shell_cmd = cmd.to_shell_string();
        tracing::debug!("Launching: {}", shell_cmd);

        let mut process = tokio::process::Command::new(&self.shell);
        process.arg("-c").arg(&shell_cmd);
        process.current_dir(&self.working_dir);

        for (key, value) in &self.env {
            process.env(key, value);
        }
        for (key, value) in &cmd.env {
            process.env(key, value);
        }

        if let Some(dir) = &cmd.working_dir {
            process.current_dir(self.resolve(Path::new(dir)));
        }

        process.stdin(Stdio::null());
        process.stdout(Stdio::piped());
        process.stderr(Stdio::piped());
        process.kill_on_drop(true);

        let mut child = process
            .spawn()
            .map_err(|e| ProviderError::ExecFailed(format!("{}: {}", shell_cmd, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProviderError::ExecFailed("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ProviderError::ExecFailed("stderr not captured".to_string()))?;

        let stdout_stream = tokio_stream::wrappers::LinesStream::new(BufReader::new(stdout).lines())
            .map(|line: Result<String, std::io::Error>| OutputLine::Stdout(line.unwrap_or_default()));

        let stderr_stream = tokio_stream::wrappers::LinesStream::new(BufReader::new(stderr).lines())
            .map(|line: Result<String, std::io::Error>| OutputLine::Stderr(line.unwrap_or_default()));

        // Both pipes close before the exit status is collected, so the exit
        // code is always the final item. The child lives inside the stream
        // and is killed if the stream is dropped early.
        let exit = stream::once(async move {
            match child.wait().await {
                Ok(status) => OutputLine::ExitCode(exit_code(status)),
                Err(e) => {
                    tracing::warn!("Failed to wait for child process: {}", e);
                    OutputLine::ExitCode(-1)
                }
            }
        });

        Ok(Box::pin(stream::select(stdout_stream, stderr_stream).chain(exit)))
    }

    async fn read_file(&self, path: &Path) -> ProviderResult<Option<String>> {
        let path = self.resolve(path);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ProviderError::ReadFailed(format!(
                "{}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn remove_file(&self, path: &Path) -> ProviderResult<()> {
        let path = self.resolve(path);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Maps a process exit status to a shell-style exit code.
#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn launcher(dir: &Path) -> LocalLauncher {
        LocalLauncher::new(LauncherConfig {
            working_dir: Some(dir.to_path_buf()),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_exec_collects_output_and_exit_code() {
        let dir = TempDir::new().unwrap();
        let launcher = launcher(dir.path());
        let cmd = Command::new("sh")
            .arg("-c")
            .arg("echo out; echo err >&2; exit 3");

        let result = launcher.exec(&cmd).await.unwrap();
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.stdout, "out\n");
        assert_eq!(result.stderr, "err\n");
    }

    #[tokio::test]
    async fn test_exit_code_is_last_line() {
        let dir = TempDir::new().unwrap();
        let launcher = launcher(dir.path());
        let mut stream = launcher
            .exec_stream(&Command::new("printf").arg("a\\nb\\n"))
            .await
            .unwrap();

        let mut lines = Vec::new();
        while let Some(line) = stream.next().await {
            lines.push(line);
        }
        assert_eq!(lines.last(), Some(&OutputLine::ExitCode(0)));
        assert_eq!(lines.len(), 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_signal_exit_code() {
        let dir = TempDir::new().unwrap();
        let launcher = launcher(dir.path());
        let cmd = Command::new("sh").arg("-c").arg("kill -TERM $$");
        let result = launcher.exec(&cmd).await.unwrap();
        assert_eq!(result.exit_code, 128 + 15);
    }

    #[tokio::test]
    async fn test_read_and_remove_file() {
        let dir = TempDir::new().unwrap();
        let launcher = launcher(dir.path());
        let path = Path::new("out/report.json");

        assert_eq!(launcher.read_file(path).await.unwrap(), None);

        std::fs::create_dir_all(dir.path().join("out")).unwrap();
        std::fs::write(dir.path().join(path), "{}").unwrap();
        assert_eq!(launcher.read_file(path).await.unwrap().as_deref(), Some("{}"));

        launcher.remove_file(path).await.unwrap();
        launcher.remove_file(path).await.unwrap();
        assert_eq!(launcher.read_file(path).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_command_env_overrides() {
        let dir = TempDir::new().unwrap();
        let mut config = LauncherConfig {
            working_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        config.env.insert("GREETING".into(), "base".into());
        let launcher = LocalLauncher::new(config);

        let cmd = Command::new("sh")
            .arg("-c")
            .arg("echo $GREETING")
            .env("GREETING", "override");
        let result = launcher.exec(&cmd).await.unwrap();
        assert_eq!(result.stdout.trim(), "override");
    }
}
