//! Local container daemon client.
//!
//! Delivers images by running `<executable> load` as a subprocess and
//! streaming a `docker save` archive to its stdin.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::Command;
use thiserror::Error;
use tracing::{debug, info};

/// Executable used when none is configured. Resolved through `PATH`.
pub const DEFAULT_DOCKER_EXECUTABLE: &str = "docker";

/// Errors from daemon subprocesses.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("failed to start '{}': {source}", .executable.display())]
    Unavailable {
        executable: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("daemon command exited with {exit_code:?}: {stderr}")]
    Failed {
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("daemon command timed out after {}s", .timeout.as_secs())]
    Timeout { timeout: Duration },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Executable and environment used to reach the daemon.
///
/// An empty environment means the subprocess inherits this process's
/// environment; a non-empty one replaces it entirely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonSettings {
    pub executable: PathBuf,
    pub environment: BTreeMap<String, String>,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            executable: PathBuf::from(DEFAULT_DOCKER_EXECUTABLE),
            environment: BTreeMap::new(),
        }
    }
}

/// Captured output of a successful daemon command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runs daemon CLI commands.
#[derive(Debug, Clone)]
pub struct DaemonClient {
    settings: DaemonSettings,
    timeout: Option<Duration>,
}

impl DaemonClient {
    pub fn new(executable: impl Into<PathBuf>, environment: BTreeMap<String, String>) -> Self {
        Self::from_settings(DaemonSettings {
            executable: executable.into(),
            environment,
        })
    }

    pub fn from_settings(settings: DaemonSettings) -> Self {
        Self {
            settings,
            timeout: None,
        }
    }

    /// Kill the subprocess if it runs longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn executable(&self) -> &Path {
        &self.settings.executable
    }

    pub fn environment(&self) -> &BTreeMap<String, String> {
        &self.settings.environment
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Run `<executable> load`, streaming `archive` to its stdin.
    ///
    /// The subprocess runs once. Dropping the returned future, or hitting the
    /// timeout, kills it.
    pub async fn load<R>(&self, mut archive: R) -> Result<DaemonOutput, DaemonError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let start = Instant::now();
        info!(executable = %self.settings.executable.display(), "Loading image into daemon");

        let mut child = self
            .command("load")
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|source| self.unavailable(source))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("daemon stdin was not captured"))?;

        let feed = async move {
            tokio::io::copy(&mut archive, &mut stdin).await?;
            stdin.shutdown().await
        };

        let run = async move { tokio::join!(feed, child.wait_with_output()) };
        let (fed, output) = self.with_deadline(run).await?;

        // A daemon that fails early closes stdin; report its exit instead of
        // the resulting broken pipe.
        let output = check_output(output?)?;
        fed?;

        debug!(
            duration_ms = start.elapsed().as_millis() as u64,
            stdout = %output.stdout.trim(),
            "Daemon load finished"
        );

        Ok(output)
    }

    /// Run `<executable> info` to check that the daemon is reachable.
    pub async fn info(&self) -> Result<DaemonOutput, DaemonError> {
        let child = self
            .command("info")
            .stdin(Stdio::null())
            .spawn()
            .map_err(|source| self.unavailable(source))?;

        let output = self.with_deadline(child.wait_with_output()).await?;
        check_output(output?)
    }

    fn command(&self, subcommand: &str) -> Command {
        // A replacement environment may lack PATH, so bare names are looked
        // up against ours first.
        let executable = if self.settings.environment.is_empty() {
            self.settings.executable.clone()
        } else {
            let cwd = std::env::current_dir().unwrap_or_default();
            resolve_executable(&self.settings.executable, std::env::var_os("PATH"), &cwd)
        };
        debug!(executable = %executable.display(), subcommand, "Spawning daemon command");

        let mut command = Command::new(executable);
        command
            .arg(subcommand)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if !self.settings.environment.is_empty() {
            command.env_clear().envs(&self.settings.environment);
        }

        command
    }

    fn unavailable(&self, source: io::Error) -> DaemonError {
        DaemonError::Unavailable {
            executable: self.settings.executable.clone(),
            source,
        }
    }

    async fn with_deadline<F: std::future::Future>(&self, fut: F) -> Result<F::Output, DaemonError> {
        match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, fut)
                .await
                .map_err(|_| DaemonError::Timeout { timeout }),
            None => Ok(fut.await),
        }
    }
}

/// Resolve a bare executable name such as `docker` through `path`. Paths
/// with a directory part, and names that cannot be found, are returned as is.
fn resolve_executable(executable: &Path, path: Option<OsString>, cwd: &Path) -> PathBuf {
    if executable.components().count() != 1 {
        return executable.to_path_buf();
    }

    which::which_in(executable, path, cwd).unwrap_or_else(|_| executable.to_path_buf())
}

fn check_output(output: Output) -> Result<DaemonOutput, DaemonError> {
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    if !output.status.success() {
        return Err(DaemonError::Failed {
            exit_code: output.status.code(),
            stderr,
        });
    }

    Ok(DaemonOutput { stdout, stderr })
}
