//! Awaitable process invocation.
//!
//! Every external process the daemon touches (version probes, venv
//! creation, pip runs, report generation, the language-server launch) goes
//! through the [`CommandRunner`] seam so lifecycle logic can be tested with
//! a scripted runner instead of a real Python installation.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::platform::apply_creation_flags;
use crate::session::server_process::{ServerHandle, ServerProcess, SpawnOptions};

/// A fully described invocation: program, arguments, working directory and
/// extra environment variables.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub envs: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            envs: Vec::new(),
        }
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

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Command string for diagnostics and trace logs.
    pub fn display(&self) -> String {
        let mut s = self.program.to_string_lossy().into_owned();
        for arg in &self.args {
            s.push(' ');
            s.push_str(arg);
        }
        s
    }
}

/// Captured result of a run-to-completion invocation.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    /// Exit code, if the process exited normally.
    pub status_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.status_code == Some(0)
    }

    /// stderr if non-empty, otherwise stdout, whichever carries the
    /// diagnostic for a failed invocation.
    pub fn diagnostic(&self) -> &str {
        if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        }
    }
}

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' timed out after {timeout_secs}s")]
    Timeout { program: String, timeout_secs: u64 },

    #[error("i/o failure while running '{program}': {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// The invocation primitive. `run` awaits completion and captures output;
/// `spawn_server` starts the long-lived language-server child and hands the
/// exclusive handle to the caller.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, spec: &CommandSpec, timeout: Duration) -> Result<ExecOutput, ExecError>;

    async fn spawn_server(
        &self,
        spec: &CommandSpec,
        opts: &SpawnOptions,
    ) -> Result<Box<dyn ServerHandle>, ExecError>;
}

/// Production runner backed by `tokio::process`.
pub struct TokioRunner;

impl TokioRunner {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TokioRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandRunner for TokioRunner {
    async fn run(&self, spec: &CommandSpec, timeout: Duration) -> Result<ExecOutput, ExecError> {
        tracing::debug!("Executing: {}", spec.display());
        let program = spec.program.to_string_lossy().into_owned();

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &spec.envs {
            cmd.env(key, value);
        }
        apply_creation_flags(&mut cmd);

        let mut child = cmd.spawn().map_err(|e| ExecError::Spawn {
            program: program.clone(),
            source: e,
        })?;

        let stdout_pipe = child.stdout.take();
        let stdout_handle = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(mut pipe) = stdout_pipe {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            String::from_utf8_lossy(&buf).into_owned()
        });

        let stderr_pipe = child.stderr.take();
        let stderr_handle = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(mut pipe) = stderr_pipe {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            String::from_utf8_lossy(&buf).into_owned()
        });

        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => Ok(ExecOutput {
                status_code: status.code(),
                stdout: stdout_handle.await.unwrap_or_default(),
                stderr: stderr_handle.await.unwrap_or_default(),
            }),
            Ok(Err(e)) => Err(ExecError::Io { program, source: e }),
            Err(_) => {
                tracing::warn!(
                    "'{}' timed out after {}s, killing process",
                    spec.display(),
                    timeout.as_secs()
                );
                let _ = child.kill().await;
                Err(ExecError::Timeout {
                    program,
                    timeout_secs: timeout.as_secs(),
                })
            }
        }
    }

    async fn spawn_server(
        &self,
        spec: &CommandSpec,
        opts: &SpawnOptions,
    ) -> Result<Box<dyn ServerHandle>, ExecError> {
        let process = ServerProcess::spawn(spec, opts).await?;
        Ok(Box::new(process))
    }
}
