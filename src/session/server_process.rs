//! Long-lived language-server child process with stdio capture.
//!
//! The server communicates over the language-server protocol with the editor
//! front-end; this side only relays its console output into the daemon log,
//! injects framed protocol messages (trace configuration), and tracks
//! liveness for the lifecycle manager.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};

use crate::exec::{CommandSpec, ExecError};
use crate::platform::apply_creation_flags;

/// Wait after a force kill before giving up on the exit notification.
const KILL_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SpawnOptions {
    /// Label attached to relayed server log lines.
    pub label: String,
    /// Optional regex with a named `level` capture group matching severity
    /// keywords in server output. Without it, stdout lines log as info.
    pub log_pattern: Option<String>,
}

/// Exclusive handle to a running server child. Owned by the lifecycle
/// manager; no other component may hold one.
#[async_trait]
pub trait ServerHandle: Send + Sync {
    fn pid(&self) -> u32;
    fn is_running(&self) -> bool;
    /// Write a pre-framed protocol message to the child's stdin.
    async fn send_message(&self, framed: Vec<u8>) -> anyhow::Result<()>;
    /// Stop the child: polite termination, bounded wait, then force kill.
    async fn shutdown(&mut self, grace: Duration) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogSeverity {
    Info,
    Warn,
    Error,
    Debug,
}

pub struct ServerProcess {
    stdin_tx: mpsc::Sender<Vec<u8>>,
    pid: u32,
    running_rx: watch::Receiver<bool>,
}

impl ServerProcess {
    pub async fn spawn(spec: &CommandSpec, opts: &SpawnOptions) -> Result<Self, ExecError> {
        let program = spec.program.to_string_lossy().into_owned();

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
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

        let pid = child.id().ok_or_else(|| ExecError::Io {
            program: program.clone(),
            source: std::io::Error::new(
                std::io::ErrorKind::Other,
                "failed to get PID of spawned server",
            ),
        })?;

        let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(64);
        let (running_tx, running_rx) = watch::channel(true);

        let log_regex = opts.log_pattern.as_deref().and_then(|pat| match Regex::new(pat) {
            Ok(re) => Some(re),
            Err(e) => {
                tracing::warn!("Invalid log_pattern '{}': {}, relaying at default level", pat, e);
                None
            }
        });

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdin = child.stdin.take();

        // ── stdout relay ─────────────────────────────────────
        if let Some(stdout) = stdout {
            let re = log_regex.clone();
            let label = opts.label.clone();
            tokio::spawn(async move {
                let reader = BufReader::new(stdout);
                let mut lines = reader.lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    relay(&label, &line, parse_severity(&line, re.as_ref()));
                }
            });
        }

        // ── stderr relay ─────────────────────────────────────
        if let Some(stderr) = stderr {
            let re = log_regex;
            let label = opts.label.clone();
            tokio::spawn(async move {
                let reader = BufReader::new(stderr);
                let mut lines = reader.lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let severity = parse_severity(&line, re.as_ref());
                    // stderr lines log at least at warn
                    let effective = if severity == LogSeverity::Info {
                        LogSeverity::Warn
                    } else {
                        severity
                    };
                    relay(&label, &line, effective);
                }
            });
        }

        // ── stdin writer ─────────────────────────────────────
        if let Some(mut stdin_handle) = stdin {
            tokio::spawn(async move {
                while let Some(bytes) = stdin_rx.recv().await {
                    if stdin_handle.write_all(&bytes).await.is_err() {
                        break;
                    }
                    if stdin_handle.flush().await.is_err() {
                        break;
                    }
                }
            });
        }

        // ── process waiter ───────────────────────────────────
        {
            let label = opts.label.clone();
            tokio::spawn(async move {
                match child.wait().await {
                    Ok(status) => tracing::info!("Server '{}' exited with {}", label, status),
                    Err(e) => tracing::error!("Failed to wait for server '{}': {}", label, e),
                }
                let _ = running_tx.send(false);
            });
        }

        tracing::info!("Server '{}' started with PID {}", opts.label, pid);

        Ok(Self {
            stdin_tx,
            pid,
            running_rx,
        })
    }

    /// Wait up to `timeout` for the child to exit. Returns true if it did.
    async fn wait_exit(&self, timeout: Duration) -> bool {
        let mut rx = self.running_rx.clone();
        tokio::time::timeout(timeout, async {
            while *rx.borrow() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .is_ok()
    }
}

#[async_trait]
impl ServerHandle for ServerProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn is_running(&self) -> bool {
        *self.running_rx.borrow()
    }

    async fn send_message(&self, framed: Vec<u8>) -> anyhow::Result<()> {
        self.stdin_tx
            .send(framed)
            .await
            .map_err(|e| anyhow::anyhow!("server stdin channel closed: {}", e))
    }

    async fn shutdown(&mut self, grace: Duration) -> anyhow::Result<()> {
        if !self.is_running() {
            return Ok(());
        }

        terminate_pid(self.pid, false)?;
        if self.wait_exit(grace).await {
            return Ok(());
        }

        tracing::warn!(
            "Server PID {} did not exit within {:?}, force killing",
            self.pid,
            grace
        );
        terminate_pid(self.pid, true)?;
        self.wait_exit(KILL_WAIT).await;
        Ok(())
    }
}

fn relay(label: &str, line: &str, severity: LogSeverity) {
    match severity {
        LogSeverity::Error => tracing::error!(server = %label, "{}", line),
        LogSeverity::Warn => tracing::warn!(server = %label, "{}", line),
        LogSeverity::Debug => tracing::debug!(server = %label, "{}", line),
        LogSeverity::Info => tracing::info!(server = %label, "{}", line),
    }
}

/// Parse the severity of a server log line using an optional regex pattern
/// with a named `level` capture group. No pattern or no match means info.
fn parse_severity(line: &str, pattern: Option<&Regex>) -> LogSeverity {
    if let Some(re) = pattern {
        if let Some(caps) = re.captures(line) {
            if let Some(level_match) = caps.name("level") {
                return match level_match.as_str().to_uppercase().as_str() {
                    "ERROR" | "FATAL" | "CRITICAL" => LogSeverity::Error,
                    "WARN" | "WARNING" => LogSeverity::Warn,
                    "DEBUG" | "TRACE" => LogSeverity::Debug,
                    _ => LogSeverity::Info,
                };
            }
        }
    }
    LogSeverity::Info
}

/// Cross-platform process termination. `force` escalates to a kill signal;
/// Windows has no polite equivalent, so both paths terminate outright.
fn terminate_pid(pid: u32, force: bool) -> anyhow::Result<()> {
    #[cfg(target_os = "windows")]
    {
        let _ = force;
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        std::process::Command::new("taskkill")
            .args(["/F", "/T", "/PID", &pid.to_string()])
            .creation_flags(CREATE_NO_WINDOW)
            .output()
            .map_err(|e| anyhow::anyhow!("Failed to kill PID {}: {}", pid, e))?;
    }

    #[cfg(not(target_os = "windows"))]
    {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
        signal::kill(Pid::from_raw(pid as i32), signal)
            .map_err(|e| anyhow::anyhow!("Failed to signal PID {}: {}", pid, e))?;
    }

    Ok(())
}
