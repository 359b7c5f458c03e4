//! Language-client session lifecycle.
//!
//! [`LanguageClientManager`] is the single owner of the server session. At
//! most one non-stopped session exists per daemon lifetime; every external
//! caller goes through the manager's transition methods and never touches
//! the underlying process handle.

pub mod server_process;
pub mod state_machine;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::error::SetupError;
use crate::exec::{CommandRunner, CommandSpec};
use crate::provision::Environment;
use server_process::{ServerHandle, SpawnOptions};
use state_machine::{State, StateMachine, TransitionError};

/// How long a stopping server gets before it is force-killed.
const STOP_GRACE: Duration = Duration::from_secs(10);

/// PYTHONPATH entry separator.
const PATH_LIST_SEP: &str = if cfg!(windows) { ";" } else { ":" };

/// Trace verbosity propagated to the running server via `$/setTrace`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceLevel {
    Off,
    Messages,
    Verbose,
}

impl TraceLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            TraceLevel::Off => "off",
            TraceLevel::Messages => "messages",
            TraceLevel::Verbose => "verbose",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "off" => Some(TraceLevel::Off),
            "messages" => Some(TraceLevel::Messages),
            "verbose" => Some(TraceLevel::Verbose),
            _ => None,
        }
    }
}

/// Snapshot of the session for the IPC status surface.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub state: &'static str,
    pub session_id: Option<Uuid>,
    pub pid: Option<u32>,
    pub interpreter: Option<PathBuf>,
}

struct ServerSession {
    id: Uuid,
    /// The environment the session was launched from.
    environment: Environment,
    handle: Box<dyn ServerHandle>,
}

struct Inner {
    machine: StateMachine,
    session: Option<ServerSession>,
}

pub struct LanguageClientManager {
    runner: Arc<dyn CommandRunner>,
    inner: Mutex<Inner>,
}

impl LanguageClientManager {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            inner: Mutex::new(Inner {
                machine: StateMachine::new(),
                session: None,
            }),
        }
    }

    /// Restart the session against the given environment. The previous child
    /// is fully stopped before the new one starts; with no previous session
    /// this degenerates to a plain start. A start failure surfaces
    /// [`SetupError::SessionStartFailed`] and leaves the state Stopped.
    pub async fn restart(
        &self,
        env: &Environment,
        server: &ServerConfig,
    ) -> Result<SessionStatus, SetupError> {
        let mut inner = self.inner.lock().await;
        Self::stop_locked(&mut inner).await?;

        inner.machine.transition(State::Starting).map_err(internal)?;
        let spec = launch_spec(env, server);
        let opts = SpawnOptions {
            label: server.id.clone(),
            log_pattern: server.log_pattern.clone(),
        };
        tracing::info!("Starting {}: {}", server.name, spec.display());

        match self.runner.spawn_server(&spec, &opts).await {
            Ok(handle) => {
                inner.machine.transition(State::Running).map_err(internal)?;
                let session = ServerSession {
                    id: Uuid::new_v4(),
                    environment: env.clone(),
                    handle,
                };
                tracing::info!(
                    "Session {} running (pid {})",
                    session.id,
                    session.handle.pid()
                );
                inner.session = Some(session);
                Ok(Self::status_locked(&inner))
            }
            Err(e) => {
                inner.machine.transition(State::Stopped).map_err(internal)?;
                Err(SetupError::SessionStartFailed(e.to_string()))
            }
        }
    }

    /// Stop the current session, if any. No-op when already stopped.
    pub async fn stop(&self) -> Result<(), SetupError> {
        let mut inner = self.inner.lock().await;
        Self::stop_locked(&mut inner).await
    }

    async fn stop_locked(inner: &mut Inner) -> Result<(), SetupError> {
        let Some(mut session) = inner.session.take() else {
            return Ok(());
        };
        inner.machine.transition(State::Stopping).map_err(internal)?;
        if let Err(e) = session.handle.shutdown(STOP_GRACE).await {
            // the child usually exited on its own in this case
            tracing::warn!("Error while stopping session {}: {}", session.id, e);
        }
        inner.machine.transition(State::Stopped).map_err(internal)?;
        tracing::info!("Session {} stopped", session.id);
        Ok(())
    }

    /// Propagate trace verbosity to the running server without a restart.
    pub async fn set_trace(&self, level: TraceLevel) -> Result<(), SetupError> {
        let inner = self.inner.lock().await;
        let Some(session) = &inner.session else {
            return Err(SetupError::Internal(anyhow::anyhow!(
                "no running session to configure"
            )));
        };
        let framed = frame_message(&serde_json::json!({
            "jsonrpc": "2.0",
            "method": "$/setTrace",
            "params": { "value": level.as_str() },
        }));
        session
            .handle
            .send_message(framed)
            .await
            .map_err(SetupError::Internal)?;
        tracing::debug!("Trace level set to {}", level.as_str());
        Ok(())
    }

    pub async fn status(&self) -> SessionStatus {
        let inner = self.inner.lock().await;
        Self::status_locked(&inner)
    }

    fn status_locked(inner: &Inner) -> SessionStatus {
        SessionStatus {
            state: inner.machine.state.as_str(),
            session_id: inner.session.as_ref().map(|s| s.id),
            pid: inner.session.as_ref().map(|s| s.handle.pid()),
            interpreter: inner.session.as_ref().map(|s| s.environment.python.clone()),
        }
    }
}

fn internal(e: TransitionError) -> SetupError {
    SetupError::Internal(anyhow::Error::new(e))
}

/// Launch command for the long-lived server: `<env-python> -m <module>` plus
/// configured arguments, with UTF-8 stdio and an augmented PYTHONPATH.
fn launch_spec(env: &Environment, server: &ServerConfig) -> CommandSpec {
    let mut spec = CommandSpec::new(&env.python)
        .arg("-m")
        .arg(&server.module)
        .args(server.args.clone())
        .env("PYTHONIOENCODING", "utf-8");

    if !server.python_path.is_empty() {
        let mut entries = server.python_path.clone();
        if let Ok(existing) = std::env::var("PYTHONPATH") {
            entries.push(existing);
        }
        spec = spec.env("PYTHONPATH", entries.join(PATH_LIST_SEP));
    }
    spec
}

/// Frame a JSON-RPC payload with the base-protocol Content-Length header.
pub fn frame_message(payload: &serde_json::Value) -> Vec<u8> {
    let body = payload.to_string();
    format!("Content-Length: {}\r\n\r\n{}", body.len(), body).into_bytes()
}
