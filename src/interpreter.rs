//! Python interpreter resolution.
//!
//! Preference order: the explicit `<server-id>.interpreter` configuration
//! override, then the host's interpreter service. Every candidate is version
//! probed; a candidate that cannot be probed or is below the minimum is
//! never used to provision or launch.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::GlobalConfig;
use crate::error::SetupError;
use crate::exec::{CommandRunner, CommandSpec};

/// Minimum supported interpreter version (major, minor).
pub const MIN_PYTHON_VERSION: (u32, u32) = (3, 7);

/// A validated interpreter. Immutable once resolved for a session.
#[derive(Debug, Clone)]
pub struct Interpreter {
    pub path: PathBuf,
    pub version: (u32, u32),
    pub raw_version: String,
}

impl Interpreter {
    pub fn meets_minimum(&self) -> bool {
        self.version >= MIN_PYTHON_VERSION
    }
}

/// Host-provided interpreter discovery. In an editor integration this is
/// backed by the editor's Python extension; the daemon ships a PATH-probing
/// fallback for standalone use.
#[async_trait]
pub trait InterpreterService: Send + Sync {
    /// Run discovery. Called once at activation when no override is set.
    async fn initialize(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// The interpreter currently selected by the host, if any.
    async fn active_interpreter(&self) -> Option<PathBuf>;
}

/// Built-in discovery backend: probes well-known interpreter names on PATH.
pub struct SystemInterpreterService {
    runner: Arc<dyn CommandRunner>,
    probe_timeout: Duration,
}

impl SystemInterpreterService {
    const CANDIDATES: [&'static str; 3] = ["python3", "python", "py"];

    pub fn new(runner: Arc<dyn CommandRunner>, probe_timeout: Duration) -> Self {
        Self {
            runner,
            probe_timeout,
        }
    }
}

#[async_trait]
impl InterpreterService for SystemInterpreterService {
    async fn initialize(&self) -> anyhow::Result<()> {
        tracing::debug!("Scanning PATH for Python interpreters");
        Ok(())
    }

    async fn active_interpreter(&self) -> Option<PathBuf> {
        for candidate in Self::CANDIDATES {
            let spec = CommandSpec::new(candidate).arg("--version");
            if let Ok(out) = self.runner.run(&spec, self.probe_timeout).await {
                if out.success() {
                    tracing::info!("Found system Python: {}", candidate);
                    return Some(PathBuf::from(candidate));
                }
            }
        }
        None
    }
}

/// Resolves a usable interpreter or reports an actionable failure.
pub struct InterpreterResolver {
    runner: Arc<dyn CommandRunner>,
    service: Arc<dyn InterpreterService>,
}

impl InterpreterResolver {
    pub fn new(runner: Arc<dyn CommandRunner>, service: Arc<dyn InterpreterService>) -> Self {
        Self { runner, service }
    }

    pub fn service(&self) -> &Arc<dyn InterpreterService> {
        &self.service
    }

    pub async fn resolve(&self, cfg: &GlobalConfig) -> Result<Interpreter, SetupError> {
        let timeout = cfg.env.invoke_timeout();

        if let Some(override_path) = &cfg.server.interpreter {
            match self.probe(Path::new(override_path), timeout).await {
                Some(interp) if interp.meets_minimum() => {
                    tracing::info!(
                        "Using interpreter from {}.interpreter: {} ({})",
                        cfg.server.id,
                        interp.path.display(),
                        interp.raw_version
                    );
                    return Ok(interp);
                }
                Some(interp) => {
                    tracing::warn!(
                        "Configured interpreter {} is {} (< {}.{}), falling back to host discovery",
                        interp.path.display(),
                        interp.raw_version,
                        MIN_PYTHON_VERSION.0,
                        MIN_PYTHON_VERSION.1
                    );
                }
                None => {
                    tracing::warn!(
                        "Configured interpreter '{}' failed the version probe, falling back to host discovery",
                        override_path
                    );
                }
            }
        }

        let Some(path) = self.service.active_interpreter().await else {
            return Err(SetupError::InterpreterNotFound(cfg.server.id.clone()));
        };

        match self.probe(&path, timeout).await {
            Some(interp) if interp.meets_minimum() => {
                tracing::info!(
                    "Using interpreter from host service: {} ({})",
                    interp.path.display(),
                    interp.raw_version
                );
                Ok(interp)
            }
            Some(interp) => Err(SetupError::VersionUnsupported {
                path: interp.path.to_string_lossy().into_owned(),
                found: interp.raw_version,
            }),
            None => Err(SetupError::InterpreterNotFound(cfg.server.id.clone())),
        }
    }

    /// Version-probe a single candidate. Any invocation or parse failure is
    /// check-failed, not fatal.
    pub async fn probe(&self, path: &Path, timeout: Duration) -> Option<Interpreter> {
        let spec = CommandSpec::new(path).arg("--version");
        let out = match self.runner.run(&spec, timeout).await {
            Ok(out) => out,
            Err(e) => {
                tracing::debug!("Version probe failed for {}: {}", path.display(), e);
                return None;
            }
        };
        if !out.success() {
            tracing::debug!(
                "Version probe for {} exited with {:?}: {}",
                path.display(),
                out.status_code,
                out.diagnostic()
            );
            return None;
        }

        // Python 2 printed its version banner to stderr
        let raw = if out.stdout.trim().is_empty() {
            out.stderr.trim().to_string()
        } else {
            out.stdout.trim().to_string()
        };
        let version = parse_python_version(&raw)?;
        Some(Interpreter {
            path: path.to_path_buf(),
            version,
            raw_version: raw,
        })
    }
}

/// "Python 3.11.2" → (3, 11)
pub fn parse_python_version(s: &str) -> Option<(u32, u32)> {
    let s = s.trim();
    let ver_part = s
        .strip_prefix("Python ")
        .or_else(|| s.strip_prefix("python "))
        .unwrap_or(s);
    let parts: Vec<&str> = ver_part.split('.').collect();
    if parts.len() >= 2 {
        let major = parts[0].trim().parse().ok()?;
        let minor = parts[1].trim().parse().ok()?;
        Some((major, minor))
    } else {
        None
    }
}
