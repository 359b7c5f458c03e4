//! Virtual-environment provisioning.
//!
//! The daemon keeps one isolated Python environment under its private
//! storage and guarantees the server's dependency set is installed before a
//! session is launched. Readiness is always re-derived by inspecting the
//! installed packages, never from a cached flag, so interrupted installs
//! from a previous run heal on the next trigger without extra bookkeeping.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::GlobalConfig;
use crate::error::SetupError;
use crate::exec::{CommandRunner, CommandSpec};
use crate::interpreter::Interpreter;
use crate::platform::PlatformLayout;

/// Dependency names the server and report tool need. Fixed per build;
/// comparison is name-based, version pins are not enforced here.
pub const REQUIRED_PACKAGES: [&str; 4] = ["crossplane", "jinja2", "xhtml2pdf", "pygls"];

const VENV_DIR_NAME: &str = "venv";

/// Readiness derived from direct inspection of the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvStatus {
    /// No usable environment at the root; full creation needed.
    Missing,
    /// Environment exists but the named required packages are absent.
    NeedsRepair(Vec<String>),
    Ready,
}

impl EnvStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvStatus::Missing => "missing",
            EnvStatus::NeedsRepair(_) => "needs-repair",
            EnvStatus::Ready => "ready",
        }
    }
}

/// Paths of the provisioned environment.
#[derive(Debug, Clone)]
pub struct Environment {
    pub root: PathBuf,
    pub python: PathBuf,
}

pub struct EnvironmentProvisioner {
    runner: Arc<dyn CommandRunner>,
    layout: PlatformLayout,
    root: PathBuf,
    invoke_timeout: Duration,
}

impl EnvironmentProvisioner {
    pub fn new(runner: Arc<dyn CommandRunner>, layout: PlatformLayout, cfg: &GlobalConfig) -> Self {
        let root = cfg
            .env
            .root
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| resolve_data_dir().join(VENV_DIR_NAME));
        Self::with_root(runner, layout, root, cfg.env.invoke_timeout())
    }

    pub fn with_root(
        runner: Arc<dyn CommandRunner>,
        layout: PlatformLayout,
        root: PathBuf,
        invoke_timeout: Duration,
    ) -> Self {
        Self {
            runner,
            layout,
            root,
            invoke_timeout,
        }
    }

    pub fn environment(&self) -> Environment {
        Environment {
            root: self.root.clone(),
            python: self.layout.venv_python(&self.root),
        }
    }

    /// Derive readiness from the filesystem and the environment's own
    /// package listing. Pure inspection; performs no install work.
    pub async fn status(&self) -> Result<EnvStatus, SetupError> {
        let env = self.environment();
        if !env.root.is_dir() || !env.python.exists() {
            return Ok(EnvStatus::Missing);
        }

        let spec = CommandSpec::new(&env.python).args(["-m", "pip", "freeze"]);
        let out = match self.runner.run(&spec, self.invoke_timeout).await {
            Ok(out) if out.success() => out,
            Ok(out) => {
                tracing::warn!(
                    "Package listing failed (exit {:?}): {}, treating environment as unusable",
                    out.status_code,
                    out.diagnostic()
                );
                return Ok(EnvStatus::Missing);
            }
            Err(e) => {
                tracing::warn!(
                    "Package listing failed: {}, treating environment as unusable",
                    e
                );
                return Ok(EnvStatus::Missing);
            }
        };

        let installed = parse_installed_names(&out.stdout);
        let missing: Vec<String> = REQUIRED_PACKAGES
            .iter()
            .filter(|name| !installed.contains(&normalize_name(name)))
            .map(|name| name.to_string())
            .collect();

        if missing.is_empty() {
            Ok(EnvStatus::Ready)
        } else {
            Ok(EnvStatus::NeedsRepair(missing))
        }
    }

    /// Ensure the environment exists with the full required package set.
    /// Idempotent: when everything is already present this performs only the
    /// inspection; when packages are missing, exactly the missing subset is
    /// installed in one batched pip invocation.
    pub async fn ensure_ready(&self, interpreter: &Interpreter) -> Result<Environment, SetupError> {
        let env = self.environment();

        let missing = match self.status().await? {
            EnvStatus::Ready => {
                tracing::debug!("Environment ready at {}", env.root.display());
                return Ok(env);
            }
            EnvStatus::NeedsRepair(missing) => {
                tracing::info!(
                    "Environment at {} is missing {:?}, repairing",
                    env.root.display(),
                    missing
                );
                missing
            }
            EnvStatus::Missing => {
                self.create(interpreter).await?;
                REQUIRED_PACKAGES.iter().map(|s| s.to_string()).collect()
            }
        };

        self.install(&missing).await?;

        // Readiness comes from re-inspection, not from the install result
        match self.status().await? {
            EnvStatus::Ready => {
                tracing::info!("Environment ready at {}", env.root.display());
                Ok(env)
            }
            other => Err(SetupError::DependencyInstallFailed {
                packages: missing.join(", "),
                detail: format!(
                    "environment still {} after install",
                    other.as_str()
                ),
            }),
        }
    }

    async fn create(&self, interpreter: &Interpreter) -> Result<(), SetupError> {
        tracing::info!(
            "Creating virtual environment at {} (base: {})",
            self.root.display(),
            interpreter.path.display()
        );

        if let Some(parent) = self.root.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SetupError::EnvironmentCreationFailed {
                root: self.root.to_string_lossy().into_owned(),
                detail: e.to_string(),
            })?;
        }

        let spec = CommandSpec::new(&interpreter.path)
            .args(["-m", "venv"])
            .arg(self.root.to_string_lossy());
        let out = self
            .runner
            .run(&spec, self.invoke_timeout)
            .await
            .map_err(|e| SetupError::EnvironmentCreationFailed {
                root: self.root.to_string_lossy().into_owned(),
                detail: e.to_string(),
            })?;

        if !out.success() {
            return Err(SetupError::EnvironmentCreationFailed {
                root: self.root.to_string_lossy().into_owned(),
                detail: out.diagnostic().to_string(),
            });
        }
        Ok(())
    }

    /// One batched install of the given package names. On failure the
    /// partially built environment is kept so the next trigger resumes from
    /// the then-missing subset.
    async fn install(&self, packages: &[String]) -> Result<(), SetupError> {
        let env = self.environment();
        tracing::info!("Installing server dependencies: {:?}", packages);

        let spec = CommandSpec::new(&env.python)
            .args(["-m", "pip", "install"])
            .args(packages.iter().cloned());
        let out = self
            .runner
            .run(&spec, self.invoke_timeout)
            .await
            .map_err(|e| SetupError::DependencyInstallFailed {
                packages: packages.join(", "),
                detail: e.to_string(),
            })?;

        if !out.success() {
            return Err(SetupError::DependencyInstallFailed {
                packages: packages.join(", "),
                detail: out.diagnostic().to_string(),
            });
        }
        Ok(())
    }

    /// Diagnostic snapshot for the IPC status endpoint.
    pub async fn describe(&self) -> serde_json::Value {
        let env = self.environment();
        let status = self.status().await;
        let mut info = serde_json::json!({
            "root": env.root.to_string_lossy(),
            "python": env.python.to_string_lossy(),
            "required_packages": REQUIRED_PACKAGES,
        });
        match status {
            Ok(status) => {
                info["status"] = serde_json::json!(status.as_str());
                if let EnvStatus::NeedsRepair(missing) = status {
                    info["missing_packages"] = serde_json::json!(missing);
                }
            }
            Err(e) => {
                info["status"] = serde_json::json!("error");
                info["error"] = serde_json::json!(e.to_string());
            }
        }
        info
    }
}

/// Private storage directory for the daemon's durable artifacts.
fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("CONFSEC_DATA_DIR") {
        return PathBuf::from(dir);
    }
    platform_data_dir().unwrap_or_else(|| PathBuf::from(".").join("confsec-host"))
}

#[cfg(target_os = "windows")]
fn platform_data_dir() -> Option<PathBuf> {
    std::env::var_os("APPDATA").map(|appdata| PathBuf::from(appdata).join("confsec-host"))
}

#[cfg(target_os = "macos")]
fn platform_data_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .map(|home| PathBuf::from(home).join("Library/Application Support/confsec-host"))
}

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
fn platform_data_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .map(|home| PathBuf::from(home).join(".local/share/confsec-host"))
}

/// Normalized package names from `pip freeze` output. Handles pinned
/// (`name==ver`), direct-reference (`name @ url`) and editable
/// (`-e ...#egg=name`) lines.
pub fn parse_installed_names(freeze_output: &str) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    for line in freeze_output.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let name = if let Some(rest) = line.strip_prefix("-e ") {
            match rest.split("#egg=").nth(1) {
                Some(egg) => egg,
                None => continue,
            }
        } else if let Some((name, _)) = line.split_once("==") {
            name
        } else if let Some((name, _)) = line.split_once(" @ ") {
            name
        } else {
            line
        };
        names.insert(normalize_name(name));
    }
    names
}

/// PEP 503-style normalization so name comparison is spelling-insensitive.
fn normalize_name(name: &str) -> String {
    name.trim().to_ascii_lowercase().replace(['_', '.'], "-")
}
