//! One-shot PDF report generation.
//!
//! Reports run independently of the long-lived session: the handler invokes
//! the provisioned environment's interpreter with the report module against
//! the active document and a fixed output directory under the workspace.
//! Concurrent invocations are not deduplicated; each writes its own named
//! report file.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::RwLock;

use crate::config::ServerConfig;
use crate::error::SetupError;
use crate::exec::{CommandRunner, CommandSpec};
use crate::interpreter::Interpreter;
use crate::provision::{EnvStatus, EnvironmentProvisioner};

/// Clock slack when checking whether the tool produced a file.
const MTIME_SLACK: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ReportOutcome {
    pub output_dir: PathBuf,
}

pub struct ReportCommandHandler {
    runner: Arc<dyn CommandRunner>,
    provisioner: Arc<EnvironmentProvisioner>,
    /// Last interpreter resolved by the router; reports require one.
    resolved: Arc<RwLock<Option<Interpreter>>>,
    invoke_timeout: Duration,
}

impl ReportCommandHandler {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        provisioner: Arc<EnvironmentProvisioner>,
        resolved: Arc<RwLock<Option<Interpreter>>>,
        invoke_timeout: Duration,
    ) -> Self {
        Self {
            runner,
            provisioner,
            resolved,
            invoke_timeout,
        }
    }

    pub async fn generate(
        &self,
        document: &Path,
        workspace_root: &Path,
        server: &ServerConfig,
    ) -> Result<ReportOutcome, SetupError> {
        // Fail fast: nothing is invoked unless setup has completed
        if self.resolved.read().await.is_none() {
            return Err(SetupError::ReportGenerationFailed(
                "a Python interpreter must be selected before reports can be generated".into(),
            ));
        }
        match self.provisioner.status().await? {
            EnvStatus::Ready => {}
            status => {
                return Err(SetupError::ReportGenerationFailed(format!(
                    "the server environment is not ready ({}); restart the server to re-run setup",
                    status.as_str()
                )));
            }
        }

        let output_dir = workspace_root.join("output").join(&server.id);
        tokio::fs::create_dir_all(&output_dir)
            .await
            .map_err(|e| {
                SetupError::ReportGenerationFailed(format!(
                    "could not create output directory {}: {}",
                    output_dir.display(),
                    e
                ))
            })?;

        let started = SystemTime::now();
        let env = self.provisioner.environment();
        let spec = CommandSpec::new(&env.python)
            .arg("-m")
            .arg(&server.report_module)
            .arg(document.to_string_lossy())
            .arg(format!("--pdf-output={}", output_dir.to_string_lossy()))
            .env("PYTHONIOENCODING", "utf-8");
        tracing::info!("Generating report: {}", spec.display());

        let out = self
            .runner
            .run(&spec, self.invoke_timeout)
            .await
            .map_err(|e| SetupError::ReportGenerationFailed(e.to_string()))?;

        if !out.success() {
            return Err(SetupError::ReportGenerationFailed(
                out.diagnostic().to_string(),
            ));
        }
        if !produced_file_since(&output_dir, started).await {
            return Err(SetupError::ReportGenerationFailed(
                "report tool exited successfully but produced no file".into(),
            ));
        }

        tracing::info!("Report generated at {}", output_dir.display());
        Ok(ReportOutcome { output_dir })
    }
}

/// Whether `dir` contains an entry written at or after `cutoff` (with slack
/// for filesystem timestamp granularity).
async fn produced_file_since(dir: &Path, cutoff: SystemTime) -> bool {
    let cutoff = cutoff.checked_sub(MTIME_SLACK).unwrap_or(cutoff);
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return false;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if let Ok(meta) = entry.metadata().await {
            if let Ok(mtime) = meta.modified() {
                if mtime >= cutoff {
                    return true;
                }
            }
        }
    }
    false
}
