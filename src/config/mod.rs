//! Daemon configuration.
//!
//! Loaded from `config/global.toml` (override with `CONFSEC_CONFIG`). A
//! missing or malformed file falls back to defaults so the daemon always
//! starts; the editor front-end rewrites the file and posts a
//! configuration-changed event to apply changes.

use std::time::Duration;

use serde::Deserialize;

/// Settings keys (relative to the server id namespace) whose change requires
/// a server restart. Changes to any other key are ignored by the router.
const RELEVANT_SETTINGS: [&str; 4] = ["interpreter", "args", "module", "pythonPath"];

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct GlobalConfig {
    pub ipc_listen: Option<String>,
    pub server: ServerConfig,
    pub env: EnvConfig,
}

/// Identity and launch settings of the managed language server.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ServerConfig {
    /// Namespace for settings keys and the report output directory.
    pub id: String,
    /// Human-readable name used in notifications.
    pub name: String,
    /// Python module launched as the long-lived server (`python -m <module>`).
    pub module: String,
    /// Python module invoked for one-shot PDF report generation.
    pub report_module: String,
    /// Explicit interpreter override; when set, host discovery is skipped.
    pub interpreter: Option<String>,
    /// Extra arguments appended to the server launch command.
    pub args: Vec<String>,
    /// Extra entries prepended to the server's PYTHONPATH.
    pub python_path: Vec<String>,
    /// Regex with a named `level` group for classifying server output lines.
    pub log_pattern: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            id: "confsec".to_string(),
            name: "Confsec Language Server".to_string(),
            module: "confsec_server".to_string(),
            report_module: "confsec".to_string(),
            interpreter: None,
            args: Vec::new(),
            python_path: Vec::new(),
            log_pattern: Some(r"(?P<level>INFO|WARNING|ERROR|DEBUG)".to_string()),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct EnvConfig {
    /// Override for the virtual environment root. Defaults to
    /// `<data-dir>/venv` under the daemon's private storage.
    pub root: Option<String>,
    /// Timeout applied to every external process invocation.
    pub invoke_timeout_secs: u64,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            root: None,
            invoke_timeout_secs: 120,
        }
    }
}

impl EnvConfig {
    pub fn invoke_timeout(&self) -> Duration {
        Duration::from_secs(self.invoke_timeout_secs)
    }
}

impl GlobalConfig {
    pub const DEFAULT_IPC_LISTEN: &'static str = "127.0.0.1:57484";

    pub fn load() -> Self {
        let path = std::env::var("CONFSEC_CONFIG")
            .unwrap_or_else(|_| "config/global.toml".to_string());
        let content = std::fs::read_to_string(&path).unwrap_or_default();
        match toml::from_str(&content) {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::warn!("Invalid config at {}: {}, using defaults", path, e);
                Self::default()
            }
        }
    }

    pub fn ipc_listen(&self) -> &str {
        self.ipc_listen.as_deref().unwrap_or(Self::DEFAULT_IPC_LISTEN)
    }
}

/// Whether a changed settings key belongs to this server and requires a
/// restart. Keys are namespaced `<server-id>.<setting>`; everything outside
/// the namespace, and namespace keys with no launch impact, are ignored.
pub fn is_relevant_key(key: &str, server_id: &str) -> bool {
    key.strip_prefix(server_id)
        .and_then(|rest| rest.strip_prefix('.'))
        .map(|setting| RELEVANT_SETTINGS.contains(&setting))
        .unwrap_or(false)
}
