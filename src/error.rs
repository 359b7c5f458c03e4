//! Setup and lifecycle error taxonomy. Error kinds are distinguished so IPC
//! handlers can return an appropriate HTTP status code and the editor
//! front-end can react per kind.

use axum::http::StatusCode;

/// Failure kinds surfaced by interpreter resolution, environment
/// provisioning, session lifecycle and report generation.
///
/// None of these are fatal to the daemon: every recovery path is driven by
/// the next change event or explicit command, never by an automatic retry.
#[derive(thiserror::Error, Debug)]
pub enum SetupError {
    #[error(
        "No usable Python interpreter found.\n\
         [Option 1] Select an interpreter through the host's Python integration.\n\
         [Option 2] Set the \"{0}.interpreter\" setting to an interpreter path.\n\
         Python 3.7 or newer is required."
    )]
    InterpreterNotFound(String),

    #[error("Python {found} at '{path}' is not supported; Python 3.7 or newer is required")]
    VersionUnsupported { path: String, found: String },

    #[error("Failed to create virtual environment at '{root}': {detail}")]
    EnvironmentCreationFailed { root: String, detail: String },

    #[error("Failed to install server dependencies [{packages}]: {detail}")]
    DependencyInstallFailed { packages: String, detail: String },

    #[error("Language server failed to start: {0}")]
    SessionStartFailed(String),

    #[error("Report generation failed: {0}")]
    ReportGenerationFailed(String),

    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}

impl SetupError {
    /// HTTP status code mapping for the IPC surface.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InterpreterNotFound(_) => StatusCode::PRECONDITION_FAILED,
            Self::VersionUnsupported { .. } => StatusCode::PRECONDITION_FAILED,
            Self::EnvironmentCreationFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::DependencyInstallFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::SessionStartFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ReportGenerationFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InterpreterNotFound(_) => "INTERPRETER_NOT_FOUND",
            Self::VersionUnsupported { .. } => "VERSION_UNSUPPORTED",
            Self::EnvironmentCreationFailed { .. } => "ENV_CREATION_FAILED",
            Self::DependencyInstallFailed { .. } => "DEPENDENCY_INSTALL_FAILED",
            Self::SessionStartFailed(_) => "SESSION_START_FAILED",
            Self::ReportGenerationFailed(_) => "REPORT_GENERATION_FAILED",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// JSON error body for IPC responses.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "success": false,
            "error": self.to_string(),
            "error_code": self.error_code(),
        })
    }
}

/// Allow IPC handlers to return a SetupError directly.
impl axum::response::IntoResponse for SetupError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = axum::Json(self.to_json());
        (status, body).into_response()
    }
}
