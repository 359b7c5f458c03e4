//! Platform capability lookup.
//!
//! Venv directory naming differs per platform (`Scripts/python.exe` on
//! Windows, `bin/python` elsewhere). The layout is resolved once at startup
//! and passed to every component that derives environment paths, instead of
//! repeating `cfg!` string concatenation at each call site. Process-creation
//! quirks live here too.

use std::path::{Path, PathBuf};

use tokio::process::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformLayout {
    /// Name of the executable directory inside a venv root.
    pub scripts_dir: &'static str,
    /// File name of the Python executable inside that directory.
    pub python_exe: &'static str,
}

impl PlatformLayout {
    /// The layout for the platform this daemon was built for.
    pub fn current() -> Self {
        #[cfg(target_os = "windows")]
        {
            Self {
                scripts_dir: "Scripts",
                python_exe: "python.exe",
            }
        }
        #[cfg(not(target_os = "windows"))]
        {
            Self {
                scripts_dir: "bin",
                python_exe: "python",
            }
        }
    }

    /// Path of the Python executable inside a venv rooted at `venv_root`.
    pub fn venv_python(&self, venv_root: &Path) -> PathBuf {
        venv_root.join(self.scripts_dir).join(self.python_exe)
    }
}

/// Apply platform-specific flags to hide the console window on Windows.
/// On non-Windows platforms, this is a no-op.
#[cfg(target_os = "windows")]
pub fn apply_creation_flags(cmd: &mut Command) -> &mut Command {
    use std::os::windows::process::CommandExt;
    const CREATE_NO_WINDOW: u32 = 0x08000000;
    cmd.creation_flags(CREATE_NO_WINDOW)
}

#[cfg(not(target_os = "windows"))]
pub fn apply_creation_flags(cmd: &mut Command) -> &mut Command {
    cmd
}
