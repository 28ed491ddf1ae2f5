//! Application directories for hakc.
//!
//! - Linux/macOS: `~/.hakc`
//! - Windows: `%APPDATA%\hakc`
//!
//! Can be overridden with the `HAKC_HOME` environment variable.

use std::path::PathBuf;

/// Application name for directory paths
pub const APP_NAME: &str = "hakc";

/// Primary home directory name on Linux/macOS
pub const HOME_DIR_NAME: &str = ".hakc";

/// Application directories structure
#[derive(Debug, Clone)]
pub struct AppDirs {
    /// Configuration directory (config.json lives here)
    pub config_dir: PathBuf,
    /// Log directory
    pub log_dir: PathBuf,
}

impl AppDirs {
    /// Get application directories, respecting `HAKC_HOME`.
    ///
    /// Relative `HAKC_HOME` values are resolved against the current directory.
    pub fn new() -> Option<Self> {
        if let Ok(home) = std::env::var("HAKC_HOME") {
            let home = PathBuf::from(home);
            let home = if home.is_relative() {
                std::env::current_dir().ok()?.join(home)
            } else {
                home
            };
            return Some(Self::rooted_at(home));
        }

        #[cfg(target_os = "windows")]
        let root = dirs::config_dir()?.join(APP_NAME);

        #[cfg(not(target_os = "windows"))]
        let root = dirs::home_dir()?.join(HOME_DIR_NAME);

        Some(Self::rooted_at(root))
    }

    fn rooted_at(root: PathBuf) -> Self {
        Self {
            log_dir: root.join("logs"),
            config_dir: root,
        }
    }

    /// Path of the user configuration file.
    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.json")
    }

    /// Default log file path.
    pub fn log_file(&self) -> PathBuf {
        self.log_dir.join("hakc.log")
    }
}

/// Get the application directories.
pub fn get_app_dirs() -> Option<AppDirs> {
    AppDirs::new()
}
