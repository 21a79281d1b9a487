//! Application directory structure for linux-vm-launcher.
//!
//! - Config:  `~/.config/linux-vm-launcher/`  (human-editable, XDG-style)
//! - Logs:    `~/Library/Logs/linux-vm-launcher/` on macOS,
//!            `$XDG_DATA_HOME/linux-vm-launcher/logs/` elsewhere
//!
//! VM storage roots are chosen by the user on every run and are not managed
//! here.

use std::path::{Path, PathBuf};

pub const APP_NAME: &str = "linux-vm-launcher";

/// All resolved application directory paths.
#[derive(Debug, Clone)]
pub struct AppPaths {
    pub config: PathBuf,
    pub logs: PathBuf,
}

impl AppPaths {
    /// Resolve all paths from the user's home directory.
    /// Does not create any directories.
    pub fn resolve() -> Option<Self> {
        let home = std::env::var("HOME").ok().map(PathBuf::from)?;
        Some(Self {
            config: resolve_config_dir(&home),
            logs: resolve_log_dir(&home),
        })
    }

    pub fn config_file(&self) -> PathBuf {
        self.config.join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Platform-specific path resolution
// ---------------------------------------------------------------------------

fn resolve_config_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".config").join(APP_NAME)
    }
}

#[cfg(target_os = "macos")]
fn resolve_log_dir(home: &Path) -> PathBuf {
    home.join("Library").join("Logs").join(APP_NAME)
}

#[cfg(not(target_os = "macos"))]
fn resolve_log_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(xdg).join(APP_NAME).join("logs")
    } else {
        home.join(".local").join("share").join(APP_NAME).join("logs")
    }
}
