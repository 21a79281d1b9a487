//! User configuration file.
//!
//! Read from `~/.config/linux-vm-launcher/config.toml` (or `--config`). Every
//! table and key is optional; a missing file means built-in defaults.
//!
//! ```toml
//! [defaults]
//! cpu_count = 2
//! memory_gb = 4
//! disk_size_gb = 10
//!
//! [limits]
//! max_cpu_count = 8
//! min_memory_mb = 128
//! max_memory_gb = 64
//! max_storage_devices = 8
//!
//! [hypervisor]
//! helper = "/usr/local/bin/linux-vm-helper"
//! args = ["--gui"]
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::debug;

use crate::vm::PlatformLimits;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub defaults: ParameterDefaults,
    pub limits: PlatformLimits,
    pub hypervisor: HypervisorSettings,
}

/// Values offered when prompting for VM sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ParameterDefaults {
    pub cpu_count: u32,
    pub memory_gb: u32,
    pub disk_size_gb: u32,
}

impl Default for ParameterDefaults {
    fn default() -> Self {
        Self {
            cpu_count: 2,
            memory_gb: 4,
            disk_size_gb: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HypervisorSettings {
    /// Helper executable; a bare name is looked up on `PATH`.
    pub helper: Option<PathBuf>,
    /// Extra arguments passed to the helper before anything else.
    pub args: Vec<String>,
}

impl Settings {
    /// Load settings from `path`, falling back to defaults if it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                Self::from_toml(&content).with_context(|| format!("parse {}", path.display()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no config file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e).with_context(|| format!("read {}", path.display())),
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let settings: Self = toml::from_str(content)?;

        let d = &settings.defaults;
        for (key, value) in [
            ("defaults.cpu_count", d.cpu_count),
            ("defaults.memory_gb", d.memory_gb),
            ("defaults.disk_size_gb", d.disk_size_gb),
        ] {
            if value == 0 {
                bail!("{key} must be a positive integer");
            }
        }
        if settings.limits.min_cpu_count > settings.limits.max_cpu_count {
            bail!("limits.min_cpu_count exceeds limits.max_cpu_count");
        }

        Ok(settings)
    }
}
