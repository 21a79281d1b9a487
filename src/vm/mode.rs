//! Install vs resume decision.

use std::fmt;

use crate::vm::StorageRoot;
use crate::vm::store::PersistentStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallMode {
    /// No disk image yet: create every artifact and boot the installer.
    Install,
    /// Disk image present: load the persisted identity and boot the disk.
    Resume,
}

impl fmt::Display for InstallMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Install => f.write_str("install"),
            Self::Resume => f.write_str("resume"),
        }
    }
}

/// The disk image is the only signal consulted. A run that died before the
/// image was created is therefore still an install on the next attempt.
pub fn decide(store: &impl PersistentStore, root: &StorageRoot) -> InstallMode {
    if store.disk_image_exists(root) {
        InstallMode::Resume
    } else {
        InstallMode::Install
    }
}
