//! VM management module for linux-vm-launcher.
//!
//! Provides the persistent artifacts that give a guest its identity
//! (disk image, firmware variable store, machine identifier), the
//! install/resume decision, device configuration assembly and validation,
//! the hypervisor capability seam, and the run lifecycle.

use std::path::{Path, PathBuf};

use crate::error::{BootstrapError, Result};

pub mod artifacts;
pub mod devices;
pub mod helper;
pub mod hypervisor;
pub mod lifecycle;
pub mod mode;
pub mod store;

// ---------------------------------------------------------------------------
// Shared types used across submodules
// ---------------------------------------------------------------------------

pub const GIB: u64 = 1024 * 1024 * 1024;

pub const DISK_IMAGE_NAME: &str = "Disk.img";
pub const FIRMWARE_STORE_NAME: &str = "NVRAM";
pub const MACHINE_IDENTIFIER_NAME: &str = "MachineIdentifier";

/// Directory owning every persistent artifact of one virtual machine.
///
/// Apart from a short-lived write check in [`StorageRoot::open`], only the
/// three files named above are ever written below it. Two processes pointed at
/// the same root at once is unsupported and not guarded against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageRoot {
    path: PathBuf,
}

impl StorageRoot {
    /// Canonicalize `path` and check that it is a writable directory.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let canonical = std::fs::canonicalize(path)
            .map_err(|e| BootstrapError::io("resolve storage root", path, e))?;
        let meta = std::fs::metadata(&canonical)
            .map_err(|e| BootstrapError::io("inspect storage root", &canonical, e))?;

        if !meta.is_dir() {
            return Err(BootstrapError::io(
                "use storage root",
                canonical,
                std::io::Error::from(std::io::ErrorKind::NotADirectory),
            ));
        }
        // Mode bits say nothing about ownership or ACLs; try an actual write.
        check_writable(&canonical)
            .map_err(|e| BootstrapError::io("write to storage root", &canonical, e))?;

        Ok(Self { path: canonical })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn disk_image_path(&self) -> PathBuf {
        self.path.join(DISK_IMAGE_NAME)
    }

    pub fn firmware_store_path(&self) -> PathBuf {
        self.path.join(FIRMWARE_STORE_NAME)
    }

    pub fn machine_identifier_path(&self) -> PathBuf {
        self.path.join(MACHINE_IDENTIFIER_NAME)
    }
}

fn check_writable(dir: &Path) -> std::io::Result<()> {
    let probe = dir.join(format!(".linux-vm-write-check-{}", std::process::id()));
    std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&probe)?;
    std::fs::remove_file(&probe)
}

/// Sizing parameters collected from the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmParameters {
    pub cpu_count: u32,
    pub memory_size_bytes: u64,
    /// Only collected when the disk image still has to be created.
    pub disk_size_gb: Option<u32>,
}

/// Read-only installation medium attached as a temporary boot device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallMedia {
    path: PathBuf,
}

impl InstallMedia {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match std::fs::metadata(path) {
            Ok(meta) if meta.is_file() => Ok(Self {
                path: path.to_path_buf(),
            }),
            Ok(_) => Err(BootstrapError::MissingState {
                path: path.to_path_buf(),
                hint: "installation media must be a regular file".into(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(BootstrapError::MissingState {
                path: path.to_path_buf(),
                hint: "installation ISO not found".into(),
            }),
            Err(e) => Err(BootstrapError::io("inspect installation media", path, e)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use artifacts::{DiskImage, FirmwareVariableStore, MachineIdentifier};
pub use devices::{ConfigurationBuilder, DeviceConfiguration, PlatformLimits, ValidatedConfiguration};
pub use hypervisor::{EventSink, Hypervisor, VirtualMachine};
pub use lifecycle::{LifecycleMonitor, RunEvent, Termination, VmEvent};
pub use mode::{InstallMode, decide};
pub use store::{FsStore, PersistentStore};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_root_paths_live_under_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = StorageRoot::open(dir.path()).unwrap();

        assert!(root.disk_image_path().ends_with("Disk.img"));
        assert!(root.firmware_store_path().ends_with("NVRAM"));
        assert!(root.machine_identifier_path().ends_with("MachineIdentifier"));
        assert!(root.disk_image_path().starts_with(root.path()));
        assert!(root.path().is_absolute());
    }

    #[test]
    fn storage_root_rejects_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let err = StorageRoot::open(dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, BootstrapError::Io { .. }));
    }

    #[test]
    fn storage_root_rejects_plain_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("file");
        std::fs::write(&file, b"x").unwrap();
        assert!(StorageRoot::open(&file).is_err());
    }

    #[test]
    fn storage_root_write_check_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        StorageRoot::open(dir.path()).unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn storage_root_rejects_unwritable_directory() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let locked = dir.path().join("locked");
        std::fs::create_dir(&locked).unwrap();
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o555)).unwrap();

        // Privileged users write through mode bits; nothing to check then.
        let bypass = std::fs::write(locked.join("x"), b"").is_ok();
        if !bypass {
            let err = StorageRoot::open(&locked).unwrap_err();
            assert!(matches!(err, BootstrapError::Io { .. }));
        }

        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn install_media_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let err = InstallMedia::open(dir.path().join("debian.iso")).unwrap_err();
        assert!(matches!(err, BootstrapError::MissingState { .. }));

        let iso = dir.path().join("debian.iso");
        std::fs::write(&iso, b"CD001").unwrap();
        assert_eq!(InstallMedia::open(&iso).unwrap().path(), iso.as_path());
    }

    #[test]
    fn install_media_rejects_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(InstallMedia::open(dir.path()).is_err());
    }
}
