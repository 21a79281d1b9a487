//! Persistent VM state under a [`StorageRoot`].
//!
//! ## Layout
//!
//! ```text
//! <root>/Disk.img            raw sparse disk image, fixed size
//! <root>/NVRAM               EFI variable store, opaque
//! <root>/MachineIdentifier   serialized machine identifier, opaque
//! ```
//!
//! The presence of `Disk.img` alone marks the machine as installed. Creation
//! of the other two artifacts only happens on the install path; the resume
//! path loads them and refuses to run when either is absent.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::Path;

use tracing::{debug, info};

use crate::error::{BootstrapError, Result};
use crate::vm::artifacts::{DiskImage, FirmwareVariableStore, MachineIdentifier};
use crate::vm::{GIB, StorageRoot};

/// Creation and loading of the three durable artifacts.
pub trait PersistentStore {
    fn disk_image_exists(&self, root: &StorageRoot) -> bool;

    /// Allocate `size_gb` GiB at `Disk.img`. A no-op if the file exists.
    fn create_disk_image(&self, root: &StorageRoot, size_gb: u32) -> Result<DiskImage>;

    /// Remove a disk image created during a bootstrap that later failed.
    fn discard_disk_image(&self, root: &StorageRoot) -> Result<()>;

    fn create_identity(&self, root: &StorageRoot) -> Result<MachineIdentifier>;

    fn load_identity(&self, root: &StorageRoot) -> Result<MachineIdentifier>;

    fn create_firmware_store(&self, root: &StorageRoot) -> Result<FirmwareVariableStore>;

    fn load_firmware_store(&self, root: &StorageRoot) -> Result<FirmwareVariableStore>;
}

/// [`PersistentStore`] backed by the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsStore;

impl PersistentStore for FsStore {
    fn disk_image_exists(&self, root: &StorageRoot) -> bool {
        root.disk_image_path().exists()
    }

    fn create_disk_image(&self, root: &StorageRoot, size_gb: u32) -> Result<DiskImage> {
        let path = root.disk_image_path();
        if size_gb == 0 {
            return Err(BootstrapError::InvalidConfiguration {
                violations: vec!["disk size must be at least 1 GiB".into()],
            });
        }

        let file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let size_bytes = std::fs::metadata(&path)
                    .map_err(|e| BootstrapError::io("inspect disk image", &path, e))?
                    .len();
                debug!(path = %path.display(), size_bytes, "disk image already exists");
                return Ok(DiskImage {
                    path,
                    size_bytes,
                    created: false,
                });
            }
            Err(e) => return Err(BootstrapError::io("create disk image", path, e)),
        };

        // set_len on a fresh file yields a sparse image; blocks are only
        // allocated once the guest writes them.
        let size_bytes = u64::from(size_gb) * GIB;
        if let Err(e) = file.set_len(size_bytes).and_then(|()| file.sync_all()) {
            drop(file);
            let _ = std::fs::remove_file(&path);
            return Err(BootstrapError::io("allocate disk image", path, e));
        }

        info!(path = %path.display(), size_gb, "created disk image");
        Ok(DiskImage {
            path,
            size_bytes,
            created: true,
        })
    }

    fn discard_disk_image(&self, root: &StorageRoot) -> Result<()> {
        let path = root.disk_image_path();
        match std::fs::remove_file(&path) {
            Ok(()) => {
                info!(path = %path.display(), "removed incomplete disk image");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BootstrapError::io("remove disk image", path, e)),
        }
    }

    fn create_identity(&self, root: &StorageRoot) -> Result<MachineIdentifier> {
        let path = root.machine_identifier_path();
        let identifier = MachineIdentifier::generate();
        write_synced(&path, identifier.data_representation())
            .map_err(|e| BootstrapError::io("write machine identifier", &path, e))?;

        info!(path = %path.display(), id = %identifier.uuid(), "created machine identifier");
        Ok(identifier)
    }

    fn load_identity(&self, root: &StorageRoot) -> Result<MachineIdentifier> {
        let path = root.machine_identifier_path();
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(missing_on_resume(&path));
            }
            Err(e) => return Err(BootstrapError::io("read machine identifier", path, e)),
        };

        let identifier = MachineIdentifier::from_data_representation(&data)
            .map_err(|reason| BootstrapError::CorruptState {
                path: path.clone(),
                reason,
            })?;

        debug!(path = %path.display(), id = %identifier.uuid(), "loaded machine identifier");
        Ok(identifier)
    }

    fn create_firmware_store(&self, root: &StorageRoot) -> Result<FirmwareVariableStore> {
        let path = root.firmware_store_path();
        write_synced(&path, &[])
            .map_err(|e| BootstrapError::io("create EFI variable store", &path, e))?;

        info!(path = %path.display(), "created EFI variable store");
        Ok(FirmwareVariableStore { path, fresh: true })
    }

    fn load_firmware_store(&self, root: &StorageRoot) -> Result<FirmwareVariableStore> {
        let path = root.firmware_store_path();
        match std::fs::metadata(&path) {
            Ok(meta) if meta.is_file() => {
                debug!(path = %path.display(), "loaded EFI variable store");
                Ok(FirmwareVariableStore { path, fresh: false })
            }
            Ok(_) => Err(BootstrapError::CorruptState {
                path,
                reason: "EFI variable store is not a regular file".into(),
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(missing_on_resume(&path)),
            Err(e) => Err(BootstrapError::io("inspect EFI variable store", path, e)),
        }
    }
}

fn missing_on_resume(path: &Path) -> BootstrapError {
    BootstrapError::MissingState {
        path: path.to_path_buf(),
        hint: format!(
            "the disk image exists but this artifact does not; delete {} to reinstall",
            crate::vm::DISK_IMAGE_NAME
        ),
    }
}

/// Replace `path` with `contents` and flush to disk.
fn write_synced(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
