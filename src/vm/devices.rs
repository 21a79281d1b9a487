//! Virtual hardware description and its validation.
//!
//! [`ConfigurationBuilder::build`] is pure assembly: it copies the sizing
//! parameters and attaches the identity artifacts without interpreting them.
//! Range and cardinality checks all live in [`DeviceConfiguration::validate`],
//! which is the only way to obtain a [`ValidatedConfiguration`], the type the
//! hypervisor accepts.
//!
//! ```text
//! platform      machine identifier
//! boot loader   EFI, variable store
//! storage       [install media (usb, ro)]?, primary disk (virtio-blk, rw)
//! network       virtio-net, NAT
//! graphics      virtio-gpu, one 1280x720 scanout
//! audio         virtio-sound input (host default source)
//!               virtio-sound output (host default sink)
//! input         usb keyboard, usb screen-coordinate pointer
//! console       virtio-console, spice agent port
//! ```

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{BootstrapError, Result};
use crate::vm::artifacts::{FirmwareVariableStore, MachineIdentifier};
use crate::vm::mode::InstallMode;
use crate::vm::{GIB, InstallMedia, VmParameters};

pub const SCANOUT_WIDTH: u32 = 1280;
pub const SCANOUT_HEIGHT: u32 = 720;

/// Port name guest spice-vdagent looks for.
pub const SPICE_AGENT_PORT_NAME: &str = "com.redhat.spice.0";

/// Guest memory must be a whole number of MiB.
pub const MEMORY_GRANULARITY: u64 = 1024 * 1024;

// ---------------------------------------------------------------------------
// Device descriptors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageRole {
    InstallMedia,
    PrimaryDisk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBus {
    UsbMassStorage,
    VirtioBlock,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StorageDevice {
    pub role: StorageRole,
    pub bus: StorageBus,
    pub path: PathBuf,
    pub read_only: bool,
}

impl StorageDevice {
    pub fn install_media(media: &InstallMedia) -> Self {
        Self {
            role: StorageRole::InstallMedia,
            bus: StorageBus::UsbMassStorage,
            path: media.path().to_path_buf(),
            read_only: true,
        }
    }

    pub fn primary_disk(path: &Path) -> Self {
        Self {
            role: StorageRole::PrimaryDisk,
            bus: StorageBus::VirtioBlock,
            path: path.to_path_buf(),
            read_only: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkAttachment {
    Nat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkDevice {
    pub attachment: NetworkAttachment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Scanout {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphicsDevice {
    pub scanouts: Vec<Scanout>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioDirection {
    Input,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HostAudioEndpoint {
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AudioStream {
    pub direction: AudioDirection,
    pub host: HostAudioEndpoint,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AudioDevice {
    pub streams: Vec<AudioStream>,
}

impl AudioDevice {
    fn single(direction: AudioDirection) -> Self {
        Self {
            streams: vec![AudioStream {
                direction,
                host: HostAudioEndpoint::Default,
            }],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Keyboard {
    Usb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PointingDevice {
    /// Absolute coordinates, so the host cursor maps 1:1 onto the guest.
    UsbScreenCoordinate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsoleAttachment {
    SpiceAgent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsolePort {
    pub name: String,
    pub attachment: ConsoleAttachment,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsoleDevice {
    pub ports: Vec<ConsolePort>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Platform {
    pub machine_identifier: MachineIdentifier,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BootLoader {
    Efi { variable_store: FirmwareVariableStore },
}

/// Complete virtual hardware description of one machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceConfiguration {
    pub mode: InstallMode,
    pub cpu_count: u32,
    pub memory_size_bytes: u64,
    pub platform: Platform,
    pub boot_loader: BootLoader,
    /// Boot preference follows order: install media, when present, comes first.
    pub storage_devices: Vec<StorageDevice>,
    pub network_devices: Vec<NetworkDevice>,
    pub graphics_devices: Vec<GraphicsDevice>,
    pub audio_devices: Vec<AudioDevice>,
    pub keyboards: Vec<Keyboard>,
    pub pointing_devices: Vec<PointingDevice>,
    pub console_devices: Vec<ConsoleDevice>,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct ConfigurationBuilder;

impl ConfigurationBuilder {
    pub fn build(
        &self,
        params: &VmParameters,
        mode: InstallMode,
        disk_image: &Path,
        identifier: MachineIdentifier,
        firmware_store: FirmwareVariableStore,
        install_media: Option<&InstallMedia>,
    ) -> DeviceConfiguration {
        let storage_devices = match (mode, install_media) {
            (InstallMode::Install, Some(media)) => vec![
                StorageDevice::install_media(media),
                StorageDevice::primary_disk(disk_image),
            ],
            _ => vec![StorageDevice::primary_disk(disk_image)],
        };

        DeviceConfiguration {
            mode,
            cpu_count: params.cpu_count,
            memory_size_bytes: params.memory_size_bytes,
            platform: Platform {
                machine_identifier: identifier,
            },
            boot_loader: BootLoader::Efi {
                variable_store: firmware_store,
            },
            storage_devices,
            network_devices: vec![NetworkDevice {
                attachment: NetworkAttachment::Nat,
            }],
            graphics_devices: vec![GraphicsDevice {
                scanouts: vec![Scanout {
                    width: SCANOUT_WIDTH,
                    height: SCANOUT_HEIGHT,
                }],
            }],
            audio_devices: vec![
                AudioDevice::single(AudioDirection::Input),
                AudioDevice::single(AudioDirection::Output),
            ],
            keyboards: vec![Keyboard::Usb],
            pointing_devices: vec![PointingDevice::UsbScreenCoordinate],
            console_devices: vec![ConsoleDevice {
                ports: vec![ConsolePort {
                    name: SPICE_AGENT_PORT_NAME.to_string(),
                    attachment: ConsoleAttachment::SpiceAgent,
                }],
            }],
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Host constraints a configuration must satisfy.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PlatformLimits {
    pub min_cpu_count: u32,
    pub max_cpu_count: u32,
    pub min_memory_mb: u64,
    pub max_memory_gb: u64,
    pub max_storage_devices: usize,
}

impl Default for PlatformLimits {
    fn default() -> Self {
        let host_cpus = std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1);
        Self {
            min_cpu_count: 1,
            max_cpu_count: u32::try_from(host_cpus).unwrap_or(u32::MAX),
            min_memory_mb: 128,
            max_memory_gb: 1024,
            max_storage_devices: 8,
        }
    }
}

impl PlatformLimits {
    pub fn min_memory_bytes(&self) -> u64 {
        self.min_memory_mb.saturating_mul(MEMORY_GRANULARITY)
    }

    pub fn max_memory_bytes(&self) -> u64 {
        self.max_memory_gb.saturating_mul(GIB)
    }
}

/// A configuration that passed [`DeviceConfiguration::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ValidatedConfiguration(DeviceConfiguration);

impl ValidatedConfiguration {
    pub fn config(&self) -> &DeviceConfiguration {
        &self.0
    }

    pub fn into_inner(self) -> DeviceConfiguration {
        self.0
    }
}

impl DeviceConfiguration {
    /// Check the configuration against `limits`, reporting every violation.
    pub fn validate(self, limits: &PlatformLimits) -> Result<ValidatedConfiguration> {
        let violations = self.violations(limits);
        if violations.is_empty() {
            Ok(ValidatedConfiguration(self))
        } else {
            Err(BootstrapError::InvalidConfiguration { violations })
        }
    }

    fn violations(&self, limits: &PlatformLimits) -> Vec<String> {
        let mut v = Vec::new();

        if self.cpu_count < limits.min_cpu_count {
            v.push(format!(
                "cpu count {} below minimum {}",
                self.cpu_count, limits.min_cpu_count
            ));
        }
        if self.cpu_count > limits.max_cpu_count {
            v.push(format!(
                "cpu count {} above maximum {}",
                self.cpu_count, limits.max_cpu_count
            ));
        }

        if self.memory_size_bytes < limits.min_memory_bytes() {
            v.push(format!(
                "memory size {} bytes below minimum {}",
                self.memory_size_bytes,
                limits.min_memory_bytes()
            ));
        }
        if self.memory_size_bytes > limits.max_memory_bytes() {
            v.push(format!(
                "memory size {} bytes above maximum {}",
                self.memory_size_bytes,
                limits.max_memory_bytes()
            ));
        }
        if self.memory_size_bytes % MEMORY_GRANULARITY != 0 {
            v.push(format!(
                "memory size {} bytes is not a multiple of {MEMORY_GRANULARITY}",
                self.memory_size_bytes
            ));
        }

        self.storage_violations(limits, &mut v);

        let BootLoader::Efi { variable_store } = &self.boot_loader;
        match (self.mode, variable_store.fresh) {
            (InstallMode::Install, false) => {
                v.push("install mode requires a freshly created EFI variable store".into())
            }
            (InstallMode::Resume, true) => {
                v.push("resume mode must load the existing EFI variable store".into())
            }
            _ => {}
        }

        if self.network_devices.len() != 1 {
            v.push(format!(
                "expected exactly one network device, found {}",
                self.network_devices.len()
            ));
        }

        match self.graphics_devices.as_slice() {
            [gpu] => {
                if gpu.scanouts.is_empty() {
                    v.push("graphics device has no scanout".into());
                }
                if gpu.scanouts.iter().any(|s| s.width == 0 || s.height == 0) {
                    v.push("graphics scanout has a zero dimension".into());
                }
            }
            other => v.push(format!(
                "expected exactly one graphics device, found {}",
                other.len()
            )),
        }

        let streams: Vec<_> = self.audio_devices.iter().flat_map(|d| &d.streams).collect();
        for direction in [AudioDirection::Input, AudioDirection::Output] {
            let n = streams.iter().filter(|s| s.direction == direction).count();
            if n != 1 {
                v.push(format!("expected exactly one {direction:?} audio stream, found {n}"));
            }
        }
        if self.audio_devices.iter().any(|d| d.streams.is_empty()) {
            v.push("audio device without streams".into());
        }

        if self.keyboards.len() != 1 {
            v.push(format!("expected exactly one keyboard, found {}", self.keyboards.len()));
        }
        if self.pointing_devices.len() != 1 {
            v.push(format!(
                "expected exactly one pointing device, found {}",
                self.pointing_devices.len()
            ));
        }

        match self.console_devices.as_slice() {
            [console] => {
                if console.ports.is_empty() {
                    v.push("console device has no ports".into());
                }
                if console.ports.iter().any(|p| p.name.is_empty()) {
                    v.push("console port without a name".into());
                }
            }
            other => v.push(format!(
                "expected exactly one console device, found {}",
                other.len()
            )),
        }

        v
    }

    fn storage_violations(&self, limits: &PlatformLimits, v: &mut Vec<String>) {
        let devices = &self.storage_devices;
        if devices.len() > limits.max_storage_devices {
            v.push(format!(
                "{} storage devices exceed the limit of {}",
                devices.len(),
                limits.max_storage_devices
            ));
        }

        let disks: Vec<usize> = positions(devices, StorageRole::PrimaryDisk);
        let media: Vec<usize> = positions(devices, StorageRole::InstallMedia);

        if disks.len() != 1 {
            v.push(format!("expected exactly one primary disk, found {}", disks.len()));
        }
        if devices
            .iter()
            .any(|d| d.role == StorageRole::PrimaryDisk && d.read_only)
        {
            v.push("primary disk must be writable".into());
        }
        if devices
            .iter()
            .any(|d| d.role == StorageRole::InstallMedia && !d.read_only)
        {
            v.push("install media must be read-only".into());
        }

        match self.mode {
            InstallMode::Install => {
                if media.len() != 1 {
                    v.push(format!(
                        "install mode requires exactly one install media device, found {}",
                        media.len()
                    ));
                }
                if let (Some(&m), Some(&d)) = (media.first(), disks.first()) {
                    if m > d {
                        v.push("install media must precede the primary disk".into());
                    }
                }
            }
            InstallMode::Resume => {
                if !media.is_empty() {
                    v.push("resume mode must not attach install media".into());
                }
            }
        }
    }
}

fn positions(devices: &[StorageDevice], role: StorageRole) -> Vec<usize> {
    devices
        .iter()
        .enumerate()
        .filter(|(_, d)| d.role == role)
        .map(|(i, _)| i)
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> VmParameters {
        VmParameters {
            cpu_count: 1,
            memory_size_bytes: 2 * GIB,
            disk_size_gb: Some(20),
        }
    }

    fn store(fresh: bool) -> FirmwareVariableStore {
        FirmwareVariableStore {
            path: PathBuf::from("/vm/NVRAM"),
            fresh,
        }
    }

    /// The ISO is removed when the returned directory guard drops.
    fn media() -> (tempfile::TempDir, InstallMedia) {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("debian-12-arm64.iso");
        std::fs::write(&file, b"CD001").unwrap();
        let media = InstallMedia::open(&file).unwrap();
        (dir, media)
    }

    fn install_config() -> DeviceConfiguration {
        let (_dir, media) = media();
        ConfigurationBuilder.build(
            &params(),
            InstallMode::Install,
            Path::new("/vm/Disk.img"),
            MachineIdentifier::generate(),
            store(true),
            Some(&media),
        )
    }

    fn resume_config() -> DeviceConfiguration {
        ConfigurationBuilder.build(
            &params(),
            InstallMode::Resume,
            Path::new("/vm/Disk.img"),
            MachineIdentifier::generate(),
            store(false),
            None,
        )
    }

    fn limits() -> PlatformLimits {
        PlatformLimits {
            max_cpu_count: 8,
            ..PlatformLimits::default()
        }
    }

    #[test]
    fn install_puts_media_before_disk() {
        let config = install_config();
        let roles: Vec<_> = config.storage_devices.iter().map(|d| d.role).collect();
        assert_eq!(roles, vec![StorageRole::InstallMedia, StorageRole::PrimaryDisk]);
        assert!(config.storage_devices[0].read_only);
        assert!(!config.storage_devices[1].read_only);
    }

    #[test]
    fn resume_has_only_the_disk() {
        let config = resume_config();
        assert_eq!(config.storage_devices.len(), 1);
        assert_eq!(config.storage_devices[0].role, StorageRole::PrimaryDisk);
    }

    #[test]
    fn fixed_peripherals() {
        let config = resume_config();
        assert_eq!(config.network_devices.len(), 1);
        assert_eq!(config.network_devices[0].attachment, NetworkAttachment::Nat);
        assert_eq!(
            config.graphics_devices[0].scanouts,
            vec![Scanout { width: 1280, height: 720 }]
        );
        assert_eq!(config.audio_devices.len(), 2);
        assert_eq!(config.audio_devices[0].streams[0].direction, AudioDirection::Input);
        assert_eq!(config.audio_devices[1].streams[0].direction, AudioDirection::Output);
        assert_eq!(config.keyboards, vec![Keyboard::Usb]);
        assert_eq!(config.pointing_devices, vec![PointingDevice::UsbScreenCoordinate]);
        assert_eq!(config.console_devices[0].ports[0].name, SPICE_AGENT_PORT_NAME);
    }

    #[test]
    fn sizing_is_copied_verbatim() {
        let config = ConfigurationBuilder.build(
            &VmParameters {
                cpu_count: 0,
                memory_size_bytes: 0,
                disk_size_gb: None,
            },
            InstallMode::Resume,
            Path::new("/vm/Disk.img"),
            MachineIdentifier::generate(),
            store(false),
            None,
        );
        assert_eq!(config.cpu_count, 0);
        assert_eq!(config.memory_size_bytes, 0);
    }

    #[test]
    fn built_configurations_validate() {
        assert!(install_config().validate(&limits()).is_ok());
        assert!(resume_config().validate(&limits()).is_ok());
    }

    #[test]
    fn rejects_zero_cpus() {
        let mut config = resume_config();
        config.cpu_count = 0;
        let err = config.validate(&limits()).unwrap_err();
        assert!(err.to_string().contains("cpu count 0 below minimum 1"));
    }

    #[test]
    fn rejects_zero_memory() {
        let mut config = resume_config();
        config.memory_size_bytes = 0;
        let err = config.validate(&limits()).unwrap_err();
        assert!(matches!(err, BootstrapError::InvalidConfiguration { .. }));
        assert!(err.to_string().contains("memory size 0 bytes below minimum"));
    }

    #[test]
    fn rejects_cpus_above_host() {
        let mut config = resume_config();
        config.cpu_count = 9;
        assert!(config.validate(&limits()).is_err());
    }

    #[test]
    fn rejects_unaligned_memory() {
        let mut config = resume_config();
        config.memory_size_bytes = 2 * GIB + 512;
        let err = config.validate(&limits()).unwrap_err();
        assert!(err.to_string().contains("not a multiple"));
    }

    #[test]
    fn reports_every_violation() {
        let mut config = resume_config();
        config.cpu_count = 0;
        config.network_devices.clear();
        config.keyboards.clear();
        match config.validate(&limits()) {
            Err(BootstrapError::InvalidConfiguration { violations }) => {
                assert_eq!(violations.len(), 3, "{violations:?}");
            }
            other => panic!("expected InvalidConfiguration, got {other:?}"),
        }
    }

    #[test]
    fn install_without_media_is_invalid() {
        let config = ConfigurationBuilder.build(
            &params(),
            InstallMode::Install,
            Path::new("/vm/Disk.img"),
            MachineIdentifier::generate(),
            store(true),
            None,
        );
        assert_eq!(config.storage_devices.len(), 1);
        let err = config.validate(&limits()).unwrap_err();
        assert!(err.to_string().contains("install media"));
    }

    #[test]
    fn media_after_disk_is_invalid() {
        let mut config = install_config();
        config.storage_devices.reverse();
        let err = config.validate(&limits()).unwrap_err();
        assert!(err.to_string().contains("precede"));
    }

    #[test]
    fn resume_with_fresh_store_is_invalid() {
        let mut config = resume_config();
        config.boot_loader = BootLoader::Efi {
            variable_store: store(true),
        };
        assert!(config.validate(&limits()).is_err());
    }

    #[test]
    fn serializes_for_the_helper() {
        let config = install_config();
        let json = serde_json::to_value(config.validate(&limits()).unwrap()).unwrap();
        assert_eq!(json["mode"], "install");
        assert_eq!(json["storage_devices"][0]["role"], "install_media");
        assert_eq!(json["storage_devices"][0]["bus"], "usb_mass_storage");
        assert_eq!(json["storage_devices"][1]["role"], "primary_disk");
        assert_eq!(json["boot_loader"]["kind"], "efi");
        assert_eq!(json["boot_loader"]["variable_store"]["fresh"], true);
        assert_eq!(json["network_devices"][0]["attachment"], "nat");
        assert!(json["platform"]["machine_identifier"].is_string());
    }
}
