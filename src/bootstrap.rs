//! Top-level bootstrap sequence.
//!
//! ```text
//! Uninitialized → RootChosen → ModeDecided → ArtifactsReady → ConfigBuilt
//!   → ConfigValidated → Instantiated → Starting → Running → Terminated
//! ```
//!
//! Every step up to `Starting` is synchronous from the caller's point of view
//! and fatal on failure; there is no retry. `Running → Terminated` is driven
//! by hypervisor events through [`LifecycleMonitor`].
//!
//! A disk image created by this run is discarded again if the run fails
//! before the guest reached `Running`, so the next run is still an install.

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::ParameterDefaults;
use crate::error::{BootstrapError, Result};
use crate::input::UserInput;
use crate::vm::{
    ConfigurationBuilder, FirmwareVariableStore, Hypervisor, InstallMedia, InstallMode,
    LifecycleMonitor, MachineIdentifier, PersistentStore, PlatformLimits, RunEvent, StorageRoot,
    Termination, ValidatedConfiguration, VirtualMachine, VmEvent, VmParameters,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    RootChosen,
    ModeDecided,
    ArtifactsReady,
    ConfigBuilt,
    ConfigValidated,
    Instantiated,
    Starting,
    Running,
    Terminated,
}

/// Identity artifacts produced by the install or resume branch.
struct Artifacts {
    identifier: MachineIdentifier,
    firmware_store: FirmwareVariableStore,
    install_media: Option<InstallMedia>,
}

pub struct Bootstrap<S, I, H> {
    store: S,
    input: I,
    builder: ConfigurationBuilder,
    hypervisor: H,
    limits: PlatformLimits,
    defaults: ParameterDefaults,
    history: Vec<Phase>,
    /// Root whose disk image this run created and no guest has booted yet.
    unbooted_disk: Option<StorageRoot>,
}

impl<S, I, H> Bootstrap<S, I, H>
where
    S: PersistentStore,
    I: UserInput,
    H: Hypervisor,
{
    pub fn new(
        store: S,
        input: I,
        builder: ConfigurationBuilder,
        hypervisor: H,
        limits: PlatformLimits,
        defaults: ParameterDefaults,
    ) -> Self {
        Self {
            store,
            input,
            builder,
            hypervisor,
            limits,
            defaults,
            history: vec![Phase::Uninitialized],
            unbooted_disk: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.history.last().copied().unwrap_or(Phase::Uninitialized)
    }

    /// Every phase entered so far, in order.
    pub fn history(&self) -> &[Phase] {
        &self.history
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn hypervisor(&self) -> &H {
        &self.hypervisor
    }

    fn advance(&mut self, phase: Phase) {
        info!(?phase, "bootstrap phase");
        self.history.push(phase);
    }

    /// Bootstrap and run the machine until it stops.
    ///
    /// `Ok(())` means the guest shut itself down cleanly.
    pub async fn run(&mut self) -> Result<()> {
        let config = self.prepare().await?;
        self.launch(config).await
    }

    /// Steps up to and including validation.
    pub async fn prepare(&mut self) -> Result<ValidatedConfiguration> {
        let result = self.prepare_steps().await;
        if result.is_err() {
            self.discard_unbooted_disk();
        }
        result
    }

    async fn prepare_steps(&mut self) -> Result<ValidatedConfiguration> {
        let dir = self.input.choose_directory().await?;
        let root = StorageRoot::open(&dir)?;
        info!(root = %root.path().display(), "VM storage root");
        self.advance(Phase::RootChosen);

        let mode = crate::vm::decide(&self.store, &root);
        info!(%mode, "install mode decided");
        self.advance(Phase::ModeDecided);

        let params = self
            .input
            .prompt_parameters(&self.defaults, mode == InstallMode::Install)
            .await?;

        let artifacts = match mode {
            InstallMode::Install => self.install(&root, &params).await?,
            InstallMode::Resume => Artifacts {
                identifier: self.store.load_identity(&root)?,
                firmware_store: self.store.load_firmware_store(&root)?,
                install_media: None,
            },
        };
        self.advance(Phase::ArtifactsReady);

        let config = self.builder.build(
            &params,
            mode,
            &root.disk_image_path(),
            artifacts.identifier,
            artifacts.firmware_store,
            artifacts.install_media.as_ref(),
        );
        self.advance(Phase::ConfigBuilt);

        let config = config.validate(&self.limits)?;
        self.advance(Phase::ConfigValidated);

        Ok(config)
    }

    async fn install(&mut self, root: &StorageRoot, params: &VmParameters) -> Result<Artifacts> {
        let size_gb = params
            .disk_size_gb
            .ok_or_else(|| BootstrapError::InvalidConfiguration {
                violations: vec!["install mode requires a disk size".into()],
            })?;

        let disk = self.store.create_disk_image(root, size_gb)?;
        if disk.created {
            self.unbooted_disk = Some(root.clone());
        }

        let media = InstallMedia::open(self.input.choose_file().await?)?;
        let identifier = self.store.create_identity(root)?;
        let firmware_store = self.store.create_firmware_store(root)?;
        Ok(Artifacts {
            identifier,
            firmware_store,
            install_media: Some(media),
        })
    }

    /// Instantiate, start and supervise the machine.
    pub async fn launch(&mut self, config: ValidatedConfiguration) -> Result<()> {
        let mut monitor = LifecycleMonitor::new();
        let result = self.supervise(config, &mut monitor).await;
        if monitor.reached_running() {
            // The guest owns the disk now, even if it later failed.
            self.unbooted_disk = None;
        } else if result.is_err() {
            self.discard_unbooted_disk();
        }
        result
    }

    async fn supervise(
        &mut self,
        config: ValidatedConfiguration,
        monitor: &mut LifecycleMonitor,
    ) -> Result<()> {
        let mut machine = self.hypervisor.instantiate(config);
        self.advance(Phase::Instantiated);

        let (sink, mut events) = mpsc::unbounded_channel();
        machine.register_event_sink(sink);

        monitor.handle(RunEvent::StartRequested);
        self.advance(Phase::Starting);

        let started = match machine.start().await {
            Ok(()) => RunEvent::Started,
            Err(e) => RunEvent::Vm(VmEvent::StartFailed(format!("{e:#}"))),
        };
        if let Some(termination) = self.observe(monitor, started) {
            return termination.into_result();
        }

        while let Some(event) = events.recv().await {
            if let Some(termination) = self.observe(monitor, RunEvent::Vm(event)) {
                return termination.into_result();
            }
        }

        self.advance(Phase::Terminated);
        Err(BootstrapError::RuntimeFailure(
            "event stream closed before the machine stopped".into(),
        ))
    }

    /// Remove a disk image created by this run so the root reads as uninstalled.
    fn discard_unbooted_disk(&mut self) {
        let Some(root) = self.unbooted_disk.take() else {
            return;
        };
        if let Err(e) = self.store.discard_disk_image(&root) {
            warn!(error = %e, "could not remove incomplete disk image");
        }
    }

    fn observe(&mut self, monitor: &mut LifecycleMonitor, event: RunEvent) -> Option<Termination> {
        let termination = monitor.handle(event);
        if monitor.is_running() && self.phase() != Phase::Running {
            self.advance(Phase::Running);
        }
        if termination.is_some() {
            self.advance(Phase::Terminated);
        }
        termination
    }
}
