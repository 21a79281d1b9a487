//! linux-vm: Linux virtual machine launcher
//!
//! Picks (or is told) a storage directory, installs a fresh guest from an ISO
//! when that directory has no disk image yet, otherwise resumes the existing
//! guest with its persisted machine identifier and EFI variable store.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tokio::io::BufReader;
use tracing::error;

use linux_vm_launcher::Bootstrap;
use linux_vm_launcher::config::Settings;
use linux_vm_launcher::input::{Presets, TerminalInput};
use linux_vm_launcher::logging;
use linux_vm_launcher::paths::AppPaths;
use linux_vm_launcher::vm::helper::HelperHypervisor;
use linux_vm_launcher::vm::{ConfigurationBuilder, FsStore};

/// Linux virtual machine launcher
#[derive(Parser, Debug)]
#[command(name = "linux-vm", version, about = "Install or resume a Linux virtual machine")]
struct Args {
    /// Directory holding Disk.img, NVRAM and MachineIdentifier
    #[arg(long)]
    vm_dir: Option<PathBuf>,

    /// Installation ISO (only used when the VM is not installed yet)
    #[arg(long)]
    iso: Option<PathBuf>,

    /// Number of virtual CPUs
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    cpus: Option<u32>,

    /// Memory size in GiB
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    memory_gb: Option<u32>,

    /// Size of a newly created disk image in GiB
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    disk_gb: Option<u32>,

    /// Never prompt; use defaults and fail if the directory or ISO is missing
    #[arg(long)]
    non_interactive: bool,

    /// Config file (default: ~/.config/linux-vm-launcher/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Hypervisor helper executable
    #[arg(long)]
    helper: Option<PathBuf>,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let _log_guard = logging::init();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("linux-vm: failed to create Tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(run(args));

    // Dropping the runtime kills the helper if it is still alive.
    runtime.shutdown_timeout(std::time::Duration::from_secs(1));

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "linux-vm failed");
            eprintln!("linux-vm: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let config_path = args
        .config
        .clone()
        .or_else(|| AppPaths::resolve().map(|p| p.config_file()));
    let settings = match config_path {
        Some(path) => Settings::load(&path)?,
        None => Settings::default(),
    };

    let presets = Presets {
        vm_dir: args.vm_dir,
        iso: args.iso,
        cpus: args.cpus,
        memory_gb: args.memory_gb,
        disk_gb: args.disk_gb,
    };
    let input = TerminalInput::new(
        presets,
        !args.non_interactive,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stderr(),
    );

    let hypervisor = HelperHypervisor::new(
        args.helper.or(settings.hypervisor.helper),
        settings.hypervisor.args,
    );

    let mut bootstrap = Bootstrap::new(
        FsStore,
        input,
        ConfigurationBuilder,
        hypervisor,
        settings.limits,
        settings.defaults,
    );
    bootstrap.run().await?;
    Ok(())
}
