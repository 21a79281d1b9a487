//! User-input provider.
//!
//! The bootstrap asks three questions: where the VM lives, which ISO to
//! install from, and how large the machine should be. Each call is a
//! suspension point with an explicit cancelled outcome
//! ([`BootstrapError::InputCancelled`]), which aborts the bootstrap.
//!
//! [`TerminalInput`] answers from command-line presets first and prompts on
//! the terminal for the rest. Non-numeric or non-positive answers are
//! re-prompted, never clamped.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::ParameterDefaults;
use crate::error::{BootstrapError, Result};
use crate::vm::{GIB, VmParameters};

/// Prompts before an invalid numeric answer becomes fatal.
pub const MAX_ATTEMPTS: usize = 3;

#[async_trait]
pub trait UserInput: Send {
    /// Directory holding the VM's persistent artifacts.
    async fn choose_directory(&mut self) -> Result<PathBuf>;

    /// Installation ISO.
    async fn choose_file(&mut self) -> Result<PathBuf>;

    /// Sizing parameters; the disk size is only asked for when it is needed.
    async fn prompt_parameters(
        &mut self,
        defaults: &ParameterDefaults,
        needs_disk_size: bool,
    ) -> Result<VmParameters>;
}

/// Answers supplied up front on the command line.
#[derive(Debug, Clone, Default)]
pub struct Presets {
    pub vm_dir: Option<PathBuf>,
    pub iso: Option<PathBuf>,
    pub cpus: Option<u32>,
    pub memory_gb: Option<u32>,
    pub disk_gb: Option<u32>,
}

pub struct TerminalInput<R, W> {
    presets: Presets,
    interactive: bool,
    reader: R,
    writer: W,
}

impl<R, W> TerminalInput<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// With `interactive == false`, anything not preset falls back to the
    /// defaults, and a missing directory or ISO counts as cancelled.
    pub fn new(presets: Presets, interactive: bool, reader: R, writer: W) -> Self {
        Self {
            presets,
            interactive,
            reader,
            writer,
        }
    }

    /// Print `prompt` and read one line. `None` means end of input.
    async fn ask(&mut self, prompt: &str) -> Result<Option<String>> {
        self.writer
            .write_all(prompt.as_bytes())
            .await
            .and(self.writer.flush().await)
            .map_err(|e| BootstrapError::io("write prompt to", "<terminal>", e))?;

        let mut line = String::new();
        let n = self
            .reader
            .read_line(&mut line)
            .await
            .map_err(|e| BootstrapError::io("read answer from", "<terminal>", e))?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim().to_string()))
    }

    async fn ask_path(&mut self, prompt: &str, what: &'static str) -> Result<PathBuf> {
        match self.ask(prompt).await? {
            Some(answer) if !answer.is_empty() => Ok(expand_home(&answer)),
            _ => Err(BootstrapError::InputCancelled { what }),
        }
    }

    async fn ask_number(&mut self, label: &'static str, default: u32) -> Result<u32> {
        let mut last_error = String::new();
        for _ in 0..MAX_ATTEMPTS {
            let Some(answer) = self.ask(&format!("{label} [{default}]: ")).await? else {
                return Err(BootstrapError::InputCancelled { what: label });
            };
            if answer.is_empty() {
                return Ok(default);
            }
            match parse_positive(&answer) {
                Ok(value) => return Ok(value),
                Err(e) => {
                    last_error = e;
                    self.writer
                        .write_all(format!("  {last_error}\n").as_bytes())
                        .await
                        .map_err(|e| BootstrapError::io("write prompt to", "<terminal>", e))?;
                }
            }
        }
        Err(BootstrapError::InvalidConfiguration {
            violations: vec![format!("{label}: {last_error}")],
        })
    }

    async fn number(&mut self, preset: Option<u32>, label: &'static str, default: u32) -> Result<u32> {
        match preset {
            Some(value) => Ok(value),
            None if self.interactive => self.ask_number(label, default).await,
            None => Ok(default),
        }
    }
}

#[async_trait]
impl<R, W> UserInput for TerminalInput<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn choose_directory(&mut self) -> Result<PathBuf> {
        const WHAT: &str = "VM storage directory";
        let dir = match self.presets.vm_dir.clone() {
            Some(dir) => dir,
            None if self.interactive => self.ask_path("Choose VM storage path: ", WHAT).await?,
            None => return Err(BootstrapError::InputCancelled { what: WHAT }),
        };

        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| BootstrapError::io("create VM storage directory", &dir, e))?;
        Ok(dir)
    }

    async fn choose_file(&mut self) -> Result<PathBuf> {
        const WHAT: &str = "installation ISO";
        match self.presets.iso.clone() {
            Some(iso) => Ok(iso),
            None if self.interactive => self.ask_path("Choose installation ISO file: ", WHAT).await,
            None => Err(BootstrapError::InputCancelled { what: WHAT }),
        }
    }

    async fn prompt_parameters(
        &mut self,
        defaults: &ParameterDefaults,
        needs_disk_size: bool,
    ) -> Result<VmParameters> {
        let cpu_count = self.number(self.presets.cpus, "CPU", defaults.cpu_count).await?;
        let memory_gb = self
            .number(self.presets.memory_gb, "RAM (GB)", defaults.memory_gb)
            .await?;
        let disk_size_gb = if needs_disk_size {
            Some(
                self.number(self.presets.disk_gb, "Disk (GB)", defaults.disk_size_gb)
                    .await?,
            )
        } else {
            None
        };

        Ok(VmParameters {
            cpu_count,
            memory_size_bytes: u64::from(memory_gb) * GIB,
            disk_size_gb,
        })
    }
}

/// Accept only whole numbers greater than zero.
pub fn parse_positive(raw: &str) -> std::result::Result<u32, String> {
    match raw.trim().parse::<u32>() {
        Ok(0) => Err(format!("'{raw}' must be greater than zero")),
        Ok(value) => Ok(value),
        Err(_) => Err(format!("'{raw}' is not a positive integer")),
    }
}

fn expand_home(raw: &str) -> PathBuf {
    match (raw.strip_prefix("~/"), std::env::var_os("HOME")) {
        (Some(rest), Some(home)) => Path::new(&home).join(rest),
        _ => PathBuf::from(raw),
    }
}
