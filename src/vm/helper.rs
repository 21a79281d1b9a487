//! Hypervisor backed by an external helper process.
//!
//! The helper is the thin Virtualization.framework shim that owns the actual
//! guest. We talk to it over its standard streams:
//!
//! ```text
//! HelperMachine::start()
//!     └─► tokio::process::Command  →  linux-vm-helper child process
//!             stdin:  one JSON document (the validated configuration), then EOF
//!             stdout: JSON lines, one event each
//!                       {"event":"started"}
//!                       {"event":"start_failed","error":"..."}
//!                       {"event":"stopped_with_error","error":"..."}
//!                       {"event":"guest_did_stop"}
//!                       {"event":"network_attachment_disconnected","error":"..."}
//! ```
//!
//! `start` resolves on the first `started` / `start_failed` line. Everything
//! after that is forwarded to the registered [`EventSink`] by a background
//! task. If stdout closes without a terminal event the run is reported as a
//! stop-with-error.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, anyhow, bail};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, info, warn};

use crate::vm::devices::ValidatedConfiguration;
use crate::vm::hypervisor::{EventSink, Hypervisor, VirtualMachine};
use crate::vm::lifecycle::VmEvent;

pub const HELPER_BINARY: &str = "linux-vm-helper";

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum HelperMessage {
    Started,
    StartFailed { error: String },
    StoppedWithError { error: String },
    GuestDidStop,
    NetworkAttachmentDisconnected { error: String },
}

fn parse_line(line: &str) -> Option<HelperMessage> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str(line) {
        Ok(msg) => Some(msg),
        Err(e) => {
            warn!(line = %line, error = %e, "Ignoring unparseable helper output");
            None
        }
    }
}

impl HelperMessage {
    fn into_event(self) -> Option<VmEvent> {
        match self {
            Self::Started => None,
            Self::StartFailed { error } => Some(VmEvent::StartFailed(error)),
            Self::StoppedWithError { error } => Some(VmEvent::StoppedWithError(error)),
            Self::GuestDidStop => Some(VmEvent::GuestRequestedStop),
            Self::NetworkAttachmentDisconnected { error } => {
                Some(VmEvent::NetworkAttachmentDisconnected(error))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Helper discovery
// ---------------------------------------------------------------------------

/// Resolve the helper executable.
///
/// An explicit path is used as-is (it must exist); a bare name is searched
/// on `PATH`. Without a configured value we look for [`HELPER_BINARY`] on
/// `PATH`, next to our own executable, then in the Homebrew prefixes.
pub fn find_helper(configured: Option<&Path>) -> anyhow::Result<PathBuf> {
    if let Some(path) = configured {
        if path.components().count() > 1 {
            if path.exists() {
                return Ok(path.to_path_buf());
            }
            bail!("configured hypervisor helper does not exist: {}", path.display());
        }
        return search_path(path)
            .ok_or_else(|| anyhow!("hypervisor helper {} not found on PATH", path.display()));
    }

    if let Some(found) = search_path(Path::new(HELPER_BINARY)) {
        return Ok(found);
    }

    if let Some(dir) = std::env::current_exe().ok().and_then(|p| p.parent().map(Path::to_path_buf)) {
        let candidate = dir.join(HELPER_BINARY);
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    for prefix in ["/opt/homebrew/bin", "/usr/local/bin"] {
        let candidate = Path::new(prefix).join(HELPER_BINARY);
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    bail!(
        "{HELPER_BINARY} not found. Install it next to linux-vm or on PATH,\n\
         or set [hypervisor] helper in the config file."
    )
}

fn search_path(name: &Path) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

// ---------------------------------------------------------------------------
// Hypervisor / VirtualMachine implementation
// ---------------------------------------------------------------------------

/// Launches one helper process per machine.
#[derive(Debug, Clone, Default)]
pub struct HelperHypervisor {
    program: Option<PathBuf>,
    args: Vec<String>,
}

impl HelperHypervisor {
    pub fn new(program: Option<PathBuf>, args: Vec<String>) -> Self {
        Self { program, args }
    }
}

impl Hypervisor for HelperHypervisor {
    type Machine = HelperMachine;

    fn instantiate(&self, config: ValidatedConfiguration) -> HelperMachine {
        HelperMachine {
            program: self.program.clone(),
            args: self.args.clone(),
            config,
            sink: None,
        }
    }
}

pub struct HelperMachine {
    program: Option<PathBuf>,
    args: Vec<String>,
    config: ValidatedConfiguration,
    sink: Option<EventSink>,
}

#[async_trait]
impl VirtualMachine for HelperMachine {
    fn register_event_sink(&mut self, sink: EventSink) {
        self.sink = Some(sink);
    }

    async fn start(&mut self) -> anyhow::Result<()> {
        let sink = self
            .sink
            .take()
            .context("start requested before an event sink was registered")?;

        let program = find_helper(self.program.as_deref())?;
        let payload = serde_json::to_vec(&self.config).context("serialise VM configuration")?;

        let mut cmd = Command::new(&program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn hypervisor helper {}", program.display()))?;

        info!(
            helper = %program.display(),
            cpus = self.config.config().cpu_count,
            memory_bytes = self.config.config().memory_size_bytes,
            mode = %self.config.config().mode,
            "Hypervisor helper spawned"
        );

        let mut stdin = child.stdin.take().context("helper stdin was not captured")?;
        stdin.write_all(&payload).await.context("write configuration to helper")?;
        stdin.write_all(b"\n").await.context("write configuration to helper")?;
        stdin.shutdown().await.context("close helper stdin")?;
        drop(stdin);

        let stdout = child.stdout.take().context("helper stdout was not captured")?;
        let mut lines = BufReader::new(stdout).lines();

        loop {
            let Some(line) = lines.next_line().await.context("read helper output")? else {
                let status = child.wait().await.context("wait for hypervisor helper")?;
                bail!("hypervisor helper exited before the machine started ({status})");
            };
            match parse_line(&line) {
                Some(HelperMessage::Started) => break,
                Some(HelperMessage::StartFailed { error }) => {
                    let _ = child.wait().await;
                    bail!(error);
                }
                Some(other) => {
                    if let Some(event) = other.into_event() {
                        let _ = sink.send(event);
                    }
                }
                None => {}
            }
        }

        tokio::spawn(forward_events(lines, child, sink));
        Ok(())
    }
}

/// Relay helper events to `sink` until stdout closes or the receiver goes away.
async fn forward_events(mut lines: Lines<BufReader<ChildStdout>>, mut child: Child, sink: EventSink) {
    let mut stopped = false;

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let Some(event) = parse_line(&line).and_then(HelperMessage::into_event) else {
                    continue;
                };
                debug!(?event, "helper event");
                stopped |= matches!(
                    event,
                    VmEvent::StoppedWithError(_) | VmEvent::GuestRequestedStop
                );
                if sink.send(event).is_err() {
                    return;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Error reading helper output");
                break;
            }
        }
    }

    let status = match child.wait().await {
        Ok(status) => status.to_string(),
        Err(e) => format!("wait failed: {e}"),
    };
    info!(exit_status = %status, "Hypervisor helper exited");

    if !stopped {
        let _ = sink.send(VmEvent::StoppedWithError(format!(
            "hypervisor helper exited ({status}) without reporting a stop"
        )));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_event_kind() {
        assert_eq!(parse_line(r#"{"event":"started"}"#), Some(HelperMessage::Started));
        assert_eq!(
            parse_line(r#"{"event":"guest_did_stop"}"#).and_then(HelperMessage::into_event),
            Some(VmEvent::GuestRequestedStop)
        );
        assert_eq!(
            parse_line(r#"{"event":"stopped_with_error","error":"boom"}"#)
                .and_then(HelperMessage::into_event),
            Some(VmEvent::StoppedWithError("boom".into()))
        );
        assert_eq!(
            parse_line(r#"{"event":"network_attachment_disconnected","error":"nat"}"#)
                .and_then(HelperMessage::into_event),
            Some(VmEvent::NetworkAttachmentDisconnected("nat".into()))
        );
        assert_eq!(
            parse_line(r#"{"event":"start_failed","error":"entitlement"}"#),
            Some(HelperMessage::StartFailed {
                error: "entitlement".into()
            })
        );
    }

    #[test]
    fn skips_noise() {
        assert_eq!(parse_line(""), None);
        assert_eq!(parse_line("   "), None);
        assert_eq!(parse_line("booting..."), None);
        assert_eq!(parse_line(r#"{"event":"rebooted"}"#), None);
    }

    #[test]
    fn configured_helper_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("linux-vm-helper");
        assert!(find_helper(Some(&missing)).is_err());

        std::fs::write(&missing, b"#!/bin/sh\n").unwrap();
        assert_eq!(find_helper(Some(&missing)).unwrap(), missing);
    }

    #[test]
    fn bare_name_is_searched_on_path() {
        assert!(find_helper(Some(Path::new("definitely-not-a-real-helper-binary"))).is_err());
    }
}
