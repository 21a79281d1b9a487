//! Error taxonomy for the bootstrap and run lifecycle.
//!
//! Every variant except [`BootstrapError::DeviceFault`] is fatal: it unwinds
//! the whole bootstrap back to `main`, which prints it and exits non-zero.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BootstrapError {
    /// The user dismissed a prompt (or stdin closed) before answering.
    #[error("cancelled: no {what} chosen")]
    InputCancelled { what: &'static str },

    #[error("{action} {}: {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A persisted artifact the current mode depends on is absent.
    #[error("{} is missing: {hint}", path.display())]
    MissingState { path: PathBuf, hint: String },

    /// A persisted artifact exists but cannot be parsed.
    #[error("{} is corrupt: {reason}", path.display())]
    CorruptState { path: PathBuf, reason: String },

    #[error("invalid VM configuration: {}", violations.join("; "))]
    InvalidConfiguration { violations: Vec<String> },

    #[error("virtual machine failed to start: {0}")]
    StartFailure(String),

    #[error("virtual machine stopped with error: {0}")]
    RuntimeFailure(String),

    /// A peripheral reported a fault; the machine keeps running.
    #[error("device fault: {0}")]
    DeviceFault(String),
}

impl BootstrapError {
    pub fn io(action: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            action,
            path: path.into(),
            source,
        }
    }

    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::DeviceFault(_))
    }
}

pub type Result<T, E = BootstrapError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_device_fault_is_non_fatal() {
        assert!(!BootstrapError::DeviceFault("nat link down".into()).is_fatal());
        assert!(BootstrapError::StartFailure("no entitlement".into()).is_fatal());
        assert!(BootstrapError::InputCancelled { what: "ISO" }.is_fatal());
        assert!(
            BootstrapError::MissingState {
                path: PathBuf::from("/vm/NVRAM"),
                hint: String::new(),
            }
            .is_fatal()
        );
    }

    #[test]
    fn invalid_configuration_lists_every_violation() {
        let err = BootstrapError::InvalidConfiguration {
            violations: vec!["cpu count 0 below minimum 1".into(), "no network device".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("cpu count 0"));
        assert!(msg.contains("no network device"));
    }

    #[test]
    fn io_error_names_the_path() {
        let err = BootstrapError::io(
            "create disk image",
            "/vm/Disk.img",
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        );
        assert!(err.to_string().starts_with("create disk image /vm/Disk.img:"));
    }
}
