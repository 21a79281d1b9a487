//! linux-vm-launcher: install or resume a Linux guest with a stable identity.
//!
//! The library holds the whole bootstrap; `src/main.rs` only parses
//! arguments, initialises logging and maps the outcome to an exit status.

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod input;
pub mod logging;
pub mod paths;
pub mod vm;

pub use bootstrap::{Bootstrap, Phase};
pub use error::BootstrapError;
