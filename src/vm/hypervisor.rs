//! The seam between the bootstrap and whatever actually runs the guest.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::vm::devices::ValidatedConfiguration;
use crate::vm::lifecycle::VmEvent;

/// Where a machine delivers its lifecycle events.
pub type EventSink = mpsc::UnboundedSender<VmEvent>;

/// Factory for virtual machines. Construction itself cannot fail.
pub trait Hypervisor {
    type Machine: VirtualMachine;

    fn instantiate(&self, config: ValidatedConfiguration) -> Self::Machine;
}

#[async_trait]
pub trait VirtualMachine: Send {
    /// Must be called before [`VirtualMachine::start`]. Implementations
    /// drop their own sender once started so the event stream ends when the
    /// machine is gone.
    fn register_event_sink(&mut self, sink: EventSink);

    /// Resolve once the machine is running, or with the reason it is not.
    async fn start(&mut self) -> anyhow::Result<()>;
}
