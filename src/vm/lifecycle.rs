//! Run lifecycle state machine.
//!
//! Hierarchy:
//! ```text
//! Instantiated → Active (superstate)
//!                   ├── Starting
//!                   └── Running   [entry: log start]
//!                → Terminated { termination }
//! ```
//!
//! `Active` owns the events that end or degrade a machine regardless of
//! whether start has completed: stop-with-error, guest stop and network
//! disconnect. A network disconnect is the only event that never leaves the
//! current state.

use statig::prelude::*;
use tracing::{error, info, warn};

use crate::error::BootstrapError;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Asynchronous notifications emitted by the hypervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmEvent {
    StartFailed(String),
    StoppedWithError(String),
    GuestRequestedStop,
    NetworkAttachmentDisconnected(String),
}

/// Events dispatched to the lifecycle state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    /// The orchestrator issued the start request.
    StartRequested,
    /// The hypervisor confirmed the start.
    Started,
    Vm(VmEvent),
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    GuestStopped,
    StartFailed(String),
    StoppedWithError(String),
}

impl Termination {
    /// Only a guest-requested stop counts as success.
    pub fn into_result(self) -> crate::error::Result<()> {
        match self {
            Self::GuestStopped => Ok(()),
            Self::StartFailed(e) => Err(BootstrapError::StartFailure(e)),
            Self::StoppedWithError(e) => Err(BootstrapError::RuntimeFailure(e)),
        }
    }
}

// ---------------------------------------------------------------------------
// State machine implementation
// ---------------------------------------------------------------------------

/// Shared storage for the lifecycle state machine.
#[derive(Debug, Default)]
pub struct LifecycleHandler;

#[state_machine(
    initial = "State::instantiated()",
    state(derive(Debug, Clone, PartialEq))
)]
impl LifecycleHandler {
    /// Machine constructed, start not yet requested.
    #[state]
    fn instantiated(&mut self, event: &RunEvent) -> Outcome<State> {
        match event {
            RunEvent::StartRequested => Transition(State::starting()),
            _ => Handled,
        }
    }

    #[superstate]
    fn active(&mut self, event: &RunEvent) -> Outcome<State> {
        match event {
            RunEvent::Vm(VmEvent::StoppedWithError(e)) => {
                error!(target: "lifecycle", error = %e, "Virtual machine did stop with error");
                Transition(State::terminated(Termination::StoppedWithError(e.clone())))
            }
            RunEvent::Vm(VmEvent::GuestRequestedStop) => {
                info!(target: "lifecycle", "Guest did stop virtual machine");
                Transition(State::terminated(Termination::GuestStopped))
            }
            RunEvent::Vm(VmEvent::NetworkAttachmentDisconnected(e)) => {
                let fault = BootstrapError::DeviceFault(e.clone());
                warn!(target: "lifecycle", error = %fault, "Network attachment was disconnected");
                Handled
            }
            _ => Handled,
        }
    }

    /// Start requested, waiting for the hypervisor to confirm.
    #[state(superstate = "active")]
    fn starting(&mut self, event: &RunEvent) -> Outcome<State> {
        match event {
            RunEvent::Started => Transition(State::running()),
            RunEvent::Vm(VmEvent::StartFailed(e)) => {
                error!(target: "lifecycle", error = %e, "Virtual machine failed to start");
                Transition(State::terminated(Termination::StartFailed(e.clone())))
            }
            _ => Super,
        }
    }

    #[state(superstate = "active", entry_action = "enter_running")]
    fn running(&mut self, event: &RunEvent) -> Outcome<State> {
        match event {
            RunEvent::Vm(VmEvent::StartFailed(e)) => {
                warn!(target: "lifecycle", error = %e, "Ignoring start failure reported while running");
                Handled
            }
            _ => Super,
        }
    }

    /// Final state; `termination` carries the outcome for the exit code.
    #[state]
    fn terminated(&mut self, event: &RunEvent, termination: &Termination) -> Outcome<State> {
        let _ = (event, termination);
        Handled
    }

    #[action]
    fn enter_running(&mut self) {
        info!(target: "lifecycle", "Virtual machine successfully started");
    }
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

/// Drives [`LifecycleHandler`] and remembers whether `Running` was reached.
pub struct LifecycleMonitor {
    machine: statig::blocking::StateMachine<LifecycleHandler>,
    reached_running: bool,
}

impl Default for LifecycleMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleMonitor {
    pub fn new() -> Self {
        Self {
            machine: LifecycleHandler.state_machine(),
            reached_running: false,
        }
    }

    /// Dispatch one event. Returns the termination once the run has ended.
    pub fn handle(&mut self, event: RunEvent) -> Option<Termination> {
        self.machine.handle(&event);
        if self.is_running() {
            self.reached_running = true;
        }
        self.termination()
    }

    pub fn state(&self) -> &State {
        self.machine.state()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), State::Running {})
    }

    pub fn reached_running(&self) -> bool {
        self.reached_running
    }

    pub fn termination(&self) -> Option<Termination> {
        match self.state() {
            State::Terminated { termination } => Some(termination.clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running() -> LifecycleMonitor {
        let mut m = LifecycleMonitor::new();
        assert_eq!(m.handle(RunEvent::StartRequested), None);
        assert_eq!(m.handle(RunEvent::Started), None);
        assert!(m.is_running());
        m
    }

    #[test]
    fn starts_instantiated() {
        let m = LifecycleMonitor::new();
        assert_eq!(m.state(), &State::Instantiated {});
    }

    #[test]
    fn guest_stop_is_success() {
        let mut m = running();
        let t = m.handle(RunEvent::Vm(VmEvent::GuestRequestedStop)).unwrap();
        assert_eq!(t, Termination::GuestStopped);
        assert!(m.reached_running());
        assert!(t.into_result().is_ok());
    }

    #[test]
    fn start_failure_never_reaches_running() {
        let mut m = LifecycleMonitor::new();
        m.handle(RunEvent::StartRequested);
        let t = m
            .handle(RunEvent::Vm(VmEvent::StartFailed("no entitlement".into())))
            .unwrap();
        assert!(!m.reached_running());
        assert!(matches!(t.into_result(), Err(BootstrapError::StartFailure(_))));
    }

    #[test]
    fn stop_with_error_is_failure() {
        let mut m = running();
        let t = m
            .handle(RunEvent::Vm(VmEvent::StoppedWithError("internal error".into())))
            .unwrap();
        assert!(m.reached_running());
        assert!(matches!(t.into_result(), Err(BootstrapError::RuntimeFailure(_))));
    }

    #[test]
    fn network_disconnect_keeps_running() {
        let mut m = running();
        let before = m.state().clone();
        assert_eq!(
            m.handle(RunEvent::Vm(VmEvent::NetworkAttachmentDisconnected("nat gone".into()))),
            None
        );
        assert_eq!(m.state(), &before);
        assert!(m.is_running());
    }

    #[test]
    fn terminated_ignores_later_events() {
        let mut m = running();
        m.handle(RunEvent::Vm(VmEvent::GuestRequestedStop));
        let t = m.handle(RunEvent::Vm(VmEvent::StoppedWithError("late".into())));
        assert_eq!(t, Some(Termination::GuestStopped));
    }

    #[test]
    fn events_before_start_request_are_ignored() {
        let mut m = LifecycleMonitor::new();
        assert_eq!(m.handle(RunEvent::Vm(VmEvent::GuestRequestedStop)), None);
        assert_eq!(m.state(), &State::Instantiated {});
    }
}
