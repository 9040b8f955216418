use std::sync::{Arc, Mutex, MutexGuard};

use am_session::pty::TerminalProcess;
use tracing::{debug, warn};

/// Change to apply to the process after a flag update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseTransition {
    Pause,
    Resume,
    Unchanged,
}

/// The two independent reasons output can be paused. The process is paused
/// iff either flag is set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PauseState {
    pub server_paused: bool,
    pub client_paused: bool,
}

impl PauseState {
    pub fn effective_paused(&self) -> bool {
        self.server_paused || self.client_paused
    }

    pub fn set_server(&mut self, paused: bool) -> PauseTransition {
        let before = self.effective_paused();
        self.server_paused = paused;
        self.transition_from(before)
    }

    pub fn set_client(&mut self, paused: bool) -> PauseTransition {
        let before = self.effective_paused();
        self.client_paused = paused;
        self.transition_from(before)
    }

    fn transition_from(&self, before: bool) -> PauseTransition {
        match (before, self.effective_paused()) {
            (false, true) => PauseTransition::Pause,
            (true, false) => PauseTransition::Resume,
            _ => PauseTransition::Unchanged,
        }
    }
}

/// Reconciles server backpressure and client pause requests onto one
/// process. Shared by a connection's output pump and its inbound loop.
pub struct FlowControl {
    process: Arc<dyn TerminalProcess>,
    state: Mutex<PauseState>,
}

impl FlowControl {
    pub fn new(process: Arc<dyn TerminalProcess>) -> Self {
        Self {
            process,
            state: Mutex::new(PauseState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PauseState> {
        self.state.lock().unwrap_or_else(|e| {
            warn!("flow control lock was poisoned, recovering");
            e.into_inner()
        })
    }

    pub fn state(&self) -> PauseState {
        *self.lock()
    }

    pub fn effective_paused(&self) -> bool {
        self.lock().effective_paused()
    }

    pub fn set_server_paused(&self, paused: bool) -> PauseTransition {
        let mut state = self.lock();
        let transition = state.set_server(paused);
        self.apply(transition);
        transition
    }

    pub fn set_client_paused(&self, paused: bool) -> PauseTransition {
        let mut state = self.lock();
        let transition = state.set_client(paused);
        self.apply(transition);
        transition
    }

    /// Drop both flags without touching the process. Used when the viewer
    /// goes away and may no longer own the process.
    pub fn reset_flags(&self) {
        *self.lock() = PauseState::default();
    }

    fn apply(&self, transition: PauseTransition) {
        match transition {
            PauseTransition::Pause => {
                debug!("pausing process output");
                self.process.pause();
            }
            PauseTransition::Resume => {
                debug!("resuming process output");
                self.process.resume();
            }
            PauseTransition::Unchanged => {}
        }
    }
}

impl std::fmt::Debug for FlowControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowControl").field("state", &self.state()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use am_session::testing::ScriptedProcess;

    #[test]
    fn either_flag_pauses() {
        let mut s = PauseState::default();
        assert_eq!(s.set_server(true), PauseTransition::Pause);
        assert_eq!(s.set_client(true), PauseTransition::Unchanged);
        assert_eq!(s.set_server(false), PauseTransition::Unchanged);
        assert!(s.effective_paused());
        assert_eq!(s.set_client(false), PauseTransition::Resume);
        assert!(!s.effective_paused());
    }

    #[test]
    fn repeated_flags_are_idempotent() {
        let mut s = PauseState::default();
        assert_eq!(s.set_client(true), PauseTransition::Pause);
        assert_eq!(s.set_client(true), PauseTransition::Unchanged);
        assert_eq!(s.set_client(false), PauseTransition::Resume);
        assert_eq!(s.set_client(false), PauseTransition::Unchanged);
    }

    #[test]
    fn dual_pause_reconciliation_drives_process() {
        let process = Arc::new(ScriptedProcess::new());
        let flow = FlowControl::new(process.clone());

        flow.set_server_paused(true);
        flow.set_client_paused(true);
        assert!(process.is_paused());

        flow.set_server_paused(false);
        assert!(process.is_paused(), "client pause must keep the process paused");

        flow.set_client_paused(false);
        assert!(!process.is_paused());
        assert_eq!(process.pause_calls(), 1);
        assert_eq!(process.resume_calls(), 1);
    }

    #[test]
    fn reset_flags_leaves_process_alone() {
        let process = Arc::new(ScriptedProcess::new());
        let flow = FlowControl::new(process.clone());
        flow.set_client_paused(true);

        flow.reset_flags();
        assert_eq!(flow.state(), PauseState::default());
        assert!(process.is_paused());
    }
}
