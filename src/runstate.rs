//! Run-state control used around snapshot restore.
//!
//! The VM owns its run-state machine. This boundary only needs three
//! operations: ask whether the guest is running, stop it for a restore, and
//! resume it.

use core::sync::atomic::{AtomicU8, Ordering};

/// Guest run state, as seen by this boundary.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Guest vCPUs are executing.
    Running = 0,
    /// Stopped so a snapshot can be restored.
    RestoreVm = 1,
    /// Any other stopped state owned by the VM.
    Paused = 2,
}

impl RunState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => RunState::Running,
            1 => RunState::RestoreVm,
            _ => RunState::Paused,
        }
    }

    /// Short label for display.
    pub fn label(&self) -> &'static str {
        match self {
            RunState::Running => "running",
            RunState::RestoreVm => "restore-vm",
            RunState::Paused => "paused",
        }
    }
}

/// Run-state operations the snapshot coordinator drives.
///
/// Only called on the VM's owner thread.
pub trait RunStateControl: Send + Sync {
    /// Whether the guest is currently running.
    fn is_running(&self) -> bool;

    /// Stop the guest and enter the restore state.
    fn stop_for_restore(&self);

    /// Resume guest execution.
    fn resume(&self);
}

/// Self-contained run state for embeddings without their own state machine.
#[derive(Debug)]
pub struct SharedRunState {
    state: AtomicU8,
}

impl SharedRunState {
    /// Create a run state starting at `initial`.
    pub const fn new(initial: RunState) -> Self {
        Self {
            state: AtomicU8::new(initial as u8),
        }
    }

    /// Current state.
    pub fn state(&self) -> RunState {
        RunState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Force a state, e.g. when the VM pauses for reasons of its own.
    pub fn set(&self, state: RunState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

impl Default for SharedRunState {
    fn default() -> Self {
        Self::new(RunState::Paused)
    }
}

impl RunStateControl for SharedRunState {
    fn is_running(&self) -> bool {
        self.state() == RunState::Running
    }

    fn stop_for_restore(&self) {
        let prev = RunState::from_u8(self.state.swap(RunState::RestoreVm as u8, Ordering::AcqRel));
        log::debug!("runstate: {} -> {}", prev.label(), RunState::RestoreVm.label());
    }

    fn resume(&self) {
        let prev = RunState::from_u8(self.state.swap(RunState::Running as u8, Ordering::AcqRel));
        log::debug!("runstate: {} -> {}", prev.label(), RunState::Running.label());
    }
}
