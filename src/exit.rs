//! Guest-triggered control exits.
//!
//! Translated code calls these helpers when the guest hits a debug breakpoint
//! or a sync backdoor instruction. Each one resolves the vCPU owning the
//! architectural state and forwards a single exit request with the guest pc
//! to the analysis engine. No state is kept here.

use alloc::sync::Arc;
use alloc::vec::Vec;

use hashbrown::HashMap;
use spin::RwLock;

use crate::hooks::GuestAddr;

/// Handle to a vCPU's architectural state, as passed by translated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArchState(pub usize);

/// Handle identifying a vCPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CpuHandle(pub u32);

/// Guest address width, used to narrow the pc before forwarding it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GuestWidth {
    /// 32-bit guest.
    W32,
    /// 64-bit guest.
    #[default]
    W64,
}

impl GuestWidth {
    /// Truncate `pc` to the guest word size.
    #[inline]
    pub const fn narrow(self, pc: u64) -> GuestAddr {
        match self {
            GuestWidth::W32 => pc as u32 as GuestAddr,
            GuestWidth::W64 => pc,
        }
    }
}

/// Exit reason.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Guest hit a debug breakpoint.
    Breakpoint = 0,
    /// Guest called into the analysis engine.
    SyncBackdoor = 1,
}

impl ExitKind {
    /// Short label for display.
    pub fn label(&self) -> &'static str {
        match self {
            ExitKind::Breakpoint => "breakpoint",
            ExitKind::SyncBackdoor => "sync_backdoor",
        }
    }
}

/// One forwarded exit request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitRequest {
    pub cpu: CpuHandle,
    pub pc: GuestAddr,
    pub kind: ExitKind,
}

/// Maps architectural state to the vCPU owning it.
pub trait CpuResolver: Send + Sync {
    /// Resolve the vCPU for `arch`. `None` if `arch` is not a known vCPU.
    fn resolve_cpu(&self, arch: ArchState) -> Option<CpuHandle>;
}

/// Receives exit requests on behalf of the analysis engine.
pub trait ExitRequester: Send + Sync {
    /// Request an exit for a breakpoint at `pc`.
    fn request_breakpoint_exit(&self, cpu: CpuHandle, pc: GuestAddr);

    /// Request an exit for a sync backdoor at `pc`.
    fn request_sync_backdoor_exit(&self, cpu: CpuHandle, pc: GuestAddr);
}

/// vCPU table filled in by the VM as it creates vCPUs.
#[derive(Debug, Default)]
pub struct VcpuTable {
    cpus: RwLock<HashMap<ArchState, CpuHandle>>,
}

impl VcpuTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate `arch` with `cpu`, returning the previous owner if any.
    pub fn register(&self, arch: ArchState, cpu: CpuHandle) -> Option<CpuHandle> {
        let prev = self.cpus.write().insert(arch, cpu);
        log::debug!("exit: vcpu {} registered at {:#x}", cpu.0, arch.0);
        prev
    }

    /// Forget `arch`.
    pub fn unregister(&self, arch: ArchState) -> Option<CpuHandle> {
        self.cpus.write().remove(&arch)
    }

    /// Number of registered vCPUs.
    pub fn len(&self) -> usize {
        self.cpus.read().len()
    }

    /// Whether no vCPU is registered.
    pub fn is_empty(&self) -> bool {
        self.cpus.read().is_empty()
    }

    /// Registered vCPUs, sorted by handle.
    pub fn list(&self) -> Vec<(CpuHandle, ArchState)> {
        let mut all: Vec<_> = self
            .cpus
            .read()
            .iter()
            .map(|(arch, cpu)| (*cpu, *arch))
            .collect();
        all.sort_by_key(|(cpu, _)| *cpu);
        all
    }
}

impl CpuResolver for VcpuTable {
    fn resolve_cpu(&self, arch: ArchState) -> Option<CpuHandle> {
        self.cpus.read().get(&arch).copied()
    }
}

/// Entry points for guest-triggered exits.
#[derive(Clone)]
pub struct GuestExits {
    resolver: Arc<dyn CpuResolver>,
    requester: Arc<dyn ExitRequester>,
    width: GuestWidth,
}

impl GuestExits {
    /// Create exit handlers for a 64-bit guest.
    pub fn new(resolver: Arc<dyn CpuResolver>, requester: Arc<dyn ExitRequester>) -> Self {
        Self {
            resolver,
            requester,
            width: GuestWidth::W64,
        }
    }

    /// Narrow forwarded pcs to `width`.
    pub fn with_width(mut self, width: GuestWidth) -> Self {
        self.width = width;
        self
    }

    /// Guest hit a breakpoint at `pc`.
    ///
    /// Returns `false` if `arch` does not belong to a known vCPU.
    pub fn on_breakpoint(&self, arch: ArchState, pc: u64) -> bool {
        self.forward(arch, pc, ExitKind::Breakpoint)
    }

    /// Guest triggered the sync backdoor at `pc`.
    ///
    /// Returns `false` if `arch` does not belong to a known vCPU.
    pub fn on_sync_backdoor(&self, arch: ArchState, pc: u64) -> bool {
        self.forward(arch, pc, ExitKind::SyncBackdoor)
    }

    fn forward(&self, arch: ArchState, pc: u64, kind: ExitKind) -> bool {
        let Some(cpu) = self.resolver.resolve_cpu(arch) else {
            log::error!(
                "exit: {} at {:#x} from unknown arch state {:#x}",
                kind.label(),
                pc,
                arch.0
            );
            return false;
        };

        let pc = self.width.narrow(pc);
        log::trace!("exit: {} on vcpu {} at {:#x}", kind.label(), cpu.0, pc);
        match kind {
            ExitKind::Breakpoint => self.requester.request_breakpoint_exit(cpu, pc),
            ExitKind::SyncBackdoor => self.requester.request_sync_backdoor_exit(cpu, pc),
        }
        true
    }
}
