//! Per-access entry point called from translated code.
//!
//! Generated code calls [`AccessInterceptor::intercept_split`] (or
//! [`AccessInterceptor::intercept`]) before each guest load/store. The guest pc
//! is not passed by the caller: it comes from [`GenerationPc`], which the
//! translator updates while emitting code for each guest instruction.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::hooks::{AccessDirection, GuestAddr, HookRegistry, MemoryAccess};

/// Guest pc of the instruction currently being translated.
#[derive(Debug, Default)]
pub struct GenerationPc(AtomicU64);

impl GenerationPc {
    /// Create a slot starting at `pc`.
    pub const fn new(pc: GuestAddr) -> Self {
        Self(AtomicU64::new(pc))
    }

    /// Record the pc of the instruction being translated.
    #[inline]
    pub fn set(&self, pc: GuestAddr) {
        self.0.store(pc, Ordering::Relaxed);
    }

    /// Current pc.
    #[inline]
    pub fn get(&self) -> GuestAddr {
        self.0.load(Ordering::Relaxed)
    }
}

/// Consults the [`HookRegistry`] for every guest memory access.
#[derive(Clone)]
pub struct AccessInterceptor {
    registry: Arc<HookRegistry>,
    gen_pc: Arc<GenerationPc>,
    trace_accesses: bool,
}

impl AccessInterceptor {
    /// Create an interceptor over `registry`, reading the pc from `gen_pc`.
    pub fn new(registry: Arc<HookRegistry>, gen_pc: Arc<GenerationPc>) -> Self {
        Self {
            registry,
            gen_pc,
            trace_accesses: false,
        }
    }

    /// Emit a `trace!` record per hooked access.
    pub fn with_trace(mut self, enabled: bool) -> Self {
        self.trace_accesses = enabled;
        self
    }

    /// The registry consulted by this interceptor.
    pub fn registry(&self) -> &Arc<HookRegistry> {
        &self.registry
    }

    /// The pc slot read by this interceptor.
    pub fn generation_pc(&self) -> &Arc<GenerationPc> {
        &self.gen_pc
    }

    /// Intercept one access and return the address the guest should use.
    ///
    /// With no hook installed this returns `addr` without building an access
    /// descriptor.
    #[inline]
    pub fn intercept(
        &self,
        addr: GuestAddr,
        size: u64,
        direction: AccessDirection,
        value: u128,
    ) -> GuestAddr {
        if !self.registry.is_installed() {
            return addr;
        }

        let access = MemoryAccess {
            pc: self.gen_pc.get(),
            addr,
            size,
            direction,
            value,
        };
        let Some(out) = self.registry.with_active(|hook| hook.on_access(&access).unwrap_or(addr))
        else {
            return addr;
        };

        if self.trace_accesses {
            log::trace!(
                "intercept: pc={:#x} {} addr={:#x} size={} -> {:#x}",
                access.pc,
                direction.label(),
                addr,
                size,
                out
            );
        }
        out
    }

    /// Helper-ABI form: raw direction flag and the value split in two halves.
    #[inline]
    pub fn intercept_split(
        &self,
        addr: GuestAddr,
        size: u64,
        rw: u32,
        low64: u64,
        high64: u64,
    ) -> GuestAddr {
        if !self.registry.is_installed() {
            return addr;
        }
        let value = (low64 as u128) | ((high64 as u128) << 64);
        self.intercept(addr, size, AccessDirection::from_raw(rw), value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_pc() {
        let pc = GenerationPc::new(0x1000);
        assert_eq!(pc.get(), 0x1000);
        pc.set(0x2004);
        assert_eq!(pc.get(), 0x2004);
    }

    #[test]
    fn test_split_value_is_joined() {
        let registry = Arc::new(HookRegistry::new());
        registry.install(Arc::new(|access: &MemoryAccess| -> Option<GuestAddr> {
            assert_eq!(access.value, (7u128 << 64) | 9);
            assert_eq!(access.direction, AccessDirection::Write);
            None
        }));

        let interceptor = AccessInterceptor::new(registry, Arc::new(GenerationPc::default()));
        assert_eq!(interceptor.intercept_split(0x10, 16, 1, 9, 7), 0x10);
    }
}
