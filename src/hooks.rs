//! Memory-access hook registry.
//!
//! Holds at most one active [`MemoryAccessHook`]. The translator consults the
//! registry on every guest load/store, so with no hook installed the lookup is
//! a single acquire load and a null check. Installing a hook replaces the
//! previous one; there is no chaining.
//!
//! Hooked accesses are counted while they run. A replaced hook is retired and
//! freed at the first install, remove or [`HookRegistry::try_reclaim`] that
//! sees no access in flight.
//!
//! # Example
//!
//! ```ignore
//! use alloc::sync::Arc;
//! use vmhook::hooks::{HookRegistry, MemoryAccess, MemoryAccessHook};
//!
//! struct Redirect;
//!
//! impl MemoryAccessHook for Redirect {
//!     fn on_access(&self, access: &MemoryAccess) -> Option<u64> {
//!         (access.addr == 0x1000).then_some(0x2000)
//!     }
//! }
//!
//! let registry = HookRegistry::new();
//! registry.install(Arc::new(Redirect));
//! ```

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use spin::Mutex;

/// Guest virtual address.
pub type GuestAddr = u64;

/// Direction of a guest memory access.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessDirection {
    /// Guest load.
    Read = 0,
    /// Guest store.
    Write = 1,
}

impl AccessDirection {
    /// Decode the direction flag passed by translated code.
    ///
    /// Zero is a read, any other value is a write.
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        if raw == 0 { Self::Read } else { Self::Write }
    }

    /// Encode for the C callback ABI.
    #[inline]
    pub const fn as_raw(self) -> u32 {
        self as u32
    }

    /// Short label for display.
    pub fn label(&self) -> &'static str {
        match self {
            AccessDirection::Read => "read",
            AccessDirection::Write => "write",
        }
    }
}

/// One intercepted guest memory access.
///
/// Built fresh for each access and only borrowed by the hook for the duration
/// of the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryAccess {
    /// Guest pc of the instruction performing the access.
    pub pc: GuestAddr,
    /// Effective address before any rewrite.
    pub addr: GuestAddr,
    /// Access size in bytes.
    pub size: u64,
    /// Load or store.
    pub direction: AccessDirection,
    /// Stored value for writes (up to 128 bits).
    pub value: u128,
}

impl MemoryAccess {
    /// Whether this access is a store.
    pub fn is_write(&self) -> bool {
        self.direction == AccessDirection::Write
    }
}

/// Observer of guest memory accesses, able to redirect them.
///
/// Runs on guest-execution threads without synchronization, so implementations
/// must be `Send + Sync` and should stay cheap.
pub trait MemoryAccessHook: Send + Sync {
    /// Called before the access completes.
    ///
    /// Returning `Some(addr)` makes the guest access `addr` instead of
    /// `access.addr`; `None` leaves the access untouched.
    fn on_access(&self, access: &MemoryAccess) -> Option<GuestAddr>;
}

impl<F> MemoryAccessHook for F
where
    F: Fn(&MemoryAccess) -> Option<GuestAddr> + Send + Sync,
{
    fn on_access(&self, access: &MemoryAccess) -> Option<GuestAddr> {
        self(access)
    }
}

/// C ABI callback for [`RawMemoryHook`].
///
/// Arguments: `data, pc, addr, size, out_addr, rw, value_low, value_high`.
/// `out_addr` is pre-filled with `addr`; the callback may overwrite it.
pub type RawMemoryHookFn = unsafe extern "C" fn(
    data: u64,
    pc: GuestAddr,
    addr: GuestAddr,
    size: u64,
    out_addr: *mut GuestAddr,
    rw: u32,
    value_low: u64,
    value_high: u64,
);

/// `{callback, data}` descriptor for engines that hook through a C ABI.
#[derive(Debug, Clone, Copy)]
pub struct RawMemoryHook {
    /// Callback invoked on every access.
    pub callback: RawMemoryHookFn,
    /// Opaque token handed back to the callback.
    pub data: u64,
}

impl RawMemoryHook {
    /// Create a new raw hook descriptor.
    pub const fn new(callback: RawMemoryHookFn, data: u64) -> Self {
        Self { callback, data }
    }
}

impl MemoryAccessHook for RawMemoryHook {
    fn on_access(&self, access: &MemoryAccess) -> Option<GuestAddr> {
        let mut out_addr = access.addr;
        // SAFETY: whoever built the descriptor vouches for the callback; the
        // out slot is a live local for the whole call.
        unsafe {
            (self.callback)(
                self.data,
                access.pc,
                access.addr,
                access.size,
                &mut out_addr,
                access.direction.as_raw(),
                access.value as u64,
                (access.value >> 64) as u64,
            );
        }
        (out_addr != access.addr).then_some(out_addr)
    }
}

/// Identifier handed out for each installed hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HookId(u64);

impl HookId {
    /// Raw numeric value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Published hook together with its id.
///
/// Both fields are read through one pointer, so a reader can never observe
/// the id of one hook paired with the callback of another.
struct HookSlot {
    id: HookId,
    hook: Arc<dyn MemoryAccessHook>,
}

/// Registry holding the single active memory-access hook.
pub struct HookRegistry {
    /// Currently published slot, null when no hook is installed.
    active: AtomicPtr<HookSlot>,
    /// Replaced slots a guest thread may still be running.
    retired: Mutex<Vec<Box<HookSlot>>>,
    /// Accesses currently holding a slot.
    readers: AtomicUsize,
    /// Next id to hand out.
    next_id: AtomicU64,
}

/// Marks one access in flight for as long as it lives.
struct ReadGuard<'a> {
    registry: &'a HookRegistry,
}

impl<'a> ReadGuard<'a> {
    fn new(registry: &'a HookRegistry) -> Self {
        registry.readers.fetch_add(1, Ordering::SeqCst);
        Self { registry }
    }

    fn slot(&self) -> Option<&'a HookSlot> {
        let p = self.registry.active.load(Ordering::SeqCst);
        // SAFETY: a non-null pointer was produced by `Box::into_raw` in
        // `install`. Once unpublished it is only freed while `readers` is
        // zero, and this guard keeps it above zero.
        unsafe { p.as_ref() }
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.registry.readers.fetch_sub(1, Ordering::SeqCst);
    }
}

impl HookRegistry {
    /// Create an empty registry.
    pub const fn new() -> Self {
        Self {
            active: AtomicPtr::new(ptr::null_mut()),
            retired: Mutex::new(Vec::new()),
            readers: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
        }
    }

    /// Install `hook`, replacing any hook already installed.
    pub fn install(&self, hook: Arc<dyn MemoryAccessHook>) -> HookId {
        let id = HookId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let slot = Box::into_raw(Box::new(HookSlot { id, hook }));
        let old = self.active.swap(slot, Ordering::SeqCst);

        match self.retire(old) {
            Some(old_id) => log::debug!(
                "hooks: replaced memory hook {} with {}",
                old_id.as_u64(),
                id.as_u64()
            ),
            None => log::debug!("hooks: installed memory hook {}", id.as_u64()),
        }
        id
    }

    /// Install a C ABI `{callback, data}` descriptor.
    pub fn install_raw(&self, hook: RawMemoryHook) -> HookId {
        self.install(Arc::new(hook))
    }

    /// Remove the active hook, returning its id.
    ///
    /// Subsequent accesses take the identity fast path.
    pub fn remove(&self) -> Option<HookId> {
        let old = self.active.swap(ptr::null_mut(), Ordering::SeqCst);
        let id = self.retire(old);
        if let Some(id) = id {
            log::debug!("hooks: removed memory hook {}", id.as_u64());
        }
        id
    }

    /// Whether a hook is currently installed.
    #[inline]
    pub fn is_installed(&self) -> bool {
        !self.active.load(Ordering::Acquire).is_null()
    }

    /// Id of the active hook.
    pub fn active_id(&self) -> Option<HookId> {
        ReadGuard::new(self).slot().map(|slot| slot.id)
    }

    /// Number of replaced hooks not yet freed.
    pub fn retired_count(&self) -> usize {
        self.retired.lock().len()
    }

    /// Free retired hooks if no access is in flight.
    ///
    /// Returns the number freed. Install and remove already do this; an owner
    /// that replaces hooks while guests run can call it again at a quiescent
    /// point.
    pub fn try_reclaim(&self) -> usize {
        let freed = {
            let mut retired = self.retired.lock();
            if retired.is_empty() || self.readers.load(Ordering::SeqCst) != 0 {
                return 0;
            }
            core::mem::take(&mut *retired)
        };
        let count = freed.len();
        log::trace!("hooks: reclaimed {} retired hook(s)", count);
        // Hook destructors run outside the lock.
        drop(freed);
        count
    }

    /// Run `f` on the active hook, keeping it alive for the call.
    #[inline]
    pub fn with_active<R>(&self, f: impl FnOnce(&dyn MemoryAccessHook) -> R) -> Option<R> {
        let guard = ReadGuard::new(self);
        guard.slot().map(|slot| f(&*slot.hook))
    }

    /// Run the active hook over `access` and return the effective address.
    ///
    /// Returns `access.addr` unchanged when no hook is installed or the hook
    /// does not redirect.
    #[inline]
    pub fn dispatch(&self, access: &MemoryAccess) -> GuestAddr {
        if !self.is_installed() {
            return access.addr;
        }
        self.with_active(|hook| hook.on_access(access))
            .flatten()
            .unwrap_or(access.addr)
    }

    fn retire(&self, old: *mut HookSlot) -> Option<HookId> {
        if old.is_null() {
            return None;
        }
        // SAFETY: `old` came from `Box::into_raw` and was just unpublished,
        // so ownership returns to us exactly once.
        let slot = unsafe { Box::from_raw(old) };
        let id = slot.id;
        self.retired.lock().push(slot);
        self.try_reclaim();
        Some(id)
    }
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for HookRegistry {
    fn drop(&mut self) {
        let p = *self.active.get_mut();
        if !p.is_null() {
            // SAFETY: exclusive access; the pointer is still owned by `active`.
            drop(unsafe { Box::from_raw(p) });
        }
    }
}
