//! C ABI entry points over a process-wide [`Boundary`].
//!
//! The VM's translator and main loop are usually not written in Rust. They
//! reach the boundary through these `extern "C"` functions once the embedding
//! application has called [`install`]. Before that, every entry point is a
//! no-op (memory accesses pass through unchanged).

use core::ffi::{CStr, c_char, c_void};

use spin::Once;

use crate::boundary::Boundary;
use crate::exit::ArchState;
use crate::hooks::{GuestAddr, RawMemoryHook, RawMemoryHookFn};

static BOUNDARY: Once<Boundary> = Once::new();

/// Publish `boundary` as the process-wide instance.
///
/// Returns `false` if one was already installed; `boundary` is dropped then.
pub fn install(boundary: Boundary) -> bool {
    let mut installed = false;
    BOUNDARY.call_once(|| {
        installed = true;
        boundary
    });
    if installed {
        log::info!("ffi: process-wide boundary installed");
    } else {
        log::warn!("ffi: boundary already installed, ignoring");
    }
    installed
}

/// The process-wide boundary, if installed.
pub fn global() -> Option<&'static Boundary> {
    BOUNDARY.get()
}

/// Per-access helper called from translated code.
#[unsafe(no_mangle)]
pub extern "C" fn vmhook_pre_memrw(
    addr: GuestAddr,
    size: u64,
    rw: u32,
    low64_val: u64,
    high64_val: u64,
) -> GuestAddr {
    match BOUNDARY.get() {
        Some(b) => b.interceptor().intercept_split(addr, size, rw, low64_val, high64_val),
        None => addr,
    }
}

/// Record the pc of the guest instruction being translated.
#[unsafe(no_mangle)]
pub extern "C" fn vmhook_set_gen_pc(pc: GuestAddr) {
    if let Some(b) = BOUNDARY.get() {
        b.set_generation_pc(pc);
    }
}

/// Install a `{callback, data}` memory hook, replacing any previous one.
///
/// Returns the hook id, or 0 if no boundary is installed.
#[unsafe(no_mangle)]
pub extern "C" fn vmhook_install_memrw_hook(callback: RawMemoryHookFn, data: u64) -> u64 {
    match BOUNDARY.get() {
        Some(b) => b.hooks().install_raw(RawMemoryHook::new(callback, data)).as_u64(),
        None => 0,
    }
}

/// Remove the memory hook. Returns its id, or 0 if none was installed.
#[unsafe(no_mangle)]
pub extern "C" fn vmhook_remove_memrw_hook() -> u64 {
    BOUNDARY
        .get()
        .and_then(|b| b.hooks().remove())
        .map_or(0, |id| id.as_u64())
}

/// Save a snapshot.
///
/// # Safety
///
/// `name` must be null or point to a NUL-terminated string valid for the
/// duration of the call.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn vmhook_save_snapshot(name: *const c_char, sync: bool) {
    // SAFETY: forwarded from the caller's contract.
    if let (Some(b), Some(name)) = (BOUNDARY.get(), unsafe { name_bytes(name) }) {
        b.save_snapshot(name, sync);
    }
}

/// Load a snapshot.
///
/// # Safety
///
/// `name` must be null or point to a NUL-terminated string valid for the
/// duration of the call.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn vmhook_load_snapshot(name: *const c_char, sync: bool) {
    // SAFETY: forwarded from the caller's contract.
    if let (Some(b), Some(name)) = (BOUNDARY.get(), unsafe { name_bytes(name) }) {
        b.load_snapshot(name, sync);
    }
}

/// Breakpoint helper called from translated code.
#[unsafe(no_mangle)]
pub extern "C" fn vmhook_handle_breakpoint(env: *mut c_void, pc: u64) {
    if let Some(b) = BOUNDARY.get() {
        b.on_breakpoint(ArchState(env as usize), pc);
    }
}

/// Sync backdoor helper called from translated code.
#[unsafe(no_mangle)]
pub extern "C" fn vmhook_handle_sync_backdoor(env: *mut c_void, pc: u64) {
    if let Some(b) = BOUNDARY.get() {
        b.on_sync_backdoor(ArchState(env as usize), pc);
    }
}

/// Borrow a C string's bytes, without the terminator.
unsafe fn name_bytes<'a>(name: *const c_char) -> Option<&'a [u8]> {
    if name.is_null() {
        log::error!("ffi: null snapshot name");
        return None;
    }
    // SAFETY: non-null and NUL-terminated per the caller's contract.
    Some(unsafe { CStr::from_ptr(name) }.to_bytes())
}
