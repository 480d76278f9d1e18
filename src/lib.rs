//! VM instrumentation boundary
//!
//! Lets an external analysis or fuzzing engine observe and steer a running
//! virtual machine without touching its execution core:
//!
//! - memory-access hooks, consulted by translated code on every guest
//!   load/store and able to rewrite the effective address;
//! - snapshot save/load coordination with the VM run state, either inline or
//!   deferred to the VM's owner thread;
//! - guest-triggered exits (breakpoints and the sync backdoor) forwarded to
//!   the engine.
//!
//! # Features
//!
//! - `snapshot` - Snapshot coordinator, owner-thread task queue, run state (default)
//! - `exits` - Breakpoint and sync backdoor exits (default)
//! - `ffi` - C ABI entry points over a process-wide boundary
//! - `test-utils` - Drop counters on snapshot names for leak tests
//!
//! # Quick Start
//!
//! ```ignore
//! use vmhook::boundary::BoundaryBuilder;
//! use vmhook::config::BoundaryConfig;
//!
//! let boundary = BoundaryBuilder::new(BoundaryConfig::new())
//!     .snapshot_engine(engine)
//!     .run_state(run_state)
//!     .exit_requester(engine_exits)
//!     .build()?;
//!
//! // Analysis engine, during setup
//! boundary.install_hook(Arc::new(my_hook));
//!
//! // Translated code, per access
//! let addr = boundary.intercept_memory_access(addr, 8, AccessDirection::Read, 0);
//!
//! // Any thread
//! boundary.save_snapshot(b"start", false);
//!
//! // Owner thread main loop
//! boundary.task_queue().unwrap().run_pending();
//! ```

#![no_std]

extern crate alloc;

// =============================================================================
// Memory Access Hooks
// =============================================================================

pub mod hooks;

pub mod interceptor;

// =============================================================================
// Configuration
// =============================================================================

pub mod config;

// =============================================================================
// Snapshot Module
// =============================================================================

#[cfg(feature = "snapshot")]
pub mod diag;

#[cfg(feature = "snapshot")]
pub mod event_loop;

#[cfg(feature = "snapshot")]
pub mod runstate;

#[cfg(feature = "snapshot")]
pub mod stats;

#[cfg(feature = "snapshot")]
pub mod snapshot;

// =============================================================================
// Guest Exits Module
// =============================================================================

#[cfg(feature = "exits")]
pub mod exit;

// =============================================================================
// Boundary Facade
// =============================================================================

pub mod boundary;

#[cfg(feature = "ffi")]
pub mod ffi;

// Re-export key types for convenience
pub use boundary::{Boundary, BoundaryBuilder, BuildError};
pub use config::BoundaryConfig;
pub use hooks::{
    AccessDirection, GuestAddr, HookId, HookRegistry, MemoryAccess, MemoryAccessHook,
    RawMemoryHook,
};
pub use interceptor::{AccessInterceptor, GenerationPc};

#[cfg(feature = "snapshot")]
pub use diag::{DiagnosticSink, LogSink};

#[cfg(feature = "snapshot")]
pub use event_loop::{DeferredTask, OwnerScheduler, ScheduleError, TaskQueue};

#[cfg(feature = "snapshot")]
pub use runstate::{RunState, RunStateControl, SharedRunState};

#[cfg(feature = "snapshot")]
pub use snapshot::{
    EngineError, EngineResult, ExecutionMode, SaveOptions, SnapshotCoordinator, SnapshotEngine,
    SnapshotError, SnapshotName, SnapshotOp, SnapshotRequest,
};

#[cfg(feature = "exits")]
pub use exit::{
    ArchState, CpuHandle, CpuResolver, ExitKind, ExitRequest, ExitRequester, GuestExits,
    GuestWidth, VcpuTable,
};
