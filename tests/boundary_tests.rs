//! Integration tests for the assembled boundary.
//!
//! Tests builder validation and the outward entry points end to end.

#![cfg(all(feature = "snapshot", feature = "exits"))]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use vmhook::boundary::{BoundaryBuilder, BuildError};
use vmhook::config::BoundaryConfig;
use vmhook::exit::{ArchState, CpuHandle, ExitRequester};
use vmhook::hooks::{AccessDirection, GuestAddr, MemoryAccess};
use vmhook::runstate::{RunState, RunStateControl, SharedRunState};
use vmhook::snapshot::{EngineResult, SaveOptions, SnapshotEngine};

#[derive(Default)]
struct CountingEngine {
    saves: AtomicUsize,
    loads: AtomicUsize,
}

impl SnapshotEngine for CountingEngine {
    fn save_snapshot(&self, _name: &[u8], _options: &SaveOptions) -> EngineResult {
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn load_snapshot(&self, _name: &[u8]) -> EngineResult {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct Exits {
    seen: Mutex<Vec<(CpuHandle, GuestAddr, &'static str)>>,
}

impl ExitRequester for Exits {
    fn request_breakpoint_exit(&self, cpu: CpuHandle, pc: GuestAddr) {
        self.seen.lock().unwrap().push((cpu, pc, "bp"));
    }

    fn request_sync_backdoor_exit(&self, cpu: CpuHandle, pc: GuestAddr) {
        self.seen.lock().unwrap().push((cpu, pc, "backdoor"));
    }
}

// =============================================================================
// Builder
// =============================================================================

#[test]
fn test_build_requires_engine() {
    let err = BoundaryBuilder::new(BoundaryConfig::new())
        .run_state(Arc::new(SharedRunState::default()))
        .exit_requester(Arc::new(Exits::default()))
        .build()
        .err()
        .unwrap();
    assert_eq!(err, BuildError::Missing("snapshot engine"));
}

#[test]
fn test_build_requires_exit_requester() {
    let err = BoundaryBuilder::new(BoundaryConfig::new())
        .snapshot_engine(Arc::new(CountingEngine::default()))
        .run_state(Arc::new(SharedRunState::default()))
        .build()
        .err()
        .unwrap();
    assert_eq!(err, BuildError::Missing("exit requester"));
}

// =============================================================================
// End to End
// =============================================================================

#[test]
fn test_entry_points() {
    let engine = Arc::new(CountingEngine::default());
    let run_state = Arc::new(SharedRunState::new(RunState::Running));
    let exits = Arc::new(Exits::default());

    let boundary = BoundaryBuilder::new(BoundaryConfig::new().with_queue_capacity(8))
        .snapshot_engine(engine.clone())
        .run_state(run_state.clone())
        .exit_requester(exits.clone())
        .build()
        .unwrap();

    // Memory hooks
    assert_eq!(boundary.intercept_memory_access(0x100, 8, AccessDirection::Read, 0), 0x100);
    boundary.install_hook(Arc::new(|access: &MemoryAccess| -> Option<GuestAddr> {
        (access.pc == 0x4000).then_some(access.addr + 0x1000)
    }));
    boundary.set_generation_pc(0x4000);
    assert_eq!(boundary.intercept_memory_access(0x100, 8, AccessDirection::Read, 0), 0x1100);
    boundary.set_generation_pc(0x4004);
    assert_eq!(boundary.intercept_memory_access(0x100, 8, AccessDirection::Read, 0), 0x100);

    // Snapshots
    boundary.save_snapshot(b"s", true);
    boundary.load_snapshot(b"s", false);
    assert_eq!(engine.saves.load(Ordering::SeqCst), 1);
    assert_eq!(engine.loads.load(Ordering::SeqCst), 0);

    let queue = boundary.task_queue().unwrap();
    assert_eq!(queue.run_pending(), 1);
    assert_eq!(engine.loads.load(Ordering::SeqCst), 1);
    assert!(run_state.is_running());

    // Exits
    let table = boundary.vcpu_table().unwrap();
    table.register(ArchState(0xaaaa), CpuHandle(3));
    assert!(boundary.on_breakpoint(ArchState(0xaaaa), 0x10));
    assert!(boundary.on_sync_backdoor(ArchState(0xaaaa), 0x20));
    assert_eq!(
        *exits.seen.lock().unwrap(),
        [(CpuHandle(3), 0x10, "bp"), (CpuHandle(3), 0x20, "backdoor")]
    );
}

#[test]
fn test_queue_capacity_from_config() {
    let engine = Arc::new(CountingEngine::default());
    let boundary = BoundaryBuilder::new(BoundaryConfig::new().with_queue_capacity(2))
        .snapshot_engine(engine.clone())
        .run_state(Arc::new(SharedRunState::default()))
        .exit_requester(Arc::new(Exits::default()))
        .build()
        .unwrap();

    for _ in 0..5 {
        boundary.save_snapshot(b"x", false);
    }
    assert_eq!(boundary.coordinator().stats().rejected, 3);
    assert_eq!(boundary.task_queue().unwrap().run_pending(), 2);
    assert_eq!(engine.saves.load(Ordering::SeqCst), 2);
}

#[test]
fn test_shared_registry() {
    let registry = Arc::new(vmhook::hooks::HookRegistry::new());
    let boundary = BoundaryBuilder::new(BoundaryConfig::new().with_trace_accesses(true))
        .hook_registry(registry.clone())
        .snapshot_engine(Arc::new(CountingEngine::default()))
        .run_state(Arc::new(SharedRunState::default()))
        .exit_requester(Arc::new(Exits::default()))
        .build()
        .unwrap();

    registry.install(Arc::new(|_: &MemoryAccess| -> Option<GuestAddr> { Some(7) }));
    assert!(boundary.hooks().is_installed());
    assert_eq!(boundary.intercept_memory_access(0x100, 1, AccessDirection::Write, 0xff), 7);
}
