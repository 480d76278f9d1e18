//! Integration tests for names copied by the public entry points.
//!
//! `save(name, false)` and `load(name, false)` copy the name internally. The
//! live-name count is process-wide, so everything runs in a single test.
//!
//! Run with `cargo test --features test-utils`.

#![cfg(all(feature = "snapshot", feature = "test-utils"))]

use std::sync::Arc;

use axerrno::AxError;
use vmhook::event_loop::TaskQueue;
use vmhook::runstate::{RunState, SharedRunState};
use vmhook::snapshot::{
    EngineError, EngineResult, SaveOptions, SnapshotCoordinator, SnapshotEngine, SnapshotName,
};

struct FailingEngine;

impl SnapshotEngine for FailingEngine {
    fn save_snapshot(&self, _name: &[u8], _options: &SaveOptions) -> EngineResult {
        Err(EngineError::new(AxError::Io, "write failed"))
    }

    fn load_snapshot(&self, _name: &[u8]) -> EngineResult {
        Err(EngineError::new(AxError::NotFound, "missing"))
    }
}

#[test]
fn test_entry_points_release_copied_names() {
    let queue = Arc::new(TaskQueue::with_capacity(4));
    let coordinator = SnapshotCoordinator::new(
        Arc::new(FailingEngine),
        Arc::new(SharedRunState::new(RunState::Running)),
        queue.clone(),
    );
    assert_eq!(SnapshotName::live_count(), 0);

    // Failed deferred save and load
    coordinator.save(b"x", false);
    coordinator.load(b"x", false);
    assert_eq!(SnapshotName::live_count(), 2);
    assert_eq!(queue.run_pending(), 2);
    assert_eq!(SnapshotName::live_count(), 0);
    assert_eq!(coordinator.stats().saves_failed, 1);
    assert_eq!(coordinator.stats().loads_failed, 1);

    // Inline requests borrow the caller's bytes
    coordinator.save(b"x", true);
    assert_eq!(SnapshotName::live_count(), 0);

    // Refused by a full queue
    for _ in 0..6 {
        coordinator.save(b"x", false);
    }
    assert_eq!(SnapshotName::live_count(), 4);
    assert_eq!(coordinator.stats().rejected, 2);

    // Dropped unrun at shutdown
    assert_eq!(queue.close(), 4);
    assert_eq!(SnapshotName::live_count(), 0);

    // Refused by a closed queue
    coordinator.save(b"x", false);
    assert_eq!(SnapshotName::live_count(), 0);
}
