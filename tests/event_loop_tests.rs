//! Integration tests for the owner-thread task queue.
//!
//! Tests ordering across submitter threads, capacity, close semantics and
//! tasks scheduling further tasks.

#![cfg(feature = "snapshot")]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use vmhook::event_loop::{DeferredTask, OwnerScheduler, ScheduleError, TaskQueue};

// =============================================================================
// Ordering
// =============================================================================

#[test]
fn test_per_submitter_order_is_preserved() {
    let queue = Arc::new(TaskQueue::new());
    let seen = Arc::new(Mutex::new(Vec::new()));

    let submitters: Vec<_> = (0..4u32)
        .map(|t| {
            let queue = queue.clone();
            let seen = seen.clone();
            thread::spawn(move || {
                for n in 0..50u32 {
                    let seen = seen.clone();
                    queue
                        .schedule(DeferredTask::new("push", move || {
                            seen.lock().unwrap().push((t, n))
                        }))
                        .unwrap();
                }
            })
        })
        .collect();
    for s in submitters {
        s.join().unwrap();
    }

    assert_eq!(queue.run_pending(), 200);

    let seen = seen.lock().unwrap();
    for t in 0..4u32 {
        let order: Vec<u32> = seen.iter().filter(|(s, _)| *s == t).map(|(_, n)| *n).collect();
        assert_eq!(order, (0..50).collect::<Vec<_>>());
    }
}

#[test]
fn test_task_may_schedule_more_work() {
    let queue = Arc::new(TaskQueue::new());
    let ran = Arc::new(AtomicUsize::new(0));

    let inner_queue = queue.clone();
    let inner_ran = ran.clone();
    queue
        .schedule(DeferredTask::new("outer", move || {
            inner_ran.fetch_add(1, Ordering::SeqCst);
            let ran = inner_ran.clone();
            inner_queue
                .schedule(DeferredTask::new("inner", move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap();
        }))
        .unwrap();

    assert_eq!(queue.run_pending(), 2);
    assert_eq!(ran.load(Ordering::SeqCst), 2);
    assert_eq!(queue.pending(), 0);
}

#[test]
fn test_nothing_runs_until_drained() {
    let queue = TaskQueue::new();
    let ran = Arc::new(AtomicUsize::new(0));
    let r = ran.clone();
    queue
        .schedule(DeferredTask::new("later", move || {
            r.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert!(queue.run_one());
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

// =============================================================================
// Capacity and Close
// =============================================================================

#[test]
fn test_capacity_frees_up_after_drain() {
    let queue = TaskQueue::with_capacity(2);
    queue.schedule(DeferredTask::new("a", || {})).unwrap();
    queue.schedule(DeferredTask::new("b", || {})).unwrap();
    assert_eq!(
        queue.schedule(DeferredTask::new("c", || {})),
        Err(ScheduleError::QueueFull(2))
    );

    queue.run_one();
    assert!(queue.schedule(DeferredTask::new("c", || {})).is_ok());
}

#[test]
fn test_close_is_final() {
    let queue = TaskQueue::new();
    let ran = Arc::new(AtomicUsize::new(0));
    for _ in 0..3 {
        let r = ran.clone();
        queue
            .schedule(DeferredTask::new("dropped", move || {
                r.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
    }

    assert_eq!(queue.close(), 3);
    assert!(queue.is_closed());
    assert_eq!(queue.run_pending(), 0);
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert_eq!(Arc::strong_count(&ran), 1);
    assert_eq!(queue.close(), 0);
}

#[test]
fn test_task_label() {
    let task = DeferredTask::new("save_snapshot", || {});
    assert_eq!(task.label(), "save_snapshot");
    assert!(format!("{:?}", task).contains("save_snapshot"));
    assert_eq!(ScheduleError::Closed.to_string(), "Deferred task queue closed");
}
