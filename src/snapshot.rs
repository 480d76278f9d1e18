//! Snapshot save/load coordination.
//!
//! Saves and loads either run inline on the calling thread or are deferred to
//! the VM's owner thread through an [`OwnerScheduler`]. Both variants share one
//! core: a deferred request is just the inline operation moved into a task
//! together with its owned [`SnapshotName`].
//!
//! Failures never propagate out of [`SnapshotCoordinator::save`] and
//! [`SnapshotCoordinator::load`]; they are reported through the
//! [`DiagnosticSink`]. [`SnapshotCoordinator::request`] and
//! [`SnapshotCoordinator::submit`] additionally return the structured result.
//!
//! # Example
//!
//! ```ignore
//! let queue = Arc::new(TaskQueue::new());
//! let coordinator = SnapshotCoordinator::new(engine, run_state, queue.clone());
//!
//! // From a fuzzer thread:
//! coordinator.save(b"boot", false);
//!
//! // Later, on the owner thread:
//! queue.run_pending();
//! ```

use alloc::boxed::Box;
use alloc::format;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use axerrno::AxError;

use crate::diag::{DiagnosticSink, LogSink};
use crate::event_loop::{DeferredTask, OwnerScheduler, ScheduleError};
use crate::runstate::RunStateControl;
use crate::stats::{CoordinatorStats, StatsSnapshot};

#[cfg(any(test, feature = "test-utils"))]
use core::sync::atomic::{AtomicUsize, Ordering};

#[cfg(any(test, feature = "test-utils"))]
static LIVE_NAMES: AtomicUsize = AtomicUsize::new(0);

/// Options passed to the engine on every save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveOptions {
    /// Replace an existing snapshot of the same name.
    pub overwrite: bool,
    /// Include device and auxiliary VM state, not just RAM.
    pub auxiliary_state: bool,
    /// Write guest RAM incrementally rather than in one pass.
    pub iterative_ram: bool,
    /// Restrict the saved devices to these names. `None` saves all of them.
    pub device_filter: Option<Vec<String>>,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            overwrite: true,
            auxiliary_state: true,
            iterative_ram: true,
            device_filter: None,
        }
    }
}

/// Failure reported by a [`SnapshotEngine`].
///
/// `AxError` is only a code, so the engine's explanation travels next to it
/// and ends up in the diagnostic report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineError {
    /// Error kind.
    pub kind: AxError,
    /// Engine explanation, may be empty.
    pub message: String,
}

impl EngineError {
    /// Create an error of `kind` explained by `message`.
    pub fn new(kind: impl Into<AxError>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl From<AxError> for EngineError {
    fn from(kind: AxError) -> Self {
        Self {
            kind,
            message: String::new(),
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{} ({})", self.message, self.kind)
        }
    }
}

impl core::error::Error for EngineError {}

/// Result type returned by [`SnapshotEngine`].
pub type EngineResult<T = ()> = Result<T, EngineError>;

/// External engine that encodes and decodes machine state.
pub trait SnapshotEngine: Send + Sync {
    /// Save the full machine state under `name`.
    fn save_snapshot(&self, name: &[u8], options: &SaveOptions) -> EngineResult;

    /// Restore the machine state saved under `name`.
    fn load_snapshot(&self, name: &[u8]) -> EngineResult;
}

/// Error types for snapshot operations.
#[derive(Debug)]
pub enum SnapshotError {
    /// The engine failed to save.
    SaveFailed { name: String, cause: EngineError },
    /// The engine failed to load. The VM is left stopped.
    LoadFailed { name: String, cause: EngineError },
    /// The owned copy of the name could not be allocated.
    OutOfMemory(usize),
    /// The request could not be posted to the owner thread.
    Schedule(ScheduleError),
}

impl fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SaveFailed { name, cause } => {
                write!(f, "Saving snapshot '{}' failed: {}", name, cause)
            }
            Self::LoadFailed { name, cause } => {
                write!(f, "Loading snapshot '{}' failed: {}", name, cause)
            }
            Self::OutOfMemory(len) => {
                write!(f, "Out of memory copying a {}-byte snapshot name", len)
            }
            Self::Schedule(e) => write!(f, "Could not defer snapshot request: {}", e),
        }
    }
}

impl core::error::Error for SnapshotError {}

impl From<ScheduleError> for SnapshotError {
    fn from(e: ScheduleError) -> Self {
        Self::Schedule(e)
    }
}

/// Snapshot operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOp {
    Save,
    Load,
}

impl SnapshotOp {
    /// Label used for deferred tasks.
    pub fn label(&self) -> &'static str {
        match self {
            SnapshotOp::Save => "save_snapshot",
            SnapshotOp::Load => "load_snapshot",
        }
    }

    fn failure_summary(&self) -> &'static str {
        match self {
            SnapshotOp::Save => "Could not save snapshot",
            SnapshotOp::Load => "Could not load snapshot",
        }
    }
}

/// Where a snapshot request runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// On the calling thread, before returning. The caller must be the owner
    /// thread, or no other thread may be touching the VM yet.
    Inline,
    /// Posted to the owner thread; the call returns immediately.
    Deferred,
}

impl ExecutionMode {
    /// Map the `synchronous` flag of the entry points.
    pub const fn from_sync(synchronous: bool) -> Self {
        if synchronous { Self::Inline } else { Self::Deferred }
    }
}

/// Owned snapshot name carried by a deferred request.
///
/// Released exactly once, when the request finishes or is dropped unrun.
pub struct SnapshotName {
    bytes: Box<[u8]>,
    #[cfg(any(test, feature = "test-utils"))]
    drop_counter: Option<Arc<AtomicUsize>>,
}

impl SnapshotName {
    /// Copy `name` into an owned buffer, failing instead of aborting when the
    /// allocation cannot be satisfied.
    pub fn try_from_bytes(name: &[u8]) -> Result<Self, SnapshotError> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(name.len())
            .map_err(|_| SnapshotError::OutOfMemory(name.len()))?;
        buf.extend_from_slice(name);
        #[cfg(any(test, feature = "test-utils"))]
        LIVE_NAMES.fetch_add(1, Ordering::SeqCst);
        Ok(Self {
            bytes: buf.into_boxed_slice(),
            #[cfg(any(test, feature = "test-utils"))]
            drop_counter: None,
        })
    }

    /// Raw name bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Number of names currently alive in the process.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn live_count() -> usize {
        LIVE_NAMES.load(Ordering::SeqCst)
    }

    /// Count drops of this name into `drops`.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn with_drop_counter(mut self, drops: Arc<AtomicUsize>) -> Self {
        self.drop_counter = Some(drops);
        self
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl Drop for SnapshotName {
    fn drop(&mut self) {
        LIVE_NAMES.fetch_sub(1, Ordering::SeqCst);
        if let Some(drops) = &self.drop_counter {
            drops.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl fmt::Display for SnapshotName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.bytes))
    }
}

impl fmt::Debug for SnapshotName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SnapshotName({:?})", String::from_utf8_lossy(&self.bytes))
    }
}

/// A save or load request with an owned name.
#[derive(Debug)]
pub struct SnapshotRequest {
    pub op: SnapshotOp,
    pub name: SnapshotName,
    pub mode: ExecutionMode,
}

impl SnapshotRequest {
    /// Build a request, copying `name`.
    pub fn new(op: SnapshotOp, name: &[u8], mode: ExecutionMode) -> Result<Self, SnapshotError> {
        Ok(Self {
            op,
            name: SnapshotName::try_from_bytes(name)?,
            mode,
        })
    }
}

/// State shared between the coordinator and its deferred tasks.
#[derive(Clone)]
struct CoordinatorCore {
    engine: Arc<dyn SnapshotEngine>,
    run_state: Arc<dyn RunStateControl>,
    diag: Arc<dyn DiagnosticSink>,
    save_options: Arc<SaveOptions>,
    stats: Arc<CoordinatorStats>,
}

impl CoordinatorCore {
    fn execute(&self, op: SnapshotOp, name: &[u8]) -> Result<(), SnapshotError> {
        let result = match op {
            SnapshotOp::Save => self.save_now(name),
            SnapshotOp::Load => self.load_now(name),
        };
        if let Err(e) = &result {
            self.diag.report_error(&e.to_string());
            self.diag.report_error(op.failure_summary());
        }
        result
    }

    fn save_now(&self, name: &[u8]) -> Result<(), SnapshotError> {
        log::debug!("snapshot: saving '{}'", String::from_utf8_lossy(name));
        let result = self
            .engine
            .save_snapshot(name, &self.save_options)
            .map_err(|cause| SnapshotError::SaveFailed {
                name: String::from_utf8_lossy(name).into_owned(),
                cause,
            });
        self.stats.record_save(result.is_ok());
        result
    }

    fn load_now(&self, name: &[u8]) -> Result<(), SnapshotError> {
        let was_running = self.run_state.is_running();
        self.run_state.stop_for_restore();
        log::debug!(
            "snapshot: loading '{}' (was_running={})",
            String::from_utf8_lossy(name),
            was_running
        );

        match self.engine.load_snapshot(name) {
            Ok(()) => {
                self.stats.record_load(true);
                if was_running {
                    self.run_state.resume();
                }
                Ok(())
            }
            Err(cause) => {
                self.stats.record_load(false);
                Err(SnapshotError::LoadFailed {
                    name: String::from_utf8_lossy(name).into_owned(),
                    cause,
                })
            }
        }
    }
}

/// Coordinates snapshot saves and loads with the VM run state.
pub struct SnapshotCoordinator {
    core: CoordinatorCore,
    scheduler: Arc<dyn OwnerScheduler>,
}

impl SnapshotCoordinator {
    /// Create a coordinator reporting failures through [`LogSink`].
    pub fn new(
        engine: Arc<dyn SnapshotEngine>,
        run_state: Arc<dyn RunStateControl>,
        scheduler: Arc<dyn OwnerScheduler>,
    ) -> Self {
        Self {
            core: CoordinatorCore {
                engine,
                run_state,
                diag: Arc::new(LogSink),
                save_options: Arc::new(SaveOptions::default()),
                stats: Arc::new(CoordinatorStats::new()),
            },
            scheduler,
        }
    }

    /// Report failures through `diag`.
    pub fn with_diagnostics(mut self, diag: Arc<dyn DiagnosticSink>) -> Self {
        self.core.diag = diag;
        self
    }

    /// Use `options` for every save.
    pub fn with_save_options(mut self, options: SaveOptions) -> Self {
        self.core.save_options = Arc::new(options);
        self
    }

    /// Options used for every save.
    pub fn save_options(&self) -> &SaveOptions {
        &self.core.save_options
    }

    /// Save a snapshot. Failures are only reported, never returned.
    pub fn save(&self, name: &[u8], synchronous: bool) {
        let _ = self.request(SnapshotOp::Save, name, ExecutionMode::from_sync(synchronous));
    }

    /// Load a snapshot. Failures are only reported, never returned.
    ///
    /// The guest is stopped for the restore and resumed afterwards only if it
    /// was running before and the load succeeded.
    pub fn load(&self, name: &[u8], synchronous: bool) {
        let _ = self.request(SnapshotOp::Load, name, ExecutionMode::from_sync(synchronous));
    }

    /// Run or defer `op` on `name`.
    ///
    /// Inline requests borrow `name` and return the engine result. Deferred
    /// requests copy it and return once the task is posted. Every error is
    /// also reported through the diagnostic sink.
    pub fn request(
        &self,
        op: SnapshotOp,
        name: &[u8],
        mode: ExecutionMode,
    ) -> Result<(), SnapshotError> {
        match mode {
            ExecutionMode::Inline => self.core.execute(op, name),
            ExecutionMode::Deferred => match SnapshotRequest::new(op, name, mode) {
                Ok(request) => self.submit(request),
                Err(e) => {
                    self.reject(op, &e);
                    Err(e)
                }
            },
        }
    }

    /// Run or defer an already-built request, consuming it.
    pub fn submit(&self, request: SnapshotRequest) -> Result<(), SnapshotError> {
        let op = request.op;
        if request.mode == ExecutionMode::Inline {
            return self.core.execute(op, request.name.as_bytes());
        }

        let core = self.core.clone();
        let task = DeferredTask::new(op.label(), move || {
            core.stats.record_executed();
            let _ = core.execute(request.op, request.name.as_bytes());
        });

        // Counted before posting: the owner may run the task before
        // `schedule` returns.
        self.core.stats.record_submitted();
        match self.scheduler.schedule(task) {
            Ok(()) => {
                log::debug!("snapshot: deferred {}", op.label());
                Ok(())
            }
            Err(e) => {
                self.core.stats.undo_submitted();
                let e = SnapshotError::from(e);
                self.reject(op, &e);
                Err(e)
            }
        }
    }

    /// Coordinator statistics.
    pub fn stats(&self) -> StatsSnapshot {
        self.core.stats.snapshot()
    }

    /// Reset coordinator statistics.
    pub fn reset_stats(&self) {
        self.core.stats.reset();
    }

    fn reject(&self, op: SnapshotOp, e: &SnapshotError) {
        self.core.stats.record_rejected();
        self.core.diag.report_error(&format!("{}: {}", op.label(), e));
    }
}
