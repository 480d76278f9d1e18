//! Assembled instrumentation boundary.
//!
//! [`Boundary`] wires the hook registry, the access interceptor, the snapshot
//! coordinator and the exit handlers together and exposes the entry points the
//! VM and the analysis engine call.
//!
//! # Example
//!
//! ```ignore
//! use vmhook::boundary::BoundaryBuilder;
//! use vmhook::config::BoundaryConfig;
//!
//! let boundary = BoundaryBuilder::new(BoundaryConfig::new().with_queue_capacity(64))
//!     .snapshot_engine(engine)
//!     .run_state(run_state)
//!     .exit_requester(requester)
//!     .build()?;
//!
//! boundary.hooks().install(hook);
//! ```

use alloc::sync::Arc;
use core::fmt;

use crate::config::BoundaryConfig;
use crate::hooks::{AccessDirection, GuestAddr, HookId, HookRegistry, MemoryAccessHook};
use crate::interceptor::{AccessInterceptor, GenerationPc};

#[cfg(feature = "snapshot")]
use crate::{
    diag::DiagnosticSink,
    event_loop::{OwnerScheduler, TaskQueue},
    runstate::RunStateControl,
    snapshot::{SnapshotCoordinator, SnapshotEngine},
};

#[cfg(feature = "exits")]
use crate::exit::{ArchState, CpuResolver, ExitRequester, GuestExits, VcpuTable};

/// Error types for building a boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildError {
    /// A required collaborator was not provided.
    Missing(&'static str),
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing(what) => write!(f, "Boundary is missing a {}", what),
        }
    }
}

impl core::error::Error for BuildError {}

/// Builder for [`Boundary`].
pub struct BoundaryBuilder {
    config: BoundaryConfig,
    registry: Option<Arc<HookRegistry>>,
    gen_pc: Option<Arc<GenerationPc>>,
    #[cfg(feature = "snapshot")]
    engine: Option<Arc<dyn SnapshotEngine>>,
    #[cfg(feature = "snapshot")]
    run_state: Option<Arc<dyn RunStateControl>>,
    #[cfg(feature = "snapshot")]
    scheduler: Option<Arc<dyn OwnerScheduler>>,
    #[cfg(feature = "snapshot")]
    diag: Option<Arc<dyn DiagnosticSink>>,
    #[cfg(feature = "exits")]
    resolver: Option<Arc<dyn CpuResolver>>,
    #[cfg(feature = "exits")]
    requester: Option<Arc<dyn ExitRequester>>,
}

impl BoundaryBuilder {
    /// Start building with `config`.
    pub fn new(config: BoundaryConfig) -> Self {
        Self {
            config,
            registry: None,
            gen_pc: None,
            #[cfg(feature = "snapshot")]
            engine: None,
            #[cfg(feature = "snapshot")]
            run_state: None,
            #[cfg(feature = "snapshot")]
            scheduler: None,
            #[cfg(feature = "snapshot")]
            diag: None,
            #[cfg(feature = "exits")]
            resolver: None,
            #[cfg(feature = "exits")]
            requester: None,
        }
    }

    /// Share an existing hook registry instead of creating one.
    pub fn hook_registry(mut self, registry: Arc<HookRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Share an existing generation pc slot instead of creating one.
    pub fn generation_pc(mut self, gen_pc: Arc<GenerationPc>) -> Self {
        self.gen_pc = Some(gen_pc);
        self
    }

    /// Engine performing the actual save and load. Required.
    #[cfg(feature = "snapshot")]
    pub fn snapshot_engine(mut self, engine: Arc<dyn SnapshotEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// VM run-state control. Required.
    #[cfg(feature = "snapshot")]
    pub fn run_state(mut self, run_state: Arc<dyn RunStateControl>) -> Self {
        self.run_state = Some(run_state);
        self
    }

    /// Owner-thread scheduler. Defaults to a [`TaskQueue`] sized from the config.
    #[cfg(feature = "snapshot")]
    pub fn scheduler(mut self, scheduler: Arc<dyn OwnerScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Diagnostic sink. Defaults to [`LogSink`](crate::diag::LogSink).
    #[cfg(feature = "snapshot")]
    pub fn diagnostics(mut self, diag: Arc<dyn DiagnosticSink>) -> Self {
        self.diag = Some(diag);
        self
    }

    /// vCPU resolver. Defaults to an empty [`VcpuTable`].
    #[cfg(feature = "exits")]
    pub fn cpu_resolver(mut self, resolver: Arc<dyn CpuResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Receiver of exit requests. Required.
    #[cfg(feature = "exits")]
    pub fn exit_requester(mut self, requester: Arc<dyn ExitRequester>) -> Self {
        self.requester = Some(requester);
        self
    }

    /// Assemble the boundary.
    pub fn build(self) -> Result<Boundary, BuildError> {
        let registry = self.registry.unwrap_or_else(|| Arc::new(HookRegistry::new()));
        let gen_pc = self.gen_pc.unwrap_or_default();
        let interceptor = AccessInterceptor::new(registry.clone(), gen_pc)
            .with_trace(self.config.trace_accesses);

        #[cfg(feature = "snapshot")]
        let (coordinator, task_queue) = {
            let engine = self.engine.ok_or(BuildError::Missing("snapshot engine"))?;
            let run_state = self.run_state.ok_or(BuildError::Missing("run-state control"))?;

            let (scheduler, task_queue): (Arc<dyn OwnerScheduler>, _) = match self.scheduler {
                Some(scheduler) => (scheduler, None),
                None => {
                    let queue = Arc::new(match self.config.queue_capacity {
                        Some(cap) => TaskQueue::with_capacity(cap),
                        None => TaskQueue::new(),
                    });
                    let scheduler: Arc<dyn OwnerScheduler> = queue.clone();
                    (scheduler, Some(queue))
                }
            };

            let mut coordinator = SnapshotCoordinator::new(engine, run_state, scheduler)
                .with_save_options(self.config.save_options.clone());
            if let Some(diag) = self.diag {
                coordinator = coordinator.with_diagnostics(diag);
            }
            (coordinator, task_queue)
        };

        #[cfg(feature = "exits")]
        let (exits, vcpu_table) = {
            let requester = self.requester.ok_or(BuildError::Missing("exit requester"))?;
            let (resolver, vcpu_table): (Arc<dyn CpuResolver>, _) = match self.resolver {
                Some(resolver) => (resolver, None),
                None => {
                    let table = Arc::new(VcpuTable::new());
                    let resolver: Arc<dyn CpuResolver> = table.clone();
                    (resolver, Some(table))
                }
            };
            let exits =
                GuestExits::new(resolver, requester).with_width(self.config.guest_width);
            (exits, vcpu_table)
        };

        log::info!(
            "boundary: built (hook installed: {}, trace_accesses: {})",
            registry.is_installed(),
            self.config.trace_accesses
        );

        Ok(Boundary {
            registry,
            interceptor,
            #[cfg(feature = "snapshot")]
            coordinator,
            #[cfg(feature = "snapshot")]
            task_queue,
            #[cfg(feature = "exits")]
            exits,
            #[cfg(feature = "exits")]
            vcpu_table,
        })
    }
}

/// The instrumentation boundary between a VM and an analysis engine.
pub struct Boundary {
    registry: Arc<HookRegistry>,
    interceptor: AccessInterceptor,
    #[cfg(feature = "snapshot")]
    coordinator: SnapshotCoordinator,
    #[cfg(feature = "snapshot")]
    task_queue: Option<Arc<TaskQueue>>,
    #[cfg(feature = "exits")]
    exits: GuestExits,
    #[cfg(feature = "exits")]
    vcpu_table: Option<Arc<VcpuTable>>,
}

impl Boundary {
    /// The hook registry.
    pub fn hooks(&self) -> &Arc<HookRegistry> {
        &self.registry
    }

    /// Install `hook`, replacing any previous one.
    pub fn install_hook(&self, hook: Arc<dyn MemoryAccessHook>) -> HookId {
        self.registry.install(hook)
    }

    /// Record the pc of the guest instruction being translated.
    #[inline]
    pub fn set_generation_pc(&self, pc: GuestAddr) {
        self.interceptor.generation_pc().set(pc);
    }

    /// Per-access entry point. Returns the address the guest should access.
    #[inline]
    pub fn intercept_memory_access(
        &self,
        addr: GuestAddr,
        size: u64,
        direction: AccessDirection,
        value: u128,
    ) -> GuestAddr {
        self.interceptor.intercept(addr, size, direction, value)
    }

    /// The access interceptor.
    pub fn interceptor(&self) -> &AccessInterceptor {
        &self.interceptor
    }

    /// Save a snapshot, inline or deferred to the owner thread.
    #[cfg(feature = "snapshot")]
    pub fn save_snapshot(&self, name: &[u8], synchronous: bool) {
        self.coordinator.save(name, synchronous);
    }

    /// Load a snapshot, inline or deferred to the owner thread.
    #[cfg(feature = "snapshot")]
    pub fn load_snapshot(&self, name: &[u8], synchronous: bool) {
        self.coordinator.load(name, synchronous);
    }

    /// The snapshot coordinator.
    #[cfg(feature = "snapshot")]
    pub fn coordinator(&self) -> &SnapshotCoordinator {
        &self.coordinator
    }

    /// The built-in task queue, if no external scheduler was supplied.
    ///
    /// The owner thread must drain it with
    /// [`run_pending`](TaskQueue::run_pending).
    #[cfg(feature = "snapshot")]
    pub fn task_queue(&self) -> Option<&Arc<TaskQueue>> {
        self.task_queue.as_ref()
    }

    /// Guest hit a breakpoint.
    #[cfg(feature = "exits")]
    pub fn on_breakpoint(&self, arch: ArchState, pc: u64) -> bool {
        self.exits.on_breakpoint(arch, pc)
    }

    /// Guest triggered the sync backdoor.
    #[cfg(feature = "exits")]
    pub fn on_sync_backdoor(&self, arch: ArchState, pc: u64) -> bool {
        self.exits.on_sync_backdoor(arch, pc)
    }

    /// The built-in vCPU table, if no external resolver was supplied.
    #[cfg(feature = "exits")]
    pub fn vcpu_table(&self) -> Option<&Arc<VcpuTable>> {
        self.vcpu_table.as_ref()
    }
}
