//! Boundary configuration.

#[cfg(feature = "snapshot")]
use crate::snapshot::SaveOptions;

#[cfg(feature = "exits")]
use crate::exit::GuestWidth;

/// Configuration for a [`Boundary`](crate::boundary::Boundary).
#[derive(Debug, Clone, Default)]
pub struct BoundaryConfig {
    /// Emit a `trace!` record per hooked memory access.
    pub trace_accesses: bool,
    /// Maximum pending deferred snapshot requests. `None` means unbounded.
    #[cfg(feature = "snapshot")]
    pub queue_capacity: Option<usize>,
    /// Options passed to the engine on every save.
    #[cfg(feature = "snapshot")]
    pub save_options: SaveOptions,
    /// Guest word size for forwarded exit pcs.
    #[cfg(feature = "exits")]
    pub guest_width: GuestWidth,
}

impl BoundaryConfig {
    /// Default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set per-access tracing.
    pub fn with_trace_accesses(mut self, enabled: bool) -> Self {
        self.trace_accesses = enabled;
        self
    }

    /// Bound the deferred request queue.
    #[cfg(feature = "snapshot")]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    /// Set the save options.
    #[cfg(feature = "snapshot")]
    pub fn with_save_options(mut self, options: SaveOptions) -> Self {
        self.save_options = options;
        self
    }

    /// Set the guest word size.
    #[cfg(feature = "exits")]
    pub fn with_guest_width(mut self, width: GuestWidth) -> Self {
        self.guest_width = width;
        self
    }
}
