//! Diagnostic channel for failures that do not propagate.
//!
//! Snapshot failures end here: they are reported and the entry point returns
//! normally.

/// Sink for error reports.
///
/// Reporting is fire-and-forget and must not block.
pub trait DiagnosticSink: Send + Sync {
    /// Report one error message.
    fn report_error(&self, message: &str);
}

/// Sink forwarding every report to `log::error!`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl DiagnosticSink for LogSink {
    fn report_error(&self, message: &str) {
        log::error!("{}", message);
    }
}
