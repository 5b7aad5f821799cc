//! The internal-event convention: each observable occurrence inside the core
//! is a struct whose `emit` both logs and updates the metrics facade, so a
//! single call site cannot drift between the two.

/// An event worth surfacing through logs and metrics.
pub trait InternalEvent: Sized {
    /// Emit the event: log it and bump the associated metrics.
    fn emit(self);

    /// Name used when asserting emission in tests.
    fn name(&self) -> Option<&'static str> {
        None
    }
}

/// Emit an internal event.
pub fn emit(event: impl InternalEvent) {
    event.emit();
}

/// Standardized `error_type` label values, so dashboards can group failures
/// without per-component string drift.
pub mod error_type {
    pub const READER_FAILED: &str = "reader_failed";
    pub const WRITER_FAILED: &str = "writer_failed";
    pub const PARSER_FAILED: &str = "parser_failed";
    pub const CONDITION_FAILED: &str = "condition_failed";
    pub const REQUEST_FAILED: &str = "request_failed";
}
