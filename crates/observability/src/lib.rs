//! Process-wide tracing setup shared by fairq binaries.

/// Initialize structured logging with the default `info` filter.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    tracing::init("info");
}

/// Subscriber configuration (filters, JSON formatting).
pub mod tracing;
