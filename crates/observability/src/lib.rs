//! Process-wide logging setup for ledger binaries and tools.

pub mod tracing;

pub use crate::tracing::{LOG_FORMAT_VAR, LogFormat, UnknownLogFormat};

/// Initialize tracing from the environment (`RUST_LOG`, `ATELIER_LOG_FORMAT`).
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    crate::tracing::init(LogFormat::from_env());
}
