//! # Quicken Utilities
//!
//! Shared utilities and logging bootstrap for the Quicken workspace.
//!
//! The unwinding library itself only emits `tracing` events; binaries and
//! host applications decide where those events go by calling one of the
//! initializers re-exported here.

pub mod logging;

// Re-export commonly used logging functions for convenience
pub use logging::{init_logging, init_logging_with_level, LogFormat, LogLevel, LoggingError, LoggingGuard};
pub use tracing::{debug, error, info, trace, warn};
