//! Severity-gated logging sink.
//!
//! The gate is read once from the `GRPC_VERBOSITY` environment variable
//! (DEBUG, INFO or ERROR, defaulting to ERROR) and shared read-only for the
//! rest of the process. Events below the gate are dropped before they reach
//! the `tracing` subscriber.

use once_cell::sync::Lazy;

#[doc(hidden)]
pub use tracing;

/// Minimum severity an event needs to pass the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    Debug = 0,
    Info = 1,
    Error = 2,
}

impl Verbosity {
    fn from_env() -> Self {
        match std::env::var("GRPC_VERBOSITY") {
            Ok(value) => match value.to_ascii_uppercase().as_str() {
                "DEBUG" => Verbosity::Debug,
                "INFO" => Verbosity::Info,
                _ => Verbosity::Error,
            },
            Err(_) => Verbosity::Error,
        }
    }
}

static VERBOSITY: Lazy<Verbosity> = Lazy::new(Verbosity::from_env);

/// The process-wide verbosity gate.
pub fn verbosity() -> Verbosity {
    *VERBOSITY
}

/// Whether an event at `level` passes the gate.
pub fn enabled(level: Verbosity) -> bool {
    level >= verbosity()
}

/// Debug-level event, dropped unless `GRPC_VERBOSITY=DEBUG`.
#[macro_export]
macro_rules! grpc_debug {
    ($($arg:tt)*) => {
        if $crate::log::enabled($crate::log::Verbosity::Debug) {
            $crate::log::tracing::debug!($($arg)*);
        }
    };
}

/// Info-level event, dropped unless `GRPC_VERBOSITY` is DEBUG or INFO.
#[macro_export]
macro_rules! grpc_info {
    ($($arg:tt)*) => {
        if $crate::log::enabled($crate::log::Verbosity::Info) {
            $crate::log::tracing::info!($($arg)*);
        }
    };
}

/// Error-level event; always passes the gate.
#[macro_export]
macro_rules! grpc_error {
    ($($arg:tt)*) => {
        if $crate::log::enabled($crate::log::Verbosity::Error) {
            $crate::log::tracing::error!($($arg)*);
        }
    };
}
