//! Observability helpers
//!
//! The crate logs through `tracing`; this module installs a subscriber for
//! applications that do not bring their own.

pub mod logging;

pub use logging::{build_filter, init_default_logging, init_logging, parse_level, LogFormat};

pub use logging::connection_span;
