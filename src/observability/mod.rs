//! Observability for the session layer
//!
//! Structured logging through `tracing`, with span macros for session and
//! reconnection context.

pub mod logging;

pub use logging::{init_default_logging, init_logging, LogFormat};

// Span macros for structured logging
pub use logging::{reconnect_span, session_span};
