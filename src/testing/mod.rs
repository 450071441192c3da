//! Testing utilities and mock implementations
//!
//! Provides a scriptable in-memory transport so the reconnection and
//! subscription-replay behavior can be tested without a running server.

pub mod mocks;

pub use mocks::*;
