//! Reconnection policy: when to retry a lost connection and when to stop
//!
//! - [`backoff`] - pure capped exponential delay computation
//! - [`strategy`] - the stateful strategy the transport consults on every
//!   reconnection event

pub mod backoff;
pub mod strategy;

pub use backoff::BackoffPolicy;
pub use strategy::{
    BackoffReconnectionStrategy, ReconnectionAttempt, ReconnectionOutcome, ReconnectionStrategy,
};
