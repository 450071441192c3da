//! Resilient publish/subscribe sessions
//!
//! A session layer that keeps a client connected to a messaging server
//! across transient network failures, and restores every topic subscription
//! after each reconnection.
//!
//! # Overview
//!
//! - [`reconnect`] - exponential backoff policy and the reconnection strategy
//!   the transport consults when connectivity is lost
//! - [`registry`] - the set of topic selectors the caller expects, replayed
//!   onto every new connection
//! - [`manager`] - owns the single active session and publishes its lifecycle
//!   state (`Connecting → Connected → Recovering → Connected | Closed`)
//! - [`session`] - the capability traits a transport implements
//! - [`transport`] - the MQTT v5 transport
//!
//! # Quick Start
//!
//! ```rust
//! use resilient_session::reconnect::BackoffPolicy;
//! use std::time::Duration;
//!
//! let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(1)).unwrap();
//!
//! assert_eq!(policy.next_delay(0), Duration::from_millis(100));
//! assert_eq!(policy.next_delay(2), Duration::from_millis(400));
//! // Clamped to the ceiling
//! assert_eq!(policy.next_delay(10), Duration::from_secs(1));
//! ```

pub mod config;
pub mod error;
pub mod manager;
pub mod observability;
pub mod reconnect;
pub mod registry;
pub mod session;
pub mod testing;
pub mod transport;

pub use config::{ClientConfig, ConfigError};
pub use error::{SessionError, SessionResult};
pub use manager::ConnectionManager;
pub use reconnect::{BackoffPolicy, BackoffReconnectionStrategy};
pub use registry::SubscriptionRegistry;
pub use session::{CloseReason, SessionState};
pub use transport::mqtt::MqttTransport;
