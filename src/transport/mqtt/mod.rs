//! MQTT v5 transport for resilient sessions
//!
//! This module separates pure functions from I/O operations for better
//! testability.
//!
//! # Architecture
//!
//! - [`connection`] - Client options from a session URL, error classification
//! - [`message_handler`] - Event routing and request/acknowledgment matching
//! - [`client`] - Session factory, session handle, and event-loop driver
//!
//! # Usage
//!
//! ```rust,no_run
//! use resilient_session::config::ClientConfig;
//! use resilient_session::manager::ConnectionManager;
//! use resilient_session::transport::mqtt::MqttTransport;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let config = ClientConfig::for_url("mqtt://localhost:1883");
//! let manager = ConnectionManager::new(Arc::new(MqttTransport::new()));
//!
//! manager.connect(&config.session.url, &config).await?;
//! manager.subscribe("sensors/+/temperature").await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod message_handler;

// Re-export public types for convenience
pub use client::{MqttSession, MqttTransport};
pub use connection::{
    classify_connection_error, configure_mqtt_options, ConnectionFailure, TransportKind,
};
pub use message_handler::{EventRoute, MessageHandler, PendingRequests, RequestKind};
