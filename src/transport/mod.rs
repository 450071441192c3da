//! Session transports
//!
//! A transport implements [`SessionFactory`](crate::session::SessionFactory)
//! and the [`Session`](crate::session::Session) it opens. MQTT is the only
//! wire protocol provided; tests use the in-memory transport in
//! [`testing`](crate::testing).

pub mod mqtt;

pub use mqtt::MqttTransport;
