//! Session capability consumed from the transport
//!
//! The transport owns the wire protocol. This module only defines what the
//! connection manager needs from it: a factory that opens a session wired to
//! a [`ReconnectionStrategy`], a handle for subscribe/unsubscribe/round-trip
//! requests, and a stream of [`SessionEvent`]s carrying lifecycle changes and
//! received values.

pub mod state;

pub use state::{log_state_transition, CloseReason, InvalidTransition, SessionState, Transition};

use crate::config::SessionSection;
use crate::error::SessionError;
use crate::reconnect::ReconnectionStrategy;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use url::Url;

/// Lifecycle notifications sent by the transport after a session is open
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Connectivity lost; the reconnection strategy has been consulted
    Recovering { reason: String },
    /// Transport-level reconnect succeeded
    Reconnected,
    /// The session ended and will not come back
    Closed(CloseReason),
    /// A value arrived on a subscribed topic
    Message(ReceivedMessage),
}

/// Value delivered on a subscribed topic.
///
/// The payload is handed over as opaque bytes; decoding it is up to the
/// caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

/// Sender half resolving a [`Completion`]
pub type CompletionSender = oneshot::Sender<Result<(), SessionError>>;

/// Server verdict for an issued request.
///
/// Returned once the request is issued; awaiting it waits for the server's
/// acknowledgment.
#[derive(Debug)]
pub struct Completion {
    rx: oneshot::Receiver<Result<(), SessionError>>,
}

impl Completion {
    pub fn channel() -> (CompletionSender, Completion) {
        let (tx, rx) = oneshot::channel();
        (tx, Completion { rx })
    }

    /// A completion that is already resolved
    pub fn ready(result: Result<(), SessionError>) -> Self {
        let (tx, completion) = Self::channel();
        let _ = tx.send(result);
        completion
    }

    /// Wait for acknowledgment
    pub async fn wait(self) -> Result<(), SessionError> {
        self.rx.await.unwrap_or_else(|_| {
            Err(SessionError::disconnected(
                "request abandoned before acknowledgment",
            ))
        })
    }
}

/// An open session to the messaging server
#[async_trait]
pub trait Session: Send + Sync {
    /// Server this session is connected to
    fn url(&self) -> &Url;

    /// Transport-level state
    fn state(&self) -> SessionState;

    /// Issue a subscribe request for `selector`
    async fn subscribe(&self, selector: &str) -> Result<Completion, SessionError>;

    /// Issue an unsubscribe request for `selector`
    async fn unsubscribe(&self, selector: &str) -> Result<Completion, SessionError>;

    /// Diagnostic request/acknowledgment round-trip, returning its latency
    async fn round_trip(&self) -> Result<Duration, SessionError>;

    /// Close the session. Safe to call more than once.
    async fn close(&self);
}

/// Opens sessions; the entry point of a transport
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Connect to `url`. Resolves once the session is connected or
    /// establishment failed; establishment failures are never retried.
    async fn open(
        &self,
        url: &Url,
        config: &SessionSection,
        strategy: Arc<dyn ReconnectionStrategy>,
        events: mpsc::Sender<SessionEvent>,
    ) -> Result<Arc<dyn Session>, SessionError>;
}
