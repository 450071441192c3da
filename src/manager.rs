//! Connection manager: one session at a time, kept alive across outages
//!
//! The manager opens a session through its [`SessionFactory`], wires a
//! [`BackoffReconnectionStrategy`] into it, and supervises the session's
//! lifecycle events. Every (re)connection replays the
//! [`SubscriptionRegistry`] before `Connected` is published on the state
//! channel, so a caller observing `Connected` can rely on every registered
//! selector having been re-issued. Values received on subscribed topics are
//! fanned out to every [`ConnectionManager::messages`] receiver.

use crate::config::{validate_server_url, ClientConfig, DEFAULT_REQUEST_TIMEOUT_SECS};
use crate::error::{SessionError, SessionResult};
use crate::reconnect::{BackoffReconnectionStrategy, ReconnectionStrategy};
use crate::registry::SubscriptionRegistry;
use crate::session::{
    log_state_transition, CloseReason, Completion, ReceivedMessage, Session, SessionEvent,
    SessionFactory, SessionState, Transition,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

const EVENT_CHANNEL_CAPACITY: usize = 32;
const MESSAGE_CHANNEL_CAPACITY: usize = 256;

struct ActiveSession {
    session: Arc<dyn Session>,
    strategy: Arc<BackoffReconnectionStrategy>,
    supervisor: JoinHandle<()>,
    request_timeout: Duration,
}

/// Owns the current session, its reconnection strategy, and the registry
pub struct ConnectionManager {
    factory: Arc<dyn SessionFactory>,
    registry: SubscriptionRegistry,
    active: Mutex<Option<ActiveSession>>,
    state_tx: Arc<watch::Sender<Option<SessionState>>>,
    messages_tx: broadcast::Sender<ReceivedMessage>,
}

impl ConnectionManager {
    pub fn new(factory: Arc<dyn SessionFactory>) -> Self {
        Self::with_registry(factory, SubscriptionRegistry::new())
    }

    /// Manager sharing an existing registry, e.g. one pre-populated from config
    pub fn with_registry(factory: Arc<dyn SessionFactory>, registry: SubscriptionRegistry) -> Self {
        let (state_tx, _) = watch::channel(None);
        let (messages_tx, _) = broadcast::channel(MESSAGE_CHANNEL_CAPACITY);
        Self {
            factory,
            registry,
            active: Mutex::new(None),
            state_tx: Arc::new(state_tx),
            messages_tx,
        }
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// Current lifecycle state; `None` before the first `connect`
    pub fn state(&self) -> Option<SessionState> {
        self.state_tx.borrow().clone()
    }

    /// Subscribe to lifecycle state changes
    pub fn watch_state(&self) -> watch::Receiver<Option<SessionState>> {
        self.state_tx.subscribe()
    }

    /// Receive values published on subscribed topics, across reconnections.
    ///
    /// Only messages arriving after this call are delivered; a receiver that
    /// falls behind skips the oldest ones.
    pub fn messages(&self) -> broadcast::Receiver<ReceivedMessage> {
        self.messages_tx.subscribe()
    }

    /// The current session, closed or not
    pub async fn session(&self) -> Option<Arc<dyn Session>> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|active| active.session.clone())
    }

    /// Retries decided since the last successful connection
    pub async fn reconnection_attempts(&self) -> Option<u32> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|active| active.strategy.attempts())
    }

    /// Whether the current strategy has a retry timer armed
    pub async fn has_pending_retry(&self) -> bool {
        self.active
            .lock()
            .await
            .as_ref()
            .is_some_and(|active| active.strategy.has_pending_retry())
    }

    /// Open a session to `url`.
    ///
    /// Fails with `AlreadyOpen` while a non-closed session exists. A session
    /// that already reached `Closed` is replaced. Establishment failures are
    /// reported here once and never retried.
    pub async fn connect(
        &self,
        url: &str,
        config: &ClientConfig,
    ) -> SessionResult<Arc<dyn Session>> {
        let url =
            validate_server_url(url).map_err(|e| SessionError::InvalidUrl(e.to_string()))?;
        let strategy = Arc::new(BackoffReconnectionStrategy::from_config(&config.reconnect)?);

        let mut active = self.active.lock().await;
        if let Some(current) = active.as_ref() {
            let open = self.state().is_some_and(|state| !state.is_closed());
            if open {
                return Err(SessionError::AlreadyOpen {
                    url: current.session.url().to_string(),
                });
            }
        }
        if let Some(stale) = active.take() {
            debug!(url = %stale.session.url(), "Replacing closed session");
            stale.supervisor.abort();
        }

        info!(url = %url, "Connecting session");
        self.state_tx.send_replace(Some(SessionState::Connecting));

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let session = match self
            .factory
            .open(&url, &config.session, strategy.clone(), events_tx)
            .await
        {
            Ok(session) => session,
            Err(e) => {
                warn!(url = %url, error = %e, "Session establishment failed");
                strategy.must_close();
                apply_transition(&self.state_tx, Transition::Closed(e.close_reason()));
                return Err(e);
            }
        };

        self.registry.replay_all(session.clone()).await;
        apply_transition(&self.state_tx, Transition::Established);

        let supervisor = tokio::spawn(
            supervise(
                events_rx,
                session.clone(),
                self.registry.clone(),
                self.state_tx.clone(),
                self.messages_tx.clone(),
            )
            .instrument(crate::session_span!(url = %url)),
        );

        *active = Some(ActiveSession {
            session: session.clone(),
            strategy,
            supervisor,
            request_timeout: config.session.request_timeout(),
        });
        Ok(session)
    }

    /// Close the current session and cancel reconnection. Registered
    /// selectors are kept for the next `connect`. Closing twice is a no-op.
    pub async fn close(&self) {
        let Some(active) = self.active.lock().await.take() else {
            debug!("No session to close");
            return;
        };

        active.strategy.must_close();
        active.supervisor.abort();
        self.registry.detach().await;
        active.session.close().await;
        apply_transition(
            &self.state_tx,
            Transition::Closed(CloseReason::ClosedByClient),
        );
    }

    /// Register `selector` and, when connected, wait for the server's verdict.
    ///
    /// A verdict that does not arrive within `session.request_timeout_secs`
    /// fails with `Timeout`; the selector stays registered either way.
    pub async fn subscribe(&self, selector: &str) -> SessionResult<()> {
        match self.registry.add(selector).await? {
            Some(completion) => self.await_verdict(selector, completion).await,
            None => Ok(()),
        }
    }

    /// Deregister `selector` and, when connected, wait for the server's verdict
    pub async fn unsubscribe(&self, selector: &str) -> SessionResult<()> {
        match self.registry.remove(selector).await? {
            Some(completion) => self.await_verdict(selector, completion).await,
            None => Ok(()),
        }
    }

    async fn await_verdict(&self, selector: &str, completion: Completion) -> SessionResult<()> {
        let timeout = self
            .active
            .lock()
            .await
            .as_ref()
            .map_or(Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS), |active| {
                active.request_timeout
            });

        tokio::time::timeout(timeout, completion.wait())
            .await
            .map_err(|_| {
                warn!(selector, timeout_secs = timeout.as_secs(), "No acknowledgment from server");
                SessionError::Timeout(format!(
                    "no acknowledgment for '{selector}' within {}s",
                    timeout.as_secs()
                ))
            })?
    }

    /// Diagnostic round-trip against the connected server
    pub async fn test_connection(&self) -> SessionResult<Duration> {
        let state = self.state();
        if !state.as_ref().is_some_and(SessionState::is_connected) {
            return Err(SessionError::NotConnected { state });
        }

        let session = self
            .session()
            .await
            .ok_or(SessionError::NotConnected { state: None })?;
        let latency = session.round_trip().await?;
        info!(latency_ms = latency.as_millis() as u64, "Connection test succeeded");
        Ok(latency)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(active) = self.active.get_mut().take() {
            active.strategy.must_close();
            active.supervisor.abort();
        }
    }
}

/// Consume transport events until the session closes
async fn supervise(
    mut events: mpsc::Receiver<SessionEvent>,
    session: Arc<dyn Session>,
    registry: SubscriptionRegistry,
    state_tx: Arc<watch::Sender<Option<SessionState>>>,
    messages_tx: broadcast::Sender<ReceivedMessage>,
) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Message(message) => {
                // No receivers is not an error
                let _ = messages_tx.send(message);
            }
            SessionEvent::Recovering { reason } => {
                warn!(reason = %reason, "Session connectivity lost");
                registry.detach().await;
                apply_transition(&state_tx, Transition::ConnectionLost);
            }
            SessionEvent::Reconnected => {
                let recovering = matches!(*state_tx.borrow(), Some(SessionState::Recovering));
                if !recovering {
                    debug!("Ignoring reconnect outside recovery");
                    continue;
                }
                registry.replay_all(session.clone()).await;
                apply_transition(&state_tx, Transition::Reconnected);
            }
            SessionEvent::Closed(reason) => {
                registry.detach().await;
                apply_transition(&state_tx, Transition::Closed(reason));
                break;
            }
        }
    }
    debug!(url = %session.url(), "Session supervisor stopped");
}

/// Apply `transition` to the published state; invalid transitions are
/// logged and ignored. Returns whether the state changed.
fn apply_transition(
    state_tx: &watch::Sender<Option<SessionState>>,
    transition: Transition,
) -> bool {
    state_tx.send_if_modified(|current| {
        let Some(from) = current.clone() else {
            debug!(?transition, "Ignoring transition before first connect");
            return false;
        };

        match from.apply(transition.clone()) {
            Ok(next) if next == from => false,
            Ok(next) => {
                log_state_transition(&from, &next);
                *current = Some(next);
                true
            }
            Err(e) => {
                debug!(error = %e, "Ignoring invalid session transition");
                false
            }
        }
    })
}
