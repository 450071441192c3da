//! Impure I/O operations for the MQTT transport
//!
//! [`MqttTransport`] opens [`MqttSession`]s. Each session owns one event-loop
//! driver task. When the loop reports a connection error the driver fails
//! every outstanding request and asks the injected [`ReconnectionStrategy`]
//! what to do. It then parks until the strategy starts or aborts the
//! attempt. Polling the rumqttc event loop again is the reconnect.

use super::connection::{classify_connection_error, configure_mqtt_options, ConnectionFailure};
use super::message_handler::{EventRoute, MessageHandler, PendingRequests, RequestKind};
use crate::config::SessionSection;
use crate::error::SessionError;
use crate::reconnect::{ReconnectionAttempt, ReconnectionStrategy};
use crate::session::{
    CloseReason, Completion, ReceivedMessage, Session, SessionEvent, SessionFactory,
    SessionState, Transition,
};
use async_trait::async_trait;
use rumqttc::v5::mqttbytes::v5::Packet;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, Event, EventLoop};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument};
use url::Url;

/// Capacity of the request channel between client handle and event loop
const REQUEST_CHANNEL_CAPACITY: usize = 10;
/// How long `close` waits for the driver to flush Disconnect
const DRIVER_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
const PING_PAYLOAD: &[u8] = b"ping";

/// Session factory speaking MQTT v5 over TCP, TLS, or websockets
#[derive(Debug, Clone, Copy, Default)]
pub struct MqttTransport;

impl MqttTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SessionFactory for MqttTransport {
    async fn open(
        &self,
        url: &Url,
        config: &SessionSection,
        strategy: Arc<dyn ReconnectionStrategy>,
        events: mpsc::Sender<SessionEvent>,
    ) -> Result<Arc<dyn Session>, SessionError> {
        let session: Arc<dyn Session> = MqttSession::open(url, config, strategy, events).await?;
        Ok(session)
    }
}

/// State shared between the session handle and its driver task
struct Shared {
    url: Url,
    client: AsyncClient,
    state: watch::Sender<SessionState>,
    pending: Mutex<PendingRequests>,
    // Serializes enqueue + hand-off so queue order matches packet order
    issue_lock: tokio::sync::Mutex<()>,
    closing: AtomicBool,
    request_timeout: Duration,
    diagnostic_topic: String,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, PendingRequests> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    fn current_state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Apply `transition`; returns whether the state changed
    fn transition(&self, transition: Transition) -> bool {
        self.state.send_if_modified(|current| match current.apply(transition) {
            Ok(next) if next != *current => {
                debug!(
                    target: "mqtt_transport",
                    from = ?current,
                    to = ?next,
                    "Session state changed"
                );
                *current = next;
                true
            }
            Ok(_) => false,
            Err(e) => {
                debug!(target: "mqtt_transport", error = %e, "Ignoring transition");
                false
            }
        })
    }

    /// Close for good and tell the manager why
    async fn finish(&self, reason: CloseReason, events: &mpsc::Sender<SessionEvent>) {
        self.pending().fail_all("session closed");
        if self.transition(Transition::Closed(reason.clone())) {
            let _ = events.send(SessionEvent::Closed(reason)).await;
        }
    }
}

/// An open MQTT session
pub struct MqttSession {
    shared: Arc<Shared>,
    strategy: Arc<dyn ReconnectionStrategy>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl MqttSession {
    /// Connect and wait for ConnAck, bounded by the establishment timeout.
    /// Failures here are final; the strategy is only consulted once the
    /// session has been established.
    pub async fn open(
        url: &Url,
        config: &SessionSection,
        strategy: Arc<dyn ReconnectionStrategy>,
        events: mpsc::Sender<SessionEvent>,
    ) -> Result<Arc<Self>, SessionError> {
        let mqtt_options = configure_mqtt_options(url, config)?;
        let (client, mut event_loop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);

        let timeout = config.establishment_timeout();
        tokio::time::timeout(timeout, establish_connection(&mut event_loop))
            .await
            .map_err(|_| {
                SessionError::establishment(format!(
                    "no ConnAck from {url} within {}s",
                    timeout.as_secs()
                ))
            })??;
        info!(url = %url, "MQTT session established");

        let (state, _) = watch::channel(SessionState::Connected);
        let shared = Arc::new(Shared {
            url: url.clone(),
            client,
            state,
            pending: Mutex::new(PendingRequests::new()),
            issue_lock: tokio::sync::Mutex::new(()),
            closing: AtomicBool::new(false),
            request_timeout: config.request_timeout(),
            diagnostic_topic: config.diagnostic_topic.clone(),
        });

        let driver = tokio::spawn(drive_event_loop(
            shared.clone(),
            event_loop,
            strategy.clone(),
            events,
        ));

        Ok(Arc::new(Self {
            shared,
            strategy,
            driver: Mutex::new(Some(driver)),
        }))
    }

    /// Enqueue and hand one request to the client
    async fn issue(&self, kind: RequestKind, topic: &str) -> Result<Completion, SessionError> {
        let _guard = self.shared.issue_lock.lock().await;

        let state = self.shared.current_state();
        if !state.can_issue_requests() {
            return Err(SessionError::NotConnected { state: Some(state) });
        }

        let (tx, completion) = Completion::channel();
        self.shared.pending().enqueue(kind, topic, tx);

        let client = &self.shared.client;
        let sent = match kind {
            RequestKind::Subscribe => client.subscribe(topic, QoS::AtLeastOnce).await,
            RequestKind::Unsubscribe => client.unsubscribe(topic).await,
            RequestKind::Ping => {
                client
                    .publish(topic, QoS::AtLeastOnce, false, PING_PAYLOAD.to_vec())
                    .await
            }
        };

        if let Err(e) = sent {
            self.shared.pending().discard_last(kind);
            return Err(SessionError::RequestFailed(Box::new(e)));
        }
        Ok(completion)
    }
}

#[async_trait]
impl Session for MqttSession {
    fn url(&self) -> &Url {
        &self.shared.url
    }

    fn state(&self) -> SessionState {
        self.shared.current_state()
    }

    async fn subscribe(&self, selector: &str) -> Result<Completion, SessionError> {
        self.issue(RequestKind::Subscribe, selector).await
    }

    async fn unsubscribe(&self, selector: &str) -> Result<Completion, SessionError> {
        self.issue(RequestKind::Unsubscribe, selector).await
    }

    async fn round_trip(&self) -> Result<Duration, SessionError> {
        let started = Instant::now();
        let completion = self
            .issue(RequestKind::Ping, &self.shared.diagnostic_topic)
            .await?;

        match tokio::time::timeout(self.shared.request_timeout, completion.wait()).await {
            Ok(result) => result.map(|()| started.elapsed()),
            Err(_) => Err(SessionError::Timeout(format!(
                "no PubAck on {} within {}s",
                self.shared.diagnostic_topic,
                self.shared.request_timeout.as_secs()
            ))),
        }
    }

    async fn close(&self) {
        if self.shared.closing.swap(true, Ordering::SeqCst) {
            return;
        }

        self.strategy.must_close();
        self.shared
            .transition(Transition::Closed(CloseReason::ClosedByClient));
        self.shared.pending().fail_all("session closed by client");

        if let Err(e) = self.shared.client.disconnect().await {
            debug!(target: "mqtt_transport", error = %e, "Disconnect request not delivered");
        }

        let handle = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut handle) = handle {
            match tokio::time::timeout(DRIVER_SHUTDOWN_GRACE, &mut handle).await {
                Ok(Ok(())) => info!(url = %self.shared.url, "MQTT session closed"),
                Ok(Err(e)) if !e.is_cancelled() => {
                    warn!("MQTT driver task ended with error: {}", e);
                }
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!("MQTT driver didn't shut down gracefully, forcing abort");
                    handle.abort();
                }
            }
        }
    }
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        let driver = self
            .driver
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = driver.take() {
            handle.abort();
        }
    }
}

/// Poll until the server acknowledges the connection
async fn establish_connection(event_loop: &mut EventLoop) -> Result<(), SessionError> {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
            Ok(notification) => {
                debug!(target: "mqtt_transport", ?notification, "Establishment phase notification");
            }
            Err(e) => {
                debug!(
                    target: "mqtt_transport",
                    error = %e,
                    "Connection error during establishment"
                );
                return Err(classify_connection_error(&e).into_establishment_error());
            }
        }
    }
}

enum AttemptCommand {
    Start,
    Abort,
}

/// Reconnection attempt handed to the strategy; fires at most once
struct ChannelAttempt {
    tx: Mutex<Option<oneshot::Sender<AttemptCommand>>>,
}

impl ChannelAttempt {
    fn fire(&self, command: AttemptCommand) {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(tx) = tx {
            let _ = tx.send(command);
        }
    }
}

impl ReconnectionAttempt for ChannelAttempt {
    fn start(&self) {
        self.fire(AttemptCommand::Start);
    }

    fn abort(&self) {
        self.fire(AttemptCommand::Abort);
    }
}

/// Ask the strategy for the next attempt and wait for its decision.
/// A dropped attempt (its timer was cancelled) counts as abort.
async fn request_attempt(strategy: &dyn ReconnectionStrategy) -> AttemptCommand {
    let (tx, rx) = oneshot::channel();
    strategy.perform_reconnection(Arc::new(ChannelAttempt {
        tx: Mutex::new(Some(tx)),
    }));
    rx.await.unwrap_or(AttemptCommand::Abort)
}

/// Main driver loop: route events, and on errors defer to the strategy
async fn drive_event_loop(
    shared: Arc<Shared>,
    mut event_loop: EventLoop,
    strategy: Arc<dyn ReconnectionStrategy>,
    events: mpsc::Sender<SessionEvent>,
) {
    loop {
        match event_loop.poll().await {
            Ok(event) => {
                if !handle_event(&shared, &event, strategy.as_ref(), &events).await {
                    break;
                }
            }
            Err(e) => {
                if shared.is_closing() {
                    debug!(
                        target: "mqtt_transport",
                        error = %e,
                        "Event loop stopped while closing"
                    );
                    break;
                }
                shared.pending().fail_all("connection lost");

                match classify_connection_error(&e) {
                    ConnectionFailure::Security(message) => {
                        error!(
                            url = %shared.url,
                            error = %message,
                            "Security failure, closing session"
                        );
                        strategy.must_close();
                        shared.finish(CloseReason::Security(message), &events).await;
                        break;
                    }
                    ConnectionFailure::Recoverable(message) => {
                        warn!(url = %shared.url, error = %message, "MQTT connection error");
                        if shared.transition(Transition::ConnectionLost) {
                            let _ = events
                                .send(SessionEvent::Recovering { reason: message })
                                .await;
                        }

                        let attempt = request_attempt(strategy.as_ref())
                            .instrument(crate::reconnect_span!(url = %shared.url));
                        match attempt.await {
                            AttemptCommand::Start => {
                                debug!(target: "mqtt_transport", "Reconnection attempt starting");
                            }
                            AttemptCommand::Abort => {
                                if !shared.is_closing() {
                                    shared
                                        .finish(CloseReason::ReconnectionAbandoned, &events)
                                        .await;
                                }
                                break;
                            }
                        }
                    }
                }
            }
        }
    }
    debug!(target: "mqtt_transport", url = %shared.url, "MQTT event loop stopped");
}

/// Process one routed event. Returns false to stop the driver.
async fn handle_event(
    shared: &Shared,
    event: &Event,
    strategy: &dyn ReconnectionStrategy,
    events: &mpsc::Sender<SessionEvent>,
) -> bool {
    match MessageHandler::route_mqtt_event(event) {
        EventRoute::ConnectionAcknowledged => {
            if shared.transition(Transition::Reconnected) {
                info!(url = %shared.url, "MQTT session reconnected");
                strategy.reconnection_succeeded();
                let _ = events.send(SessionEvent::Reconnected).await;
            }
            true
        }
        EventRoute::MessageReceived {
            topic,
            payload,
            retain,
        } => {
            debug!(
                target: "mqtt_transport",
                topic = %topic,
                bytes = payload.len(),
                retain,
                "Message received"
            );
            let message = ReceivedMessage {
                topic,
                payload,
                retain,
            };
            // The supervisor may be replaying subscriptions through this
            // driver; never block on it.
            if let Err(e) = events.try_send(SessionEvent::Message(message)) {
                warn!(url = %shared.url, error = %e, "Dropping received message");
            }
            true
        }
        EventRoute::RequestSent { kind, pkid } => {
            shared.pending().bind(kind, pkid);
            true
        }
        EventRoute::SubscriptionAcknowledged { pkid, rejection } => {
            if let Some(reason) = &rejection {
                warn!(pkid, reason = %reason, "Subscription rejected");
            }
            shared
                .pending()
                .resolve(RequestKind::Subscribe, pkid, rejection);
            true
        }
        EventRoute::UnsubscriptionAcknowledged { pkid } => {
            shared.pending().resolve(RequestKind::Unsubscribe, pkid, None);
            true
        }
        EventRoute::PublishAcknowledged { pkid } => {
            shared.pending().resolve(RequestKind::Ping, pkid, None);
            true
        }
        EventRoute::DisconnectReceived => {
            warn!(url = %shared.url, "Server sent Disconnect");
            true
        }
        EventRoute::DisconnectSent => !shared.is_closing(),
        EventRoute::InfrastructureEvent(description) => {
            debug!(target: "mqtt_transport", "MQTT event: {}", description);
            true
        }
    }
}
