//! Mock transport for testing
//!
//! [`MockTransport`] opens [`MockSession`]s that record every request and let
//! a test script the transport side of the reconnection contract: lose the
//! connection, fail reconnect attempts, complete them, or close on a security
//! error. Reconnection attempts handed to the strategy report back through
//! [`AttemptSignal`]s stamped with the tokio clock, so tests running on a
//! paused clock can assert exact backoff delays.

use crate::config::SessionSection;
use crate::error::SessionError;
use crate::reconnect::{ReconnectionAttempt, ReconnectionStrategy};
use crate::session::{
    CloseReason, Completion, CompletionSender, ReceivedMessage, Session, SessionEvent,
    SessionFactory, SessionState,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use url::Url;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A request issued against a mock session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockRequest {
    Subscribe(String),
    Unsubscribe(String),
    RoundTrip,
}

/// What the strategy did with a reconnection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptSignal {
    Start { at: Instant },
    Abort { at: Instant },
}

/// How the next `open` should fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockFailure {
    Establishment(String),
    Security(String),
}

struct MockAttempt {
    signals: mpsc::UnboundedSender<AttemptSignal>,
    session: Weak<MockSession>,
}

impl ReconnectionAttempt for MockAttempt {
    fn start(&self) {
        let _ = self.signals.send(AttemptSignal::Start { at: Instant::now() });
    }

    fn abort(&self) {
        let _ = self.signals.send(AttemptSignal::Abort { at: Instant::now() });
        if let Some(session) = self.session.upgrade() {
            session.close_with(CloseReason::ReconnectionAbandoned);
        }
    }
}

/// Scriptable session recording every request
pub struct MockSession {
    url: Url,
    state: Mutex<SessionState>,
    requests: Mutex<Vec<MockRequest>>,
    rejections: Mutex<HashMap<String, String>>,
    withheld: Mutex<Option<Vec<CompletionSender>>>,
    strategy: Option<Arc<dyn ReconnectionStrategy>>,
    events: Option<mpsc::Sender<SessionEvent>>,
    signals_tx: mpsc::UnboundedSender<AttemptSignal>,
    signals_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<AttemptSignal>>,
    close_calls: AtomicUsize,
    this: Weak<MockSession>,
}

impl MockSession {
    /// A connected session with no transport wiring, for registry tests
    pub fn connected(url: &str) -> Arc<Self> {
        let url = Url::parse(url).unwrap_or_else(|e| panic!("invalid mock URL {url}: {e}"));
        Self::build(url, None, None, HashMap::new())
    }

    fn build(
        url: Url,
        strategy: Option<Arc<dyn ReconnectionStrategy>>,
        events: Option<mpsc::Sender<SessionEvent>>,
        rejections: HashMap<String, String>,
    ) -> Arc<Self> {
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        Arc::new_cyclic(|this| MockSession {
            url,
            state: Mutex::new(SessionState::Connected),
            requests: Mutex::new(Vec::new()),
            rejections: Mutex::new(rejections),
            withheld: Mutex::new(None),
            strategy,
            events,
            signals_tx,
            signals_rx: tokio::sync::Mutex::new(signals_rx),
            close_calls: AtomicUsize::new(0),
            this: this.clone(),
        })
    }

    pub fn requests(&self) -> Vec<MockRequest> {
        lock(&self.requests).clone()
    }

    /// Selectors of every subscribe request, in issue order
    pub fn subscribe_requests(&self) -> Vec<String> {
        lock(&self.requests)
            .iter()
            .filter_map(|request| match request {
                MockRequest::Subscribe(selector) => Some(selector.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn clear_requests(&self) {
        lock(&self.requests).clear();
    }

    /// Make the server reject subscriptions to `selector`
    pub fn reject_selector(&self, selector: &str, reason: &str) {
        lock(&self.rejections).insert(selector.to_string(), reason.to_string());
    }

    /// Never acknowledge subscribe/unsubscribe requests from now on
    pub fn withhold_acknowledgments(&self) {
        lock(&self.withheld).get_or_insert_with(Vec::new);
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    /// Drop connectivity: report `Recovering` and consult the strategy
    pub async fn simulate_connection_loss(&self, reason: &str) {
        *lock(&self.state) = SessionState::Recovering;
        self.emit(SessionEvent::Recovering {
            reason: reason.to_string(),
        })
        .await;
        self.request_reconnection();
    }

    /// The last started reconnect failed; consult the strategy again
    pub fn fail_reconnection(&self) {
        self.request_reconnection();
    }

    /// The last started reconnect succeeded
    pub async fn complete_reconnection(&self) {
        *lock(&self.state) = SessionState::Connected;
        if let Some(strategy) = &self.strategy {
            strategy.reconnection_succeeded();
        }
        self.emit(SessionEvent::Reconnected).await;
    }

    /// Deliver a value on `topic` as the server would
    pub async fn simulate_message(&self, topic: &str, payload: &[u8]) {
        self.emit(SessionEvent::Message(ReceivedMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            retain: false,
        }))
        .await;
    }

    /// Close the session on a non-retryable security error
    pub async fn simulate_security_failure(&self, message: &str) {
        let reason = CloseReason::Security(message.to_string());
        *lock(&self.state) = SessionState::Closed(reason.clone());
        if let Some(strategy) = &self.strategy {
            strategy.must_close();
        }
        self.emit(SessionEvent::Closed(reason)).await;
    }

    /// Wait for the strategy to start or abort an attempt
    pub async fn next_attempt_signal(&self) -> Option<AttemptSignal> {
        self.signals_rx.lock().await.recv().await
    }

    /// Attempt signal already delivered, if any
    pub fn try_attempt_signal(&self) -> Option<AttemptSignal> {
        self.signals_rx.try_lock().ok()?.try_recv().ok()
    }

    fn request_reconnection(&self) {
        let Some(strategy) = &self.strategy else {
            return;
        };
        strategy.perform_reconnection(Arc::new(MockAttempt {
            signals: self.signals_tx.clone(),
            session: self.this.clone(),
        }));
    }

    fn close_with(&self, reason: CloseReason) {
        {
            let mut state = lock(&self.state);
            if state.is_closed() {
                return;
            }
            *state = SessionState::Closed(reason.clone());
        }
        if let Some(events) = &self.events {
            let _ = events.try_send(SessionEvent::Closed(reason));
        }
    }

    async fn emit(&self, event: SessionEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event).await;
        }
    }

    /// Acknowledge with `result`, unless acknowledgments are withheld
    fn acknowledge(&self, result: Result<(), SessionError>) -> Completion {
        match lock(&self.withheld).as_mut() {
            Some(withheld) => {
                let (tx, completion) = Completion::channel();
                withheld.push(tx);
                completion
            }
            None => Completion::ready(result),
        }
    }

    fn issue(&self, request: MockRequest) -> Result<(), SessionError> {
        let state = lock(&self.state).clone();
        if !state.can_issue_requests() {
            return Err(SessionError::disconnected(format!(
                "mock session is {state:?}"
            )));
        }
        lock(&self.requests).push(request);
        Ok(())
    }
}

#[async_trait]
impl Session for MockSession {
    fn url(&self) -> &Url {
        &self.url
    }

    fn state(&self) -> SessionState {
        lock(&self.state).clone()
    }

    async fn subscribe(&self, selector: &str) -> Result<Completion, SessionError> {
        self.issue(MockRequest::Subscribe(selector.to_string()))?;

        let rejection = lock(&self.rejections).get(selector).cloned();
        Ok(match rejection {
            Some(reason) => self.acknowledge(Err(SessionError::rejected(selector, reason))),
            None => self.acknowledge(Ok(())),
        })
    }

    async fn unsubscribe(&self, selector: &str) -> Result<Completion, SessionError> {
        self.issue(MockRequest::Unsubscribe(selector.to_string()))?;
        Ok(self.acknowledge(Ok(())))
    }

    async fn round_trip(&self) -> Result<Duration, SessionError> {
        self.issue(MockRequest::RoundTrip)?;
        Ok(Duration::from_millis(1))
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut state = lock(&self.state);
            if state.is_closed() {
                return;
            }
            *state = SessionState::Closed(CloseReason::ClosedByClient);
        }
        if let Some(strategy) = &self.strategy {
            strategy.must_close();
        }
    }
}

/// Session factory handing out [`MockSession`]s
#[derive(Default)]
pub struct MockTransport {
    next_failure: Mutex<Option<MockFailure>>,
    rejections: Mutex<HashMap<String, String>>,
    withhold_acknowledgments: AtomicBool,
    sessions: Mutex<Vec<Arc<MockSession>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport whose first `open` fails with `failure`
    pub fn with_failure(failure: MockFailure) -> Self {
        let transport = Self::default();
        transport.fail_next_open(failure);
        transport
    }

    /// Make the next `open` fail
    pub fn fail_next_open(&self, failure: MockFailure) {
        *lock(&self.next_failure) = Some(failure);
    }

    /// Reject subscriptions to `selector` on every session opened afterwards
    pub fn reject_selector(&self, selector: &str, reason: &str) {
        lock(&self.rejections).insert(selector.to_string(), reason.to_string());
    }

    /// Sessions opened afterwards never acknowledge subscribe/unsubscribe
    pub fn withhold_acknowledgments(&self) {
        self.withhold_acknowledgments.store(true, Ordering::SeqCst);
    }

    /// Number of sessions successfully opened
    pub fn opened(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn latest_session(&self) -> Option<Arc<MockSession>> {
        lock(&self.sessions).last().cloned()
    }
}

#[async_trait]
impl SessionFactory for MockTransport {
    async fn open(
        &self,
        url: &Url,
        _config: &SessionSection,
        strategy: Arc<dyn ReconnectionStrategy>,
        events: mpsc::Sender<SessionEvent>,
    ) -> Result<Arc<dyn Session>, SessionError> {
        if let Some(failure) = lock(&self.next_failure).take() {
            return Err(match failure {
                MockFailure::Establishment(message) => SessionError::Establishment(message),
                MockFailure::Security(message) => SessionError::Security(message),
            });
        }

        let rejections = lock(&self.rejections).clone();
        let session = MockSession::build(url.clone(), Some(strategy), Some(events), rejections);
        if self.withhold_acknowledgments.load(Ordering::SeqCst) {
            session.withhold_acknowledgments();
        }
        lock(&self.sessions).push(session.clone());
        let session: Arc<dyn Session> = session;
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_session_records_requests() {
        let session = MockSession::connected("mqtt://localhost:1883");

        session.subscribe("a").await.unwrap();
        session.unsubscribe("a").await.unwrap();
        session.round_trip().await.unwrap();

        assert_eq!(
            session.requests(),
            vec![
                MockRequest::Subscribe("a".to_string()),
                MockRequest::Unsubscribe("a".to_string()),
                MockRequest::RoundTrip,
            ]
        );
    }

    #[tokio::test]
    async fn test_closed_mock_session_refuses_requests() {
        let session = MockSession::connected("mqtt://localhost:1883");
        session.close().await;
        session.close().await;

        assert_eq!(session.close_calls(), 2);
        assert!(session.subscribe("a").await.is_err());
        assert!(session.requests().is_empty());
    }
}
