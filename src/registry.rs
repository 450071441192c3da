//! Subscription registry: the selectors a caller expects to be subscribed
//!
//! The registry outlives individual sessions. While a session is attached,
//! `add`/`remove` issue requests against it immediately; while detached they
//! only change membership and the next [`SubscriptionRegistry::replay_all`]
//! carries the result to the server.
//!
//! Every mutation and every replay runs under one async mutex held across
//! request issuance, so membership changes are linearizable with respect to
//! replay. Acknowledgments are awaited by callers outside the lock.

use crate::error::SessionError;
use crate::session::{Completion, Session};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Default)]
struct RegistryInner {
    selectors: BTreeSet<String>,
    session: Option<Arc<dyn Session>>,
}

/// Process-scoped set of topic selectors, shared across sessions
#[derive(Clone, Default)]
pub struct SubscriptionRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with `selectors`; nothing is issued until a
    /// session is replayed onto it
    pub fn with_selectors<I, S>(selectors: I) -> Result<Self, SessionError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = BTreeSet::new();
        for selector in selectors {
            let selector = selector.into();
            validate_selector(&selector)?;
            set.insert(selector);
        }

        Ok(Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                selectors: set,
                session: None,
            })),
        })
    }

    /// Register `selector`.
    ///
    /// Returns the pending server verdict when a subscribe was issued, or
    /// `None` when the selector was already registered or no session is
    /// attached. A failed issue leaves the selector registered; it is
    /// retried by the next replay.
    pub async fn add(&self, selector: &str) -> Result<Option<Completion>, SessionError> {
        validate_selector(selector)?;

        let mut inner = self.inner.lock().await;
        if !inner.selectors.insert(selector.to_string()) {
            debug!(selector, "Selector already registered");
            return Ok(None);
        }

        let Some(session) = inner.session.clone() else {
            debug!(selector, "Selector registered, subscribe deferred to next replay");
            return Ok(None);
        };

        match session.subscribe(selector).await {
            Ok(completion) => {
                debug!(selector, "Subscribe issued");
                Ok(Some(completion))
            }
            Err(e) => {
                warn!(selector, error = %e, "Failed to issue subscribe");
                Err(e)
            }
        }
    }

    /// Deregister `selector`.
    ///
    /// Returns the pending server verdict when an unsubscribe was issued.
    /// Removing an unknown selector is a no-op.
    pub async fn remove(&self, selector: &str) -> Result<Option<Completion>, SessionError> {
        let mut inner = self.inner.lock().await;
        if !inner.selectors.remove(selector) {
            debug!(selector, "Selector not registered, nothing to remove");
            return Ok(None);
        }

        let Some(session) = inner.session.clone() else {
            return Ok(None);
        };

        match session.unsubscribe(selector).await {
            Ok(completion) => {
                debug!(selector, "Unsubscribe issued");
                Ok(Some(completion))
            }
            Err(e) => {
                warn!(selector, error = %e, "Failed to issue unsubscribe");
                Err(e)
            }
        }
    }

    /// Attach `session` and issue a subscribe for every registered selector.
    ///
    /// Returns once every request has been issued; acknowledgments are
    /// watched in the background and rejections are logged per selector.
    /// Returns the number of subscribes issued.
    pub async fn replay_all(&self, session: Arc<dyn Session>) -> usize {
        let mut inner = self.inner.lock().await;
        inner.session = Some(session.clone());

        let mut issued = 0;
        for selector in &inner.selectors {
            match session.subscribe(selector).await {
                Ok(completion) => {
                    issued += 1;
                    let selector = selector.clone();
                    tokio::spawn(async move {
                        if let Err(e) = completion.wait().await {
                            log_replay_failure(&selector, &e);
                        }
                    });
                }
                Err(e) => log_replay_failure(selector, &e),
            }
        }

        info!(
            replayed = issued,
            registered = inner.selectors.len(),
            "Replayed subscriptions"
        );
        issued
    }

    /// Detach the current session; later mutations only change membership
    pub async fn detach(&self) {
        let mut inner = self.inner.lock().await;
        if inner.session.take().is_some() {
            debug!("Detached session from subscription registry");
        }
    }

    pub async fn contains(&self, selector: &str) -> bool {
        self.inner.lock().await.selectors.contains(selector)
    }

    /// Registered selectors in replay order
    pub async fn selectors(&self) -> Vec<String> {
        self.inner.lock().await.selectors.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.selectors.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.selectors.is_empty()
    }

    /// Whether a session is currently attached
    pub async fn is_attached(&self) -> bool {
        self.inner.lock().await.session.is_some()
    }
}

/// Transient failures are retried by the next replay; anything else needs
/// the caller's attention.
fn log_replay_failure(selector: &str, error: &SessionError) {
    if error.is_retryable() {
        debug!(selector, error = %error, "Replay interrupted, retrying on next connection");
    } else {
        warn!(selector, error = %error, "Replayed subscription not accepted");
    }
}

fn validate_selector(selector: &str) -> Result<(), SessionError> {
    if selector.trim().is_empty() {
        return Err(SessionError::InvalidSelector(selector.to_string()));
    }
    Ok(())
}
