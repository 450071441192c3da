//! Reconnection strategy consulted by the session transport
//!
//! The transport calls [`ReconnectionStrategy::perform_reconnection`] every
//! time a reconnect is needed, possibly from one of its own tasks. The
//! strategy answers by scheduling [`ReconnectionAttempt::start`] after a
//! backoff delay, or by calling [`ReconnectionAttempt::abort`] to give up.

use super::backoff::BackoffPolicy;
use crate::config::ReconnectSection;
use crate::error::SessionError;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Transport-provided handle for one reconnection attempt
pub trait ReconnectionAttempt: Send + Sync {
    /// Begin the transport-level reconnect now.
    ///
    /// Called with the strategy's state locked, so it must not call back
    /// into the strategy.
    fn start(&self);

    /// Abandon reconnection; the transport closes the session
    fn abort(&self);
}

/// Contract between a session transport and its reconnection policy.
///
/// Implementations never fail outward: every problem becomes a decision to
/// abort the attempt.
pub trait ReconnectionStrategy: Send + Sync {
    /// Connectivity was lost (or a reconnect just failed); decide what to do
    fn perform_reconnection(&self, attempt: Arc<dyn ReconnectionAttempt>);

    /// The transport re-established the connection
    fn reconnection_succeeded(&self);

    /// The session is closing for good; stop retrying
    fn must_close(&self);
}

/// Decision produced once per disconnect event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectionOutcome {
    /// Retry after the given delay
    Retry(Duration),
    /// Stop retrying
    GiveUp,
}

#[derive(Debug, Default)]
struct StrategyState {
    attempt: u32,
    pending: Option<JoinHandle<()>>,
    closed: bool,
}

impl StrategyState {
    fn cancel_pending(&mut self) -> bool {
        match self.pending.take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }
}

/// Backoff-driven strategy owning one attempt counter and at most one timer
#[derive(Debug)]
pub struct BackoffReconnectionStrategy {
    policy: BackoffPolicy,
    max_attempts: Option<u32>,
    state: Arc<Mutex<StrategyState>>,
}

impl BackoffReconnectionStrategy {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            max_attempts: None,
            state: Arc::new(Mutex::new(StrategyState::default())),
        }
    }

    /// Give up after `max_attempts` consecutive retries (None = unlimited)
    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Build from the `[reconnect]` config section
    pub fn from_config(config: &ReconnectSection) -> Result<Self, SessionError> {
        Ok(Self::new(BackoffPolicy::from_config(config)?).with_max_attempts(config.max_attempts))
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Retries decided since the last successful connection
    pub fn attempts(&self) -> u32 {
        self.lock().attempt
    }

    /// Whether a retry timer is scheduled and has not fired yet
    pub fn has_pending_retry(&self) -> bool {
        self.lock()
            .pending
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Whether the strategy stopped retrying for good
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Consume one retry decision without scheduling anything
    pub fn decide(&self) -> ReconnectionOutcome {
        let mut state = self.lock();
        self.next_outcome(&mut state)
    }

    fn lock(&self) -> MutexGuard<'_, StrategyState> {
        lock_state(&self.state)
    }

    fn next_outcome(&self, state: &mut StrategyState) -> ReconnectionOutcome {
        if state.closed {
            return ReconnectionOutcome::GiveUp;
        }

        if let Some(max_attempts) = self.max_attempts {
            if state.attempt >= max_attempts {
                return ReconnectionOutcome::GiveUp;
            }
        }

        let delay = self.policy.next_delay(state.attempt);
        state.attempt = state.attempt.saturating_add(1);
        ReconnectionOutcome::Retry(delay)
    }
}

// Poisoning only means a holder panicked; the counter is still coherent.
fn lock_state(state: &Mutex<StrategyState>) -> MutexGuard<'_, StrategyState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ReconnectionStrategy for BackoffReconnectionStrategy {
    fn perform_reconnection(&self, attempt: Arc<dyn ReconnectionAttempt>) {
        let mut state = self.lock();
        if state.cancel_pending() {
            debug!("Cancelled superseded reconnection timer");
        }

        match self.next_outcome(&mut state) {
            ReconnectionOutcome::Retry(delay) => {
                let runtime = match tokio::runtime::Handle::try_current() {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        state.closed = true;
                        drop(state);
                        warn!(
                            error = %e,
                            "Cannot schedule reconnection without a runtime, giving up"
                        );
                        attempt.abort();
                        return;
                    }
                };

                let max_display = self
                    .max_attempts
                    .map_or("∞".to_string(), |max| max.to_string());
                info!(
                    "Scheduling reconnection attempt {}/{} after {}ms",
                    state.attempt,
                    max_display,
                    delay.as_millis()
                );

                let shared = Arc::clone(&self.state);
                state.pending = Some(runtime.spawn(async move {
                    tokio::time::sleep(delay).await;
                    // Started under the lock so must_close() cannot interleave
                    let state = lock_state(&shared);
                    if state.closed {
                        debug!("Strategy closed before the timer fired, dropping attempt");
                        return;
                    }
                    attempt.start();
                }));
            }
            ReconnectionOutcome::GiveUp => {
                let attempts = state.attempt;
                let closed = state.closed;
                state.closed = true;
                drop(state);

                if closed {
                    info!("Reconnection requested after close, aborting attempt");
                } else {
                    warn!(attempts, "Reconnection attempts exhausted, giving up");
                }
                attempt.abort();
            }
        }
    }

    fn reconnection_succeeded(&self) {
        let mut state = self.lock();
        state.cancel_pending();
        if state.attempt > 0 {
            info!(
                attempts = state.attempt,
                "Reconnection succeeded, resetting backoff"
            );
        }
        state.attempt = 0;
    }

    fn must_close(&self) {
        let mut state = self.lock();
        if state.cancel_pending() {
            info!("Cancelled pending reconnection timer on close");
        }
        state.closed = true;
    }
}

impl Drop for BackoffReconnectionStrategy {
    fn drop(&mut self) {
        self.lock().cancel_pending();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingAttempt {
        starts: AtomicUsize,
        aborts: AtomicUsize,
    }

    impl ReconnectionAttempt for CountingAttempt {
        fn start(&self) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn abort(&self) {
            self.aborts.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn strategy(max_attempts: Option<u32>) -> BackoffReconnectionStrategy {
        let policy =
            BackoffPolicy::new(Duration::from_millis(100), Duration::from_millis(1000)).unwrap();
        BackoffReconnectionStrategy::new(policy).with_max_attempts(max_attempts)
    }

    #[test]
    fn test_decide_walks_the_backoff_curve() {
        let strategy = strategy(None);

        assert_eq!(
            strategy.decide(),
            ReconnectionOutcome::Retry(Duration::from_millis(100))
        );
        assert_eq!(
            strategy.decide(),
            ReconnectionOutcome::Retry(Duration::from_millis(200))
        );
        assert_eq!(
            strategy.decide(),
            ReconnectionOutcome::Retry(Duration::from_millis(400))
        );
        assert_eq!(strategy.attempts(), 3);
    }

    #[test]
    fn test_success_resets_counter() {
        let strategy = strategy(None);
        strategy.decide();
        strategy.decide();

        strategy.reconnection_succeeded();

        assert_eq!(strategy.attempts(), 0);
        assert_eq!(
            strategy.decide(),
            ReconnectionOutcome::Retry(Duration::from_millis(100))
        );
    }

    #[test]
    fn test_max_attempts_gives_up() {
        let strategy = strategy(Some(2));
        assert!(matches!(strategy.decide(), ReconnectionOutcome::Retry(_)));
        assert!(matches!(strategy.decide(), ReconnectionOutcome::Retry(_)));
        assert_eq!(strategy.decide(), ReconnectionOutcome::GiveUp);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_at_ceiling_aborts_without_timer() {
        let strategy = strategy(Some(1));
        let first = Arc::new(CountingAttempt::default());
        strategy.perform_reconnection(first.clone());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(first.starts.load(Ordering::SeqCst), 1);

        let last = Arc::new(CountingAttempt::default());
        strategy.perform_reconnection(last.clone());

        assert_eq!(last.aborts.load(Ordering::SeqCst), 1);
        assert_eq!(last.starts.load(Ordering::SeqCst), 0);
        assert!(!strategy.has_pending_retry());
        assert!(strategy.is_closed());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(last.starts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_no_start_after_must_close_returns() {
        for _ in 0..200 {
            let policy =
                BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(1)).unwrap();
            let strategy = BackoffReconnectionStrategy::new(policy);
            let attempt = Arc::new(CountingAttempt::default());

            strategy.perform_reconnection(attempt.clone());
            tokio::time::sleep(Duration::from_millis(1)).await;
            strategy.must_close();
            let starts_at_close = attempt.starts.load(Ordering::SeqCst);

            tokio::time::sleep(Duration::from_millis(3)).await;
            assert_eq!(attempt.starts.load(Ordering::SeqCst), starts_at_close);
        }
    }

    #[test]
    fn test_closed_strategy_gives_up() {
        let strategy = strategy(None);
        strategy.must_close();
        assert!(strategy.is_closed());
        assert_eq!(strategy.decide(), ReconnectionOutcome::GiveUp);
    }

    #[test]
    fn test_no_runtime_surfaces_as_abort() {
        let strategy = strategy(None);
        let attempt = Arc::new(CountingAttempt::default());

        strategy.perform_reconnection(attempt.clone());

        assert_eq!(attempt.aborts.load(Ordering::SeqCst), 1);
        assert_eq!(attempt.starts.load(Ordering::SeqCst), 0);
        assert!(strategy.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_fires_after_delay() {
        let strategy = strategy(None);
        let attempt = Arc::new(CountingAttempt::default());

        strategy.perform_reconnection(attempt.clone());
        assert!(strategy.has_pending_retry());

        tokio::time::sleep(Duration::from_millis(99)).await;
        assert_eq!(attempt.starts.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(attempt.starts.load(Ordering::SeqCst), 1);
        assert!(!strategy.has_pending_retry());
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_attempt_cancels_prior_timer() {
        let strategy = strategy(None);
        let first = Arc::new(CountingAttempt::default());
        let second = Arc::new(CountingAttempt::default());

        strategy.perform_reconnection(first.clone());
        strategy.perform_reconnection(second.clone());

        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(first.starts.load(Ordering::SeqCst), 0);
        assert_eq!(second.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_must_close_cancels_pending_timer() {
        let strategy = strategy(None);
        let attempt = Arc::new(CountingAttempt::default());

        strategy.perform_reconnection(attempt.clone());
        strategy.must_close();
        assert!(!strategy.has_pending_retry());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(attempt.starts.load(Ordering::SeqCst), 0);

        // Anything after close is aborted immediately
        let late = Arc::new(CountingAttempt::default());
        strategy.perform_reconnection(late.clone());
        assert_eq!(late.aborts.load(Ordering::SeqCst), 1);
    }
}
