//! Session lifecycle state machine
//!
//! `Connecting → Connected → Recovering → Connected | Closed`, with
//! `Connecting → Closed` on establishment failure and `Connected → Closed` on
//! explicit close or a security failure. Loss of connectivity always goes
//! through `Recovering`.

use thiserror::Error;
use tracing::{error, info, warn};

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed locally by the caller
    ClosedByClient,
    /// The initial connection never came up
    Establishment(String),
    /// Rejected on security grounds; retrying with the same credentials is pointless
    Security(String),
    /// The reconnection strategy gave up
    ReconnectionAbandoned,
}

/// Lifecycle state of one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Initial connection in progress
    Connecting,
    /// Connected, subscriptions replayed
    Connected,
    /// Connectivity lost, reconnection in progress
    Recovering,
    /// Terminal
    Closed(CloseReason),
}

/// Inputs that move the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Established,
    ConnectionLost,
    Reconnected,
    Closed(CloseReason),
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid session transition from {from:?} on {transition:?}")]
pub struct InvalidTransition {
    pub from: SessionState,
    pub transition: Transition,
}

impl SessionState {
    /// Compute the next state, rejecting transitions the lifecycle forbids
    pub fn apply(&self, transition: Transition) -> Result<SessionState, InvalidTransition> {
        use SessionState::*;

        let next = match (self, &transition) {
            (Connecting, Transition::Established) => Connected,
            (Connected, Transition::ConnectionLost) => Recovering,
            // A failed reconnect attempt keeps us recovering
            (Recovering, Transition::ConnectionLost) => Recovering,
            (Recovering, Transition::Reconnected) => Connected,
            (Connecting | Connected | Recovering, Transition::Closed(reason)) => {
                Closed(reason.clone())
            }
            _ => {
                return Err(InvalidTransition {
                    from: self.clone(),
                    transition: transition.clone(),
                });
            }
        };
        Ok(next)
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Connected)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, SessionState::Closed(_))
    }

    /// Subscribe/unsubscribe/ping may only be issued while connected
    pub fn can_issue_requests(&self) -> bool {
        self.is_connected()
    }
}

/// Log a state transition at a level matching its severity
pub fn log_state_transition(from: &SessionState, to: &SessionState) {
    match (from, to) {
        (SessionState::Connecting, SessionState::Connected) => {
            info!("Session established");
        }
        (SessionState::Connected, SessionState::Recovering) => {
            warn!("Session connectivity lost, recovering");
        }
        (SessionState::Recovering, SessionState::Connected) => {
            info!("Session recovered");
        }
        (_, SessionState::Closed(CloseReason::ClosedByClient)) => {
            info!("Session closed by client");
        }
        (_, SessionState::Closed(reason)) => {
            error!("Session closed: {:?}", reason);
        }
        _ => {
            info!("Session state: {:?} -> {:?}", from, to);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let state = SessionState::Connecting;
        let state = state.apply(Transition::Established).unwrap();
        assert_eq!(state, SessionState::Connected);

        let state = state.apply(Transition::ConnectionLost).unwrap();
        assert_eq!(state, SessionState::Recovering);

        let state = state.apply(Transition::ConnectionLost).unwrap();
        assert_eq!(state, SessionState::Recovering);

        let state = state.apply(Transition::Reconnected).unwrap();
        assert_eq!(state, SessionState::Connected);
    }

    #[test]
    fn test_establishment_failure_closes() {
        let reason = CloseReason::Establishment("dns".to_string());
        let state = SessionState::Connecting
            .apply(Transition::Closed(reason.clone()))
            .unwrap();
        assert_eq!(state, SessionState::Closed(reason));
    }

    #[test]
    fn test_give_up_while_recovering_closes() {
        let state = SessionState::Recovering
            .apply(Transition::Closed(CloseReason::ReconnectionAbandoned))
            .unwrap();
        assert!(state.is_closed());
    }

    #[test]
    fn test_reconnect_cannot_skip_recovering() {
        let result = SessionState::Connected.apply(Transition::Reconnected);
        assert!(result.is_err());

        let result = SessionState::Connecting.apply(Transition::ConnectionLost);
        assert!(result.is_err());
    }

    #[test]
    fn test_closed_is_terminal() {
        let closed = SessionState::Closed(CloseReason::ClosedByClient);
        for transition in [
            Transition::Established,
            Transition::ConnectionLost,
            Transition::Reconnected,
            Transition::Closed(CloseReason::ReconnectionAbandoned),
        ] {
            let err = closed.apply(transition.clone()).unwrap_err();
            assert_eq!(err.from, closed);
            assert_eq!(err.transition, transition);
        }
    }

    #[test]
    fn test_only_connected_can_issue_requests() {
        assert!(SessionState::Connected.can_issue_requests());
        assert!(!SessionState::Connecting.can_issue_requests());
        assert!(!SessionState::Recovering.can_issue_requests());
        assert!(!SessionState::Closed(CloseReason::ClosedByClient).can_issue_requests());
    }
}
