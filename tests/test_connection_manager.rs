//! Connection manager behavior through the public API
//!
//! Tests focus on what a caller observes: published state, requests reaching
//! the transport, and errors returned.


use resilient_session::testing::{MockFailure, MockRequest, MockTransport};
use resilient_session::{
    CloseReason, ConnectionManager, SessionError, SessionState, SubscriptionRegistry,
};
use std::sync::Arc;
use test_helpers::{mock_manager, test_config, wait_for_state, TEST_URL};

#[tokio::test]
async fn test_configured_selectors_subscribed_on_connect() {
    // Arrange: registry built from config selectors
    let mut config = test_config();
    config.subscriptions.selectors = vec![
        "sensors/+/temperature".to_string(),
        "alerts/#".to_string(),
    ];
    let registry = SubscriptionRegistry::with_selectors(config.subscriptions.selectors.clone())
        .unwrap();
    let transport = Arc::new(MockTransport::new());
    let manager = ConnectionManager::with_registry(transport.clone(), registry);

    // Act
    let session = manager.connect(TEST_URL, &config).await.unwrap();

    // Assert: every selector issued once, in registry order
    assert_eq!(session.url().as_str(), TEST_URL);
    assert_eq!(
        transport.latest_session().unwrap().subscribe_requests(),
        vec!["alerts/#", "sensors/+/temperature"]
    );
}

#[tokio::test]
async fn test_duplicate_subscribe_issues_single_request() {
    let (transport, manager) = mock_manager();
    manager.connect(TEST_URL, &test_config()).await.unwrap();

    manager.subscribe("a/b").await.unwrap();
    manager.subscribe("a/b").await.unwrap();

    assert_eq!(
        transport.latest_session().unwrap().subscribe_requests(),
        vec!["a/b"]
    );
    assert_eq!(manager.registry().len().await, 1);
}

#[tokio::test]
async fn test_empty_selector_rejected_without_request() {
    let (transport, manager) = mock_manager();
    manager.connect(TEST_URL, &test_config()).await.unwrap();

    let result = manager.subscribe("").await;

    assert!(matches!(result, Err(SessionError::InvalidSelector(_))));
    assert!(transport.latest_session().unwrap().requests().is_empty());
}

#[tokio::test]
async fn test_subscribe_before_connect_is_deferred() {
    let (transport, manager) = mock_manager();

    manager.subscribe("later").await.unwrap();
    assert_eq!(transport.opened(), 0);

    manager.connect(TEST_URL, &test_config()).await.unwrap();
    assert_eq!(
        transport.latest_session().unwrap().subscribe_requests(),
        vec!["later"]
    );
}

#[tokio::test]
async fn test_rejected_selector_stays_registered_and_is_replayed() {
    // Arrange
    let (transport, manager) = mock_manager();
    transport.reject_selector("restricted/#", "not authorized");
    manager.connect(TEST_URL, &test_config()).await.unwrap();

    // Act
    let result = manager.subscribe("restricted/#").await;

    // Assert: failure reported, membership kept for the next connection
    match result {
        Err(SessionError::Rejected { selector, .. }) => assert_eq!(selector, "restricted/#"),
        other => panic!("expected rejection, got {other:?}"),
    }
    assert!(manager.registry().contains("restricted/#").await);

    manager.close().await;
    manager.connect(TEST_URL, &test_config()).await.unwrap();
    assert_eq!(
        transport.latest_session().unwrap().subscribe_requests(),
        vec!["restricted/#"]
    );
}

#[tokio::test]
async fn test_test_connection_round_trips_when_connected() {
    let (transport, manager) = mock_manager();
    manager.connect(TEST_URL, &test_config()).await.unwrap();

    let latency = manager.test_connection().await.unwrap();

    assert!(latency.as_millis() > 0);
    assert_eq!(
        transport.latest_session().unwrap().requests(),
        vec![MockRequest::RoundTrip]
    );
}

#[tokio::test]
async fn test_establishment_failure_leaves_no_pending_retry() {
    let transport = Arc::new(MockTransport::with_failure(MockFailure::Establishment(
        "no route to host".to_string(),
    )));
    let manager = ConnectionManager::new(transport.clone());

    let result = manager.connect(TEST_URL, &test_config()).await;

    assert!(matches!(result, Err(SessionError::Establishment(_))));
    assert!(!manager.has_pending_retry().await);
    assert_eq!(manager.reconnection_attempts().await, None);
    assert_eq!(transport.opened(), 0);
}

#[tokio::test]
async fn test_closed_state_observed_by_watchers() {
    let (_transport, manager) = mock_manager();
    let mut state = manager.watch_state();
    manager.connect(TEST_URL, &test_config()).await.unwrap();

    manager.close().await;

    wait_for_state(&mut state, |s| {
        *s == SessionState::Closed(CloseReason::ClosedByClient)
    })
    .await;
    assert!(!manager.registry().is_attached().await);
}

#[tokio::test]
async fn test_connect_rejects_unparseable_url() {
    let (transport, manager) = mock_manager();

    let result = manager.connect("://missing-scheme", &test_config()).await;

    assert!(matches!(result, Err(SessionError::InvalidUrl(_))));
    assert_eq!(transport.opened(), 0);
}
