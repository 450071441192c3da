//! End-to-end reconnection behavior against the mock transport
//!
//! All tests run on a paused tokio clock, so backoff delays are observed
//! exactly: each attempt signal is stamped with the instant the strategy's
//! timer fired.


use resilient_session::testing::{AttemptSignal, MockSession};
use resilient_session::{CloseReason, SessionState};
use std::time::Duration;
use test_helpers::{
    mock_manager, test_config, test_config_with_max_attempts, wait_for_state, TEST_URL,
};
use tokio::time::Instant;

async fn next_start(session: &MockSession) -> Instant {
    match session.next_attempt_signal().await {
        Some(AttemptSignal::Start { at }) => at,
        other => panic!("expected attempt start, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_subscriptions_restored_after_failed_retries() {
    // Arrange: connected with two subscriptions
    let (transport, manager) = mock_manager();
    let mut state = manager.watch_state();
    manager.connect(TEST_URL, &test_config()).await.unwrap();
    manager.subscribe("A").await.unwrap();
    manager.subscribe("B").await.unwrap();

    let session = transport.latest_session().unwrap();
    session.clear_requests();

    // Act: lose the connection, fail three retries, succeed on the fourth
    let lost_at = Instant::now();
    session.simulate_connection_loss("connection reset").await;
    wait_for_state(&mut state, |s| *s == SessionState::Recovering).await;

    let mut starts = Vec::new();
    for _ in 0..3 {
        starts.push(next_start(&session).await);
        session.fail_reconnection();
    }
    starts.push(next_start(&session).await);
    session.complete_reconnection().await;
    wait_for_state(&mut state, SessionState::is_connected).await;

    // Assert: delays double from the base and stay under the ceiling
    let mut previous = lost_at;
    let delays: Vec<Duration> = starts
        .iter()
        .map(|at| {
            let delay = *at - previous;
            previous = *at;
            delay
        })
        .collect();
    assert_eq!(
        delays,
        vec![
            Duration::from_millis(100),
            Duration::from_millis(200),
            Duration::from_millis(400),
            Duration::from_millis(800),
        ]
    );

    // Exactly one subscribe per registered selector after recovery
    assert_eq!(session.subscribe_requests(), vec!["A", "B"]);
    assert_eq!(manager.reconnection_attempts().await, Some(0));
    assert_eq!(transport.opened(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_delays_stop_growing_at_ceiling() {
    let (transport, manager) = mock_manager();
    manager.connect(TEST_URL, &test_config()).await.unwrap();
    let session = transport.latest_session().unwrap();

    let mut previous = Instant::now();
    session.simulate_connection_loss("timeout").await;

    let mut delays = Vec::new();
    for _ in 0..7 {
        let at = next_start(&session).await;
        delays.push(at - previous);
        previous = at;
        session.fail_reconnection();
    }

    assert_eq!(delays[4], Duration::from_secs(1));
    assert_eq!(delays[5], Duration::from_secs(1));
    assert_eq!(delays[6], Duration::from_secs(1));
    assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
}

#[tokio::test(start_paused = true)]
async fn test_backoff_resets_after_successful_reconnection() {
    let (transport, manager) = mock_manager();
    let mut state = manager.watch_state();
    manager.connect(TEST_URL, &test_config()).await.unwrap();
    let session = transport.latest_session().unwrap();

    // First outage needs two retries
    session.simulate_connection_loss("first outage").await;
    next_start(&session).await;
    session.fail_reconnection();
    next_start(&session).await;
    session.complete_reconnection().await;
    wait_for_state(&mut state, SessionState::is_connected).await;

    // Second outage starts from the base delay again
    let lost_at = Instant::now();
    session.simulate_connection_loss("second outage").await;
    let at = next_start(&session).await;

    assert_eq!(at - lost_at, Duration::from_millis(100));
}

#[tokio::test(start_paused = true)]
async fn test_close_cancels_pending_retry() {
    // Arrange: connection lost, first retry scheduled
    let (transport, manager) = mock_manager();
    let mut state = manager.watch_state();
    manager.connect(TEST_URL, &test_config()).await.unwrap();
    let session = transport.latest_session().unwrap();

    session.simulate_connection_loss("network down").await;
    wait_for_state(&mut state, |s| *s == SessionState::Recovering).await;
    assert!(manager.has_pending_retry().await);

    // Act: close before the timer fires
    manager.close().await;
    tokio::time::sleep(Duration::from_secs(60)).await;

    // Assert: the timer never fired
    assert!(!manager.has_pending_retry().await);
    assert_eq!(session.try_attempt_signal(), None);
    assert_eq!(
        manager.state(),
        Some(SessionState::Closed(CloseReason::ClosedByClient))
    );
}

#[tokio::test(start_paused = true)]
async fn test_gives_up_after_max_attempts() {
    let (transport, manager) = mock_manager();
    let mut state = manager.watch_state();
    manager
        .connect(TEST_URL, &test_config_with_max_attempts(2))
        .await
        .unwrap();
    let session = transport.latest_session().unwrap();

    session.simulate_connection_loss("server gone").await;
    next_start(&session).await;
    session.fail_reconnection();
    next_start(&session).await;
    session.fail_reconnection();

    assert!(matches!(
        session.next_attempt_signal().await,
        Some(AttemptSignal::Abort { .. })
    ));
    wait_for_state(&mut state, |s| {
        *s == SessionState::Closed(CloseReason::ReconnectionAbandoned)
    })
    .await;
    assert!(!manager.registry().is_attached().await);

    // Nothing left scheduled after giving up
    assert!(!manager.has_pending_retry().await);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(session.try_attempt_signal(), None);

    // A closed session can be replaced by an explicit connect
    manager
        .connect(TEST_URL, &test_config_with_max_attempts(2))
        .await
        .unwrap();
    assert_eq!(transport.opened(), 2);
    assert_eq!(manager.state(), Some(SessionState::Connected));
}

#[tokio::test(start_paused = true)]
async fn test_selector_added_while_recovering_is_replayed() {
    let (transport, manager) = mock_manager();
    let mut state = manager.watch_state();
    manager.connect(TEST_URL, &test_config()).await.unwrap();
    manager.subscribe("A").await.unwrap();
    let session = transport.latest_session().unwrap();

    session.simulate_connection_loss("flaky link").await;
    wait_for_state(&mut state, |s| *s == SessionState::Recovering).await;

    // Registered now, issued on reconnect
    manager.subscribe("C").await.unwrap();
    manager.unsubscribe("A").await.unwrap();
    session.clear_requests();

    next_start(&session).await;
    session.complete_reconnection().await;
    wait_for_state(&mut state, SessionState::is_connected).await;

    assert_eq!(session.subscribe_requests(), vec!["C"]);
}

#[tokio::test(start_paused = true)]
async fn test_security_failure_during_recovery_stops_retries() {
    let (transport, manager) = mock_manager();
    let mut state = manager.watch_state();
    manager.connect(TEST_URL, &test_config()).await.unwrap();
    let session = transport.latest_session().unwrap();

    session.simulate_connection_loss("dropped").await;
    next_start(&session).await;
    session.simulate_security_failure("credentials revoked").await;

    wait_for_state(&mut state, |s| {
        matches!(s, SessionState::Closed(CloseReason::Security(_)))
    })
    .await;
    assert!(!manager.has_pending_retry().await);

    // Further transport requests are answered with an abort
    session.fail_reconnection();
    assert!(matches!(
        session.try_attempt_signal(),
        Some(AttemptSignal::Abort { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_message_receiver_survives_reconnection() {
    let (transport, manager) = mock_manager();
    let mut state = manager.watch_state();
    let mut messages = manager.messages();
    manager.connect(TEST_URL, &test_config()).await.unwrap();
    let session = transport.latest_session().unwrap();

    session.simulate_message("alerts/door", b"open").await;
    session.simulate_connection_loss("link down").await;
    next_start(&session).await;
    session.complete_reconnection().await;
    wait_for_state(&mut state, SessionState::is_connected).await;
    session.simulate_message("alerts/door", b"closed").await;

    assert_eq!(messages.recv().await.unwrap().payload, b"open");
    assert_eq!(messages.recv().await.unwrap().payload, b"closed");
}
