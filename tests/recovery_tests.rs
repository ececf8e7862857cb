//! Recovery flows through the full gateway: retries after network drops,
//! resubscription on reconnect, and the consumer-count lifecycle.

mod support;

use std::time::Duration;

use serde_json::json;

use iobridge::core::domain::ConnectionState;
use iobridge::testkit::{MockEndpoint, StaticTokens};
use support::{authed_endpoint_config, endpoint_config, fast_config, gateway, settle, Recorder};

#[tokio::test]
async fn test_network_drop_retries_and_resubscribes() {
    let server = MockEndpoint::new();
    server.set_state("other.x", json!({"val": 1, "ack": true, "ts": 1}));
    let gw = gateway(&server);
    let wildcard = Recorder::new();
    let plain = Recorder::new();

    gw.subscribe("n1", endpoint_config(), "sys.*", wildcard.hooks(false)).await.unwrap();
    gw.subscribe("n2", endpoint_config(), "other.x", plain.hooks(true)).await.unwrap();
    settle().await;
    assert_eq!(server.connect_count(), 1);
    let initial_count_before = plain.count_of("initial:other.x");

    server.drop_connection();
    // base 40ms + jitter 20ms, plus the reconnect handshake
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert!(server.connect_count() >= 2, "reconnected after the drop");

    // every pattern was reissued exactly once on the new socket
    let resubscribed = server.subscribed_patterns();
    assert_eq!(resubscribed.iter().filter(|p| *p == "sys.*").count(), 2);
    assert_eq!(resubscribed.iter().filter(|p| *p == "other.x").count(), 2);

    // consumers observed the outage and the recovery, in that order
    let retrying = wildcard.position("status:retrying").expect("retrying delivered");
    let ready_again = wildcard
        .snapshot()
        .iter()
        .rposition(|e| e == "status:ready")
        .expect("ready delivered again");
    assert!(retrying < ready_again, "{:?}", wildcard.snapshot());

    // the non-wildcard consumer got a refreshed initial value
    assert!(plain.count_of("initial:other.x") > initial_count_before, "{:?}", plain.snapshot());

    // and events flow again
    server.push_state_change("sys.a", json!({"val": 2, "ack": true, "ts": 2}));
    settle().await;
    assert_eq!(wildcard.count_of("value:sys.a"), 1);
}

#[tokio::test]
async fn test_last_consumer_cancels_retry_and_releases_endpoint() {
    let server = MockEndpoint::new();
    let mut config = fast_config();
    // park the retry far enough out that the unsubscribe wins the race
    config.retry.retry_base_ms = 300;
    config.retry.retry_jitter_ms = 0;
    let gw = iobridge::app::Gateway::with_connector(
        config,
        std::sync::Arc::new(StaticTokens::unused()),
        std::sync::Arc::new(server.clone()),
    )
    .unwrap();
    let recorder = Recorder::new();

    gw.subscribe("n1", endpoint_config(), "sys.x", recorder.hooks(false)).await.unwrap();
    let key = gw.configure_endpoint(endpoint_config());
    settle().await;

    server.drop_connection();
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(gw.get_connection_status(&key).status, ConnectionState::RetryScheduled);

    gw.unsubscribe("n1").await;
    // sleep past where the retry would have fired
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(gw.get_connection_status(&key).status, ConnectionState::Idle);
    assert_eq!(server.connect_count(), 1, "no reconnect after the last consumer left");
}

#[tokio::test]
async fn test_hard_auth_failure_reaches_consumers_and_stops_retries() {
    let server = MockEndpoint::new();
    let tokens = std::sync::Arc::new(StaticTokens::rejecting(400, r#"{"message":"invalid_grant"}"#));
    let gw = iobridge::app::Gateway::with_connector(
        fast_config(),
        tokens.clone(),
        std::sync::Arc::new(server.clone()),
    )
    .unwrap();
    let recorder = Recorder::new();

    let result = gw
        .subscribe("n1", authed_endpoint_config(), "sys.x", recorder.hooks(false))
        .await;
    assert!(result.is_err(), "hard auth failures surface to the caller");
    settle().await;

    let key = gw.configure_endpoint(authed_endpoint_config());
    assert_eq!(gw.get_connection_status(&key).status, ConnectionState::AuthFailed);
    assert!(
        recorder.position("status:failed_permanently").is_some(),
        "{:?}",
        recorder.snapshot()
    );

    // no retry loop keeps hitting the credentials
    let fetches = tokens.fetch_count();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(tokens.fetch_count(), fetches);
}

#[tokio::test]
async fn test_subscription_parked_while_down_replays_on_ready() {
    let server = MockEndpoint::new();
    server.fail_next_connects(&["connection refused"]);
    let gw = gateway(&server);
    let recorder = Recorder::new();

    // the connect fails, but the subscription is accepted and parked
    gw.subscribe("n1", endpoint_config(), "sys.x", recorder.hooks(false)).await.unwrap();
    assert!(server.subscribed_patterns().is_empty());

    // the retry brings the endpoint up and replays the parked subscribe
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(server.subscribed_patterns(), vec!["sys.x".to_string()]);
    assert!(recorder.position("subscribed").is_some(), "{:?}", recorder.snapshot());

    server.push_state_change("sys.x", json!({"val": 3, "ack": true, "ts": 1}));
    settle().await;
    assert_eq!(recorder.count_of("value:sys.x"), 1);
}

#[tokio::test]
async fn test_retry_window_respects_base_and_jitter() {
    let server = MockEndpoint::new();
    server.fail_next_connects(&["connection refused"]);
    let mut config = fast_config();
    config.retry.retry_base_ms = 100;
    config.retry.retry_jitter_ms = 50;
    let gw = iobridge::app::Gateway::with_connector(
        config,
        std::sync::Arc::new(StaticTokens::unused()),
        std::sync::Arc::new(server.clone()),
    )
    .unwrap();
    let recorder = Recorder::new();

    let started = std::time::Instant::now();
    gw.subscribe("n1", endpoint_config(), "sys.x", recorder.hooks(false)).await.unwrap();

    // well inside the base delay: no second attempt yet
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(server.connect_count(), 1);

    // past base + jitter: the retry has fired and succeeded
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(server.connect_count() >= 2, "elapsed {:?}", started.elapsed());
}
