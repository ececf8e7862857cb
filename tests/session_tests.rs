//! Session-level behavior against a scripted transport: the ready gate,
//! request/response matching, heartbeats, and token rotation.

mod support;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use iobridge::core::session::{SessionClient, SessionEvent};
use iobridge::error::Error;
use iobridge::testkit::{MockEndpoint, StaticTokens};
use support::{authed_endpoint_config, endpoint_config, fast_config};

async fn connect(
    server: &MockEndpoint,
) -> (Arc<SessionClient>, mpsc::UnboundedReceiver<SessionEvent>) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let session = SessionClient::connect(
        endpoint_config(),
        fast_config().session,
        Arc::new(StaticTokens::unused()),
        Arc::new(server.clone()),
        events_tx,
    )
    .await
    .unwrap();
    (session, events_rx)
}

/// Drain buffered events, returning their debug renderings.
fn drain(events_rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<String> {
    let mut out = Vec::new();
    while let Ok(event) = events_rx.try_recv() {
        out.push(format!("{event:?}"));
    }
    out
}

#[tokio::test]
async fn test_connect_waits_for_ready_gate() {
    let server = MockEndpoint::new();
    server.set_ready_delay(Duration::from_millis(50));
    let (session, mut events_rx) = connect(&server).await;

    assert!(session.is_ready());
    assert!(session.session_id() > 0);
    let events = drain(&mut events_rx);
    assert!(events.iter().any(|e| e.contains("Ready")), "{events:?}");
}

#[tokio::test]
async fn test_missing_ready_signal_times_out() {
    let server = MockEndpoint::silent();
    let (events_tx, _events_rx) = mpsc::unbounded_channel();
    let result = SessionClient::connect(
        endpoint_config(),
        fast_config().session,
        Arc::new(StaticTokens::unused()),
        Arc::new(server.clone()),
        events_tx,
    )
    .await;

    assert!(matches!(result, Err(Error::ReadySignalTimeout(_))), "{result:?}");
    assert_eq!(server.connect_count(), 1);
}

#[tokio::test]
async fn test_request_reply_matching() {
    let server = MockEndpoint::new();
    server.set_state("sys.a", json!({"val": 1, "ack": true, "ts": 1}));
    server.set_state("sys.b", json!({"val": 2, "ack": true, "ts": 1}));
    let (session, _events_rx) = connect(&server).await;

    let a = session.get_state("sys.a", Duration::from_secs(1)).await.unwrap().unwrap();
    let b = session.get_state("sys.b", Duration::from_secs(1)).await.unwrap().unwrap();
    assert_eq!(a.val, json!(1));
    assert_eq!(b.val, json!(2));
    assert!(session.get_state("missing", Duration::from_secs(1)).await.unwrap().is_none());

    // ids on the wire are strictly increasing
    let ids = server.request_ids("getState");
    assert_eq!(ids.len(), 3);
    assert!(ids.windows(2).all(|w| w[0] < w[1]), "{ids:?}");
}

#[tokio::test]
async fn test_slow_reply_times_out_without_killing_the_session() {
    let server = MockEndpoint::new();
    server.set_response_delay(Duration::from_millis(200));
    let (session, _events_rx) = connect(&server).await;

    let result = session.get_state("sys.a", Duration::from_millis(30)).await;
    assert!(matches!(result, Err(Error::Timeout(_))), "{result:?}");
    assert!(session.is_ready(), "a request timeout is not a session failure");
}

#[tokio::test]
async fn test_heartbeat_pings_quiet_link() {
    let server = MockEndpoint::new();
    let (session, _events_rx) = connect(&server).await;

    // ping interval is 50ms; half a second of silence must produce pings
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(server.ping_count() >= 3, "pings sent: {}", server.ping_count());
    assert!(session.is_ready(), "answered pings keep the session up");
}

#[tokio::test]
async fn test_pong_timeout_closes_the_session() {
    let server = MockEndpoint::new();
    server.stop_answering_pings();
    let (session, mut events_rx) = connect(&server).await;

    // pong timeout is 400ms in the test tuning
    tokio::time::sleep(Duration::from_millis(700)).await;

    assert!(!session.is_ready());
    let events = drain(&mut events_rx);
    assert!(
        events.iter().any(|e| e.contains("Disconnected") && e.contains("heartbeat timeout")),
        "{events:?}"
    );
}

#[tokio::test]
async fn test_peer_close_code_is_surfaced() {
    let server = MockEndpoint::new();
    let (session, mut events_rx) = connect(&server).await;

    server.close_connection(4001, "maintenance");
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(!session.is_ready());
    let events = drain(&mut events_rx);
    assert!(
        events.iter().any(|e| e.contains("4001") && e.contains("maintenance")),
        "{events:?}"
    );
}

#[tokio::test]
async fn test_closed_session_rejects_work() {
    let server = MockEndpoint::new();
    let (session, _events_rx) = connect(&server).await;

    session.close();
    assert!(!session.is_ready());
    assert!(matches!(session.send("ping", vec![]), Err(Error::Destroyed)));
    let result = session.get_state("sys.a", Duration::from_millis(50)).await;
    assert!(matches!(result, Err(Error::Destroyed)), "{result:?}");
}

#[tokio::test]
async fn test_reauthenticate_rotates_token_and_session_id() {
    let server = MockEndpoint::new();
    let tokens = Arc::new(StaticTokens::sequence("tok"));
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let session = SessionClient::connect(
        authed_endpoint_config(),
        fast_config().session,
        tokens.clone(),
        Arc::new(server.clone()),
        events_tx,
    )
    .await
    .unwrap();

    let old_sid = session.session_id();
    assert_eq!(tokens.fetch_count(), 1);
    let first_url = server.last_connect_request().unwrap().url;
    assert!(first_url.contains("token=tok-1"), "{first_url}");

    // burn a few request ids before the rotation
    session.get_state("sys.a", Duration::from_secs(1)).await.unwrap();
    session.get_state("sys.a", Duration::from_secs(1)).await.unwrap();

    server.push_reauthenticate();
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert!(session.is_ready(), "session survives the rotation");
    assert_eq!(tokens.fetch_count(), 2);
    assert!(session.session_id() > old_sid, "session id rotated");
    assert_eq!(session.stats().token_rotations, 1);

    let second_url = server.last_connect_request().unwrap().url;
    assert!(second_url.contains("token=tok-2"), "{second_url}");

    // request ids restarted from zero on the new socket
    session.get_state("sys.a", Duration::from_secs(1)).await.unwrap();
    let ids = server.request_ids("getState");
    assert_eq!(*ids.last().unwrap(), 0, "{ids:?}");

    let events = drain(&mut events_rx);
    assert!(events.iter().any(|e| e.contains("TokenRefresh")), "{events:?}");
}

#[tokio::test]
async fn test_stats_reflect_traffic() {
    let server = MockEndpoint::new();
    let (session, _events_rx) = connect(&server).await;

    session.get_state("sys.a", Duration::from_secs(1)).await.unwrap();
    let stats = session.stats();
    assert!(stats.frames_in >= 2, "ready + reply, saw {}", stats.frames_in);
    assert!(stats.frames_out >= 1);
    assert_eq!(stats.pending_callbacks, 0);
    assert_eq!(stats.token_rotations, 0);
}
