//! Pool behavior: single-flight, fingerprint invalidation, the state
//! machine, and server switching.

mod support;

use std::sync::Arc;
use std::time::Duration;

use iobridge::core::domain::ConnectionState;
use iobridge::core::pool::ConnectionPool;
use iobridge::error::Error;
use iobridge::testkit::{MockEndpoint, StaticTokens};
use support::{authed_endpoint_config, endpoint_config, fast_config};

fn pool(server: &MockEndpoint) -> Arc<ConnectionPool> {
    ConnectionPool::new(
        fast_config().session,
        Arc::new(StaticTokens::unused()),
        Arc::new(server.clone()),
    )
}

fn authed_pool(server: &MockEndpoint, tokens: StaticTokens) -> Arc<ConnectionPool> {
    ConnectionPool::new(fast_config().session, Arc::new(tokens), Arc::new(server.clone()))
}

#[tokio::test]
async fn test_connection_is_reused() {
    let server = MockEndpoint::new();
    let pool = pool(&server);
    let config = endpoint_config();

    let first = pool.get_connection(&config).await.unwrap();
    let second = pool.get_connection(&config).await.unwrap();

    assert!(first.is_ready());
    assert!(second.is_ready());
    assert_eq!(server.connect_count(), 1);
    assert_eq!(
        first.session().unwrap().session_id(),
        second.session().unwrap().session_id()
    );
}

#[tokio::test]
async fn test_concurrent_connects_are_single_flight() {
    let server = MockEndpoint::new();
    server.set_ready_delay(Duration::from_millis(60));
    let pool = pool(&server);
    let config = endpoint_config();

    let grants = futures_util::future::join_all((0..4).map(|_| {
        let pool = pool.clone();
        let config = config.clone();
        async move { pool.get_connection(&config).await }
    }))
    .await;

    for grant in grants {
        assert!(grant.unwrap().is_ready());
    }
    assert_eq!(server.connect_count(), 1, "one handshake despite four callers");
}

#[tokio::test]
async fn test_changed_fingerprint_forces_teardown() {
    let server = MockEndpoint::new();
    let pool = pool(&server);
    let config = endpoint_config();

    let first = pool.get_connection(&config).await.unwrap().session().unwrap();

    let mut changed = config.clone();
    changed.password = Some("rotated".to_string());
    let second = pool.get_connection(&changed).await.unwrap().session().unwrap();

    assert_eq!(server.connect_count(), 2);
    assert!(!first.is_ready(), "old session was destroyed");
    assert!(second.is_ready());
}

#[tokio::test]
async fn test_unrelated_call_does_not_invalidate() {
    let server = MockEndpoint::new();
    let pool = pool(&server);
    let config = endpoint_config();

    pool.get_connection(&config).await.unwrap();
    pool.get_connection(&config.clone()).await.unwrap();
    assert_eq!(server.connect_count(), 1);
}

#[tokio::test]
async fn test_hard_auth_failure_parks_the_endpoint() {
    let server = MockEndpoint::new();
    let pool = authed_pool(&server, StaticTokens::rejecting(400, "invalid_grant"));
    let config = authed_endpoint_config();
    let key = config.key();

    let result = pool.get_connection(&config).await;
    assert!(matches!(result, Err(Error::Auth { status: 400, .. })), "{result:?}");
    assert_eq!(pool.state_of(&key), ConnectionState::AuthFailed);

    // subsequent calls refuse instead of hammering the credentials
    let again = pool.get_connection(&config).await;
    assert!(matches!(again, Err(Error::StateForbidsConnect(ConnectionState::AuthFailed))));
    assert_eq!(server.connect_count(), 0, "no socket was ever opened");
}

#[tokio::test]
async fn test_network_failure_yields_pending_grant() {
    let server = MockEndpoint::new();
    server.fail_next_connects(&["connection refused"]);
    let pool = pool(&server);
    let config = endpoint_config();
    let key = config.key();

    let result = pool.get_connection(&config).await;
    assert!(result.is_err());
    assert_eq!(pool.state_of(&key), ConnectionState::NetworkError);
    assert_eq!(pool.reconnect_attempts(&key), 1);

    // the recovery manager owns the endpoint now; callers get a pending grant
    let grant = pool.get_connection(&config).await.unwrap();
    assert!(!grant.is_ready());
}

#[tokio::test]
async fn test_attempt_reconnection_recovers_from_network_error() {
    let server = MockEndpoint::new();
    server.fail_next_connects(&["connection refused"]);
    let pool = pool(&server);
    let config = endpoint_config();
    let key = config.key();

    assert!(pool.get_connection(&config).await.is_err());
    assert!(pool.mark_retry_scheduled(&key));
    assert_eq!(pool.state_of(&key), ConnectionState::RetryScheduled);

    let grant = pool.attempt_reconnection(&key).await.unwrap();
    assert!(grant.is_ready());
    assert_eq!(pool.state_of(&key), ConnectionState::Connected);
    assert_eq!(pool.reconnect_attempts(&key), 0, "counter resets on success");
}

#[tokio::test]
async fn test_socket_loss_moves_to_network_error() {
    let server = MockEndpoint::new();
    let pool = pool(&server);
    let config = endpoint_config();
    let key = config.key();

    pool.get_connection(&config).await.unwrap();
    server.drop_connection();
    tokio::time::sleep(Duration::from_millis(80)).await;

    assert_eq!(pool.state_of(&key), ConnectionState::NetworkError);
    assert!(pool.ready_session(&key).is_none());
}

#[tokio::test]
async fn test_force_server_switch_leaves_new_endpoint_alone() {
    let server = MockEndpoint::new();
    let pool = pool(&server);
    let old_config = endpoint_config();
    let old_key = old_config.key();

    let mut new_config = endpoint_config();
    new_config.port = 8083;
    let new_key = new_config.key();

    let old = pool.get_connection(&old_config).await.unwrap().session().unwrap();
    let grant = pool.force_server_switch(&old_key, &new_config).await.unwrap();

    assert!(grant.is_ready());
    assert!(!old.is_ready(), "old session destroyed by the switch");
    assert_eq!(pool.state_of(&old_key), ConnectionState::Idle);
    assert_eq!(pool.state_of(&new_key), ConnectionState::Connected);
}

#[tokio::test]
async fn test_close_connection_returns_endpoint_to_idle() {
    let server = MockEndpoint::new();
    let pool = pool(&server);
    let config = endpoint_config();
    let key = config.key();

    let session = pool.get_connection(&config).await.unwrap().session().unwrap();
    pool.close_connection(&key);

    assert_eq!(pool.state_of(&key), ConnectionState::Idle);
    assert!(!session.is_ready());
    let status = pool.connection_status(&key);
    assert_eq!(status.status, ConnectionState::Idle);
    assert!(status.client_stats.is_none());
}

#[tokio::test]
async fn test_status_transitions_are_delivered_in_order() {
    let server = MockEndpoint::new();
    let pool = pool(&server);
    let observed = Arc::new(std::sync::Mutex::new(Vec::new()));
    {
        let observed = observed.clone();
        pool.set_status_change_callback(Arc::new(move |_key, state| {
            observed.lock().unwrap().push(state);
        }));
    }

    let config = endpoint_config();
    pool.get_connection(&config).await.unwrap();
    server.drop_connection();
    tokio::time::sleep(Duration::from_millis(80)).await;

    let states = observed.lock().unwrap().clone();
    assert_eq!(
        states,
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::NetworkError,
        ]
    );
}
