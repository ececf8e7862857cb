//! Connection pool: at most one session per endpoint.
//!
//! The pool owns the per-endpoint state machine, deduplicates concurrent
//! connect attempts (single-flight), invalidates sessions whose
//! configuration fingerprint changed, and fans session events out to the
//! pool-level callbacks. Status-change callbacks are delivered by one
//! dispatcher task so consumers observe transitions in order.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::app::SessionTuning;
use crate::core::auth::TokenFetcher;
use crate::core::domain::{
    AuthStatus, ConnectionState, ConnectionStatus, EndpointConfig, EndpointKey, LogEntry,
    SslStatus, StateValue,
};
use crate::core::recovery::{classify, Classification};
use crate::core::session::{Connector, SessionClient, SessionEvent};
use crate::error::{Error, Result};

/// Outcome of a connection request.
#[derive(Debug)]
pub enum SessionGrant {
    /// A live, ready session.
    Ready(Arc<SessionClient>),
    /// The endpoint is known but not currently connectable; the recovery
    /// manager owns bringing it back.
    Pending,
}

impl SessionGrant {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    pub fn session(&self) -> Option<Arc<SessionClient>> {
        match self {
            Self::Ready(session) => Some(session.clone()),
            Self::Pending => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Callbacks
// ---------------------------------------------------------------------------

pub type ClientReadyFn = Arc<dyn Fn(&EndpointKey, Arc<SessionClient>) + Send + Sync>;
pub type StateChangeFn = Arc<dyn Fn(&EndpointKey, &str, Option<&StateValue>) + Send + Sync>;
pub type ObjectChangeFn =
    Arc<dyn Fn(&EndpointKey, &str, Option<&Value>, Option<&str>) + Send + Sync>;
pub type LogEventFn = Arc<dyn Fn(&EndpointKey, &LogEntry) + Send + Sync>;
pub type DisconnectFn = Arc<dyn Fn(&EndpointKey, &str) + Send + Sync>;
pub type ErrorFn = Arc<dyn Fn(&EndpointKey, &Error) + Send + Sync>;
pub type StatusChangeFn = Arc<dyn Fn(&EndpointKey, ConnectionState) + Send + Sync>;

#[derive(Default, Clone)]
struct PoolCallbacks {
    on_client_ready: Option<ClientReadyFn>,
    on_state_change: Option<StateChangeFn>,
    on_object_change: Option<ObjectChangeFn>,
    on_log: Option<LogEventFn>,
    on_disconnect: Option<DisconnectFn>,
    on_error: Option<ErrorFn>,
    on_status_change: Option<StatusChangeFn>,
}

// ---------------------------------------------------------------------------
// Endpoint bookkeeping
// ---------------------------------------------------------------------------

struct EndpointEntry {
    config: EndpointConfig,
    fingerprint: u64,
    state: ConnectionState,
    session: Option<Arc<SessionClient>>,
    /// Single-flight guard: whoever holds it drives the handshake.
    connect_lock: Arc<tokio::sync::Mutex<()>>,
    reconnect_attempts: u32,
    event_task: Option<tokio::task::JoinHandle<()>>,
}

impl EndpointEntry {
    fn new(config: EndpointConfig) -> Self {
        let fingerprint = config.fingerprint();
        Self {
            config,
            fingerprint,
            state: ConnectionState::Idle,
            session: None,
            connect_lock: Arc::new(tokio::sync::Mutex::new(())),
            reconnect_attempts: 0,
            event_task: None,
        }
    }

    fn ready_session(&self) -> Option<Arc<SessionClient>> {
        self.session.as_ref().filter(|s| s.is_ready()).cloned()
    }
}

// ---------------------------------------------------------------------------
// ConnectionPool
// ---------------------------------------------------------------------------

pub struct ConnectionPool {
    tuning: SessionTuning,
    auth: Arc<dyn TokenFetcher>,
    connector: Arc<dyn Connector>,
    endpoints: Mutex<HashMap<EndpointKey, EndpointEntry>>,
    callbacks: Mutex<PoolCallbacks>,
    status_tx: mpsc::UnboundedSender<(EndpointKey, ConnectionState)>,
}

impl ConnectionPool {
    /// Build the pool and start its status dispatcher.
    ///
    /// Must be called within a Tokio runtime.
    pub fn new(
        tuning: SessionTuning,
        auth: Arc<dyn TokenFetcher>,
        connector: Arc<dyn Connector>,
    ) -> Arc<Self> {
        let (status_tx, mut status_rx) = mpsc::unbounded_channel();
        let pool = Arc::new(Self {
            tuning,
            auth,
            connector,
            endpoints: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(PoolCallbacks::default()),
            status_tx,
        });

        // One dispatcher task keeps status callbacks ordered and off the
        // transitioning task's stack.
        let weak = Arc::downgrade(&pool);
        tokio::spawn(async move {
            while let Some((key, state)) = status_rx.recv().await {
                let Some(pool) = weak.upgrade() else { break };
                let callback = pool.callbacks.lock().on_status_change.clone();
                if let Some(callback) = callback {
                    callback(&key, state);
                }
            }
        });

        pool
    }

    // -- Callback wiring ----------------------------------------------------

    pub fn set_on_client_ready(&self, callback: ClientReadyFn) {
        self.callbacks.lock().on_client_ready = Some(callback);
    }

    pub fn set_on_state_change(&self, callback: StateChangeFn) {
        self.callbacks.lock().on_state_change = Some(callback);
    }

    pub fn set_on_object_change(&self, callback: ObjectChangeFn) {
        self.callbacks.lock().on_object_change = Some(callback);
    }

    pub fn set_on_log(&self, callback: LogEventFn) {
        self.callbacks.lock().on_log = Some(callback);
    }

    pub fn set_on_disconnect(&self, callback: DisconnectFn) {
        self.callbacks.lock().on_disconnect = Some(callback);
    }

    pub fn set_on_error(&self, callback: ErrorFn) {
        self.callbacks.lock().on_error = Some(callback);
    }

    pub fn set_status_change_callback(&self, callback: StatusChangeFn) {
        self.callbacks.lock().on_status_change = Some(callback);
    }

    // -- Connection management ----------------------------------------------

    /// Obtain the endpoint's session, opening one when the state allows it.
    ///
    /// A changed config fingerprint tears the old session down first. From
    /// `NetworkError`/`RetryScheduled` the caller gets [`SessionGrant::Pending`]
    /// and the recovery manager owns the endpoint; `AuthFailed` and
    /// `Destroying` refuse outright.
    pub async fn get_connection(
        self: &Arc<Self>,
        config: &EndpointConfig,
    ) -> Result<SessionGrant> {
        let key = config.key();
        let connect_lock = {
            let mut map = self.endpoints.lock();
            if map
                .get(&key)
                .is_some_and(|entry| entry.fingerprint != config.fingerprint())
            {
                info!(endpoint = %key, "Configuration changed, discarding session");
                self.cleanup_locked(&mut map, &key);
            }
            let entry = map.entry(key.clone()).or_insert_with(|| EndpointEntry::new(config.clone()));
            if let Some(session) = entry.ready_session() {
                return Ok(SessionGrant::Ready(session));
            }
            match entry.state {
                ConnectionState::AuthFailed | ConnectionState::Destroying => {
                    return Err(Error::StateForbidsConnect(entry.state));
                }
                ConnectionState::NetworkError | ConnectionState::RetryScheduled => {
                    return Ok(SessionGrant::Pending);
                }
                _ => {}
            }
            entry.connect_lock.clone()
        };

        let _guard = connect_lock.lock().await;
        // Re-check after the single-flight gate: the winner may have
        // finished (or failed) while we waited.
        {
            let map = self.endpoints.lock();
            if let Some(entry) = map.get(&key) {
                if let Some(session) = entry.ready_session() {
                    return Ok(SessionGrant::Ready(session));
                }
                match entry.state {
                    ConnectionState::AuthFailed | ConnectionState::Destroying => {
                        return Err(Error::StateForbidsConnect(entry.state));
                    }
                    ConnectionState::NetworkError | ConnectionState::RetryScheduled => {
                        return Ok(SessionGrant::Pending);
                    }
                    _ => {}
                }
            }
        }
        self.connect_endpoint(&key, config).await
    }

    /// Reconnect an endpoint using its stored config. Used by the recovery
    /// manager, which is allowed to connect out of `RetryScheduled`.
    pub async fn attempt_reconnection(self: &Arc<Self>, key: &EndpointKey) -> Result<SessionGrant> {
        let (config, connect_lock) = {
            let map = self.endpoints.lock();
            let entry = map
                .get(key)
                .ok_or_else(|| Error::Config(format!("unknown endpoint {key}")))?;
            (entry.config.clone(), entry.connect_lock.clone())
        };
        let _guard = connect_lock.lock().await;
        {
            let map = self.endpoints.lock();
            if let Some(entry) = map.get(key) {
                if let Some(session) = entry.ready_session() {
                    return Ok(SessionGrant::Ready(session));
                }
                if matches!(
                    entry.state,
                    ConnectionState::AuthFailed | ConnectionState::Destroying
                ) {
                    return Err(Error::StateForbidsConnect(entry.state));
                }
            }
        }
        self.connect_endpoint(key, &config).await
    }

    async fn connect_endpoint(
        self: &Arc<Self>,
        key: &EndpointKey,
        config: &EndpointConfig,
    ) -> Result<SessionGrant> {
        self.transition(key, ConnectionState::Connecting);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        match SessionClient::connect(
            config.clone(),
            self.tuning.clone(),
            self.auth.clone(),
            self.connector.clone(),
            events_tx,
        )
        .await
        {
            Ok(session) => {
                {
                    let mut map = self.endpoints.lock();
                    let entry = map
                        .entry(key.clone())
                        .or_insert_with(|| EndpointEntry::new(config.clone()));
                    entry.session = Some(session.clone());
                    entry.reconnect_attempts = 0;
                }
                // The session's Ready event is already buffered; attach the
                // dispatcher after the session is visible in the map.
                let task = self.spawn_event_task(key.clone(), events_rx);
                if let Some(old) = self
                    .endpoints
                    .lock()
                    .get_mut(key)
                    .and_then(|entry| entry.event_task.replace(task))
                {
                    old.abort();
                }
                self.transition(key, ConnectionState::Connected);
                Ok(SessionGrant::Ready(session))
            }
            Err(e) => {
                let next = match classify(&e) {
                    Classification::AuthHard => ConnectionState::AuthFailed,
                    _ => ConnectionState::NetworkError,
                };
                {
                    let mut map = self.endpoints.lock();
                    if let Some(entry) = map.get_mut(key) {
                        entry.reconnect_attempts += 1;
                    }
                }
                warn!(endpoint = %key, error = %e, next = %next, "Connect failed");
                self.transition(key, next);
                let callback = self.callbacks.lock().on_error.clone();
                if let Some(callback) = callback {
                    callback(key, &e);
                }
                Err(e)
            }
        }
    }

    /// Tear an endpoint down and forget its configuration.
    pub fn close_connection(&self, key: &EndpointKey) {
        let mut map = self.endpoints.lock();
        self.cleanup_locked(&mut map, key);
    }

    /// Tear down `old_key` and connect the replacement endpoint.
    pub async fn force_server_switch(
        self: &Arc<Self>,
        old_key: &EndpointKey,
        new_config: &EndpointConfig,
    ) -> Result<SessionGrant> {
        info!(old = %old_key, new = %new_config.key(), "Switching server");
        self.close_connection(old_key);
        self.get_connection(new_config).await
    }

    fn cleanup_locked(&self, map: &mut HashMap<EndpointKey, EndpointEntry>, key: &EndpointKey) {
        let Some(mut entry) = map.remove(key) else { return };
        entry.state = ConnectionState::Destroying;
        self.notify_status(key, ConnectionState::Destroying);
        if let Some(task) = entry.event_task.take() {
            // stale events must not fire against the next session
            task.abort();
        }
        if let Some(session) = entry.session.take() {
            session.close();
        }
        self.notify_status(key, ConnectionState::Idle);
        debug!(endpoint = %key, "Endpoint cleaned up");
    }

    // -- State machine -------------------------------------------------------

    pub fn state_of(&self, key: &EndpointKey) -> ConnectionState {
        self.endpoints
            .lock()
            .get(key)
            .map_or(ConnectionState::Idle, |entry| entry.state)
    }

    /// `NetworkError` -> `RetryScheduled`; returns whether the move happened.
    pub fn mark_retry_scheduled(&self, key: &EndpointKey) -> bool {
        let moved = {
            let mut map = self.endpoints.lock();
            match map.get_mut(key) {
                Some(entry) if entry.state == ConnectionState::NetworkError => {
                    entry.state = ConnectionState::RetryScheduled;
                    true
                }
                _ => false,
            }
        };
        if moved {
            self.notify_status(key, ConnectionState::RetryScheduled);
        }
        moved
    }

    /// Demote an endpoint to `AuthFailed` (recovery gave up).
    pub fn mark_auth_failed(&self, key: &EndpointKey) {
        self.transition(key, ConnectionState::AuthFailed);
    }

    pub fn reconnect_attempts(&self, key: &EndpointKey) -> u32 {
        self.endpoints
            .lock()
            .get(key)
            .map_or(0, |entry| entry.reconnect_attempts)
    }

    /// The endpoint's session when it is live and ready.
    pub fn ready_session(&self, key: &EndpointKey) -> Option<Arc<SessionClient>> {
        self.endpoints.lock().get(key).and_then(EndpointEntry::ready_session)
    }

    fn transition(&self, key: &EndpointKey, next: ConnectionState) {
        let changed = {
            let mut map = self.endpoints.lock();
            let Some(entry) = map.get_mut(key) else { return };
            if entry.state == next {
                false
            } else if !entry.state.may_transition_to(next) {
                warn!(endpoint = %key, from = %entry.state, to = %next, "Illegal state transition ignored");
                false
            } else {
                entry.state = next;
                true
            }
        };
        if changed {
            self.notify_status(key, next);
        }
    }

    fn notify_status(&self, key: &EndpointKey, state: ConnectionState) {
        let _ = self.status_tx.send((key.clone(), state));
    }

    // -- Event fan-in --------------------------------------------------------

    fn spawn_event_task(
        self: &Arc<Self>,
        key: EndpointKey,
        mut events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    ) -> tokio::task::JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                let Some(pool) = weak.upgrade() else { break };
                pool.handle_session_event(&key, event);
            }
        })
    }

    fn handle_session_event(self: &Arc<Self>, key: &EndpointKey, event: SessionEvent) {
        let callbacks = self.callbacks.lock().clone();
        match event {
            SessionEvent::Ready => {
                self.transition(key, ConnectionState::Connected);
                let session = self.ready_session(key);
                if let (Some(callback), Some(session)) = (callbacks.on_client_ready, session) {
                    callback(key, session);
                }
            }
            SessionEvent::StateChange { id, state } => {
                if let Some(callback) = callbacks.on_state_change {
                    callback(key, &id, state.as_ref());
                }
            }
            SessionEvent::ObjectChange { id, object, op } => {
                if let Some(callback) = callbacks.on_object_change {
                    callback(key, &id, object.as_ref(), op.as_deref());
                }
            }
            SessionEvent::Log(entry) => {
                if let Some(callback) = callbacks.on_log {
                    callback(key, &entry);
                }
            }
            SessionEvent::TokenRefresh { old_session_id, new_session_id } => {
                debug!(endpoint = %key, old_session_id, new_session_id, "Token refreshed");
            }
            SessionEvent::Disconnected { reason } => {
                let relevant = {
                    let mut map = self.endpoints.lock();
                    match map.get_mut(key) {
                        Some(entry)
                            if matches!(
                                entry.state,
                                ConnectionState::Connected | ConnectionState::Connecting
                            ) =>
                        {
                            entry.session = None;
                            true
                        }
                        _ => false,
                    }
                };
                if relevant {
                    info!(endpoint = %key, reason = %reason, "Session lost");
                    self.transition(key, ConnectionState::NetworkError);
                    if let Some(callback) = callbacks.on_disconnect {
                        callback(key, &reason);
                    }
                }
            }
        }
    }

    // -- Introspection -------------------------------------------------------

    /// Synchronous status snapshot for one endpoint.
    pub fn connection_status(&self, key: &EndpointKey) -> ConnectionStatus {
        let map = self.endpoints.lock();
        match map.get(key) {
            None => ConnectionStatus::idle(key.as_str()),
            Some(entry) => {
                let ready = entry.ready_session().is_some();
                let ssl = entry.config.ssl_enabled();
                let authenticated = entry.config.authenticated();
                ConnectionStatus {
                    connected: entry.state == ConnectionState::Connected,
                    ready,
                    status: entry.state,
                    server_id: key.to_string(),
                    ssl: SslStatus { enabled: ssl, protocol: entry.config.ws_scheme() },
                    authentication: AuthStatus {
                        method: if authenticated { "oauth2" } else { "none" },
                        authenticated: ready
                            && entry.session.as_ref().is_some_and(|s| s.has_token()),
                    },
                    reconnection_attempts: entry.reconnect_attempts,
                    client_stats: entry.session.as_ref().map(|s| s.stats()),
                }
            }
        }
    }

    /// Tear down every endpoint. Part of process shutdown.
    pub fn shutdown(&self) {
        let keys: Vec<EndpointKey> = self.endpoints.lock().keys().cloned().collect();
        for key in keys {
            self.close_connection(&key);
        }
    }
}
