//! The façade local consumers call.
//!
//! Every operation resolves the endpoint key to a stored configuration,
//! obtains (or lazily triggers) a session through the pool, performs the
//! operation over the session's request channel, and surfaces a structured
//! result. Consumers never see sessions, retries, or raw socket errors -
//! connection health reaches them only through their status hooks.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::app::config::GatewayConfig;
use crate::core::auth::{AuthClient, TokenFetcher};
use crate::core::domain::{
    ConnectionState, ConnectionStatus, EndpointConfig, EndpointKey, LogLevel, StateValue,
};
use crate::core::pool::{ConnectionPool, SessionGrant};
use crate::core::protocol::SubscriptionPattern;
use crate::core::recovery::RecoveryManager;
use crate::core::registry::{ConsumerHooks, NodeId, NodeRegistry};
use crate::core::session::{error_text, expect_reply, Connector, SessionClient, WsConnector};
use crate::error::{Error, Result};

type SharedRead =
    Shared<BoxFuture<'static, std::result::Result<Option<StateValue>, Arc<Error>>>>;

pub struct Gateway {
    config: GatewayConfig,
    pool: Arc<ConnectionPool>,
    recovery: Arc<RecoveryManager>,
    registry: Arc<NodeRegistry>,
    /// Per-key endpoint configs, stored on first consumer registration.
    endpoints: Mutex<HashMap<EndpointKey, EndpointConfig>>,
    /// Identical concurrent reads share one in-flight upstream request.
    inflight_reads: DashMap<(EndpointKey, String), SharedRead>,
}

impl Gateway {
    /// Build a gateway with the production WebSocket connector and OAuth
    /// client. Must be called within a Tokio runtime: the pool spawns its
    /// dispatch tasks immediately.
    pub fn new(config: GatewayConfig) -> Result<Arc<Self>> {
        let auth = Arc::new(AuthClient::new(config.session.allow_self_signed)?);
        Self::with_connector(config, auth, Arc::new(WsConnector))
    }

    /// Build with custom auth/transport implementations. This is the seam
    /// the test harness uses.
    pub fn with_connector(
        config: GatewayConfig,
        auth: Arc<dyn TokenFetcher>,
        connector: Arc<dyn Connector>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let pool = ConnectionPool::new(config.session.clone(), auth, connector);
        let recovery = RecoveryManager::new(pool.clone(), config.retry.clone());
        let registry = NodeRegistry::new(pool.clone(), recovery.clone(), config.fanout());
        wire_callbacks(&pool, &registry, &recovery);

        Ok(Arc::new(Self {
            config,
            pool,
            recovery,
            registry,
            endpoints: Mutex::new(HashMap::new()),
            inflight_reads: DashMap::new(),
        }))
    }

    // -- Endpoint configuration ---------------------------------------------

    /// Store or replace the configuration behind an endpoint key.
    pub fn configure_endpoint(&self, config: EndpointConfig) -> EndpointKey {
        let key = config.key();
        self.endpoints.lock().insert(key.clone(), config);
        key
    }

    fn endpoint_config(&self, key: &EndpointKey) -> Result<EndpointConfig> {
        self.endpoints
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::Config(format!("no configuration stored for {key}")))
    }

    async fn ready_session(&self, key: &EndpointKey) -> Result<Arc<SessionClient>> {
        let config = self.endpoint_config(key)?;
        match self.pool.get_connection(&config).await? {
            SessionGrant::Ready(session) => Ok(session),
            SessionGrant::Pending => Err(Error::NotConnected),
        }
    }

    // -- Reads ---------------------------------------------------------------

    /// Read one state. Identical concurrent requests for the same id are
    /// coalesced into a single upstream call.
    pub async fn get_state(
        self: &Arc<Self>,
        key: &EndpointKey,
        id: &str,
    ) -> Result<Option<StateValue>> {
        let read_key = (key.clone(), id.to_string());
        let fut = match self.inflight_reads.entry(read_key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => entry.get().clone(),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let gateway = self.clone();
                let fut: SharedRead = async move {
                    let (key, id) = &read_key;
                    let result = async {
                        let session = gateway.ready_session(key).await?;
                        session.get_state(id, gateway.config.read_timeout()).await
                    }
                    .await
                    .map_err(Arc::new);
                    gateway.inflight_reads.remove(&read_key);
                    result
                }
                .boxed()
                .shared();
                slot.insert(fut.clone());
                fut
            }
        };
        fut.await.map_err(|e| Error::Other(e.to_string()))
    }

    /// Batch read by id pattern. The result carries `(id, state)` pairs.
    pub async fn get_states(
        &self,
        key: &EndpointKey,
        pattern: &str,
    ) -> Result<Vec<(String, StateValue)>> {
        let session = self.ready_session(key).await?;
        let args = session
            .request("getStates", vec![json!(pattern)], self.config.read_timeout())
            .await?;
        let mut results = expect_reply(args)?;
        if results.is_empty() {
            return Ok(Vec::new());
        }
        let Value::Object(map) = results.remove(0) else {
            return Ok(Vec::new());
        };
        let matcher = SubscriptionPattern::compile(pattern);
        let mut states: Vec<(String, StateValue)> = map
            .into_iter()
            .filter(|(id, _)| matcher.matches(id))
            .filter_map(|(id, raw)| StateValue::from_wire(raw).map(|state| (id, state)))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(states)
    }

    pub async fn get_object(&self, key: &EndpointKey, id: &str) -> Result<Option<Value>> {
        let session = self.ready_session(key).await?;
        let args = session
            .request("getObject", vec![json!(id)], self.config.read_timeout())
            .await?;
        let mut results = expect_reply(args)?;
        if results.is_empty() {
            return Ok(None);
        }
        let object = results.remove(0);
        Ok(if object.is_null() { None } else { Some(object) })
    }

    /// Object read by pattern with an optional server-side type filter.
    pub async fn get_objects(
        &self,
        key: &EndpointKey,
        pattern: &str,
        object_type: Option<&str>,
    ) -> Result<Vec<(String, Value)>> {
        let session = self.ready_session(key).await?;
        let args = session
            .request("getObjects", vec![json!(pattern)], self.config.read_timeout())
            .await?;
        let mut results = expect_reply(args)?;
        if results.is_empty() {
            return Ok(Vec::new());
        }
        let Value::Object(map) = results.remove(0) else {
            return Ok(Vec::new());
        };
        let matcher = SubscriptionPattern::compile(pattern);
        let mut objects: Vec<(String, Value)> = map
            .into_iter()
            .filter(|(id, _)| matcher.matches(id))
            .filter(|(_, object)| match object_type {
                Some(wanted) => object.get("type").and_then(Value::as_str) == Some(wanted),
                None => true,
            })
            .collect();
        objects.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(objects)
    }

    /// Server-side design/view query.
    pub async fn get_object_view(
        &self,
        key: &EndpointKey,
        design: &str,
        view: &str,
        params: Value,
    ) -> Result<Value> {
        let session = self.ready_session(key).await?;
        let args = session
            .request(
                "getObjectView",
                vec![json!(design), json!(view), params],
                self.config.read_timeout(),
            )
            .await?;
        let mut results = expect_reply(args)?;
        if results.is_empty() {
            return Ok(Value::Null);
        }
        Ok(results.remove(0))
    }

    // -- Writes and RPC ------------------------------------------------------

    /// Write a state. A bare value is wrapped into a full state object; a
    /// payload that already looks like one is passed through.
    pub async fn set_state(
        &self,
        key: &EndpointKey,
        id: &str,
        value: Value,
        ack: bool,
    ) -> Result<()> {
        let state = if value.is_object() && value.get("val").is_some() {
            serde_json::from_value::<StateValue>(value)?
        } else {
            StateValue::wrap(value, ack)
        };
        let session = self.ready_session(key).await?;
        let args = session
            .request(
                "setState",
                vec![json!(id), serde_json::to_value(&state)?],
                self.config.read_timeout(),
            )
            .await?;
        expect_reply(args).map(|_| ())
    }

    /// RPC to an adapter instance. With `timeout == None` the message is
    /// fire-and-forget: it returns right after transmit and no reply slot
    /// is created.
    pub async fn send_to(
        &self,
        key: &EndpointKey,
        instance: &str,
        command: Option<&str>,
        message: Value,
        timeout: Option<std::time::Duration>,
    ) -> Result<Option<Value>> {
        let session = self.ready_session(key).await?;
        let args = vec![json!(instance), json!(command), message];
        match timeout {
            None => {
                session.send("sendTo", args)?;
                Ok(None)
            }
            Some(timeout) => {
                let reply = session.request("sendTo", args, timeout).await?;
                Ok(reply.into_iter().next())
            }
        }
    }

    /// Structured history query, carried as an adapter RPC.
    pub async fn get_history(
        &self,
        key: &EndpointKey,
        history_adapter: &str,
        id: &str,
        options: Value,
    ) -> Result<Value> {
        let message = json!({ "id": id, "options": options });
        let reply = self
            .send_to(key, history_adapter, Some("getHistory"), message, Some(self.config.read_timeout()))
            .await?;
        let Some(reply) = reply else { return Ok(Value::Null) };
        if let Some(err) = reply.get("error") {
            if !err.is_null() {
                return Err(Error::Server(error_text(err)));
            }
        }
        Ok(match reply.get("result") {
            Some(result) => result.clone(),
            None => reply,
        })
    }

    // -- Subscriptions and registrations ------------------------------------

    /// Subscribe a consumer to a state pattern.
    pub async fn subscribe(
        &self,
        node: impl Into<NodeId>,
        config: EndpointConfig,
        pattern: &str,
        hooks: ConsumerHooks,
    ) -> Result<()> {
        self.configure_endpoint(config.clone());
        self.registry.subscribe(node.into(), &config, pattern, hooks).await
    }

    pub async fn unsubscribe(&self, node: impl Into<NodeId>) {
        self.registry.unsubscribe(&node.into()).await;
    }

    /// Tap the server's live log stream at `min_level` and above.
    pub async fn subscribe_to_live_logs(
        &self,
        node: impl Into<NodeId>,
        config: EndpointConfig,
        hooks: ConsumerHooks,
        min_level: LogLevel,
    ) -> Result<()> {
        self.configure_endpoint(config.clone());
        self.registry.subscribe_logs(node.into(), &config, hooks, min_level).await
    }

    pub async fn unsubscribe_from_live_logs(&self, node: impl Into<NodeId>) {
        self.registry.unsubscribe_logs(&node.into()).await;
    }

    /// Register a consumer that only wants connection-status updates.
    pub async fn register_for_events(
        &self,
        node: impl Into<NodeId>,
        config: EndpointConfig,
        hooks: ConsumerHooks,
    ) -> Result<()> {
        self.configure_endpoint(config.clone());
        self.registry.register_for_events(node.into(), &config, hooks).await
    }

    pub fn unregister_from_events(&self, node: impl Into<NodeId>) {
        self.registry.unregister_from_events(&node.into());
    }

    // -- Connection control --------------------------------------------------

    /// Synchronous status snapshot for one endpoint.
    pub fn get_connection_status(&self, key: &EndpointKey) -> ConnectionStatus {
        self.pool.connection_status(key)
    }

    /// Consumer-driven reconfiguration: tear down `old_key` and bring up the
    /// endpoint described by `new_config`.
    pub async fn force_server_switch(
        &self,
        old_key: &EndpointKey,
        new_config: EndpointConfig,
    ) -> Result<()> {
        self.endpoints.lock().remove(old_key);
        self.configure_endpoint(new_config.clone());
        self.pool.force_server_switch(old_key, &new_config).await.map(|_| ())
    }

    /// Nudge the recovery manager to retry an endpoint right away.
    pub fn attempt_reconnection(&self, key: &EndpointKey) {
        self.recovery.schedule_immediate_retry(key);
    }

    /// Orderly teardown: sessions first, then local maps, then timers.
    pub async fn shutdown(&self) {
        info!("Gateway shutting down");
        self.pool.shutdown();
        self.registry.clear();
        self.recovery.shutdown();
        self.inflight_reads.clear();
        self.endpoints.lock().clear();
    }
}

/// Connect the pool's event callbacks to the registry and recovery manager.
///
/// The closures hold weak references: the pool must not keep the registry
/// alive, and dropping the gateway unwinds everything.
fn wire_callbacks(
    pool: &Arc<ConnectionPool>,
    registry: &Arc<NodeRegistry>,
    recovery: &Arc<RecoveryManager>,
) {
    let weak_registry: Weak<NodeRegistry> = Arc::downgrade(registry);
    let weak_recovery: Weak<RecoveryManager> = Arc::downgrade(recovery);

    {
        let registry = weak_registry.clone();
        pool.set_on_client_ready(Arc::new(move |key, session| {
            if let Some(registry) = registry.upgrade() {
                registry.handle_client_ready(key, session);
            }
        }));
    }
    {
        let registry = weak_registry.clone();
        pool.set_on_state_change(Arc::new(move |key, id, state| {
            if let Some(registry) = registry.upgrade() {
                registry.handle_state_change(key, id, state);
            }
        }));
    }
    {
        let registry = weak_registry.clone();
        pool.set_on_object_change(Arc::new(move |key, id, object, op| {
            if let Some(registry) = registry.upgrade() {
                registry.handle_object_change(key, id, object, op);
            }
        }));
    }
    {
        let registry = weak_registry.clone();
        pool.set_on_log(Arc::new(move |key, entry| {
            if let Some(registry) = registry.upgrade() {
                registry.handle_log(key, entry);
            }
        }));
    }
    {
        let registry = weak_registry.clone();
        pool.set_on_disconnect(Arc::new(move |key, reason| {
            debug!(endpoint = %key, reason = %reason, "Disconnect observed");
            if let Some(registry) = registry.upgrade() {
                registry.handle_disconnect(key);
            }
        }));
    }
    {
        pool.set_on_error(Arc::new(move |key, error| {
            debug!(endpoint = %key, error = %error, "Connection error observed");
        }));
    }
    {
        let registry = weak_registry;
        let recovery = weak_recovery;
        pool.set_status_change_callback(Arc::new(move |key, state| {
            if let Some(registry) = registry.upgrade() {
                registry.update_node_status(key, state);
            }
            if state == ConnectionState::NetworkError {
                if let Some(recovery) = recovery.upgrade() {
                    recovery.schedule_retry(key);
                }
            }
        }));
    }
}
