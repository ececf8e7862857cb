//! Consumer registry and event fan-out.
//!
//! Tracks which local consumers want which subscription patterns, issues at
//! most one upstream subscription per `(endpoint, pattern)` pair, routes
//! inbound state/object/log events to every matching consumer exactly once,
//! re-arms subscriptions after a reconnect, and parks work that arrived
//! while the endpoint was down.
//!
//! Consumer callbacks run inside a panic guard; a misbehaving consumer is
//! logged and never takes the dispatch path down.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::app::FanoutTuning;
use crate::core::domain::{
    ConnectionState, EndpointConfig, EndpointKey, LogEntry, LogLevel, NodeStatus, StateValue,
};
use crate::core::protocol::SubscriptionPattern;
use crate::core::pool::{ConnectionPool, SessionGrant};
use crate::core::recovery::{classify, RecoveryManager};
use crate::core::session::SessionClient;
use crate::error::{Error, Result};

/// Identifies one local consumer (a flow node).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeId(String);

impl NodeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// What a consumer registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerKind {
    Subscribe,
    Events,
    Log,
}

pub type ValueHook = Arc<dyn Fn(&str, Option<&StateValue>) + Send + Sync>;
pub type ObjectHook = Arc<dyn Fn(&str, Option<&Value>, Option<&str>) + Send + Sync>;
pub type LogHook = Arc<dyn Fn(&LogEntry) + Send + Sync>;
pub type StatusHook = Arc<dyn Fn(NodeStatus) + Send + Sync>;
pub type NotifyHook = Arc<dyn Fn() + Send + Sync>;

/// Optional callback bundle a consumer hands in at registration. Absent
/// hooks are simply skipped during fan-out.
#[derive(Default, Clone)]
pub struct ConsumerHooks {
    /// Invoked as `(state_id, state)` for every matching state change.
    pub on_value: Option<ValueHook>,
    pub on_object: Option<ObjectHook>,
    pub on_log: Option<LogHook>,
    pub update_status: Option<StatusHook>,
    pub on_subscribed: Option<NotifyHook>,
    /// Falls back to `on_value` when absent and an initial value arrives.
    pub on_initial_value: Option<ValueHook>,
    pub wants_initial_value: bool,
}

struct NodeRegistration {
    key: EndpointKey,
    kind: ConsumerKind,
    #[allow(dead_code)]
    registered_at: DateTime<Utc>,
    pattern: Option<String>,
    min_level: Option<LogLevel>,
}

/// Work parked until the endpoint's next ready signal.
enum DeferredOp {
    Subscribe { node: NodeId, pattern: String },
}

/// Patterns live upstream on one socket. The session id pins which socket:
/// a token rotation replaces the socket (and the id) without a disconnect,
/// and nothing recorded for the old socket survives on the new one.
struct IssuedSet {
    session_id: u64,
    patterns: HashSet<String>,
}

impl IssuedSet {
    fn new(session_id: u64) -> Self {
        Self { session_id, patterns: HashSet::new() }
    }
}

#[derive(Default)]
struct Inner {
    /// endpoint -> pattern -> subscribed nodes.
    subscriptions: HashMap<EndpointKey, HashMap<String, HashSet<NodeId>>>,
    /// Compiled pattern cache.
    compiled: HashMap<String, SubscriptionPattern>,
    hooks: HashMap<NodeId, ConsumerHooks>,
    registrations: HashMap<NodeId, NodeRegistration>,
    deferred: HashMap<EndpointKey, Vec<DeferredOp>>,
    /// Per endpoint, what is live upstream on the current socket.
    issued: HashMap<EndpointKey, IssuedSet>,
}

impl Inner {
    /// The issued set for this socket, resetting whatever an earlier socket
    /// left behind.
    fn issued_for(&mut self, key: &EndpointKey, session_id: u64) -> &mut IssuedSet {
        let issued = self
            .issued
            .entry(key.clone())
            .or_insert_with(|| IssuedSet::new(session_id));
        if issued.session_id != session_id {
            issued.session_id = session_id;
            issued.patterns.clear();
        }
        issued
    }
}

pub struct NodeRegistry {
    pool: Arc<ConnectionPool>,
    recovery: Arc<RecoveryManager>,
    tuning: FanoutTuning,
    inner: Mutex<Inner>,
}

/// Run a consumer callback, containing panics.
fn guarded<F: FnOnce()>(f: F) {
    if std::panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
        warn!("Consumer callback panicked");
    }
}

impl NodeRegistry {
    pub fn new(
        pool: Arc<ConnectionPool>,
        recovery: Arc<RecoveryManager>,
        tuning: FanoutTuning,
    ) -> Arc<Self> {
        Arc::new(Self { pool, recovery, tuning, inner: Mutex::new(Inner::default()) })
    }

    // -- Registration -------------------------------------------------------

    /// Register a state subscription for `node`.
    ///
    /// When the endpoint is not connectable right now, the subscription is
    /// parked and replayed on the next ready signal; the call still
    /// succeeds. Only hard (non-retryable) failures surface as errors.
    pub async fn subscribe(
        self: &Arc<Self>,
        node: NodeId,
        config: &EndpointConfig,
        pattern: &str,
        hooks: ConsumerHooks,
    ) -> Result<()> {
        let key = config.key();
        let fresh = self.record_registration(
            node.clone(),
            NodeRegistration {
                key: key.clone(),
                kind: ConsumerKind::Subscribe,
                registered_at: Utc::now(),
                pattern: Some(pattern.to_string()),
                min_level: None,
            },
            hooks,
        );
        if fresh {
            self.recovery.register_node(&key);
        }

        match self.pool.get_connection(config).await {
            Ok(SessionGrant::Ready(session)) => {
                self.activate_subscription(&key, &session, &node, pattern).await
            }
            Ok(SessionGrant::Pending) => {
                self.defer_subscribe(&key, node, pattern);
                self.recovery.schedule_retry(&key);
                Ok(())
            }
            // a forbidding state is fatal for the call, not a retry case
            Err(e @ Error::StateForbidsConnect(_)) => Err(e),
            Err(e) if classify(&e).retryable() => {
                debug!(endpoint = %key, error = %e, "Connect failed, parking subscription");
                self.defer_subscribe(&key, node, pattern);
                self.recovery.schedule_retry(&key);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Remove a consumer and, when it was the last one on its pattern, the
    /// upstream subscription too.
    pub async fn unsubscribe(&self, node: &NodeId) {
        let (key, upstream_gone) = {
            let mut inner = self.inner.lock();
            let Some(registration) = inner.registrations.remove(node) else { return };
            inner.hooks.remove(node);
            let key = registration.key.clone();
            let mut upstream_gone = None;
            if let Some(pattern) = registration.pattern {
                if let Some(patterns) = inner.subscriptions.get_mut(&key) {
                    if let Some(nodes) = patterns.get_mut(&pattern) {
                        nodes.remove(node);
                        if nodes.is_empty() {
                            patterns.remove(&pattern);
                            if let Some(issued) = inner.issued.get_mut(&key) {
                                issued.patterns.remove(&pattern);
                            }
                            upstream_gone = Some(pattern);
                        }
                    }
                }
            }
            if let Some(ops) = inner.deferred.get_mut(&key) {
                ops.retain(|op| match op {
                    DeferredOp::Subscribe { node: parked, .. } => parked != node,
                });
            }
            (key, upstream_gone)
        };

        if let Some(pattern) = upstream_gone {
            if let Some(session) = self.pool.ready_session(&key) {
                if let Err(e) = session.unsubscribe_pattern(&pattern, self.tuning.subscribe_timeout).await {
                    debug!(endpoint = %key, pattern = %pattern, error = %e, "Upstream unsubscribe failed");
                }
            }
        }
        self.recovery.unregister_node(&key);
    }

    /// Register a connection-status-only consumer.
    pub async fn register_for_events(
        self: &Arc<Self>,
        node: NodeId,
        config: &EndpointConfig,
        hooks: ConsumerHooks,
    ) -> Result<()> {
        let key = config.key();
        let status_hook = hooks.update_status.clone();
        let fresh = self.record_registration(
            node,
            NodeRegistration {
                key: key.clone(),
                kind: ConsumerKind::Events,
                registered_at: Utc::now(),
                pattern: None,
                min_level: None,
            },
            hooks,
        );
        if fresh {
            self.recovery.register_node(&key);
        }

        // push the current status immediately so the consumer renders
        // something before the first transition
        let current = self.pool.state_of(&key).node_status();
        if let Some(hook) = status_hook {
            guarded(|| hook(current));
        }

        match self.pool.get_connection(config).await {
            Ok(_) => Ok(()),
            Err(e @ Error::StateForbidsConnect(_)) => Err(e),
            Err(e) if classify(&e).retryable() => {
                self.recovery.schedule_retry(&key);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub fn unregister_from_events(&self, node: &NodeId) {
        let key = {
            let mut inner = self.inner.lock();
            let Some(registration) = inner.registrations.remove(node) else { return };
            inner.hooks.remove(node);
            registration.key
        };
        self.recovery.unregister_node(&key);
    }

    /// Register a live-log consumer. The first log consumer on an endpoint
    /// arms `requireLog` upstream; the level filter is applied locally.
    pub async fn subscribe_logs(
        self: &Arc<Self>,
        node: NodeId,
        config: &EndpointConfig,
        hooks: ConsumerHooks,
        min_level: LogLevel,
    ) -> Result<()> {
        let key = config.key();
        let fresh = self.record_registration(
            node,
            NodeRegistration {
                key: key.clone(),
                kind: ConsumerKind::Log,
                registered_at: Utc::now(),
                pattern: None,
                min_level: Some(min_level),
            },
            hooks,
        );
        if fresh {
            self.recovery.register_node(&key);
        }

        match self.pool.get_connection(config).await {
            Ok(SessionGrant::Ready(session)) => {
                session.send("requireLog", vec![json!(true)])?;
                Ok(())
            }
            Ok(SessionGrant::Pending) => {
                self.recovery.schedule_retry(&key);
                Ok(())
            }
            Err(e @ Error::StateForbidsConnect(_)) => Err(e),
            Err(e) if classify(&e).retryable() => {
                self.recovery.schedule_retry(&key);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn unsubscribe_logs(&self, node: &NodeId) {
        let (key, last_log_node) = {
            let mut inner = self.inner.lock();
            let Some(registration) = inner.registrations.remove(node) else { return };
            inner.hooks.remove(node);
            let key = registration.key.clone();
            let remaining = inner
                .registrations
                .values()
                .any(|r| r.kind == ConsumerKind::Log && r.key == key);
            (key, !remaining)
        };
        if last_log_node {
            if let Some(session) = self.pool.ready_session(&key) {
                let _ = session.send("requireLog", vec![json!(false)]);
            }
        }
        self.recovery.unregister_node(&key);
    }

    fn record_registration(
        &self,
        node: NodeId,
        registration: NodeRegistration,
        hooks: ConsumerHooks,
    ) -> bool {
        let mut inner = self.inner.lock();
        let fresh = !inner.registrations.contains_key(&node);
        inner.registrations.insert(node.clone(), registration);
        inner.hooks.insert(node, hooks);
        fresh
    }

    fn defer_subscribe(&self, key: &EndpointKey, node: NodeId, pattern: &str) {
        self.inner
            .lock()
            .deferred
            .entry(key.clone())
            .or_default()
            .push(DeferredOp::Subscribe { node, pattern: pattern.to_string() });
    }

    /// Issue the upstream subscription if the pattern is new, confirm to the
    /// consumer, and kick off the initial-value read.
    async fn activate_subscription(
        &self,
        key: &EndpointKey,
        session: &Arc<SessionClient>,
        node: &NodeId,
        pattern: &str,
    ) -> Result<()> {
        let needs_upstream = {
            let mut inner = self.inner.lock();
            if !inner.compiled.contains_key(pattern) {
                inner.compiled.insert(pattern.to_string(), SubscriptionPattern::compile(pattern));
            }
            inner
                .subscriptions
                .entry(key.clone())
                .or_default()
                .entry(pattern.to_string())
                .or_default()
                .insert(node.clone());
            inner.issued_for(key, session.session_id()).patterns.insert(pattern.to_string())
        };

        if needs_upstream {
            if let Err(e) = session.subscribe_pattern(pattern, self.tuning.subscribe_timeout).await {
                // withdraw the marker so the next attempt reissues
                if let Some(issued) = self.inner.lock().issued.get_mut(key) {
                    issued.patterns.remove(pattern);
                }
                return Err(e);
            }
            debug!(endpoint = %key, pattern = %pattern, "Subscribed upstream");
        }

        let hooks = self.inner.lock().hooks.get(node).cloned();
        if let Some(hooks) = hooks {
            if let Some(confirm) = &hooks.on_subscribed {
                let confirm = confirm.clone();
                guarded(|| confirm());
            }
            if hooks.wants_initial_value && !pattern.contains('*') {
                self.spawn_initial_value(session.clone(), pattern.to_string(), hooks);
            }
        }
        Ok(())
    }

    /// Initial values are best-effort: a failed read never fails the
    /// subscription.
    fn spawn_initial_value(&self, session: Arc<SessionClient>, id: String, hooks: ConsumerHooks) {
        let timeout = self.tuning.read_timeout;
        tokio::spawn(async move {
            match session.get_state(&id, timeout).await {
                Ok(state) => {
                    let state = state.as_ref();
                    if let Some(hook) = &hooks.on_initial_value {
                        guarded(|| hook(&id, state));
                    } else if let Some(hook) = &hooks.on_value {
                        guarded(|| hook(&id, state));
                    }
                }
                Err(e) => debug!(id = %id, error = %e, "Initial value fetch failed"),
            }
        });
    }

    // -- Event fan-out -------------------------------------------------------

    /// Route one state change to every consumer whose pattern matches,
    /// exactly once per consumer.
    pub fn handle_state_change(&self, key: &EndpointKey, id: &str, state: Option<&StateValue>) {
        let targets: Vec<ConsumerHooks> = {
            let inner = self.inner.lock();
            let Some(patterns) = inner.subscriptions.get(key) else { return };
            let mut seen: HashSet<&NodeId> = HashSet::new();
            let mut targets = Vec::new();
            for (pattern, nodes) in patterns {
                let matched = inner.compiled.get(pattern).is_some_and(|p| p.matches(id));
                if !matched {
                    continue;
                }
                for node in nodes {
                    if seen.insert(node) {
                        if let Some(hooks) = inner.hooks.get(node) {
                            targets.push(hooks.clone());
                        }
                    }
                }
            }
            targets
        };

        for hooks in targets {
            if let Some(hook) = &hooks.on_value {
                guarded(|| hook(id, state));
            }
        }
    }

    /// Same shape as state changes, against the object hooks.
    pub fn handle_object_change(
        &self,
        key: &EndpointKey,
        id: &str,
        object: Option<&Value>,
        op: Option<&str>,
    ) {
        let targets: Vec<ConsumerHooks> = {
            let inner = self.inner.lock();
            let Some(patterns) = inner.subscriptions.get(key) else { return };
            let mut seen: HashSet<&NodeId> = HashSet::new();
            let mut targets = Vec::new();
            for (pattern, nodes) in patterns {
                let matched = inner.compiled.get(pattern).is_some_and(|p| p.matches(id));
                if !matched {
                    continue;
                }
                for node in nodes {
                    if seen.insert(node) {
                        if let Some(hooks) = inner.hooks.get(node) {
                            if hooks.on_object.is_some() {
                                targets.push(hooks.clone());
                            }
                        }
                    }
                }
            }
            targets
        };

        for hooks in targets {
            if let Some(hook) = &hooks.on_object {
                guarded(|| hook(id, object, op));
            }
        }
    }

    /// Deliver a log line to every log consumer of the endpoint at or above
    /// its minimum level.
    pub fn handle_log(&self, key: &EndpointKey, entry: &LogEntry) {
        let targets: Vec<LogHook> = {
            let inner = self.inner.lock();
            inner
                .registrations
                .iter()
                .filter(|(_, r)| {
                    r.kind == ConsumerKind::Log
                        && &r.key == key
                        && entry.level() >= r.min_level.unwrap_or(LogLevel::Silly)
                })
                .filter_map(|(node, _)| inner.hooks.get(node).and_then(|h| h.on_log.clone()))
                .collect()
        };
        for hook in targets {
            guarded(|| hook(entry));
        }
    }

    /// Broadcast a connection-status label to every consumer of an endpoint.
    pub fn update_node_status(&self, key: &EndpointKey, state: ConnectionState) {
        let status = state.node_status();
        let hooks: Vec<StatusHook> = {
            let inner = self.inner.lock();
            inner
                .registrations
                .iter()
                .filter(|(_, r)| &r.key == key)
                .filter_map(|(node, _)| inner.hooks.get(node).and_then(|h| h.update_status.clone()))
                .collect()
        };
        for hook in hooks {
            guarded(|| hook(status));
        }
    }

    /// The endpoint lost its session; nothing is live upstream any more.
    pub fn handle_disconnect(&self, key: &EndpointKey) {
        self.inner.lock().issued.remove(key);
    }

    /// Re-arm the endpoint after a ready signal: replay parked work, reissue
    /// one upstream subscription per surviving pattern, refresh initial
    /// values, and re-arm live logs.
    pub fn handle_client_ready(self: &Arc<Self>, key: &EndpointKey, session: Arc<SessionClient>) {
        let registry = self.clone();
        let key = key.clone();
        tokio::spawn(async move {
            registry.rearm_endpoint(key, session).await;
        });
    }

    async fn rearm_endpoint(self: Arc<Self>, key: EndpointKey, session: Arc<SessionClient>) {
        // `issued` was cleared on disconnect, and `issued_for` discards what
        // a rotated-away socket left behind. After a cold connect it holds
        // the patterns the registering call just armed, which must not be
        // re-sent here.
        self.inner.lock().issued_for(&key, session.session_id());

        let deferred = self.inner.lock().deferred.remove(&key).unwrap_or_default();
        let had_deferred = !deferred.is_empty();
        for op in deferred {
            match op {
                DeferredOp::Subscribe { node, pattern } => {
                    if let Err(e) = self.activate_subscription(&key, &session, &node, &pattern).await
                    {
                        warn!(endpoint = %key, pattern = %pattern, error = %e, "Replaying parked subscription failed");
                        self.defer_subscribe(&key, node, &pattern);
                    }
                    tokio::time::sleep(self.tuning.resubscribe_gap).await;
                }
            }
        }
        if had_deferred {
            debug!(endpoint = %key, "Parked subscriptions replayed");
        }

        // surviving patterns not covered by the replay above
        let patterns: Vec<String> = {
            let inner = self.inner.lock();
            let issued = inner.issued.get(&key);
            inner
                .subscriptions
                .get(&key)
                .map(|patterns| {
                    patterns
                        .keys()
                        .filter(|p| issued.map_or(true, |set| !set.patterns.contains(*p)))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };

        for pattern in patterns {
            match session.subscribe_pattern(&pattern, self.tuning.subscribe_timeout).await {
                Ok(()) => {
                    self.inner
                        .lock()
                        .issued_for(&key, session.session_id())
                        .patterns
                        .insert(pattern.clone());
                    self.notify_resubscribed(&key, &session, &pattern);
                }
                Err(e) => {
                    warn!(endpoint = %key, pattern = %pattern, error = %e, "Resubscribe failed");
                }
            }
            tokio::time::sleep(self.tuning.resubscribe_gap).await;
        }

        let logs_wanted = {
            let inner = self.inner.lock();
            inner
                .registrations
                .values()
                .any(|r| r.kind == ConsumerKind::Log && r.key == key)
        };
        if logs_wanted {
            let _ = session.send("requireLog", vec![json!(true)]);
        }

        info!(endpoint = %key, "Endpoint re-armed");
    }

    fn notify_resubscribed(
        &self,
        key: &EndpointKey,
        session: &Arc<SessionClient>,
        pattern: &str,
    ) {
        let members: Vec<ConsumerHooks> = {
            let inner = self.inner.lock();
            inner
                .subscriptions
                .get(key)
                .and_then(|patterns| patterns.get(pattern))
                .map(|nodes| {
                    nodes.iter().filter_map(|node| inner.hooks.get(node).cloned()).collect()
                })
                .unwrap_or_default()
        };
        for hooks in members {
            if let Some(confirm) = &hooks.on_subscribed {
                let confirm = confirm.clone();
                guarded(|| confirm());
            }
            if hooks.wants_initial_value && !pattern.contains('*') {
                self.spawn_initial_value(session.clone(), pattern.to_string(), hooks);
            }
        }
    }

    // -- Introspection & teardown -------------------------------------------

    /// Number of distinct patterns tracked for an endpoint.
    pub fn pattern_count(&self, key: &EndpointKey) -> usize {
        self.inner.lock().subscriptions.get(key).map_or(0, HashMap::len)
    }

    pub fn is_registered(&self, node: &NodeId) -> bool {
        self.inner.lock().registrations.contains_key(node)
    }

    /// Drop every registration and index. Part of process shutdown.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.subscriptions.clear();
        inner.compiled.clear();
        inner.hooks.clear();
        inner.registrations.clear();
        inner.deferred.clear();
        inner.issued.clear();
    }
}
