//! WebSocket session client.
//!
//! One [`SessionClient`] owns exactly one socket to one endpoint: it frames
//! messages, matches replies to requests, runs the heartbeat, gates on the
//! server's `___ready___` signal, and rotates tokens. A session is
//! single-shot - when the socket drops, the session ends and the pool
//! decides whether to build a new one.
//!
//! # Task model
//!
//! The socket is owned by a single run task that multiplexes inbound frames,
//! outbound commands, and heartbeat ticks through one `select!`. Everything
//! else talks to that task through its command channel; domain events flow
//! out through the event channel handed in by the pool.

mod pending;
pub mod transport;

pub use pending::PendingTable;
pub use transport::{ConnectRequest, Connector, Transport, WireMessage, WsConnector};

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::app::SessionTuning;
use crate::core::auth::TokenFetcher;
use crate::core::domain::{
    EndpointConfig, EndpointKey, LogEntry, SessionStats, StateValue,
};
use crate::core::protocol::{events, Frame};
use crate::error::{Error, Result};

/// Leeway subtracted from the ping interval when deciding whether the link
/// has been quiet long enough to warrant a ping.
const PING_SLACK_MS: u64 = 10;

/// Domain events a session reports to its owner.
#[derive(Debug)]
pub enum SessionEvent {
    /// The ready gate opened (initial connect or after a token rotation).
    Ready,
    StateChange { id: String, state: Option<StateValue> },
    ObjectChange { id: String, object: Option<Value>, op: Option<String> },
    Log(LogEntry),
    TokenRefresh { old_session_id: u64, new_session_id: u64 },
    /// The socket ended; this session is finished.
    Disconnected { reason: String },
}

enum Command {
    Send(String),
    /// Close the current socket and hand the session a fresh one opened
    /// with the rotated token.
    Rotate { request: ConnectRequest, ready_tx: oneshot::Sender<std::result::Result<(), String>> },
    Close,
}

/// State shared between the session handle, its run task, and token
/// rotation.
struct Shared {
    key: EndpointKey,
    connected: AtomicBool,
    destroyed: AtomicBool,
    finished: AtomicBool,
    session_id: AtomicU64,
    last_inbound_ms: AtomicU64,
    frames_in: AtomicU64,
    frames_out: AtomicU64,
    token_rotations: AtomicU32,
    token: Mutex<Option<String>>,
    pending: Mutex<PendingTable>,
    /// Outbound frames queued while the ready gate is shut.
    queue: Mutex<Vec<String>>,
}

/// Everything token rotation needs; shared by the proactive refresh timer,
/// the inbound `reauthenticate` handler, and explicit callers.
struct RefreshCtx {
    config: EndpointConfig,
    tuning: SessionTuning,
    auth: Arc<dyn TokenFetcher>,
    connector: Arc<dyn Connector>,
    shared: Arc<Shared>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    guard: tokio::sync::Mutex<()>,
    last_rotation_ms: AtomicU64,
}

fn now_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

/// Assemble the URL and identity headers for one handshake attempt.
fn build_connect_request(
    config: &EndpointConfig,
    tuning: &SessionTuning,
    session_id: u64,
    token: Option<&str>,
) -> ConnectRequest {
    let mut url = format!(
        "{}://{}:{}/?sid={}&name={}",
        config.ws_scheme(),
        config.host,
        config.port,
        session_id,
        tuning.client_name
    );
    let mut headers = vec![
        (
            "Origin".to_string(),
            format!("{}://{}:{}", config.http_scheme(), config.host, config.port),
        ),
        (
            "User-Agent".to_string(),
            format!("iobridge/{}", env!("CARGO_PKG_VERSION")),
        ),
    ];
    match token {
        Some(token) => {
            url.push_str(&format!("&token={token}"));
            headers.push(("Authorization".to_string(), format!("Bearer {token}")));
            headers.push((
                "Cookie".to_string(),
                format!("access_token={token}; io={session_id}"),
            ));
        }
        None => headers.push(("Cookie".to_string(), format!("io={session_id}"))),
    }
    ConnectRequest {
        url,
        headers,
        handshake_timeout: tuning.connect_timeout(),
        allow_self_signed: tuning.allow_self_signed,
    }
}

// ---------------------------------------------------------------------------
// SessionClient
// ---------------------------------------------------------------------------

/// Handle to one live session.
pub struct SessionClient {
    shared: Arc<Shared>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    refresh: Arc<RefreshCtx>,
    refresh_timer: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for SessionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionClient")
            .field("key", &self.shared.key)
            .field("session_id", &self.session_id())
            .finish()
    }
}

impl SessionClient {
    /// Open a session and wait for the server's ready signal.
    ///
    /// Fetches a token when the endpoint has credentials, stamps a fresh
    /// session id, opens the socket, then blocks on the ready gate with the
    /// same timeout as the handshake.
    pub async fn connect(
        config: EndpointConfig,
        tuning: SessionTuning,
        auth: Arc<dyn TokenFetcher>,
        connector: Arc<dyn Connector>,
        events_tx: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Arc<SessionClient>> {
        let key = config.key();
        let token = if config.authenticated() {
            Some(auth.fetch_token(&config).await?.token)
        } else {
            None
        };

        let session_id = now_ms();
        let shared = Arc::new(Shared {
            key: key.clone(),
            connected: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            session_id: AtomicU64::new(session_id),
            last_inbound_ms: AtomicU64::new(now_ms()),
            frames_in: AtomicU64::new(0),
            frames_out: AtomicU64::new(0),
            token_rotations: AtomicU32::new(0),
            token: Mutex::new(token.clone()),
            pending: Mutex::new(PendingTable::new(tuning.callback_expiry())),
            queue: Mutex::new(Vec::new()),
        });

        let request = build_connect_request(&config, &tuning, session_id, token.as_deref());
        let transport = connector.connect(&request).await?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let refresh = Arc::new(RefreshCtx {
            config,
            tuning: tuning.clone(),
            auth,
            connector,
            shared: shared.clone(),
            cmd_tx: cmd_tx.clone(),
            events_tx: events_tx.clone(),
            guard: tokio::sync::Mutex::new(()),
            last_rotation_ms: AtomicU64::new(0),
        });

        let (ready_tx, ready_rx) = oneshot::channel();
        let run = RunTask {
            transport,
            cmd_rx,
            shared: shared.clone(),
            events_tx,
            refresh: refresh.clone(),
            ping_interval: tuning.ping_interval(),
            pong_timeout: tuning.pong_timeout(),
            ready_waiter: Some(ready_tx),
        };
        tokio::spawn(run.run());

        match tokio::time::timeout(tuning.connect_timeout(), ready_rx).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(reason))) => return Err(Error::HandshakeClosed(reason)),
            Ok(Err(_)) => return Err(Error::HandshakeClosed("session task ended".to_string())),
            Err(_) => {
                let _ = cmd_tx.send(Command::Close);
                return Err(Error::ReadySignalTimeout(tuning.connect_timeout()));
            }
        }

        let client = Arc::new(SessionClient {
            shared,
            cmd_tx,
            refresh,
            refresh_timer: Mutex::new(None),
        });
        if token.is_some() {
            client.spawn_refresh_timer();
        }
        info!(endpoint = %key, session_id, "Session ready");
        Ok(client)
    }

    pub fn key(&self) -> &EndpointKey {
        &self.shared.key
    }

    pub fn session_id(&self) -> u64 {
        self.shared.session_id.load(Ordering::SeqCst)
    }

    pub fn is_ready(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
            && !self.shared.destroyed.load(Ordering::SeqCst)
    }

    /// Whether the session currently holds a bearer token.
    pub fn has_token(&self) -> bool {
        self.shared.token.lock().is_some()
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            session_id: self.session_id(),
            frames_in: self.shared.frames_in.load(Ordering::Relaxed),
            frames_out: self.shared.frames_out.load(Ordering::Relaxed),
            pending_callbacks: self.shared.pending.lock().len(),
            queued_sends: self.shared.queue.lock().len(),
            token_rotations: self.shared.token_rotations.load(Ordering::Relaxed),
        }
    }

    /// Fire-and-forget `[0, id, name, args]`. No reply slot is created.
    ///
    /// Queued while the ready gate is shut; rejected once the session ended.
    pub fn send(&self, name: &str, args: Vec<Value>) -> Result<()> {
        if self.shared.destroyed.load(Ordering::SeqCst) {
            return Err(Error::Destroyed);
        }
        let id = self.shared.pending.lock().next_message_id();
        let frame = Frame::Message { id, name: name.to_string(), args }.encode();
        self.dispatch(frame)
    }

    /// Issue `[3, id, name, args]` and await the reply args.
    pub async fn request(&self, name: &str, args: Vec<Value>, timeout: Duration) -> Result<Vec<Value>> {
        if self.shared.destroyed.load(Ordering::SeqCst) {
            return Err(Error::Destroyed);
        }
        let (id, rx) = self.shared.pending.lock().register();
        let frame = Frame::CallbackRequest { id, name: name.to_string(), args }.encode();
        self.dispatch(frame)?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(args)) => Ok(args),
            // sender dropped: swept, cleared on disconnect, or reset on rotation
            Ok(Err(_)) => Err(Error::NotConnected),
            Err(_) => Err(Error::Timeout(timeout)),
        }
    }

    fn dispatch(&self, frame: String) -> Result<()> {
        if self.shared.finished.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }
        if self.shared.connected.load(Ordering::SeqCst) {
            self.cmd_tx.send(Command::Send(frame)).map_err(|_| Error::NotConnected)
        } else {
            self.shared.queue.lock().push(frame);
            Ok(())
        }
    }

    /// `subscribe(pattern)` with reply confirmation.
    pub async fn subscribe_pattern(&self, pattern: &str, timeout: Duration) -> Result<()> {
        let args = self.request("subscribe", vec![Value::String(pattern.to_string())], timeout).await?;
        expect_reply(args).map(|_| ())
    }

    pub async fn unsubscribe_pattern(&self, pattern: &str, timeout: Duration) -> Result<()> {
        let args = self
            .request("unsubscribe", vec![Value::String(pattern.to_string())], timeout)
            .await?;
        expect_reply(args).map(|_| ())
    }

    /// Read one state; `None` when the id does not exist.
    pub async fn get_state(&self, id: &str, timeout: Duration) -> Result<Option<StateValue>> {
        let args = self.request("getState", vec![Value::String(id.to_string())], timeout).await?;
        let mut results = expect_reply(args)?;
        if results.is_empty() {
            return Ok(None);
        }
        Ok(StateValue::from_wire(results.remove(0)))
    }

    /// Rotate the access token and rebuild the socket under the session.
    ///
    /// Serialized by a single-flight guard; a caller that lost the race to a
    /// rotation that just finished returns without doing a second one.
    pub async fn refresh_token(&self) -> Result<()> {
        refresh_token(&self.refresh).await
    }

    /// Tear the session down: cancel timers, drop pending work, close the
    /// socket with a normal close.
    pub fn close(&self) {
        if self.shared.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.refresh_timer.lock().take() {
            handle.abort();
        }
        self.shared.pending.lock().clear();
        self.shared.queue.lock().clear();
        let _ = self.cmd_tx.send(Command::Close);
    }

    fn spawn_refresh_timer(&self) {
        let ctx = self.refresh.clone();
        let interval = ctx.tuning.token_refresh_interval();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if ctx.shared.destroyed.load(Ordering::SeqCst)
                    || ctx.shared.finished.load(Ordering::SeqCst)
                {
                    break;
                }
                if let Err(e) = refresh_token(&ctx).await {
                    warn!(endpoint = %ctx.shared.key, error = %e, "Scheduled token refresh failed");
                    // a full reconnect is the pool's job; end the session
                    let _ = ctx.cmd_tx.send(Command::Close);
                    break;
                }
            }
        });
        *self.refresh_timer.lock() = Some(handle);
    }
}

impl Drop for SessionClient {
    fn drop(&mut self) {
        self.close();
    }
}

/// Split an ioBroker-style reply (`[err, ...results]`) into its results.
pub fn expect_reply(mut args: Vec<Value>) -> Result<Vec<Value>> {
    if args.is_empty() {
        return Ok(args);
    }
    let err = args.remove(0);
    match err {
        Value::Null | Value::Bool(false) => Ok(args),
        other => Err(Error::Server(error_text(&other))),
    }
}

/// Render a server-side error payload as text.
pub fn error_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Object(map) => map
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| value.to_string()),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Token rotation
// ---------------------------------------------------------------------------

async fn refresh_token(ctx: &Arc<RefreshCtx>) -> Result<()> {
    let entered_at = now_ms();
    let _guard = ctx.guard.lock().await;
    if ctx.last_rotation_ms.load(Ordering::SeqCst) >= entered_at {
        // another caller rotated while we waited for the guard
        return Ok(());
    }

    let token = ctx.auth.fetch_token(&ctx.config).await?.token;

    let old_session_id = ctx.shared.session_id.load(Ordering::SeqCst);
    let new_session_id = now_ms().max(old_session_id + 1);
    ctx.shared.session_id.store(new_session_id, Ordering::SeqCst);
    *ctx.shared.token.lock() = Some(token.clone());
    ctx.shared.pending.lock().reset();

    if !ctx.shared.finished.load(Ordering::SeqCst) {
        let request =
            build_connect_request(&ctx.config, &ctx.tuning, new_session_id, Some(&token));
        let (ready_tx, ready_rx) = oneshot::channel();
        ctx.cmd_tx
            .send(Command::Rotate { request, ready_tx })
            .map_err(|_| Error::NotConnected)?;
        match tokio::time::timeout(ctx.tuning.connect_timeout(), ready_rx).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(reason))) => return Err(Error::HandshakeClosed(reason)),
            Ok(Err(_)) => return Err(Error::NotConnected),
            Err(_) => {
                let _ = ctx.cmd_tx.send(Command::Close);
                return Err(Error::ReadySignalTimeout(ctx.tuning.connect_timeout()));
            }
        }
    }

    ctx.last_rotation_ms.store(now_ms(), Ordering::SeqCst);
    ctx.shared.token_rotations.fetch_add(1, Ordering::Relaxed);
    info!(endpoint = %ctx.shared.key, old_session_id, new_session_id, "Token rotated");
    let _ = ctx
        .events_tx
        .send(SessionEvent::TokenRefresh { old_session_id, new_session_id });
    Ok(())
}

// ---------------------------------------------------------------------------
// Run task
// ---------------------------------------------------------------------------

struct RunTask {
    transport: Box<dyn Transport>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    shared: Arc<Shared>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    refresh: Arc<RefreshCtx>,
    ping_interval: Duration,
    pong_timeout: Duration,
    ready_waiter: Option<oneshot::Sender<std::result::Result<(), String>>>,
}

impl RunTask {
    async fn run(mut self) {
        let mut heartbeat = tokio::time::interval(self.ping_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reason = loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::Send(text)) => {
                        if let Err(e) = self.transport.send_text(text).await {
                            break format!("send failed: {e}");
                        }
                        self.shared.frames_out.fetch_add(1, Ordering::Relaxed);
                    }
                    Some(Command::Rotate { request, ready_tx }) => {
                        match self.rotate(request).await {
                            Ok(()) => self.ready_waiter = Some(ready_tx),
                            Err(e) => {
                                let reason = format!("socket rotation failed: {e}");
                                let _ = ready_tx.send(Err(reason.clone()));
                                break reason;
                            }
                        }
                    }
                    Some(Command::Close) | None => break "closed".to_string(),
                },
                item = self.transport.next_message() => match item {
                    Some(Ok(WireMessage::Text(text))) => {
                        self.shared.frames_in.fetch_add(1, Ordering::Relaxed);
                        self.shared.last_inbound_ms.store(now_ms(), Ordering::Relaxed);
                        if let Err(reason) = self.handle_text(&text).await {
                            break reason;
                        }
                    }
                    Some(Ok(WireMessage::Closed { code, reason })) => {
                        break match code {
                            Some(code) => format!("closed by peer ({code}): {reason}"),
                            None if reason.is_empty() => "connection closed".to_string(),
                            None => format!("connection closed: {reason}"),
                        };
                    }
                    Some(Err(e)) => break format!("socket error: {e}"),
                    None => break "stream ended".to_string(),
                },
                _ = heartbeat.tick() => {
                    if let Some(reason) = self.heartbeat_tick().await {
                        break reason;
                    }
                }
            }
        };

        self.finish(reason).await;
    }

    /// Detach the current socket quietly and attach the freshly opened one.
    async fn rotate(&mut self, request: ConnectRequest) -> Result<()> {
        self.shared.connected.store(false, Ordering::SeqCst);
        let _ = self.transport.close().await;
        let transport = self.refresh.connector.connect(&request).await?;
        self.transport = transport;
        self.shared.last_inbound_ms.store(now_ms(), Ordering::Relaxed);
        debug!(endpoint = %self.shared.key, "Socket rotated, awaiting ready");
        Ok(())
    }

    /// Decode and dispatch one inbound text frame. `Err` carries the close
    /// reason when the frame forces the session down.
    async fn handle_text(&mut self, text: &str) -> std::result::Result<(), String> {
        let Some(frame) = Frame::decode(text) else {
            warn!(endpoint = %self.shared.key, raw = %text, "Dropping undecodable frame");
            return Ok(());
        };
        match frame {
            Frame::Ping => {
                self.transport
                    .send_text(Frame::Pong.encode())
                    .await
                    .map_err(|e| format!("pong failed: {e}"))?;
                self.shared.frames_out.fetch_add(1, Ordering::Relaxed);
            }
            Frame::Pong => {}
            Frame::Message { name, args, .. } => self.handle_message(&name, args).await?,
            Frame::CallbackResponse { id, args } => {
                self.shared.pending.lock().complete(id, args);
            }
            Frame::CallbackRequest { id, name, .. } => {
                debug!(endpoint = %self.shared.key, id, name = %name, "Ignoring peer callback request");
            }
        }
        Ok(())
    }

    async fn handle_message(
        &mut self,
        name: &str,
        args: Vec<Value>,
    ) -> std::result::Result<(), String> {
        match name {
            events::READY => {
                self.shared.connected.store(true, Ordering::SeqCst);
                self.flush_queue().await?;
                if let Some(waiter) = self.ready_waiter.take() {
                    let _ = waiter.send(Ok(()));
                }
                let _ = self.events_tx.send(SessionEvent::Ready);
            }
            events::REAUTHENTICATE => {
                info!(endpoint = %self.shared.key, "Server requested reauthentication");
                let ctx = self.refresh.clone();
                tokio::spawn(async move {
                    if let Err(e) = refresh_token(&ctx).await {
                        warn!(endpoint = %ctx.shared.key, error = %e, "Reauthentication failed");
                        let _ = ctx.cmd_tx.send(Command::Close);
                    }
                });
            }
            events::STATE_CHANGE => {
                let mut args = args.into_iter();
                let Some(id) = args.next().and_then(|v| v.as_str().map(str::to_string)) else {
                    return Ok(());
                };
                let state = args.next().and_then(StateValue::from_wire);
                let _ = self.events_tx.send(SessionEvent::StateChange { id, state });
            }
            events::OBJECT_CHANGE => {
                let mut args = args.into_iter();
                let Some(id) = args.next().and_then(|v| v.as_str().map(str::to_string)) else {
                    return Ok(());
                };
                let object = args.next().filter(|v| !v.is_null());
                let op = args.next().and_then(|v| v.as_str().map(str::to_string));
                let _ = self.events_tx.send(SessionEvent::ObjectChange { id, object, op });
            }
            events::LOG => {
                if let Some(first) = args.into_iter().next() {
                    let entry = match serde_json::from_value::<LogEntry>(first.clone()) {
                        Ok(entry) => entry,
                        Err(_) => LogEntry {
                            severity: "info".to_string(),
                            message: error_text(&first),
                            from: None,
                            ts: crate::core::domain::now_millis(),
                        },
                    };
                    let _ = self.events_tx.send(SessionEvent::Log(entry));
                }
            }
            other => {
                debug!(endpoint = %self.shared.key, name = %other, "Unhandled message");
            }
        }
        Ok(())
    }

    /// Send frames queued before the ready gate opened, in insertion order.
    async fn flush_queue(&mut self) -> std::result::Result<(), String> {
        let queued: Vec<String> = std::mem::take(&mut *self.shared.queue.lock());
        if queued.is_empty() {
            return Ok(());
        }
        debug!(endpoint = %self.shared.key, count = queued.len(), "Flushing queued frames");
        for frame in queued {
            self.transport
                .send_text(frame)
                .await
                .map_err(|e| format!("flush failed: {e}"))?;
            self.shared.frames_out.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Ping when the link has been quiet; close when the quiet exceeds the
    /// pong timeout.
    async fn heartbeat_tick(&mut self) -> Option<String> {
        if !self.shared.connected.load(Ordering::SeqCst) {
            return None;
        }
        let now = now_ms();
        let last = self.shared.last_inbound_ms.load(Ordering::Relaxed);
        let silent_ms = now.saturating_sub(last);
        if silent_ms > self.pong_timeout.as_millis() as u64 {
            return Some(format!("heartbeat timeout after {silent_ms}ms of silence"));
        }
        if silent_ms + PING_SLACK_MS > self.ping_interval.as_millis() as u64 {
            if let Err(e) = self.transport.send_text(Frame::Ping.encode()).await {
                return Some(format!("ping failed: {e}"));
            }
            self.shared.frames_out.fetch_add(1, Ordering::Relaxed);
        }
        None
    }

    async fn finish(mut self, reason: String) {
        info!(endpoint = %self.shared.key, reason = %reason, "Session ended");
        self.shared.connected.store(false, Ordering::SeqCst);
        self.shared.finished.store(true, Ordering::SeqCst);
        self.shared.pending.lock().clear();
        if let Some(waiter) = self.ready_waiter.take() {
            let _ = waiter.send(Err(reason.clone()));
        }
        let _ = self.transport.close().await;
        let _ = self.events_tx.send(SessionEvent::Disconnected { reason });
    }
}
