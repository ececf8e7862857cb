//! A scripted remote endpoint behind the transport seam.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::core::protocol::{events, Frame};
use crate::core::session::{ConnectRequest, Connector, Transport, WireMessage};
use crate::error::{Error, Result};

struct Inner {
    auto_ready: bool,
    ready_delay: Mutex<Duration>,
    response_delay: Mutex<Duration>,
    /// Scripted connect failures, consumed front to back.
    fail_connects: Mutex<VecDeque<String>>,
    states: Mutex<HashMap<String, Value>>,
    objects: Mutex<HashMap<String, Value>>,
    sendto_replies: Mutex<VecDeque<Value>>,
    /// Whether protocol pings are answered; off simulates a stalled server.
    respond_to_pings: AtomicBool,
    // observed traffic
    connects: AtomicU32,
    pings: AtomicU32,
    subscribes: Mutex<Vec<String>>,
    unsubscribes: Mutex<Vec<String>>,
    requests: Mutex<Vec<(u64, String, Vec<Value>)>>,
    messages: Mutex<Vec<(String, Vec<Value>)>>,
    last_request: Mutex<Option<ConnectRequest>>,
    /// Sender feeding the currently live transport.
    current: Mutex<Option<mpsc::UnboundedSender<WireMessage>>>,
}

/// A scripted server: implements [`Connector`], answers the protocol, and
/// exposes handles to push events or kill the connection.
#[derive(Clone)]
pub struct MockEndpoint {
    inner: Arc<Inner>,
}

impl Default for MockEndpoint {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEndpoint {
    pub fn new() -> Self {
        Self::with_auto_ready(true)
    }

    /// A server that never sends `___ready___`.
    pub fn silent() -> Self {
        Self::with_auto_ready(false)
    }

    fn with_auto_ready(auto_ready: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                auto_ready,
                ready_delay: Mutex::new(Duration::ZERO),
                response_delay: Mutex::new(Duration::ZERO),
                fail_connects: Mutex::new(VecDeque::new()),
                states: Mutex::new(HashMap::new()),
                objects: Mutex::new(HashMap::new()),
                sendto_replies: Mutex::new(VecDeque::new()),
                respond_to_pings: AtomicBool::new(true),
                connects: AtomicU32::new(0),
                pings: AtomicU32::new(0),
                subscribes: Mutex::new(Vec::new()),
                unsubscribes: Mutex::new(Vec::new()),
                requests: Mutex::new(Vec::new()),
                messages: Mutex::new(Vec::new()),
                last_request: Mutex::new(None),
                current: Mutex::new(None),
            }),
        }
    }

    // -- Scripting -----------------------------------------------------------

    pub fn set_ready_delay(&self, delay: Duration) {
        *self.inner.ready_delay.lock() = delay;
    }

    pub fn set_response_delay(&self, delay: Duration) {
        *self.inner.response_delay.lock() = delay;
    }

    /// Make the next connect attempts fail with the given messages.
    pub fn fail_next_connects(&self, messages: &[&str]) {
        let mut queue = self.inner.fail_connects.lock();
        for message in messages {
            queue.push_back((*message).to_string());
        }
    }

    pub fn set_state(&self, id: &str, state: Value) {
        self.inner.states.lock().insert(id.to_string(), state);
    }

    pub fn set_object(&self, id: &str, object: Value) {
        self.inner.objects.lock().insert(id.to_string(), object);
    }

    pub fn push_sendto_reply(&self, reply: Value) {
        self.inner.sendto_replies.lock().push_back(reply);
    }

    /// Stop answering protocol pings; the client's pong timeout should fire.
    pub fn stop_answering_pings(&self) {
        self.inner.respond_to_pings.store(false, Ordering::SeqCst);
    }

    // -- Live control --------------------------------------------------------

    /// Push a `stateChange` to the connected client.
    pub fn push_state_change(&self, id: &str, state: Value) {
        self.push_raw(
            Frame::Message {
                id: 0,
                name: events::STATE_CHANGE.to_string(),
                args: vec![json!(id), state],
            }
            .encode(),
        );
    }

    pub fn push_object_change(&self, id: &str, object: Value) {
        self.push_raw(
            Frame::Message {
                id: 0,
                name: events::OBJECT_CHANGE.to_string(),
                args: vec![json!(id), object],
            }
            .encode(),
        );
    }

    pub fn push_log(&self, severity: &str, message: &str) {
        self.push_raw(
            Frame::Message {
                id: 0,
                name: events::LOG.to_string(),
                args: vec![json!({"severity": severity, "message": message, "ts": 1})],
            }
            .encode(),
        );
    }

    pub fn push_reauthenticate(&self) {
        self.push_raw(
            Frame::Message { id: 0, name: events::REAUTHENTICATE.to_string(), args: vec![] }
                .encode(),
        );
    }

    pub fn push_raw(&self, text: String) {
        if let Some(sender) = self.inner.current.lock().as_ref() {
            let _ = sender.send(WireMessage::Text(text));
        }
    }

    /// Send a close frame and end the stream.
    pub fn close_connection(&self, code: u16, reason: &str) {
        if let Some(sender) = self.inner.current.lock().take() {
            let _ = sender.send(WireMessage::Closed { code: Some(code), reason: reason.to_string() });
        }
    }

    /// End the stream abruptly (network drop, no orderly close code).
    pub fn drop_connection(&self) {
        if let Some(sender) = self.inner.current.lock().take() {
            let _ = sender.send(WireMessage::Closed { code: None, reason: "connection reset".to_string() });
        }
    }

    // -- Observations --------------------------------------------------------

    pub fn connect_count(&self) -> u32 {
        self.inner.connects.load(Ordering::SeqCst)
    }

    pub fn ping_count(&self) -> u32 {
        self.inner.pings.load(Ordering::SeqCst)
    }

    pub fn subscribed_patterns(&self) -> Vec<String> {
        self.inner.subscribes.lock().clone()
    }

    pub fn unsubscribed_patterns(&self) -> Vec<String> {
        self.inner.unsubscribes.lock().clone()
    }

    /// All callback requests seen, as `(name, args)`.
    pub fn requests(&self) -> Vec<(String, Vec<Value>)> {
        self.inner.requests.lock().iter().map(|(_, n, a)| (n.clone(), a.clone())).collect()
    }

    pub fn request_count(&self, name: &str) -> usize {
        self.inner.requests.lock().iter().filter(|(_, n, _)| n == name).count()
    }

    /// Wire-level ids of the callback requests with this name, in order.
    pub fn request_ids(&self, name: &str) -> Vec<u64> {
        self.inner
            .requests
            .lock()
            .iter()
            .filter(|(_, n, _)| n == name)
            .map(|(id, _, _)| *id)
            .collect()
    }

    /// All fire-and-forget messages seen, as `(name, args)`.
    pub fn messages(&self) -> Vec<(String, Vec<Value>)> {
        self.inner.messages.lock().clone()
    }

    /// The connect request of the most recent attempt.
    pub fn last_connect_request(&self) -> Option<ConnectRequest> {
        self.inner.last_request.lock().clone()
    }
}

#[async_trait]
impl Connector for MockEndpoint {
    async fn connect(&self, request: &ConnectRequest) -> Result<Box<dyn Transport>> {
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        *self.inner.last_request.lock() = Some(request.clone());

        if let Some(message) = self.inner.fail_connects.lock().pop_front() {
            return Err(Error::Server(message));
        }

        let (server_tx, client_rx) = mpsc::unbounded_channel::<WireMessage>();
        let (client_tx, server_rx) = mpsc::unbounded_channel::<String>();
        *self.inner.current.lock() = Some(server_tx.clone());

        tokio::spawn(responder(self.inner.clone(), server_tx, server_rx));

        Ok(Box::new(ChannelTransport { rx: client_rx, tx: client_tx }))
    }
}

/// Server half: answers the client's frames per the scripted tables.
async fn responder(
    inner: Arc<Inner>,
    server_tx: mpsc::UnboundedSender<WireMessage>,
    mut server_rx: mpsc::UnboundedReceiver<String>,
) {
    if inner.auto_ready {
        let delay = *inner.ready_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let ready = Frame::Message { id: 0, name: events::READY.to_string(), args: vec![] };
        let _ = server_tx.send(WireMessage::Text(ready.encode()));
    }

    while let Some(text) = server_rx.recv().await {
        let Some(frame) = Frame::decode(&text) else { continue };
        match frame {
            Frame::Ping => {
                inner.pings.fetch_add(1, Ordering::SeqCst);
                if inner.respond_to_pings.load(Ordering::SeqCst) {
                    let _ = server_tx.send(WireMessage::Text(Frame::Pong.encode()));
                }
            }
            Frame::Pong => {}
            Frame::Message { name, args, .. } => {
                inner.messages.lock().push((name, args));
            }
            Frame::CallbackRequest { id, name, args } => {
                inner.requests.lock().push((id, name.clone(), args.clone()));
                let delay = *inner.response_delay.lock();
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let reply = answer(&inner, &name, &args);
                let _ = server_tx
                    .send(WireMessage::Text(Frame::CallbackResponse { id, args: reply }.encode()));
            }
            Frame::CallbackResponse { .. } => {}
        }
    }
}

fn answer(inner: &Inner, name: &str, args: &[Value]) -> Vec<Value> {
    let first_str = args.first().and_then(Value::as_str).unwrap_or_default();
    match name {
        "subscribe" => {
            inner.subscribes.lock().push(first_str.to_string());
            vec![Value::Null]
        }
        "unsubscribe" => {
            inner.unsubscribes.lock().push(first_str.to_string());
            vec![Value::Null]
        }
        "getState" => {
            let state = inner.states.lock().get(first_str).cloned().unwrap_or(Value::Null);
            vec![Value::Null, state]
        }
        "getStates" => {
            let map: serde_json::Map<String, Value> =
                inner.states.lock().iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            vec![Value::Null, Value::Object(map)]
        }
        "setState" => {
            if let Some(state) = args.get(1) {
                inner.states.lock().insert(first_str.to_string(), state.clone());
            }
            vec![Value::Null]
        }
        "getObject" => {
            let object = inner.objects.lock().get(first_str).cloned().unwrap_or(Value::Null);
            vec![Value::Null, object]
        }
        "getObjects" => {
            let map: serde_json::Map<String, Value> =
                inner.objects.lock().iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            vec![Value::Null, Value::Object(map)]
        }
        "getObjectView" => {
            vec![Value::Null, json!({"rows": []})]
        }
        "sendTo" => {
            let reply = inner.sendto_replies.lock().pop_front().unwrap_or_else(|| json!({}));
            vec![reply]
        }
        _ => vec![Value::Null],
    }
}

struct ChannelTransport {
    rx: mpsc::UnboundedReceiver<WireMessage>,
    tx: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.tx.send(text).map_err(|_| Error::NotConnected)
    }

    async fn next_message(&mut self) -> Option<Result<WireMessage>> {
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<()> {
        self.rx.close();
        Ok(())
    }
}
