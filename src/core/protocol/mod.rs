//! Framed-array wire protocol.
//!
//! Every message is a JSON array with a leading numeric type tag:
//!
//! - `[1]` ping, answered with `[2]` pong
//! - `[0, id, name, args?]` application message
//! - `[3, id, name, args]` callback request, answered as `[3, id, [err, ...]]`
//!
//! Anything that does not decode to one of these shapes is dropped by the
//! session; a malformed frame never takes the connection down.

mod pattern;

pub use pattern::SubscriptionPattern;

use serde_json::{json, Value};

/// Numeric frame type tags.
pub const MESSAGE: u64 = 0;
pub const PING: u64 = 1;
pub const PONG: u64 = 2;
pub const CALLBACK: u64 = 3;

/// Inbound application message names the dispatcher understands.
pub mod events {
    pub const READY: &str = "___ready___";
    pub const REAUTHENTICATE: &str = "reauthenticate";
    pub const STATE_CHANGE: &str = "stateChange";
    pub const OBJECT_CHANGE: &str = "objectChange";
    pub const LOG: &str = "log";
}

/// A decoded protocol frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Ping,
    Pong,
    /// `[0, id, name, args]` - fire-and-forget application message.
    Message { id: u64, name: String, args: Vec<Value> },
    /// `[3, id, name, args]` - request expecting a `[3, id, [..]]` reply.
    CallbackRequest { id: u64, name: String, args: Vec<Value> },
    /// `[3, id, args]` - reply to a previously issued request.
    CallbackResponse { id: u64, args: Vec<Value> },
}

impl Frame {
    /// Serialize to the wire representation.
    pub fn encode(&self) -> String {
        match self {
            Frame::Ping => "[1]".to_string(),
            Frame::Pong => "[2]".to_string(),
            Frame::Message { id, name, args } => json!([MESSAGE, id, name, args]).to_string(),
            Frame::CallbackRequest { id, name, args } => {
                json!([CALLBACK, id, name, args]).to_string()
            }
            Frame::CallbackResponse { id, args } => json!([CALLBACK, id, args]).to_string(),
        }
    }

    /// Parse a wire frame.
    ///
    /// Returns `None` for anything that is not a well-formed protocol array;
    /// callers log and drop those.
    pub fn decode(text: &str) -> Option<Frame> {
        let value: Value = serde_json::from_str(text).ok()?;
        let arr = value.as_array()?;
        let tag = arr.first()?.as_u64()?;
        match tag {
            PING if arr.len() == 1 => Some(Frame::Ping),
            PONG if arr.len() == 1 => Some(Frame::Pong),
            MESSAGE => {
                // Tolerate both `[0, id, name, args]` and `[0, name, args]`.
                if let Some(name) = arr.get(1).and_then(Value::as_str) {
                    return Some(Frame::Message {
                        id: 0,
                        name: name.to_string(),
                        args: decode_args(arr.get(2)),
                    });
                }
                let id = arr.get(1)?.as_u64()?;
                let name = arr.get(2)?.as_str()?.to_string();
                Some(Frame::Message { id, name, args: decode_args(arr.get(3)) })
            }
            CALLBACK => {
                let id = arr.get(1)?.as_u64()?;
                match arr.get(2)? {
                    Value::String(name) => Some(Frame::CallbackRequest {
                        id,
                        name: name.clone(),
                        args: decode_args(arr.get(3)),
                    }),
                    Value::Array(args) => Some(Frame::CallbackResponse { id, args: args.clone() }),
                    _ => None,
                }
            }
            _ => None,
        }
    }
}

/// Normalize the trailing args position into a list.
fn decode_args(value: Option<&Value>) -> Vec<Value> {
    match value {
        Some(Value::Array(items)) => items.clone(),
        Some(other) => vec![other.clone()],
        None => Vec::new(),
    }
}
