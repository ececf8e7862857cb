//! Payload types carried over the wire: states and live log entries.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current time as epoch milliseconds, the timestamp unit the server uses.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// An ioBroker state object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateValue {
    pub val: Value,
    #[serde(default)]
    pub ack: bool,
    #[serde(default = "now_millis")]
    pub ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// Last-changed timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lc: Option<i64>,
    /// Quality code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub q: Option<i64>,
}

impl StateValue {
    /// Wrap a bare value into a full state object for a write.
    pub fn wrap(val: Value, ack: bool) -> Self {
        Self {
            val,
            ack,
            ts: now_millis(),
            from: Some("system.adapter.node-red".to_string()),
            lc: None,
            q: None,
        }
    }

    /// Interpret a wire payload as a state.
    ///
    /// `null` means the state does not exist. A JSON object with a `val`
    /// field is a state object; anything else is treated as a bare value.
    pub fn from_wire(value: Value) -> Option<Self> {
        if value.is_null() {
            return None;
        }
        if value.is_object() && value.get("val").is_some() {
            if let Ok(state) = serde_json::from_value::<StateValue>(value.clone()) {
                return Some(state);
            }
        }
        Some(Self {
            val: value,
            ack: false,
            ts: now_millis(),
            from: None,
            lc: None,
            q: None,
        })
    }
}

/// Severity of a live log entry. Ordering matches the server's logger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Silly,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Parse a severity label; unknown labels degrade to `Info`.
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "silly" => Self::Silly,
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" | "warning" => Self::Warn,
            "error" => Self::Error,
            _ => Self::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Silly => "silly",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// One live log line pushed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(default)]
    pub severity: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default = "now_millis")]
    pub ts: i64,
}

impl LogEntry {
    pub fn level(&self) -> LogLevel {
        LogLevel::parse(&self.severity)
    }
}
