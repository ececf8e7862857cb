//! iobridge - shared WebSocket session substrate for ioBroker flow integrations.
//!
//! Many independent flow nodes share a small number of long-lived WebSocket
//! sessions to remote ioBroker servers. This crate owns the connection and
//! multiplexing substrate behind that sharing: authentication, framing,
//! request/response matching, heartbeats, per-endpoint pooling, retry
//! scheduling, and subscription fan-out.
//!
//! # Architecture
//!
//! ```text
//! src/
//! ├── core/             # Reusable library components
//! │   ├── domain/       # Endpoint identity, state machine, payload types
//! │   ├── protocol/     # Framed-array codec + subscription patterns
//! │   ├── auth/         # OAuth2 password-grant token client
//! │   ├── session/      # One WebSocket session (framing, heartbeat, callbacks)
//! │   ├── pool/         # One session per endpoint, single-flight connect
//! │   ├── recovery/     # Retry scheduling + error classification
//! │   └── registry/     # Consumer registry and event fan-out
//! └── app/              # Configuration and the consumer-facing gateway
//! ```
//!
//! # Features
//!
//! - `testkit` - Mock transports and a scripted endpoint for tests

pub mod app;
pub mod core;
pub mod error;

#[cfg(feature = "testkit")]
pub mod testkit;
