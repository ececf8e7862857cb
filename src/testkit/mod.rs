//! Mocks for exercising the session, pool, and gateway without a network.
//!
//! - [`MockEndpoint`] — a scripted remote server behind the [`Connector`]
//!   seam: it answers the wire protocol (ready gate, subscribe, reads,
//!   writes, RPC), records everything the client sent, and can push events
//!   or kill the connection on demand.
//! - [`StaticTokens`] — a scripted [`TokenFetcher`] for auth flows.
//!
//! [`Connector`]: crate::core::session::Connector
//! [`TokenFetcher`]: crate::core::auth::TokenFetcher

mod auth;
mod endpoint;

pub use auth::StaticTokens;
pub use endpoint::MockEndpoint;
