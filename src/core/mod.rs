//! Reusable components of the connection substrate.
//!
//! Everything here is independent of how the hosting runtime drives the
//! gateway; the consumer-facing surface lives in [`crate::app`].

pub mod auth;
pub mod domain;
pub mod pool;
pub mod protocol;
pub mod recovery;
pub mod registry;
pub mod session;
