//! Scripted token fetchers.

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::Utc;

use crate::core::auth::{AccessToken, TokenFetcher};
use crate::core::domain::EndpointConfig;
use crate::error::{Error, Result};

enum Behavior {
    /// Hand out `prefix-N` tokens, N counting from 1.
    Sequence { prefix: String },
    /// Fail every fetch with an auth error.
    Reject { status: u16, body: String },
    /// Must never be called (unauthenticated endpoints).
    Unused,
}

/// A [`TokenFetcher`] with scripted behavior and a fetch counter.
pub struct StaticTokens {
    behavior: Behavior,
    fetches: AtomicU32,
}

impl StaticTokens {
    /// Every fetch succeeds with a fresh `prefix-N` token.
    pub fn sequence(prefix: &str) -> Self {
        Self {
            behavior: Behavior::Sequence { prefix: prefix.to_string() },
            fetches: AtomicU32::new(0),
        }
    }

    /// Every fetch fails with the given status and body.
    pub fn rejecting(status: u16, body: &str) -> Self {
        Self {
            behavior: Behavior::Reject { status, body: body.to_string() },
            fetches: AtomicU32::new(0),
        }
    }

    /// Panics the test (via error) if the fetcher is ever used.
    pub fn unused() -> Self {
        Self { behavior: Behavior::Unused, fetches: AtomicU32::new(0) }
    }

    pub fn fetch_count(&self) -> u32 {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenFetcher for StaticTokens {
    async fn fetch_token(&self, _config: &EndpointConfig) -> Result<AccessToken> {
        let n = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
        match &self.behavior {
            Behavior::Sequence { prefix } => Ok(AccessToken {
                token: format!("{prefix}-{n}"),
                fetched_at: Utc::now(),
            }),
            Behavior::Reject { status, body } => {
                Err(Error::Auth { status: *status, body: body.clone() })
            }
            Behavior::Unused => {
                Err(Error::Config("token fetcher used by an unauthenticated test".to_string()))
            }
        }
    }
}
