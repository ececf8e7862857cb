//! Connection recovery: retry scheduling with jitter and a consumer-count
//! driven endpoint lifecycle.
//!
//! One pending retry per endpoint. The scheduled task re-checks the world
//! when it fires (consumers may have left, the state may have moved on)
//! before asking the pool to reconnect. When the last consumer of an
//! endpoint unregisters, its retry is cancelled and the endpoint is torn
//! down.

mod classify;

pub use classify::{classify, Classification};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::app::RetryTuning;
use crate::core::domain::{ConnectionState, EndpointKey};
use crate::core::pool::{ConnectionPool, SessionGrant};

struct RetrySlot {
    handle: tokio::task::JoinHandle<()>,
}

pub struct RecoveryManager {
    pool: Arc<ConnectionPool>,
    tuning: RetryTuning,
    slots: Mutex<HashMap<EndpointKey, RetrySlot>>,
    node_counts: Mutex<HashMap<EndpointKey, usize>>,
}

impl RecoveryManager {
    pub fn new(pool: Arc<ConnectionPool>, tuning: RetryTuning) -> Arc<Self> {
        Arc::new(Self {
            pool,
            tuning,
            slots: Mutex::new(HashMap::new()),
            node_counts: Mutex::new(HashMap::new()),
        })
    }

    // -- Consumer counting ---------------------------------------------------

    pub fn register_node(&self, key: &EndpointKey) {
        let mut counts = self.node_counts.lock();
        let count = counts.entry(key.clone()).or_insert(0);
        *count += 1;
        debug!(endpoint = %key, nodes = *count, "Consumer registered");
    }

    /// Drop one consumer. When the count reaches zero the pending retry is
    /// cancelled and the endpoint is torn down.
    pub fn unregister_node(&self, key: &EndpointKey) {
        let remaining = {
            let mut counts = self.node_counts.lock();
            match counts.get_mut(key) {
                Some(count) => {
                    *count = count.saturating_sub(1);
                    let remaining = *count;
                    if remaining == 0 {
                        counts.remove(key);
                    }
                    remaining
                }
                None => return,
            }
        };
        debug!(endpoint = %key, nodes = remaining, "Consumer unregistered");
        if remaining == 0 {
            info!(endpoint = %key, "Last consumer left, releasing endpoint");
            self.cancel_retry(key);
            self.pool.close_connection(key);
        }
    }

    pub fn node_count(&self, key: &EndpointKey) -> usize {
        self.node_counts.lock().get(key).copied().unwrap_or(0)
    }

    // -- Retry scheduling ----------------------------------------------------

    /// Arm one retry with the jittered base delay. No-op when a retry is
    /// already pending or nobody is interested in the endpoint.
    pub fn schedule_retry(self: &Arc<Self>, key: &EndpointKey) {
        let delay = self.base_delay();
        self.schedule_with(key, delay, 0);
    }

    /// Retry almost immediately (consumer-driven nudge).
    pub fn schedule_immediate_retry(self: &Arc<Self>, key: &EndpointKey) {
        self.schedule_with(key, self.tuning.immediate(), 0);
    }

    fn schedule_with(self: &Arc<Self>, key: &EndpointKey, delay: Duration, attempts: u32) {
        let mut slots = self.slots.lock();
        if slots.contains_key(key) {
            return;
        }
        if self.node_count(key) == 0 {
            debug!(endpoint = %key, "No consumers, not scheduling retry");
            return;
        }
        if !self.pool.mark_retry_scheduled(key) {
            debug!(endpoint = %key, state = %self.pool.state_of(key), "State not retryable, not scheduling");
            return;
        }

        info!(endpoint = %key, delay_ms = delay.as_millis() as u64, attempt = attempts + 1, "Retry scheduled");
        let this = self.clone();
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.run_retry(task_key, attempts).await;
        });
        slots.insert(key.clone(), RetrySlot { handle });
    }

    async fn run_retry(self: Arc<Self>, key: EndpointKey, attempts: u32) {
        self.slots.lock().remove(&key);
        if self.node_count(&key) == 0 {
            debug!(endpoint = %key, "Retry fired with no consumers, stopping");
            return;
        }
        if self.pool.state_of(&key) != ConnectionState::RetryScheduled {
            debug!(endpoint = %key, state = %self.pool.state_of(&key), "State moved on, stopping retry");
            return;
        }

        match self.pool.attempt_reconnection(&key).await {
            Ok(SessionGrant::Ready(_)) => {
                info!(endpoint = %key, "Reconnected");
                // resubscription rides on the pool's ready callback
            }
            Ok(SessionGrant::Pending) => {
                self.schedule_with(&key, self.tuning.fallback(), attempts + 1);
            }
            Err(e) => {
                let class = classify(&e);
                let attempts = attempts + 1;
                match class {
                    Classification::AuthHard => {
                        warn!(endpoint = %key, error = %e, "Authentication failure, giving up");
                        // the pool already parked the endpoint in auth_failed
                    }
                    Classification::AuthTransient
                        if attempts >= self.tuning.max_attempts_before_auth_fail =>
                    {
                        warn!(
                            endpoint = %key,
                            attempts,
                            error = %e,
                            "Repeated auth-flavored failures, demoting to auth_failed"
                        );
                        self.pool.mark_auth_failed(&key);
                    }
                    _ => {
                        debug!(endpoint = %key, error = %e, attempts, "Retry failed, rescheduling");
                        self.schedule_with(&key, self.tuning.fallback(), attempts);
                    }
                }
            }
        }
    }

    fn base_delay(&self) -> Duration {
        let jitter = if self.tuning.retry_jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.tuning.retry_jitter_ms)
        };
        Duration::from_millis(self.tuning.retry_base_ms + jitter)
    }

    pub fn has_pending_retry(&self, key: &EndpointKey) -> bool {
        self.slots.lock().contains_key(key)
    }

    pub fn cancel_retry(&self, key: &EndpointKey) {
        if let Some(slot) = self.slots.lock().remove(key) {
            slot.handle.abort();
            debug!(endpoint = %key, "Retry cancelled");
        }
    }

    /// Cancel every pending retry. Part of process shutdown.
    pub fn shutdown(&self) {
        let mut slots = self.slots.lock();
        for (_, slot) in slots.drain() {
            slot.handle.abort();
        }
        self.node_counts.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::app::SessionTuning;
    use crate::core::auth::{AccessToken, TokenFetcher};
    use crate::core::domain::EndpointConfig;
    use crate::core::session::{ConnectRequest, Connector, Transport};
    use crate::error::{Error, Result};
    use async_trait::async_trait;

    struct NoAuth;

    #[async_trait]
    impl TokenFetcher for NoAuth {
        async fn fetch_token(&self, _config: &EndpointConfig) -> Result<AccessToken> {
            Err(Error::Config("no auth in tests".to_string()))
        }
    }

    struct RefuseConnect;

    #[async_trait]
    impl Connector for RefuseConnect {
        async fn connect(&self, _request: &ConnectRequest) -> Result<Box<dyn Transport>> {
            Err(Error::Server("connection refused".to_string()))
        }
    }

    fn test_pool() -> Arc<ConnectionPool> {
        ConnectionPool::new(SessionTuning::default(), Arc::new(NoAuth), Arc::new(RefuseConnect))
    }

    #[tokio::test]
    async fn test_base_delay_within_jitter_window() {
        let tuning = RetryTuning {
            retry_base_ms: 5_000,
            retry_jitter_ms: 2_000,
            ..RetryTuning::default()
        };
        let manager = RecoveryManager::new(test_pool(), tuning);
        for _ in 0..50 {
            let delay = manager.base_delay().as_millis() as u64;
            assert!((5_000..=7_000).contains(&delay), "delay {delay}ms out of window");
        }
    }

    #[tokio::test]
    async fn test_node_counting() {
        let manager = RecoveryManager::new(test_pool(), RetryTuning::default());
        let key = EndpointKey::from("iob:8082");
        assert_eq!(manager.node_count(&key), 0);
        manager.register_node(&key);
        manager.register_node(&key);
        assert_eq!(manager.node_count(&key), 2);
        manager.unregister_node(&key);
        assert_eq!(manager.node_count(&key), 1);
        manager.unregister_node(&key);
        assert_eq!(manager.node_count(&key), 0);
        // redundant unregister stays at zero
        manager.unregister_node(&key);
        assert_eq!(manager.node_count(&key), 0);
    }

    #[tokio::test]
    async fn test_no_retry_without_consumers() {
        let manager = RecoveryManager::new(test_pool(), RetryTuning::default());
        let key = EndpointKey::from("iob:8082");
        manager.schedule_retry(&key);
        assert!(!manager.has_pending_retry(&key));
    }
}
