//! Shared fixtures for the integration suites.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use iobridge::app::{Gateway, GatewayConfig};
use iobridge::core::domain::EndpointConfig;
use iobridge::core::registry::ConsumerHooks;
use iobridge::testkit::{MockEndpoint, StaticTokens};

/// Production shape with all delays shrunk to test scale.
pub fn fast_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.session.connect_timeout_ms = 500;
    config.session.ping_interval_ms = 50;
    config.session.pong_timeout_ms = 400;
    config.retry.retry_base_ms = 40;
    config.retry.retry_jitter_ms = 20;
    config.retry.retry_fallback_ms = 60;
    config.retry.immediate_retry_ms = 5;
    config.resubscribe_gap_ms = 2;
    config.read_timeout_secs = 2;
    config.subscribe_timeout_secs = 2;
    config
}

pub fn endpoint_config() -> EndpointConfig {
    EndpointConfig {
        host: "iob.test".to_string(),
        port: 8082,
        user: None,
        password: None,
        use_ssl: None,
    }
}

pub fn authed_endpoint_config() -> EndpointConfig {
    EndpointConfig {
        host: "iob.test".to_string(),
        port: 8082,
        user: Some("admin".to_string()),
        password: Some("secret".to_string()),
        use_ssl: None,
    }
}

/// Gateway wired to a mock server, no authentication.
pub fn gateway(server: &MockEndpoint) -> Arc<Gateway> {
    Gateway::with_connector(
        fast_config(),
        Arc::new(StaticTokens::unused()),
        Arc::new(server.clone()),
    )
    .unwrap()
}

pub async fn settle() {
    tokio::time::sleep(std::time::Duration::from_millis(80)).await;
}

/// Captures consumer callbacks as labeled strings, in invocation order.
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hooks(&self, wants_initial_value: bool) -> ConsumerHooks {
        let value_events = self.events.clone();
        let initial_events = self.events.clone();
        let status_events = self.events.clone();
        let subscribed_events = self.events.clone();
        let log_events = self.events.clone();
        ConsumerHooks {
            on_value: Some(Arc::new(move |id, state| {
                let rendered = state.map_or("null".to_string(), |s| s.val.to_string());
                value_events.lock().unwrap().push(format!("value:{id}={rendered}"));
            })),
            on_object: None,
            on_log: Some(Arc::new(move |entry| {
                log_events.lock().unwrap().push(format!("log:{}:{}", entry.severity, entry.message));
            })),
            update_status: Some(Arc::new(move |status| {
                status_events.lock().unwrap().push(format!("status:{status}"));
            })),
            on_subscribed: Some(Arc::new(move || {
                subscribed_events.lock().unwrap().push("subscribed".to_string());
            })),
            on_initial_value: Some(Arc::new(move |id, state| {
                let rendered = state.map_or("null".to_string(), |s| s.val.to_string());
                initial_events.lock().unwrap().push(format!("initial:{id}={rendered}"));
            })),
            wants_initial_value,
        }
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count_of(&self, prefix: &str) -> usize {
        self.snapshot().iter().filter(|e| e.starts_with(prefix)).count()
    }

    /// Index of the first event equal to `needle`, if any.
    pub fn position(&self, needle: &str) -> Option<usize> {
        self.snapshot().iter().position(|e| e == needle)
    }
}
