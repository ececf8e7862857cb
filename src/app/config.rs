//! Gateway configuration loading and validation.
//!
//! All tunables carry the production defaults inline; a TOML file only needs
//! to name the fields it overrides. Endpoint credentials are not part of
//! this file - they arrive per consumer through the façade.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Session-level tunables, applied to every session the pool opens.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionTuning {
    /// Client name advertised in the connection URL.
    #[serde(default = "default_client_name")]
    pub client_name: String,
    /// Handshake and ready-gate timeout. The standalone session default is
    /// 15 s; the pool runs with 8 s.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    #[serde(default = "default_pong_timeout_ms")]
    pub pong_timeout_ms: u64,
    /// Horizon after which an unanswered callback entry is swept.
    #[serde(default = "default_callback_expiry_secs")]
    pub callback_expiry_secs: u64,
    /// Tokens expire at 60 minutes; refresh proactively before that.
    #[serde(default = "default_token_refresh_mins")]
    pub token_refresh_mins: u64,
    /// Skip TLS certificate verification. On by default to match the
    /// typical self-signed server deployment.
    #[serde(default = "default_true")]
    pub allow_self_signed: bool,
}

fn default_client_name() -> String {
    "iobridge".to_string()
}

const fn default_connect_timeout_ms() -> u64 {
    8_000
}

const fn default_ping_interval_ms() -> u64 {
    5_000
}

const fn default_pong_timeout_ms() -> u64 {
    30_000
}

const fn default_callback_expiry_secs() -> u64 {
    30
}

const fn default_token_refresh_mins() -> u64 {
    55
}

const fn default_true() -> bool {
    true
}

impl Default for SessionTuning {
    fn default() -> Self {
        Self {
            client_name: default_client_name(),
            connect_timeout_ms: default_connect_timeout_ms(),
            ping_interval_ms: default_ping_interval_ms(),
            pong_timeout_ms: default_pong_timeout_ms(),
            callback_expiry_secs: default_callback_expiry_secs(),
            token_refresh_mins: default_token_refresh_mins(),
            allow_self_signed: default_true(),
        }
    }
}

impl SessionTuning {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_millis(self.pong_timeout_ms)
    }

    pub fn callback_expiry(&self) -> Duration {
        Duration::from_secs(self.callback_expiry_secs)
    }

    pub fn token_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.token_refresh_mins * 60)
    }
}

/// Retry scheduling tunables.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryTuning {
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    /// Random extra delay on top of the base, spreading reconnect storms.
    #[serde(default = "default_retry_jitter_ms")]
    pub retry_jitter_ms: u64,
    /// Delay between consecutive failed retry attempts.
    #[serde(default = "default_retry_fallback_ms")]
    pub retry_fallback_ms: u64,
    #[serde(default = "default_immediate_retry_ms")]
    pub immediate_retry_ms: u64,
    /// After this many consecutive auth-flavored failures the endpoint is
    /// demoted to `auth_failed` instead of retrying forever.
    #[serde(default = "default_max_attempts_before_auth_fail")]
    pub max_attempts_before_auth_fail: u32,
}

const fn default_retry_base_ms() -> u64 {
    5_000
}

const fn default_retry_jitter_ms() -> u64 {
    2_000
}

const fn default_retry_fallback_ms() -> u64 {
    10_000
}

const fn default_immediate_retry_ms() -> u64 {
    100
}

const fn default_max_attempts_before_auth_fail() -> u32 {
    5
}

impl Default for RetryTuning {
    fn default() -> Self {
        Self {
            retry_base_ms: default_retry_base_ms(),
            retry_jitter_ms: default_retry_jitter_ms(),
            retry_fallback_ms: default_retry_fallback_ms(),
            immediate_retry_ms: default_immediate_retry_ms(),
            max_attempts_before_auth_fail: default_max_attempts_before_auth_fail(),
        }
    }
}

impl RetryTuning {
    pub fn fallback(&self) -> Duration {
        Duration::from_millis(self.retry_fallback_ms)
    }

    pub fn immediate(&self) -> Duration {
        Duration::from_millis(self.immediate_retry_ms)
    }
}

/// Fan-out timing handed to the registry.
#[derive(Debug, Clone)]
pub struct FanoutTuning {
    pub subscribe_timeout: Duration,
    pub read_timeout: Duration,
    /// Pause between upstream subscriptions during resubscription, so a
    /// reconnect does not flood the server.
    pub resubscribe_gap: Duration,
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub session: SessionTuning,
    #[serde(default)]
    pub retry: RetryTuning,
    /// Timeout for read operations (getState and friends).
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_subscribe_timeout_secs")]
    pub subscribe_timeout_secs: u64,
    #[serde(default = "default_resubscribe_gap_ms")]
    pub resubscribe_gap_ms: u64,
}

const fn default_read_timeout_secs() -> u64 {
    8
}

const fn default_subscribe_timeout_secs() -> u64 {
    5
}

const fn default_resubscribe_gap_ms() -> u64 {
    50
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            session: SessionTuning::default(),
            retry: RetryTuning::default(),
            read_timeout_secs: default_read_timeout_secs(),
            subscribe_timeout_secs: default_subscribe_timeout_secs(),
            resubscribe_gap_ms: default_resubscribe_gap_ms(),
        }
    }
}

impl GatewayConfig {
    /// Load from a TOML file, falling back to defaults for absent fields.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&raw).map_err(|e| Error::Config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.session.ping_interval_ms == 0 {
            return Err(Error::Config("ping_interval_ms must be positive".to_string()));
        }
        if self.session.pong_timeout_ms <= self.session.ping_interval_ms {
            return Err(Error::Config(
                "pong_timeout_ms must exceed ping_interval_ms".to_string(),
            ));
        }
        if self.session.connect_timeout_ms == 0 {
            return Err(Error::Config("connect_timeout_ms must be positive".to_string()));
        }
        if self.read_timeout_secs == 0 {
            return Err(Error::Config("read_timeout_secs must be positive".to_string()));
        }
        Ok(())
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_secs(self.subscribe_timeout_secs)
    }

    pub fn fanout(&self) -> FanoutTuning {
        FanoutTuning {
            subscribe_timeout: self.subscribe_timeout(),
            read_timeout: self.read_timeout(),
            resubscribe_gap: Duration::from_millis(self.resubscribe_gap_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_production_values() {
        let config = GatewayConfig::default();
        assert_eq!(config.session.connect_timeout_ms, 8_000);
        assert_eq!(config.session.ping_interval_ms, 5_000);
        assert_eq!(config.session.pong_timeout_ms, 30_000);
        assert_eq!(config.session.callback_expiry_secs, 30);
        assert_eq!(config.session.token_refresh_mins, 55);
        assert!(config.session.allow_self_signed);
        assert_eq!(config.retry.retry_base_ms, 5_000);
        assert_eq!(config.retry.retry_jitter_ms, 2_000);
        assert_eq!(config.retry.retry_fallback_ms, 10_000);
        assert_eq!(config.retry.max_attempts_before_auth_fail, 5);
        assert_eq!(config.read_timeout_secs, 8);
        assert_eq!(config.subscribe_timeout_secs, 5);
        assert_eq!(config.resubscribe_gap_ms, 50);
    }

    #[test]
    fn test_partial_toml_overrides() {
        let parsed: GatewayConfig = toml::from_str(
            r#"
            read_timeout_secs = 4

            [session]
            ping_interval_ms = 2000
            "#,
        )
        .unwrap();
        assert_eq!(parsed.read_timeout_secs, 4);
        assert_eq!(parsed.session.ping_interval_ms, 2_000);
        // untouched fields keep their defaults
        assert_eq!(parsed.session.pong_timeout_ms, 30_000);
        assert_eq!(parsed.retry.retry_base_ms, 5_000);
    }

    #[test]
    fn test_validate_rejects_inverted_heartbeat() {
        let mut config = GatewayConfig::default();
        config.session.pong_timeout_ms = 1_000;
        config.session.ping_interval_ms = 5_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "subscribe_timeout_secs = 2").unwrap();
        let config = GatewayConfig::load(file.path()).unwrap();
        assert_eq!(config.subscribe_timeout_secs, 2);
    }

    #[test]
    fn test_load_rejects_bad_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "session = 5").unwrap();
        assert!(GatewayConfig::load(file.path()).is_err());
    }
}
