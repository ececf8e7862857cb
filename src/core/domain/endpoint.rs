//! Endpoint identity and configuration.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Ports that imply TLS when `use_ssl` is not set explicitly.
const SSL_PORTS: [u16; 3] = [443, 8443, 8084];

/// Identifies a remote server as `host:port`.
///
/// The key is derived from configuration once and never changes for the
/// lifetime of an endpoint entry; credential or TLS changes are detected
/// through the config [fingerprint](EndpointConfig::fingerprint) instead.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointKey(String);

impl EndpointKey {
    pub fn new(host: &str, port: u16) -> Self {
        Self(format!("{host}:{port}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EndpointKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EndpointKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Connection settings for one remote server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct EndpointConfig {
    pub host: String,
    pub port: u16,
    /// Login name; empty or absent means the server runs without auth.
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Explicit TLS flag; inferred from well-known ports when absent.
    #[serde(default)]
    pub use_ssl: Option<bool>,
}

impl EndpointConfig {
    pub fn key(&self) -> EndpointKey {
        EndpointKey::new(&self.host, self.port)
    }

    pub fn ssl_enabled(&self) -> bool {
        self.use_ssl.unwrap_or_else(|| SSL_PORTS.contains(&self.port))
    }

    pub fn authenticated(&self) -> bool {
        self.user.as_deref().is_some_and(|u| !u.is_empty())
    }

    pub fn ws_scheme(&self) -> &'static str {
        if self.ssl_enabled() {
            "wss"
        } else {
            "ws"
        }
    }

    pub fn http_scheme(&self) -> &'static str {
        if self.ssl_enabled() {
            "https"
        } else {
            "http"
        }
    }

    /// Digest of the material connection fields.
    ///
    /// Two different fingerprints under the same endpoint key force a full
    /// session teardown before reconnecting. Stable within one process run,
    /// which is all invalidation needs.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.host.hash(&mut hasher);
        self.port.hash(&mut hasher);
        self.user.hash(&mut hasher);
        self.password.hash(&mut hasher);
        self.ssl_enabled().hash(&mut hasher);
        hasher.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(host: &str, port: u16) -> EndpointConfig {
        EndpointConfig {
            host: host.to_string(),
            port,
            user: Some("admin".to_string()),
            password: Some("secret".to_string()),
            use_ssl: None,
        }
    }

    #[test]
    fn test_key_is_host_port() {
        assert_eq!(config("iob", 8082).key().as_str(), "iob:8082");
    }

    #[test]
    fn test_ssl_inferred_from_port() {
        assert!(!config("iob", 8082).ssl_enabled());
        assert!(config("iob", 443).ssl_enabled());
        assert!(config("iob", 8443).ssl_enabled());
        assert!(config("iob", 8084).ssl_enabled());
    }

    #[test]
    fn test_explicit_ssl_flag_wins() {
        let mut c = config("iob", 8082);
        c.use_ssl = Some(true);
        assert!(c.ssl_enabled());
        assert_eq!(c.ws_scheme(), "wss");

        let mut c = config("iob", 443);
        c.use_ssl = Some(false);
        assert!(!c.ssl_enabled());
        assert_eq!(c.http_scheme(), "http");
    }

    #[test]
    fn test_fingerprint_stable_for_equal_configs() {
        assert_eq!(config("iob", 8082).fingerprint(), config("iob", 8082).fingerprint());
    }

    #[test]
    fn test_fingerprint_changes_with_password() {
        let a = config("iob", 8082);
        let mut b = a.clone();
        b.password = Some("other".to_string());
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_changes_with_ssl() {
        let a = config("iob", 8082);
        let mut b = a.clone();
        b.use_ssl = Some(true);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_unauthenticated_when_user_empty() {
        let mut c = config("iob", 8082);
        c.user = Some(String::new());
        assert!(!c.authenticated());
        c.user = None;
        assert!(!c.authenticated());
    }
}
