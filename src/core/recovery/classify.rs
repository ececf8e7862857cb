//! Stateless error classification.
//!
//! Phrase matching over the rendered error drives the distinction between
//! credential problems (permanent) and reachability problems (retryable).
//! The default retry policy treats everything that is not a hard auth
//! failure as retryable.

use crate::error::Error;

/// How an error should drive the connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Credentials are wrong; retrying cannot help.
    AuthHard,
    /// Auth-flavored failure with a network cause; retry.
    AuthTransient,
    /// Plain connectivity failure; retry.
    Network,
    /// Anything else; the default policy retries.
    Other,
}

impl Classification {
    pub fn retryable(self) -> bool {
        self != Self::AuthHard
    }
}

const AUTH_PHRASES: &[&str] = &[
    "invalid grant",
    "invalid_grant",
    "unauthorized",
    "invalid credentials",
    "wrong username or password",
    "access denied",
    "bad credentials",
    "authentication required",
    "authentication failed (404)",
];

const NETWORK_PHRASES: &[&str] = &[
    "timeout",
    "timed out",
    "refused",
    "network",
    "econnreset",
    "enotfound",
    "ehostunreach",
    "socket hang up",
    "connection closed",
    "connect etimedout",
    "connect econnrefused",
];

fn contains_any(text: &str, phrases: &[&str]) -> bool {
    phrases.iter().any(|phrase| text.contains(phrase))
}

pub fn classify(error: &Error) -> Classification {
    if let Error::Auth { body, .. } = error {
        // A rejected token request whose body talks about reachability means
        // the auth proxy could not reach the server, not bad credentials.
        if contains_any(&body.to_lowercase(), NETWORK_PHRASES) {
            return Classification::AuthTransient;
        }
        return Classification::AuthHard;
    }

    let text = error.to_string().to_lowercase();
    let network = contains_any(&text, NETWORK_PHRASES);
    let auth = contains_any(&text, AUTH_PHRASES) || text.contains("authentication failed");
    match (auth, network) {
        (true, true) => Classification::AuthTransient,
        (true, false) => Classification::AuthHard,
        (false, true) => Classification::Network,
        (false, false) => Classification::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_auth_body_phrases_are_permanent() {
        for body in [
            "invalid_grant",
            "Invalid credentials",
            "wrong username or password",
            "access denied",
            "bad credentials",
            "authentication required",
        ] {
            let error = Error::Auth { status: 400, body: body.to_string() };
            assert_eq!(classify(&error), Classification::AuthHard, "{body}");
            assert!(!classify(&error).retryable());
        }
    }

    #[test]
    fn test_auth_with_network_body_is_transient() {
        let error = Error::Auth { status: 502, body: "connect ECONNREFUSED 10.0.0.5:8082".to_string() };
        assert_eq!(classify(&error), Classification::AuthTransient);
        assert!(classify(&error).retryable());
    }

    #[test]
    fn test_network_phrases_are_retryable() {
        for message in [
            "connection refused",
            "read ECONNRESET",
            "getaddrinfo ENOTFOUND iob.local",
            "socket hang up",
            "connect ETIMEDOUT",
        ] {
            let error = Error::Server(message.to_string());
            assert_eq!(classify(&error), Classification::Network, "{message}");
        }
    }

    #[test]
    fn test_timeout_error_is_network() {
        let error = Error::Timeout(Duration::from_secs(8));
        assert_eq!(classify(&error), Classification::Network);
    }

    #[test]
    fn test_handshake_close_is_network() {
        let error = Error::HandshakeClosed("closed by peer (1006)".to_string());
        assert_eq!(classify(&error), Classification::Network);
    }

    #[test]
    fn test_auth_phrase_with_network_token_is_transient() {
        let error = Error::Server("authentication failed: connection closed".to_string());
        assert_eq!(classify(&error), Classification::AuthTransient);
    }

    #[test]
    fn test_bare_authentication_failed_is_permanent() {
        let error = Error::Server("authentication failed".to_string());
        assert_eq!(classify(&error), Classification::AuthHard);
    }

    #[test]
    fn test_unknown_errors_default_to_retryable() {
        let error = Error::Server("weird server hiccup".to_string());
        assert_eq!(classify(&error), Classification::Other);
        assert!(classify(&error).retryable());
    }
}
