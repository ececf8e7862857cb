//! OAuth2 password-grant client for the remote server's `/oauth/token`.
//!
//! Tokens expire after an hour server-side; the session schedules a
//! proactive refresh at 55 minutes and rotates its socket with the new
//! token. Certificate verification is off by default because the servers
//! this gateway talks to are typically deployed with self-signed
//! certificates; the knob is surfaced as `allow_self_signed`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::core::domain::EndpointConfig;
use crate::error::{Error, Result};

/// Client id the remote server expects from gateway logins.
const CLIENT_ID: &str = "ioBroker";
/// Hard ceiling on one token request.
const TOKEN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// A bearer token plus the instant it was obtained.
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    pub fetched_at: DateTime<Utc>,
}

/// Seam for obtaining bearer tokens; implemented by [`AuthClient`] in
/// production and by scripted fetchers in tests.
#[async_trait]
pub trait TokenFetcher: Send + Sync {
    async fn fetch_token(&self, config: &EndpointConfig) -> Result<AccessToken>;
}

/// HTTP client for the password-grant token endpoint.
pub struct AuthClient {
    http: reqwest::Client,
}

impl AuthClient {
    pub fn new(allow_self_signed: bool) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(TOKEN_TIMEOUT)
            .danger_accept_invalid_certs(allow_self_signed)
            .build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl TokenFetcher for AuthClient {
    /// Fetch a bearer token for the endpoint's credentials.
    ///
    /// Any non-success status is an authentication failure carrying the
    /// status code and response body; the classifier decides later whether
    /// the body points at credentials or at reachability.
    async fn fetch_token(&self, config: &EndpointConfig) -> Result<AccessToken> {
        let user = config
            .user
            .clone()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| Error::Config("token fetch requires a user".to_string()))?;
        let password = config.password.clone().unwrap_or_default();
        let url = format!(
            "{}://{}:{}/oauth/token",
            config.http_scheme(),
            config.host,
            config.port
        );

        debug!(url = %url, user = %user, "Fetching access token");

        let params = [
            ("grant_type", "password"),
            ("username", user.as_str()),
            ("password", password.as_str()),
            ("client_id", CLIENT_ID),
            ("stayloggedin", "false"),
        ];
        let response = self.http.post(&url).form(&params).send().await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            warn!(status = %status, "Token request rejected");
            return Err(Error::Auth { status: status.as_u16(), body });
        }

        let parsed: TokenResponse = serde_json::from_str(&body)?;
        debug!("Access token obtained");
        Ok(AccessToken { token: parsed.access_token, fetched_at: Utc::now() })
    }
}
