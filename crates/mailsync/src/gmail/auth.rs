//! Google OAuth2 token refresh
//!
//! Sign-in happens on the host platform (ASWebAuthenticationSession,
//! Custom Tabs); the engine only exchanges refresh tokens for new access
//! tokens. The exchange is a POST and is never retried automatically.

use chrono::{DateTime, Duration, TimeZone, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use ureq::Agent;

use super::ApiError;
use crate::auth::TokenRefresher;
use crate::config::{GmailCredentials, NetworkConfig};
use crate::models::{Account, OAuthCredential};

/// Token JSON exchanged with hosts and credential storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Unix seconds
    pub expires_at: Option<i64>,
}

impl From<&OAuthCredential> for StoredToken {
    fn from(cred: &OAuthCredential) -> Self {
        Self {
            access_token: cred.access_token.clone(),
            refresh_token: cred.refresh_token.clone(),
            expires_at: cred.expires_at.map(|t| t.timestamp()),
        }
    }
}

impl From<StoredToken> for OAuthCredential {
    fn from(token: StoredToken) -> Self {
        Self {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_at: token
                .expires_at
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
}

/// Refresh-token grant against Google's token endpoint
pub struct GmailTokenRefresher {
    agent: Agent,
    credentials: GmailCredentials,
    token_url: String,
}

impl GmailTokenRefresher {
    pub const TOKEN_URL: &'static str = "https://oauth2.googleapis.com/token";

    pub fn new(credentials: GmailCredentials, network: &NetworkConfig) -> Self {
        Self::with_token_url(credentials, network, Self::TOKEN_URL)
    }

    pub fn with_token_url(
        credentials: GmailCredentials,
        network: &NetworkConfig,
        token_url: impl Into<String>,
    ) -> Self {
        let agent: Agent = Agent::config_builder()
            .timeout_global(Some(network.request_timeout()))
            .http_status_as_error(false)
            .build()
            .into();
        Self {
            agent,
            credentials,
            token_url: token_url.into(),
        }
    }

    fn exchange(&self, refresh_token: &str) -> Result<TokenResponse, ApiError> {
        let mut form = vec![
            ("client_id", self.credentials.client_id.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ];
        if let Some(secret) = &self.credentials.client_secret {
            form.push(("client_secret", secret.as_str()));
        }

        let mut response = self.agent.post(&self.token_url).send_form(form)?;
        let status = response.status().as_u16();
        let body = response.body_mut().read_to_string()?;

        if (200..300).contains(&status) {
            return serde_json::from_str(&body).map_err(|e| ApiError::Decode(e.to_string()));
        }

        // invalid_grant: refresh token revoked or expired
        let reason = serde_json::from_str::<TokenErrorResponse>(&body)
            .map(|e| e.error)
            .unwrap_or_default();
        if matches!(status, 400 | 401) && reason == "invalid_grant" {
            return Err(ApiError::ReauthRequired);
        }
        Err(ApiError::from_status(status, &body))
    }
}

fn expiry_from(expires_in: Option<i64>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    expires_in.map(|secs| now + Duration::seconds(secs))
}

impl TokenRefresher for GmailTokenRefresher {
    fn refresh(&self, account: &Account) -> Result<OAuthCredential, ApiError> {
        let refresh_token = account
            .credential
            .refresh_token
            .as_deref()
            .ok_or(ApiError::ReauthRequired)?;

        let token = self.exchange(refresh_token).inspect_err(|e| {
            warn!("[AUTH] Token refresh failed for {}: {}", account.email, e);
        })?;
        info!("[AUTH] Refreshed access token for {}", account.email);

        Ok(OAuthCredential {
            access_token: token.access_token,
            // Google omits the refresh token when it is unchanged
            refresh_token: token.refresh_token.or_else(|| Some(refresh_token.to_string())),
            expires_at: expiry_from(token.expires_in, Utc::now()),
        })
    }
}
