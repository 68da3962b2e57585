//! Credential model and token service wire types.

use std::fmt;

use serde::{Deserialize, Serialize};
use time::{Duration as TimeDuration, OffsetDateTime};

/// Username/password pair presented to the broker.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqttCredentials {
    pub username: String,
    pub password: String,
}

impl MqttCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for MqttCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Stored lifecycle state. `Expired` is only ever derived from the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TokenState {
    #[default]
    None,
    Valid,
    Expiring,
    Expired,
    Refreshing,
    Error,
}

impl fmt::Display for TokenState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TokenState::None => "none",
            TokenState::Valid => "valid",
            TokenState::Expiring => "expiring",
            TokenState::Expired => "expired",
            TokenState::Refreshing => "refreshing",
            TokenState::Error => "error",
        };
        f.write_str(s)
    }
}

/// The single live credential owned by a [`TokenManager`](super::TokenManager).
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub token_id: String,
    pub access_token: String,
    pub mqtt: MqttCredentials,
    pub user_identity: Option<String>,
    pub provider: Option<String>,
    pub expires_at: Option<OffsetDateTime>,
    /// Always at or before `expires_at`.
    pub refresh_recommended_at: OffsetDateTime,
}

impl Credential {
    /// Builds a credential from a service response, deriving the refresh
    /// point from `refresh_buffer` when the service does not recommend one.
    pub fn from_response(response: TokenResponse, refresh_buffer: TimeDuration, now: OffsetDateTime) -> Self {
        let refresh_recommended_at = match (response.refresh_recommended_at, response.expires_at) {
            (Some(recommended), Some(expires)) => recommended.min(expires),
            (Some(recommended), None) => recommended,
            (None, Some(expires)) => (expires - refresh_buffer).max(now).min(expires),
            (None, None) => now,
        };

        Self {
            token_id: response.token_id,
            access_token: response.access_token,
            mqtt: response.mqtt_credentials,
            user_identity: response.user_email,
            provider: response.provider,
            expires_at: response.expires_at,
            refresh_recommended_at,
        }
    }

    /// A credential without expiry counts as expired.
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        self.expires_at.map_or(true, |expires| now >= expires)
    }

    pub fn seconds_until_expiry(&self, now: OffsetDateTime) -> i64 {
        self.expires_at
            .map_or(0, |expires| (expires - now).whole_seconds().max(0))
    }

    pub fn info(&self) -> TokenInfo {
        TokenInfo {
            token_id: self.token_id.clone(),
            username: self.mqtt.username.clone(),
            user_identity: self.user_identity.clone(),
            provider: self.provider.clone(),
            expires_at: self.expires_at,
            refresh_recommended_at: self.refresh_recommended_at,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token_id", &self.token_id)
            .field("mqtt", &self.mqtt)
            .field("user_identity", &self.user_identity)
            .field("provider", &self.provider)
            .field("expires_at", &self.expires_at)
            .field("refresh_recommended_at", &self.refresh_recommended_at)
            .finish_non_exhaustive()
    }
}

/// Secret-free view of the live credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenInfo {
    pub token_id: String,
    pub username: String,
    pub user_identity: Option<String>,
    pub provider: Option<String>,
    pub expires_at: Option<OffsetDateTime>,
    pub refresh_recommended_at: OffsetDateTime,
}

/// Body of `POST /v2/tokens/create`.
#[derive(Clone, Serialize)]
pub struct CreateTokenRequest {
    pub organization_id: String,
    pub secret_key: String,
    pub user_email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub integration_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replace_existing: Option<bool>,
}

impl fmt::Debug for CreateTokenRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CreateTokenRequest")
            .field("organization_id", &self.organization_id)
            .field("user_email", &self.user_email)
            .field("integration_id", &self.integration_id)
            .finish_non_exhaustive()
    }
}

/// Body of `POST /v2/tokens/exchange`; `token` is the third-party JWT.
#[derive(Clone, Serialize)]
pub struct ExchangeTokenRequest {
    pub organization_id: String,
    pub token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub integration_id: Option<String>,
}

impl fmt::Debug for ExchangeTokenRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeTokenRequest")
            .field("organization_id", &self.organization_id)
            .field("integration_id", &self.integration_id)
            .finish_non_exhaustive()
    }
}

/// Body of `POST /v2/tokens/refresh`.
#[derive(Clone, Serialize)]
pub struct RefreshTokenRequest {
    pub token_id: String,
    pub current_token_password: String,
}

/// Success body shared by create, exchange and refresh.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub token_id: String,
    pub access_token: String,
    pub mqtt_credentials: MqttCredentials,
    #[serde(default)]
    pub user_email: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub refresh_recommended_at: Option<OffsetDateTime>,
}

/// An identity provider configured for an organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provider {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "type")]
    pub provider_type: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ProvidersResponse {
    #[serde(default)]
    pub providers: Vec<Provider>,
}
