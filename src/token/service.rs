//! Token service client.
//!
//! [`TokenService`] is the seam the [`TokenManager`](super::TokenManager)
//! calls through; [`HttpTokenService`] implements it over `reqwest`
//! against the `/v2/tokens/*` endpoints.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use tracing::{debug, warn};

use super::{
    error::TokenError,
    types::{
        CreateTokenRequest, ExchangeTokenRequest, Provider, ProvidersResponse, RefreshTokenRequest,
        TokenResponse,
    },
};

/// Remote operations of the token service.
#[async_trait]
pub trait TokenService: Send + Sync + 'static {
    async fn create(&self, request: &CreateTokenRequest) -> Result<TokenResponse, TokenError>;

    async fn exchange(&self, request: &ExchangeTokenRequest) -> Result<TokenResponse, TokenError>;

    async fn refresh(&self, request: &RefreshTokenRequest) -> Result<TokenResponse, TokenError>;

    async fn providers(&self, organization_id: &str) -> Result<Vec<Provider>, TokenError>;
}

/// Which endpoint produced a failure; 401 means different things for each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoint {
    Create,
    Exchange,
    Refresh,
    Providers,
}

impl Endpoint {
    fn path(self) -> &'static str {
        match self {
            Endpoint::Create => "/v2/tokens/create",
            Endpoint::Exchange => "/v2/tokens/exchange",
            Endpoint::Refresh => "/v2/tokens/refresh",
            Endpoint::Providers => "/v2/providers",
        }
    }
}

/// `reqwest`-backed [`TokenService`].
#[derive(Debug, Clone)]
pub struct HttpTokenService {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTokenService {
    /// Builds a client for `base_url` with a per-request `timeout`.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, TokenError> {
        let parsed = url::Url::parse(base_url)
            .map_err(|e| TokenError::Configuration(format!("invalid token service URL '{base_url}': {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(TokenError::Configuration(format!(
                "token service URL must be http(s): {base_url}"
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TokenError::Configuration(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, endpoint: Endpoint) -> String {
        format!("{}{}", self.base_url, endpoint.path())
    }

    async fn post<B: Serialize + Sync>(
        &self,
        endpoint: Endpoint,
        body: &B,
    ) -> Result<TokenResponse, TokenError> {
        debug!(endpoint = endpoint.path(), "Calling token service");
        let response = self
            .client
            .post(self.url(endpoint))
            .json(body)
            .send()
            .await
            .map_err(|e| TokenError::Network(e.to_string()))?;

        decode(endpoint, response).await
    }
}

#[async_trait]
impl TokenService for HttpTokenService {
    async fn create(&self, request: &CreateTokenRequest) -> Result<TokenResponse, TokenError> {
        self.post(Endpoint::Create, request).await
    }

    async fn exchange(&self, request: &ExchangeTokenRequest) -> Result<TokenResponse, TokenError> {
        self.post(Endpoint::Exchange, request).await
    }

    async fn refresh(&self, request: &RefreshTokenRequest) -> Result<TokenResponse, TokenError> {
        self.post(Endpoint::Refresh, request).await
    }

    async fn providers(&self, organization_id: &str) -> Result<Vec<Provider>, TokenError> {
        let response = self
            .client
            .get(self.url(Endpoint::Providers))
            .query(&[("organization_id", organization_id)])
            .send()
            .await
            .map_err(|e| TokenError::Network(e.to_string()))?;

        let body: ProvidersResponse = decode(Endpoint::Providers, response).await?;
        Ok(body.providers)
    }
}

async fn decode<T: serde::de::DeserializeOwned>(
    endpoint: Endpoint,
    response: reqwest::Response,
) -> Result<T, TokenError> {
    let status = response.status();
    if status.is_success() {
        return response
            .json::<T>()
            .await
            .map_err(|e| TokenError::InvalidResponse(e.to_string()));
    }

    let body = response.text().await.unwrap_or_default();
    let err = classify_failure(endpoint, status, &body);
    warn!(endpoint = endpoint.path(), %status, error = %err, "Token service call failed");
    Err(err)
}

fn classify_failure(endpoint: Endpoint, status: StatusCode, body: &str) -> TokenError {
    let detail = error_detail(body).unwrap_or_else(|| status.to_string());
    match status {
        StatusCode::UNAUTHORIZED if endpoint == Endpoint::Refresh => TokenError::TokenExpired(detail),
        StatusCode::UNAUTHORIZED => TokenError::AuthFailed(detail),
        StatusCode::NOT_FOUND => {
            if detail.to_ascii_lowercase().contains("provider") {
                TokenError::ProviderNotFound(detail)
            } else {
                TokenError::OrgNotFound(detail)
            }
        }
        StatusCode::TOO_MANY_REQUESTS => TokenError::RateLimited(detail),
        _ => TokenError::InvalidResponse(format!("HTTP {}: {detail}", status.as_u16())),
    }
}

/// Pulls a human-readable message out of an error body.
fn error_detail(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }
    let value: serde_json::Value = match serde_json::from_str(trimmed) {
        Ok(value) => value,
        Err(_) => return Some(trimmed.to_string()),
    };
    ["error", "message", "detail"]
        .iter()
        .find_map(|key| value.get(*key).and_then(|v| v.as_str()).map(str::to_string))
        .or_else(|| Some(trimmed.to_string()))
}
