use thiserror::Error;

/// Failures of the credential lifecycle.
///
/// `Clone` so a single refresh outcome can be shared by every caller that
/// joined it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TokenError {
    /// The token service could not be reached.
    #[error("Network error: {0}")]
    Network(String),

    /// Secret, identity or external token rejected (HTTP 401 on create/exchange).
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// The stored credential can no longer be refreshed (HTTP 401 on refresh).
    #[error("Token expired: {0}")]
    TokenExpired(String),

    /// Unexpected status or undecodable body.
    #[error("Invalid response from token service: {0}")]
    InvalidResponse(String),

    /// Every refresh attempt failed.
    #[error("Token refresh failed after {attempts} attempt(s): {last}")]
    RefreshFailed { attempts: u32, last: Box<TokenError> },

    #[error("Identity provider not found: {0}")]
    ProviderNotFound(String),

    #[error("Organization not found: {0}")]
    OrgNotFound(String),

    /// HTTP 429.
    #[error("Rate limited by token service: {0}")]
    RateLimited(String),

    /// An operation needs a stored credential and there is none.
    #[error("No token available")]
    MissingToken,

    /// The manager is missing required setup, e.g. the service URL.
    #[error("Token configuration error: {0}")]
    Configuration(String),

    /// The manager was destroyed while the operation was in flight.
    #[error("Token manager destroyed")]
    Destroyed,
}

impl TokenError {
    /// Whether a later attempt of the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TokenError::Network(_) | TokenError::RateLimited(_) | TokenError::InvalidResponse(_)
        )
    }
}
