//! Crate-level error type.
//!
//! `TetherError` is what every public operation of the [`Supervisor`](crate::Supervisor)
//! and the [`Correlator`](crate::Correlator) returns. Errors from the token
//! domain ([`TokenError`]) and the transport domain ([`TransportError`]) are
//! wrapped rather than flattened so callers can still match on the origin.
//!
//! # Error Categories
//!
//! **Connection domain**:
//! - `Connection`: the broker could not be reached or refused the session
//! - `AuthRejected`: the broker rejected the credentials
//! - `ConnectionTimeout`: no acknowledgment within `connect_timeout_ms`
//! - `NotConnected`: the operation needs a live transport session
//! - `ConnectionLost`: the session dropped while the operation was in flight
//!
//! **Request/response domain**:
//! - `RequestTimeout`: no reply within the per-call timeout
//! - `Cancelled`: the call was cancelled explicitly or by teardown
//!
//! **Setup**:
//! - `Configuration`: missing, invalid or inconsistent setup (failed config
//!   validation, no token manager attached)
//!
//! The type is `Clone` so one outcome can be handed to every waiter of a
//! single-flight operation.
//!
//! ```ignore
//! match supervisor.request("svc/echo", &body, RequestOptions::default()).await {
//!     Ok(response) => println!("{} in {:?}", response.payload, response.latency),
//!     Err(TetherError::RequestTimeout { topic, .. }) => eprintln!("{topic} did not answer"),
//!     Err(e) => eprintln!("request failed: {e}"),
//! }
//! ```

use std::time::Duration;

use thiserror::Error;

use crate::{token::TokenError, transport::TransportError};

/// The unified error type for supervisor and request/response operations.
#[derive(Debug, Clone, Error)]
pub enum TetherError {
    /// Credential lifecycle failure (create, exchange, refresh).
    #[error("Token error: {0}")]
    Token(#[from] TokenError),

    /// Transport-level failure of a single operation.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The connection could not be established.
    ///
    /// Carries the last reason reported by the transport, e.g. a refused
    /// TCP connection or an exhausted reconnect budget.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The broker rejected the supplied credentials.
    ///
    /// Distinct from `Connection` because the remedy is a credential refresh,
    /// not another transport-level retry.
    #[error("Authentication rejected by broker: {0}")]
    AuthRejected(String),

    /// The connect acknowledgment did not arrive in time.
    #[error("Connection timed out after {0:?}")]
    ConnectionTimeout(Duration),

    /// No transport session exists.
    #[error("Not connected")]
    NotConnected,

    /// The session dropped while the operation was waiting.
    #[error("Connection lost")]
    ConnectionLost,

    /// A request received no reply before its timer fired.
    #[error("Request {correlation_id} to '{topic}' timed out after {timeout:?}")]
    RequestTimeout {
        correlation_id: String,
        topic: String,
        timeout: Duration,
    },

    /// The operation was cancelled before it completed.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Required setup is missing or inconsistent.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Payload could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for TetherError {
    fn from(err: serde_json::Error) -> Self {
        TetherError::Serialization(err.to_string())
    }
}

impl TetherError {
    /// Returns `true` for errors caused by rejected credentials, whichever
    /// layer reported them.
    pub fn is_auth(&self) -> bool {
        match self {
            TetherError::AuthRejected(_) => true,
            TetherError::Transport(e) => e.is_auth(),
            TetherError::Token(TokenError::AuthFailed(_) | TokenError::TokenExpired(_)) => true,
            _ => false,
        }
    }

    /// Returns `true` if retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            TetherError::NotConnected
            | TetherError::ConnectionLost
            | TetherError::ConnectionTimeout(_)
            | TetherError::RequestTimeout { .. } => true,
            TetherError::Transport(e) => !e.is_auth(),
            TetherError::Token(e) => e.is_retryable(),
            _ => false,
        }
    }
}
