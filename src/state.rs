//! Connection state of a [`Supervisor`](crate::Supervisor).
//!
//! The supervisor publishes every transition through a `tokio::sync::watch`
//! channel, so application code can either poll [`Supervisor::state`](crate::Supervisor::state)
//! or await changes on [`Supervisor::watch_state`](crate::Supervisor::watch_state).
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Reconnecting(n) -> Connected
//!                                         \-> Error(reason)
//! any -> Disconnecting -> Disconnected
//! ```

use std::fmt;

/// Logical state of the broker session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// No session. Carries the reason of the last transition into this state.
    Disconnected(String),

    /// Opening the transport and waiting for the connect acknowledgment.
    Connecting,

    /// Session established; publishes go out immediately.
    Connected,

    /// The transport lost the session and is retrying. Carries the
    /// consecutive attempt number, starting at 1.
    Reconnecting(u32),

    /// An explicit disconnect is in progress.
    Disconnecting,

    /// The supervisor gave up: credentials rejected or the reconnect budget
    /// is exhausted. Only a new `connect()` leaves this state.
    Error(String),
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Disconnected(String::new())
    }
}

impl ConnectionState {
    /// Short static name of the state, for logs and metrics labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected(_) => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Reconnecting(_) => "Reconnecting",
            ConnectionState::Disconnecting => "Disconnecting",
            ConnectionState::Error(_) => "Error",
        }
    }

    /// Context attached to the state, empty when there is none.
    pub fn details(&self) -> String {
        match self {
            ConnectionState::Disconnected(reason) | ConnectionState::Error(reason) => {
                reason.clone()
            }
            ConnectionState::Reconnecting(attempt) => format!("attempt {attempt}"),
            _ => String::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// `true` while a connection is being established or re-established.
    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Reconnecting(_)
        )
    }

    /// `true` for states that only an explicit `connect()` leaves.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected(_) | ConnectionState::Error(_)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())?;
        let details = self.details();
        if !details.is_empty() {
            write!(f, " ({details})")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "Connected");
        assert_eq!(
            ConnectionState::Reconnecting(3).to_string(),
            "Reconnecting (attempt 3)"
        );
        assert_eq!(
            ConnectionState::Error("bad credentials".into()).to_string(),
            "Error (bad credentials)"
        );
        assert_eq!(ConnectionState::default().to_string(), "Disconnected");
    }

    #[test]
    fn test_state_predicates() {
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Reconnecting(1).is_connected());

        assert!(ConnectionState::Connecting.is_connecting());
        assert!(ConnectionState::Reconnecting(2).is_connecting());
        assert!(!ConnectionState::Disconnecting.is_connecting());

        assert!(ConnectionState::Error("x".into()).is_terminal());
        assert!(ConnectionState::Disconnected("x".into()).is_terminal());
        assert!(!ConnectionState::Connected.is_terminal());
    }
}
