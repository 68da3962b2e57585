//! tether: resilient MQTT sessions with credential lifecycle and
//! request/response over publish/subscribe
//!
//! The crate keeps one logical broker session alive across network failures,
//! replays subscriptions after every reconnect, buffers publishes while the
//! session is down and correlates request/reply exchanges. Broker credentials
//! can come from a token service that is refreshed before expiry.
//!
//! ## Modules
//!
//! * `supervisor` ([`Supervisor`]): connection state machine, reconnect and
//!   resubscribe, offline buffering, auth-rejection handling, message dispatch.
//!
//! * `manager` ([`MqttManager`]): builds a supervisor from a [`Config`].
//!
//! * `token` ([`TokenManager`]): obtains broker credentials from the token
//!   service and refreshes them on schedule or on demand.
//!
//! * `request_response` ([`Correlator`]): pending-call table, reply topic
//!   management and reply helpers.
//!
//! * `correlation` ([`CorrelationIdGenerator`]): sequential, UUID, short and
//!   timestamp identifiers.
//!
//! * `transport`: the [`Transport`] seam, a `rumqttc` implementation for
//!   MQTT 3.1.1 and 5, and an in-process [`MemoryBroker`] for tests.
//!
//! * `config`: TOML configuration, presets and validation.
//!
//! * `logger`: optional `tracing` subscriber setup for applications.
//!
//! ## Example
//!
//! ```ignore
//! let supervisor = MqttManager::from_config(Config::new()?)?.build()?;
//! supervisor.connect(ConnectParams::with_credentials("device", "secret")).await?;
//!
//! supervisor
//!     .subscribe("sensors/+", SubscribeOptions::default().handler(|m| println!("{}", m.topic)))
//!     .await?;
//! let reply = supervisor
//!     .request("svc/echo", &serde_json::json!({ "ping": 1 }), RequestOptions::default())
//!     .await?;
//! ```
//!
//! ## Features
//!
//! * `journald`: systemd journald output for [`LoggerManager`] (default: enabled).

pub mod backoff;
pub mod config;
pub mod correlation;
pub mod error;
pub mod listeners;
pub mod logger;
pub mod manager;
pub mod offline;
pub mod request_response;
pub mod state;
pub mod subscriptions;
pub mod supervisor;
pub mod token;
pub mod transport;

pub use config::{Config, ConfigError, Preset};
pub use correlation::{CorrelationIdGenerator, IdFormat};
pub use error::TetherError;
pub use listeners::ListenerHandle;
pub use logger::{LoggerError, LoggerManager};
pub use manager::MqttManager;
pub use request_response::{Correlator, ReplyTarget, RequestOptions, RequestStats, Response};
pub use state::ConnectionState;
pub use supervisor::{
    ConnectParams, PublishOutcome, SubscribeOptions, Supervisor, TokenConnectParams,
};
pub use token::{MqttCredentials, TokenError, TokenInfo, TokenManager, TokenState};
pub use transport::{
    InboundMessage, MemoryBroker, MessageProperties, ProtocolVersion, PublishOptions, Transport,
    TransportError, Will,
};

pub use rumqttc::QoS;

pub type Result<T> = std::result::Result<T, TetherError>;
