//! The broker-facing seam of the crate.
//!
//! The [`Supervisor`](crate::Supervisor) never talks to an MQTT library
//! directly; it drives a [`Transport`] and consumes the [`TransportEvent`]
//! stream returned by [`Transport::connect`]. Two implementations ship:
//!
//! - [`RumqttTransport`]: `rumqttc` event loop (MQTT 3.1.1 or 5) with
//!   exponential backoff between reconnect attempts
//! - [`MemoryTransport`]: in-process [`MemoryBroker`] for tests and local runs
//!
//! A transport keeps reconnecting on its own after a session drops; the
//! supervisor decides when to give up and calls [`Transport::close`].

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::{config::TlsConfig, token::MqttCredentials};

mod builder;
mod kernel;
pub mod memory;
mod rumqtt;

pub use memory::{MemoryBroker, MemoryTransport};
pub use rumqtt::RumqttTransport;

/// Errors reported by a transport, either as a failed operation or as a
/// [`TransportEvent::Error`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The broker refused the credentials.
    #[error("Broker rejected credentials: {0}")]
    Auth(String),

    /// Connectivity failure; the transport retries on its own.
    #[error("Network error: {0}")]
    Network(String),

    /// Unrecoverable session failure (protocol violation, TLS setup).
    #[error("Fatal transport error: {0}")]
    Fatal(String),

    /// There is no live session to carry the operation.
    #[error("Not connected")]
    NotConnected,

    /// The broker refused a subscribe or unsubscribe.
    #[error("Rejected by broker: {0}")]
    Rejected(String),

    /// The session dropped before the broker acknowledged the operation.
    #[error("Interrupted: {0}")]
    Interrupted(String),

    /// The client could not be built from the given options.
    #[error("Client setup error: {0}")]
    Setup(String),

    /// The transport was closed.
    #[error("Transport closed")]
    Closed,
}

impl TransportError {
    /// Auth failures are recognised both by variant and by the message
    /// signatures brokers use for refused credentials.
    pub fn is_auth(&self) -> bool {
        match self {
            TransportError::Auth(_) => true,
            TransportError::Network(msg) | TransportError::Fatal(msg) => {
                is_auth_failure_message(msg)
            }
            _ => false,
        }
    }
}

/// Matches the messages brokers and client libraries use for refused credentials.
pub fn is_auth_failure_message(message: &str) -> bool {
    const SIGNATURES: &[&str] = &[
        "not authorized",
        "notauthorized",
        "bad username or password",
        "bad user name or password",
        "badusernamepassword",
        "authentication failed",
        "connection refused: 4",
        "connection refused: 5",
        "connection refused: 134",
        "connection refused: 135",
    ];
    let lowered = message.to_ascii_lowercase();
    SIGNATURES.iter().any(|sig| lowered.contains(sig))
}

/// MQTT protocol revision negotiated with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProtocolVersion {
    #[serde(rename = "3.1.1", alias = "v4", alias = "4")]
    V311,
    #[default]
    #[serde(rename = "5", alias = "v5")]
    V5,
}

/// MQTT 5 publish properties used by the crate. Ignored on 3.1.1 sessions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub correlation_data: Option<Bytes>,
    pub response_topic: Option<String>,
    pub user_properties: Vec<(String, String)>,
    pub message_expiry_interval: Option<u32>,
    pub payload_format_indicator: Option<u8>,
    pub content_type: Option<String>,
}

impl MessageProperties {
    pub fn is_empty(&self) -> bool {
        *self == MessageProperties::default()
    }

    /// First user property named `key`.
    pub fn user_property(&self, key: &str) -> Option<&str> {
        self.user_properties
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Per-publish options.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// `None` uses the configured default QoS.
    pub qos: Option<QoS>,
    pub retain: bool,
    pub properties: MessageProperties,
}

impl PublishOptions {
    pub fn qos(qos: QoS) -> Self {
        Self {
            qos: Some(qos),
            ..Self::default()
        }
    }
}

/// A message delivered by the broker.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub properties: MessageProperties,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
            properties: MessageProperties::default(),
        }
    }

    /// Payload parsed as JSON, `None` if it is not valid JSON.
    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.payload).ok()
    }
}

/// Last will registered with the broker at connect time.
#[derive(Debug, Clone)]
pub struct Will {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// Everything a transport needs to open (and reopen) a session.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    /// Use TLS even without a [`TlsConfig`] (platform roots).
    pub use_tls: bool,
    pub client_id: String,
    pub keep_alive: Duration,
    pub protocol: ProtocolVersion,
    pub clean_session: bool,
    pub credentials: Option<MqttCredentials>,
    pub reconnect_period: Duration,
    pub max_reconnect_delay: Duration,
    pub backoff_multiplier: f64,
    pub will: Option<Will>,
    pub max_packet_size: usize,
    pub request_channel_capacity: usize,
    pub max_inflight: u16,
    pub tls: Option<TlsConfig>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            use_tls: false,
            client_id: String::new(),
            keep_alive: Duration::from_secs(60),
            protocol: ProtocolVersion::default(),
            clean_session: true,
            credentials: None,
            reconnect_period: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            will: None,
            max_packet_size: 256 * 1024,
            request_channel_capacity: 64,
            max_inflight: 100,
            tls: None,
        }
    }
}

/// Session events, in the order the transport observed them.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Connect acknowledgment received.
    Connected { session_present: bool },
    /// An established session dropped.
    Offline(String),
    /// A connect attempt or the live session failed.
    Error(TransportError),
    /// A new connect attempt is starting after a failure.
    Reconnecting,
    /// The transport stopped for good; no more events follow.
    Closed,
    Message(InboundMessage),
}

/// Receiving side of a session's event stream.
pub type EventStream = mpsc::UnboundedReceiver<TransportEvent>;

/// A pub/sub client able to carry one logical session at a time.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Opens a session, replacing any previous one. Returns as soon as the
    /// attempt is underway; the outcome arrives on the event stream.
    async fn connect(&self, options: ConnectOptions) -> Result<EventStream, TransportError>;

    /// Subscribes and waits for the broker's grant.
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<QoS, TransportError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        options: &PublishOptions,
    ) -> Result<(), TransportError>;

    /// Stops the session and its reconnect loop. Emits `Closed`.
    async fn close(&self) -> Result<(), TransportError>;

    /// Credentials for the next connect attempt of the current session.
    fn update_credentials(&self, credentials: Option<MqttCredentials>);

    /// Whether [`MessageProperties`] reach the broker.
    fn supports_properties(&self) -> bool;

    /// Whether a session handle exists (connected or reconnecting).
    fn is_open(&self) -> bool;
}

/// MQTT topic filter matching with `+` and `#` wildcards.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if filter == topic {
        return true;
    }
    // Wildcards never match topics starting with '$'.
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

pub(crate) fn qos_from_u8(value: u8) -> QoS {
    match value {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}
