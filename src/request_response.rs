//! Request/response over pub/sub.
//!
//! A request is a publish carrying a correlation id and the caller's reply
//! topic. On MQTT 5 both travel as publish properties; on 3.1.1 sessions they
//! are embedded in the JSON body as `correlationId` and `responseTopic`.
//! Every inbound message is offered to [`Correlator::handle_message`] before
//! any other listener, so a matched reply is never delivered twice.
//!
//! ```ignore
//! let response = supervisor
//!     .request("svc/echo", &json!({ "q": 1 }), RequestOptions::timeout(Duration::from_secs(1)))
//!     .await?;
//! println!("{} after {:?}", response.payload, response.latency);
//! ```

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::QoS;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tokio::{sync::oneshot, task::JoinHandle, time::Instant};
use tracing::{debug, trace, warn};

use crate::{
    config::RequestConfig,
    correlation::CorrelationIdGenerator,
    error::TetherError,
    listeners::lock,
    transport::{InboundMessage, MessageProperties, PublishOptions},
};

/// Property and JSON field carrying the correlation id.
pub const CORRELATION_ID_FIELD: &str = "correlationId";
/// JSON field carrying the reply topic on 3.1.1 sessions.
pub const RESPONSE_TOPIC_FIELD: &str = "responseTopic";

/// What the correlator needs from the connection that carries it.
#[async_trait]
pub trait RequestLink: Send + Sync {
    /// Subscribes to `topic` unless already subscribed.
    async fn ensure_subscribed(&self, topic: &str, qos: QoS) -> Result<(), TetherError>;

    /// Publishes immediately; fails instead of buffering.
    async fn send(&self, topic: &str, payload: Bytes, options: PublishOptions) -> Result<(), TetherError>;

    fn supports_properties(&self) -> bool;
}

/// Per-request options.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Overrides `request.timeout_ms`.
    pub timeout: Option<Duration>,
    pub qos: Option<QoS>,
    pub user_properties: Vec<(String, String)>,
    /// Added to object payloads as `messageType`.
    pub message_type: Option<String>,
    /// Overrides `request.message_expiry_interval`.
    pub message_expiry_interval: Option<u32>,
}

impl RequestOptions {
    pub fn timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }
}

/// A reply matched to a pending request.
#[derive(Debug, Clone)]
pub struct Response {
    pub topic: String,
    pub correlation_id: String,
    /// Parsed body; non-JSON bodies become a JSON string.
    pub payload: Value,
    pub raw: Bytes,
    /// Time from publish to the reply's arrival.
    pub latency: Duration,
    pub properties: MessageProperties,
}

impl Response {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, TetherError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Where to send the answer to an inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyTarget {
    pub response_topic: String,
    pub correlation_id: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestStats {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub timeouts: u64,
    /// Publish failures and calls failed by a lost connection.
    pub errors: u64,
    pub cancelled: u64,
    /// Calls currently waiting.
    pub pending: usize,
}

type Completion = oneshot::Sender<Result<Response, TetherError>>;

struct PendingCall {
    topic: String,
    created: Instant,
    completion: Completion,
    timer: JoinHandle<()>,
}

impl PendingCall {
    fn finish(self, outcome: Result<Response, TetherError>) {
        self.timer.abort();
        let _ = self.completion.send(outcome);
    }
}

struct CorrelatorInner {
    config: RequestConfig,
    ids: CorrelationIdGenerator,
    pending: Mutex<HashMap<String, PendingCall>>,
    reply_topic: Mutex<Option<String>>,
    sender_id: Mutex<Option<String>>,
    stats: Mutex<RequestStats>,
}

/// Tracks pending calls and matches replies to them. Cheap to clone.
#[derive(Clone)]
pub struct Correlator {
    inner: Arc<CorrelatorInner>,
}

impl Correlator {
    pub fn new(config: RequestConfig) -> Self {
        let ids = CorrelationIdGenerator::new(config.id_format, config.correlation_id_prefix.clone());
        Self {
            inner: Arc::new(CorrelatorInner {
                config,
                ids,
                pending: Mutex::new(HashMap::new()),
                reply_topic: Mutex::new(None),
                sender_id: Mutex::new(None),
                stats: Mutex::new(RequestStats::default()),
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.config.enabled
    }

    /// Computes the reply topic for `self_id` and subscribes to it.
    /// Called again after every reconnect.
    pub async fn initialize(&self, link: &dyn RequestLink, self_id: &str) -> Result<String, TetherError> {
        let topic = self.inner.config.response_topic(self_id);
        *lock(&self.inner.reply_topic) = Some(topic.clone());
        *lock(&self.inner.sender_id) = Some(self_id.to_string());

        link.ensure_subscribed(&topic, QoS::AtLeastOnce).await?;
        debug!(reply_topic = %topic, "Request/response initialised");
        Ok(topic)
    }

    pub fn reply_topic(&self) -> Option<String> {
        lock(&self.inner.reply_topic).clone()
    }

    /// Publishes `payload` to `topic` and waits for the matching reply.
    pub async fn request<P>(
        &self,
        link: &dyn RequestLink,
        topic: &str,
        payload: &P,
        options: RequestOptions,
    ) -> Result<Response, TetherError>
    where
        P: Serialize + ?Sized,
    {
        if !self.is_enabled() {
            return Err(TetherError::Configuration("request/response is disabled".into()));
        }
        let reply_topic = self
            .reply_topic()
            .ok_or_else(|| TetherError::Configuration("request/response is not initialised; connect first".into()))?;

        let correlation_id = self.inner.ids.generate();
        let body = self.envelope(
            serde_json::to_value(payload)?,
            &correlation_id,
            &reply_topic,
            &options,
            link.supports_properties(),
        )?;
        let publish = PublishOptions {
            qos: options.qos,
            retain: false,
            properties: MessageProperties {
                correlation_data: Some(Bytes::from(correlation_id.clone())),
                response_topic: Some(reply_topic),
                user_properties: options
                    .user_properties
                    .iter()
                    .cloned()
                    .chain([(CORRELATION_ID_FIELD.to_string(), correlation_id.clone())])
                    .collect(),
                message_expiry_interval: options
                    .message_expiry_interval
                    .or(self.inner.config.message_expiry_interval),
                payload_format_indicator: Some(1),
                content_type: Some("application/json".to_string()),
            },
        };

        let timeout = options.timeout.unwrap_or_else(|| self.inner.config.timeout());
        let completion = self.register(&correlation_id, topic, timeout);

        if let Err(e) = link.send(topic, Bytes::from(body), publish).await {
            if let Some(call) = lock(&self.inner.pending).remove(&correlation_id) {
                call.timer.abort();
            }
            lock(&self.inner.stats).errors += 1;
            warn!(topic, correlation_id = %correlation_id, error = %e, "Request publish failed");
            return Err(e);
        }
        lock(&self.inner.stats).requests_sent += 1;
        trace!(topic, correlation_id = %correlation_id, "Request sent");

        match completion.await {
            Ok(outcome) => outcome,
            Err(_) => Err(TetherError::Cancelled(correlation_id)),
        }
    }

    fn envelope(
        &self,
        mut body: Value,
        correlation_id: &str,
        reply_topic: &str,
        options: &RequestOptions,
        native_properties: bool,
    ) -> Result<Vec<u8>, TetherError> {
        if let Value::Object(map) = &mut body {
            if self.inner.config.include_timestamps {
                let millis = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
                map.insert("timestamp".into(), Value::from(millis as i64));
            }
            if self.inner.config.include_sender_id {
                if let Some(sender) = lock(&self.inner.sender_id).clone() {
                    map.insert("senderId".into(), Value::String(sender));
                }
            }
            if let Some(kind) = &options.message_type {
                map.insert("messageType".into(), Value::String(kind.clone()));
            }
            if !native_properties {
                map.insert(CORRELATION_ID_FIELD.into(), Value::String(correlation_id.into()));
                map.insert(RESPONSE_TOPIC_FIELD.into(), Value::String(reply_topic.into()));
            }
        } else if !native_properties {
            return Err(TetherError::Serialization(
                "request payload must be a JSON object without MQTT 5 properties".into(),
            ));
        }
        Ok(serde_json::to_vec(&body)?)
    }

    fn register(
        &self,
        correlation_id: &str,
        topic: &str,
        timeout: Duration,
    ) -> oneshot::Receiver<Result<Response, TetherError>> {
        let (tx, rx) = oneshot::channel();
        let weak: Weak<CorrelatorInner> = Arc::downgrade(&self.inner);
        let id = correlation_id.to_string();
        let origin = topic.to_string();

        let mut pending = lock(&self.inner.pending);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(inner) = weak.upgrade() else { return };
            let Some(call) = lock(&inner.pending).remove(&id) else {
                return;
            };
            lock(&inner.stats).timeouts += 1;
            warn!(topic = %origin, correlation_id = %id, "Request timed out");
            let _ = call.completion.send(Err(TetherError::RequestTimeout {
                correlation_id: id,
                topic: origin,
                timeout,
            }));
        });
        pending.insert(
            correlation_id.to_string(),
            PendingCall {
                topic: topic.to_string(),
                created: Instant::now(),
                completion: tx,
                timer,
            },
        );
        rx
    }

    /// Claims `message` if it answers a pending call. A claimed message must
    /// not reach other listeners.
    pub fn handle_message(&self, message: &InboundMessage) -> bool {
        let reply_topic = self.reply_topic();
        let on_reply_topic = reply_topic.as_deref() == Some(message.topic.as_str());

        let Some(correlation_id) = extract_correlation_id(message, on_reply_topic) else {
            return false;
        };

        let call = {
            let mut pending = lock(&self.inner.pending);
            match pending.get(&correlation_id) {
                // Our own request echoed back on a topic we also subscribe to.
                Some(call) if call.topic == message.topic && !on_reply_topic => return false,
                Some(_) => pending.remove(&correlation_id),
                None => None,
            }
        };
        let Some(call) = call else {
            return false;
        };

        let latency = call.created.elapsed();
        lock(&self.inner.stats).responses_received += 1;
        debug!(
            correlation_id = %correlation_id,
            latency_ms = latency.as_millis() as u64,
            "Response matched"
        );
        call.finish(Ok(Response {
            topic: message.topic.clone(),
            correlation_id,
            payload: parse_body(&message.payload),
            raw: message.payload.clone(),
            latency,
            properties: message.properties.clone(),
        }));
        true
    }

    /// Rejects one pending call with `Cancelled`. Returns whether it existed.
    pub fn cancel_request(&self, correlation_id: &str) -> bool {
        let Some(call) = lock(&self.inner.pending).remove(correlation_id) else {
            return false;
        };
        lock(&self.inner.stats).cancelled += 1;
        call.finish(Err(TetherError::Cancelled(correlation_id.to_string())));
        true
    }

    /// Rejects every pending call with `Cancelled`.
    pub fn cancel_all(&self) -> usize {
        let drained = self.drain();
        let count = drained.len();
        lock(&self.inner.stats).cancelled += count as u64;
        for (id, call) in drained {
            call.finish(Err(TetherError::Cancelled(id)));
        }
        count
    }

    /// Rejects every pending call with `ConnectionLost`.
    pub fn fail_all(&self) -> usize {
        let drained = self.drain();
        let count = drained.len();
        if count > 0 {
            warn!(count, "Failing pending requests after connection loss");
        }
        lock(&self.inner.stats).errors += count as u64;
        for (_, call) in drained {
            call.finish(Err(TetherError::ConnectionLost));
        }
        count
    }

    fn drain(&self) -> Vec<(String, PendingCall)> {
        lock(&self.inner.pending).drain().collect()
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    pub fn stats(&self) -> RequestStats {
        RequestStats {
            pending: self.pending_count(),
            ..*lock(&self.inner.stats)
        }
    }

    pub fn reset_stats(&self) {
        *lock(&self.inner.stats) = RequestStats::default();
    }

    /// Reply address of an inbound request, from properties or, failing
    /// that, the JSON body.
    pub fn reply_target(message: &InboundMessage) -> Option<ReplyTarget> {
        let props = &message.properties;
        let from_props = props.response_topic.clone().zip(
            props
                .correlation_data
                .as_ref()
                .and_then(|data| String::from_utf8(data.to_vec()).ok())
                .or_else(|| props.user_property(CORRELATION_ID_FIELD).map(str::to_string)),
        );
        let (response_topic, correlation_id) = match from_props {
            Some(found) => found,
            None => {
                let body = message.json()?;
                let topic = body.get(RESPONSE_TOPIC_FIELD)?.as_str()?.to_string();
                let id = body.get(CORRELATION_ID_FIELD)?.as_str()?.to_string();
                (topic, id)
            }
        };
        Some(ReplyTarget {
            response_topic,
            correlation_id,
        })
    }

    /// Body and options for answering `target`.
    pub(crate) fn reply_envelope(
        target: &ReplyTarget,
        mut body: Value,
        native_properties: bool,
    ) -> Result<(Bytes, PublishOptions), TetherError> {
        let mut options = PublishOptions::default();
        if native_properties {
            options.properties.correlation_data = Some(Bytes::from(target.correlation_id.clone()));
            options.properties.payload_format_indicator = Some(1);
        } else {
            match &mut body {
                Value::Object(map) => {
                    map.insert(
                        CORRELATION_ID_FIELD.into(),
                        Value::String(target.correlation_id.clone()),
                    );
                }
                _ => {
                    return Err(TetherError::Serialization(
                        "reply payload must be a JSON object without MQTT 5 properties".into(),
                    ))
                }
            }
        }
        Ok((Bytes::from(serde_json::to_vec(&body)?), options))
    }
}

impl std::fmt::Debug for Correlator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Correlator")
            .field("reply_topic", &self.reply_topic())
            .field("pending", &self.pending_count())
            .finish()
    }
}

fn extract_correlation_id(message: &InboundMessage, on_reply_topic: bool) -> Option<String> {
    if let Some(data) = &message.properties.correlation_data {
        if let Ok(id) = std::str::from_utf8(data) {
            return Some(id.to_string());
        }
    }
    if let Some(id) = message.properties.user_property(CORRELATION_ID_FIELD) {
        return Some(id.to_string());
    }
    if on_reply_topic {
        let body = message.json()?;
        return body.get(CORRELATION_ID_FIELD)?.as_str().map(str::to_string);
    }
    None
}

fn parse_body(payload: &[u8]) -> Value {
    serde_json::from_slice(payload)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(payload).into_owned()))
}
