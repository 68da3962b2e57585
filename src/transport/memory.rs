//! In-process broker and transport.
//!
//! [`MemoryBroker`] routes publishes between [`MemoryTransport`] clients and
//! lets a test flip the broker offline, refuse credentials or reject
//! individual topic filters. Sessions reconnect on a fixed period, so tests
//! run deterministically under paused Tokio time.
//!
//! ```ignore
//! let broker = MemoryBroker::new();
//! let transport = Arc::new(broker.transport());
//! let supervisor = MqttManager::from_config(config).with_transport(transport).build()?;
//! broker.set_online(false);
//! ```

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::QoS;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{
    qos_from_u8, topic_matches, ConnectOptions, EventStream, InboundMessage, ProtocolVersion,
    PublishOptions, Transport, TransportError, TransportEvent,
};
use crate::{listeners::lock, token::MqttCredentials};

struct Session {
    events: mpsc::UnboundedSender<TransportEvent>,
    options: ConnectOptions,
    subscriptions: Vec<(String, QoS)>,
    connected: bool,
    generation: u64,
}

impl Session {
    fn send(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }
}

struct BrokerState {
    online: bool,
    reject_auth: bool,
    accepted_password: Option<String>,
    properties: bool,
    rejected_filters: Vec<String>,
    sessions: HashMap<String, Session>,
    next_generation: u64,
    connect_attempts: u32,
    subscribe_calls: Vec<String>,
    published: Vec<InboundMessage>,
}

impl BrokerState {
    fn refuses(&self, credentials: Option<&MqttCredentials>) -> bool {
        if self.reject_auth {
            return true;
        }
        match (&self.accepted_password, credentials) {
            (Some(expected), Some(creds)) => &creds.password != expected,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    fn session_mut(&mut self, client_id: &str, generation: u64) -> Option<&mut Session> {
        self.sessions
            .get_mut(client_id)
            .filter(|s| s.generation == generation)
    }

    fn deliver(&self, message: &InboundMessage) {
        for session in self.sessions.values().filter(|s| s.connected) {
            let granted = session
                .subscriptions
                .iter()
                .filter(|(filter, _)| topic_matches(filter, &message.topic))
                .map(|(_, qos)| *qos as u8)
                .max();
            let Some(granted) = granted else { continue };

            let mut copy = message.clone();
            copy.qos = qos_from_u8(granted.min(message.qos as u8));
            if !self.properties || session.options.protocol != ProtocolVersion::V5 {
                copy.properties = Default::default();
            }
            session.send(TransportEvent::Message(copy));
        }
    }
}

/// Shared in-process broker. Cheap to clone.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                online: true,
                reject_auth: false,
                accepted_password: None,
                properties: true,
                rejected_filters: Vec::new(),
                sessions: HashMap::new(),
                next_generation: 0,
                connect_attempts: 0,
                subscribe_calls: Vec::new(),
                published: Vec::new(),
            })),
        }
    }

    /// A new client of this broker.
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            broker: self.clone(),
            handle: Mutex::new(None),
        }
    }

    /// Taking the broker offline drops every live session; clients retry on
    /// their reconnect period until it comes back. Needs a Tokio runtime.
    pub fn set_online(&self, online: bool) {
        let mut st = lock(&self.state);
        st.online = online;
        if online {
            return;
        }
        let mut dropped = Vec::new();
        for (client_id, session) in st.sessions.iter_mut().filter(|(_, s)| s.connected) {
            drop_connection(session, "broker went offline");
            dropped.push((client_id.clone(), session.generation, session.options.reconnect_period));
        }
        drop(st);
        for (client_id, generation, period) in dropped {
            schedule_retry(Arc::clone(&self.state), client_id, generation, period);
        }
    }

    /// Drops one client's connection as if the network failed.
    pub fn kick(&self, client_id: &str) {
        let mut st = lock(&self.state);
        let Some(session) = st.sessions.get_mut(client_id).filter(|s| s.connected) else {
            return;
        };
        drop_connection(session, "connection reset by broker");
        let (generation, period) = (session.generation, session.options.reconnect_period);
        drop(st);
        schedule_retry(Arc::clone(&self.state), client_id.to_string(), generation, period);
    }

    /// Refuse every connect with "not authorized".
    pub fn set_reject_auth(&self, reject: bool) {
        lock(&self.state).reject_auth = reject;
    }

    /// Only accept connects carrying this password. `None` accepts any.
    pub fn accept_password(&self, password: Option<&str>) {
        lock(&self.state).accepted_password = password.map(str::to_string);
    }

    /// Answer subscribes to exactly this filter with a failure code.
    pub fn reject_subscriptions_to(&self, filter: &str) {
        lock(&self.state).rejected_filters.push(filter.to_string());
    }

    /// `false` behaves like a 3.1.1-only broker: properties are stripped.
    pub fn set_properties_supported(&self, supported: bool) {
        lock(&self.state).properties = supported;
    }

    /// Publishes as the broker itself.
    pub fn inject(&self, message: InboundMessage) {
        let st = lock(&self.state);
        st.deliver(&message);
    }

    pub fn connect_attempts(&self) -> u32 {
        lock(&self.state).connect_attempts
    }

    /// Every subscribe the broker received, in order.
    pub fn subscribe_calls(&self) -> Vec<String> {
        lock(&self.state).subscribe_calls.clone()
    }

    pub fn subscriptions(&self, client_id: &str) -> Vec<(String, QoS)> {
        lock(&self.state)
            .sessions
            .get(client_id)
            .map(|s| s.subscriptions.clone())
            .unwrap_or_default()
    }

    /// Every publish the broker accepted from clients, in order.
    pub fn published(&self) -> Vec<InboundMessage> {
        lock(&self.state).published.clone()
    }

    pub fn is_connected(&self, client_id: &str) -> bool {
        lock(&self.state)
            .sessions
            .get(client_id)
            .is_some_and(|s| s.connected)
    }

    /// Password of the credentials the client last connected with.
    pub fn session_password(&self, client_id: &str) -> Option<String> {
        lock(&self.state)
            .sessions
            .get(client_id)
            .and_then(|s| s.options.credentials.as_ref().map(|c| c.password.clone()))
    }
}

fn drop_connection(session: &mut Session, reason: &str) {
    session.connected = false;
    if session.options.clean_session {
        session.subscriptions.clear();
    }
    session.send(TransportEvent::Offline(reason.to_string()));
    session.send(TransportEvent::Error(TransportError::Network(reason.to_string())));
}

fn try_connect(state: &Arc<Mutex<BrokerState>>, client_id: &str, generation: u64) {
    let mut st = lock(state);
    st.connect_attempts += 1;

    let Some(session) = st.sessions.get(client_id).filter(|s| s.generation == generation) else {
        return;
    };
    let failure = if !st.online {
        Some(TransportError::Network("Connection refused: broker unavailable".into()))
    } else if st.refuses(session.options.credentials.as_ref()) {
        Some(TransportError::Auth("Connection refused: Not authorized".into()))
    } else {
        None
    };
    let period = session.options.reconnect_period;

    let Some(session) = st.session_mut(client_id, generation) else {
        return;
    };
    match failure {
        None => {
            session.connected = true;
            let session_present = !session.subscriptions.is_empty();
            debug!(client_id, session_present, "Memory broker accepted connection");
            session.send(TransportEvent::Connected { session_present });
        }
        Some(err) => {
            debug!(client_id, error = %err, "Memory broker refused connection");
            session.send(TransportEvent::Error(err));
            drop(st);
            schedule_retry(Arc::clone(state), client_id.to_string(), generation, period);
        }
    }
}

fn schedule_retry(
    state: Arc<Mutex<BrokerState>>,
    client_id: String,
    generation: u64,
    period: std::time::Duration,
) {
    tokio::spawn(async move {
        tokio::time::sleep(period).await;
        {
            let mut st = lock(&state);
            match st.session_mut(&client_id, generation) {
                Some(session) if !session.connected => session.send(TransportEvent::Reconnecting),
                _ => return,
            }
        }
        try_connect(&state, &client_id, generation);
    });
}

/// One client of a [`MemoryBroker`].
pub struct MemoryTransport {
    broker: MemoryBroker,
    handle: Mutex<Option<(String, u64)>>,
}

impl MemoryTransport {
    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }

    fn handle(&self) -> Result<(String, u64), TransportError> {
        lock(&self.handle).clone().ok_or(TransportError::NotConnected)
    }

    fn with_session<R>(
        &self,
        f: impl FnOnce(&mut BrokerState, &str, u64) -> Result<R, TransportError>,
    ) -> Result<R, TransportError> {
        let (client_id, generation) = self.handle()?;
        let mut st = lock(&self.broker.state);
        match st.sessions.get(&client_id) {
            Some(s) if s.generation == generation && s.connected => {}
            _ => return Err(TransportError::NotConnected),
        }
        f(&mut *st, &client_id, generation)
    }

    fn end_session(&self) {
        let Some((client_id, generation)) = lock(&self.handle).take() else {
            return;
        };
        let mut st = lock(&self.broker.state);
        if st.sessions.get(&client_id).is_some_and(|s| s.generation == generation) {
            if let Some(session) = st.sessions.remove(&client_id) {
                session.send(TransportEvent::Closed);
            }
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, options: ConnectOptions) -> Result<EventStream, TransportError> {
        self.end_session();

        let (tx, rx) = mpsc::unbounded_channel();
        let client_id = options.client_id.clone();
        let generation = {
            let mut st = lock(&self.broker.state);
            st.next_generation += 1;
            let generation = st.next_generation;

            // A persistent session keeps its subscriptions across clients.
            let kept = match st.sessions.remove(&client_id) {
                Some(old) => {
                    old.send(TransportEvent::Closed);
                    if options.clean_session {
                        Vec::new()
                    } else {
                        old.subscriptions
                    }
                }
                None => Vec::new(),
            };
            st.sessions.insert(
                client_id.clone(),
                Session {
                    events: tx,
                    options,
                    subscriptions: kept,
                    connected: false,
                    generation,
                },
            );
            generation
        };
        *lock(&self.handle) = Some((client_id.clone(), generation));

        try_connect(&self.broker.state, &client_id, generation);
        Ok(rx)
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<QoS, TransportError> {
        self.with_session(|st, client_id, generation| {
            st.subscribe_calls.push(topic.to_string());
            if st.rejected_filters.iter().any(|f| f == topic) {
                return Err(TransportError::Rejected(format!("Subscription to {topic} refused")));
            }
            let session = st
                .session_mut(client_id, generation)
                .ok_or(TransportError::NotConnected)?;
            match session.subscriptions.iter_mut().find(|(f, _)| f == topic) {
                Some(existing) => existing.1 = qos,
                None => session.subscriptions.push((topic.to_string(), qos)),
            }
            trace!(client_id, topic, "Memory broker subscription added");
            Ok(qos)
        })
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.with_session(|st, client_id, generation| {
            let session = st
                .session_mut(client_id, generation)
                .ok_or(TransportError::NotConnected)?;
            session.subscriptions.retain(|(f, _)| f != topic);
            Ok(())
        })
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        options: &PublishOptions,
    ) -> Result<(), TransportError> {
        self.with_session(|st, _, _| {
            let message = InboundMessage {
                topic: topic.to_string(),
                payload,
                qos: options.qos.unwrap_or(QoS::AtLeastOnce),
                retain: options.retain,
                properties: if st.properties {
                    options.properties.clone()
                } else {
                    Default::default()
                },
            };
            st.published.push(message.clone());
            st.deliver(&message);
            Ok(())
        })
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.end_session();
        Ok(())
    }

    fn update_credentials(&self, credentials: Option<MqttCredentials>) {
        let Ok((client_id, generation)) = self.handle() else {
            return;
        };
        let mut st = lock(&self.broker.state);
        if let Some(session) = st.session_mut(&client_id, generation) {
            session.options.credentials = credentials;
        }
    }

    fn supports_properties(&self) -> bool {
        let Ok((client_id, generation)) = self.handle() else {
            return false;
        };
        let st = lock(&self.broker.state);
        st.properties
            && st
                .sessions
                .get(&client_id)
                .filter(|s| s.generation == generation)
                .is_some_and(|s| s.options.protocol == ProtocolVersion::V5)
    }

    fn is_open(&self) -> bool {
        let Ok((client_id, generation)) = self.handle() else {
            return false;
        };
        lock(&self.broker.state)
            .sessions
            .get(&client_id)
            .is_some_and(|s| s.generation == generation)
    }
}
