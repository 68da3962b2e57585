//! Connection kernel: drives a `rumqttc` event loop for one logical session.
//!
//! The kernel owns the event loop. It translates packets into
//! [`TransportEvent`]s, classifies failures, sleeps with exponential backoff
//! between attempts and rebuilds the client when credentials change. The
//! sending side lives in [`Link`], shared with [`RumqttTransport`].
//!
//! [`RumqttTransport`]: super::RumqttTransport

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, RwLock,
    },
};

use rumqttc::{
    v5::{self, mqttbytes::v5::SubscribeReasonCode as SubscribeReasonCode5},
    ConnectReturnCode, ConnectionError, Event, Packet, QoS, SubscribeReasonCode,
};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{
    builder::{self, from_publish_properties, from_v5_qos, ClientHandle, EventLoopHandle},
    is_auth_failure_message, ConnectOptions, InboundMessage, MessageProperties, TransportError,
    TransportEvent,
};
use crate::{backoff::Backoff, listeners::lock, token::MqttCredentials};

pub(crate) type SubAckSender = oneshot::Sender<Result<QoS, TransportError>>;
pub(crate) type UnsubAckSender = oneshot::Sender<Result<(), TransportError>>;

/// Waiters for SUBACK/UNSUBACK. Acks arrive in request order, so each
/// queue is answered front to back.
#[derive(Default)]
pub(crate) struct AckQueues {
    pub subscribes: VecDeque<SubAckSender>,
    pub unsubscribes: VecDeque<UnsubAckSender>,
}

impl AckQueues {
    fn fail_all(&mut self, reason: &TransportError) {
        for waiter in self.subscribes.drain(..) {
            let _ = waiter.send(Err(reason.clone()));
        }
        for waiter in self.unsubscribes.drain(..) {
            let _ = waiter.send(Err(reason.clone()));
        }
    }
}

/// State shared between the kernel task and callers.
pub(crate) struct Link {
    client: RwLock<ClientHandle>,
    options: Mutex<ConnectOptions>,
    /// `Some` when credentials changed since the client was built.
    pending_credentials: Mutex<Option<Option<MqttCredentials>>>,
    connected: AtomicBool,
    pub acks: Mutex<AckQueues>,
    /// Serializes "enqueue waiter + send request" so ack order matches.
    pub order: tokio::sync::Mutex<()>,
    pub cancel: CancellationToken,
}

impl Link {
    pub fn client(&self) -> ClientHandle {
        match self.client.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn options(&self) -> ConnectOptions {
        lock(&self.options).clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn set_pending_credentials(&self, credentials: Option<MqttCredentials>) {
        *lock(&self.pending_credentials) = Some(credentials);
    }

    fn replace_client(&self, client: ClientHandle) {
        match self.client.write() {
            Ok(mut guard) => *guard = client,
            Err(poisoned) => *poisoned.into_inner() = client,
        }
    }
}

/// Internal view of one event loop tick.
enum Polled {
    ConnAck { session_present: bool },
    Message(InboundMessage),
    SubAck(Result<QoS, TransportError>),
    UnsubAck,
    Disconnect,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Fatal,
    Reconnect,
}

pub(crate) struct ConnectionKernel {
    link: Arc<Link>,
    event_loop: EventLoopHandle,
    events: mpsc::UnboundedSender<TransportEvent>,
    backoff: Backoff,
}

impl ConnectionKernel {
    /// Builds the first client and the shared link.
    pub fn new(
        options: ConnectOptions,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<(Self, Arc<Link>), TransportError> {
        let (client, event_loop) = builder::build(&options)?;
        let backoff = Backoff::new(
            options.reconnect_period,
            options.max_reconnect_delay,
            options.backoff_multiplier,
        );
        let link = Arc::new(Link {
            client: RwLock::new(client),
            options: Mutex::new(options),
            pending_credentials: Mutex::new(None),
            connected: AtomicBool::new(false),
            acks: Mutex::new(AckQueues::default()),
            order: tokio::sync::Mutex::new(()),
            cancel: CancellationToken::new(),
        });
        let kernel = Self {
            link: Arc::clone(&link),
            event_loop,
            events,
            backoff,
        };
        Ok((kernel, link))
    }

    /// Runs until cancelled or a fatal error. Always ends with `Closed`.
    pub async fn run(mut self) {
        debug!("Starting connection event loop");
        loop {
            tokio::select! {
                biased;

                _ = self.link.cancel.cancelled() => {
                    self.flush_disconnect().await;
                    break;
                }

                polled = self.event_loop.poll() => match polled {
                    Ok(polled) => self.handle(polled),
                    Err((err, disposition)) => {
                        if !self.on_failure(err, disposition).await {
                            break;
                        }
                    }
                }
            }
        }

        self.link.connected.store(false, Ordering::Release);
        lock(&self.link.acks).fail_all(&TransportError::Closed);
        let _ = self.events.send(TransportEvent::Closed);
        info!("Connection kernel stopped");
    }

    fn handle(&mut self, polled: Polled) {
        match polled {
            Polled::ConnAck { session_present } => {
                info!(session_present, "Connection established");
                self.link.connected.store(true, Ordering::Release);
                self.backoff.reset();
                let _ = self.events.send(TransportEvent::Connected { session_present });
            }
            Polled::Message(message) => {
                trace!(topic = %message.topic, bytes = message.payload.len(), "Received publish");
                let _ = self.events.send(TransportEvent::Message(message));
            }
            Polled::SubAck(result) => {
                if let Some(waiter) = lock(&self.link.acks).subscribes.pop_front() {
                    let _ = waiter.send(result);
                }
            }
            Polled::UnsubAck => {
                if let Some(waiter) = lock(&self.link.acks).unsubscribes.pop_front() {
                    let _ = waiter.send(Ok(()));
                }
            }
            Polled::Disconnect => warn!("Disconnect packet received from broker"),
            Polled::Other => {}
        }
    }

    /// Returns `false` when the kernel should stop.
    async fn on_failure(&mut self, err: TransportError, disposition: Disposition) -> bool {
        let was_connected = self.link.connected.swap(false, Ordering::AcqRel);
        lock(&self.link.acks).fail_all(&TransportError::Interrupted(err.to_string()));

        if was_connected {
            warn!(error = %err, "Connection lost");
            let _ = self.events.send(TransportEvent::Offline(err.to_string()));
        }
        let _ = self.events.send(TransportEvent::Error(err.clone()));

        if disposition == Disposition::Fatal {
            error!(error = %err, "Fatal connection error, stopping");
            return false;
        }

        let delay = self.backoff.next_sleep();
        warn!(
            "Reconnecting in {:.2} seconds due to error: {}",
            delay.as_secs_f64(),
            err
        );
        tokio::select! {
            _ = self.link.cancel.cancelled() => return false,
            _ = tokio::time::sleep(delay) => {}
        }

        if let Err(e) = self.apply_pending_credentials() {
            error!(error = %e, "Cannot rebuild client with new credentials");
            let _ = self.events.send(TransportEvent::Error(e));
            return false;
        }

        let _ = self.events.send(TransportEvent::Reconnecting);
        true
    }

    fn apply_pending_credentials(&mut self) -> Result<(), TransportError> {
        let Some(credentials) = lock(&self.link.pending_credentials).take() else {
            return Ok(());
        };
        let options = {
            let mut options = lock(&self.link.options);
            options.credentials = credentials;
            options.clone()
        };
        let (client, event_loop) = builder::build(&options)?;
        self.link.replace_client(client);
        self.event_loop = event_loop;
        debug!("Client rebuilt with refreshed credentials");
        Ok(())
    }

    /// Gives a queued DISCONNECT one chance to reach the broker.
    async fn flush_disconnect(&mut self) {
        if !self.link.is_connected() {
            return;
        }
        let grace = std::time::Duration::from_millis(500);
        let _ = tokio::time::timeout(grace, self.event_loop.poll()).await;
    }
}

impl EventLoopHandle {
    async fn poll(&mut self) -> Result<Polled, (TransportError, Disposition)> {
        match self {
            EventLoopHandle::V311(event_loop) => match event_loop.poll().await {
                Ok(event) => Ok(translate_v311(event)),
                Err(e) => Err(classify_v311(&e)),
            },
            EventLoopHandle::V5(event_loop) => match event_loop.poll().await {
                Ok(event) => Ok(translate_v5(event)),
                Err(e) => Err(classify_v5(&e)),
            },
        }
    }
}

fn translate_v311(event: Event) -> Polled {
    let Event::Incoming(packet) = event else {
        return Polled::Other;
    };
    match packet {
        Packet::ConnAck(ack) if ack.code == ConnectReturnCode::Success => Polled::ConnAck {
            session_present: ack.session_present,
        },
        Packet::Publish(publish) => Polled::Message(InboundMessage {
            topic: publish.topic,
            payload: publish.payload,
            qos: publish.qos,
            retain: publish.retain,
            properties: MessageProperties::default(),
        }),
        Packet::SubAck(ack) => Polled::SubAck(match ack.return_codes.first() {
            Some(SubscribeReasonCode::Success(qos)) => Ok(*qos),
            Some(code) => Err(TransportError::Rejected(format!("{code:?}"))),
            None => Err(TransportError::Rejected("empty SUBACK".into())),
        }),
        Packet::UnsubAck(_) => Polled::UnsubAck,
        Packet::Disconnect => Polled::Disconnect,
        _ => Polled::Other,
    }
}

fn translate_v5(event: v5::Event) -> Polled {
    use v5::mqttbytes::v5::Packet as Packet5;

    let v5::Event::Incoming(packet) = event else {
        return Polled::Other;
    };
    match packet {
        Packet5::ConnAck(ack) => Polled::ConnAck {
            session_present: ack.session_present,
        },
        Packet5::Publish(publish) => Polled::Message(InboundMessage {
            topic: String::from_utf8_lossy(&publish.topic).into_owned(),
            payload: publish.payload,
            qos: from_v5_qos(publish.qos),
            retain: publish.retain,
            properties: from_publish_properties(publish.properties),
        }),
        Packet5::SubAck(ack) => Polled::SubAck(match ack.return_codes.first() {
            Some(code) => v5_grant(code),
            None => Err(TransportError::Rejected("empty SUBACK".into())),
        }),
        Packet5::UnsubAck(_) => Polled::UnsubAck,
        Packet5::Disconnect(_) => Polled::Disconnect,
        _ => Polled::Other,
    }
}

/// Maps a v5 SUBACK reason code to the granted QoS.
fn v5_grant(code: &SubscribeReasonCode5) -> Result<QoS, TransportError> {
    match code {
        SubscribeReasonCode5::Success(qos) => Ok(from_v5_qos(*qos)),
        other => Err(TransportError::Rejected(format!("{other:?}"))),
    }
}

fn classify_v311(err: &ConnectionError) -> (TransportError, Disposition) {
    use Disposition::*;

    let message = get_error_message(err);
    match err {
        ConnectionError::ConnectionRefused(code) => match code {
            ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized => {
                (TransportError::Auth(format!("Connection refused: {code:?}")), Reconnect)
            }
            ConnectReturnCode::RefusedProtocolVersion | ConnectReturnCode::BadClientId => {
                (TransportError::Fatal(format!("Connection refused: {code:?}")), Fatal)
            }
            _ => (TransportError::Network(format!("Connection refused: {code:?}")), Reconnect),
        },
        ConnectionError::Tls(_) | ConnectionError::MqttState(_) | ConnectionError::NotConnAck(_) => {
            (TransportError::Fatal(message), Fatal)
        }
        ConnectionError::Io(e) => match e.kind() {
            std::io::ErrorKind::AddrInUse
            | std::io::ErrorKind::PermissionDenied
            | std::io::ErrorKind::InvalidInput => (TransportError::Fatal(message), Fatal),
            _ => (TransportError::Network(message), Reconnect),
        },
        _ => (TransportError::Network(message), Reconnect),
    }
}

fn classify_v5(err: &v5::ConnectionError) -> (TransportError, Disposition) {
    let message = get_error_message(err);
    match err {
        v5::ConnectionError::ConnectionRefused(code) => {
            let described = format!("Connection refused: {code:?}");
            if is_auth_failure_message(&described) {
                (TransportError::Auth(described), Disposition::Reconnect)
            } else {
                (TransportError::Network(described), Disposition::Reconnect)
            }
        }
        v5::ConnectionError::Io(_) => (TransportError::Network(message), Disposition::Reconnect),
        _ if is_auth_failure_message(&message) => {
            (TransportError::Auth(message), Disposition::Reconnect)
        }
        _ => (TransportError::Network(message), Disposition::Reconnect),
    }
}

/// Innermost message of an error chain, quotes trimmed.
fn get_error_message(e: &dyn std::error::Error) -> String {
    let mut current = e;
    while let Some(source) = current.source() {
        current = source;
    }
    current.to_string().trim_matches('"').to_string()
}
