use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::QoS;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info};

use super::{
    kernel::{ConnectionKernel, Link},
    ConnectOptions, EventStream, ProtocolVersion, PublishOptions, Transport, TransportError,
};
use crate::{listeners::lock, token::MqttCredentials};

/// Floor for how long a subscribe or unsubscribe waits for its ack.
const MIN_ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// [`Transport`] over a `rumqttc` client.
///
/// Each [`connect`](Transport::connect) spawns a connection kernel task that
/// owns the event loop and keeps reconnecting with exponential backoff until
/// [`close`](Transport::close) or a fatal error.
#[derive(Default)]
pub struct RumqttTransport {
    link: Mutex<Option<Arc<Link>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RumqttTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn current(&self) -> Result<Arc<Link>, TransportError> {
        lock(&self.link).clone().ok_or(TransportError::NotConnected)
    }

    fn connected(&self) -> Result<Arc<Link>, TransportError> {
        let link = self.current()?;
        if link.is_connected() {
            Ok(link)
        } else {
            Err(TransportError::NotConnected)
        }
    }

    fn ack_timeout(link: &Link) -> Duration {
        link.options().keep_alive.max(MIN_ACK_TIMEOUT)
    }

    fn shutdown_current(&self) {
        if let Some(link) = lock(&self.link).take() {
            link.client().try_disconnect();
            link.cancel.cancel();
        }
        // The kernel finishes on its own once cancelled.
        lock(&self.task).take();
    }
}

#[async_trait]
impl Transport for RumqttTransport {
    async fn connect(&self, options: ConnectOptions) -> Result<EventStream, TransportError> {
        self.shutdown_current();

        let (tx, rx) = mpsc::unbounded_channel();
        info!(
            host = %options.host,
            port = options.port,
            client_id = %options.client_id,
            protocol = ?options.protocol,
            "Opening MQTT session"
        );
        let (kernel, link) = ConnectionKernel::new(options, tx)?;
        *lock(&self.link) = Some(link);
        *lock(&self.task) = Some(tokio::spawn(kernel.run()));
        Ok(rx)
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<QoS, TransportError> {
        let link = self.connected()?;
        let (tx, rx) = oneshot::channel();
        {
            let _order = link.order.lock().await;
            lock(&link.acks).subscribes.push_back(tx);
            if let Err(e) = link.client().subscribe(topic, qos).await {
                lock(&link.acks).subscribes.pop_back();
                return Err(e);
            }
        }
        debug!(topic, ?qos, "Subscribe sent");

        match tokio::time::timeout(Self::ack_timeout(&link), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::Interrupted(format!("No SUBACK for {topic}"))),
        }
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        let link = self.connected()?;
        let (tx, rx) = oneshot::channel();
        {
            let _order = link.order.lock().await;
            lock(&link.acks).unsubscribes.push_back(tx);
            if let Err(e) = link.client().unsubscribe(topic).await {
                lock(&link.acks).unsubscribes.pop_back();
                return Err(e);
            }
        }

        match tokio::time::timeout(Self::ack_timeout(&link), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::Interrupted(format!("No UNSUBACK for {topic}"))),
        }
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        options: &PublishOptions,
    ) -> Result<(), TransportError> {
        let link = self.connected()?;
        let qos = options.qos.unwrap_or(QoS::AtLeastOnce);
        link.client()
            .publish(topic, qos, options.retain, payload, &options.properties)
            .await
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.shutdown_current();
        Ok(())
    }

    fn update_credentials(&self, credentials: Option<MqttCredentials>) {
        if let Some(link) = lock(&self.link).as_ref() {
            link.set_pending_credentials(credentials);
        }
    }

    fn supports_properties(&self) -> bool {
        lock(&self.link)
            .as_ref()
            .map(|link| link.options().protocol == ProtocolVersion::V5)
            .unwrap_or(false)
    }

    fn is_open(&self) -> bool {
        lock(&self.link)
            .as_ref()
            .map(|link| !link.cancel.is_cancelled())
            .unwrap_or(false)
    }
}

impl Drop for RumqttTransport {
    fn drop(&mut self) {
        self.shutdown_current();
    }
}
