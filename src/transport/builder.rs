//! Builds `rumqttc` clients from [`ConnectOptions`].
//!
//! One builder serves both protocol revisions; the rest of the transport
//! talks to the result through [`ClientHandle`] and [`EventLoopHandle`].

use std::fs;

use bytes::Bytes;
use rumqttc::{
    v5::{
        self,
        mqttbytes::{v5::PublishProperties, QoS as QoS5},
    },
    LastWill, MqttOptions, QoS, TlsConfiguration, Transport as NetTransport,
};

use super::{ConnectOptions, MessageProperties, ProtocolVersion, TransportError};

/// Sending half of a `rumqttc` client.
#[derive(Clone)]
pub(crate) enum ClientHandle {
    V311(rumqttc::AsyncClient),
    V5(v5::AsyncClient),
}

/// Receiving half; polled only by the connection kernel.
pub(crate) enum EventLoopHandle {
    V311(Box<rumqttc::EventLoop>),
    V5(Box<v5::EventLoop>),
}

pub(crate) fn build(options: &ConnectOptions) -> Result<(ClientHandle, EventLoopHandle), TransportError> {
    let transport = build_transport(options)?;
    let cap = options.request_channel_capacity.max(1);

    match options.protocol {
        ProtocolVersion::V311 => {
            let mut opts = MqttOptions::new(options.client_id.clone(), options.host.clone(), options.port);
            opts.set_keep_alive(options.keep_alive);
            opts.set_clean_session(options.clean_session);
            opts.set_max_packet_size(options.max_packet_size, options.max_packet_size);
            opts.set_inflight(options.max_inflight);
            opts.set_transport(transport);
            if let Some(creds) = &options.credentials {
                opts.set_credentials(creds.username.clone(), creds.password.clone());
            }
            if let Some(will) = &options.will {
                opts.set_last_will(LastWill::new(
                    will.topic.clone(),
                    will.payload.to_vec(),
                    will.qos,
                    will.retain,
                ));
            }
            let (client, event_loop) = rumqttc::AsyncClient::new(opts, cap);
            Ok((ClientHandle::V311(client), EventLoopHandle::V311(Box::new(event_loop))))
        }
        ProtocolVersion::V5 => {
            let mut opts = v5::MqttOptions::new(options.client_id.clone(), options.host.clone(), options.port);
            opts.set_keep_alive(options.keep_alive);
            opts.set_clean_start(options.clean_session);
            opts.set_transport(transport);
            if let Some(creds) = &options.credentials {
                opts.set_credentials(creds.username.clone(), creds.password.clone());
            }
            if let Some(will) = &options.will {
                opts.set_last_will(v5::mqttbytes::v5::LastWill::new(
                    will.topic.clone(),
                    will.payload.clone(),
                    to_v5_qos(will.qos),
                    will.retain,
                    None,
                ));
            }
            let (client, event_loop) = v5::AsyncClient::new(opts, cap);
            Ok((ClientHandle::V5(client), EventLoopHandle::V5(Box::new(event_loop))))
        }
    }
}

fn build_transport(options: &ConnectOptions) -> Result<NetTransport, TransportError> {
    match &options.tls {
        Some(tls) => {
            tls.validate_config()
                .map_err(|e| TransportError::Setup(format!("Invalid TLS configuration: {e}")))?;

            let ca = read_pem(tls.ca_cert_path.as_deref())?;
            let client_auth = match (&tls.client_cert_path, &tls.client_key_path) {
                (Some(cert), Some(key)) => Some((read_pem(Some(cert))?, read_pem(Some(key))?)),
                _ => None,
            };
            Ok(NetTransport::Tls(TlsConfiguration::Simple {
                ca,
                alpn: None,
                client_auth,
            }))
        }
        None if options.use_tls => Ok(NetTransport::tls_with_default_config()),
        None => Ok(NetTransport::Tcp),
    }
}

fn read_pem(path: Option<&str>) -> Result<Vec<u8>, TransportError> {
    let path = path.ok_or_else(|| TransportError::Setup("TLS file path is not set".into()))?;
    fs::read(path).map_err(|e| TransportError::Setup(format!("Cannot read {path}: {e}")))
}

pub(crate) fn to_v5_qos(qos: QoS) -> QoS5 {
    match qos {
        QoS::AtMostOnce => QoS5::AtMostOnce,
        QoS::AtLeastOnce => QoS5::AtLeastOnce,
        QoS::ExactlyOnce => QoS5::ExactlyOnce,
    }
}

pub(crate) fn from_v5_qos(qos: QoS5) -> QoS {
    match qos {
        QoS5::AtMostOnce => QoS::AtMostOnce,
        QoS5::AtLeastOnce => QoS::AtLeastOnce,
        QoS5::ExactlyOnce => QoS::ExactlyOnce,
    }
}

pub(crate) fn to_publish_properties(props: &MessageProperties) -> PublishProperties {
    let mut out = PublishProperties::default();
    out.correlation_data = props.correlation_data.clone();
    out.response_topic = props.response_topic.clone();
    out.user_properties = props.user_properties.clone();
    out.message_expiry_interval = props.message_expiry_interval;
    out.payload_format_indicator = props.payload_format_indicator;
    out.content_type = props.content_type.clone();
    out
}

pub(crate) fn from_publish_properties(props: Option<PublishProperties>) -> MessageProperties {
    let Some(props) = props else {
        return MessageProperties::default();
    };
    MessageProperties {
        correlation_data: props.correlation_data,
        response_topic: props.response_topic,
        user_properties: props.user_properties,
        message_expiry_interval: props.message_expiry_interval,
        payload_format_indicator: props.payload_format_indicator,
        content_type: props.content_type,
    }
}

impl ClientHandle {
    pub(crate) async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        let result = match self {
            ClientHandle::V311(c) => c.subscribe(topic, qos).await.map_err(|e| e.to_string()),
            ClientHandle::V5(c) => c.subscribe(topic, to_v5_qos(qos)).await.map_err(|e| e.to_string()),
        };
        result.map_err(TransportError::Network)
    }

    pub(crate) async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        let result = match self {
            ClientHandle::V311(c) => c.unsubscribe(topic).await.map_err(|e| e.to_string()),
            ClientHandle::V5(c) => c.unsubscribe(topic).await.map_err(|e| e.to_string()),
        };
        result.map_err(TransportError::Network)
    }

    pub(crate) async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Bytes,
        properties: &MessageProperties,
    ) -> Result<(), TransportError> {
        let result = match self {
            ClientHandle::V311(c) => c
                .publish(topic, qos, retain, payload.to_vec())
                .await
                .map_err(|e| e.to_string()),
            ClientHandle::V5(c) if properties.is_empty() => c
                .publish(topic, to_v5_qos(qos), retain, payload)
                .await
                .map_err(|e| e.to_string()),
            ClientHandle::V5(c) => c
                .publish_with_properties(
                    topic,
                    to_v5_qos(qos),
                    retain,
                    payload,
                    to_publish_properties(properties),
                )
                .await
                .map_err(|e| e.to_string()),
        };
        result.map_err(TransportError::Network)
    }

    /// Queues a DISCONNECT without waiting for channel capacity.
    pub(crate) fn try_disconnect(&self) {
        let _ = match self {
            ClientHandle::V311(c) => c.try_disconnect().map_err(|e| e.to_string()),
            ClientHandle::V5(c) => c.try_disconnect().map_err(|e| e.to_string()),
        };
    }
}
