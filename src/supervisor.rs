//! Connection supervisor.
//!
//! The [`Supervisor`] owns one logical broker session across any number of
//! transport reconnects. It keeps the desired subscriptions and replays them
//! after every connect acknowledgment. Publishes made while the session is
//! down are buffered, and the [`Correlator`] is re-initialised on every
//! connect. Auth rejections are told apart from network failures.
//!
//! # State machine
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Reconnecting(n) -> Connected
//!                                        \-> Error(reason)
//! any -> Disconnecting -> Disconnected
//! ```
//!
//! # Event handling
//!
//! A pump task drains the transport's event stream. It holds only a `Weak`
//! reference, so dropping the last `Supervisor` handle stops it. Work that
//! follows a connect acknowledgment (settling delay, buffer flush,
//! resubscribe, correlator init) runs on a separate task so inbound
//! messages keep flowing meanwhile.

use std::sync::{
    atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    Arc, Mutex, Weak,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use rumqttc::QoS;
use serde::Serialize;
use tokio::{
    sync::{oneshot, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, instrument, trace, warn};
use uuid::Uuid;

use crate::{
    config::Config,
    error::TetherError,
    listeners::{lock, ListenerHandle, Listeners},
    offline::{OfflineQueue, PushOutcome, QueuedMessage},
    request_response::{Correlator, RequestLink, RequestOptions, RequestStats, Response},
    state::ConnectionState,
    subscriptions::{MessageHandler, Subscription, SubscriptionRecord},
    token::{CreateTokenRequest, ExchangeTokenRequest, MqttCredentials, TokenError, TokenManager},
    transport::{
        EventStream, InboundMessage, PublishOptions, Transport, TransportError, TransportEvent, Will,
    },
};

/// Parameters of [`Supervisor::connect`].
#[derive(Debug, Clone, Default)]
pub struct ConnectParams {
    /// `None` falls back to the attached token manager's credentials.
    pub credentials: Option<MqttCredentials>,
    pub will: Option<Will>,
}

impl ConnectParams {
    pub fn with_credentials(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            credentials: Some(MqttCredentials::new(username, password)),
            will: None,
        }
    }
}

/// Parameters of [`Supervisor::connect_with_token`]. An external token takes
/// precedence over a secret key and user email.
#[derive(Clone, Default)]
pub struct TokenConnectParams {
    pub organization_id: String,
    pub external_token: Option<String>,
    pub secret_key: Option<String>,
    pub user_email: Option<String>,
    pub integration_id: Option<String>,
    pub will: Option<Will>,
}

impl std::fmt::Debug for TokenConnectParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenConnectParams")
            .field("organization_id", &self.organization_id)
            .field("external_token", &self.external_token.is_some())
            .field("user_email", &self.user_email)
            .field("integration_id", &self.integration_id)
            .finish_non_exhaustive()
    }
}

/// Options of [`Supervisor::subscribe`].
#[derive(Clone, Default)]
pub struct SubscribeOptions {
    /// `None` uses `default_qos`.
    pub qos: Option<QoS>,
    pub handler: Option<MessageHandler>,
}

impl SubscribeOptions {
    pub fn qos(qos: QoS) -> Self {
        Self {
            qos: Some(qos),
            handler: None,
        }
    }

    pub fn handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(handler));
        self
    }
}

/// What happened to a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Handed to the transport.
    Sent,
    /// Buffered until the session is back.
    Queued,
    /// Discarded: buffering is off or the buffer rejected it.
    Dropped,
}

type ConnectFuture = Shared<BoxFuture<'static, Result<(), TetherError>>>;

struct Outbox {
    queue: OfflineQueue,
    /// Set from a connect acknowledgment that found the buffer non-empty
    /// until it is drained. New publishes queue behind the backlog meanwhile.
    flushing: bool,
}

#[derive(Default)]
struct SupervisorListeners {
    message: Listeners<InboundMessage>,
    connected: Listeners<()>,
    reconnecting: Listeners<u32>,
    auth_error: Listeners<String>,
    error: Listeners<TetherError>,
    state: Listeners<ConnectionState>,
}

impl SupervisorListeners {
    fn clear(&self) {
        self.message.clear();
        self.connected.clear();
        self.reconnecting.clear();
        self.auth_error.clear();
        self.error.clear();
        self.state.clear();
    }
}

struct SupervisorInner {
    config: Config,
    transport: Arc<dyn Transport>,
    client_id: String,
    session_id: Mutex<Option<String>>,
    state: watch::Sender<ConnectionState>,
    subscriptions: Mutex<SubscriptionRecord>,
    outbox: Mutex<Outbox>,
    correlator: Correlator,
    tokens: Option<TokenManager>,
    token_listener: Mutex<Option<ListenerHandle>>,
    last_params: Mutex<Option<ConnectParams>>,
    last_error: Mutex<Option<String>>,
    connecting: Mutex<Option<(u64, ConnectFuture)>>,
    connect_seq: AtomicU64,
    pending_connect: Mutex<Option<oneshot::Sender<Result<(), TetherError>>>>,
    /// Fired by the first connect acknowledgment of a pending connect.
    acked: Mutex<Option<oneshot::Sender<()>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    after_connect: Mutex<Option<JoinHandle<()>>>,
    reconnect_attempts: AtomicU32,
    auth_failures: AtomicU32,
    destroyed: AtomicBool,
    listeners: SupervisorListeners,
}

/// Supervises one broker session. Cheap to clone.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

impl Supervisor {
    /// Validates `config` and wires the optional token manager so refreshed
    /// credentials reach the transport's next connect attempt.
    pub fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        tokens: Option<TokenManager>,
    ) -> Result<Self, TetherError> {
        config
            .validate_all()
            .map_err(|e| TetherError::Configuration(e.to_string()))?;

        let client_id = if config.client_id.is_empty() {
            let id = Uuid::new_v4().simple().to_string();
            format!("tether-{}", &id[..12])
        } else {
            config.client_id.clone()
        };
        let (state, _) = watch::channel(ConnectionState::default());
        let outbox = Outbox {
            queue: OfflineQueue::new(config.offline_queue.max_size, config.offline_queue.drop_oldest),
            flushing: false,
        };

        let inner = Arc::new(SupervisorInner {
            correlator: Correlator::new(config.request.clone()),
            config,
            transport,
            client_id,
            session_id: Mutex::new(None),
            state,
            subscriptions: Mutex::new(SubscriptionRecord::new()),
            outbox: Mutex::new(outbox),
            tokens,
            token_listener: Mutex::new(None),
            last_params: Mutex::new(None),
            last_error: Mutex::new(None),
            connecting: Mutex::new(None),
            connect_seq: AtomicU64::new(0),
            pending_connect: Mutex::new(None),
            acked: Mutex::new(None),
            pump: Mutex::new(None),
            after_connect: Mutex::new(None),
            reconnect_attempts: AtomicU32::new(0),
            auth_failures: AtomicU32::new(0),
            destroyed: AtomicBool::new(false),
            listeners: SupervisorListeners::default(),
        });

        if let Some(tokens) = &inner.tokens {
            let weak = Arc::downgrade(&inner);
            let handle = tokens.on_refreshed(move |info| {
                let Some(inner) = weak.upgrade() else { return };
                debug!(token_id = %info.token_id, "Passing refreshed credentials to transport");
                let credentials = inner.tokens.as_ref().and_then(TokenManager::credentials);
                inner.transport.update_credentials(credentials);
            });
            *lock(&inner.token_listener) = Some(handle);
        }

        Ok(Self { inner })
    }

    /// Opens the session. Resolves immediately when already connected; a
    /// concurrent second caller shares the first attempt's outcome.
    ///
    /// `connect_timeout_ms` bounds the wait for the broker's acknowledgment.
    /// The post-connect work (settling delay, buffer flush, resubscribe)
    /// runs after it without a deadline, and this call resolves once that
    /// work is done. If the session drops again before then it fails with
    /// [`TetherError::ConnectionLost`] while reconnects continue.
    ///
    /// The attempt runs on its own task, so dropping the returned future
    /// does not abandon it.
    pub async fn connect(&self, params: ConnectParams) -> Result<(), TetherError> {
        self.inner.ensure_alive()?;
        if self.is_connected() {
            return Ok(());
        }

        let attempt = {
            let mut slot = lock(&self.inner.connecting);
            match slot.as_ref() {
                Some((_, attempt)) => attempt.clone(),
                None => {
                    let id = self.inner.connect_seq.fetch_add(1, Ordering::AcqRel) + 1;
                    let inner = Arc::clone(&self.inner);
                    let task = tokio::spawn(async move {
                        let result = SupervisorInner::open(&inner, params).await;
                        inner.release_connect(id);
                        result
                    });
                    let attempt = async move {
                        task.await.unwrap_or_else(|e| {
                            Err(TetherError::Connection(format!("connect task failed: {e}")))
                        })
                    }
                    .boxed()
                    .shared();
                    *slot = Some((id, attempt.clone()));
                    attempt
                }
            }
        };
        attempt.await
    }

    /// Obtains a credential from the attached token manager, then connects.
    #[instrument(skip(self, params), fields(organization_id = %params.organization_id))]
    pub async fn connect_with_token(&self, params: TokenConnectParams) -> Result<(), TetherError> {
        let tokens = self
            .inner
            .tokens
            .as_ref()
            .ok_or_else(|| TetherError::Configuration("no token manager attached".into()))?;

        match (&params.external_token, &params.secret_key, &params.user_email) {
            (Some(token), _, _) => {
                tokens
                    .exchange_token(ExchangeTokenRequest {
                        organization_id: params.organization_id.clone(),
                        token: token.clone(),
                        integration_id: params.integration_id.clone(),
                    })
                    .await?;
            }
            (None, Some(secret), Some(email)) => {
                tokens
                    .create_token(CreateTokenRequest {
                        organization_id: params.organization_id.clone(),
                        secret_key: secret.clone(),
                        user_email: email.clone(),
                        integration_id: params.integration_id.clone(),
                        replace_existing: None,
                    })
                    .await?;
            }
            _ => {
                return Err(TetherError::Configuration(
                    "either an external token or a secret key with user email is required".into(),
                ))
            }
        }

        let credentials = tokens.credentials().ok_or(TokenError::MissingToken)?;
        self.connect(ConnectParams {
            credentials: Some(credentials),
            will: params.will,
        })
        .await
    }

    /// Closes the session. Pending requests are cancelled; subscriptions and
    /// buffered publishes are kept for the next connect.
    pub async fn disconnect(&self) -> Result<(), TetherError> {
        self.inner.shutdown("client disconnect").await;
        Ok(())
    }

    /// Closes the session and connects again with the last parameters.
    pub async fn reconnect(&self) -> Result<(), TetherError> {
        self.inner.ensure_alive()?;
        let params = lock(&self.inner.last_params)
            .clone()
            .ok_or_else(|| TetherError::Configuration("reconnect before first connect".into()))?;
        info!("Forced reconnect requested");
        self.inner.shutdown("forced reconnect").await;
        self.connect(params).await
    }

    /// Disconnects and releases everything. Idempotent.
    pub async fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown("destroyed").await;
        if let Some(handle) = lock(&self.inner.token_listener).take() {
            handle.remove();
        }
        lock(&self.inner.subscriptions).clear();
        lock(&self.inner.outbox).queue.clear();
        self.inner.listeners.clear();
        info!(client_id = %self.inner.client_id, "Supervisor destroyed");
    }

    /// Subscribes unless already subscribed; records the topic once the
    /// broker grants it. Returns the recorded QoS.
    pub async fn subscribe(&self, topic: &str, options: SubscribeOptions) -> Result<QoS, TetherError> {
        self.inner.ensure_alive()?;
        self.inner.subscribe(topic, options).await
    }

    /// Removes `topic` from the record and the broker.
    pub async fn unsubscribe(&self, topic: &str) -> Result<(), TetherError> {
        self.inner.ensure_alive()?;
        if !self.inner.transport.is_open() {
            return Err(TetherError::NotConnected);
        }
        lock(&self.inner.subscriptions).remove(topic);
        match self.inner.transport.unsubscribe(topic).await {
            Ok(()) | Err(TransportError::NotConnected) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Publishes now, or buffers while the session is down.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        options: PublishOptions,
    ) -> Result<PublishOutcome, TetherError> {
        self.inner.ensure_alive()?;
        self.inner.publish(topic, payload.into(), options).await
    }

    pub async fn publish_json<T>(
        &self,
        topic: &str,
        value: &T,
        mut options: PublishOptions,
    ) -> Result<PublishOutcome, TetherError>
    where
        T: Serialize + ?Sized,
    {
        let body = serde_json::to_vec(value)?;
        if options.properties.content_type.is_none() {
            options.properties.content_type = Some("application/json".into());
        }
        self.publish(topic, body, options).await
    }

    /// Publishes `payload` to `topic` and waits for the correlated reply.
    pub async fn request<P>(
        &self,
        topic: &str,
        payload: &P,
        options: RequestOptions,
    ) -> Result<Response, TetherError>
    where
        P: Serialize + ?Sized,
    {
        self.inner.ensure_alive()?;
        self.inner
            .correlator
            .request(self.inner.as_ref(), topic, payload, options)
            .await
    }

    /// Answers an inbound request on its reply topic.
    pub async fn reply<P>(&self, request: &InboundMessage, payload: &P) -> Result<PublishOutcome, TetherError>
    where
        P: Serialize + ?Sized,
    {
        let target = Correlator::reply_target(request)
            .ok_or_else(|| TetherError::Serialization("message carries no reply address".into()))?;
        let (body, options) = Correlator::reply_envelope(
            &target,
            serde_json::to_value(payload)?,
            self.inner.transport.supports_properties(),
        )?;
        self.publish(&target.response_topic, body, options).await
    }

    pub fn cancel_request(&self, correlation_id: &str) -> bool {
        self.inner.correlator.cancel_request(correlation_id)
    }

    pub fn cancel_all_requests(&self) -> usize {
        self.inner.correlator.cancel_all()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.borrow().is_connected()
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    /// Assigned at the first connect and kept across reconnects.
    pub fn session_id(&self) -> Option<String> {
        lock(&self.inner.session_id).clone()
    }

    /// Recorded topics in subscription order.
    pub fn subscriptions(&self) -> Vec<String> {
        lock(&self.inner.subscriptions).topics()
    }

    pub fn offline_queue_len(&self) -> usize {
        lock(&self.inner.outbox).queue.len()
    }

    /// Reconnect attempts since the last connect acknowledgment.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.reconnect_attempts.load(Ordering::Acquire)
    }

    pub fn request_stats(&self) -> RequestStats {
        self.inner.correlator.stats()
    }

    pub fn reset_request_stats(&self) {
        self.inner.correlator.reset_stats();
    }

    pub fn correlator(&self) -> &Correlator {
        &self.inner.correlator
    }

    pub fn token_manager(&self) -> Option<&TokenManager> {
        self.inner.tokens.as_ref()
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Messages not claimed by the correlator, after per-topic handlers.
    pub fn on_message<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        self.inner.listeners.message.add(callback)
    }

    /// After flush, resubscribe and correlator init of every connect.
    pub fn on_connected<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.listeners.connected.add(move |_: &()| callback())
    }

    /// Called with the attempt number.
    pub fn on_reconnecting<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        self.inner.listeners.reconnecting.add(move |attempt: &u32| callback(*attempt))
    }

    pub fn on_auth_error<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.inner.listeners.auth_error.add(move |reason: &String| callback(reason))
    }

    /// Non-auth connection errors and failed resubscribes.
    pub fn on_error<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(&TetherError) + Send + Sync + 'static,
    {
        self.inner.listeners.error.add(callback)
    }

    pub fn on_state_change<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(&ConnectionState) + Send + Sync + 'static,
    {
        self.inner.listeners.state.add(callback)
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("client_id", &self.inner.client_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl SupervisorInner {
    fn ensure_alive(&self) -> Result<(), TetherError> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(TetherError::Configuration("supervisor destroyed".into()));
        }
        Ok(())
    }

    fn current_state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    fn is_connected(&self) -> bool {
        self.state.borrow().is_connected()
    }

    /// Entering `Disconnected` or `Error` fails every pending request.
    fn set_state(&self, state: ConnectionState) {
        let changed = *self.state.borrow() != state;
        if !changed {
            return;
        }
        self.state.send_replace(state.clone());
        info!("Connection state changed to: {}", state);

        if matches!(state, ConnectionState::Disconnected(_) | ConnectionState::Error(_)) {
            self.correlator.fail_all();
        }
        self.listeners.state.emit(&state);
    }

    /// Frees the single-flight slot if it still holds attempt `id`.
    fn release_connect(&self, id: u64) {
        let mut slot = lock(&self.connecting);
        if slot.as_ref().is_some_and(|(current, _)| *current == id) {
            slot.take();
        }
    }

    fn resolve_pending(&self, outcome: Result<(), TetherError>) {
        if let Some(tx) = lock(&self.pending_connect).take() {
            let _ = tx.send(outcome);
        }
    }

    fn stop_tasks(&self) {
        if let Some(pump) = lock(&self.pump).take() {
            pump.abort();
        }
        if let Some(task) = lock(&self.after_connect).take() {
            task.abort();
        }
    }

    async fn open(self: &Arc<Self>, params: ConnectParams) -> Result<(), TetherError> {
        self.set_state(ConnectionState::Connecting);
        lock(&self.session_id).get_or_insert_with(|| Uuid::new_v4().to_string());
        *lock(&self.last_params) = Some(params.clone());
        lock(&self.last_error).take();
        self.reconnect_attempts.store(0, Ordering::Release);
        self.auth_failures.store(0, Ordering::Release);

        let credentials = params
            .credentials
            .or_else(|| self.tokens.as_ref().and_then(TokenManager::credentials));
        let mut options = self.config.connect_options(&self.client_id);
        options.credentials = credentials;
        options.will = params.will;

        let (tx, mut rx) = oneshot::channel();
        let (acked_tx, acked_rx) = oneshot::channel();
        *lock(&self.pending_connect) = Some(tx);
        *lock(&self.acked) = Some(acked_tx);
        self.stop_tasks();

        info!(client_id = %self.client_id, host = %options.host, port = options.port, "Connecting");
        let events = match self.transport.connect(options).await {
            Ok(events) => events,
            Err(e) => {
                lock(&self.pending_connect).take();
                lock(&self.acked).take();
                error!(error = %e, "Transport failed to start");
                self.set_state(ConnectionState::Error(e.to_string()));
                return Err(e.into());
            }
        };
        let pump = tokio::spawn(run_pump(Arc::downgrade(self), events));
        *lock(&self.pump) = Some(pump);

        let timeout = self.config.connect_timeout();
        let acknowledged = tokio::select! {
            outcome = &mut rx => return connect_outcome(outcome),
            _ = acked_rx => true,
            _ = tokio::time::sleep(timeout) => false,
        };
        if acknowledged {
            return connect_outcome(rx.await);
        }

        lock(&self.pending_connect).take();
        lock(&self.acked).take();
        let reason = lock(&self.last_error).clone();
        warn!(?timeout, last_error = ?reason, "Connect timed out");
        self.stop_tasks();
        let _ = self.transport.close().await;
        self.set_state(ConnectionState::Error(format!("connect timed out after {timeout:?}")));
        Err(TetherError::ConnectionTimeout(timeout))
    }

    async fn shutdown(&self, reason: &str) {
        self.set_state(ConnectionState::Disconnecting);
        self.stop_tasks();
        if let Err(e) = self.transport.close().await {
            warn!(error = %e, "Error closing transport");
        }
        self.correlator.cancel_all();
        lock(&self.outbox).flushing = false;
        lock(&self.connecting).take();
        lock(&self.acked).take();
        self.resolve_pending(Err(TetherError::Cancelled(reason.to_string())));
        self.set_state(ConnectionState::Disconnected(reason.to_string()));
    }

    async fn handle_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Connected { session_present } => {
                debug!(session_present, "Connect acknowledged");
                self.reconnect_attempts.store(0, Ordering::Release);
                self.auth_failures.store(0, Ordering::Release);
                {
                    let mut outbox = lock(&self.outbox);
                    outbox.flushing = !outbox.queue.is_empty();
                }
                self.set_state(ConnectionState::Connected);
                if let Some(acked) = lock(&self.acked).take() {
                    let _ = acked.send(());
                }

                let task = tokio::spawn(Arc::clone(self).after_connect());
                if let Some(previous) = lock(&self.after_connect).replace(task) {
                    previous.abort();
                }
            }
            TransportEvent::Offline(reason) => {
                warn!(%reason, "Session went offline");
                self.set_state(ConnectionState::Disconnected(reason));
                // A connect still finishing its post-connect work lost its session.
                if lock(&self.acked).is_none() {
                    self.resolve_pending(Err(TetherError::ConnectionLost));
                }
            }
            TransportEvent::Error(err) if err.is_auth() => self.on_auth_error(err).await,
            TransportEvent::Error(err) => {
                warn!(error = %err, "Transport error");
                *lock(&self.last_error) = Some(err.to_string());
                self.listeners.error.emit(&TetherError::Transport(err));

                let max = self.config.max_reconnect_attempts;
                let attempts = self.reconnect_attempts.load(Ordering::Acquire);
                if max > 0 && attempts >= max {
                    self.give_up(format!("maximum reconnect attempts ({max}) reached"), None)
                        .await;
                }
            }
            TransportEvent::Reconnecting => {
                let attempt = self.reconnect_attempts.fetch_add(1, Ordering::AcqRel) + 1;
                info!(attempt, "Reconnecting");
                self.set_state(ConnectionState::Reconnecting(attempt));
                self.listeners.reconnecting.emit(&attempt);
            }
            TransportEvent::Closed => {
                debug!("Transport closed");
                let state = self.current_state();
                if !matches!(state, ConnectionState::Error(_) | ConnectionState::Disconnected(_)) {
                    self.set_state(ConnectionState::Disconnected("transport closed".into()));
                }
                let reason = lock(&self.last_error)
                    .clone()
                    .unwrap_or_else(|| "transport closed".into());
                self.resolve_pending(Err(TetherError::Connection(reason)));
            }
            TransportEvent::Message(message) => self.dispatch(message),
        }
    }

    async fn on_auth_error(self: &Arc<Self>, err: TransportError) {
        let failures = self.auth_failures.fetch_add(1, Ordering::AcqRel) + 1;
        let reason = err.to_string();
        *lock(&self.last_error) = Some(reason.clone());

        let tolerated =
            self.config.reconnect_on_auth_error && failures <= self.config.max_auth_retries;
        if !tolerated {
            error!(%reason, failures, "Broker rejected credentials; closing transport");
            self.give_up(reason.clone(), Some(TetherError::AuthRejected(reason.clone())))
                .await;
            self.listeners.auth_error.emit(&reason);
            return;
        }

        warn!(%reason, failures, "Broker rejected credentials; retrying");
        self.listeners.auth_error.emit(&reason);
        if let Some(tokens) = self.tokens.clone() {
            tokio::spawn(async move {
                if let Err(e) = tokens.refresh_token().await {
                    warn!(error = %e, "Credential refresh after auth rejection failed");
                }
            });
        }
    }

    /// Force-closes the transport and enters `Error`.
    async fn give_up(&self, reason: String, error: Option<TetherError>) {
        error!(%reason, "Giving up on connection");
        if let Err(e) = self.transport.close().await {
            warn!(error = %e, "Error closing transport");
        }
        lock(&self.outbox).flushing = false;
        lock(&self.acked).take();
        self.set_state(ConnectionState::Error(reason.clone()));
        self.resolve_pending(Err(error.unwrap_or(TetherError::Connection(reason))));
    }

    async fn after_connect(self: Arc<Self>) {
        let delay = self.config.post_connect_delay();
        if !delay.is_zero() {
            trace!(?delay, "Post-connect settling delay");
            tokio::time::sleep(delay).await;
        }
        if !self.is_connected() {
            trace!("Session dropped while settling");
            return;
        }

        self.flush_outbox().await;
        self.resubscribe().await;

        if self.correlator.is_enabled() {
            if let Err(e) = self.correlator.initialize(self.as_ref(), &self.client_id).await {
                warn!(error = %e, "Request/response initialisation failed");
                self.listeners.error.emit(&e);
            }
        }

        self.listeners.connected.emit(&());
        self.resolve_pending(Ok(()));
    }

    async fn flush_outbox(&self) {
        let mut sent = 0usize;
        loop {
            let message = {
                let mut outbox = lock(&self.outbox);
                match outbox.queue.pop_front() {
                    Some(message) => message,
                    None => {
                        outbox.flushing = false;
                        break;
                    }
                }
            };
            if let Err(e) = self
                .transport
                .publish(&message.topic, message.payload.clone(), &message.options)
                .await
            {
                warn!(topic = %message.topic, error = %e, "Buffered publish failed; keeping it queued");
                let mut outbox = lock(&self.outbox);
                outbox.queue.requeue_front(message);
                outbox.flushing = false;
                break;
            }
            sent += 1;
        }
        if sent > 0 {
            info!(sent, "Offline buffer flushed");
        }
    }

    async fn resubscribe(&self) {
        let snapshot = lock(&self.subscriptions).snapshot();
        if snapshot.is_empty() {
            return;
        }
        debug!(count = snapshot.len(), staggered = self.config.staggered_resubscribe, "Resubscribing");

        let delay = self.config.resubscribe_delay();
        for (index, (topic, qos)) in snapshot.into_iter().enumerate() {
            if self.config.staggered_resubscribe && index > 0 && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Err(e) = self.transport.subscribe(&topic, qos).await {
                warn!(%topic, error = %e, "Resubscribe failed");
                self.listeners.error.emit(&TetherError::Transport(e));
            }
        }
    }

    async fn subscribe(&self, topic: &str, options: SubscribeOptions) -> Result<QoS, TetherError> {
        {
            let mut record = lock(&self.subscriptions);
            if let Some(existing) = record.get(topic) {
                let qos = existing.qos;
                if let Some(handler) = options.handler {
                    record.insert(Subscription {
                        topic: topic.to_string(),
                        qos,
                        handler: Some(handler),
                    });
                }
                trace!(topic, "Already subscribed");
                return Ok(qos);
            }
        }
        if !self.transport.is_open() {
            return Err(TetherError::NotConnected);
        }

        let qos = options.qos.unwrap_or_else(|| self.config.default_qos());
        let granted = self.transport.subscribe(topic, qos).await?;
        debug!(topic, requested = ?qos, ?granted, "Subscribed");
        lock(&self.subscriptions).insert(Subscription {
            topic: topic.to_string(),
            qos,
            handler: options.handler,
        });
        Ok(qos)
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        mut options: PublishOptions,
    ) -> Result<PublishOutcome, TetherError> {
        options.qos = Some(options.qos.unwrap_or_else(|| self.config.default_qos()));

        let behind_backlog = self.config.offline_queue.enabled && lock(&self.outbox).flushing;
        let live = self.is_connected() && !behind_backlog;
        if live {
            match self.transport.publish(topic, payload.clone(), &options).await {
                Ok(()) => return Ok(PublishOutcome::Sent),
                Err(TransportError::NotConnected) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(self.enqueue(QueuedMessage::new(topic, payload, options)))
    }

    fn enqueue(&self, message: QueuedMessage) -> PublishOutcome {
        if !self.config.offline_queue.enabled {
            debug!(topic = %message.topic, "Offline buffering disabled; publish discarded");
            return PublishOutcome::Dropped;
        }
        let topic = message.topic.clone();
        match lock(&self.outbox).queue.push(message) {
            PushOutcome::Queued => PublishOutcome::Queued,
            PushOutcome::QueuedDroppedOldest => {
                warn!(%topic, "Offline buffer full; oldest message dropped");
                PublishOutcome::Queued
            }
            PushOutcome::Rejected => {
                warn!(%topic, "Offline buffer full; publish rejected");
                PublishOutcome::Dropped
            }
        }
    }

    fn dispatch(&self, message: InboundMessage) {
        if self.correlator.handle_message(&message) {
            return;
        }
        let handlers = lock(&self.subscriptions).handlers_for(&message.topic);
        for handler in handlers {
            handler(&message);
        }
        self.listeners.message.emit(&message);
    }
}

#[async_trait]
impl RequestLink for SupervisorInner {
    async fn ensure_subscribed(&self, topic: &str, qos: QoS) -> Result<(), TetherError> {
        self.subscribe(topic, SubscribeOptions::qos(qos)).await.map(|_| ())
    }

    async fn send(&self, topic: &str, payload: Bytes, mut options: PublishOptions) -> Result<(), TetherError> {
        if !self.is_connected() {
            return Err(TetherError::NotConnected);
        }
        options.qos = Some(options.qos.unwrap_or_else(|| self.config.default_qos()));
        Ok(self.transport.publish(topic, payload, &options).await?)
    }

    fn supports_properties(&self) -> bool {
        self.transport.supports_properties()
    }
}

impl Drop for SupervisorInner {
    fn drop(&mut self) {
        self.stop_tasks();
    }
}

fn connect_outcome(
    outcome: Result<Result<(), TetherError>, oneshot::error::RecvError>,
) -> Result<(), TetherError> {
    outcome.unwrap_or_else(|_| Err(TetherError::Connection("connect attempt abandoned".into())))
}

async fn run_pump(inner: Weak<SupervisorInner>, mut events: EventStream) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else { break };
        inner.handle_event(event).await;
    }
    trace!("Event pump finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryBroker;

    fn config() -> Config {
        Config {
            client_id: "unit".into(),
            connect_timeout_ms: 2_000,
            reconnect_period_ms: 100,
            ..Config::default()
        }
    }

    fn supervisor(broker: &MemoryBroker, config: Config) -> Supervisor {
        Supervisor::new(config, Arc::new(broker.transport()), None).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn connect_twice_is_a_no_op() {
        let broker = MemoryBroker::new();
        let sup = supervisor(&broker, config());
        sup.connect(ConnectParams::default()).await.unwrap();
        sup.connect(ConnectParams::default()).await.unwrap();
        assert_eq!(broker.connect_attempts(), 1);
        assert_eq!(sup.state(), ConnectionState::Connected);
        assert!(sup.session_id().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_connects_share_one_attempt() {
        let broker = MemoryBroker::new();
        let sup = supervisor(&broker, config());
        let (a, b) = tokio::join!(
            sup.connect(ConnectParams::default()),
            sup.connect(ConnectParams::default())
        );
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(broker.connect_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn generated_client_id_and_reply_topic() {
        let broker = MemoryBroker::new();
        let sup = supervisor(&broker, Config { client_id: String::new(), ..config() });
        assert!(sup.client_id().starts_with("tether-"));
        sup.connect(ConnectParams::default()).await.unwrap();
        let reply = format!("responses/{}", sup.client_id());
        assert_eq!(sup.subscriptions(), vec![reply]);
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_without_session_fails() {
        let broker = MemoryBroker::new();
        let sup = supervisor(&broker, config());
        let err = sup.subscribe("a", SubscribeOptions::default()).await.unwrap_err();
        assert!(matches!(err, TetherError::NotConnected));
        assert!(matches!(sup.unsubscribe("a").await, Err(TetherError::NotConnected)));
    }

    #[tokio::test(start_paused = true)]
    async fn handlers_then_global_listeners() {
        let broker = MemoryBroker::new();
        let sup = supervisor(&broker, config());
        sup.connect(ConnectParams::default()).await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let by_topic = Arc::clone(&seen);
        sup.subscribe(
            "sensors/+",
            SubscribeOptions::default().handler(move |m| lock(&by_topic).push(format!("handler:{}", m.topic))),
        )
        .await
        .unwrap();
        let global = Arc::clone(&seen);
        let _handle = sup.on_message(move |m| lock(&global).push(format!("global:{}", m.topic)));

        broker.inject(InboundMessage::new("sensors/t1", "1"));
        while lock(&seen).len() < 2 {
            tokio::task::yield_now().await;
        }
        assert_eq!(*lock(&seen), ["handler:sensors/t1", "global:sensors/t1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_buffer_discards() {
        let broker = MemoryBroker::new();
        let mut cfg = config();
        cfg.offline_queue.enabled = false;
        let sup = supervisor(&broker, cfg);
        let outcome = sup.publish("t", "x", PublishOptions::default()).await.unwrap();
        assert_eq!(outcome, PublishOutcome::Dropped);
        assert_eq!(sup.offline_queue_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_is_idempotent() {
        let broker = MemoryBroker::new();
        let sup = supervisor(&broker, config());
        sup.connect(ConnectParams::default()).await.unwrap();
        sup.destroy().await;
        sup.destroy().await;
        assert!(!broker.is_connected("unit"));
        assert!(sup.subscriptions().is_empty());
        assert!(matches!(
            sup.connect(ConnectParams::default()).await,
            Err(TetherError::Configuration(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_with_token_requires_a_manager() {
        let broker = MemoryBroker::new();
        let sup = supervisor(&broker, config());
        let err = sup
            .connect_with_token(TokenConnectParams {
                organization_id: "org".into(),
                external_token: Some("jwt".into()),
                ..TokenConnectParams::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TetherError::Configuration(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_requires_a_previous_connect() {
        let broker = MemoryBroker::new();
        let sup = supervisor(&broker, config());
        assert!(matches!(sup.reconnect().await, Err(TetherError::Configuration(_))));

        sup.connect(ConnectParams::default()).await.unwrap();
        sup.reconnect().await.unwrap();
        assert_eq!(broker.connect_attempts(), 2);
        assert!(sup.is_connected());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let broker = MemoryBroker::new();
        let result = Supervisor::new(
            Config {
                host: String::new(),
                ..Config::default()
            },
            Arc::new(broker.transport()),
            None,
        );
        assert!(matches!(result, Err(TetherError::Configuration(_))));
    }
}
