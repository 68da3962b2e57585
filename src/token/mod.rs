//! Credential lifecycle: issue, store, schedule and refresh one credential.
//!
//! The [`TokenManager`] owns exactly one [`Credential`]. Every successful
//! store arms a single refresh timer at `refresh_recommended_at`; when it
//! fires the state moves to `Expiring`, the expiring listeners are told how
//! many seconds are left, and a refresh runs. Refreshes are single-flight:
//! callers arriving while one is outstanding await the same result.
//!
//! ```text
//! None -> Valid -> (Expiring) -> Refreshing -> Valid | Error
//! ```
//!
//! `Expired` is never stored; [`TokenManager::state`] derives it from the clock.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use time::{Duration as TimeDuration, OffsetDateTime};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, instrument, warn};

use crate::{
    config::TokenConfig,
    listeners::{lock, ListenerHandle, Listeners},
};

mod error;
mod service;
mod types;

pub use error::TokenError;
pub use service::{HttpTokenService, TokenService};
pub use types::{
    CreateTokenRequest, Credential, ExchangeTokenRequest, MqttCredentials, Provider,
    RefreshTokenRequest, TokenInfo, TokenResponse, TokenState,
};

type RefreshFuture = Shared<BoxFuture<'static, Result<TokenInfo, TokenError>>>;

struct ScheduledRefresh {
    generation: u64,
    handle: JoinHandle<()>,
}

struct TokenInner {
    service: Arc<dyn TokenService>,
    config: TokenConfig,
    credential: Mutex<Option<Credential>>,
    state: watch::Sender<TokenState>,
    inflight: Mutex<Option<RefreshFuture>>,
    timer: Mutex<Option<ScheduledRefresh>>,
    generation: AtomicU64,
    /// Bumped by `clear`; a refresh started under an older epoch is discarded.
    epoch: AtomicU64,
    destroyed: AtomicBool,
    refreshed: Listeners<TokenInfo>,
    expiring: Listeners<u64>,
    errors: Listeners<TokenError>,
}

/// Owns one credential and keeps it fresh. Cheap to clone.
#[derive(Clone)]
pub struct TokenManager {
    inner: Arc<TokenInner>,
}

impl std::fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManager")
            .field("state", &self.state())
            .field("token", &self.token_info().map(|t| t.token_id))
            .finish()
    }
}

impl TokenManager {
    /// Creates a manager talking HTTP to `config.service_url`.
    ///
    /// # Errors
    ///
    /// `TokenError::Configuration` when no service URL is configured or it
    /// cannot be parsed.
    pub fn new(config: TokenConfig) -> Result<Self, TokenError> {
        let url = config
            .service_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| TokenError::Configuration("token service URL is not configured".into()))?;
        let service = HttpTokenService::new(url, config.http_timeout())?;
        Ok(Self::with_service(Arc::new(service), config))
    }

    /// Creates a manager on top of any [`TokenService`].
    pub fn with_service(service: Arc<dyn TokenService>, config: TokenConfig) -> Self {
        let (state, _) = watch::channel(TokenState::None);
        Self {
            inner: Arc::new(TokenInner {
                service,
                config,
                credential: Mutex::new(None),
                state,
                inflight: Mutex::new(None),
                timer: Mutex::new(None),
                generation: AtomicU64::new(0),
                epoch: AtomicU64::new(0),
                destroyed: AtomicBool::new(false),
                refreshed: Listeners::new(),
                expiring: Listeners::new(),
                errors: Listeners::new(),
            }),
        }
    }

    /// Issues a credential from an organization secret.
    #[instrument(skip(self, request), fields(org = %request.organization_id))]
    pub async fn create_token(&self, request: CreateTokenRequest) -> Result<TokenInfo, TokenError> {
        self.inner.ensure_alive()?;
        match self.inner.service.create(&request).await {
            Ok(response) => {
                let info = self.inner.store_response(response)?;
                info!(token_id = %info.token_id, "Token created");
                Ok(info)
            }
            Err(err) => Err(self.inner.report(err)),
        }
    }

    /// Exchanges a third-party JWT for a credential.
    #[instrument(skip(self, request), fields(org = %request.organization_id))]
    pub async fn exchange_token(&self, request: ExchangeTokenRequest) -> Result<TokenInfo, TokenError> {
        self.inner.ensure_alive()?;
        match self.inner.service.exchange(&request).await {
            Ok(response) => {
                let info = self.inner.store_response(response)?;
                info!(token_id = %info.token_id, provider = ?info.provider, "Token exchanged");
                Ok(info)
            }
            Err(err) => Err(self.inner.report(err)),
        }
    }

    /// Refreshes the stored credential, joining an outstanding refresh if
    /// there is one.
    ///
    /// # Errors
    ///
    /// `MissingToken` without a stored credential, `RefreshFailed` once
    /// every attempt failed.
    pub async fn refresh_token(&self) -> Result<TokenInfo, TokenError> {
        self.inner.ensure_alive()?;
        TokenInner::refresh(&self.inner).await
    }

    /// Broker credentials, or `None` when absent or expired.
    pub fn credentials(&self) -> Option<MqttCredentials> {
        let now = OffsetDateTime::now_utc();
        lock(&self.inner.credential)
            .as_ref()
            .filter(|c| !c.is_expired_at(now))
            .map(|c| c.mqtt.clone())
    }

    pub fn token_info(&self) -> Option<TokenInfo> {
        lock(&self.inner.credential).as_ref().map(Credential::info)
    }

    /// Current state, with `Expired` derived from the clock.
    pub fn state(&self) -> TokenState {
        let stored = *self.inner.state.borrow();
        match stored {
            TokenState::Valid | TokenState::Expiring if self.is_expired() => TokenState::Expired,
            other => other,
        }
    }

    /// Stored state transitions (never `Expired`).
    pub fn watch_state(&self) -> watch::Receiver<TokenState> {
        self.inner.state.subscribe()
    }

    /// `true` without a credential or once its expiry has passed.
    pub fn is_expired(&self) -> bool {
        let now = OffsetDateTime::now_utc();
        lock(&self.inner.credential)
            .as_ref()
            .map_or(true, |c| c.is_expired_at(now))
    }

    pub fn seconds_until_expiry(&self) -> Option<i64> {
        let now = OffsetDateTime::now_utc();
        lock(&self.inner.credential)
            .as_ref()
            .map(|c| c.seconds_until_expiry(now))
    }

    /// Stores a credential obtained elsewhere and schedules its refresh.
    pub fn set_credential(&self, credential: Credential) -> Result<TokenInfo, TokenError> {
        self.inner.ensure_alive()?;
        Ok(self.inner.store(credential))
    }

    /// Lists the identity providers of an organization.
    pub async fn list_providers(&self, organization_id: &str) -> Result<Vec<Provider>, TokenError> {
        self.inner.ensure_alive()?;
        self.inner.service.providers(organization_id).await
    }

    /// Drops the credential and the refresh timer; listeners stay attached.
    /// A refresh still in flight completes with [`TokenError::MissingToken`]
    /// and stores nothing.
    pub fn clear(&self) {
        self.inner.epoch.fetch_add(1, Ordering::AcqRel);
        lock(&self.inner.inflight).take();
        self.inner.cancel_timer();
        lock(&self.inner.credential).take();
        self.inner.set_state(TokenState::None);
    }

    /// Cancels the timer, clears the credential and detaches all listeners.
    /// Further calls are no-ops.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.clear();
        self.inner.refreshed.clear();
        self.inner.expiring.clear();
        self.inner.errors.clear();
        debug!("Token manager destroyed");
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    /// Called with the new token info after every successful refresh.
    pub fn on_refreshed<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(&TokenInfo) + Send + Sync + 'static,
    {
        self.inner.refreshed.add(callback)
    }

    /// Called with the seconds left before expiry when the refresh timer fires.
    pub fn on_expiring<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(&u64) + Send + Sync + 'static,
    {
        self.inner.expiring.add(callback)
    }

    /// Called for failed service calls and exhausted refreshes.
    pub fn on_error<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(&TokenError) + Send + Sync + 'static,
    {
        self.inner.errors.add(callback)
    }
}

impl TokenInner {
    fn ensure_alive(&self) -> Result<(), TokenError> {
        if self.destroyed.load(Ordering::Acquire) {
            Err(TokenError::Destroyed)
        } else {
            Ok(())
        }
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::Acquire) == epoch && self.ensure_alive().is_ok()
    }

    fn set_state(&self, state: TokenState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                debug!(from = %current, to = %state, "Token state changed");
                *current = state;
                true
            }
        });
    }

    fn report(&self, err: TokenError) -> TokenError {
        warn!(error = %err, "Token service call failed");
        self.errors.emit(&err);
        err
    }

    fn store_response(self: &Arc<Self>, response: TokenResponse) -> Result<TokenInfo, TokenError> {
        self.ensure_alive()?;
        let buffer = TimeDuration::seconds(self.config.refresh_buffer_seconds as i64);
        let credential = Credential::from_response(response, buffer, OffsetDateTime::now_utc());
        Ok(self.store(credential))
    }

    fn store(self: &Arc<Self>, credential: Credential) -> TokenInfo {
        let info = credential.info();
        let has_expiry = credential.expires_at.is_some();
        *lock(&self.credential) = Some(credential);
        self.set_state(TokenState::Valid);

        if !self.config.auto_refresh {
            self.cancel_timer();
        } else if has_expiry {
            self.schedule(info.refresh_recommended_at);
        } else {
            warn!(token_id = %info.token_id, "Token has no expiry; automatic refresh disabled for it");
            self.cancel_timer();
        }
        info
    }

    /// Arms the refresh timer, cancelling the previous one.
    fn schedule(self: &Arc<Self>, at: OffsetDateTime) {
        let delay = Duration::try_from(at - OffsetDateTime::now_utc()).unwrap_or(Duration::ZERO);
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let weak = Arc::downgrade(self);

        debug!(delay_ms = delay.as_millis() as u64, "Scheduling token refresh");
        let handle = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Some(inner) = weak.upgrade() {
                inner.on_timer(generation).await;
            }
        });

        let previous = lock(&self.timer).replace(ScheduledRefresh { generation, handle });
        if let Some(previous) = previous {
            previous.handle.abort();
        }
    }

    fn cancel_timer(&self) {
        if let Some(timer) = lock(&self.timer).take() {
            timer.handle.abort();
        }
    }

    async fn on_timer(self: Arc<Self>, generation: u64) {
        {
            let mut slot = lock(&self.timer);
            match slot.as_ref() {
                // Detach ourselves so re-arming never aborts the running refresh.
                Some(timer) if timer.generation == generation => {
                    slot.take();
                }
                _ => return,
            }
        }
        if self.ensure_alive().is_err() {
            return;
        }

        let remaining = lock(&self.credential)
            .as_ref()
            .map(|c| c.seconds_until_expiry(OffsetDateTime::now_utc()));
        let Some(remaining) = remaining else {
            return;
        };

        self.set_state(TokenState::Expiring);
        info!(seconds_remaining = remaining, "Token expiring, refreshing");
        self.expiring.emit(&(remaining as u64));

        if let Err(err) = Self::refresh(&self).await {
            warn!(error = %err, "Scheduled token refresh failed");
        }
    }

    async fn refresh(self: &Arc<Self>) -> Result<TokenInfo, TokenError> {
        let future = {
            let mut slot = lock(&self.inflight);
            match slot.as_ref() {
                Some(existing) => {
                    debug!("Joining in-flight token refresh");
                    existing.clone()
                }
                None => {
                    if lock(&self.credential).is_none() {
                        return Err(TokenError::MissingToken);
                    }
                    let inner = Arc::clone(self);
                    let future = async move { inner.run_refresh().await }.boxed().shared();
                    *slot = Some(future.clone());
                    future
                }
            }
        };
        future.await
    }

    async fn run_refresh(self: Arc<Self>) -> Result<TokenInfo, TokenError> {
        let max_attempts = self.config.max_refresh_retries.max(1);
        let retry_delay = self.config.refresh_retry_delay();
        let epoch = self.epoch.load(Ordering::Acquire);
        self.set_state(TokenState::Refreshing);

        let mut attempt = 0;
        let outcome = loop {
            attempt += 1;
            let request = lock(&self.credential).as_ref().map(|c| RefreshTokenRequest {
                token_id: c.token_id.clone(),
                current_token_password: c.mqtt.password.clone(),
            });
            let Some(request) = request else {
                break Err(TokenError::MissingToken);
            };

            match self.service.refresh(&request).await {
                Ok(response) => break Ok(response),
                Err(err) if err.is_retryable() && attempt < max_attempts && self.is_current(epoch) => {
                    warn!(attempt, max_attempts, error = %err, "Token refresh attempt failed, retrying");
                    tokio::time::sleep(retry_delay).await;
                }
                Err(err) => {
                    break Err(TokenError::RefreshFailed {
                        attempts: attempt,
                        last: Box::new(err),
                    })
                }
            }
        };

        self.ensure_alive()?;
        if !self.is_current(epoch) {
            debug!("Credential cleared during refresh; discarding result");
            return Err(TokenError::MissingToken);
        }
        // Cleared before the new timer is armed so the next refresh starts fresh.
        lock(&self.inflight).take();

        match outcome {
            Ok(response) => {
                let info = self.store_response(response)?;
                info!(token_id = %info.token_id, attempts = attempt, "Token refreshed");
                self.refreshed.emit(&info);
                Ok(info)
            }
            Err(err) => {
                self.set_state(TokenState::Error);
                Err(self.report(err))
            }
        }
    }
}

impl Drop for TokenInner {
    fn drop(&mut self) {
        let timer = self
            .timer
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(timer) = timer {
            timer.handle.abort();
        }
    }
}
