#![allow(dead_code)]

use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use tether::{
    config::TokenConfig,
    token::{
        CreateTokenRequest, ExchangeTokenRequest, Provider, RefreshTokenRequest, TokenResponse,
        TokenService,
    },
    Config, MemoryBroker, MqttCredentials, MqttManager, Supervisor, TokenError, TokenManager,
};
use time::OffsetDateTime;

/// Short timings so paused-clock tests stay quick.
pub fn config(client_id: &str) -> Config {
    Config {
        client_id: client_id.to_string(),
        connect_timeout_ms: 5_000,
        reconnect_period_ms: 100,
        max_reconnect_delay_ms: 100,
        ..Config::default()
    }
}

pub fn supervisor(broker: &MemoryBroker, config: Config) -> Supervisor {
    MqttManager::from_config(config)
        .unwrap()
        .with_transport(Arc::new(broker.transport()))
        .build()
        .unwrap()
}

/// Polls `condition` on the simulated clock.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..1_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 10s of simulated time");
}

pub fn counter() -> (Arc<AtomicU32>, impl Fn() + Send + Sync + 'static) {
    let count = Arc::new(AtomicU32::new(0));
    let bump = Arc::clone(&count);
    (count, move || {
        bump.fetch_add(1, Ordering::SeqCst);
    })
}

pub fn recorder<T: Clone + Send + 'static>() -> (Arc<Mutex<Vec<T>>>, impl Fn(&T) + Send + Sync + 'static) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    (seen, move |value: &T| sink.lock().unwrap().push(value.clone()))
}

/// In-process token service. Every issued credential gets the next password
/// (`pass-1`, `pass-2`, ...).
pub struct ScriptedTokenService {
    pub issued: AtomicU32,
    pub refresh_calls: AtomicU32,
    /// Refresh calls to fail before succeeding.
    pub refresh_failures: AtomicU32,
    pub refresh_latency: Duration,
    pub lifetime: time::Duration,
    pub recommend_after: Option<time::Duration>,
}

impl Default for ScriptedTokenService {
    fn default() -> Self {
        Self {
            issued: AtomicU32::new(0),
            refresh_calls: AtomicU32::new(0),
            refresh_failures: AtomicU32::new(0),
            refresh_latency: Duration::ZERO,
            lifetime: time::Duration::hours(1),
            recommend_after: None,
        }
    }
}

impl ScriptedTokenService {
    fn issue(&self) -> TokenResponse {
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        let now = OffsetDateTime::now_utc();
        TokenResponse {
            token_id: "tok_1".into(),
            access_token: format!("access-{n}"),
            mqtt_credentials: MqttCredentials::new("device", format!("pass-{n}")),
            user_email: Some("ops@example.com".into()),
            provider: Some("native".into()),
            expires_at: Some(now + self.lifetime),
            refresh_recommended_at: self.recommend_after.map(|after| now + after),
        }
    }
}

#[async_trait]
impl TokenService for ScriptedTokenService {
    async fn create(&self, _: &CreateTokenRequest) -> Result<TokenResponse, TokenError> {
        Ok(self.issue())
    }

    async fn exchange(&self, request: &ExchangeTokenRequest) -> Result<TokenResponse, TokenError> {
        if request.token.is_empty() {
            return Err(TokenError::AuthFailed("empty token".into()));
        }
        Ok(self.issue())
    }

    async fn refresh(&self, _: &RefreshTokenRequest) -> Result<TokenResponse, TokenError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        if !self.refresh_latency.is_zero() {
            tokio::time::sleep(self.refresh_latency).await;
        }
        let failing = self
            .refresh_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TokenError::Network("connection reset".into()));
        }
        Ok(self.issue())
    }

    async fn providers(&self, _: &str) -> Result<Vec<Provider>, TokenError> {
        Ok(Vec::new())
    }
}

pub fn token_manager(service: Arc<ScriptedTokenService>, config: TokenConfig) -> TokenManager {
    TokenManager::with_service(service, config)
}

pub fn create_request() -> CreateTokenRequest {
    CreateTokenRequest {
        organization_id: "org_1".into(),
        secret_key: "sk_live".into(),
        user_email: "ops@example.com".into(),
        integration_id: None,
        replace_existing: None,
    }
}
