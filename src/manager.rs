//! Entry point for building a [`Supervisor`].
//!
//! The `MqttManager` gathers everything a supervisor needs:
//! 1. Loads or takes a configuration
//! 2. Creates the token manager when a token service URL is configured
//! 3. Picks the transport (`rumqttc` unless one is supplied)
//! 4. Returns a [`Supervisor`] ready for `connect`
//!
//! # Typical Usage
//!
//! ```ignore
//! let supervisor = MqttManager::new("mqtt.example.com", 8883)?.build()?;
//! supervisor.connect(ConnectParams::with_credentials("device", "secret")).await?;
//! supervisor.subscribe("sensor/+/data", SubscribeOptions::default()).await?;
//! ```

use std::{path::Path, sync::Arc};

use tracing::{debug, info};

use crate::{
    config::Config,
    error::TetherError,
    supervisor::Supervisor,
    token::TokenManager,
    transport::{RumqttTransport, Transport},
};

/// Builder for a [`Supervisor`].
///
/// Most applications create a manager, call [`build`](Self::build) and use
/// the returned supervisor for all MQTT operations.
pub struct MqttManager {
    /// Configuration for the MQTT session
    config: Config,

    /// Explicit token manager; overrides the one derived from `config.token`
    token_manager: Option<TokenManager>,

    /// Explicit transport; defaults to [`RumqttTransport`]
    transport: Option<Arc<dyn Transport>>,
}

impl MqttManager {
    /// Creates a manager from an existing configuration struct.
    ///
    /// # Arguments
    /// - `config`: Pre-built or loaded configuration
    ///
    /// # Returns
    /// - `Ok(Self)`: Manager ready to build
    /// - `Err(TetherError::Configuration)`: If validation fails
    ///
    /// # Examples
    /// ```ignore
    /// let config = Config::load(Path::new("tether.toml"))?;
    /// let manager = MqttManager::from_config(config)?;
    /// ```
    pub fn from_config(config: Config) -> Result<Self, TetherError> {
        config
            .validate_all()
            .map_err(|e| TetherError::Configuration(e.to_string()))?;
        Ok(Self {
            config,
            token_manager: None,
            transport: None,
        })
    }

    /// Creates a manager with minimal configuration.
    ///
    /// All other settings use defaults.
    ///
    /// # Arguments
    /// - `host`: Broker hostname or IP
    /// - `port`: Broker port (usually 1883 or 8883)
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, TetherError> {
        Self::from_config(Config {
            host: host.into(),
            port,
            ..Default::default()
        })
    }

    /// Creates a manager from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, TetherError> {
        let config = Config::load(path.as_ref()).map_err(|e| TetherError::Configuration(e.to_string()))?;
        Self::from_config(config)
    }

    /// Attaches a token manager for `connect_with_token` and credential refresh.
    pub fn with_token_manager(mut self, token_manager: TokenManager) -> Self {
        self.token_manager = Some(token_manager);
        self
    }

    /// Replaces the default `rumqttc` transport.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Builds the supervisor. Nothing connects until
    /// [`Supervisor::connect`] is called.
    ///
    /// # Returns
    /// - `Ok(Supervisor)`: Ready to connect
    /// - `Err(TetherError)`: If the token manager cannot be created
    pub fn build(self) -> Result<Supervisor, TetherError> {
        let token_manager = match self.token_manager {
            Some(tm) => Some(tm),
            None if self.config.token.service_url.is_some() => {
                debug!("Creating token manager from configuration");
                Some(TokenManager::new(self.config.token.clone())?)
            }
            None => None,
        };
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(RumqttTransport::new()));

        info!(
            host = %self.config.host,
            port = self.config.port,
            protocol = ?self.config.protocol_version,
            tokens = token_manager.is_some(),
            "Building MQTT supervisor"
        );
        Supervisor::new(self.config, transport, token_manager)
    }
}
