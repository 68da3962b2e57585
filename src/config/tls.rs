//! TLS material for broker connections.

use std::path::Path;

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

/// PEM file locations for TLS (and optional mutual TLS).
///
/// ```toml
/// [tls]
/// ca_cert_path = "/etc/tether/ca.pem"
/// client_cert_path = "/etc/tether/client.crt"
/// client_key_path = "/etc/tether/client.key"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct TlsConfig {
    /// CA used to verify the broker. Required whenever this section is present.
    #[validate(custom(function = "validate_file_path"))]
    pub ca_cert_path: Option<String>,

    /// Client certificate; must be paired with `client_key_path`.
    #[validate(custom(function = "validate_file_path"))]
    pub client_cert_path: Option<String>,

    /// Unencrypted client key; must be paired with `client_cert_path`.
    #[validate(custom(function = "validate_file_path"))]
    pub client_key_path: Option<String>,
}

impl TlsConfig {
    pub fn with_ca_only(ca_cert_path: impl Into<String>) -> Self {
        Self {
            ca_cert_path: Some(ca_cert_path.into()),
            ..Self::default()
        }
    }

    pub fn mutual(
        ca_cert_path: impl Into<String>,
        client_cert_path: impl Into<String>,
        client_key_path: impl Into<String>,
    ) -> Self {
        Self {
            ca_cert_path: Some(ca_cert_path.into()),
            client_cert_path: Some(client_cert_path.into()),
            client_key_path: Some(client_key_path.into()),
        }
    }

    pub fn has_client_auth(&self) -> bool {
        self.client_cert_path.is_some() && self.client_key_path.is_some()
    }

    /// Checks presence and pairing on top of the per-field file checks.
    pub fn validate_config(&self) -> Result<(), ValidationError> {
        let Some(ca) = self.ca_cert_path.as_deref() else {
            return Err(ValidationError::new("missing_ca_cert")
                .with_message("CA certificate path is required".into()));
        };
        validate_file_path(ca)?;

        match (&self.client_cert_path, &self.client_key_path) {
            (Some(cert), Some(key)) => {
                validate_file_path(cert)?;
                validate_file_path(key)
            }
            (None, None) => Ok(()),
            _ => Err(ValidationError::new("incomplete_client_auth").with_message(
                "Both client certificate and key must be provided or neither".into(),
            )),
        }
    }
}

fn validate_file_path(path: &str) -> Result<(), ValidationError> {
    if path.is_empty() {
        return Err(
            ValidationError::new("empty_path").with_message("File path cannot be empty".into())
        );
    }
    let file = Path::new(path);
    if !file.is_file() {
        return Err(ValidationError::new("file_not_found")
            .with_message(format!("File does not exist: {path}").into()));
    }
    Ok(())
}
