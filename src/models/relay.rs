use std::{
    fmt::{Debug, Formatter},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::utils::mask_secret;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    /// Plaintext connection upgraded with STARTTLS (port 587).
    #[default]
    Starttls,
    /// Implicit TLS from the first byte (port 465).
    Tls,
    /// No encryption. Only for local development relays.
    None,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RelayConfigError {
    #[error("SMTP_USERNAME and SMTP_PASSWORD must be set")]
    MissingCredentials,

    #[error("SMTP host cannot be empty")]
    MissingHost,
}

/// Connection and authentication parameters for the outbound mail relay.
#[derive(Clone)]
pub struct MailRelayConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    password: String,
    pub sender_address: String,
    pub tls: TlsMode,
    pub timeout: Duration,
}

impl MailRelayConfig {
    /// The sender falls back to `username` when `sender_address` is unset or blank.
    pub fn new(
        host: String,
        port: u16,
        username: String,
        password: String,
        sender_address: Option<String>,
    ) -> Result<Self, RelayConfigError> {
        if host.trim().is_empty() {
            return Err(RelayConfigError::MissingHost);
        }

        if username.is_empty() || password.is_empty() {
            return Err(RelayConfigError::MissingCredentials);
        }

        let sender_address = sender_address
            .filter(|sender| !sender.trim().is_empty())
            .unwrap_or_else(|| username.clone());

        Ok(Self {
            host,
            port,
            username,
            password,
            sender_address,
            tls: TlsMode::default(),
            timeout: DEFAULT_CONNECT_TIMEOUT,
        })
    }

    pub fn with_tls(mut self, tls: TlsMode) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn masked_password(&self) -> String {
        mask_secret(&self.password)
    }
}

impl Debug for MailRelayConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailRelayConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("sender_address", &self.sender_address)
            .field("tls", &self.tls)
            .field("timeout", &self.timeout)
            .finish()
    }
}
