//! TOML-backed configuration for broker connections and the publisher.
//!
//! Channel declarations never come from files; they are code. This module
//! only covers the deployment-varying settings: where the broker lives, how
//! to authenticate, and whether publishing is switched on.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        ConfigError::Invalid(reason.into())
    }
}

/// Connection settings handed to `BrokerAdapter::connect`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Broker endpoint, e.g. `nats://localhost:4222` or `mem://local`.
    pub url: String,
    /// Client connection name advertised to the broker.
    pub name: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
}

impl BrokerConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            name: None,
            username: None,
            password: None,
            token: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::invalid("broker url must not be empty"));
        }
        if self.token.is_some() && self.username.is_some() {
            return Err(ConfigError::invalid(
                "token and username/password auth are mutually exclusive",
            ));
        }
        if self.password.is_some() && self.username.is_none() {
            return Err(ConfigError::invalid("password requires a username"));
        }
        Ok(())
    }
}

/// Publisher switch. Defaults to enabled; deployments that must not emit
/// messages (migrations, some test environments) set `enabled = false`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublisherConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl PublisherConfig {
    pub fn disabled() -> Self {
        Self { enabled: false }
    }
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

fn default_enabled() -> bool {
    true
}

/// Top-level messaging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagingConfig {
    pub broker: BrokerConfig,
    #[serde(default)]
    pub publisher: PublisherConfig,
}

impl MessagingConfig {
    /// Parse from a TOML string.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Read and parse a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.broker.validate()
    }
}
