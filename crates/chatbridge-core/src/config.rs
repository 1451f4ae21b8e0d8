//! Environment-driven bridge configuration.

use std::{env, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::traits::{InvalidSessionId, SessionId};

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {var}")]
    Invalid { var: &'static str, value: String },
    #[error(transparent)]
    SessionId(#[from] InvalidSessionId),
}

/// Settings shared by the store, bus, relay and sweeper.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Store and bus host.
    pub redis_host: String,
    /// Store and bus port.
    pub redis_port: u16,
    /// Optional store password.
    pub redis_password: Option<String>,
    /// Session this process serves.
    pub session_id: SessionId,
    /// Namespace prefix for every store key.
    pub key_prefix: String,
    /// Bus channel carrying relay envelopes in both directions.
    pub channel: String,
    /// Base URL of the delivery notification backend.
    pub notifier_base_url: String,
    /// Path appended to `notifier_base_url`.
    pub notifier_endpoint: String,
    /// Heartbeat age after which the sweeper clears a session.
    pub session_max_age: Duration,
    /// Period between expiry sweeps.
    pub sweep_interval: Duration,
    /// Pause before an automatic reconnect.
    pub reconnect_delay: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            redis_host: "localhost".to_string(),
            redis_port: 6379,
            redis_password: None,
            session_id: SessionId::default(),
            key_prefix: "chatbridge".to_string(),
            channel: "chatbridge_relay".to_string(),
            notifier_base_url: "http://localhost:5000".to_string(),
            notifier_endpoint: "surveys/mark_survey_sent".to_string(),
            session_max_age: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(60 * 60),
            reconnect_delay: Duration::from_millis(2000),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from the process environment, falling back to defaults.
    ///
    /// # Errors
    /// Returns error if a variable is set but cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    /// Returns error if a variable is set but cannot be parsed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let text = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        if let Some(host) = text("REDIS_HOST") {
            config.redis_host = host;
        }
        if let Some(port) = text("REDIS_PORT") {
            config.redis_port = parse("REDIS_PORT", &port)?;
        }
        config.redis_password = text("REDIS_PASSWORD");
        if let Some(id) = text("BRIDGE_SESSION_ID") {
            config.session_id = SessionId::new(id)?;
        }
        if let Some(prefix) = text("BRIDGE_KEY_PREFIX") {
            config.key_prefix = prefix;
        }
        if let Some(channel) = text("BRIDGE_CHANNEL") {
            config.channel = channel;
        }
        if let Some(url) = text("NOTIFIER_BASE_URL") {
            config.notifier_base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(endpoint) = text("NOTIFIER_ENDPOINT") {
            config.notifier_endpoint = endpoint.trim_start_matches('/').to_string();
        }
        if let Some(hours) = text("SESSION_MAX_AGE_HOURS") {
            config.session_max_age =
                Duration::from_secs(parse::<u64>("SESSION_MAX_AGE_HOURS", &hours)? * 60 * 60);
        }
        if let Some(secs) = text("SWEEP_INTERVAL_SECS") {
            config.sweep_interval = Duration::from_secs(parse("SWEEP_INTERVAL_SECS", &secs)?);
        }
        if let Some(ms) = text("RECONNECT_DELAY_MS") {
            config.reconnect_delay = Duration::from_millis(parse("RECONNECT_DELAY_MS", &ms)?);
        }

        Ok(config)
    }

    /// Connection URL for the store and bus.
    #[must_use]
    pub fn redis_url(&self) -> String {
        match &self.redis_password {
            Some(password) => format!(
                "redis://:{password}@{}:{}/",
                self.redis_host, self.redis_port
            ),
            None => format!("redis://{}:{}/", self.redis_host, self.redis_port),
        }
    }

    /// Full URL of the delivery notification endpoint.
    #[must_use]
    pub fn notifier_url(&self) -> String {
        if self.notifier_endpoint.is_empty() {
            self.notifier_base_url.clone()
        } else {
            format!("{}/{}", self.notifier_base_url, self.notifier_endpoint)
        }
    }
}

fn parse<T: FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        var,
        value: value.to_string(),
    })
}
