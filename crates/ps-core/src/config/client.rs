//! Client configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::backoff::BackoffConfig;
use super::serde_utils::{duration_secs, option_duration_secs};
use crate::error::ConfigError;

/// Environment variable overriding [`ClientConfig::api_url`]
pub const API_URL_ENV: &str = "PAIRSYNC_API_URL";

/// Environment variable overriding [`ClientConfig::poll_interval`] (seconds)
pub const POLL_INTERVAL_ENV: &str = "PAIRSYNC_POLL_INTERVAL";

/// Configuration for the client side of the backend link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base address of the backend's request/response API.
    ///
    /// The push-channel address is derived from it by scheme substitution
    /// (`http` becomes `ws`, `https` becomes `wss`).
    pub api_url: String,

    /// Interval between status polls while the push channel is unavailable
    #[serde(with = "duration_secs")]
    pub poll_interval: Duration,

    /// Timeout for a single request/response call
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,

    /// Fall back to polling when the status channel stays silent this long.
    ///
    /// Disabled when unset.
    #[serde(with = "option_duration_secs", skip_serializing_if = "Option::is_none")]
    pub push_stall_timeout: Option<Duration>,

    /// Endpoint paths
    pub endpoints: EndpointConfig,

    /// Backoff used when the CLI recreates a failed chat channel
    pub backoff: BackoffConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8000".to_string(),
            poll_interval: Duration::from_secs(3),
            request_timeout: Duration::from_secs(30),
            push_stall_timeout: None,
            endpoints: EndpointConfig::default(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Create a config for the given backend address with defaults otherwise
    pub fn with_api_url(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            ..Self::default()
        }
    }

    /// Defaults plus environment overrides, for runs without a config file
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env_overrides()
    }

    /// Apply `PAIRSYNC_*` environment overrides and validate the result
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    fn with_overrides_from<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(API_URL_ENV) {
            self.api_url = url;
        }
        if let Some(secs) = lookup(POLL_INTERVAL_ENV) {
            let secs: u64 = secs.trim().parse().map_err(|_| {
                ConfigError::Invalid(format!("{} must be whole seconds, got {:?}", POLL_INTERVAL_ENV, secs))
            })?;
            self.poll_interval = Duration::from_secs(secs);
        }
        self.validate()?;
        Ok(self)
    }

    /// Check values that would break the transports at runtime
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.api_url.starts_with("http://") || self.api_url.starts_with("https://")) {
            return Err(ConfigError::Invalid(format!(
                "api_url must start with http:// or https://, got {:?}",
                self.api_url
            )));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Invalid("poll_interval must be non-zero".to_string()));
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::Invalid("request_timeout must be non-zero".to_string()));
        }
        if self.push_stall_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::Invalid(
                "push_stall_timeout must be non-zero when set".to_string(),
            ));
        }
        self.backoff.validate()
    }

    /// Base address for push channels
    pub fn push_url(&self) -> String {
        if let Some(rest) = self.api_url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = self.api_url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            self.api_url.clone()
        }
    }

    /// Full URL of a request/response endpoint
    pub fn http_url(&self, path: &str) -> String {
        join_url(&self.api_url, path)
    }

    /// Full URL of a push channel
    pub fn channel_url(&self, path: &str) -> String {
        join_url(&self.push_url(), path)
    }
}

fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    if path.starts_with('/') {
        format!("{}{}", base, path)
    } else {
        format!("{}/{}", base, path)
    }
}

/// Paths of the backend endpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// `GET` pairing code
    pub pairing_code: String,
    /// `GET` connection status
    pub connection_status: String,
    /// `POST` non-streaming chat
    pub chat: String,
    /// `GET` health check
    pub health: String,
    /// Status push channel
    pub status_channel: String,
    /// Chat push channel
    pub chat_channel: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            pairing_code: "/api/qrcode".to_string(),
            connection_status: "/api/connection-status".to_string(),
            chat: "/api/chat".to_string(),
            health: "/".to_string(),
            status_channel: "/ws/whatsapp-status".to_string(),
            chat_channel: "/ws/chat".to_string(),
        }
    }
}
