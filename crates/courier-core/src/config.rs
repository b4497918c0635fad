//! Bus configuration.
//!
//! Loaded from JSON or built in code. `exchange` has no default; every other
//! option does.

use serde::{Deserialize, Serialize};

use crate::app::RetryPolicy;
use crate::error::CourierError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Topic exchange every message is published to. Required.
    #[serde(default)]
    pub exchange: String,

    /// Prepended to durable queue names of pull subscriptions.
    #[serde(default)]
    pub queue_prefix: String,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_user")]
    pub user: String,

    #[serde(default = "default_password", skip_serializing)]
    pub password: String,

    #[serde(default = "default_vhost")]
    pub vhost: String,

    /// Unacknowledged deliveries each consumer may hold at once.
    #[serde(default = "default_prefetch")]
    pub prefetch: usize,

    /// Published envelopes and finished delivery records the in-memory bus
    /// keeps for inspection. Older entries are dropped; 0 keeps none.
    #[serde(default = "default_history")]
    pub history: usize,

    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5672
}

fn default_user() -> String {
    "guest".to_string()
}

fn default_password() -> String {
    "guest".to_string()
}

fn default_vhost() -> String {
    "/".to_string()
}

fn default_prefetch() -> usize {
    1
}

fn default_history() -> usize {
    1024
}

impl BusConfig {
    pub fn new(exchange: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            queue_prefix: String::new(),
            host: default_host(),
            port: default_port(),
            user: default_user(),
            password: default_password(),
            vhost: default_vhost(),
            prefetch: default_prefetch(),
            history: default_history(),
            retry: RetryPolicy::default(),
        }
    }

    /// Parse and validate.
    pub fn from_json(json: &str) -> Result<Self, CourierError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| CourierError::configuration(format!("invalid bus config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_queue_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.queue_prefix = prefix.into();
        self
    }

    pub fn with_host(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = user.into();
        self.password = password.into();
        self
    }

    pub fn with_vhost(mut self, vhost: impl Into<String>) -> Self {
        self.vhost = vhost.into();
        self
    }

    pub fn with_prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn with_history(mut self, history: usize) -> Self {
        self.history = history;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn validate(&self) -> Result<(), CourierError> {
        if self.exchange.trim().is_empty() {
            return Err(CourierError::configuration("exchange option is required"));
        }
        if self.prefetch == 0 {
            return Err(CourierError::configuration("prefetch must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(CourierError::configuration("retry.max_attempts must be at least 1"));
        }
        Ok(())
    }

    /// Durable queue name for a pull-registered handler type.
    pub fn queue_name(&self, handler: &str) -> String {
        format!("{}{}", self.queue_prefix, crate::domain::normalized_name(handler))
    }
}
