//! Server and client configuration.
//!
//! Every field has a default, so a config file only needs the keys it
//! wants to override:
//!
//! ```json
//! { "server": { "port": 9000 }, "client": { "call_timeout_ms": 2000 } }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Top-level configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub client: ClientConfig,
}

impl Config {
    /// Load a JSON config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Where and how the authoritative side listens
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface to bind
    pub host: String,

    /// Port to bind, 0 picks a free one
    pub port: u16,

    /// Buffered broadcasts per event before slow subscribers start lagging
    pub event_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            event_capacity: 1024,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// How a mirror side connects to the authority
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Reconnect after the connection drops or fails
    pub reconnect: bool,

    /// Delays between reconnect attempts
    pub reconnect_policy: ReconnectPolicy,

    /// Upper bound on a single remote call
    pub call_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            reconnect: true,
            reconnect_policy: ReconnectPolicy::default(),
            call_timeout_ms: 10_000,
        }
    }
}

impl ClientConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// A client that connects once and never retries
    pub fn no_reconnect() -> Self {
        Self {
            reconnect: false,
            ..Default::default()
        }
    }
}

/// Reconnect backoff configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Maximum number of consecutive failed attempts, 0 for unlimited
    pub max_attempts: u32,

    /// Delay before the first retry
    pub initial_delay_ms: u64,

    /// Exponential backoff multiplier
    pub backoff_multiplier: f64,

    /// Maximum delay between retries
    pub max_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay_ms: 250,
            backoff_multiplier: 2.0,
            max_delay_ms: 5_000,
        }
    }
}

impl ReconnectPolicy {
    /// Create an aggressive policy, mostly useful in tests
    pub fn aggressive() -> Self {
        Self {
            max_attempts: 0,
            initial_delay_ms: 50,
            backoff_multiplier: 1.5,
            max_delay_ms: 500,
        }
    }

    /// Delay before the given retry (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let millis = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        Duration::from_millis(millis.min(self.max_delay_ms as f64) as u64)
    }

    /// Whether another attempt is allowed after `failed` consecutive failures
    pub fn allows(&self, failed: u32) -> bool {
        self.max_attempts == 0 || failed < self.max_attempts
    }
}
