//! Configuration structures.
//!
//! Every section has defaults, so a partial document (or none at all) yields
//! a usable configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::errors::Result;

/// Global configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Client-side call configuration.
    #[serde(default)]
    pub client: ClientConfig,

    /// Cleanup scheduler configuration.
    #[serde(default)]
    pub janitor: JanitorConfig,

    /// Server-side dispatch configuration.
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Parse a JSON configuration document.
    pub fn from_json(document: &str) -> Result<Self> {
        Ok(serde_json::from_str(document)?)
    }
}

/// Client-side call configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Deadline used by `PendingCall::get` and the reply-channel safety net.
    #[serde(with = "humantime_serde")]
    pub default_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(5),
        }
    }
}

/// Cleanup scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JanitorConfig {
    /// How long `stop` waits for the worker to drain outstanding releases.
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            shutdown_grace: Duration::from_secs(1),
        }
    }
}

/// Server-side dispatch configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Maximum inbound messages dispatched concurrently by the listener loop.
    pub max_in_flight: usize,

    /// Per-receive deadline of the listener loop. `None` waits indefinitely.
    #[serde(default, with = "humantime_serde")]
    pub receive_timeout: Option<Duration>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 64,
            receive_timeout: None,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.client.default_timeout, Duration::from_secs(5));
        assert_eq!(config.dispatcher.max_in_flight, 64);
        assert!(config.dispatcher.receive_timeout.is_none());
        assert_eq!(config.observability.log_level, "info");
    }

    #[test]
    fn test_partial_document() {
        let config = Config::from_json(
            r#"{
                "client": { "default_timeout": "250ms" },
                "dispatcher": { "max_in_flight": 4, "receive_timeout": "2s" }
            }"#,
        )
        .unwrap();

        assert_eq!(config.client.default_timeout, Duration::from_millis(250));
        assert_eq!(config.dispatcher.max_in_flight, 4);
        assert_eq!(config.dispatcher.receive_timeout, Some(Duration::from_secs(2)));
        assert_eq!(config.janitor.shutdown_grace, Duration::from_secs(1));
    }

    #[test]
    fn test_invalid_duration_rejected() {
        let result = Config::from_json(r#"{ "client": { "default_timeout": "soon" } }"#);
        assert!(result.is_err());
    }
}
