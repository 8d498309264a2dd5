use crate::error::{RealtimeError, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use url::Url;

const DEFAULT_WS_BASE_URL: &str = "ws://localhost:8080";

/// Runtime configuration for the realtime layer.
///
/// Every field has a default, so a partial JSON document or an empty
/// environment both produce a usable config.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RealtimeConfig {
    /// Base URL every endpoint path is appended to.
    #[serde(default = "default_ws_base_url")]
    pub ws_base_url: String,

    /// Period of the heartbeat ping on monitored connections.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Silence after which an open connection is treated as dead.
    #[serde(default = "default_stale_after_ms")]
    pub stale_after_ms: u64,

    /// Pending outbound frames kept per connection while it is not open.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Pause between closing and re-opening on a manual reconnect.
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,

    /// Upper bound on the TCP and WebSocket handshake of one transport.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Buffer of the observability broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_ws_base_url() -> String {
    DEFAULT_WS_BASE_URL.to_string()
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_stale_after_ms() -> u64 {
    60_000
}

fn default_max_queue_size() -> usize {
    100
}

fn default_settle_delay_ms() -> u64 {
    100
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_event_capacity() -> usize {
    256
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            ws_base_url: default_ws_base_url(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            stale_after_ms: default_stale_after_ms(),
            max_queue_size: default_max_queue_size(),
            settle_delay_ms: default_settle_delay_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl RealtimeConfig {
    /// Builds a config from defaults overlaid with `VAPOR_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(url) = lookup("VAPOR_WS_BASE_URL") {
            config.ws_base_url = url;
        }
        if let Some(ms) = parse_var(&lookup, "VAPOR_HEARTBEAT_INTERVAL_MS")? {
            config.heartbeat_interval_ms = ms;
        }
        if let Some(ms) = parse_var(&lookup, "VAPOR_STALE_AFTER_MS")? {
            config.stale_after_ms = ms;
        }
        if let Some(size) = parse_var(&lookup, "VAPOR_MAX_QUEUE_SIZE")? {
            config.max_queue_size = size;
        }
        if let Some(ms) = parse_var(&lookup, "VAPOR_SETTLE_DELAY_MS")? {
            config.settle_delay_ms = ms;
        }
        if let Some(ms) = parse_var(&lookup, "VAPOR_CONNECT_TIMEOUT_MS")? {
            config.connect_timeout_ms = ms;
        }
        if let Some(capacity) = parse_var(&lookup, "VAPOR_EVENT_CAPACITY")? {
            config.event_capacity = capacity;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.ws_base_url = url.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        let url = self.base_url()?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(RealtimeError::ConfigError(format!(
                "ws_base_url must use ws:// or wss://, got '{}'",
                self.ws_base_url
            )));
        }
        if self.heartbeat_interval_ms == 0
            || self.stale_after_ms == 0
            || self.connect_timeout_ms == 0
        {
            return Err(RealtimeError::ConfigError(
                "heartbeat interval, stale threshold and connect timeout must be non-zero"
                    .to_string(),
            ));
        }
        if self.max_queue_size == 0 || self.event_capacity == 0 {
            return Err(RealtimeError::ConfigError(
                "queue size and event capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn base_url(&self) -> Result<Url> {
        Ok(Url::parse(&self.ws_base_url)?)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>> {
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
            RealtimeError::ConfigError(format!("{} has an invalid value '{}'", name, raw))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults_match_console_behaviour() {
        let config = RealtimeConfig::default();
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.stale_after(), Duration::from_secs(60));
        assert_eq!(config.max_queue_size, 100);
        assert_eq!(config.settle_delay(), Duration::from_millis(100));
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let config = RealtimeConfig::from_lookup(lookup_from(&[
            ("VAPOR_WS_BASE_URL", "wss://console.example.com"),
            ("VAPOR_STALE_AFTER_MS", "5000"),
            ("VAPOR_MAX_QUEUE_SIZE", "8"),
            ("VAPOR_CONNECT_TIMEOUT_MS", "2500"),
        ]))
        .expect("valid env");
        assert_eq!(config.ws_base_url, "wss://console.example.com");
        assert_eq!(config.stale_after(), Duration::from_secs(5));
        assert_eq!(config.max_queue_size, 8);
        assert_eq!(config.connect_timeout(), Duration::from_millis(2500));
        assert_eq!(config.heartbeat_interval_ms, 30_000);
    }

    #[test]
    fn test_env_rejects_garbage() {
        let result =
            RealtimeConfig::from_lookup(lookup_from(&[("VAPOR_HEARTBEAT_INTERVAL_MS", "soon")]));
        assert!(matches!(result, Err(RealtimeError::ConfigError(_))));

        let result =
            RealtimeConfig::from_lookup(lookup_from(&[("VAPOR_WS_BASE_URL", "http://x.test")]));
        assert!(matches!(result, Err(RealtimeError::ConfigError(_))));

        let result = RealtimeConfig::from_lookup(lookup_from(&[("VAPOR_MAX_QUEUE_SIZE", "0")]));
        assert!(matches!(result, Err(RealtimeError::ConfigError(_))));

        let result =
            RealtimeConfig::from_lookup(lookup_from(&[("VAPOR_CONNECT_TIMEOUT_MS", "0")]));
        assert!(matches!(result, Err(RealtimeError::ConfigError(_))));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: RealtimeConfig =
            serde_json::from_str(r#"{"ws_base_url":"ws://10.0.0.5:9000"}"#).unwrap();
        assert_eq!(config.ws_base_url, "ws://10.0.0.5:9000");
        assert_eq!(config.max_queue_size, 100);
    }
}
