//! Control channel configuration

use crate::error::{ControlError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Default bound of the outbound command queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Default buffer of the inbound envelope broadcast
pub const DEFAULT_INBOUND_CAPACITY: usize = 64;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8787;

/// Configuration for a [`ControlClient`](crate::ControlClient)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlConfig {
    /// Worker control endpoint (`ws://` or `wss://`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Maximum number of commands waiting to be written
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Upper bound on the Connecting state; `None` waits forever
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout_ms: Option<u64>,

    /// Inbound envelopes buffered per subscriber before lagging
    #[serde(default = "default_inbound_capacity")]
    pub inbound_capacity: usize,
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_inbound_capacity() -> usize {
    DEFAULT_INBOUND_CAPACITY
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            url: None,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            connect_timeout_ms: None,
            inbound_capacity: DEFAULT_INBOUND_CAPACITY,
        }
    }
}

impl ControlConfig {
    /// Config pointing at the given endpoint, defaults elsewhere
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    /// Load from the process environment
    ///
    /// `AGENT_CONTROL_URL` wins; otherwise `AGENT_CONTROL_HOST` /
    /// `AGENT_CONTROL_PORT` build a `ws://` URL when at least one of them
    /// is set. With none of the three the URL stays unset.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let url = match get("AGENT_CONTROL_URL") {
            Some(url) => Some(url.trim().to_string()),
            None => {
                let host = get("AGENT_CONTROL_HOST");
                let port = get("AGENT_CONTROL_PORT");
                if host.is_none() && port.is_none() {
                    None
                } else {
                    let port = match port {
                        Some(p) => parse_number::<u16>("AGENT_CONTROL_PORT", &p)?,
                        None => DEFAULT_PORT,
                    };
                    let host = host.unwrap_or_else(|| DEFAULT_HOST.to_string());
                    Some(format!("ws://{}:{}", host.trim(), port))
                }
            }
        };

        let mut config = Self {
            url,
            ..Self::default()
        };

        if let Some(v) = get("AGENT_CONTROL_QUEUE_CAPACITY") {
            config.queue_capacity = parse_number("AGENT_CONTROL_QUEUE_CAPACITY", &v)?;
        }
        if let Some(v) = get("AGENT_CONTROL_CONNECT_TIMEOUT_MS") {
            config.connect_timeout_ms = Some(parse_number("AGENT_CONTROL_CONNECT_TIMEOUT_MS", &v)?);
        }

        Ok(config)
    }

    /// The validated control endpoint
    ///
    /// Fails when the URL is missing, unparseable, or not ws/wss.
    pub fn endpoint(&self) -> Result<Url> {
        let raw = self.url.as_deref().ok_or_else(|| {
            ControlError::Config("worker control URL is not configured".to_string())
        })?;

        let url = Url::parse(raw)
            .map_err(|e| ControlError::Config(format!("Invalid control URL '{}': {}", raw, e)))?;

        match url.scheme() {
            "ws" | "wss" => Ok(url),
            other => Err(ControlError::Config(format!(
                "Unsupported control URL scheme '{}' (expected ws or wss)",
                other
            ))),
        }
    }

    /// Check every setting, not only the endpoint
    pub fn validate(&self) -> Result<()> {
        self.endpoint()?;
        if self.queue_capacity == 0 {
            return Err(ControlError::Config(
                "queue capacity must be at least 1".to_string(),
            ));
        }
        if self.inbound_capacity == 0 {
            return Err(ControlError::Config(
                "inbound capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| ControlError::Config(format!("Invalid {} '{}': {}", key, value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ControlConfig::default();
        assert!(config.url.is_none());
        assert_eq!(config.queue_capacity, DEFAULT_QUEUE_CAPACITY);
        assert_eq!(config.inbound_capacity, DEFAULT_INBOUND_CAPACITY);
        assert!(config.connect_timeout().is_none());
    }

    #[test]
    fn test_missing_url_is_config_error() {
        let err = ControlConfig::default().endpoint().unwrap_err();
        assert!(matches!(err, ControlError::Config(_)));
    }

    #[test]
    fn test_endpoint_scheme_checked() {
        assert!(ControlConfig::with_url("ws://127.0.0.1:8787").endpoint().is_ok());
        assert!(ControlConfig::with_url("wss://control.example").endpoint().is_ok());

        let err = ControlConfig::with_url("http://127.0.0.1:8787").endpoint().unwrap_err();
        assert!(err.to_string().contains("http"));
        assert!(ControlConfig::with_url("not a url").endpoint().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut config = ControlConfig::with_url("ws://localhost:1");
        assert!(config.validate().is_ok());
        config.queue_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_url_wins() {
        let config = ControlConfig::from_lookup(lookup(&[
            ("AGENT_CONTROL_URL", "ws://control:9000"),
            ("AGENT_CONTROL_HOST", "ignored"),
        ]))
        .unwrap();
        assert_eq!(config.url.as_deref(), Some("ws://control:9000"));
    }

    #[test]
    fn test_env_host_port_fallback() {
        let config = ControlConfig::from_lookup(lookup(&[("AGENT_CONTROL_PORT", "9100")])).unwrap();
        assert_eq!(config.url.as_deref(), Some("ws://127.0.0.1:9100"));

        let config = ControlConfig::from_lookup(lookup(&[("AGENT_CONTROL_HOST", "10.0.0.5")])).unwrap();
        assert_eq!(config.url.as_deref(), Some("ws://10.0.0.5:8787"));
    }

    #[test]
    fn test_env_empty_leaves_url_unset() {
        let config = ControlConfig::from_lookup(lookup(&[("AGENT_CONTROL_URL", "  ")])).unwrap();
        assert!(config.url.is_none());
    }

    #[test]
    fn test_env_numeric_overrides() {
        let config = ControlConfig::from_lookup(lookup(&[
            ("AGENT_CONTROL_QUEUE_CAPACITY", "16"),
            ("AGENT_CONTROL_CONNECT_TIMEOUT_MS", "2500"),
        ]))
        .unwrap();
        assert_eq!(config.queue_capacity, 16);
        assert_eq!(config.connect_timeout(), Some(Duration::from_millis(2500)));

        let err = ControlConfig::from_lookup(lookup(&[("AGENT_CONTROL_PORT", "eighty")])).unwrap_err();
        assert!(matches!(err, ControlError::Config(_)));
    }

    #[test]
    fn test_deserialize_partial() {
        let config: ControlConfig =
            serde_json::from_str(r#"{"url":"ws://w:1","connectTimeoutMs":50}"#).unwrap();
        assert_eq!(config.url.as_deref(), Some("ws://w:1"));
        assert_eq!(config.queue_capacity, DEFAULT_QUEUE_CAPACITY);
        assert_eq!(config.connect_timeout_ms, Some(50));
    }
}
