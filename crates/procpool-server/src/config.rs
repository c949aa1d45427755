//! Server configuration.
//!
//! The pool itself is configured through [`PoolConfig::from_env`]; this module
//! only covers the HTTP surface.
//!
//! [`PoolConfig::from_env`]: procpool_manager::PoolConfig::from_env

use std::time::Duration;

use serde::Deserialize;

/// Configuration for the HTTP service.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listen address (e.g., "0.0.0.0:8080").
    #[serde(default = "ServerConfig::default_listen_addr")]
    pub listen_addr: String,

    /// Maximum request body size in bytes.
    #[serde(default = "ServerConfig::default_max_body")]
    pub max_body_bytes: usize,

    /// Request timeout in seconds. Should exceed the pool's checkout plus
    /// operation timeout so pool errors are reported instead of cut off.
    #[serde(default = "ServerConfig::default_request_timeout")]
    pub request_timeout_seconds: u64,
}

impl ServerConfig {
    fn default_listen_addr() -> String {
        "0.0.0.0:8080".to_string()
    }

    const fn default_max_body() -> usize {
        1024 * 1024 // 1 MB
    }

    const fn default_request_timeout() -> u64 {
        60
    }

    /// Load configuration from `LISTEN_ADDR`, `MAX_BODY_BYTES` and
    /// `REQUEST_TIMEOUT_SECONDS`, keeping defaults for missing or invalid
    /// values.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(addr) = std::env::var("LISTEN_ADDR") {
            config.listen_addr = addr;
        }
        if let Some(bytes) = env_parse("MAX_BODY_BYTES") {
            config.max_body_bytes = bytes;
        }
        if let Some(seconds) = env_parse("REQUEST_TIMEOUT_SECONDS") {
            config.request_timeout_seconds = seconds;
        }
        config
    }

    /// Get the request timeout as a `Duration`.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: Self::default_listen_addr(),
            max_body_bytes: Self::default_max_body(),
            request_timeout_seconds: Self::default_request_timeout(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.listen_addr, "0.0.0.0:8080");
        assert_eq!(config.max_body_bytes, 1024 * 1024);
        assert_eq!(config.request_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn deserialize_fills_defaults() {
        let config: ServerConfig =
            serde_json::from_str(r#"{"listen_addr": "127.0.0.1:9000"}"#).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9000");
        assert_eq!(config.request_timeout_seconds, 60);
    }
}
