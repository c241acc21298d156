//! Configuration for the echo server.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use mtnet_dispatch::SupervisorConfig;
use mtnet_transport::TcpNetworkConfig;

/// Default listen address.
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:12345";

/// Echo server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to accept connections on.
    pub bind_addr: SocketAddr,

    /// Maximum simultaneous connections; further connects are refused.
    pub max_connections: usize,

    /// Upper bound on one network poll.
    pub poll_timeout: Duration,

    /// Log level used when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let bind_addr = lookup("MTNET_BIND_ADDR")
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string())
            .parse()
            .context("MTNET_BIND_ADDR must be a socket address")?;

        let max_connections = match lookup("MTNET_MAX_CONNECTIONS") {
            Some(v) => v
                .parse()
                .context("MTNET_MAX_CONNECTIONS must be a positive integer")?,
            None => mtnet_transport::tcp::DEFAULT_MAX_CONNECTIONS,
        };
        anyhow::ensure!(max_connections > 0, "MTNET_MAX_CONNECTIONS must be at least 1");

        let poll_timeout = match lookup("MTNET_POLL_TIMEOUT_MS") {
            Some(v) => Duration::from_millis(
                v.parse()
                    .context("MTNET_POLL_TIMEOUT_MS must be a number of milliseconds")?,
            ),
            None => mtnet_dispatch::supervisor::DEFAULT_POLL_TIMEOUT,
        };

        let log_level = lookup("MTNET_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            bind_addr,
            max_connections,
            poll_timeout,
            log_level,
        })
    }

    pub fn network_config(&self) -> TcpNetworkConfig {
        TcpNetworkConfig {
            max_connections: self.max_connections,
            ..TcpNetworkConfig::listen(self.bind_addr)
        }
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            poll_timeout: self.poll_timeout,
            thread_name: "echo".to_string(),
            ..SupervisorConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.bind_addr, DEFAULT_BIND_ADDR.parse().unwrap());
        assert_eq!(config.max_connections, 32);
        assert_eq!(config.poll_timeout, Duration::from_millis(10));
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("MTNET_BIND_ADDR", "0.0.0.0:9000"),
            ("MTNET_MAX_CONNECTIONS", "4"),
            ("MTNET_POLL_TIMEOUT_MS", "25"),
            ("MTNET_LOG_LEVEL", "debug"),
        ])
        .unwrap();

        assert_eq!(config.bind_addr.port(), 9000);
        assert_eq!(config.network_config().max_connections, 4);
        assert_eq!(config.network_config().bind_addr, Some(config.bind_addr));
        assert_eq!(config.supervisor_config().poll_timeout, Duration::from_millis(25));
        assert_eq!(config.log_level, "debug");
    }

    #[rstest]
    #[case::bad_addr("MTNET_BIND_ADDR", "localhost")]
    #[case::bad_limit("MTNET_MAX_CONNECTIONS", "many")]
    #[case::zero_limit("MTNET_MAX_CONNECTIONS", "0")]
    #[case::bad_timeout("MTNET_POLL_TIMEOUT_MS", "-1")]
    fn test_invalid_values(#[case] key: &str, #[case] value: &str) {
        let err = load(&[(key, value)]).unwrap_err();
        assert!(err.to_string().contains(key));
    }
}
