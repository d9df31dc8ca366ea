use std::{env, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use thiserror::Error;

use crate::transport::TransportMode;

#[derive(Debug, Clone)]
pub struct Config {
    pub api_token: Option<String>,
    pub bind_addr: String,
    pub bind_port: u16,
    pub response_mode: TransportMode,
    pub nested_call_timeout: Duration,
    pub session_idle_timeout: Duration,
    pub max_inflight_per_session: usize,
    pub notification_delay: Duration,
    pub search_limit: usize,
    pub docs_dir: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("BIND_PORT must be a valid u16")]
    InvalidPort,
    #[error("MCP_RESPONSE_MODE must be one of: stream, json")]
    InvalidResponseMode,
    #[error("{0} must be a positive integer")]
    InvalidNumber(&'static str),
    #[error("invalid bind address or port")]
    InvalidSocket,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Parses configuration from any key lookup; unset or blank keys take their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let value = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let api_token = value("MCP_API_TOKEN");
        let bind_addr = value("BIND_ADDR").unwrap_or_else(|| "127.0.0.1".to_string());
        let bind_port = value("BIND_PORT")
            .map(|port| port.parse::<u16>().map_err(|_| ConfigError::InvalidPort))
            .transpose()?
            .unwrap_or(3000);
        let response_mode = value("MCP_RESPONSE_MODE")
            .map(|mode| {
                TransportMode::from_str(&mode).map_err(|_| ConfigError::InvalidResponseMode)
            })
            .transpose()?
            .unwrap_or(TransportMode::Streaming);

        let positive = |key: &'static str, default: u64| -> Result<u64, ConfigError> {
            match value(key) {
                Some(raw) => raw
                    .parse::<u64>()
                    .ok()
                    .filter(|number| *number > 0)
                    .ok_or(ConfigError::InvalidNumber(key)),
                None => Ok(default),
            }
        };

        let config = Self {
            api_token,
            bind_addr,
            bind_port,
            response_mode,
            nested_call_timeout: Duration::from_secs(positive("MCP_NESTED_CALL_TIMEOUT_SECS", 60)?),
            session_idle_timeout: Duration::from_secs(positive("MCP_SESSION_IDLE_SECS", 1800)?),
            max_inflight_per_session: positive("MCP_MAX_INFLIGHT_PER_SESSION", 32)? as usize,
            notification_delay: Duration::from_millis(positive("MCP_NOTIFICATION_DELAY_MS", 1000)?),
            search_limit: positive("MCP_SEARCH_LIMIT", 3)? as usize,
            docs_dir: value("MCP_DOCS_DIR").map(PathBuf::from),
        };

        let _ = config.bind_socket()?;
        Ok(config)
    }

    pub fn bind_socket(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.bind_addr, self.bind_port)
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::InvalidSocket)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn parse(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect::<HashMap<_, _>>();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn parse_defaults() {
        let config = parse(&[]).expect("config should parse");
        assert_eq!(config.bind_addr, "127.0.0.1");
        assert_eq!(config.bind_port, 3000);
        assert_eq!(config.api_token, None);
        assert_eq!(config.response_mode, TransportMode::Streaming);
        assert_eq!(config.nested_call_timeout, Duration::from_secs(60));
        assert_eq!(config.session_idle_timeout, Duration::from_secs(1800));
        assert_eq!(config.max_inflight_per_session, 32);
        assert_eq!(config.search_limit, 3);
        assert_eq!(config.docs_dir, None);
    }

    #[test]
    fn parses_overrides() {
        let config = parse(&[
            ("MCP_API_TOKEN", " secret "),
            ("BIND_PORT", "8080"),
            ("MCP_RESPONSE_MODE", "json"),
            ("MCP_NOTIFICATION_DELAY_MS", "5"),
            ("MCP_DOCS_DIR", "/srv/docs"),
        ])
        .expect("config should parse");

        assert_eq!(config.api_token.as_deref(), Some("secret"));
        assert_eq!(config.bind_port, 8080);
        assert_eq!(config.response_mode, TransportMode::SingleExchange);
        assert_eq!(config.notification_delay, Duration::from_millis(5));
        assert_eq!(config.docs_dir, Some(PathBuf::from("/srv/docs")));
    }

    #[test]
    fn blank_token_is_treated_as_unset() {
        let config = parse(&[("MCP_API_TOKEN", "   ")]).expect("config should parse");
        assert_eq!(config.api_token, None);
    }

    #[test]
    fn invalid_values_fail() {
        assert!(matches!(
            parse(&[("BIND_PORT", "99999")]),
            Err(ConfigError::InvalidPort)
        ));
        assert!(matches!(
            parse(&[("MCP_RESPONSE_MODE", "carrier-pigeon")]),
            Err(ConfigError::InvalidResponseMode)
        ));
        assert!(matches!(
            parse(&[("MCP_SEARCH_LIMIT", "0")]),
            Err(ConfigError::InvalidNumber("MCP_SEARCH_LIMIT"))
        ));
        assert!(matches!(
            parse(&[("BIND_ADDR", "not an address")]),
            Err(ConfigError::InvalidSocket)
        ));
    }
}
