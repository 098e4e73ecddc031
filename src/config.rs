//! Client and server configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::connection::{ConnectionOptions, DEFAULT_COMMAND_TIMEOUT};
use crate::types::DEFAULT_MAX_HEADER_SIZE;

/// Default event socket port on the switch.
pub const DEFAULT_PORT: u16 = 8021;
/// Default event socket password.
pub const DEFAULT_PASSWORD: &str = "ClueCon";

/// Configuration for an inbound client connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub password: String,
    /// Applied to the TCP connect and, separately, to the authentication handshake.
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub command_timeout: Duration,
    pub max_header_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            password: DEFAULT_PASSWORD.to_string(),
            connect_timeout: Duration::from_secs(5),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            max_header_size: DEFAULT_MAX_HEADER_SIZE,
        }
    }
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16, password: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            password: password.into(),
            ..Self::default()
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_max_header_size(mut self, size: usize) -> Self {
        self.max_header_size = size;
        self
    }

    /// `host:port` string for dialing.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            command_timeout: self.command_timeout,
            max_header_size: self.max_header_size,
        }
    }
}

/// Configuration for the outbound socket server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Name used in log lines.
    pub name: String,
    pub bind_addr: String,
    #[serde(with = "duration_ms")]
    pub command_timeout: Duration,
    pub max_header_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "esl-server".to_string(),
            bind_addr: "0.0.0.0:8084".to_string(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            max_header_size: DEFAULT_MAX_HEADER_SIZE,
        }
    }
}

impl ServerConfig {
    pub fn new(name: impl Into<String>, bind_addr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bind_addr: bind_addr.into(),
            ..Self::default()
        }
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_max_header_size(mut self, size: usize) -> Self {
        self.max_header_size = size;
        self
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            command_timeout: self.command_timeout,
            max_header_size: self.max_header_size,
        }
    }
}

/// Durations as integer milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.port, 8021);
        assert_eq!(config.password, "ClueCon");
        assert_eq!(config.addr(), "127.0.0.1:8021");
        assert_eq!(config.connection_options().max_header_size, 8192);
    }

    #[test]
    fn test_client_config_from_partial_json() {
        let config: ClientConfig = serde_json::from_str(
            r#"{"host": "pbx.local", "password": "s3cret", "command_timeout": 250}"#,
        )
        .unwrap();

        assert_eq!(config.addr(), "pbx.local:8021");
        assert_eq!(config.command_timeout, Duration::from_millis(250));
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_server_config_serializes_millis() {
        let config = ServerConfig::new("ivr", "127.0.0.1:9000")
            .with_command_timeout(Duration::from_millis(1500));
        let json = serde_json::to_value(&config).unwrap();

        assert_eq!(json["command_timeout"], 1500);
        assert_eq!(json["bind_addr"], "127.0.0.1:9000");
    }
}
