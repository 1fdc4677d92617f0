//! # Configuration Management
//!
//! Wire constants shared by both peers, plus runtime configuration for the
//! server, the client and logging.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()` / `from_toml()`
//! - Direct instantiation with defaults
//! - Environment-specific overrides via `from_env()`
//!
//! ## Wire Constants
//! The `*_BYTES` constants, [`MAX_CLIENTS`] and [`PROTOCOL_VERSION`] are part of
//! the wire format. Both peers must be built with identical values; they are
//! not configurable at runtime.

use crate::error::{constants, ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Current wire protocol version, written ahead of every packet tag
pub const PROTOCOL_VERSION: u8 = 1;

/// Size of an encrypted connect token, including its MAC
pub const CONNECT_TOKEN_BYTES: usize = 1024;

/// Size of an encrypted challenge token, including its MAC
pub const CHALLENGE_TOKEN_BYTES: usize = 256;

/// Size of the nonce paired with every encrypted token
pub const NONCE_BYTES: usize = 12;

/// Size of the authentication tag appended to sealed tokens
pub const MAC_BYTES: usize = 16;

/// Size of a symmetric token key
pub const KEY_BYTES: usize = 32;

/// Application data sealed inside every connect token
pub const USER_DATA_BYTES: usize = 256;

/// Hard ceiling on concurrent session slots; sets the bit width of `client_index`
pub const MAX_CLIENTS: usize = 64;

/// Largest datagram the codec will produce or accept
pub const MAX_PACKET_BYTES: usize = 1200;

/// Largest opaque payload carried by a Connection packet
pub const MAX_PAYLOAD_BYTES: usize = 1100;

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct HandshakeConfig {
    /// Server-specific configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Client-specific configuration
    #[serde(default)]
    pub client: ClientConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl HandshakeConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables on top of the defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("HANDSHAKE_SERVER_ADDRESS") {
            config.server.address = addr.clone();
            config.client.server_address = addr;
        }

        if let Ok(max_clients) = std::env::var("HANDSHAKE_MAX_CLIENTS") {
            if let Ok(val) = max_clients.parse::<usize>() {
                config.server.max_clients = val;
            }
        }

        if let Ok(timeout) = std::env::var("HANDSHAKE_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.server.handshake_timeout = Duration::from_millis(val);
                config.client.handshake_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(timeout) = std::env::var("HANDSHAKE_KEEPALIVE_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.server.keepalive_timeout = Duration::from_millis(val);
                config.client.keepalive_timeout = Duration::from_millis(val);
            }
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.server.validate());
        errors.extend(self.client.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        strict(self.validate())
    }
}

fn strict(errors: Vec<String>) -> Result<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ProtocolError::ConfigError(format!(
            "Configuration validation failed:\n  - {}",
            errors.join("\n  - ")
        )))
    }
}

fn validate_rate(errors: &mut Vec<String>, name: &str, hz: f64) {
    if !hz.is_finite() || hz <= 0.0 {
        errors.push(format!("{name} must be a positive number of Hz"));
    } else if hz > 1000.0 {
        errors.push(format!("{name} too high: {hz} Hz (maximum: 1000 Hz)"));
    }
}

/// Server-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Server listen address (e.g., "127.0.0.1:40000")
    pub address: String,

    /// Number of session slots; at most [`MAX_CLIENTS`]
    pub max_clients: usize,

    /// How long a pending connection may wait for its challenge response
    #[serde(with = "duration_serde")]
    pub handshake_timeout: Duration,

    /// Keepalive packets per second sent to each idle connected client
    pub keepalive_send_rate: f64,

    /// Silence after which a connected client is dropped
    #[serde(with = "duration_serde")]
    pub keepalive_timeout: Duration,

    /// Number of connect-token nonces remembered for replay detection
    pub replay_cache_capacity: usize,

    /// Accept InsecureConnect packets. Only honoured in builds with the
    /// `insecure-connect` feature; never enable in production.
    #[serde(default)]
    pub insecure_connect_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:40000"),
            max_clients: MAX_CLIENTS,
            handshake_timeout: Duration::from_secs(5),
            keepalive_send_rate: 1.0,
            keepalive_timeout: Duration::from_secs(5),
            replay_cache_capacity: 4096,
            insecure_connect_enabled: false,
        }
    }
}

impl ServerConfig {
    /// Validate server configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Server address cannot be empty".to_string());
        } else if self.address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid server address format: '{}' (expected format: '0.0.0.0:40000')",
                self.address
            ));
        }

        if self.max_clients == 0 || self.max_clients > MAX_CLIENTS {
            errors.push(format!(
                "{}: got {} (MAX_CLIENTS = {MAX_CLIENTS})",
                constants::ERR_MAX_CLIENTS,
                self.max_clients
            ));
        }

        if self.handshake_timeout.as_millis() < 100 {
            errors.push("Handshake timeout too short (minimum: 100ms)".to_string());
        } else if self.handshake_timeout.as_secs() > 60 {
            errors.push("Handshake timeout too long (maximum: 60s)".to_string());
        }

        validate_rate(&mut errors, "Keepalive send rate", self.keepalive_send_rate);

        if self.keepalive_timeout.as_millis() < 100 {
            errors.push("Keepalive timeout too short (minimum: 100ms)".to_string());
        } else if self.keepalive_send_rate > 0.0
            && self.keepalive_timeout.as_secs_f64() <= 1.0 / self.keepalive_send_rate
        {
            errors.push(
                "Keepalive timeout must be longer than the keepalive send interval".to_string(),
            );
        }

        if self.replay_cache_capacity < self.max_clients {
            errors.push(format!(
                "Replay cache capacity {} is smaller than max_clients {}",
                self.replay_cache_capacity, self.max_clients
            ));
        }

        if self.insecure_connect_enabled && !cfg!(feature = "insecure-connect") {
            errors.push(constants::ERR_INSECURE_UNAVAILABLE.to_string());
        }

        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        strict(self.validate())
    }

    /// Seconds between keepalives to an idle client
    pub fn keepalive_interval(&self) -> f64 {
        1.0 / self.keepalive_send_rate
    }
}

/// Client-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Target server address
    pub server_address: String,

    /// Resends per second of ConnectionRequest / ChallengeResponse
    pub connection_request_send_rate: f64,

    /// How long each handshake stage may wait for the server
    #[serde(with = "duration_serde")]
    pub handshake_timeout: Duration,

    /// Keepalive packets per second while connected and idle
    pub keepalive_send_rate: f64,

    /// Silence from the server after which the client disconnects
    #[serde(with = "duration_serde")]
    pub keepalive_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_address: String::from("127.0.0.1:40000"),
            connection_request_send_rate: 10.0,
            handshake_timeout: Duration::from_secs(5),
            keepalive_send_rate: 1.0,
            keepalive_timeout: Duration::from_secs(5),
        }
    }
}

impl ClientConfig {
    /// Validate client configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.server_address.is_empty() {
            errors.push("Client server address cannot be empty".to_string());
        } else if self.server_address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid client server address format: '{}' (expected format: '10.0.0.1:40000')",
                self.server_address
            ));
        }

        validate_rate(
            &mut errors,
            "Connection request send rate",
            self.connection_request_send_rate,
        );
        validate_rate(&mut errors, "Keepalive send rate", self.keepalive_send_rate);

        if self.handshake_timeout.as_millis() < 100 {
            errors.push("Handshake timeout too short (minimum: 100ms)".to_string());
        }

        if self.keepalive_timeout.as_millis() < 100 {
            errors.push("Keepalive timeout too short (minimum: 100ms)".to_string());
        }

        errors
    }

    /// Seconds between handshake packet resends
    pub fn resend_interval(&self) -> f64 {
        1.0 / self.connection_request_send_rate
    }

    /// Seconds between keepalives to the server when idle
    pub fn keepalive_interval(&self) -> f64 {
        1.0 / self.keepalive_send_rate
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("handshake-protocol"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = std::path::Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization (milliseconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
