//! # Configuration Management
//!
//! Centralized configuration for RPC clients and servers.
//!
//! Everything here is plain data and round-trips through TOML. Runtime objects
//! such as authentication mechanism providers are not part of the file format;
//! they are handed to [`crate::protocol::connection::ConnectionOptions`] or
//! [`crate::service::server::ServerOptions`] and stay scoped to that
//! connection or server.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()` / `from_toml()`
//! - Environment variables (`DCERPC_*`) via `from_env()`
//! - Direct instantiation with defaults and `default_with_overrides()`
//!
//! ## Security Considerations
//! - Unauthenticated fallback is off unless explicitly enabled
//! - Fragment sizes below the protocol minimum of 1432 bytes are rejected
//! - Reassembly is capped per call to bound memory use

use crate::core::fragment::DEFAULT_MAX_CALL_SIZE;
use crate::core::pdu::{DEFAULT_MAX_FRAG, MUST_RECV_FRAG_SIZE};
use crate::core::syntax::{IntegerOrder, TransferSyntax};
use crate::error::{ProtocolError, Result};
use crate::security::AuthLevel;
use crate::transport::StringBinding;
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Upper bound for the per-call reassembly limit.
pub const MAX_CALL_SIZE_CEILING: usize = 256 * 1024 * 1024;

/// Top-level configuration
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct RpcConfig {
    #[serde(default)]
    pub client: ClientConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub security: SecurityConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl RpcConfig {
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

    /// Defaults overridden by `DCERPC_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(binding) = std::env::var("DCERPC_CLIENT_BINDING") {
            config.client.binding = binding;
        }

        if let Ok(binding) = std::env::var("DCERPC_SERVER_BINDING") {
            config.server.binding = binding;
        }

        if let Ok(timeout) = std::env::var("DCERPC_CALL_TIMEOUT_MS") {
            let val = timeout.parse::<u64>().map_err(|_| {
                ProtocolError::ConfigError(format!("DCERPC_CALL_TIMEOUT_MS is not a number: {timeout}"))
            })?;
            config.client.call_timeout = Duration::from_millis(val);
        }

        if let Ok(frag) = std::env::var("DCERPC_MAX_FRAG") {
            let val = frag.parse::<u16>().map_err(|_| {
                ProtocolError::ConfigError(format!("DCERPC_MAX_FRAG is not a fragment size: {frag}"))
            })?;
            config.client.max_xmit_frag = val;
            config.client.max_recv_frag = val;
            config.server.max_xmit_frag = val;
            config.server.max_recv_frag = val;
        }

        if let Ok(level) = std::env::var("DCERPC_AUTH_LEVEL") {
            config.security.level = toml::Value::String(level.to_lowercase())
                .try_into()
                .map_err(|_| ProtocolError::ConfigError(format!("Unknown auth level: {level}")))?;
        }

        if let Ok(target) = std::env::var("DCERPC_TARGET_NAME") {
            config.security.target_name = target;
        }

        if let Ok(mechanisms) = std::env::var("DCERPC_MECHANISMS") {
            config.security.mechanisms = mechanisms
                .split(',')
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(String::from)
                .collect();
        }

        if let Ok(level) = std::env::var("DCERPC_LOG_LEVEL") {
            config.logging.log_level = level
                .parse::<Level>()
                .map_err(|_| ProtocolError::ConfigError(format!("Invalid log level: {level}")))?;
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
        errors.extend(self.client.validate());
        errors.extend(self.server.validate());
        errors.extend(self.security.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

fn validate_binding(errors: &mut Vec<String>, side: &str, binding: &str) {
    if binding.is_empty() {
        errors.push(format!("{side} binding cannot be empty"));
    } else if let Err(e) = binding.parse::<StringBinding>() {
        errors.push(format!(
            "Invalid {side} binding '{binding}': {e} (expected e.g. 'ncacn_ip_tcp:127.0.0.1[135]')"
        ));
    }
}

fn validate_frag(errors: &mut Vec<String>, name: &str, value: u16) {
    if value < MUST_RECV_FRAG_SIZE {
        errors.push(format!(
            "{name} too small: {value} (minimum: {MUST_RECV_FRAG_SIZE})"
        ));
    }
}

fn validate_syntaxes(errors: &mut Vec<String>, side: &str, syntaxes: &[TransferSyntax]) {
    if syntaxes.is_empty() {
        errors.push(format!("{side} must offer at least one transfer syntax"));
    }
    for (i, s) in syntaxes.iter().enumerate() {
        if syntaxes[..i].contains(s) {
            errors.push(format!("{side} lists transfer syntax {s:?} more than once"));
        }
    }
}

fn validate_call_size(errors: &mut Vec<String>, side: &str, size: usize) {
    if size == 0 {
        errors.push(format!("{side} max call size must be greater than 0"));
    } else if size > MAX_CALL_SIZE_CEILING {
        errors.push(format!(
            "{side} max call size too large: {size} bytes (maximum: {MAX_CALL_SIZE_CEILING})"
        ));
    }
}

/// Client-side configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Default server binding (e.g. "ncacn_ip_tcp:127.0.0.1[135]")
    pub binding: String,

    /// Transfer syntaxes offered per presentation context, most preferred first
    pub transfer_syntaxes: Vec<TransferSyntax>,

    /// Integer order of outgoing PDUs
    pub integer_order: IntegerOrder,

    pub max_xmit_frag: u16,

    pub max_recv_frag: u16,

    /// Association group to join; 0 asks the server for a new one
    pub assoc_group_id: u32,

    /// Default deadline for a call
    #[serde(with = "duration_serde")]
    pub call_timeout: Duration,

    /// Deadline for dialing the transport and completing the bind
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,

    /// Largest reassembled response accepted
    pub max_call_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            binding: String::from("ncacn_ip_tcp:127.0.0.1[135]"),
            transfer_syntaxes: vec![TransferSyntax::Ndr20],
            integer_order: IntegerOrder::Little,
            max_xmit_frag: DEFAULT_MAX_FRAG,
            max_recv_frag: DEFAULT_MAX_FRAG,
            assoc_group_id: 0,
            call_timeout: timeout::DEFAULT_CALL_TIMEOUT,
            connect_timeout: timeout::DEFAULT_TIMEOUT,
            max_call_size: DEFAULT_MAX_CALL_SIZE,
        }
    }
}

impl ClientConfig {
    /// Validate client configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        validate_binding(&mut errors, "Client", &self.binding);
        validate_syntaxes(&mut errors, "Client", &self.transfer_syntaxes);
        validate_frag(&mut errors, "Client max_xmit_frag", self.max_xmit_frag);
        validate_frag(&mut errors, "Client max_recv_frag", self.max_recv_frag);
        validate_call_size(&mut errors, "Client", self.max_call_size);

        if self.call_timeout.as_millis() < 10 {
            errors.push("Call timeout too short (minimum: 10ms)".to_string());
        }

        if self.connect_timeout.as_millis() < 100 {
            errors.push("Connect timeout too short (minimum: 100ms)".to_string());
        } else if self.connect_timeout.as_secs() > 300 {
            errors.push("Connect timeout too long (maximum: 300s)".to_string());
        }

        errors
    }
}

/// Server-side configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen binding (e.g. "ncacn_ip_tcp:0.0.0.0[4135]" or "ncalrpc:[/tmp/rpc.sock]")
    pub binding: String,

    /// Transfer syntaxes the server accepts
    pub transfer_syntaxes: Vec<TransferSyntax>,

    pub max_xmit_frag: u16,

    pub max_recv_frag: u16,

    /// Calls executing at once on one connection
    pub max_concurrent_calls: usize,

    /// Maximum number of concurrent connections
    pub max_connections: usize,

    /// Largest reassembled request accepted
    pub max_call_size: usize,

    /// Connections that bind below this level are refused service
    pub min_auth_level: AuthLevel,

    /// Timeout for graceful server shutdown
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            binding: String::from("ncacn_ip_tcp:127.0.0.1[4135]"),
            transfer_syntaxes: vec![TransferSyntax::Ndr20, TransferSyntax::Ndr64],
            max_xmit_frag: DEFAULT_MAX_FRAG,
            max_recv_frag: DEFAULT_MAX_FRAG,
            max_concurrent_calls: 64,
            max_connections: 1000,
            max_call_size: DEFAULT_MAX_CALL_SIZE,
            min_auth_level: AuthLevel::None,
            shutdown_timeout: timeout::SHUTDOWN_TIMEOUT,
        }
    }
}

impl ServerConfig {
    /// Validate server configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        validate_binding(&mut errors, "Server", &self.binding);
        validate_syntaxes(&mut errors, "Server", &self.transfer_syntaxes);
        validate_frag(&mut errors, "Server max_xmit_frag", self.max_xmit_frag);
        validate_frag(&mut errors, "Server max_recv_frag", self.max_recv_frag);
        validate_call_size(&mut errors, "Server", self.max_call_size);

        if self.max_concurrent_calls == 0 {
            errors.push("Max concurrent calls must be greater than 0".to_string());
        }

        if self.max_connections == 0 {
            errors.push("Max connections must be greater than 0".to_string());
        } else if self.max_connections > 100_000 {
            errors.push(format!(
                "Max connections very high: {} (ensure system resources can support this)",
                self.max_connections
            ));
        }

        if self.shutdown_timeout.as_secs() < 1 {
            errors.push("Shutdown timeout too short (minimum: 1s)".to_string());
        } else if self.shutdown_timeout.as_secs() > 60 {
            errors.push("Shutdown timeout too long (maximum: 60s)".to_string());
        }

        errors
    }
}

/// Authentication settings shared by client and server
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Requested protection level
    pub level: AuthLevel,

    /// Mechanism names in preference order
    pub mechanisms: Vec<String>,

    /// Service principal the client authenticates to
    pub target_name: String,

    /// Proceed without a security context if none can be negotiated
    pub allow_unauthenticated_fallback: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            level: AuthLevel::None,
            mechanisms: vec![String::from("ecdh")],
            target_name: String::new(),
            allow_unauthenticated_fallback: false,
        }
    }
}

impl SecurityConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.level != AuthLevel::None && self.mechanisms.is_empty() {
            errors.push(format!(
                "Auth level {:?} requires at least one mechanism",
                self.level
            ));
        }

        for (i, m) in self.mechanisms.iter().enumerate() {
            if m.is_empty() {
                errors.push("Mechanism names cannot be empty".to_string());
            } else if self.mechanisms[..i].contains(m) {
                errors.push(format!("Mechanism '{m}' listed more than once"));
            }
        }

        if self.allow_unauthenticated_fallback && self.level >= AuthLevel::Integrity {
            errors.push(
                "WARNING: Unauthenticated fallback defeats the requested protection level"
                    .to_string(),
            );
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
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
            app_name: String::from("dcerpc-engine"),
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

/// Durations travel as milliseconds
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

/// Levels travel as lowercase names
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

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(RpcConfig::default().validate().is_empty());
    }

    #[test]
    fn test_example_config_roundtrips() {
        let text = RpcConfig::example_config();
        let parsed = RpcConfig::from_toml(&text).unwrap();
        assert_eq!(parsed.client.max_xmit_frag, DEFAULT_MAX_FRAG);
        assert_eq!(parsed.server.transfer_syntaxes.len(), 2);
    }
}
