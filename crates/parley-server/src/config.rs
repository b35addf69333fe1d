//! Server configuration.
//!
//! Settings are layered, later sources overriding earlier ones:
//!
//! 1. Built-in defaults
//! 2. An optional TOML file (`--config`)
//! 3. `PARLEY_*` environment variables (e.g. `PARLEY_JWT_SECRET`,
//!    `PARLEY_ALLOWED_ALGORITHMS=HS256,HS384`)
//! 4. Command line flags
//!
//! `jwt_secret` has no default; startup fails without it.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use ::config::{Config, Environment, File};
use parley_relay::RelayConfig;
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: &'static str, message: String },
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable multi-line output
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

impl LogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogFormat::Pretty => "pretty",
            LogFormat::Json => "json",
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Values given on the command line. `None` leaves the lower layers alone.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub config_file: Option<PathBuf>,
    pub listen_addr: Option<SocketAddr>,
    pub database_path: Option<String>,
    pub log_format: Option<LogFormat>,
}

/// Fully resolved server configuration.
#[derive(Clone, Deserialize)]
pub struct ServerConfig {
    /// Address the HTTP listener binds to
    pub listen_addr: SocketAddr,
    /// User database file (None for in-memory)
    #[serde(default)]
    pub database_path: Option<String>,
    /// HMAC secret used to verify credential tokens
    pub jwt_secret: String,
    /// Token signing algorithms accepted by the verifier
    pub allowed_algorithms: Vec<String>,
    /// Per-recipient send timeout in milliseconds
    pub send_timeout_ms: u64,
    /// Outbound frames queued per connection
    pub outbound_buffer: usize,
    /// Largest inbound chat message in bytes
    pub max_message_bytes: usize,
    pub log_format: LogFormat,
    /// How long shutdown waits for open connections to finish
    pub drain_timeout_secs: u64,
}

impl ServerConfig {
    /// Resolve configuration from every layer.
    pub fn load(overrides: &Overrides) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .set_default("listen_addr", "0.0.0.0:3000")?
            .set_default("allowed_algorithms", vec!["HS256"])?
            .set_default("send_timeout_ms", 5_000_i64)?
            .set_default("outbound_buffer", 64_i64)?
            .set_default("max_message_bytes", 64 * 1024_i64)?
            .set_default("log_format", LogFormat::default().as_str())?
            .set_default("drain_timeout_secs", 10_i64)?;

        if let Some(path) = &overrides.config_file {
            builder = builder.add_source(File::from(path.as_path()).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("PARLEY")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("allowed_algorithms"),
        );

        builder = builder
            .set_override_option("listen_addr", overrides.listen_addr.map(|a| a.to_string()))?
            .set_override_option("database_path", overrides.database_path.clone())?
            .set_override_option("log_format", overrides.log_format.map(|f| f.as_str()))?;

        let config: ServerConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.jwt_secret.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "jwt_secret",
                message: "must not be empty".to_string(),
            });
        }
        if self.allowed_algorithms.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "allowed_algorithms",
                message: "at least one algorithm is required".to_string(),
            });
        }
        if self.send_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "send_timeout_ms",
                message: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    /// Relay tunables derived from this configuration.
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            send_timeout: Duration::from_millis(self.send_timeout_ms),
            outbound_buffer: self.outbound_buffer,
            max_message_bytes: self.max_message_bytes,
        }
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    /// True when users live in a fresh in-memory table.
    ///
    /// Nothing creates accounts, so such a table stays empty and every
    /// token is refused as an unknown subject.
    pub fn in_memory_users(&self) -> bool {
        self.database_path.is_none()
    }

    /// Log the resolved configuration. The secret is never logged.
    pub fn log_config(&self) {
        info!("Listen address: {}", self.listen_addr);
        match &self.database_path {
            Some(path) => info!("User database: {}", path),
            None => info!("User database: in-memory"),
        }
        if self.in_memory_users() {
            warn!(
                "No database_path configured: the user table is empty and every \
                 connection will be refused until a user database is provided"
            );
        }
        info!("Accepted token algorithms: {}", self.allowed_algorithms.join(", "));
        info!(
            send_timeout_ms = self.send_timeout_ms,
            outbound_buffer = self.outbound_buffer,
            max_message_bytes = self.max_message_bytes,
            "Relay limits"
        );
    }

    /// Create a test configuration.
    #[cfg(test)]
    pub fn test_config() -> Self {
        Self {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            database_path: None,
            jwt_secret: "test-secret".to_string(),
            allowed_algorithms: vec!["HS256".to_string()],
            send_timeout_ms: 500,
            outbound_buffer: 16,
            max_message_bytes: 1024,
            log_format: LogFormat::Pretty,
            drain_timeout_secs: 1,
        }
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("listen_addr", &self.listen_addr)
            .field("database_path", &self.database_path)
            .field("jwt_secret", &"<redacted>")
            .field("allowed_algorithms", &self.allowed_algorithms)
            .field("send_timeout_ms", &self.send_timeout_ms)
            .field("outbound_buffer", &self.outbound_buffer)
            .field("max_message_bytes", &self.max_message_bytes)
            .field("log_format", &self.log_format)
            .field("drain_timeout_secs", &self.drain_timeout_secs)
            .finish()
    }
}
