//! Link configuration with optional TOML overrides
//!
//! Every field has a working default. A TOML file only needs the keys it
//! changes; durations are written in milliseconds:
//!
//! ```toml
//! address = "AA:BB:CC:DD:EE:01"
//! reconnect_delay_ms = 2000
//! transport_chunk_override = 182
//! ```

use idm_protocol::DEVICE_NAME_PREFIX;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading a configuration file
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Configuration for the connection manager
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Peripheral to bind at startup; discovery is used when unset
    pub address: Option<String>,
    /// Advertised name prefix matched during discovery
    pub name_prefix: String,
    /// How long a discovery scan runs
    pub scan_duration: Duration,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Upper bound for a single packet write or read-back
    pub write_timeout: Duration,
    /// Fixed delay between reconnect attempts
    pub reconnect_delay: Duration,
    /// Reconnect automatically after an unsolicited drop
    pub auto_reconnect: bool,
    /// Fall back to discovery when no address is bound
    pub discovery_fallback: bool,
    /// Replace the negotiated write size (still clamped to it)
    pub transport_chunk_override: Option<usize>,
    /// Pause after a display command before the next one is issued
    pub command_settle: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            address: None,
            name_prefix: DEVICE_NAME_PREFIX.into(),
            scan_duration: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(5),
            auto_reconnect: true,
            discovery_fallback: true,
            transport_chunk_override: None,
            command_settle: Duration::from_millis(500),
        }
    }
}

/// On-disk representation; absent keys keep their defaults
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct LinkConfigFile {
    address: Option<String>,
    name_prefix: Option<String>,
    scan_duration_ms: Option<u64>,
    connect_timeout_ms: Option<u64>,
    write_timeout_ms: Option<u64>,
    reconnect_delay_ms: Option<u64>,
    auto_reconnect: Option<bool>,
    discovery_fallback: Option<bool>,
    transport_chunk_override: Option<usize>,
    command_settle_ms: Option<u64>,
}

impl LinkConfig {
    /// Load a TOML file on top of the defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse TOML text on top of the defaults
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let file: LinkConfigFile = toml::from_str(content)?;
        Ok(Self::default().merge(file))
    }

    fn merge(mut self, file: LinkConfigFile) -> Self {
        let ms = Duration::from_millis;

        if file.address.is_some() {
            self.address = file.address;
        }
        if let Some(prefix) = file.name_prefix {
            self.name_prefix = prefix;
        }
        if let Some(v) = file.scan_duration_ms {
            self.scan_duration = ms(v);
        }
        if let Some(v) = file.connect_timeout_ms {
            self.connect_timeout = ms(v);
        }
        if let Some(v) = file.write_timeout_ms {
            self.write_timeout = ms(v);
        }
        if let Some(v) = file.reconnect_delay_ms {
            self.reconnect_delay = ms(v);
        }
        if let Some(v) = file.auto_reconnect {
            self.auto_reconnect = v;
        }
        if let Some(v) = file.discovery_fallback {
            self.discovery_fallback = v;
        }
        if file.transport_chunk_override.is_some() {
            self.transport_chunk_override = file.transport_chunk_override;
        }
        if let Some(v) = file.command_settle_ms {
            self.command_settle = ms(v);
        }

        self
    }
}
