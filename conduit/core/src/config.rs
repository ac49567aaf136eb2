//! TOML Configuration File Support
//!
//! Centralized configuration loading for the conduit server, supporting a
//! TOML configuration file at `~/.config/conduit/conduit.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments (when applicable)
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # XDG Base Directory Compliance
//!
//! The configuration file follows XDG Base Directory specification:
//! - `$XDG_CONFIG_HOME/conduit/conduit.toml` (typically `~/.config/conduit/conduit.toml`)
//!
//! # Example Configuration
//!
//! ```toml
//! [server]
//! hostname = "0.0.0.0"
//! port = 8777
//! shared_key = "a-shared-key-of-at-least-8-chars"
//!
//! [limits]
//! max_payload_size = 16777216
//! ```

use std::path::PathBuf;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Minimum accepted shared key length. Shorter keys are replaced with a
/// generated one at server construction.
pub const MIN_SHARED_KEY_LEN: usize = 8;

/// Default cap on a single frame's declared payload size: 16 MiB.
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Server section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerToml {
    /// Interface the listener binds to
    pub hostname: Option<String>,

    /// Port to bind (0 asks the OS for an ephemeral port)
    pub port: Option<u16>,

    /// Shared key clients must present in the `key` query parameter
    pub shared_key: Option<String>,
}

/// Limits section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsToml {
    /// Maximum declared frame payload size in bytes
    pub max_payload_size: Option<usize>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConduitToml {
    /// Server configuration section
    pub server: ServerToml,

    /// Limits configuration section
    pub limits: LimitsToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Centralized configuration for the conduit server
///
/// This struct consolidates all configuration from multiple sources and tracks
/// where each value came from. Use [`load_config`] to load configuration with
/// proper priority handling.
#[derive(Clone, Debug)]
pub struct ConduitConfig {
    /// Interface the listener binds to
    pub hostname: String,

    /// Port to bind; 0 asks the OS for an ephemeral port that
    /// the server reads back after binding
    pub port: u16,

    /// Shared key clients must present; `None` or a key shorter than
    /// [`MIN_SHARED_KEY_LEN`] means the server generates one
    pub shared_key: Option<String>,

    /// Maximum declared frame payload size in bytes
    pub max_payload_size: usize,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    source: ConfigSource,
}

impl Default for ConduitConfig {
    fn default() -> Self {
        Self {
            hostname: "0.0.0.0".to_string(),
            port: 0,
            shared_key: None,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl ConduitConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }
}

/// Generate a fresh shared key: 16 random bytes, hex encoded.
#[must_use]
pub fn generate_shared_key() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/conduit/conduit.toml` or
/// `~/.config/conduit/conduit.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("conduit").join("conduit.toml"))
}

/// Load configuration from all sources with proper priority
///
/// Priority order (highest first):
/// 1. CLI arguments (not handled here - caller should apply after)
/// 2. Environment variables
/// 3. TOML configuration file
/// 4. Default values
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed.
/// A missing config file is not an error (defaults are used).
pub fn load_config() -> Result<ConduitConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Arguments
///
/// * `path` - Optional path to the configuration file. If `None`, only defaults
///   and environment variables are used.
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<ConduitConfig, ConfigError> {
    // Start with defaults
    let mut config = ConduitConfig::default();

    // Try to load from file
    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: ConduitToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    // Apply environment variables (overrides file values)
    apply_env_config(&mut config);

    Ok(config)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut ConduitConfig, toml: &ConduitToml) {
    // Server settings
    if let Some(ref hostname) = toml.server.hostname {
        config.hostname = hostname.clone();
    }
    if let Some(port) = toml.server.port {
        config.port = port;
    }
    if toml.server.shared_key.is_some() {
        config.shared_key = toml.server.shared_key.clone();
    }

    // Limits settings
    if let Some(size) = toml.limits.max_payload_size {
        config.max_payload_size = size;
    }
}

/// Apply environment variable overrides to the config
fn apply_env_config(config: &mut ConduitConfig) {
    if let Ok(hostname) = std::env::var("CONDUIT_HOSTNAME") {
        config.hostname = hostname;
        config.source = ConfigSource::Env;
    }
    if let Ok(port) = std::env::var("CONDUIT_PORT") {
        if let Ok(p) = port.parse::<u16>() {
            config.port = p;
            config.source = ConfigSource::Env;
        }
    }
    if let Ok(key) = std::env::var("CONDUIT_SHARED_KEY") {
        config.shared_key = Some(key);
        config.source = ConfigSource::Env;
    }
    if let Ok(size) = std::env::var("CONDUIT_MAX_PAYLOAD_SIZE") {
        if let Ok(s) = size.parse::<usize>() {
            config.max_payload_size = s;
            config.source = ConfigSource::Env;
        }
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Hostname override
    pub hostname: Option<String>,

    /// Port override
    pub port: Option<u16>,

    /// Shared key override
    pub shared_key: Option<String>,

    /// Max payload size override
    pub max_payload_size: Option<usize>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set hostname override
    #[must_use]
    pub fn with_hostname(mut self, hostname: String) -> Self {
        self.hostname = Some(hostname);
        self
    }

    /// Set port override
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set shared key override
    #[must_use]
    pub fn with_shared_key(mut self, key: String) -> Self {
        self.shared_key = Some(key);
        self
    }

    /// Set max payload size override
    #[must_use]
    pub fn with_max_payload_size(mut self, size: usize) -> Self {
        self.max_payload_size = Some(size);
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut ConduitConfig) {
        if self.hostname.is_some()
            || self.port.is_some()
            || self.shared_key.is_some()
            || self.max_payload_size.is_some()
        {
            config.source = ConfigSource::Cli;
        }

        if let Some(ref hostname) = self.hostname {
            config.hostname = hostname.clone();
        }

        if let Some(port) = self.port {
            config.port = port;
        }

        if let Some(ref key) = self.shared_key {
            config.shared_key = Some(key.clone());
        }

        if let Some(size) = self.max_payload_size {
            config.max_payload_size = size;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
