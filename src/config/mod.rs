//! Configuration module for adaptio
//!
//! This module handles the configuration file that pre-describes IO
//! namespaces, plus the typed parameter helpers engines use.
//!
//! # Files
//!
//! A configuration is a TOML document:
//!
//! ```toml
//! debug_mode = true
//!
//! [logging]
//! filter = "info,adaptio=debug"
//!
//! [[io]]
//! name = "SimulationOutput"
//! engine = "dataman"
//!
//! [io.parameters]
//! workflow_mode = "subscribe"
//!
//! [[io.transport]]
//! type = "tcp"
//! parameters = { address = "tcp://127.0.0.1:12306" }
//! ```
//!
//! # Example
//!
//! ```ignore
//! use adaptio::config::ContextConfig;
//! use adaptio::{Context, SelfComm};
//!
//! let config = ContextConfig::load("adaptio.toml")?;
//! let mut ctx = Context::from_config(&config, SelfComm::handle())?;
//! let io = ctx.declare_io("SimulationOutput")?;
//! ```

pub mod params;

use crate::error::{AdaptioError, Result};
use crate::types::Params;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Configuration file version written by [`ContextConfig::save`]
pub const CONFIG_VERSION: u32 = 1;

/// Default log filter when `RUST_LOG` is not set
pub const DEFAULT_LOG_FILTER: &str = "info,adaptio=debug";

// ==================== Context Config ====================

/// Top-level configuration document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Version for future migration support
    #[serde(default = "default_version")]
    pub version: u32,

    /// Raise integrity errors (duplicate names, bad dimensions) immediately
    #[serde(default = "default_true")]
    pub debug_mode: bool,

    /// Logging setup used by [`crate::logging::init_logging`]
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Pre-described IO namespaces
    #[serde(default)]
    pub io: Vec<IoConfig>,
}

fn default_version() -> u32 {
    CONFIG_VERSION
}

fn default_true() -> bool {
    true
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            debug_mode: true,
            logging: LoggingConfig::default(),
            io: Vec::new(),
        }
    }
}

impl ContextConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: ContextConfig = toml::from_str(content)
            .map_err(|e| AdaptioError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file from disk
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            AdaptioError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Save the configuration as TOML
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                AdaptioError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| AdaptioError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content).map_err(|e| {
            AdaptioError::Config(format!("Failed to write config file {:?}: {}", path, e))
        })
    }

    /// IO block named `name`
    pub fn io_config(&self, name: &str) -> Option<&IoConfig> {
        self.io.iter().find(|io| io.name == name)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for io in &self.io {
            if io.name.trim().is_empty() {
                return Err(AdaptioError::Config("IO block without a name".to_string()));
            }
            if !seen.insert(io.name.as_str()) {
                return Err(AdaptioError::Config(format!(
                    "IO '{}' is configured more than once",
                    io.name
                )));
            }
        }
        Ok(())
    }
}

// ==================== IO Config ====================

/// One `[[io]]` block
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct IoConfig {
    pub name: String,

    /// Engine type (as registered in the engine-type table)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,

    /// Engine parameters
    #[serde(default)]
    pub parameters: Params,

    /// Transports, in handle order
    #[serde(default, rename = "transport")]
    pub transports: Vec<TransportConfig>,
}

/// One `[[io.transport]]` block
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub parameters: Params,
}

// ==================== Logging Config ====================

/// Logging setup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directives, overridden by `RUST_LOG`
    #[serde(default = "default_filter")]
    pub filter: String,

    /// Directory for a daily rolling log file (stderr only when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,

    /// File name prefix of the rolling log file
    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,

    /// Emit ANSI colors on stderr
    #[serde(default = "default_true")]
    pub ansi: bool,
}

fn default_filter() -> String {
    DEFAULT_LOG_FILTER.to_string()
}

fn default_file_prefix() -> String {
    "adaptio.log".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            directory: None,
            file_prefix: default_file_prefix(),
            ansi: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
debug_mode = false

[[io]]
name = "SimulationOutput"
engine = "dataman"

[io.parameters]
workflow_mode = "synchronous"
transport_channels = "2"

[[io.transport]]
type = "tcp"
parameters = { address = "tcp://127.0.0.1:12306" }

[[io]]
name = "Checkpoint"
"#;

    #[test]
    fn test_parse_sample() {
        let config = ContextConfig::from_toml_str(SAMPLE).unwrap();
        assert!(!config.debug_mode);
        assert_eq!(config.version, CONFIG_VERSION);
        assert_eq!(config.io.len(), 2);

        let sim = config.io_config("SimulationOutput").unwrap();
        assert_eq!(sim.engine.as_deref(), Some("dataman"));
        assert_eq!(sim.parameters["workflow_mode"], "synchronous");
        assert_eq!(sim.transports[0].kind, "tcp");
        assert_eq!(
            sim.transports[0].parameters["address"],
            "tcp://127.0.0.1:12306"
        );

        let checkpoint = config.io_config("Checkpoint").unwrap();
        assert!(checkpoint.engine.is_none());
        assert!(checkpoint.transports.is_empty());
        assert_eq!(config.logging, LoggingConfig::default());
    }

    #[test]
    fn test_duplicate_io_rejected() {
        let doc = "[[io]]\nname = \"a\"\n[[io]]\nname = \"a\"\n";
        assert!(matches!(
            ContextConfig::from_toml_str(doc),
            Err(AdaptioError::Config(_))
        ));
    }

    #[test]
    fn test_malformed_toml() {
        assert!(ContextConfig::from_toml_str("debug_mode = = true").is_err());
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("adaptio.toml");
        let config = ContextConfig::from_toml_str(SAMPLE).unwrap();
        config.save(&path).unwrap();
        let loaded = ContextConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
