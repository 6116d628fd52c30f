//! Configuration management for the historian

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Environment variable pointing at the config file
pub const CONFIG_ENV: &str = "PLC_HISTORIAN_CONFIG";

/// Locations probed when no path is given explicitly
const DEFAULT_CONFIG_PATHS: &[&str] = &["configs/tags.yaml", "../configs/tags.yaml", "config.yaml"];

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Controllers by name
    pub controllers: BTreeMap<String, ControllerConfig>,
    /// Tags by name
    pub tags: BTreeMap<String, TagConfig>,
    /// Time-series storage
    pub database: DatabaseConfig,
    /// Poll cadence
    pub polling: PollingConfig,
    /// HTTP query API
    #[serde(default)]
    pub server: ServerConfig,
    /// Prometheus exporter
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Host name or IP address
    pub host: String,
    /// TCP port (driver default when omitted)
    #[serde(default)]
    pub port: Option<u16>,
    /// Backplane slot / path
    #[serde(default)]
    pub slot: Option<u8>,
    /// Client driver used to talk to the controller
    #[serde(default)]
    pub driver: DriverConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DriverConfig {
    /// In-process value generator, no network traffic
    Simulated {
        #[serde(default)]
        fail_connect: bool,
    },
    /// Modbus TCP
    Modbus {
        #[serde(default = "default_unit_id")]
        unit_id: u8,
    },
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig::Simulated {
            fail_connect: false,
        }
    }
}

fn default_unit_id() -> u8 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagConfig {
    /// Owning controller name
    pub controller: String,
    /// Declared data type
    #[serde(rename = "type")]
    pub data_type: DataType,
    /// Multiplier applied during normalization
    #[serde(default = "default_scale_factor")]
    pub scale_factor: f64,
    /// Unit of measurement (metadata only)
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Register address (Modbus controllers only)
    #[serde(default)]
    pub address: Option<u16>,
    /// Register table (Modbus controllers only)
    #[serde(default)]
    pub register: RegisterType,
}

fn default_scale_factor() -> f64 {
    1.0
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RegisterType {
    #[default]
    Holding,
    Input,
    Coil,
    Discrete,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Float32,
    Float64,
    Int16,
    Int32,
    #[serde(alias = "int")]
    Int64,
    Uint16,
    Uint32,
    Bool,
}

impl DataType {
    /// Number of 16-bit registers the type occupies on a Modbus device
    pub fn register_count(self) -> u16 {
        match self {
            DataType::Int16 | DataType::Uint16 | DataType::Bool => 1,
            DataType::Float32 | DataType::Int32 | DataType::Uint32 => 2,
            DataType::Float64 | DataType::Int64 => 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database file
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Tick period in milliseconds
    pub interval_ms: u64,
    /// Upper bound for one controller's batch read
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "127.0.0.1".to_string(),
            port: 3000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "0.0.0.0".to_string(),
            port: 9100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when RUST_LOG is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Parse a YAML document and validate it
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: Config =
            serde_yaml::from_str(content).with_context(|| "Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks; any failure here is a fatal configuration error
    pub fn validate(&self) -> Result<()> {
        if self.controllers.is_empty() {
            bail!("no controllers configured");
        }
        if self.tags.is_empty() {
            bail!("no tags configured");
        }
        if self.polling.interval_ms == 0 {
            bail!("polling.interval_ms must be greater than zero");
        }

        for name in self.controllers.keys() {
            if name.is_empty() || name.contains('/') {
                bail!("invalid controller name '{}'", name);
            }
        }

        for (name, tag) in &self.tags {
            if name.is_empty() || name.contains('/') {
                bail!("invalid tag name '{}'", name);
            }
            let Some(controller) = self.controllers.get(&tag.controller) else {
                bail!(
                    "tag {} references unknown controller {}",
                    name,
                    tag.controller
                );
            };
            if !tag.scale_factor.is_finite() || tag.scale_factor == 0.0 {
                bail!("tag {} has invalid scale_factor {}", name, tag.scale_factor);
            }
            if matches!(controller.driver, DriverConfig::Modbus { .. }) && tag.address.is_none() {
                bail!(
                    "tag {} on Modbus controller {} has no address",
                    name,
                    tag.controller
                );
            }
            if matches!(tag.register, RegisterType::Coil | RegisterType::Discrete)
                && tag.data_type != DataType::Bool
            {
                bail!("tag {} reads a bit table but is declared {:?}", name, tag.data_type);
            }
        }

        Ok(())
    }
}

/// Pick the config file: explicit path, then env var, then well-known locations
pub fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        return Ok(PathBuf::from(path));
    }
    DEFAULT_CONFIG_PATHS
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
        .with_context(|| {
            format!(
                "Config file not found; pass --config or set {}",
                CONFIG_ENV
            )
        })
}

/// Load and validate configuration from a YAML file
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    Config::from_yaml_str(&content)
        .with_context(|| format!("Invalid configuration in {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
controllers:
  plantA:
    host: 192.168.1.10
    slot: 0
  plantB:
    host: 192.168.1.11
    port: 502
    driver:
      kind: modbus
      unit_id: 3
tags:
  temp:
    controller: plantA
    type: float32
    scale_factor: 2.0
    unit: "°C"
  running:
    controller: plantA
    type: bool
  counter:
    controller: plantB
    type: int
    address: 100
    register: input
database:
  path: data/plc_data.db
polling:
  interval_ms: 1000
"#;

    #[test]
    fn test_parse_sample_config() {
        let config = Config::from_yaml_str(SAMPLE).unwrap();

        assert_eq!(config.controllers.len(), 2);
        assert_eq!(config.tags["temp"].scale_factor, 2.0);
        assert_eq!(config.tags["running"].scale_factor, 1.0);
        assert_eq!(config.tags["counter"].data_type, DataType::Int64);
        assert_eq!(config.tags["counter"].register, RegisterType::Input);
        assert_eq!(
            config.controllers["plantB"].driver,
            DriverConfig::Modbus { unit_id: 3 }
        );
        assert_eq!(
            config.controllers["plantA"].driver,
            DriverConfig::Simulated {
                fail_connect: false
            }
        );
        assert!(!config.server.enabled);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_unknown_controller_is_rejected() {
        let yaml = SAMPLE.replace("controller: plantB", "controller: plantC");
        let err = Config::from_yaml_str(&yaml).unwrap_err();
        assert!(err.to_string().contains("unknown controller plantC"));
    }

    #[test]
    fn test_zero_scale_factor_is_rejected() {
        let yaml = SAMPLE.replace("scale_factor: 2.0", "scale_factor: 0.0");
        assert!(Config::from_yaml_str(&yaml).is_err());
    }

    #[test]
    fn test_modbus_tag_requires_address() {
        let yaml = SAMPLE.replace("    address: 100\n", "");
        let err = Config::from_yaml_str(&yaml).unwrap_err();
        assert!(err.to_string().contains("has no address"));
    }

    #[test]
    fn test_coil_requires_bool() {
        let yaml = SAMPLE.replace("register: input", "register: coil");
        let err = Config::from_yaml_str(&yaml).unwrap_err();
        assert!(err.to_string().contains("bit table"));
    }

    #[test]
    fn test_slash_in_tag_name_is_rejected() {
        let yaml = SAMPLE.replace("  running:", "  line/running:");
        assert!(Config::from_yaml_str(&yaml).is_err());
    }

    #[test]
    fn test_zero_interval_is_rejected() {
        let yaml = SAMPLE.replace("interval_ms: 1000", "interval_ms: 0");
        assert!(Config::from_yaml_str(&yaml).is_err());
    }

    #[test]
    fn test_register_counts() {
        assert_eq!(DataType::Bool.register_count(), 1);
        assert_eq!(DataType::Float32.register_count(), 2);
        assert_eq!(DataType::Int64.register_count(), 4);
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tags.yaml");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.tags.len(), 3);
        assert_eq!(resolve_config_path(Some(&path)).unwrap(), path);
    }
}
