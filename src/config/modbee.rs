use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use config::{Config as ConfigBuilder, ConfigError, Environment, File, FileFormat};

use super::{LimitsConfig, LoggingConfig, NodeConfig, SerialConfig, TimingConfig};

/// Main application configuration
#[derive(Default, Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Node identity and failsafe policy
    pub node: NodeConfig,

    /// Serial bus settings
    pub serial: SerialConfig,

    /// Protocol timing
    pub timing: TimingConfig,

    /// Ring and queue capacities
    pub limits: LimitsConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Default configuration directory
    pub const CONFIG_DIR: &'static str = "config";

    /// Environment variable prefix
    const ENV_PREFIX: &'static str = "MODBEE";

    /// Build configuration using the following priority (highest to lowest):
    /// 1. Environment variables (MODBEE_*)
    /// 2. Local configuration file (config/local.yaml)
    /// 3. Environment specific file (config/{env}.yaml)
    /// 4. Default configuration (config/default.yaml)
    /// 5. Built-in defaults
    pub fn new() -> Result<Self, ConfigError> {
        let environment = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        // Start with built-in defaults
        let defaults = Config::default();

        let mut builder = ConfigBuilder::builder();

        fn ms(duration: std::time::Duration) -> String {
            format!("{}ms", duration.as_millis())
        }

        // Set defaults for each field manually
        builder = builder
            // Node configuration
            .set_default("node.node_id", u64::from(defaults.node.node_id))?
            .set_default("node.failsafe", defaults.node.failsafe)?
            // Serial configuration
            .set_default("serial.device", defaults.serial.device)?
            .set_default("serial.baud_rate", defaults.serial.baud_rate)?
            .set_default("serial.data_bits", defaults.serial.data_bits.to_string())?
            .set_default("serial.parity", defaults.serial.parity.to_string())?
            .set_default("serial.stop_bits", defaults.serial.stop_bits.to_string())?
            // Timing configuration
            .set_default(
                "timing.interframe_gap",
                format!("{}us", defaults.timing.interframe_gap.as_micros()),
            )?
            .set_default(
                "timing.operation_timeout",
                ms(defaults.timing.operation_timeout),
            )?
            .set_default(
                "timing.response_timeout",
                ms(defaults.timing.response_timeout),
            )?
            .set_default("timing.retry_delay", ms(defaults.timing.retry_delay))?
            .set_default("timing.max_retries", u64::from(defaults.timing.max_retries))?
            .set_default(
                "timing.initial_listen_period",
                ms(defaults.timing.initial_listen_period),
            )?
            .set_default(
                "timing.token_response_timeout",
                ms(defaults.timing.token_response_timeout),
            )?
            .set_default("timing.base_timeout", ms(defaults.timing.base_timeout))?
            .set_default("timing.node_timeout", ms(defaults.timing.node_timeout))?
            .set_default(
                "timing.token_reclaim_timeout",
                ms(defaults.timing.token_reclaim_timeout),
            )?
            .set_default(
                "timing.join_cycle_interval",
                ms(defaults.timing.join_cycle_interval),
            )?
            .set_default(
                "timing.join_response_timeout",
                ms(defaults.timing.join_response_timeout),
            )?
            // Limits configuration
            .set_default("limits.max_nodes", u64::from(defaults.limits.max_nodes))?
            .set_default("limits.max_pending_ops", defaults.limits.max_pending_ops as u64)?
            // Logging configuration
            .set_default("logging.log_to_file", defaults.logging.log_to_file)?
            .set_default("logging.log_dir", defaults.logging.log_dir)?
            .set_default("logging.trace_frames", defaults.logging.trace_frames)?
            .set_default("logging.level", defaults.logging.level)?
            .set_default("logging.format", defaults.logging.format)?
            .set_default(
                "logging.include_location",
                defaults.logging.include_location,
            )?;

        let config = builder
            // Load default config file
            .add_source(
                File::new(&format!("{}/default", Self::CONFIG_DIR), FileFormat::Yaml)
                    .required(false),
            )
            // Load environment specific config
            .add_source(
                File::new(
                    &format!("{}/{}", Self::CONFIG_DIR, environment),
                    FileFormat::Yaml,
                )
                .required(false),
            )
            // Load local overrides
            .add_source(
                File::new(&format!("{}/local", Self::CONFIG_DIR), FileFormat::Yaml).required(false),
            )
            // Add environment variables
            .add_source(
                Environment::with_prefix(Self::ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        // Deserialize and validate
        let config = config.try_deserialize()?;
        Self::validate(&config)?;

        Ok(config)
    }

    /// Load configuration from a specific file
    pub fn from_file(path: PathBuf) -> Result<Self, ConfigError> {
        let config = ConfigBuilder::builder()
            // Load the specified config file
            .add_source(File::from(path))
            // Add env vars as overrides
            .add_source(
                Environment::with_prefix(Self::ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config = config.try_deserialize()?;
        Self::validate(&config)?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(config: &Self) -> Result<(), ConfigError> {
        // Helper to convert validation errors
        fn validation_error(msg: &str) -> ConfigError {
            ConfigError::Message(msg.to_string())
        }

        // Validate node configuration
        if config.node.node_id == 0 || config.node.node_id == 255 {
            return Err(validation_error("Node ID 0 and 255 are reserved"));
        }
        if config.node.node_id > config.limits.max_nodes {
            return Err(validation_error("Node ID cannot exceed max_nodes"));
        }

        // Validate limits
        if config.limits.max_nodes == 0 {
            return Err(validation_error("max_nodes must be non-zero"));
        }
        if config.limits.max_nodes > 250 {
            return Err(validation_error("max_nodes cannot exceed 250"));
        }
        if config.limits.max_pending_ops == 0 {
            return Err(validation_error("max_pending_ops must be non-zero"));
        }

        // Validate serial configuration
        if config.serial.device.is_empty() {
            return Err(validation_error("Serial device must not be empty"));
        }
        if config.serial.baud_rate == 0 {
            return Err(validation_error("Serial baud rate must be non-zero"));
        }

        // Validate timing configuration
        if config.timing.interframe_gap.is_zero() {
            return Err(validation_error("Interframe gap must be non-zero"));
        }
        if config.timing.operation_timeout.is_zero() {
            return Err(validation_error("Operation timeout must be non-zero"));
        }
        if config.timing.initial_listen_period.is_zero() {
            return Err(validation_error("Initial listen period must be non-zero"));
        }
        if config.timing.join_cycle_interval.is_zero() {
            return Err(validation_error("Join cycle interval must be non-zero"));
        }

        // Validate log level
        match config.logging.level.to_lowercase().as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => return Err(validation_error("Invalid log level")),
        }

        // Validate log format
        match config.logging.format.to_lowercase().as_str() {
            "pretty" | "json" => {}
            _ => return Err(validation_error("Invalid log format")),
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs, time::Duration};
    use tempfile::tempdir;

    use crate::config::types::{DataBits, Parity, StopBits};

    #[test]
    #[serial_test::serial]
    fn test_default_config() {
        let config = Config::new().unwrap();
        assert_eq!(config.node.node_id, 1);
        assert!(!config.node.failsafe);
        assert_eq!(config.limits.max_nodes, 10);
    }

    #[test]
    #[serial_test::serial]
    fn test_env_override() {
        std::env::set_var("MODBEE_NODE__NODE_ID", "7");
        let config = Config::new().unwrap();
        assert_eq!(config.node.node_id, 7);
        std::env::remove_var("MODBEE_NODE__NODE_ID");
    }

    #[test]
    #[serial_test::serial]
    fn test_file_config() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.yaml");

        fs::write(
            &config_path,
            r#"
            node:
              node_id: 4
              failsafe: true
            serial:
              device: "/dev/ttyAMA0"
              baud_rate: 9600
              data_bits: 8
              parity: "none"
              stop_bits: "one"
            timing:
              interframe_gap: "5ms"
              operation_timeout: "100ms"
              response_timeout: "100ms"
              retry_delay: "100ms"
              max_retries: 3
              initial_listen_period: "2s"
              token_response_timeout: "50ms"
              base_timeout: "100ms"
              node_timeout: "50ms"
              token_reclaim_timeout: "30ms"
              join_cycle_interval: "50ms"
              join_response_timeout: "20ms"
            limits:
              max_nodes: 16
              max_pending_ops: 100
            logging:
              log_to_file: false
              log_dir: "logs"
              trace_frames: true
              level: "debug"
              format: "pretty"
              include_location: false
            "#,
        )
        .unwrap();

        let config = Config::from_file(config_path).unwrap();
        assert_eq!(config.node.node_id, 4);
        assert!(config.node.failsafe);
        assert_eq!(config.serial.device, "/dev/ttyAMA0");
        assert_eq!(config.serial.baud_rate, 9600);
        assert_eq!(config.serial.data_bits, DataBits::new(8).unwrap());
        assert_eq!(config.serial.parity, Parity::None);
        assert_eq!(config.serial.stop_bits, StopBits::One);
        assert_eq!(config.timing.interframe_gap, Duration::from_millis(5));
        assert_eq!(config.timing.max_retries, 3);
        assert_eq!(config.timing.initial_listen_period, Duration::from_secs(2));
        assert_eq!(config.limits.max_nodes, 16);
        assert_eq!(config.limits.max_pending_ops, 100);
        assert!(config.logging.trace_frames);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    #[serial_test::serial]
    fn test_validation() {
        std::env::set_var("MODBEE_NODE__NODE_ID", "0");
        assert!(Config::new().is_err());
        std::env::remove_var("MODBEE_NODE__NODE_ID");
    }
}
