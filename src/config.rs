//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.
//!
//! Every section is optional; missing sections and fields take their
//! defaults. Boards and mappings are arrays of tables:
//!
//! ```toml
//! [serial]
//! baud_rate = 115200
//!
//! [[boards]]
//! name = "rig1"
//! address = "/dev/ttyACM0"
//!
//! [[mappings]]
//! id = 1
//! input = "btn_cross"
//! board = "rig1"
//! mode = "output"
//! pin = "13"
//! ```

use serde::de::Error;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::warn;

use crate::error::{BridgeError, Result};
use crate::mapping::{Mapping, MappingTable};

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub serial: SerialConfig,

    #[serde(default)]
    pub controller: ControllerConfig,

    #[serde(default)]
    pub router: RouterConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub firmware: FirmwareConfig,

    #[serde(default)]
    pub boards: Vec<BoardConfig>,

    #[serde(default)]
    pub mappings: Vec<Mapping>,
}

/// Serial link configuration shared by all boards
#[derive(Debug, Deserialize, Clone)]
pub struct SerialConfig {
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Wait after opening a port; most boards reset on open
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,

    /// 0 = do not wait for acknowledgements
    #[serde(default)]
    pub ack_timeout_ms: u64,

    #[serde(default = "default_connect_on_start")]
    pub connect_on_start: bool,
}

/// One board in the board store
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BoardConfig {
    pub name: String,

    /// Serial device path, e.g. `/dev/ttyACM0` or `COM3`
    pub address: String,

    /// Overrides `serial.baud_rate`
    #[serde(default)]
    pub baud_rate: Option<u32>,
}

/// Controller configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ControllerConfig {
    /// Empty = auto-detect
    #[serde(default)]
    pub device_path: String,

    /// Case-insensitive substring matched against device names during
    /// auto-detection
    #[serde(default = "default_name_filter")]
    pub name_filter: String,
}

/// Stepper hold policy names as written in the config file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepperHoldMode {
    EveryEvent,
    #[default]
    Edge,
    Repeat,
}

/// Event router configuration
#[derive(Debug, Deserialize, Clone)]
pub struct RouterConfig {
    #[serde(default)]
    pub stepper_hold: StepperHoldMode,

    /// Only used by the `repeat` hold policy
    #[serde(default = "default_repeat_interval_ms")]
    pub repeat_interval_ms: u64,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Directory for daily log files; empty = console only
    #[serde(default)]
    pub dir: String,
}

/// Firmware upload configuration
#[derive(Debug, Deserialize, Clone)]
pub struct FirmwareConfig {
    #[serde(default = "default_cli_path")]
    pub cli_path: String,

    /// Fully qualified board name passed to arduino-cli
    #[serde(default = "default_fqbn")]
    pub fqbn: String,

    #[serde(default = "default_upload_timeout_s")]
    pub timeout_s: u64,
}

// Default value functions
fn default_baud_rate() -> u32 { 115200 }
fn default_settle_ms() -> u64 { 2000 }
fn default_connect_on_start() -> bool { true }

fn default_name_filter() -> String { "controller".to_string() }

fn default_repeat_interval_ms() -> u64 { 200 }

fn default_log_level() -> String { "info".to_string() }

fn default_cli_path() -> String { "arduino-cli".to_string() }
fn default_fqbn() -> String { "arduino:avr:uno".to_string() }
fn default_upload_timeout_s() -> u64 { 120 }

const VALID_BAUD_RATES: [u32; 6] = [9600, 19200, 38400, 57600, 115200, 230400];
const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: default_baud_rate(),
            settle_ms: default_settle_ms(),
            ack_timeout_ms: 0,
            connect_on_start: default_connect_on_start(),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            device_path: String::new(),
            name_filter: default_name_filter(),
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            stepper_hold: StepperHoldMode::default(),
            repeat_interval_ms: default_repeat_interval_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: String::new(),
        }
    }
}

impl Default for FirmwareConfig {
    fn default() -> Self {
        Self {
            cli_path: default_cli_path(),
            fqbn: default_fqbn(),
            timeout_s: default_upload_timeout_s(),
        }
    }
}

fn invalid(message: impl std::fmt::Display) -> BridgeError {
    BridgeError::Config(toml::de::Error::custom(message))
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    ///
    /// * `Result<Config>` - Loaded and validated configuration
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails, including any invalid `[[mappings]]` entry
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use bluelink_bridge::config::Config;
    ///
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse and validate configuration from TOML text
    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Mappings as a validated table
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Mapping` if two mappings share an id.
    pub fn mapping_table(&self) -> Result<MappingTable> {
        Ok(MappingTable::new(self.mappings.clone())?)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range or
    /// board names, board addresses or mapping ids are not unique
    pub fn validate(&self) -> Result<()> {
        // Validate serial configuration
        if !VALID_BAUD_RATES.contains(&self.serial.baud_rate) {
            return Err(invalid(
                "baud_rate must be one of: 9600, 19200, 38400, 57600, 115200, 230400",
            ));
        }

        if self.serial.settle_ms > 10000 {
            return Err(invalid("settle_ms must be between 0 and 10000"));
        }

        if self.serial.ack_timeout_ms > 10000 {
            return Err(invalid("ack_timeout_ms must be between 0 and 10000"));
        }

        // Validate router configuration
        if self.router.repeat_interval_ms < 10 || self.router.repeat_interval_ms > 10000 {
            return Err(invalid("repeat_interval_ms must be between 10 and 10000"));
        }

        // Validate logging configuration
        if !VALID_LOG_LEVELS.contains(&self.logging.level.to_ascii_lowercase().as_str()) {
            return Err(invalid(
                "logging level must be one of: trace, debug, info, warn, error",
            ));
        }

        // Validate firmware configuration
        if self.firmware.cli_path.is_empty() {
            return Err(invalid("firmware cli_path cannot be empty"));
        }

        if self.firmware.fqbn.is_empty() {
            return Err(invalid("firmware fqbn cannot be empty"));
        }

        if self.firmware.timeout_s == 0 || self.firmware.timeout_s > 600 {
            return Err(invalid("firmware timeout_s must be between 1 and 600"));
        }

        // Validate boards
        let mut names = HashSet::new();
        let mut addresses = HashSet::new();
        for board in &self.boards {
            if board.name.is_empty() {
                return Err(invalid("board name cannot be empty"));
            }
            if board.address.is_empty() {
                return Err(invalid(format!("board {} has an empty address", board.name)));
            }
            if let Some(baud) = board.baud_rate {
                if !VALID_BAUD_RATES.contains(&baud) {
                    return Err(invalid(format!(
                        "board {} baud_rate {} is not supported",
                        board.name, baud
                    )));
                }
            }
            if !names.insert(board.name.as_str()) {
                return Err(invalid(format!("duplicate board name {}", board.name)));
            }
            if !addresses.insert(board.address.as_str()) {
                return Err(invalid(format!(
                    "board {} reuses address {}",
                    board.name, board.address
                )));
            }
        }

        // Validate mappings
        let mut ids = HashSet::new();
        for mapping in &self.mappings {
            if !ids.insert(mapping.id()) {
                return Err(invalid(format!("duplicate mapping id {}", mapping.id())));
            }
            // Boards can be added at runtime, so this is not fatal
            if !names.contains(mapping.board()) {
                warn!(
                    "Mapping {} targets board {} which is not configured",
                    mapping.id(),
                    mapping.board()
                );
            }
        }

        Ok(())
    }
}
