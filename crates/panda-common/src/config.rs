//! Configuration structures for the WiFi throughput bench.
//!
//! Supports TOML deserialization with defaults that reproduce the
//! stock regression run: 500 kbps on bus 0, a 128 x 1 burn-in burst
//! followed by a checked 16 x 100 burst.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// Default panda address on its own access point.
pub const DEFAULT_DEVICE_IP: &str = "192.168.0.10";
/// TCP port of the control channel.
pub const DEFAULT_CONTROL_PORT: u16 = 1337;
/// UDP port of the CAN streaming channel.
pub const DEFAULT_STREAMING_PORT: u16 = 1338;

/// Top-level bench configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    /// How long to wait for a batch to come back.
    #[serde(with = "humantime_serde")]
    pub recv_timeout: Duration,

    /// Device connection settings.
    pub device: DeviceConfig,

    /// Bus under test.
    pub bus: BusConfig,

    /// Accepted saturation band.
    pub saturation: SaturationBounds,

    /// Bursts executed in order.
    pub bursts: Vec<BurstConfig>,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            recv_timeout: Duration::from_secs(5),
            device: DeviceConfig::default(),
            bus: BusConfig::default(),
            saturation: SaturationBounds::default(),
            bursts: vec![
                BurstConfig {
                    msg_count: 1,
                    iterations: 0x80,
                    check_saturation: false,
                },
                BurstConfig {
                    msg_count: 100,
                    iterations: 0x10,
                    check_saturation: true,
                },
            ],
        }
    }
}

/// Device driver selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceDriver {
    /// Real panda reached over WiFi.
    #[default]
    Wifi,
    /// In-process simulated panda.
    Simulated,
}

/// Device connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Driver to use.
    pub driver: DeviceDriver,

    /// Device IP address.
    pub ip: String,

    /// TCP control port.
    pub control_port: u16,

    /// UDP streaming port.
    pub streaming_port: u16,

    /// TCP connect timeout.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Read/write timeout on the control channel.
    #[serde(with = "humantime_serde")]
    pub io_timeout: Duration,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            driver: DeviceDriver::Wifi,
            ip: String::from(DEFAULT_DEVICE_IP),
            control_port: DEFAULT_CONTROL_PORT,
            streaming_port: DEFAULT_STREAMING_PORT,
            connect_timeout: Duration::from_secs(5),
            io_timeout: Duration::from_secs(1),
        }
    }
}

/// Bus under test.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Bus number on the device.
    pub bus: u8,

    /// Nominal bus speed in kbps.
    pub speed_kbps: u32,

    /// Arbitration id of the first iteration; iteration `i` uses `base_msg_id + i`.
    pub base_msg_id: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            bus: 0,
            speed_kbps: 500,
            base_msg_id: 0x100,
        }
    }
}

/// One burst of the regression run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BurstConfig {
    /// Frames per batch.
    pub msg_count: usize,
    /// Number of batches.
    pub iterations: usize,
    /// Whether the saturation band is enforced. Unchecked bursts only print progress.
    #[serde(default)]
    pub check_saturation: bool,
}

/// Exclusive saturation band, in percent of nominal bus speed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SaturationBounds {
    /// Lower bound (exclusive).
    pub min_pct: f64,
    /// Upper bound (exclusive).
    pub max_pct: f64,
}

impl Default for SaturationBounds {
    fn default() -> Self {
        Self {
            min_pct: 60.0,
            max_pct: 100.0,
        }
    }
}

impl SaturationBounds {
    /// Check if a saturation percentage lies strictly inside the band.
    #[must_use]
    pub fn contains(&self, saturation_pct: f64) -> bool {
        saturation_pct > self.min_pct && saturation_pct < self.max_pct
    }
}

impl BenchConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config = Self::from_toml(&content)?;
        debug!(
            path = %path.display(),
            driver = ?config.device.driver,
            bursts = config.bursts.len(),
            "Loaded bench config"
        );
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Check invariants serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bus.speed_kbps == 0 {
            return Err(ConfigError::Invalid("bus.speed_kbps must be non-zero".into()));
        }
        if self.saturation.min_pct.partial_cmp(&self.saturation.max_pct)
            != Some(std::cmp::Ordering::Less)
        {
            return Err(ConfigError::Invalid(format!(
                "saturation.min_pct ({}) must be below saturation.max_pct ({})",
                self.saturation.min_pct, self.saturation.max_pct
            )));
        }
        if self.bursts.is_empty() {
            return Err(ConfigError::Invalid("at least one burst is required".into()));
        }
        for (idx, burst) in self.bursts.iter().enumerate() {
            if burst.msg_count == 0 {
                return Err(ConfigError::Invalid(format!(
                    "bursts[{idx}].msg_count must be non-zero"
                )));
            }
            let last_id = u64::from(self.bus.base_msg_id) + burst.iterations as u64;
            if burst.iterations > 0 && last_id - 1 > u64::from(MAX_EXTENDED_ID) {
                return Err(ConfigError::Invalid(format!(
                    "bursts[{idx}] runs arbitration ids past 0x{MAX_EXTENDED_ID:X}"
                )));
            }
        }
        if self.recv_timeout.is_zero() {
            return Err(ConfigError::Invalid("recv_timeout must be non-zero".into()));
        }
        Ok(())
    }
}

/// Highest 29-bit extended arbitration id.
const MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File I/O error.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing error.
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Semantically invalid configuration.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Serde helper module for `Duration` using humantime format.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
