//! Application configuration
//!
//! Every knob the acquisition core consumes lives here. The file is TOML and
//! every section falls back to its defaults, so a partial file is valid:
//!
//! ```toml
//! [storage]
//! max_history = 500
//!
//! [reconnect]
//! max_attempts = 10
//! delay_ms = 1000
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::acquisition::queue::{OverflowPolicy, QueueCapacity};
use crate::constants::*;
use crate::error::{Error, Result};
use crate::sim::{SimProtocol, SimTiming};

const CONFIG_FILE: &str = "pulse-link.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub serial: SerialConfig,
    pub acquisition: AcquisitionConfig,
    pub storage: StorageConfig,
    pub reconnect: ReconnectConfig,
    pub mock: MockConfig,
    pub simulator: SimulatorConfig,
}

/// Byte link settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Serial baud rate
    pub baud_rate: u32,
    /// Bounded read timeout used by the worker
    pub read_timeout_ms: u64,
    /// Maximum bytes pulled per read
    pub read_chunk: usize,
    /// How long to wait for a reply while negotiating the device profile
    pub negotiation_timeout_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            read_chunk: 4096,
            negotiation_timeout_ms: 500,
        }
    }
}

/// Acquisition worker settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Sleep while connected but not acquiring
    pub idle_poll_ms: u64,
    /// Sleep after a read that returned nothing
    pub empty_read_sleep_ms: u64,
    /// Backoff after a transient read error
    pub error_backoff_ms: u64,
    /// Bounded join timeout on stop
    pub join_timeout_ms: u64,
    /// Transient errors in a row before the link is considered lost
    pub max_consecutive_errors: u32,
    /// Silence while acquiring that counts as connection loss (0 disables)
    pub data_timeout_ms: u64,
    /// Multiplier applied to every decoded payload
    pub unit_scale: f64,
    /// Interval of the worker's rate log line
    pub stats_interval_secs: u64,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            idle_poll_ms: 10,
            empty_read_sleep_ms: 1,
            error_backoff_ms: 10,
            join_timeout_ms: 2000,
            max_consecutive_errors: 10,
            data_timeout_ms: 0,
            unit_scale: 1.0,
            stats_interval_secs: 10,
        }
    }
}

/// Queue, store and render settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Display window capacity
    pub max_history: usize,
    /// Drain interval of the consumer context
    pub drain_interval_ms: u64,
    /// Render window capacity
    pub render_capacity: usize,
    /// Ingestion queue bound
    pub queue_capacity: QueueCapacity,
    /// Queue depth that raises a backpressure warning
    pub high_water_mark: usize,
    /// Directory used by the export helpers
    pub export_dir: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_history: DEFAULT_MAX_HISTORY,
            drain_interval_ms: DEFAULT_DRAIN_INTERVAL_MS,
            render_capacity: DEFAULT_MAX_HISTORY,
            queue_capacity: QueueCapacity::Unbounded,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            export_dir: None,
        }
    }
}

/// Reconnection policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Attempts before giving up (0 disables reconnection)
    pub max_attempts: u32,
    /// Fixed delay between attempts
    pub delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            delay_ms: DEFAULT_RECONNECT_DELAY_MS,
        }
    }
}

/// Built-in mock device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MockConfig {
    pub min_interval_us: u32,
    pub max_interval_us: u32,
    /// Fixed seed for reproducible runs
    pub seed: Option<u64>,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            min_interval_us: 80,
            max_interval_us: 1_000_000,
            seed: None,
        }
    }
}

/// Simulation server defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    pub bind_address: String,
    pub port: u16,
    pub protocol: SimProtocol,
    pub timing: SimTiming,
    pub looped: bool,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: DEFAULT_SIM_PORT,
            protocol: SimProtocol::Udp,
            timing: SimTiming::Fixed { rate_hz: 100.0 },
            looped: true,
        }
    }
}

impl AppConfig {
    /// Platform config file location (`~/.config/pulse-link/pulse-link.toml` on Linux)
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("org", "pulse-link", "pulse-link")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }

    /// Parse a TOML document
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: AppConfig =
            toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to a TOML document
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Load and validate a config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&text)
    }

    /// Write the config, creating parent directories
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    /// Load from the platform location, falling back to defaults
    pub fn load_or_default() -> Self {
        let Some(path) = Self::default_path() else {
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }
        match Self::load(&path) {
            Ok(config) => {
                tracing::info!("Loaded config from {}", path.display());
                config
            }
            Err(e) => {
                tracing::warn!("Ignoring invalid config {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Reject values the core cannot run with
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(Error::Config(msg.to_string()));

        if self.serial.baud_rate == 0 {
            return fail("serial.baud_rate must be positive");
        }
        if self.serial.read_timeout_ms == 0 || self.serial.read_timeout_ms > 50 {
            return fail("serial.read_timeout_ms must be within 1..=50");
        }
        if self.serial.read_chunk == 0 {
            return fail("serial.read_chunk must be positive");
        }
        if self.storage.max_history == 0 {
            return fail("storage.max_history must be positive");
        }
        if self.storage.render_capacity == 0 {
            return fail("storage.render_capacity must be positive");
        }
        if self.storage.drain_interval_ms == 0 {
            return fail("storage.drain_interval_ms must be positive");
        }
        if let QueueCapacity::Bounded { capacity, .. } = self.storage.queue_capacity {
            if capacity == 0 {
                return fail("storage.queue_capacity must be positive when bounded");
            }
        }
        if !self.acquisition.unit_scale.is_finite() || self.acquisition.unit_scale == 0.0 {
            return fail("acquisition.unit_scale must be finite and non-zero");
        }
        if self.mock.min_interval_us == 0 || self.mock.min_interval_us > self.mock.max_interval_us {
            return fail("mock interval range is empty");
        }
        self.simulator.validate()
    }
}

impl SimulatorConfig {
    /// Reject pacing the server cannot honour
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(Error::Config(msg.to_string()));

        match self.timing {
            SimTiming::Fixed { rate_hz } | SimTiming::Jitter { rate_hz, .. }
                if !(rate_hz.is_finite() && rate_hz > 0.0) =>
            {
                fail("simulator rate_hz must be finite and positive")
            }
            SimTiming::Jitter { jitter_ms, .. } if !(jitter_ms.is_finite() && jitter_ms >= 0.0) => {
                fail("simulator jitter_ms must be finite and non-negative")
            }
            _ => Ok(()),
        }
    }
}

impl SerialConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }
}

impl AcquisitionConfig {
    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn empty_read_sleep(&self) -> Duration {
        Duration::from_millis(self.empty_read_sleep_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    /// `None` when the silence watchdog is disabled
    pub fn data_timeout(&self) -> Option<Duration> {
        (self.data_timeout_ms > 0).then(|| Duration::from_millis(self.data_timeout_ms))
    }
}

impl StorageConfig {
    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }
}

impl ReconnectConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn enabled(&self) -> bool {
        self.max_attempts > 0
    }
}

impl QueueCapacity {
    /// Bounded queue that evicts the oldest queued sample when full
    pub fn drop_oldest(capacity: usize) -> Self {
        QueueCapacity::Bounded {
            capacity,
            overflow: OverflowPolicy::DropOldest,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.reconnect.max_attempts, 5);
        assert_eq!(config.reconnect.delay(), Duration::from_secs(3));
        assert_eq!(config.storage.queue_capacity, QueueCapacity::Unbounded);
    }

    #[test]
    fn test_partial_toml() {
        let text = r#"
            [storage]
            max_history = 3

            [reconnect]
            max_attempts = 2
            delay_ms = 50
        "#;
        let config = AppConfig::from_toml(text).unwrap();
        assert_eq!(config.storage.max_history, 3);
        assert_eq!(config.reconnect.max_attempts, 2);
        assert_eq!(config.serial.baud_rate, DEFAULT_BAUD_RATE);
    }

    #[test]
    fn test_bounded_queue_toml() {
        let text = r#"
            [storage.queue_capacity.bounded]
            capacity = 128
            overflow = "drop_newest"
        "#;
        let config = AppConfig::from_toml(text).unwrap();
        assert_eq!(
            config.storage.queue_capacity,
            QueueCapacity::Bounded {
                capacity: 128,
                overflow: OverflowPolicy::DropNewest
            }
        );
    }

    #[test]
    fn test_validation_rejects_zero_history() {
        let mut config = AppConfig::default();
        config.storage.max_history = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validation_rejects_bad_simulator_timing() {
        let bad = [
            SimTiming::Fixed { rate_hz: 0.0 },
            SimTiming::Fixed { rate_hz: f64::NAN },
            SimTiming::Jitter {
                rate_hz: f64::INFINITY,
                jitter_ms: 1.0,
            },
            SimTiming::Jitter {
                rate_hz: 100.0,
                jitter_ms: f64::INFINITY,
            },
            SimTiming::Jitter {
                rate_hz: 100.0,
                jitter_ms: -1.0,
            },
        ];
        for timing in bad {
            let mut config = AppConfig::default();
            config.simulator.timing = timing;
            assert!(
                matches!(config.validate(), Err(Error::Config(_))),
                "{:?} accepted",
                timing
            );
        }

        let mut config = AppConfig::default();
        config.simulator.timing = SimTiming::Jitter {
            rate_hz: 1e-3,
            jitter_ms: 5.0,
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);

        let mut config = AppConfig::default();
        config.mock.seed = Some(7);
        config.storage.queue_capacity = QueueCapacity::drop_oldest(64);
        config.save(&path).unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
