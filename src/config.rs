//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `host.toml`.
//!     loads configuration from file or falls back to defaults, then
//!     validates it. an invalid configuration is fatal: the host refuses to
//!     start rather than poll sources that can never succeed.
//!
//! structure:
//!     - PollingConfig: cycle period, per-source deadline and retry policy.
//!     - SensorConfig: one BLE thermometer (id + hardware address).
//!     - WeatherConfig: OpenWeatherMap location and key.
//!     - StorageConfig: where the history log lives.
//!     - ServerConfig: dashboard bind address.
//!     - LoggingConfig: log level and per-cycle value logging.
//!
//! ==============================================================================

use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// source id used for the weather reading in every row
pub const WEATHER_SOURCE_ID: &str = "weather";

/// env var holding the weather api key when host.toml does not
pub const API_KEY_ENV: &str = "OPENWEATHERMAP_API_KEY";

/// env var overriding the config file location
pub const CONFIG_PATH_ENV: &str = "CLIMATE_HOST_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Root configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct HostConfig {
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub sensors: Vec<SensorConfig>,
    #[serde(default)]
    pub weather: WeatherConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PollingConfig {
    pub interval_minutes: u64,
    /// deadline for one source in one cycle, all retries included
    #[serde(default = "default_read_timeout")]
    pub read_timeout_seconds: u64,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,
}

fn default_read_timeout() -> u64 {
    30
}

fn default_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct SensorConfig {
    pub id: String,
    /// bluetooth hardware address, e.g. "A4:C1:38:57:34:4F"
    pub address: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WeatherConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub location: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_units")]
    pub units: String,
}

fn default_true() -> bool {
    true
}

fn default_units() -> String {
    "metric".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    pub level: String,
    #[serde(default)]
    pub show_sensor_data: bool,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_minutes: 1,
            read_timeout_seconds: default_read_timeout(),
            retries: default_retries(),
            retry_delay_seconds: default_retry_delay(),
        }
    }
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            location: "Wroclaw, PL".to_string(),
            api_key: None,
            units: default_units(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { path: PathBuf::from("historicalData.jsonl") }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind: "127.0.0.1:8050".to_string() }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), show_sensor_data: true }
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_minutes * 60)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_seconds)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_seconds)
    }
}

impl HostConfig {
    /// Parse configuration from toml text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Load from the first config file found, defaults when there is none.
    ///
    /// a file that exists but cannot be read or parsed is an error, never a
    /// silent fallback.
    pub fn load_or_default() -> Result<Self, ConfigError> {
        let paths = match std::env::var(CONFIG_PATH_ENV) {
            Ok(p) => vec![PathBuf::from(p)],
            Err(_) => vec![
                PathBuf::from("config").join("host.toml"),
                PathBuf::from("..").join("config").join("host.toml"),
            ],
        };

        for path in &paths {
            if path.exists() {
                let config = Self::load(path)?;
                println!("[CONFIG] Loaded from {}", path.display());
                return Ok(config);
            }
        }

        println!("[CONFIG] Warning: No config file found - using defaults");
        Ok(Self::default())
    }

    /// Fill the api key from the environment when the file has none.
    pub fn with_env_api_key(mut self, env_key: Option<String>) -> Self {
        let missing = self
            .weather
            .api_key
            .as_deref()
            .map(|k| k.trim().is_empty())
            .unwrap_or(true);
        if missing {
            self.weather.api_key = env_key.filter(|k| !k.trim().is_empty());
        }
        self
    }

    /// Check everything the poller relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let p = &self.polling;
        if p.interval_minutes == 0 {
            return Err(ConfigError::Invalid("polling.interval_minutes must be > 0".into()));
        }
        if p.read_timeout_seconds == 0 {
            return Err(ConfigError::Invalid("polling.read_timeout_seconds must be > 0".into()));
        }
        if p.retries == 0 {
            return Err(ConfigError::Invalid("polling.retries must be > 0".into()));
        }

        let mut seen = HashSet::new();
        for sensor in &self.sensors {
            if sensor.id.trim().is_empty() {
                return Err(ConfigError::Invalid("sensor id must not be empty".into()));
            }
            if sensor.id == WEATHER_SOURCE_ID {
                return Err(ConfigError::Invalid(format!(
                    "sensor id '{}' is reserved for the weather source",
                    WEATHER_SOURCE_ID
                )));
            }
            if !seen.insert(sensor.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate sensor id '{}'", sensor.id)));
            }
            if !is_valid_address(&sensor.address) {
                return Err(ConfigError::Invalid(format!(
                    "sensor '{}' has malformed address '{}'",
                    sensor.id, sensor.address
                )));
            }
        }

        if self.weather.enabled {
            if self.weather.location.trim().is_empty() {
                return Err(ConfigError::Invalid("weather.location must not be empty".into()));
            }
            if self.weather.api_key.is_none() {
                return Err(ConfigError::Invalid(format!(
                    "weather is enabled but no api key is set (weather.api_key or {})",
                    API_KEY_ENV
                )));
            }
        }

        if self.source_ids().is_empty() {
            return Err(ConfigError::Invalid("no sensors or weather source configured".into()));
        }
        Ok(())
    }

    /// configured source ids in row order: sensors first, then weather
    pub fn source_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sensors.iter().map(|s| s.id.clone()).collect();
        if self.weather.enabled {
            ids.push(WEATHER_SOURCE_ID.to_string());
        }
        ids
    }

    /// Print configuration summary
    pub fn print_summary(&self) {
        println!("┌─────────────────────────────────────────┐");
        println!("│           HOST CONFIGURATION            │");
        println!("├─────────────────────────────────────────┤");
        println!("│ Poll Interval: {}min", self.polling.interval_minutes);
        println!("│ Sensors: {}", self.sensors.len());
        println!("│ BLE Reader: {}", crate::source::ble::reader_mode());
        for s in &self.sensors {
            println!("│   {} @ {}", s.id, s.address);
        }
        if self.weather.enabled {
            println!("│ Weather: {}", self.weather.location);
        } else {
            println!("│ Weather: disabled");
        }
        println!("│ History: {}", self.storage.path.display());
        println!("│ Dashboard: http://{}", self.server.bind);
        println!("│ Log Level: {}", self.logging.level);
        println!("└─────────────────────────────────────────┘");
    }
}

/// six colon-separated hex octets
fn is_valid_address(address: &str) -> bool {
    let parts: Vec<&str> = address.split(':').collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
}

impl Default for HostConfig {
    fn default() -> Self {
        let sensors = [
            ("sensor-1", "A4:C1:38:57:34:4F"),
            ("sensor-2", "A4:C1:38:E8:B3:77"),
            ("sensor-3", "A4:C1:38:6A:80:BD"),
        ]
        .into_iter()
        .map(|(id, address)| SensorConfig {
            id: id.to_string(),
            address: address.to_string(),
        })
        .collect();

        Self {
            polling: PollingConfig::default(),
            sensors,
            weather: WeatherConfig::default(),
            storage: StorageConfig::default(),
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[polling]
interval_minutes = 5
retries = 2

[[sensors]]
id = "kitchen"
address = "A4:C1:38:57:34:4F"

[[sensors]]
id = "bedroom"
address = "a4:c1:38:e8:b3:77"

[weather]
location = "Berlin, DE"
api_key = "secret"

[storage]
path = "/tmp/history.jsonl"
"#;

    #[test]
    fn parses_full_config() {
        let config = HostConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.polling.interval(), Duration::from_secs(300));
        assert_eq!(config.polling.retries, 2);
        assert_eq!(config.polling.read_timeout_seconds, 30);
        assert_eq!(config.sensors.len(), 2);
        assert!(config.weather.enabled);
        assert_eq!(config.weather.units, "metric");
        assert_eq!(config.server.bind, "127.0.0.1:8050");
        assert_eq!(config.source_ids(), vec!["kitchen", "bedroom", "weather"]);
        config.validate().unwrap();
    }

    #[test]
    fn default_config_needs_api_key() {
        let config = HostConfig::default();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = HostConfig::default().with_env_api_key(Some("k".into()));
        config.validate().unwrap();
    }

    #[test]
    fn file_key_wins_over_env() {
        let config = HostConfig::from_toml_str(SAMPLE)
            .unwrap()
            .with_env_api_key(Some("from-env".into()));
        assert_eq!(config.weather.api_key.as_deref(), Some("secret"));
    }

    #[test]
    fn blank_env_key_is_missing() {
        let config = HostConfig::default().with_env_api_key(Some("  ".into()));
        assert!(config.weather.api_key.is_none());
    }

    #[test]
    fn rejects_malformed_address() {
        let mut config = HostConfig::default().with_env_api_key(Some("k".into()));
        config.sensors[1].address = "A4:C1:38:E8:B3".into();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("malformed address"));

        config.sensors[1].address = "A4:C1:38:E8:B3:ZZ".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_and_reserved_ids() {
        let mut config = HostConfig::default().with_env_api_key(Some("k".into()));
        config.sensors[2].id = "sensor-1".into();
        assert!(config.validate().unwrap_err().to_string().contains("duplicate"));

        config.sensors[2].id = WEATHER_SOURCE_ID.into();
        assert!(config.validate().unwrap_err().to_string().contains("reserved"));
    }

    #[test]
    fn rejects_zero_interval() {
        let mut config = HostConfig::default().with_env_api_key(Some("k".into()));
        config.polling.interval_minutes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_empty_source_list() {
        let mut config = HostConfig::default();
        config.sensors.clear();
        config.weather.enabled = false;
        assert!(config.validate().unwrap_err().to_string().contains("no sensors"));
    }

    #[test]
    fn shipped_config_is_valid() {
        let config = HostConfig::from_toml_str(include_str!("../config/host.toml"))
            .unwrap()
            .with_env_api_key(Some("k".into()));
        config.validate().unwrap();
        assert_eq!(config.sensors.len(), 3);
        assert_eq!(config.storage.path, PathBuf::from("historicalData.jsonl"));
    }

    #[test]
    fn unparseable_file_is_an_error() {
        assert!(matches!(
            HostConfig::from_toml_str("[polling\ninterval_minutes = 1"),
            Err(ConfigError::Parse(_))
        ));
    }
}
