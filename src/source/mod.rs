//! ==============================================================================
//! source/mod.rs - reading sources
//! ==============================================================================
//!
//! purpose:
//!     the seam between the poller and the outside world. every source turns
//!     one `read` call into one timestamped temperature or a typed error.
//!
//! relationships:
//!     - implemented by: ble.rs (thermometers), weather.rs (openweathermap)
//!     - used by: poller.rs (one spawned read per source per cycle)
//!
//! ==============================================================================

pub mod ble;
pub mod weather;

use crate::config::HostConfig;
use crate::domain::Reading;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub use ble::BleSensorSource;
pub use weather::WeatherSource;

/// why a single read failed
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SourceError {
    /// device unreachable, or paired but not answering
    #[error("connection error: {0}")]
    Connection(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("auth error: {0}")]
    Auth(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("parse error: {0}")]
    Parse(String),
}

impl SourceError {
    /// short tag that leads the stored reason
    pub fn tag(&self) -> &'static str {
        match self {
            SourceError::Connection(_) => "connection",
            SourceError::Timeout(_) => "timeout",
            SourceError::Auth(_) => "auth",
            SourceError::Network(_) => "network",
            SourceError::Parse(_) => "parse",
        }
    }

    /// Text stored in an absent reading: tag, then detail.
    pub fn reason(&self) -> String {
        match self {
            SourceError::Timeout(after) => {
                format!("{}: no answer within {:?}", self.tag(), after)
            }
            SourceError::Connection(detail)
            | SourceError::Auth(detail)
            | SourceError::Network(detail)
            | SourceError::Parse(detail) => format!("{}: {}", self.tag(), detail),
        }
    }
}

/// something the poller can ask for a temperature
#[async_trait]
pub trait ReadingSource: Send + Sync {
    /// id used as the row key for this source
    fn source_id(&self) -> &str;

    /// take one reading, giving up after `timeout`
    async fn read(&self, timeout: Duration) -> Result<Reading, SourceError>;
}

/// Build every configured source in row order.
pub fn build_sources(config: &HostConfig) -> anyhow::Result<Vec<Arc<dyn ReadingSource>>> {
    let mut sources: Vec<Arc<dyn ReadingSource>> = Vec::new();

    for sensor in &config.sensors {
        sources.push(Arc::new(BleSensorSource::new(&sensor.id, &sensor.address)));
    }
    if ble::is_mock() && !config.sensors.is_empty() {
        tracing::warn!(
            "[BLE] Using MOCK BLE reader: {} sensor(s) will record a fixed {}°C",
            config.sensors.len(),
            ble::MOCK_TEMPERATURE
        );
    }

    if config.weather.enabled {
        let weather = WeatherSource::from_config(&config.weather)?;
        sources.push(Arc::new(weather));
    }

    Ok(sources)
}
