//! ==============================================================================
//! source/weather.rs - openweathermap reference temperature
//! ==============================================================================
//!
//! purpose:
//!     fetches the current outdoor temperature for one configured location.
//!     the reading is stored next to the indoor sensors as source "weather".
//!
//! ==============================================================================

use super::{ReadingSource, SourceError};
use crate::config::{WeatherConfig, WEATHER_SOURCE_ID};
use crate::domain::Reading;

use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://api.openweathermap.org/data/2.5/weather";

pub struct WeatherSource {
    client: reqwest::Client,
    base_url: String,
    location: String,
    api_key: String,
    units: String,
}

impl WeatherSource {
    pub fn new(location: &str, api_key: &str, units: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            location: location.to_string(),
            api_key: api_key.to_string(),
            units: units.to_string(),
        }
    }

    pub fn from_config(config: &WeatherConfig) -> Result<Self, SourceError> {
        let key = config
            .api_key
            .as_deref()
            .ok_or_else(|| SourceError::Auth("no api key configured".into()))?;
        Ok(Self::new(&config.location, key, &config.units))
    }

    /// point the source at another endpoint (used against local test servers)
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.to_string();
        self
    }

    async fn fetch(&self, timeout: Duration) -> Result<f64, SourceError> {
        if self.api_key.trim().is_empty() {
            return Err(SourceError::Auth("api key is empty".into()));
        }

        let response = self
            .client
            .get(&self.base_url)
            .query(&[
                ("q", self.location.as_str()),
                ("appid", self.api_key.as_str()),
                ("units", self.units.as_str()),
            ])
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SourceError::Timeout(timeout)
                } else {
                    SourceError::Network(e.without_url().to_string())
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(SourceError::Auth(format!("api key rejected ({})", status)));
        }
        if !status.is_success() {
            return Err(SourceError::Network(format!("unexpected status {}", status)));
        }

        let body = response
            .text()
            .await
            .map_err(|e| SourceError::Network(e.without_url().to_string()))?;
        parse_temperature(&body)
    }
}

/// Pull `main.temp` out of a current-weather response body.
pub fn parse_temperature(body: &str) -> Result<f64, SourceError> {
    let parsed: serde_json::Value =
        serde_json::from_str(body).map_err(|e| SourceError::Parse(format!("bad json: {}", e)))?;

    parsed["main"]["temp"]
        .as_f64()
        .ok_or_else(|| SourceError::Parse("missing numeric main.temp".into()))
}

#[async_trait]
impl ReadingSource for WeatherSource {
    fn source_id(&self) -> &str {
        WEATHER_SOURCE_ID
    }

    async fn read(&self, timeout: Duration) -> Result<Reading, SourceError> {
        let temp = self.fetch(timeout).await?;
        tracing::debug!("[WEATHER] {}: {:.1}°C", self.location, temp);
        Ok(Reading::present(WEATHER_SOURCE_ID, Utc::now(), temp))
    }
}
