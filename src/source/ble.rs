//! ==============================================================================
//! source/ble.rs - bluetooth le thermometer reader
//! ==============================================================================
//!
//! purpose:
//!     reads temperature/humidity from xiaomi LYWSD03MMC-class thermometers.
//!     every read connects, reads one characteristic and disconnects, so no
//!     connection is held across cycles.
//!
//! hardware abstraction:
//!     - feature "hardware": real BLE access through btleplug (BlueZ on linux).
//!       one adapter is opened and scanning is started once for the whole
//!       process; every sensor looks itself up in that shared scan.
//!     - otherwise: a mock that decodes a fixed payload, so the host compiles
//!       and runs on a development machine without a bluetooth stack.
//!       start-up warns loudly since the mock values land in the history.
//!
//! payload layout (little endian):
//!     i16 temperature (centi-degrees) | u8 humidity (%) | u16 battery (mV)
//!
//! ==============================================================================

use super::{ReadingSource, SourceError};
use crate::domain::Reading;

use async_trait::async_trait;
use chrono::Utc;
use std::future::Future;
use std::time::Duration;

/// service exposing the live measurement
pub const SERVICE_UUID: &str = "ebe0ccb0-7a0a-4b0c-8a1a-6ff2997da3a6";
/// temperature/humidity/battery characteristic
pub const CHARACTERISTIC_UUID: &str = "ebe0ccc1-7a0a-4b0c-8a1a-6ff2997da3a6";

/// Fixed temperature the mock reader reports.
pub const MOCK_TEMPERATURE: f64 = 22.5;

/// true when built without the "hardware" feature
pub const fn is_mock() -> bool {
    cfg!(not(feature = "hardware"))
}

/// short description of the active reader for the config summary
pub fn reader_mode() -> &'static str {
    if is_mock() {
        "MOCK (fixed 22.5°C, no bluetooth)"
    } else {
        "bluetooth (btleplug)"
    }
}

/// one decoded characteristic value
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BleMeasurement {
    pub temperature: f64,
    pub humidity: u8,
    pub battery_volts: f64,
}

/// Decode the raw characteristic bytes.
pub fn decode_payload(raw: &[u8]) -> Result<BleMeasurement, SourceError> {
    if raw.len() < 5 {
        return Err(SourceError::Parse(format!(
            "expected at least 5 bytes, got {} ({})",
            raw.len(),
            hex::encode(raw)
        )));
    }
    let temp_raw = i16::from_le_bytes([raw[0], raw[1]]);
    let humidity = raw[2];
    let battery_mv = u16::from_le_bytes([raw[3], raw[4]]);

    if humidity > 100 {
        return Err(SourceError::Parse(format!(
            "humidity {}% out of range ({})",
            humidity,
            hex::encode(raw)
        )));
    }

    Ok(BleMeasurement {
        temperature: temp_raw as f64 / 100.0,
        humidity,
        battery_volts: battery_mv as f64 / 1000.0,
    })
}

/// one configured thermometer
pub struct BleSensorSource {
    id: String,
    address: String,
}

impl BleSensorSource {
    pub fn new(id: &str, address: &str) -> Self {
        Self {
            id: id.to_string(),
            address: address.to_uppercase(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl ReadingSource for BleSensorSource {
    fn source_id(&self) -> &str {
        &self.id
    }

    async fn read(&self, timeout: Duration) -> Result<Reading, SourceError> {
        let raw = read_characteristic(&self.address, timeout).await?;

        let m = decode_payload(&raw)?;
        tracing::debug!(
            "[BLE] {} ({}): {:.2}°C | {}% | {:.3}V",
            self.id,
            self.address,
            m.temperature,
            m.humidity,
            m.battery_volts
        );
        Ok(Reading::present(&self.id, Utc::now(), m.temperature))
    }
}

// ==============================================================================================
// MOCK IMPLEMENTATION (No bluetooth stack)
// ==============================================================================================
#[cfg(not(feature = "hardware"))]
async fn read_characteristic(address: &str, _timeout: Duration) -> Result<Vec<u8>, SourceError> {
    tracing::debug!("[MOCK BLE] Reading {}", address);
    // 22.50°C, 45%, 3.000V
    Ok(vec![0xCA, 0x08, 0x2D, 0xB8, 0x0B])
}

// ==============================================================================================
// REAL IMPLEMENTATION (btleplug)
// ==============================================================================================
#[cfg(feature = "hardware")]
static ADAPTER: tokio::sync::OnceCell<btleplug::platform::Adapter> =
    tokio::sync::OnceCell::const_new();

#[cfg(feature = "hardware")]
fn connection_error(e: btleplug::Error) -> SourceError {
    SourceError::Connection(e.to_string())
}

/// First adapter, scanning. Opened on first use and never stopped, so
/// concurrent reads of different sensors all see the same scan results.
#[cfg(feature = "hardware")]
async fn shared_adapter() -> Result<&'static btleplug::platform::Adapter, SourceError> {
    use btleplug::api::{Central, Manager as _, ScanFilter};
    use btleplug::platform::Manager;

    ADAPTER
        .get_or_try_init(|| async {
            let manager = Manager::new().await.map_err(connection_error)?;
            let central = manager
                .adapters()
                .await
                .map_err(connection_error)?
                .into_iter()
                .next()
                .ok_or_else(|| SourceError::Connection("no bluetooth adapter found".into()))?;
            central.start_scan(ScanFilter::default()).await.map_err(connection_error)?;
            tracing::info!("[BLE] Scanning started on shared adapter");
            Ok::<_, SourceError>(central)
        })
        .await
}

#[cfg(feature = "hardware")]
async fn read_characteristic(address: &str, timeout: Duration) -> Result<Vec<u8>, SourceError> {
    use btleplug::api::{BDAddr, Central, Peripheral as _};
    use std::str::FromStr;
    use tokio::time::Instant;

    let deadline = Instant::now() + timeout;
    let char_uuid = uuid::Uuid::parse_str(CHARACTERISTIC_UUID)
        .map_err(|e| SourceError::Parse(e.to_string()))?;
    let target = BDAddr::from_str(address)
        .map_err(|e| SourceError::Connection(format!("bad address {}: {}", address, e)))?;

    let central = shared_adapter().await?;
    let lookup = async {
        loop {
            let found = central
                .peripherals()
                .await
                .map_err(connection_error)?
                .into_iter()
                .find(|p| p.address() == target);
            if let Some(p) = found {
                return Ok::<_, SourceError>(p);
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    };
    let peripheral = tokio::time::timeout_at(deadline, lookup)
        .await
        .map_err(|_| SourceError::Connection(format!("{} not seen in scan", address)))??;

    let budget = deadline.saturating_duration_since(Instant::now());
    let link = peripheral.clone();
    let owned_address = address.to_string();
    let exchange = async move {
        tracing::debug!("[BLE] Connecting to {}", owned_address);
        peripheral.connect().await.map_err(connection_error)?;
        peripheral.discover_services().await.map_err(connection_error)?;
        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == char_uuid)
            .ok_or_else(|| {
                SourceError::Connection(format!("characteristic {} not found", CHARACTERISTIC_UUID))
            })?;
        let raw = peripheral.read(&characteristic).await.map_err(connection_error)?;
        tracing::debug!("[BLE] {} raw payload {}", owned_address, hex::encode(&raw));
        Ok::<_, SourceError>(raw)
    };
    let owned_address = address.to_string();
    let disconnect = async move {
        if let Err(e) = link.disconnect().await {
            tracing::debug!("[BLE] Disconnect from {} failed: {}", owned_address, e);
        }
    };

    detached_session(budget, exchange, disconnect).await
}

/// Run `exchange` on its own task within `budget`, then always run
/// `cleanup`, also when the caller stops waiting for the result.
#[cfg_attr(not(feature = "hardware"), allow(dead_code))]
async fn detached_session<T, E, C>(
    budget: Duration,
    exchange: E,
    cleanup: C,
) -> Result<T, SourceError>
where
    T: Send + 'static,
    E: Future<Output = Result<T, SourceError>> + Send + 'static,
    C: Future<Output = ()> + Send + 'static,
{
    let session = tokio::spawn(async move {
        let result = match tokio::time::timeout(budget, exchange).await {
            Ok(r) => r,
            Err(_) => Err(SourceError::Timeout(budget)),
        };
        cleanup.await;
        result
    });

    session
        .await
        .map_err(|e| SourceError::Connection(format!("ble session failed: {}", e)))?
}
