//! ==============================================================================
//! domain.rs - readings, sample rows and snapshots
//! ==============================================================================
//!
//! purpose:
//!     the plain data that flows from the sources, through the poller, into
//!     the history log and out to the web layer.
//!
//! relationships:
//!     - produced by: source/ (Reading), poller.rs (SampleRow)
//!     - persisted by: history.rs (one SampleRow per log line)
//!     - published by: publisher.rs (Snapshot)
//!
//! ==============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// one source's result for one poll cycle
///
/// `value == None` means the read failed; the row still carries the entry so
/// gaps stay visible instead of being interpolated.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Reading {
    /// configured source identifier (e.g., "living-room" or "weather")
    pub source_id: String,
    /// when the value was obtained (or when the failure was recorded)
    pub timestamp: DateTime<Utc>,
    /// temperature in celsius, absent on failure
    pub value: Option<f64>,
    /// short failure reason when `value` is absent
    #[serde(default)]
    pub error: Option<String>,
}

impl Reading {
    pub fn present(source_id: impl Into<String>, timestamp: DateTime<Utc>, value: f64) -> Self {
        Self {
            source_id: source_id.into(),
            timestamp,
            value: Some(value),
            error: None,
        }
    }

    pub fn absent(
        source_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            timestamp,
            value: None,
            error: Some(error.into()),
        }
    }

    pub fn is_absent(&self) -> bool {
        self.value.is_none()
    }
}

/// one poll cycle across every configured source
///
/// readings are kept in configured source order, which is also the field
/// order of the durable log.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct SampleRow {
    pub timestamp: DateTime<Utc>,
    pub readings: Vec<Reading>,
}

impl SampleRow {
    pub fn new(timestamp: DateTime<Utc>, readings: Vec<Reading>) -> Self {
        Self {
            timestamp,
            readings,
        }
    }

    /// look up a source's entry by id
    pub fn get(&self, source_id: &str) -> Option<&Reading> {
        self.readings.iter().find(|r| r.source_id == source_id)
    }

    /// value for a source, `None` when absent or not in this row
    pub fn value(&self, source_id: &str) -> Option<f64> {
        self.get(source_id).and_then(|r| r.value)
    }

    pub fn absent_count(&self) -> usize {
        self.readings.iter().filter(|r| r.is_absent()).count()
    }
}
