//! ==============================================================================
//! poller.rs - the sampling loop
//! ==============================================================================
//!
//! purpose:
//!     once per period: read every source, build one row, append it to the
//!     history and publish it. nothing a single source does can stop a
//!     cycle; every source gets exactly one entry per row.
//!
//! cycle:
//!
//! ```text
//!     Idle ──timer──▶ Polling
//!                       │ spawn one read task per source (bounded deadline)
//!                       │ join all, timeouts and panics become absent
//!                       │ HistoryStore::append (disk, then memory)
//!                       │ SnapshotPublisher::publish
//!     Idle ◀────────────┘
//! ```
//!
//! schedule:
//!     boundaries sit at start + k * period. a cycle that overruns is
//!     followed immediately by the next one; boundaries passed during the
//!     overrun are skipped and logged.
//!
//! ==============================================================================

use crate::config::{HostConfig, PollingConfig};
use crate::domain::{Reading, SampleRow};
use crate::health::HealthTracker;
use crate::history::{HistoryError, HistoryStore};
use crate::publisher::SnapshotPublisher;
use crate::source::{ReadingSource, SourceError};

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// extra wait past the per-source deadline before a task is abandoned
const JOIN_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    Idle,
    Polling,
}

#[derive(Debug, Clone)]
pub struct PollerSettings {
    pub interval: Duration,
    /// budget for one source in one cycle, retries included
    pub read_timeout: Duration,
    pub attempts: u32,
    pub retry_delay: Duration,
    pub show_sensor_data: bool,
}

impl PollerSettings {
    pub fn from_config(polling: &PollingConfig, show_sensor_data: bool) -> Self {
        Self {
            interval: polling.interval(),
            read_timeout: polling.read_timeout(),
            attempts: polling.retries,
            retry_delay: polling.retry_delay(),
            show_sensor_data,
        }
    }
}

impl From<&HostConfig> for PollerSettings {
    fn from(config: &HostConfig) -> Self {
        Self::from_config(&config.polling, config.logging.show_sensor_data)
    }
}

/// what one cycle did
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub row: SampleRow,
    pub persisted: bool,
    pub published: bool,
}

pub struct Poller {
    sources: Vec<Arc<dyn ReadingSource>>,
    store: HistoryStore,
    publisher: SnapshotPublisher,
    health: HealthTracker,
    settings: PollerSettings,
    state: PollerState,
}

impl Poller {
    pub fn new(
        sources: Vec<Arc<dyn ReadingSource>>,
        store: HistoryStore,
        publisher: SnapshotPublisher,
        health: HealthTracker,
        settings: PollerSettings,
    ) -> Self {
        Self {
            sources,
            store,
            publisher,
            health,
            settings,
            state: PollerState::Idle,
        }
    }

    pub fn state(&self) -> PollerState {
        self.state
    }

    pub fn store(&self) -> &HistoryStore {
        &self.store
    }

    /// Run one full cycle: read, append, publish.
    pub async fn run_cycle(&mut self) -> CycleReport {
        self.state = PollerState::Polling;
        let cycle_ts = Utc::now();
        tracing::debug!("[POLL] Cycle started at {}", cycle_ts);

        let tasks: Vec<_> = self
            .sources
            .iter()
            .map(|source| {
                let source = source.clone();
                let settings = self.settings.clone();
                tokio::spawn(async move { read_with_retry(source.as_ref(), &settings).await })
            })
            .collect();

        let wait = self.settings.read_timeout + JOIN_GRACE;
        let results = futures::future::join_all(
            tasks.into_iter().map(|t| tokio::time::timeout(wait, t)),
        )
        .await;

        let mut readings = Vec::with_capacity(self.sources.len());
        for (source, result) in self.sources.iter().zip(results) {
            let id = source.source_id();
            let reading = match result {
                Ok(Ok(Ok(mut reading))) => {
                    reading.source_id = id.to_string();
                    reading
                }
                Ok(Ok(Err(e))) => Reading::absent(id, cycle_ts, e.reason()),
                Ok(Err(join_err)) => {
                    Reading::absent(id, cycle_ts, format!("read task failed: {}", join_err))
                }
                Err(_) => Reading::absent(id, cycle_ts, SourceError::Timeout(wait).reason()),
            };
            if let Some(err) = &reading.error {
                tracing::warn!("[POLL] {} recorded as absent: {}", id, err);
                self.health.record_source_failure(id);
            }
            readings.push(reading);
        }

        let row = SampleRow::new(cycle_ts, readings);
        if self.settings.show_sensor_data {
            tracing::info!("[POLL] {}", format_row(&row));
        }

        let (persisted, in_history) = match self.store.append(row.clone()) {
            Ok(()) => {
                if self.health.mark_persist_ok() {
                    tracing::info!(
                        "[POLL] Persistence recovered, {} is writable again",
                        self.store.path().display()
                    );
                }
                (true, true)
            }
            Err(HistoryError::OutOfOrder { row: ts, last }) => {
                tracing::error!(
                    "[POLL] Row at {} dropped, clock is behind last row at {}",
                    ts,
                    last
                );
                (false, false)
            }
            Err(e) => {
                if self.health.mark_persist_failed() {
                    tracing::error!("[POLL] Persistence DEGRADED: {}", e);
                } else {
                    tracing::error!("[POLL] Persistence still failing: {}", e);
                }
                (false, true)
            }
        };

        let published = if in_history {
            let view = self.store.view();
            match view.last() {
                Some(last) => self.publisher.publish(last, view),
                None => false,
            }
        } else {
            false
        };

        self.health.record_cycle();
        self.state = PollerState::Idle;
        CycleReport {
            row,
            persisted,
            published,
        }
    }

    /// Poll forever on a fixed schedule.
    pub async fn run(mut self) {
        let period = self.settings.interval;
        let start = Instant::now();
        let mut k: u64 = 0;
        tracing::info!(
            "[POLL] Starting ({} sources, {:?} period)",
            self.sources.len(),
            period
        );

        loop {
            self.run_cycle().await;

            let elapsed = start.elapsed();
            let (next, skipped) = schedule_next(elapsed, period, k);
            if elapsed >= boundary(period, k + 1) {
                tracing::warn!(
                    "[POLL] Cycle {} overran its {:?} period, {} boundary(s) skipped",
                    k,
                    period,
                    skipped
                );
                self.health.record_skipped(skipped);
            }
            k = next;
            tokio::time::sleep_until(start + boundary(period, k)).await;
        }
    }
}

/// Try a source up to `attempts` times inside one deadline.
///
/// when the deadline runs out between attempts the last attempt's error is
/// returned, not a timeout.
async fn read_with_retry(
    source: &dyn ReadingSource,
    settings: &PollerSettings,
) -> Result<Reading, SourceError> {
    let deadline = Instant::now() + settings.read_timeout;
    let attempts = settings.attempts.max(1);
    let mut attempt = 1;
    let mut last_error = None;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            let e = last_error.unwrap_or(SourceError::Timeout(settings.read_timeout));
            tracing::warn!(
                "[POLL] {} out of time after {} attempt(s): {}",
                source.source_id(),
                attempt - 1,
                e
            );
            return Err(e);
        }

        let result = match tokio::time::timeout(remaining, source.read(remaining)).await {
            Ok(r) => r,
            Err(_) => Err(SourceError::Timeout(settings.read_timeout)),
        };

        match result {
            Ok(reading) => return Ok(reading),
            Err(e) if attempt >= attempts => {
                tracing::warn!(
                    "[POLL] {} failed after {} attempt(s): {}",
                    source.source_id(),
                    attempt,
                    e
                );
                return Err(e);
            }
            Err(e) => {
                tracing::debug!(
                    "[POLL] {} attempt {}/{} failed: {}",
                    source.source_id(),
                    attempt,
                    attempts,
                    e
                );
                attempt += 1;
                last_error = Some(e);
                tokio::time::sleep_until(deadline.min(Instant::now() + settings.retry_delay)).await;
            }
        }
    }
}

/// offset of boundary `k` from the start instant
pub fn boundary(period: Duration, k: u64) -> Duration {
    Duration::from_nanos((period.as_nanos() * k as u128).min(u64::MAX as u128) as u64)
}

/// Pick the boundary to wait for after cycle `current` finished at `elapsed`.
///
/// returns (next boundary index, boundaries skipped). when the cycle ended
/// before boundary `current + 1` that boundary is next; otherwise the most
/// recently passed boundary runs immediately and the ones before it are
/// skipped.
pub fn schedule_next(elapsed: Duration, period: Duration, current: u64) -> (u64, u64) {
    let candidate = current + 1;
    if period.is_zero() || elapsed < boundary(period, candidate) {
        return (candidate, 0);
    }
    let passed = (elapsed.as_nanos() / period.as_nanos()) as u64;
    (passed, passed - candidate)
}

fn format_row(row: &SampleRow) -> String {
    row.readings
        .iter()
        .map(|r| match r.value {
            Some(v) => format!("{}: {:.1}°C", r.source_id, v),
            None => format!("{}: --", r.source_id),
        })
        .collect::<Vec<_>>()
        .join(" | ")
}
