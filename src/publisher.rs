//! ==============================================================================
//! publisher.rs - snapshot hand-off between the poller and the web layer
//! ==============================================================================
//!
//! purpose:
//!     the poller publishes (latest row, history view) as one immutable
//!     Snapshot through a tokio watch channel. readers clone the Arc and never
//!     see a half-built row or a row that is not yet in their history.
//!
//! relationships:
//!     - written by: poller.rs (sole SnapshotPublisher)
//!     - read by: server.rs (SnapshotReader clones, one per request)
//!
//! ==============================================================================

use crate::domain::SampleRow;
use crate::history::HistoryView;

use std::sync::Arc;
use tokio::sync::watch;

/// latest row plus the history that ends with it
#[derive(Clone, Debug)]
pub struct Snapshot {
    /// `None` until the first row exists (loaded or polled)
    pub row: Option<Arc<SampleRow>>,
    pub history: HistoryView,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self {
            row: None,
            history: HistoryView::empty(),
        }
    }

    /// snapshot whose row is the last row of `history`
    pub fn from_history(history: HistoryView) -> Self {
        Self {
            row: history.last(),
            history,
        }
    }
}

/// write half, owned by the poller
pub struct SnapshotPublisher {
    tx: watch::Sender<Arc<Snapshot>>,
}

/// read half, cheap to clone
#[derive(Clone)]
pub struct SnapshotReader {
    rx: watch::Receiver<Arc<Snapshot>>,
}

/// Create a publisher/reader pair seeded with `initial`.
pub fn channel(initial: Snapshot) -> (SnapshotPublisher, SnapshotReader) {
    let (tx, rx) = watch::channel(Arc::new(initial));
    (SnapshotPublisher { tx }, SnapshotReader { rx })
}

impl SnapshotPublisher {
    /// Swap in a new snapshot.
    ///
    /// `row` must be the last row of `history`; a mismatched pair is refused
    /// and the previous snapshot stays current.
    pub fn publish(&self, row: Arc<SampleRow>, history: HistoryView) -> bool {
        let consistent = history.last().map(|last| Arc::ptr_eq(&last, &row)).unwrap_or(false);
        if !consistent {
            tracing::error!(
                "[PUBLISH] Refusing snapshot for {}: row is not the last history entry",
                row.timestamp
            );
            return false;
        }
        self.tx.send_replace(Arc::new(Snapshot {
            row: Some(row),
            history,
        }));
        true
    }

    pub fn reader(&self) -> SnapshotReader {
        SnapshotReader { rx: self.tx.subscribe() }
    }
}

impl SnapshotReader {
    /// the current (row, history) pair
    pub fn current(&self) -> Arc<Snapshot> {
        self.rx.borrow().clone()
    }

    /// latest complete row
    pub fn current_snapshot(&self) -> Option<Arc<SampleRow>> {
        self.current().row.clone()
    }

    /// every row since start-up, loaded ones included
    pub fn full_history(&self) -> Vec<Arc<SampleRow>> {
        self.current().history.rows()
    }

    /// Wait for the next publish. Errors once the publisher is gone.
    pub async fn changed(&mut self) -> Result<Arc<Snapshot>, watch::error::RecvError> {
        self.rx.changed().await?;
        Ok(self.rx.borrow_and_update().clone())
    }
}
