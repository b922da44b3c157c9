//! climate host: polls BLE thermometers and a weather api, keeps an
//! append-only history and serves it to a local dashboard.
//!
//! see main.rs for how the pieces are wired together at start-up.

pub mod config;
pub mod domain;
pub mod health;
pub mod history;
pub mod poller;
pub mod publisher;
pub mod server;
pub mod source;

pub use config::HostConfig;
pub use domain::{Reading, SampleRow};
pub use health::{HealthTracker, HostHealth};
pub use history::{HistoryError, HistoryStore, HistoryView, LoadReport};
pub use poller::{Poller, PollerSettings, PollerState};
pub use publisher::{Snapshot, SnapshotPublisher, SnapshotReader};
pub use source::{ReadingSource, SourceError};
