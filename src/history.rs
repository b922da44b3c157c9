//! ==============================================================================
//! history.rs - append-only history log
//! ==============================================================================
//!
//! purpose:
//!     keeps every sample row ever recorded, both on disk and in memory.
//!
//! on-disk format:
//!     JSON Lines. one complete SampleRow per line, so an interrupted write
//!     can only damage the line being written. `load` skips anything that
//!     does not parse (logging each skip) and `open` cuts an unterminated
//!     trailing fragment off the file so the next append starts clean.
//!
//! in-memory:
//!     an append-only Vec behind a lock. rows are never mutated or removed,
//!     so a HistoryView (shared vec + length) is a stable picture of the
//!     history at the moment it was taken.
//!
//! append semantics:
//!     1. reject rows older than the last recorded row (OutOfOrder)
//!     2. write the line to disk
//!     3. push the row into memory, even when step 2 failed
//!     a Persist error therefore means "in memory, not on disk".
//!
//! ==============================================================================

use crate::domain::SampleRow;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("row at {row} is older than last recorded row at {last}")]
    OutOfOrder {
        row: DateTime<Utc>,
        last: DateTime<Utc>,
    },
    #[error("failed to persist row to {path}: {source}")]
    Persist {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to read history {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// a record `load` had to drop
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedRecord {
    /// 1-based line number in the log
    pub line: usize,
    pub reason: String,
}

/// what `load` found on disk
#[derive(Debug, Default)]
pub struct LoadReport {
    pub rows: Vec<SampleRow>,
    pub skipped: Vec<SkippedRecord>,
    /// byte offset where an unparseable unterminated tail starts
    pub truncated_tail_at: Option<u64>,
    /// the file ends without a newline and nothing was marked for truncation
    pub missing_final_newline: bool,
}

/// Read and parse the log. A missing file is an empty history.
pub fn load(path: &Path) -> Result<LoadReport, HistoryError> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!("[HISTORY] {} not found, starting empty", path.display());
            return Ok(LoadReport::default());
        }
        Err(source) => {
            return Err(HistoryError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    let mut report = LoadReport::default();
    let mut last: Option<DateTime<Utc>> = None;
    let mut offset: u64 = 0;
    let segments: Vec<&[u8]> = bytes.split(|b| *b == b'\n').collect();
    let count = segments.len();

    for (idx, segment) in segments.into_iter().enumerate() {
        let line_no = idx + 1;
        let start = offset;
        offset += segment.len() as u64 + 1;
        // split leaves one trailing segment after the last '\n'
        let terminated = idx + 1 < count;

        if segment.iter().all(|b| b.is_ascii_whitespace()) {
            continue;
        }

        let parsed = std::str::from_utf8(segment)
            .map_err(|e| format!("invalid utf-8: {}", e))
            .and_then(|s| serde_json::from_str::<SampleRow>(s).map_err(|e| e.to_string()));

        let reason = match parsed {
            Ok(row) => match last {
                Some(prev) if row.timestamp < prev => {
                    format!("timestamp {} is older than previous row {}", row.timestamp, prev)
                }
                _ => {
                    last = Some(row.timestamp);
                    report.rows.push(row);
                    continue;
                }
            },
            Err(e) => {
                if !terminated {
                    report.truncated_tail_at = Some(start);
                }
                e
            }
        };

        tracing::warn!("[HISTORY] Skipping line {} of {}: {}", line_no, path.display(), reason);
        report.skipped.push(SkippedRecord {
            line: line_no,
            reason,
        });
    }
    report.missing_final_newline =
        !bytes.is_empty() && !bytes.ends_with(b"\n") && report.truncated_tail_at.is_none();

    tracing::info!(
        "[HISTORY] Loaded {} rows from {} ({} skipped)",
        report.rows.len(),
        path.display(),
        report.skipped.len()
    );
    Ok(report)
}

/// a stable, read-only picture of the history
#[derive(Clone)]
pub struct HistoryView {
    rows: Arc<RwLock<Vec<Arc<SampleRow>>>>,
    len: usize,
}

impl HistoryView {
    pub fn empty() -> Self {
        Self {
            rows: Arc::new(RwLock::new(Vec::new())),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// every row in this view, oldest first
    pub fn rows(&self) -> Vec<Arc<SampleRow>> {
        self.rows.read()[..self.len].to_vec()
    }

    pub fn last(&self) -> Option<Arc<SampleRow>> {
        self.len.checked_sub(1).map(|i| self.rows.read()[i].clone())
    }

    /// rows at or after `cutoff`, oldest first
    pub fn since(&self, cutoff: DateTime<Utc>) -> Vec<Arc<SampleRow>> {
        let guard = self.rows.read();
        let rows = &guard[..self.len];
        // rows are timestamp ordered
        let start = rows.partition_point(|r| r.timestamp < cutoff);
        rows[start..].to_vec()
    }
}

impl std::fmt::Debug for HistoryView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryView").field("len", &self.len).finish()
    }
}

/// owner of the log; only the poller holds one
pub struct HistoryStore {
    path: PathBuf,
    rows: Arc<RwLock<Vec<Arc<SampleRow>>>>,
    last_timestamp: Option<DateTime<Utc>>,
    /// the file may end mid-line (failed write or unrepaired tail)
    tail_suspect: bool,
}

impl HistoryStore {
    /// Load the log at `path` and get ready to append to it.
    pub fn open(path: impl Into<PathBuf>) -> Result<(Self, LoadReport), HistoryError> {
        let path = path.into();
        let report = load(&path)?;

        let mut tail_suspect = false;
        if let Some(at) = report.truncated_tail_at {
            match truncate(&path, at) {
                Ok(()) => tracing::warn!(
                    "[HISTORY] Truncated partial record at byte {} of {}",
                    at,
                    path.display()
                ),
                Err(e) => {
                    tracing::warn!("[HISTORY] Could not truncate partial record: {}", e);
                    tail_suspect = true;
                }
            }
        } else if report.missing_final_newline {
            tail_suspect = true;
        }

        let rows: Vec<Arc<SampleRow>> = report.rows.iter().cloned().map(Arc::new).collect();
        let last_timestamp = rows.last().map(|r| r.timestamp);

        let store = Self {
            path,
            rows: Arc::new(RwLock::new(rows)),
            last_timestamp,
            tail_suspect,
        };
        Ok((store, report))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append one row. See the module docs for the failure semantics.
    pub fn append(&mut self, row: SampleRow) -> Result<(), HistoryError> {
        if let Some(last) = self.last_timestamp {
            if row.timestamp < last {
                tracing::error!(
                    "[HISTORY] Rejected out-of-order row {} (last {})",
                    row.timestamp,
                    last
                );
                return Err(HistoryError::OutOfOrder {
                    row: row.timestamp,
                    last,
                });
            }
        }

        let persisted = self.persist(&row);
        self.last_timestamp = Some(row.timestamp);
        self.rows.write().push(Arc::new(row));
        persisted
    }

    /// view of everything appended so far
    pub fn view(&self) -> HistoryView {
        let len = self.rows.read().len();
        HistoryView {
            rows: self.rows.clone(),
            len,
        }
    }

    /// ordered copy of every row
    pub fn all(&self) -> Vec<Arc<SampleRow>> {
        self.view().rows()
    }

    fn persist(&mut self, row: &SampleRow) -> Result<(), HistoryError> {
        let path = self.path.clone();
        let wrap = |source: std::io::Error| HistoryError::Persist {
            path: path.clone(),
            source,
        };

        let mut line = serde_json::to_string(row).map_err(|e| wrap(e.into()))?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .map_err(wrap)?;

        if self.tail_suspect && !ends_with_newline(&mut file).map_err(wrap)? {
            line.insert(0, '\n');
        }

        match file.write_all(line.as_bytes()).and_then(|_| file.sync_data()) {
            Ok(()) => {
                self.tail_suspect = false;
                Ok(())
            }
            Err(e) => {
                self.tail_suspect = true;
                Err(wrap(e))
            }
        }
    }
}

fn truncate(path: &Path, len: u64) -> std::io::Result<()> {
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(len)?;
    file.sync_data()
}

fn ends_with_newline(file: &mut File) -> std::io::Result<bool> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(true);
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Reading;
    use chrono::{Duration, TimeZone};
    use tempfile::TempDir;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn row(secs: i64, a: Option<f64>) -> SampleRow {
        let t = ts(secs);
        let first = match a {
            Some(v) => Reading::present("sensor-A", t, v),
            None => Reading::absent("sensor-A", t, "timeout"),
        };
        SampleRow::new(t, vec![first, Reading::present("weather", t, 9.7)])
    }

    fn store_in(dir: &TempDir) -> (HistoryStore, LoadReport) {
        HistoryStore::open(dir.path().join("history.jsonl")).unwrap()
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        let (store, report) = store_in(&dir);
        assert!(store.is_empty());
        assert!(report.rows.is_empty());
        assert!(report.skipped.is_empty());
    }

    #[test]
    fn append_then_reload_round_trips() {
        let dir = TempDir::new().unwrap();
        let rows = vec![row(0, Some(21.3)), row(60, None), row(120, Some(-4.5))];
        {
            let (mut store, _) = store_in(&dir);
            for r in &rows {
                store.append(r.clone()).unwrap();
            }
            assert_eq!(store.len(), 3);
        }

        let (store, report) = store_in(&dir);
        assert_eq!(report.rows, rows);
        assert!(report.skipped.is_empty());
        let all: Vec<SampleRow> = store.all().iter().map(|r| (**r).clone()).collect();
        assert_eq!(all, rows);
    }

    #[test]
    fn one_line_per_row() {
        let dir = TempDir::new().unwrap();
        let (mut store, _) = store_in(&dir);
        store.append(row(0, Some(1.0))).unwrap();
        store.append(row(1, Some(2.0))).unwrap();

        let text = std::fs::read_to_string(store.path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(text.ends_with('\n'));
        for line in lines {
            serde_json::from_str::<SampleRow>(line).unwrap();
        }
    }

    #[test]
    fn rejects_older_row() {
        let dir = TempDir::new().unwrap();
        let (mut store, _) = store_in(&dir);
        store.append(row(60, Some(1.0))).unwrap();

        let err = store.append(row(0, Some(2.0))).unwrap_err();
        assert!(matches!(err, HistoryError::OutOfOrder { .. }));
        assert_eq!(store.len(), 1);

        // equal timestamps are fine
        store.append(row(60, Some(3.0))).unwrap();
        assert_eq!(store.len(), 2);

        let (_, report) = store_in(&dir);
        assert_eq!(report.rows.len(), 2);
    }

    #[test]
    fn truncated_last_line_is_skipped_and_cut() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.jsonl");
        {
            let (mut store, _) = store_in(&dir);
            store.append(row(0, Some(1.0))).unwrap();
            store.append(row(60, Some(2.0))).unwrap();
        }
        let full = serde_json::to_string(&row(120, Some(3.0))).unwrap();
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(full[..full.len() / 2].as_bytes()).unwrap();
        drop(f);

        let (mut store, report) = store_in(&dir);
        assert_eq!(report.rows.len(), 2);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].line, 3);
        assert!(report.truncated_tail_at.is_some());

        // the next append lands on its own line
        store.append(row(180, Some(4.0))).unwrap();
        let (_, report) = store_in(&dir);
        assert_eq!(report.rows.len(), 3);
        assert!(report.skipped.is_empty());
    }

    #[test]
    fn interior_garbage_is_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.jsonl");
        let good1 = serde_json::to_string(&row(0, Some(1.0))).unwrap();
        let good2 = serde_json::to_string(&row(60, Some(2.0))).unwrap();
        std::fs::write(&path, format!("{}\nnot json\n\n{}\n", good1, good2)).unwrap();

        let (store, report) = store_in(&dir);
        assert_eq!(store.len(), 2);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].line, 2);
        assert!(report.truncated_tail_at.is_none());
    }

    #[test]
    fn out_of_order_record_on_disk_is_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.jsonl");
        let lines: Vec<String> = [row(60, Some(1.0)), row(0, Some(2.0)), row(120, Some(3.0))]
            .iter()
            .map(|r| serde_json::to_string(r).unwrap())
            .collect();
        std::fs::write(&path, lines.join("\n") + "\n").unwrap();

        let (_, report) = store_in(&dir);
        assert_eq!(report.rows.len(), 2);
        assert_eq!(report.skipped.len(), 1);
        assert!(report.skipped[0].reason.contains("older"));
    }

    #[test]
    fn complete_record_without_newline_is_kept() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.jsonl");
        std::fs::write(&path, serde_json::to_string(&row(0, Some(1.0))).unwrap()).unwrap();

        let (mut store, report) = store_in(&dir);
        assert_eq!(report.rows.len(), 1);
        assert!(report.missing_final_newline);

        store.append(row(60, Some(2.0))).unwrap();
        let (_, report) = store_in(&dir);
        assert_eq!(report.rows.len(), 2);
        assert!(report.skipped.is_empty());
    }

    #[test]
    fn persist_failure_still_updates_memory() {
        let dir = TempDir::new().unwrap();
        // parent directory does not exist, so every open fails
        let (mut store, _) =
            HistoryStore::open(dir.path().join("gone").join("history.jsonl")).unwrap();

        let err = store.append(row(0, Some(1.0))).unwrap_err();
        assert!(matches!(err, HistoryError::Persist { .. }));
        assert_eq!(store.len(), 1);

        // ordering is still enforced against the in-memory row
        assert!(matches!(
            store.append(row(-60, Some(1.0))),
            Err(HistoryError::OutOfOrder { .. })
        ));
    }

    #[test]
    fn view_is_a_stable_prefix() {
        let dir = TempDir::new().unwrap();
        let (mut store, _) = store_in(&dir);
        store.append(row(0, Some(1.0))).unwrap();
        let before = store.view();
        store.append(row(60, Some(2.0))).unwrap();

        assert_eq!(before.len(), 1);
        assert_eq!(before.rows().len(), 1);
        assert_eq!(before.last().unwrap().timestamp, ts(0));
        assert_eq!(store.view().len(), 2);
    }

    #[test]
    fn view_since_filters_by_time() {
        let dir = TempDir::new().unwrap();
        let (mut store, _) = store_in(&dir);
        for i in 0..5 {
            store.append(row(i * 60, Some(i as f64))).unwrap();
        }
        let view = store.view();
        let recent = view.since(ts(0) + Duration::seconds(150));
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].timestamp, ts(180));
        assert!(HistoryView::empty().last().is_none());
    }
}
