//! ==============================================================================
//! server.rs - dashboard and json api
//! ==============================================================================
//!
//! purpose:
//!     thin read-only web layer over the published snapshot. handlers only
//!     clone what the poller already published; they never trigger a read.
//!
//! routes:
//!     GET /              - auto-refreshing html table of the latest row
//!     GET /api/snapshot  - latest row (null before the first one)
//!     GET /api/history   - rows, optional ?hours= and ?limit= filters
//!     GET /api/health    - persistence/source counters
//!
//! ==============================================================================

use crate::domain::SampleRow;
use crate::health::{HealthTracker, HostHealth};
use crate::history::HistoryView;
use crate::publisher::SnapshotReader;

use anyhow::Result;
use axum::{
    extract::{Query, State},
    response::{Html, Json},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

/// far beyond any real history, keeps the cutoff arithmetic in range
const MAX_HOURS: u64 = 24 * 365 * 100;

#[derive(Clone)]
pub struct ServerState {
    pub reader: SnapshotReader,
    pub health: HealthTracker,
    /// browser refresh period for the html page
    pub refresh_seconds: u64,
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/", get(dashboard_handler))
        .route("/api/snapshot", get(snapshot_handler))
        .route("/api/history", get(history_handler))
        .route("/api/health", get(health_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run_server(bind: &str, state: ServerState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!("[SERVER] Dashboard live at http://{}", listener.local_addr()?);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// json api endpoint for the latest complete row
pub async fn snapshot_handler(State(state): State<ServerState>) -> Json<Option<SampleRow>> {
    Json(state.reader.current_snapshot().map(|r| (*r).clone()))
}

#[derive(Debug, Deserialize, Default)]
pub struct HistoryParams {
    /// only rows from the last N hours
    pub hours: Option<u64>,
    /// only the last N rows
    pub limit: Option<usize>,
}

pub async fn history_handler(
    State(state): State<ServerState>,
    Query(params): Query<HistoryParams>,
) -> Json<Vec<SampleRow>> {
    let snapshot = state.reader.current();
    let rows = select_rows(&snapshot.history, &params, Utc::now());
    Json(rows.iter().map(|r| (**r).clone()).collect())
}

pub async fn health_handler(State(state): State<ServerState>) -> Json<HostHealth> {
    let len = state.reader.current().history.len();
    Json(state.health.get_health(len))
}

/// Apply the view filters. The stored history itself is never trimmed.
pub fn select_rows(
    history: &HistoryView,
    params: &HistoryParams,
    now: DateTime<Utc>,
) -> Vec<Arc<SampleRow>> {
    let mut rows = match params.hours {
        Some(h) => history.since(now - chrono::Duration::hours(h.min(MAX_HOURS) as i64)),
        None => history.rows(),
    };
    if let Some(limit) = params.limit {
        if rows.len() > limit {
            rows.drain(..rows.len() - limit);
        }
    }
    rows
}

pub async fn dashboard_handler(State(state): State<ServerState>) -> Html<String> {
    let snapshot = state.reader.current();
    let degraded = state.health.is_degraded();
    Html(render_dashboard(
        snapshot.row.as_deref(),
        snapshot.history.len(),
        degraded,
        state.refresh_seconds,
    ))
}

fn render_dashboard(
    row: Option<&SampleRow>,
    history_len: usize,
    degraded: bool,
    refresh_seconds: u64,
) -> String {
    let body = match row {
        Some(row) => {
            let cells: String = row
                .readings
                .iter()
                .map(|r| {
                    let value = match r.value {
                        Some(v) => format!("{:.1} °C", v),
                        None => format!(
                            "<span class=\"absent\">-- ({})</span>",
                            html_escape(r.error.as_deref().unwrap_or("no data"))
                        ),
                    };
                    format!("<tr><td>{}</td><td>{}</td></tr>", html_escape(&r.source_id), value)
                })
                .collect();
            format!(
                "<p>Last update: {}</p><table>{}</table>",
                row.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
                cells
            )
        }
        None => "<p>No data yet.</p>".to_string(),
    };

    let banner = if degraded {
        "<p class=\"degraded\">⚠ history is not being saved to disk</p>"
    } else {
        ""
    };

    format!(
        r#"<!doctype html>
<html>
<head>
<meta charset="utf-8">
<meta http-equiv="refresh" content="{refresh}">
<title>climate</title>
<style>
body {{ font-family: system-ui; padding: 2rem; background: #000; color: #eee; }}
td {{ padding: 0.3rem 1rem; font-size: 1.5rem; }}
.absent {{ color: #888; }}
.degraded {{ color: #ff6b6b; }}
</style>
</head>
<body>
{banner}
{body}
<p style="color: #888;">{len} rows recorded</p>
</body>
</html>"#,
        refresh = refresh_seconds,
        banner = banner,
        body = body,
        len = history_len,
    )
}

/// escape html special characters to prevent xss
fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Reading;
    use crate::history::HistoryStore;
    use crate::publisher::{self, Snapshot};
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn row(secs: i64) -> SampleRow {
        let t = ts(secs);
        SampleRow::new(
            t,
            vec![
                Reading::present("sensor-A", t, 21.3),
                Reading::absent("sensor-<B>", t, "timed out"),
            ],
        )
    }

    fn state_with_rows(dir: &TempDir, n: i64) -> ServerState {
        let (mut store, _) = HistoryStore::open(dir.path().join("h.jsonl")).unwrap();
        for i in 0..n {
            store.append(row(i * 3600)).unwrap();
        }
        let (_publisher, reader) = publisher::channel(Snapshot::from_history(store.view()));
        ServerState {
            reader,
            health: HealthTracker::new(),
            refresh_seconds: 65,
        }
    }

    #[tokio::test]
    async fn snapshot_is_null_before_first_row() {
        let dir = TempDir::new().unwrap();
        let state = state_with_rows(&dir, 0);
        let Json(row) = snapshot_handler(State(state)).await;
        assert!(row.is_none());
    }

    #[tokio::test]
    async fn snapshot_returns_latest_row() {
        let dir = TempDir::new().unwrap();
        let state = state_with_rows(&dir, 3);
        let Json(row) = snapshot_handler(State(state)).await;
        assert_eq!(row.unwrap().timestamp, ts(7200));
    }

    #[tokio::test]
    async fn history_filters() {
        let dir = TempDir::new().unwrap();
        let state = state_with_rows(&dir, 10);

        let Json(all) =
            history_handler(State(state.clone()), Query(HistoryParams::default())).await;
        assert_eq!(all.len(), 10);

        let Json(last3) = history_handler(
            State(state),
            Query(HistoryParams {
                hours: None,
                limit: Some(3),
            }),
        )
        .await;
        assert_eq!(last3.len(), 3);
        assert_eq!(last3[0].timestamp, ts(7 * 3600));
    }

    #[test]
    fn select_rows_by_hours() {
        let dir = TempDir::new().unwrap();
        let state = state_with_rows(&dir, 10);
        let view = state.reader.current().history.clone();
        // "now" is one hour after the last row
        let now = ts(10 * 3600);
        let params = HistoryParams {
            hours: Some(3),
            limit: None,
        };
        let rows = select_rows(&view, &params, now);
        assert_eq!(rows.len(), 3);

        let params = HistoryParams {
            hours: Some(3),
            limit: Some(1),
        };
        assert_eq!(select_rows(&view, &params, now).len(), 1);
    }

    #[tokio::test]
    async fn health_reports_history_len() {
        let dir = TempDir::new().unwrap();
        let state = state_with_rows(&dir, 4);
        state.health.mark_persist_failed();
        let Json(health) = health_handler(State(state)).await;
        assert_eq!(health.history_len, 4);
        assert!(health.persistence_degraded);
    }

    #[tokio::test]
    async fn dashboard_escapes_and_flags_degraded() {
        let dir = TempDir::new().unwrap();
        let state = state_with_rows(&dir, 1);
        state.health.mark_persist_failed();
        let Html(page) = dashboard_handler(State(state)).await;
        assert!(page.contains("21.3 °C"));
        assert!(page.contains("sensor-&lt;B&gt;"));
        assert!(page.contains("timed out"));
        assert!(page.contains("not being saved"));
        assert!(page.contains("content=\"65\""));
    }

    #[test]
    fn empty_dashboard() {
        let page = render_dashboard(None, 0, false, 60);
        assert!(page.contains("No data yet."));
        assert!(!page.contains("degraded\">"));
    }
}
