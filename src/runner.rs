//! Newline-delimited JSON event loop: one write event in, one report out.

use std::future::Future;
use std::io;

use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{info, warn};

use crate::limits::MAX_EVENT_LINE_LEN;
use crate::model::WriteEvent;
use crate::store::{ItemStore, StoreError};
use crate::trigger::{check_event, AppliedPatch, TriggerError, TriggerHandler, TriggerOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    Validated,
    Revalidated,
    Ignored,
    Error,
}

/// One output line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub project_id: String,
    pub item_id: String,
    pub status: ReportStatus,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub patches: Vec<AppliedPatch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Report {
    fn failed(project_id: &str, item_id: &str, error: impl ToString) -> Self {
        Self {
            project_id: project_id.to_string(),
            item_id: item_id.to_string(),
            status: ReportStatus::Error,
            patches: Vec::new(),
            error: Some(error.to_string()),
        }
    }

    fn from_outcome(event: &WriteEvent, outcome: TriggerOutcome) -> Self {
        let (status, patches) = match outcome {
            TriggerOutcome::Validated(applied) => (ReportStatus::Validated, vec![applied]),
            TriggerOutcome::Revalidated(applied) => (ReportStatus::Revalidated, applied),
            TriggerOutcome::Ignored => (ReportStatus::Ignored, Vec::new()),
        };
        Self {
            project_id: event.project_id.clone(),
            item_id: event.item_id.clone(),
            status,
            patches,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub events: u64,
    pub errors: u64,
}

/// Store the write carried by `event`, filling in `before` from the store
/// when the producer left it out.
async fn apply_write(store: &dyn ItemStore, event: &mut WriteEvent) -> Result<(), StoreError> {
    let previous = match &event.after {
        Some(after) => store.put_item(&event.project_id, after.clone()).await?,
        None => store.delete_item(&event.project_id, &event.item_id).await?,
    };
    if event.before.is_none() {
        event.before = previous;
    }
    Ok(())
}

async fn process_line(handler: &TriggerHandler, line: &str) -> Report {
    let mut event: WriteEvent = match serde_json::from_str(line) {
        Ok(event) => event,
        Err(e) => return Report::failed("", "", format!("malformed event: {e}")),
    };
    if let Err(e) = check_event(&event) {
        return Report::failed(&event.project_id, &event.item_id, e);
    }
    if let Err(e) = apply_write(handler.store().as_ref(), &mut event).await {
        return Report::failed(&event.project_id, &event.item_id, TriggerError::Store(e));
    }
    match handler.handle(&event).await {
        Ok(outcome) => Report::from_outcome(&event, outcome),
        Err(e) => Report::failed(&event.project_id, &event.item_id, e),
    }
}

enum Line {
    Complete,
    TooLong,
    Eof,
}

/// Read one line into `buf`, holding at most `MAX_EVENT_LINE_LEN + 1` bytes.
/// The rest of an over-long line is read and dropped.
async fn read_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<Line>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let limit = MAX_EVENT_LINE_LEN as u64 + 1;
    let n = (&mut *reader).take(limit).read_until(b'\n', buf).await?;
    if n == 0 {
        return Ok(Line::Eof);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
    }
    if buf.len() <= MAX_EVENT_LINE_LEN {
        return Ok(Line::Complete);
    }

    let mut rest = Vec::new();
    loop {
        rest.clear();
        let n = (&mut *reader).take(limit).read_until(b'\n', &mut rest).await?;
        if n == 0 || rest.last() == Some(&b'\n') {
            return Ok(Line::TooLong);
        }
    }
}

async fn write_report<W: AsyncWrite + Unpin>(writer: &mut W, report: &Report) -> io::Result<()> {
    let mut out = serde_json::to_vec(report).map_err(io::Error::other)?;
    out.push(b'\n');
    writer.write_all(&out).await?;
    writer.flush().await
}

/// Process events until `reader` is exhausted. Bad lines produce an error
/// report and processing continues; only I/O failures end the loop early.
pub async fn run<R, W>(handler: &TriggerHandler, reader: R, writer: W) -> io::Result<RunStats>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    run_until(handler, reader, writer, std::future::pending()).await
}

/// Like [`run`], but also stops once `shutdown` completes. Shutdown is only
/// observed between events: an event whose line has been read is stored,
/// validated and reported before the loop exits.
pub async fn run_until<R, W, S>(
    handler: &TriggerHandler,
    mut reader: R,
    mut writer: W,
    shutdown: S,
) -> io::Result<RunStats>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
    S: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let mut stats = RunStats::default();
    let mut buf = Vec::new();
    loop {
        let line = tokio::select! {
            biased;
            _ = &mut shutdown => {
                info!("shutdown requested, event loop stopping");
                break;
            }
            line = read_line(&mut reader, &mut buf) => line?,
        };

        let report = match line {
            Line::Eof => break,
            Line::TooLong => Report::failed("", "", "event line too long"),
            Line::Complete => match std::str::from_utf8(&buf) {
                Ok(text) if text.trim().is_empty() => continue,
                Ok(text) => process_line(handler, text.trim()).await,
                Err(e) => Report::failed("", "", format!("event line is not UTF-8: {e}")),
            },
        };

        stats.events += 1;
        if report.status == ReportStatus::Error {
            stats.errors += 1;
            warn!(
                project_id = %report.project_id,
                item_id = %report.item_id,
                error = report.error.as_deref().unwrap_or_default(),
                "event rejected"
            );
        }
        write_report(&mut writer, &report).await?;
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::notify::NotifyHub;
    use crate::store::InMemoryStore;

    const VALID_WRITE: &str = r#"{"projectId":"p1","itemId":"d","after":{"id":"d","startDate":"2024-01-01","endDate":"2024-01-02"}}"#;

    async fn run_lines(store: Arc<InMemoryStore>, input: &str) -> (RunStats, Vec<serde_json::Value>) {
        run_bytes(store, input.as_bytes()).await
    }

    async fn run_bytes(store: Arc<InMemoryStore>, input: &[u8]) -> (RunStats, Vec<serde_json::Value>) {
        let handler = TriggerHandler::new(store, Arc::new(NotifyHub::new()));
        let mut out = Vec::new();
        let stats = run(&handler, input, &mut out).await.unwrap();
        let reports = String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        (stats, reports)
    }

    #[tokio::test]
    async fn writes_are_stored_and_reported() {
        let store = Arc::new(InMemoryStore::new());
        let input = concat!(
            r#"{"projectId":"p1","itemId":"a","after":{"id":"a","name":"Demo","startDate":"2024-01-01","endDate":"2024-01-10","dependencies":["a"]}}"#,
            "\n\n",
            r#"{"projectId":"p2","itemId":"b","after":{"id":"b","startDate":"2024-01-01","endDate":"2024-01-10","assignedResourceIds":["R1"]}}"#,
            "\n",
        );
        let (stats, reports) = run_lines(store.clone(), input).await;
        assert_eq!(stats, RunStats { events: 2, errors: 0 });

        assert_eq!(reports[0]["status"], "validated");
        assert_eq!(
            reports[0]["patches"][0]["patch"],
            serde_json::json!({ "validationError": "Circular dependency detected." })
        );
        assert_eq!(
            reports[1]["patches"][0]["patch"]["conflict"],
            serde_json::json!({ "isConflict": false, "conflictingItems": [] })
        );
        assert_eq!(
            store.get("p1", "a").unwrap().validation_error.as_deref(),
            Some("Circular dependency detected.")
        );
    }

    #[tokio::test]
    async fn bad_lines_do_not_stop_the_loop() {
        let store = Arc::new(InMemoryStore::new());
        let input = concat!(
            "not json\n",
            r#"{"projectId":"p1","itemId":"a","after":{"id":"zzz","startDate":"2024-01-01","endDate":"2024-01-02"}}"#,
            "\n",
            r#"{"projectId":"p1","itemId":"c","after":{"id":"c","startDate":"?","endDate":"2024-01-02"}}"#,
            "\n",
            r#"{"projectId":"p1","itemId":"d","after":{"id":"d","startDate":"2024-01-01","endDate":"2024-01-02"}}"#,
            "\n",
        );
        let (stats, reports) = run_lines(store.clone(), input).await;
        assert_eq!(stats, RunStats { events: 4, errors: 3 });
        assert_eq!(reports[0]["status"], "error");
        assert_eq!(reports[1]["status"], "error");
        assert!(store.get("p1", "zzz").is_none());
        // The write itself is kept; only validation failed.
        assert_eq!(reports[2]["status"], "error");
        assert!(store.get("p1", "c").is_some());
        assert_eq!(reports[3]["status"], "validated");
    }

    #[tokio::test]
    async fn delete_fills_before_from_store() {
        let store = Arc::new(InMemoryStore::new());
        let input = concat!(
            r#"{"projectId":"p1","itemId":"x","after":{"id":"x","startDate":"2024-01-01","endDate":"2024-01-10","assignedResourceIds":["R1"]}}"#,
            "\n",
            r#"{"projectId":"p2","itemId":"y","after":{"id":"y","startDate":"2024-01-05","endDate":"2024-01-12","assignedResourceIds":["R1"]}}"#,
            "\n",
            r#"{"projectId":"p1","itemId":"x","after":{"id":"x","startDate":"2024-01-01","endDate":"2024-01-10","assignedResourceIds":["R1"]}}"#,
            "\n",
            r#"{"projectId":"p2","itemId":"y"}"#,
            "\n",
        );
        let (_, reports) = run_lines(store.clone(), input).await;
        assert_eq!(
            reports[2]["patches"][0]["patch"]["conflict"]["conflictingItems"],
            serde_json::json!([{ "projectId": "p2", "itemId": "y" }])
        );
        assert_eq!(reports[3]["status"], "revalidated");
        assert_eq!(reports[3]["patches"][0]["itemId"], "x");
        assert!(!store.get("p1", "x").unwrap().conflict.unwrap().is_conflict);
    }

    #[tokio::test]
    async fn non_utf8_line_is_reported_and_skipped() {
        let store = Arc::new(InMemoryStore::new());
        let mut input = b"\xff\xfe garbage\n".to_vec();
        input.extend_from_slice(VALID_WRITE.as_bytes());
        input.push(b'\n');

        let (stats, reports) = run_bytes(store.clone(), &input).await;
        assert_eq!(stats, RunStats { events: 2, errors: 1 });
        assert_eq!(reports[0]["status"], "error");
        assert!(reports[0]["error"].as_str().unwrap().contains("UTF-8"));
        assert_eq!(reports[1]["status"], "validated");
        assert!(store.get("p1", "d").is_some());
    }

    #[tokio::test]
    async fn over_long_line_is_rejected_and_skipped() {
        let store = Arc::new(InMemoryStore::new());
        let mut input = vec![b'x'; MAX_EVENT_LINE_LEN + 10];
        input.push(b'\n');
        input.extend_from_slice(VALID_WRITE.as_bytes());

        let (stats, reports) = run_bytes(store.clone(), &input).await;
        assert_eq!(stats, RunStats { events: 2, errors: 1 });
        assert_eq!(reports[0]["error"], "event line too long");
        assert_eq!(reports[1]["status"], "validated");
    }

    #[tokio::test]
    async fn line_at_the_limit_is_accepted() {
        let store = Arc::new(InMemoryStore::new());
        let mut line = VALID_WRITE.as_bytes().to_vec();
        line.resize(MAX_EVENT_LINE_LEN, b' ');
        line.push(b'\n');

        let (stats, reports) = run_bytes(store, &line).await;
        assert_eq!(stats, RunStats { events: 1, errors: 0 });
        assert_eq!(reports[0]["status"], "validated");
    }

    #[tokio::test]
    async fn shutdown_stops_between_events() {
        let store = Arc::new(InMemoryStore::new());
        let handler = TriggerHandler::new(store.clone(), Arc::new(NotifyHub::new()));
        let (mut input_tx, input_rx) = tokio::io::duplex(4096);
        let (output_tx, output_rx) = tokio::io::duplex(4096);
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

        let driver = async move {
            input_tx.write_all(VALID_WRITE.as_bytes()).await.unwrap();
            input_tx.write_all(b"\n").await.unwrap();
            let mut reports = tokio::io::BufReader::new(output_rx).lines();
            let first = reports.next_line().await.unwrap().unwrap();
            // Input stays open; only the signal ends the loop.
            stop_tx.send(()).unwrap();
            (first, input_tx)
        };
        let shutdown = async move {
            let _ = stop_rx.await;
        };
        let (stats, (first, _input_tx)) = tokio::join!(
            run_until(&handler, tokio::io::BufReader::new(input_rx), output_tx, shutdown),
            driver,
        );

        assert_eq!(stats.unwrap(), RunStats { events: 1, errors: 0 });
        let report: serde_json::Value = serde_json::from_str(&first).unwrap();
        assert_eq!(report["status"], "validated");
        assert!(store.get("p1", "d").is_some());
    }
}
