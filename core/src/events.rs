//! Append-only observability log. Every dispatch lands at least an input
//! and an output envelope here; the log is the authoritative history and
//! the in-memory session map is a rebuildable cache.

use std::io::Error as IoError;
use std::path::Path;
use std::path::PathBuf;

use chrono::SecondsFormat;
use chrono::Utc;
use serde_json::Value as JsonValue;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tokio::sync::mpsc::Sender;
use warden_protocol::EventKind;
use warden_protocol::EventRecord;

const EVENTS_SUBDIR: &str = "observability";
const EVENTS_FILE: &str = "events.jsonl";

/// Writes event rows as JSONL, flushing after every line. A dedicated task
/// owns the file handle so appends stay strictly monotonic per writer.
#[derive(Clone)]
pub struct EventLog {
    tx: Sender<String>,
    path: PathBuf,
}

impl EventLog {
    pub async fn new(state_root: &Path) -> std::io::Result<Self> {
        let dir = state_root.join(EVENTS_SUBDIR);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(EVENTS_FILE);

        let file = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)?;

        let (tx, mut rx) = mpsc::channel::<String>(256);

        tokio::task::spawn(async move {
            let mut file = tokio::fs::File::from_std(file);

            while let Some(line) = rx.recv().await {
                if let Err(e) = file.write_all(line.as_bytes()).await {
                    tracing::warn!("event log writer: failed to write line: {e}");
                    break;
                }
                if let Err(e) = file.write_all(b"\n").await {
                    tracing::warn!("event log writer: failed to write newline: {e}");
                    break;
                }
                if let Err(e) = file.flush().await {
                    tracing::warn!("event log writer: failed to flush: {e}");
                    break;
                }
            }
        });

        Ok(Self { tx, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(
        &self,
        kind: EventKind,
        run_session_id: &str,
        work_id: &str,
        agent_id: &str,
        payload: JsonValue,
    ) -> std::io::Result<()> {
        let record = EventRecord {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            kind,
            run_session_id: run_session_id.to_string(),
            work_id: work_id.to_string(),
            agent_id: agent_id.to_string(),
            payload,
        };
        let json = serde_json::to_string(&record)
            .map_err(|e| IoError::other(format!("failed to serialize event record: {e}")))?;
        self.tx
            .send(json)
            .await
            .map_err(|e| IoError::other(format!("failed to queue event record: {e}")))
    }
}

/// Read the full log back, skipping rows that no longer parse (the log may
/// span schema versions).
pub async fn replay(path: &Path) -> std::io::Result<Vec<EventRecord>> {
    let file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut lines = BufReader::new(file).lines();
    let mut records = Vec::new();
    while let Some(line) = lines.next_line().await? {
        match serde_json::from_str::<EventRecord>(&line) {
            Ok(record) => records.push(record),
            Err(e) => tracing::warn!("skipping unparseable event row: {e}"),
        }
    }
    Ok(records)
}
