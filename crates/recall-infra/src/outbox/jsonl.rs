//! JSON-lines outbox and dead-letter logs.
//!
//! Two append-only files in one directory: `outbox.jsonl` holds
//! version-tagged [`OutboxRecord`] events and `dead_letter.jsonl` holds
//! [`DeadLetterRecord`]s. Every append is flushed with `sync_data` before it
//! returns. A torn or corrupt line (e.g. from a crash mid-write) is skipped
//! with a warning; a record from a newer schema version is refused.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use recall_core::outbox::OutboxLog;
use recall_types::error::OutboxError;
use recall_types::outbox::{
    DeadLetterEntry, DeadLetterRecord, OutboxEntry, OutboxEvent, OutboxRecord,
    OUTBOX_RECORD_VERSION,
};

pub const OUTBOX_FILE: &str = "outbox.jsonl";
pub const DEAD_LETTER_FILE: &str = "dead_letter.jsonl";

/// File-backed [`OutboxLog`].
pub struct JsonlOutboxLog {
    dir: PathBuf,
    // Serializes appends and compaction across both files.
    write_lock: Mutex<()>,
}

impl JsonlOutboxLog {
    /// Use `dir` for the log files, creating it if needed.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, OutboxError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await.map_err(io_error)?;
        debug!(dir = %dir.display(), "Outbox log directory ready");
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn outbox_path(&self) -> PathBuf {
        self.dir.join(OUTBOX_FILE)
    }

    pub fn dead_letter_path(&self) -> PathBuf {
        self.dir.join(DEAD_LETTER_FILE)
    }

    async fn append_line(&self, path: &Path, line: String) -> Result<(), OutboxError> {
        let _guard = self.write_lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(io_error)?;
        let mut bytes = line.into_bytes();
        bytes.push(b'\n');
        file.write_all(&bytes).await.map_err(io_error)?;
        file.sync_data().await.map_err(io_error)
    }
}

impl OutboxLog for JsonlOutboxLog {
    async fn append(&self, record: &OutboxRecord) -> Result<(), OutboxError> {
        let line = serde_json::to_string(record).map_err(serialization_error)?;
        self.append_line(&self.outbox_path(), line).await
    }

    async fn load(&self) -> Result<Vec<OutboxRecord>, OutboxError> {
        read_records(&self.outbox_path()).await
    }

    async fn compact(&self, pending: &[OutboxEntry]) -> Result<(), OutboxError> {
        let mut content = String::new();
        for entry in pending {
            let record = OutboxRecord::new(
                OutboxEvent::Enqueued {
                    entry: entry.clone(),
                },
                entry.enqueued_at,
            );
            content.push_str(&serde_json::to_string(&record).map_err(serialization_error)?);
            content.push('\n');
        }

        let _guard = self.write_lock.lock().await;
        let path = self.outbox_path();
        let tmp = path.with_extension("jsonl.tmp");
        let mut file = tokio::fs::File::create(&tmp).await.map_err(io_error)?;
        file.write_all(content.as_bytes()).await.map_err(io_error)?;
        file.sync_data().await.map_err(io_error)?;
        drop(file);
        tokio::fs::rename(&tmp, &path).await.map_err(io_error)?;
        sync_dir(&self.dir).await?;
        debug!(entries = pending.len(), "Compacted outbox log");
        Ok(())
    }

    async fn append_dead_letter(&self, dead_letter: &DeadLetterEntry) -> Result<(), OutboxError> {
        let record = DeadLetterRecord::new(dead_letter.clone());
        let line = serde_json::to_string(&record).map_err(serialization_error)?;
        self.append_line(&self.dead_letter_path(), line).await
    }

    async fn load_dead_letters(&self) -> Result<Vec<DeadLetterEntry>, OutboxError> {
        let records: Vec<DeadLetterRecord> = read_records(&self.dead_letter_path()).await?;
        Ok(records.into_iter().map(|r| r.dead_letter).collect())
    }
}

/// Flush directory metadata so a completed rename survives a crash.
#[cfg(unix)]
async fn sync_dir(dir: &Path) -> Result<(), OutboxError> {
    let dir = tokio::fs::File::open(dir).await.map_err(io_error)?;
    dir.sync_all().await.map_err(io_error)
}

// Directory handles cannot be synced here; the rename is as durable as the
// platform makes it.
#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> Result<(), OutboxError> {
    Ok(())
}

/// Parse every line of a log file. A missing file is an empty log.
async fn read_records<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, OutboxError> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_error(e)),
    };

    let mut records = Vec::new();
    for (index, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        if let Some(record) = parse_line(line, path, index + 1)? {
            records.push(record);
        }
    }
    Ok(records)
}

fn parse_line<T: DeserializeOwned>(
    line: &str,
    path: &Path,
    line_no: usize,
) -> Result<Option<T>, OutboxError> {
    let value: serde_json::Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => {
            warn!(path = %path.display(), line = line_no, error = %e, "Skipping corrupt outbox line");
            return Ok(None);
        }
    };

    match value.get("v").and_then(serde_json::Value::as_u64) {
        Some(v) if v == u64::from(OUTBOX_RECORD_VERSION) => {}
        Some(v) => {
            return Err(OutboxError::Unsupported(format!(
                "{}:{line_no}: record version {v} (supported: {OUTBOX_RECORD_VERSION})",
                path.display()
            )));
        }
        None => {
            warn!(path = %path.display(), line = line_no, "Skipping outbox line without version tag");
            return Ok(None);
        }
    }

    match serde_json::from_value(value) {
        Ok(record) => Ok(Some(record)),
        Err(e) => {
            warn!(path = %path.display(), line = line_no, error = %e, "Skipping malformed outbox record");
            Ok(None)
        }
    }
}

fn io_error(e: std::io::Error) -> OutboxError {
    OutboxError::Io(e.to_string())
}

fn serialization_error(e: serde_json::Error) -> OutboxError {
    OutboxError::Serialization(e.to_string())
}
