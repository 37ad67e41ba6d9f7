//! Audit log backends and the writer thread that serialises access to them.

use crate::config::AuditBackend;
use rollcall_core::audit::AUDIT_COLUMNS;
use rollcall_core::{AuditError, AuditRecord, AuditSink};
use rusqlite::{params, Connection};
use std::fs::{File, OpenOptions};
use std::path::Path;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Append-only CSV log. The header is written only when the file is empty,
/// so restarts keep appending to the same log.
pub struct CsvAuditSink {
    writer: csv::Writer<File>,
}

impl CsvAuditSink {
    pub fn open(path: &Path) -> Result<Self, AuditError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let empty = file.metadata()?.len() == 0;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if empty {
            writer.write_record(AUDIT_COLUMNS).map_err(csv_err)?;
            writer.flush()?;
        }
        Ok(Self { writer })
    }
}

impl AuditSink for CsvAuditSink {
    fn record(&mut self, record: &AuditRecord) -> Result<(), AuditError> {
        self.writer
            .write_record(record.fields())
            .map_err(csv_err)?;
        // One line per observation should survive a crash.
        self.writer.flush()?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), AuditError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }
}

fn csv_err(e: csv::Error) -> AuditError {
    AuditError::Store(e.to_string())
}

/// SQLite log: one row per observation in `audit_log`.
pub struct SqliteAuditSink {
    conn: Connection,
}

impl SqliteAuditSink {
    pub fn open(path: &Path) -> Result<Self, AuditError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(store_err)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS audit_log (
                 id         INTEGER PRIMARY KEY AUTOINCREMENT,
                 ts         TEXT NOT NULL,
                 user_id    INTEGER,
                 name       TEXT NOT NULL,
                 distance   REAL,
                 confidence REAL,
                 event      TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_audit_log_user ON audit_log(user_id);",
        )
        .map_err(store_err)?;
        Ok(Self { conn })
    }
}

impl AuditSink for SqliteAuditSink {
    fn record(&mut self, record: &AuditRecord) -> Result<(), AuditError> {
        let [ts, ..] = record.fields();
        self.conn
            .execute(
                "INSERT INTO audit_log (ts, user_id, name, distance, confidence, event)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    ts,
                    record.identity_id,
                    record.display_name,
                    record.distance,
                    record.confidence,
                    record.event.as_str(),
                ],
            )
            .map_err(store_err)?;
        Ok(())
    }
}

fn store_err(e: rusqlite::Error) -> AuditError {
    AuditError::Store(e.to_string())
}

/// Open the configured backend at `path`.
pub fn open_sink(path: &Path, backend: AuditBackend) -> Result<Box<dyn AuditSink>, AuditError> {
    let sink: Box<dyn AuditSink> = match backend {
        AuditBackend::Csv => Box::new(CsvAuditSink::open(path)?),
        AuditBackend::Sqlite => Box::new(SqliteAuditSink::open(path)?),
    };
    tracing::info!(path = %path.display(), ?backend, "audit log opened");
    Ok(sink)
}

#[derive(Error, Debug)]
pub enum AuditWriterError {
    #[error("audit writer thread exited")]
    Closed,
    #[error(transparent)]
    Sink(#[from] AuditError),
}

enum AuditRequest {
    Record(AuditRecord),
    Flush {
        reply: oneshot::Sender<Result<(), AuditError>>,
    },
}

/// Clone-safe handle to the audit writer thread.
#[derive(Clone)]
pub struct AuditHandle {
    tx: mpsc::Sender<AuditRequest>,
}

impl AuditHandle {
    /// Queue one record. Write errors are logged by the writer thread.
    pub async fn record(&self, record: AuditRecord) -> Result<(), AuditWriterError> {
        self.tx
            .send(AuditRequest::Record(record))
            .await
            .map_err(|_| AuditWriterError::Closed)
    }

    /// Wait until every queued record has been written and flushed.
    pub async fn flush(&self) -> Result<(), AuditWriterError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(AuditRequest::Flush { reply: reply_tx })
            .await
            .map_err(|_| AuditWriterError::Closed)?;
        Ok(reply_rx.await.map_err(|_| AuditWriterError::Closed)??)
    }
}

/// Run `sink` on a dedicated OS thread. The thread exits, flushing once
/// more, when every handle has been dropped.
pub fn spawn_audit_writer(
    mut sink: Box<dyn AuditSink>,
) -> std::io::Result<(AuditHandle, std::thread::JoinHandle<()>)> {
    let (tx, mut rx) = mpsc::channel::<AuditRequest>(256);

    let join = std::thread::Builder::new()
        .name("rollcall-audit".into())
        .spawn(move || {
            tracing::debug!("audit writer started");
            while let Some(request) = rx.blocking_recv() {
                match request {
                    AuditRequest::Record(record) => {
                        if let Err(e) = sink.record(&record) {
                            tracing::error!(error = %e, event = %record.event, "audit write failed");
                        }
                    }
                    AuditRequest::Flush { reply } => {
                        let _ = reply.send(sink.flush());
                    }
                }
            }
            if let Err(e) = sink.flush() {
                tracing::error!(error = %e, "final audit flush failed");
            }
            tracing::debug!("audit writer stopped");
        })?;

    Ok((AuditHandle { tx }, join))
}
