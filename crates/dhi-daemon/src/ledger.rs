//! Persistent VEIL ledger backed by `SQLite` under a single-writer task.
//!
//! The ledger store is the sole shared mutable resource in the daemon.
//! All writes flow through one dedicated writer thread that owns the
//! connection; callers talk to it over a channel, which preserves write
//! ordering and hides the WAL discipline from the rest of the system.
//! Readers open their own read-only connections; WAL mode supports them
//! concurrently with the serialized writer.
//!
//! The behavioral eligibility invariant is enforced here a second time:
//! a behavioral row that is not reproducible, or that carries a noise
//! class, is rejected at the write boundary regardless of what the
//! caller computed.

use std::path::{Path, PathBuf};

use dhi_core::ledger::{LedgerEvent, PersistenceClass, SignalType};
use dhi_core::verification::FailureClass;
use rusqlite::{Connection, OpenFlags, params};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info};

/// Depth of the writer command queue.
const WRITE_QUEUE_DEPTH: usize = 256;

/// Errors from the ledger write and read paths.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LedgerError {
    /// Underlying store failure.
    #[error("ledger store failure: {message}")]
    Store {
        /// What the store reported.
        message: String,
    },

    /// The writer task is gone; the daemon is shutting down.
    #[error("ledger writer unavailable")]
    WriterUnavailable,

    /// A behavioral write failed the determinism-gate invariant.
    #[error("behavioral event rejected: not reproducible or noise-class")]
    BehavioralGateViolation,
}

impl From<rusqlite::Error> for LedgerError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Store {
            message: err.to_string(),
        }
    }
}

enum WriteCommand {
    Record {
        event: Box<LedgerEvent>,
        reply: oneshot::Sender<Result<(), LedgerError>>,
    },
}

/// Cloneable handle to the single ledger writer task.
#[derive(Debug, Clone)]
pub struct LedgerHandle {
    tx: mpsc::Sender<WriteCommand>,
    path: PathBuf,
}

impl LedgerHandle {
    /// Opens the store, initializes the schema, and spawns the writer.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Store`] when the database cannot be opened
    /// or the schema cannot be created.
    pub fn spawn(path: &Path) -> Result<Self, LedgerError> {
        let conn = open_writer(path)?;
        let (tx, mut rx) = mpsc::channel::<WriteCommand>(WRITE_QUEUE_DEPTH);

        // The writer owns the connection for its whole life; rusqlite is
        // synchronous, so the loop runs on a dedicated OS thread.
        std::thread::Builder::new()
            .name("dhi-ledger-writer".to_string())
            .spawn(move || {
                while let Some(command) = rx.blocking_recv() {
                    match command {
                        WriteCommand::Record { event, reply } => {
                            let outcome = insert_event(&conn, &event);
                            if let Err(err) = &outcome {
                                error!(event_id = %event.event_id, error = %err, "ledger write failed");
                            }
                            let _ = reply.send(outcome);
                        },
                    }
                }
                info!("ledger writer stopped");
            })
            .map_err(|err| LedgerError::Store {
                message: format!("failed to spawn ledger writer: {err}"),
            })?;

        Ok(Self {
            tx,
            path: path.to_path_buf(),
        })
    }

    /// Records one event, awaiting durability.
    ///
    /// # Errors
    ///
    /// Returns the writer's outcome, or [`LedgerError::WriterUnavailable`]
    /// when the daemon is shutting down.
    pub async fn record(&self, event: LedgerEvent) -> Result<(), LedgerError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(WriteCommand::Record {
                event: Box::new(event),
                reply,
            })
            .await
            .map_err(|_| LedgerError::WriterUnavailable)?;
        response.await.map_err(|_| LedgerError::WriterUnavailable)?
    }

    /// Opens a read-only snapshot view of the store.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Store`] when the database cannot be opened.
    pub fn reader(&self) -> Result<LedgerReader, LedgerError> {
        LedgerReader::open(&self.path)
    }
}

fn open_writer(path: &Path) -> Result<Connection, LedgerError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|err| LedgerError::Store {
            message: format!("failed to create ledger directory: {err}"),
        })?;
    }
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    init_schema(&conn)?;
    Ok(conn)
}

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS veil_events (
            event_id TEXT PRIMARY KEY,
            request_id TEXT NOT NULL,
            fingerprint_hash TEXT NOT NULL,
            reproducible INTEGER NOT NULL,
            class TEXT NOT NULL,
            signal_type TEXT NOT NULL,
            failure_class TEXT,
            attempt_count INTEGER NOT NULL,
            summary TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_veil_events_request_id ON veil_events(request_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_veil_events_fingerprint ON veil_events(fingerprint_hash)",
        [],
    )?;
    Ok(())
}

fn insert_event(conn: &Connection, event: &LedgerEvent) -> Result<(), LedgerError> {
    if event.class == PersistenceClass::Behavioral && !event.behavioral_write_permitted() {
        return Err(LedgerError::BehavioralGateViolation);
    }

    conn.execute(
        "INSERT INTO veil_events (
            event_id, request_id, fingerprint_hash, reproducible, class,
            signal_type, failure_class, attempt_count, summary, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            event.event_id,
            event.request_id,
            event.fingerprint_hash,
            i32::from(event.reproducible),
            event.class.to_string(),
            event.signal_type.to_string(),
            event.failure_class.map(|c| c.to_string()),
            event.attempt_count,
            event.summary,
            event.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Read-only snapshot view over the ledger.
#[derive(Debug)]
pub struct LedgerReader {
    conn: Connection,
}

impl LedgerReader {
    /// Opens a read-only connection to the store.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Store`] when the database cannot be opened.
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self { conn })
    }

    /// All events for one request, in write order.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Store`] on query failure.
    pub fn events_for_request(&self, request_id: &str) -> Result<Vec<LedgerEvent>, LedgerError> {
        self.query(
            "SELECT event_id, request_id, fingerprint_hash, reproducible, class,
                    signal_type, failure_class, attempt_count, summary, created_at
             FROM veil_events WHERE request_id = ?1 ORDER BY rowid ASC",
            params![request_id],
        )
    }

    /// All behavioral events, in write order.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Store`] on query failure.
    pub fn behavioral_events(&self) -> Result<Vec<LedgerEvent>, LedgerError> {
        self.query(
            "SELECT event_id, request_id, fingerprint_hash, reproducible, class,
                    signal_type, failure_class, attempt_count, summary, created_at
             FROM veil_events WHERE class = 'behavioral' ORDER BY rowid ASC",
            params![],
        )
    }

    fn query(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<LedgerEvent>, LedgerError> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, |row| {
            let reproducible: i32 = row.get(3)?;
            let class: String = row.get(4)?;
            let signal: String = row.get(5)?;
            let failure: Option<String> = row.get(6)?;
            let created: String = row.get(9)?;
            Ok(LedgerEvent {
                event_id: row.get(0)?,
                request_id: row.get(1)?,
                fingerprint_hash: row.get(2)?,
                reproducible: reproducible != 0,
                class: parse_class(&class),
                signal_type: parse_signal(&signal),
                failure_class: failure.as_deref().and_then(parse_failure_class),
                attempt_count: row.get(7)?,
                summary: row.get(8)?,
                created_at: chrono::DateTime::parse_from_rfc3339(&created)
                    .map(|dt| dt.with_timezone(&chrono::Utc))
                    .unwrap_or_default(),
            })
        })?;
        Ok(rows.filter_map(Result::ok).collect())
    }
}

fn parse_class(raw: &str) -> PersistenceClass {
    match raw {
        "behavioral" => PersistenceClass::Behavioral,
        _ => PersistenceClass::Telemetry,
    }
}

fn parse_signal(raw: &str) -> SignalType {
    match raw {
        "success" => SignalType::Success,
        _ => SignalType::Failure,
    }
}

fn parse_failure_class(raw: &str) -> Option<FailureClass> {
    match raw {
        "syntax" => Some(FailureClass::Syntax),
        "policy" => Some(FailureClass::Policy),
        "timeout" => Some(FailureClass::Timeout),
        "flake" => Some(FailureClass::Flake),
        "deterministic" => Some(FailureClass::Deterministic),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(
        request_id: &str,
        class: PersistenceClass,
        reproducible: bool,
        failure: Option<FailureClass>,
    ) -> LedgerEvent {
        LedgerEvent::new(
            request_id,
            "fp-hash",
            reproducible,
            class,
            if failure.is_some() {
                SignalType::Failure
            } else {
                SignalType::Success
            },
            failure,
            1,
            "test event",
        )
    }

    #[tokio::test]
    async fn telemetry_and_behavioral_events_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("veil.db");
        let handle = LedgerHandle::spawn(&path).unwrap();

        handle
            .record(event("req-1", PersistenceClass::Telemetry, false, None))
            .await
            .unwrap();
        handle
            .record(event("req-1", PersistenceClass::Behavioral, true, None))
            .await
            .unwrap();

        let reader = handle.reader().unwrap();
        let events = reader.events_for_request("req-1").unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].class, PersistenceClass::Telemetry);
        assert_eq!(events[1].class, PersistenceClass::Behavioral);
        assert_eq!(events[1].signal_type, SignalType::Success);
    }

    #[tokio::test]
    async fn behavioral_write_without_reproducibility_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let handle = LedgerHandle::spawn(&dir.path().join("veil.db")).unwrap();

        let err = handle
            .record(event("req-1", PersistenceClass::Behavioral, false, None))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::BehavioralGateViolation));

        let reader = handle.reader().unwrap();
        assert!(reader.events_for_request("req-1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn behavioral_write_with_noise_class_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let handle = LedgerHandle::spawn(&dir.path().join("veil.db")).unwrap();

        let err = handle
            .record(event(
                "req-1",
                PersistenceClass::Behavioral,
                true,
                Some(FailureClass::Flake),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::BehavioralGateViolation));
    }

    #[tokio::test]
    async fn writes_for_one_request_preserve_order() {
        let dir = tempfile::tempdir().unwrap();
        let handle = LedgerHandle::spawn(&dir.path().join("veil.db")).unwrap();

        for i in 1..=3 {
            let mut e = event("req-1", PersistenceClass::Telemetry, false, None);
            e.attempt_count = i;
            e.summary = format!("attempt {i}");
            handle.record(e).await.unwrap();
        }

        let reader = handle.reader().unwrap();
        let events = reader.events_for_request("req-1").unwrap();
        let summaries: Vec<&str> = events.iter().map(|e| e.summary.as_str()).collect();
        assert_eq!(summaries, vec!["attempt 1", "attempt 2", "attempt 3"]);
    }

    #[tokio::test]
    async fn behavioral_query_filters_telemetry() {
        let dir = tempfile::tempdir().unwrap();
        let handle = LedgerHandle::spawn(&dir.path().join("veil.db")).unwrap();

        handle
            .record(event("req-1", PersistenceClass::Telemetry, false, None))
            .await
            .unwrap();
        handle
            .record(event(
                "req-2",
                PersistenceClass::Behavioral,
                true,
                Some(FailureClass::Deterministic),
            ))
            .await
            .unwrap();

        let reader = handle.reader().unwrap();
        let behavioral = reader.behavioral_events().unwrap();
        assert_eq!(behavioral.len(), 1);
        assert_eq!(behavioral[0].request_id, "req-2");
        assert_eq!(
            behavioral[0].failure_class,
            Some(FailureClass::Deterministic)
        );
    }
}
