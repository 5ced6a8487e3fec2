//! Storage layer for the task scheduler
//!
//! This module manages the SQLite database holding every scheduler entity:
//! task requests, result summaries, queue entries, run results, output
//! chunks, bot records, machine leases and the notification outbox. Each
//! entity kind lives in its own submodule with its table definition and row
//! mapping, mirroring the entity-group layout of the data model.
//!
//! All multi-entity mutations go through [`with_tx`], which provides
//! serializable transactions (SQLite immediate transactions), bounded
//! busy-retry, and collection of completion-notification side effects that
//! are written to the outbox inside the same commit and replayed after it.

pub mod bots;
pub mod leases;
pub mod outbox;
pub mod output;
pub mod queue;
pub mod requests;
pub mod runs;
pub mod summaries;

use anyhow::{Context, Result};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use shared::tasks::{ResultSummary, TaskRequest, TaskState};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// The name of the scheduler's database file.
const DATABASE_FILE: &str = "scheduler.db";

/// Manages the SQLite database for the scheduler.
///
/// Encapsulates the connection and schema management; the entity submodules
/// provide typed operations over it.
pub struct ServerStore {
    /// The path to the SQLite database file.
    db_path: PathBuf,
    /// The active database connection, opened lazily.
    connection: Option<Connection>,
}

impl ServerStore {
    /// Creates a new store manager, ensuring the data directory exists.
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        if !data_dir.exists() {
            std::fs::create_dir_all(data_dir).with_context(|| {
                format!("Failed to create data directory: {}", data_dir.display())
            })?;
        }

        Ok(Self {
            db_path: data_dir.join(DATABASE_FILE),
            connection: None,
        })
    }

    /// Initializes the database by creating tables and indexes if they don't
    /// exist. Idempotent and safe to call on every startup.
    pub fn initialize(&mut self) -> Result<()> {
        info!("Initializing scheduler database at {}", self.db_path.display());

        let conn = self.get_connection()?;

        requests::create_tables(conn)?;
        summaries::create_tables(conn)?;
        queue::create_tables(conn)?;
        runs::create_tables(conn)?;
        output::create_tables(conn)?;
        bots::create_tables(conn)?;
        leases::create_tables(conn)?;
        outbox::create_tables(conn)?;

        info!("Scheduler database initialization complete");
        Ok(())
    }

    /// Lazily gets a mutable reference to the connection, creating it if
    /// needed.
    pub fn get_connection(&mut self) -> Result<&mut Connection> {
        if self.connection.is_none() {
            let conn = Connection::open(&self.db_path)
                .with_context(|| format!("Failed to open database: {}", self.db_path.display()))?;

            // WAL mode keeps readers off the writers' back.
            conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))
                .context("Failed to enable WAL mode")?;
            conn.execute_batch("PRAGMA busy_timeout=5000; PRAGMA foreign_keys=ON;")
                .context("Failed to set database pragmas")?;

            self.connection = Some(conn);
        }

        self.connection
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("Database connection unavailable"))
    }

    /// Runs a WAL checkpoint, returning the number of checkpointed frames.
    pub fn checkpoint_wal(&mut self) -> Result<i64> {
        let conn = self.get_connection()?;
        let (_busy, _log, checkpointed): (i64, i64, i64) = conn
            .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })
            .context("WAL checkpoint failed")?;
        Ok(checkpointed)
    }

    /// Closes the connection. Subsequent use reopens it.
    pub fn close(&mut self) {
        if self.connection.take().is_some() {
            debug!("Database connection closed");
        }
    }
}

/// A task-completion notification produced by a terminal state transition.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionEvent {
    pub task_id: String,
    pub topic: String,
    pub state: TaskState,
    pub userdata: Option<String>,
}

/// A completion event that was durably recorded in the outbox by a commit.
#[derive(Debug, Clone)]
pub struct QueuedEvent {
    pub outbox_id: i64,
    pub event: CompletionEvent,
}

/// Side effects collected while a transaction closure runs.
///
/// The transaction wrapper writes them to the outbox within the same commit;
/// the caller replays them afterwards. A rolled-back transaction discards
/// them with the rest of its writes.
#[derive(Debug, Default)]
pub struct TxEffects {
    events: Vec<CompletionEvent>,
}

impl TxEffects {
    /// Records a completion notification for a request with a notify topic.
    /// No-op when the request has none.
    pub fn notify(&mut self, request: &TaskRequest, summary: &ResultSummary) {
        if let Some(topic) = &request.notify_topic {
            self.events.push(CompletionEvent {
                task_id: summary.task_id(),
                topic: topic.clone(),
                state: summary.state,
                userdata: request.notify_userdata.clone(),
            });
        }
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Runs `f` inside an immediate transaction with bounded busy-retry.
///
/// On success the collected effects are written to the outbox table within
/// the same commit and returned for post-commit replay. On a busy/locked
/// error the whole closure is retried up to `retries` times; any other error
/// aborts and propagates.
pub fn with_tx<T, F>(
    conn: &mut Connection,
    retries: u32,
    now_ms: i64,
    mut f: F,
) -> Result<(T, Vec<QueuedEvent>)>
where
    F: FnMut(&Transaction, &mut TxEffects) -> Result<T>,
{
    let mut attempt = 0u32;
    loop {
        let tx = match conn.transaction_with_behavior(TransactionBehavior::Immediate) {
            Ok(tx) => tx,
            Err(err) if is_busy_sqlite(&err) && attempt < retries => {
                attempt += 1;
                continue;
            }
            Err(err) => return Err(err).context("Failed to start transaction"),
        };

        let mut effects = TxEffects::default();
        let value = match f(&tx, &mut effects) {
            Ok(value) => value,
            Err(err) => {
                drop(tx);
                if is_busy_error(&err) && attempt < retries {
                    attempt += 1;
                    continue;
                }
                return Err(err);
            }
        };

        let outbox_ids = outbox::insert_events(&tx, &effects.events, now_ms)?;
        match tx.commit() {
            Ok(()) => {
                let queued = outbox_ids
                    .into_iter()
                    .zip(effects.events)
                    .map(|(outbox_id, event)| QueuedEvent { outbox_id, event })
                    .collect();
                return Ok((value, queued));
            }
            Err(err) if is_busy_sqlite(&err) && attempt < retries => {
                attempt += 1;
                continue;
            }
            Err(err) => return Err(err).context("Failed to commit transaction"),
        }
    }
}

/// True for SQLITE_BUSY / SQLITE_LOCKED, the retriable commit conflicts.
fn is_busy_sqlite(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if matches!(
            e.code,
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
        )
    )
}

/// Like [`is_busy_sqlite`] but looks through an `anyhow` chain.
pub fn is_busy_error(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<rusqlite::Error>())
        .any(is_busy_sqlite)
}

/// Deserializes a JSON text column, mapping failures to a rusqlite error so
/// row-mapping closures can use it directly.
pub(crate) fn json_column<T: serde::de::DeserializeOwned>(
    idx: usize,
    raw: String,
) -> rusqlite::Result<T> {
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// Serializes a value into its JSON column form.
pub(crate) fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).context("Failed to serialize entity column")
}

/// Decodes a stored task state integer.
pub(crate) fn state_column(idx: usize, value: i64) -> rusqlite::Result<TaskState> {
    TaskState::from_i64(value).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Integer, e.into())
    })
}
