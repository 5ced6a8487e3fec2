//! Run-queue persistence
//!
//! One row per `(request, try, slice)`. A non-null `queue_number` marks the
//! entry claimable and orders the dispatch scan; clearing it is the atomic
//! claim operation, implemented as a compare-and-set on the same condition.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use shared::tasks::TaskToRun;

use super::json_column;

pub fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS task_to_run (
            request_id INTEGER NOT NULL REFERENCES task_requests (id),
            try_number INTEGER NOT NULL,
            slice_index INTEGER NOT NULL,
            queue_number INTEGER,
            created_ts_ms INTEGER NOT NULL,
            expiration_ts_ms INTEGER NOT NULL,
            capabilities TEXT NOT NULL,
            PRIMARY KEY (request_id, try_number, slice_index)
        )
        "#,
        [],
    )
    .context("Failed to create task_to_run table")?;

    // Partial indexes keep the dispatch and expiry scans on claimable rows
    // only; claimed rows drop out of both.
    conn.execute(
        r#"
        CREATE INDEX IF NOT EXISTS idx_to_run_claimable
        ON task_to_run(queue_number)
        WHERE queue_number IS NOT NULL
        "#,
        [],
    )?;
    conn.execute(
        r#"
        CREATE INDEX IF NOT EXISTS idx_to_run_expiration
        ON task_to_run(expiration_ts_ms)
        WHERE queue_number IS NOT NULL
        "#,
        [],
    )?;

    Ok(())
}

pub fn insert(conn: &Connection, to_run: &TaskToRun) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO task_to_run
            (request_id, try_number, slice_index, queue_number, created_ts_ms,
             expiration_ts_ms, capabilities)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
        params![
            to_run.request_id,
            to_run.try_number as i64,
            to_run.slice_index as i64,
            to_run.queue_number,
            to_run.created_ts_ms,
            to_run.expiration_ts_ms,
            super::to_json(&to_run.capabilities)?,
        ],
    )
    .context("Failed to insert queue entry")?;
    Ok(())
}

pub fn get(
    conn: &Connection,
    request_id: i64,
    try_number: u32,
    slice_index: u32,
) -> Result<Option<TaskToRun>> {
    conn.query_row(
        &format!(
            "{} WHERE request_id = ?1 AND try_number = ?2 AND slice_index = ?3",
            SELECT_PREFIX
        ),
        params![request_id, try_number as i64, slice_index as i64],
        row_to_task_to_run,
    )
    .optional()
    .context("Failed to load queue entry")
}

/// Atomically retires a queue entry. Returns false when another writer
/// already claimed or cancelled it.
pub fn claim(
    conn: &Connection,
    request_id: i64,
    try_number: u32,
    slice_index: u32,
) -> Result<bool> {
    let changed = conn
        .execute(
            r#"
            UPDATE task_to_run SET queue_number = NULL
            WHERE request_id = ?1 AND try_number = ?2 AND slice_index = ?3
              AND queue_number IS NOT NULL
            "#,
            params![request_id, try_number as i64, slice_index as i64],
        )
        .context("Failed to claim queue entry")?;
    Ok(changed == 1)
}

/// A page of claimable entries in ascending queue-number order, resuming
/// after `after_queue_number`. Capability filtering happens in the caller.
pub fn claimable_page(
    conn: &Connection,
    after_queue_number: Option<i64>,
    limit: usize,
) -> Result<Vec<TaskToRun>> {
    let floor = after_queue_number.unwrap_or(i64::MIN);
    let mut stmt = conn.prepare(&format!(
        r#"
        {} WHERE queue_number IS NOT NULL AND queue_number > ?1
        ORDER BY queue_number ASC
        LIMIT ?2
        "#,
        SELECT_PREFIX
    ))?;
    let rows = stmt
        .query_map(params![floor, limit as i64], row_to_task_to_run)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed to scan claimable queue entries")?;
    Ok(rows)
}

/// Claimable entries whose slice deadline has passed.
pub fn expired_page(conn: &Connection, now_ms: i64, limit: usize) -> Result<Vec<TaskToRun>> {
    let mut stmt = conn.prepare(&format!(
        r#"
        {} WHERE queue_number IS NOT NULL AND expiration_ts_ms <= ?1
        ORDER BY expiration_ts_ms ASC
        LIMIT ?2
        "#,
        SELECT_PREFIX
    ))?;
    let rows = stmt
        .query_map(params![now_ms, limit as i64], row_to_task_to_run)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed to scan expired queue entries")?;
    Ok(rows)
}

/// Number of claimable entries for one request. The single-claim invariant
/// keeps this at most 1; used by tests and consistency checks.
pub fn claimable_count_for_request(conn: &Connection, request_id: i64) -> Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM task_to_run WHERE request_id = ?1 AND queue_number IS NOT NULL",
        params![request_id],
        |row| row.get(0),
    )
    .context("Failed to count claimable entries")
}

const SELECT_PREFIX: &str = r#"
    SELECT request_id, try_number, slice_index, queue_number, created_ts_ms,
           expiration_ts_ms, capabilities
    FROM task_to_run
"#;

fn row_to_task_to_run(row: &Row) -> rusqlite::Result<TaskToRun> {
    Ok(TaskToRun {
        request_id: row.get(0)?,
        try_number: row.get::<_, i64>(1)? as u32,
        slice_index: row.get::<_, i64>(2)? as u32,
        queue_number: row.get(3)?,
        created_ts_ms: row.get(4)?,
        expiration_ts_ms: row.get(5)?,
        capabilities: json_column(6, row.get(6)?)?,
    })
}
