//! Task request persistence
//!
//! Task requests are immutable: inserted once at submission, never updated.
//! The secret input blob and the caller-supplied idempotency keys live in
//! sibling tables keyed by the request id.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use shared::tasks::TaskRequest;

use super::{json_column, to_json};

pub fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS task_requests (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            priority INTEGER NOT NULL,
            created_ts_ms INTEGER NOT NULL,
            expiration_ts_ms INTEGER NOT NULL,
            slices TEXT NOT NULL,
            parent_run_id TEXT,
            notify_topic TEXT,
            notify_userdata TEXT,
            tags TEXT NOT NULL,
            has_secret INTEGER NOT NULL DEFAULT 0
        )
        "#,
        [],
    )
    .context("Failed to create task_requests table")?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS secret_bytes (
            request_id INTEGER PRIMARY KEY REFERENCES task_requests (id),
            secret BLOB NOT NULL
        )
        "#,
        [],
    )
    .context("Failed to create secret_bytes table")?;

    // Caller-supplied idempotency keys: resubmitting with a known key maps
    // back to the original request.
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS request_keys (
            request_key TEXT PRIMARY KEY,
            request_id INTEGER NOT NULL REFERENCES task_requests (id),
            created_ts_ms INTEGER NOT NULL
        )
        "#,
        [],
    )
    .context("Failed to create request_keys table")?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_requests_created ON task_requests(created_ts_ms)",
        [],
    )?;

    Ok(())
}

pub fn insert(conn: &Connection, request: &TaskRequest) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO task_requests
            (id, name, priority, created_ts_ms, expiration_ts_ms, slices,
             parent_run_id, notify_topic, notify_userdata, tags, has_secret)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        "#,
        params![
            request.id,
            request.name,
            request.priority as i64,
            request.created_ts_ms,
            request.expiration_ts_ms,
            to_json(&request.slices)?,
            request.parent_run_id,
            request.notify_topic,
            request.notify_userdata,
            to_json(&request.tags)?,
            request.has_secret,
        ],
    )
    .context("Failed to insert task request")?;
    Ok(())
}

pub fn get(conn: &Connection, request_id: i64) -> Result<Option<TaskRequest>> {
    conn.query_row(
        r#"
        SELECT id, name, priority, created_ts_ms, expiration_ts_ms, slices,
               parent_run_id, notify_topic, notify_userdata, tags, has_secret
        FROM task_requests WHERE id = ?1
        "#,
        params![request_id],
        row_to_request,
    )
    .optional()
    .context("Failed to load task request")
}

pub fn insert_secret(conn: &Connection, request_id: i64, secret: &[u8]) -> Result<()> {
    conn.execute(
        "INSERT INTO secret_bytes (request_id, secret) VALUES (?1, ?2)",
        params![request_id, secret],
    )
    .context("Failed to insert secret bytes")?;
    Ok(())
}

pub fn get_secret(conn: &Connection, request_id: i64) -> Result<Option<Vec<u8>>> {
    conn.query_row(
        "SELECT secret FROM secret_bytes WHERE request_id = ?1",
        params![request_id],
        |row| row.get(0),
    )
    .optional()
    .context("Failed to load secret bytes")
}

pub fn insert_request_key(
    conn: &Connection,
    request_key: &str,
    request_id: i64,
    now_ms: i64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO request_keys (request_key, request_id, created_ts_ms) VALUES (?1, ?2, ?3)",
        params![request_key, request_id, now_ms],
    )
    .context("Failed to insert request key")?;
    Ok(())
}

pub fn lookup_request_key(conn: &Connection, request_key: &str) -> Result<Option<i64>> {
    conn.query_row(
        "SELECT request_id FROM request_keys WHERE request_key = ?1",
        params![request_key],
        |row| row.get(0),
    )
    .optional()
    .context("Failed to look up request key")
}

fn row_to_request(row: &Row) -> rusqlite::Result<TaskRequest> {
    Ok(TaskRequest {
        id: row.get(0)?,
        name: row.get(1)?,
        priority: row.get::<_, i64>(2)? as u8,
        created_ts_ms: row.get(3)?,
        expiration_ts_ms: row.get(4)?,
        slices: json_column(5, row.get(5)?)?,
        parent_run_id: row.get(6)?,
        notify_topic: row.get(7)?,
        notify_userdata: row.get(8)?,
        tags: json_column(9, row.get(9)?)?,
        has_secret: row.get(10)?,
    })
}
