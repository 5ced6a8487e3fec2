//! Durable notification outbox
//!
//! Completion events are written here inside the transaction that produced
//! the terminal state, then deleted once delivered. Whatever the immediate
//! post-commit replay fails to deliver is picked up by the periodic drain.

use anyhow::{Context, Result};
use rusqlite::{params, Connection};

use super::CompletionEvent;

pub fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS outbox (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id TEXT NOT NULL,
            topic TEXT NOT NULL,
            state INTEGER NOT NULL,
            userdata TEXT,
            created_ts_ms INTEGER NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0
        )
        "#,
        [],
    )
    .context("Failed to create outbox table")?;
    Ok(())
}

/// Inserts the events of one transaction, returning their row ids in order.
pub fn insert_events(
    conn: &Connection,
    events: &[CompletionEvent],
    now_ms: i64,
) -> Result<Vec<i64>> {
    let mut ids = Vec::with_capacity(events.len());
    for event in events {
        conn.execute(
            r#"
            INSERT INTO outbox (task_id, topic, state, userdata, created_ts_ms)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                event.task_id,
                event.topic,
                event.state.as_i64(),
                event.userdata,
                now_ms,
            ],
        )
        .context("Failed to insert outbox event")?;
        ids.push(conn.last_insert_rowid());
    }
    Ok(ids)
}

/// Oldest undelivered events, for the periodic drain.
pub fn pending_page(conn: &Connection, limit: usize) -> Result<Vec<(i64, CompletionEvent, u32)>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT id, task_id, topic, state, userdata, attempts
        FROM outbox
        ORDER BY id ASC
        LIMIT ?1
        "#,
    )?;
    let rows = stmt
        .query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                CompletionEvent {
                    task_id: row.get(1)?,
                    topic: row.get(2)?,
                    state: super::state_column(3, row.get(3)?)?,
                    userdata: row.get(4)?,
                },
                row.get::<_, i64>(5)? as u32,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed to scan outbox")?;
    Ok(rows)
}

pub fn delete(conn: &Connection, id: i64) -> Result<()> {
    conn.execute("DELETE FROM outbox WHERE id = ?1", params![id])
        .context("Failed to delete outbox event")?;
    Ok(())
}

pub fn bump_attempts(conn: &Connection, id: i64) -> Result<()> {
    conn.execute(
        "UPDATE outbox SET attempts = attempts + 1 WHERE id = ?1",
        params![id],
    )
    .context("Failed to bump outbox attempts")?;
    Ok(())
}

pub fn pending_count(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COUNT(*) FROM outbox", [], |row| row.get(0))
        .context("Failed to count outbox")
}
