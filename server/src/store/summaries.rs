//! Result summary persistence
//!
//! The summary is the canonical mutable record of a request's outcome. The
//! dedup index table maintained by the periodic sweep lives here too: it is
//! a fast path over the `properties_hash` column, never the source of truth.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use shared::tasks::ResultSummary;

use super::{json_column, state_column, to_json};

pub fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS result_summaries (
            request_id INTEGER PRIMARY KEY REFERENCES task_requests (id),
            state INTEGER NOT NULL,
            try_number INTEGER NOT NULL,
            current_slice INTEGER NOT NULL,
            bot_id TEXT,
            bot_version TEXT,
            costs_usd TEXT NOT NULL,
            cost_saved_usd REAL,
            created_ts_ms INTEGER NOT NULL,
            started_ts_ms INTEGER,
            completed_ts_ms INTEGER,
            abandoned_ts_ms INTEGER,
            modified_ts_ms INTEGER NOT NULL,
            exit_code INTEGER,
            duration_secs REAL,
            internal_failure INTEGER NOT NULL DEFAULT 0,
            outputs_ref TEXT,
            deduped_from TEXT,
            properties_hash TEXT,
            children_task_ids TEXT NOT NULL
        )
        "#,
        [],
    )
    .context("Failed to create result_summaries table")?;

    // The dedup lookup scans matching hashes in ascending request-id order,
    // which is newest first under the inverted id encoding.
    conn.execute(
        r#"
        CREATE INDEX IF NOT EXISTS idx_summaries_properties_hash
        ON result_summaries(properties_hash, request_id)
        WHERE properties_hash IS NOT NULL
        "#,
        [],
    )?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS dedup_index (
            properties_hash TEXT PRIMARY KEY,
            request_id INTEGER NOT NULL,
            created_ts_ms INTEGER NOT NULL
        )
        "#,
        [],
    )
    .context("Failed to create dedup_index table")?;

    Ok(())
}

pub fn insert(conn: &Connection, summary: &ResultSummary) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO result_summaries
            (request_id, state, try_number, current_slice, bot_id, bot_version,
             costs_usd, cost_saved_usd, created_ts_ms, started_ts_ms,
             completed_ts_ms, abandoned_ts_ms, modified_ts_ms, exit_code,
             duration_secs, internal_failure, outputs_ref, deduped_from,
             properties_hash, children_task_ids)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                ?15, ?16, ?17, ?18, ?19, ?20)
        "#,
        params![
            summary.request_id,
            summary.state.as_i64(),
            summary.try_number as i64,
            summary.current_slice as i64,
            summary.bot_id,
            summary.bot_version,
            to_json(&summary.costs_usd)?,
            summary.cost_saved_usd,
            summary.created_ts_ms,
            summary.started_ts_ms,
            summary.completed_ts_ms,
            summary.abandoned_ts_ms,
            summary.modified_ts_ms,
            summary.exit_code,
            summary.duration_secs,
            summary.internal_failure,
            summary.outputs_ref,
            summary.deduped_from,
            summary.properties_hash,
            to_json(&summary.children_task_ids)?,
        ],
    )
    .context("Failed to insert result summary")?;
    Ok(())
}

pub fn update(conn: &Connection, summary: &ResultSummary) -> Result<()> {
    let changed = conn
        .execute(
            r#"
            UPDATE result_summaries SET
                state = ?2, try_number = ?3, current_slice = ?4, bot_id = ?5,
                bot_version = ?6, costs_usd = ?7, cost_saved_usd = ?8,
                started_ts_ms = ?9, completed_ts_ms = ?10, abandoned_ts_ms = ?11,
                modified_ts_ms = ?12, exit_code = ?13, duration_secs = ?14,
                internal_failure = ?15, outputs_ref = ?16, deduped_from = ?17,
                properties_hash = ?18, children_task_ids = ?19
            WHERE request_id = ?1
            "#,
            params![
                summary.request_id,
                summary.state.as_i64(),
                summary.try_number as i64,
                summary.current_slice as i64,
                summary.bot_id,
                summary.bot_version,
                to_json(&summary.costs_usd)?,
                summary.cost_saved_usd,
                summary.started_ts_ms,
                summary.completed_ts_ms,
                summary.abandoned_ts_ms,
                summary.modified_ts_ms,
                summary.exit_code,
                summary.duration_secs,
                summary.internal_failure,
                summary.outputs_ref,
                summary.deduped_from,
                summary.properties_hash,
                to_json(&summary.children_task_ids)?,
            ],
        )
        .context("Failed to update result summary")?;
    if changed != 1 {
        anyhow::bail!("Result summary {} missing on update", summary.request_id);
    }
    Ok(())
}

pub fn get(conn: &Connection, request_id: i64) -> Result<Option<ResultSummary>> {
    conn.query_row(
        &format!("{} WHERE request_id = ?1", SELECT_PREFIX),
        params![request_id],
        row_to_summary,
    )
    .optional()
    .context("Failed to load result summary")
}

/// Most recent summaries carrying the given properties hash, newest first.
/// The caller validates each candidate; the scan is bounded to tolerate
/// index staleness.
pub fn dedup_candidates(
    conn: &Connection,
    properties_hash: &str,
    limit: usize,
) -> Result<Vec<ResultSummary>> {
    let mut stmt = conn.prepare(&format!(
        "{} WHERE properties_hash = ?1 ORDER BY request_id ASC LIMIT ?2",
        SELECT_PREFIX
    ))?;
    let rows = stmt
        .query_map(params![properties_hash, limit as i64], row_to_summary)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed to scan dedup candidates")?;
    Ok(rows)
}

/// Appends a child task id to a summary's children list.
pub fn append_child(conn: &Connection, request_id: i64, child_task_id: &str) -> Result<()> {
    let Some(mut summary) = get(conn, request_id)? else {
        anyhow::bail!("Parent summary {} not found", request_id);
    };
    if !summary.children_task_ids.iter().any(|c| c == child_task_id) {
        summary.children_task_ids.push(child_task_id.to_string());
        update(conn, &summary)?;
    }
    Ok(())
}

// Dedup fast-path index, refreshed by the periodic sweep.

pub fn dedup_index_upsert(
    conn: &Connection,
    properties_hash: &str,
    request_id: i64,
    created_ts_ms: i64,
) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO dedup_index (properties_hash, request_id, created_ts_ms)
        VALUES (?1, ?2, ?3)
        ON CONFLICT(properties_hash) DO UPDATE SET
            request_id = excluded.request_id,
            created_ts_ms = excluded.created_ts_ms
        WHERE excluded.created_ts_ms > dedup_index.created_ts_ms
        "#,
        params![properties_hash, request_id, created_ts_ms],
    )
    .context("Failed to upsert dedup index entry")?;
    Ok(())
}

pub fn dedup_index_lookup(conn: &Connection, properties_hash: &str) -> Result<Option<i64>> {
    conn.query_row(
        "SELECT request_id FROM dedup_index WHERE properties_hash = ?1",
        params![properties_hash],
        |row| row.get(0),
    )
    .optional()
    .context("Failed to query dedup index")
}

/// Drops index entries older than the reuse window. Returns the count.
pub fn dedup_index_prune(conn: &Connection, cutoff_ts_ms: i64) -> Result<usize> {
    conn.execute(
        "DELETE FROM dedup_index WHERE created_ts_ms < ?1",
        params![cutoff_ts_ms],
    )
    .context("Failed to prune dedup index")
}

/// Published (hash, request, created) triples newer than `since_ts_ms`,
/// feeding the index refresh sweep.
pub fn published_hashes(
    conn: &Connection,
    since_ts_ms: i64,
    limit: usize,
) -> Result<Vec<(String, i64, i64)>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT properties_hash, request_id, created_ts_ms
        FROM result_summaries
        WHERE properties_hash IS NOT NULL AND created_ts_ms >= ?1
        ORDER BY created_ts_ms DESC
        LIMIT ?2
        "#,
    )?;
    let rows = stmt
        .query_map(params![since_ts_ms, limit as i64], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed to scan published hashes")?;
    Ok(rows)
}

const SELECT_PREFIX: &str = r#"
    SELECT request_id, state, try_number, current_slice, bot_id, bot_version,
           costs_usd, cost_saved_usd, created_ts_ms, started_ts_ms,
           completed_ts_ms, abandoned_ts_ms, modified_ts_ms, exit_code,
           duration_secs, internal_failure, outputs_ref, deduped_from,
           properties_hash, children_task_ids
    FROM result_summaries
"#;

fn row_to_summary(row: &Row) -> rusqlite::Result<ResultSummary> {
    Ok(ResultSummary {
        request_id: row.get(0)?,
        state: state_column(1, row.get(1)?)?,
        try_number: row.get::<_, i64>(2)? as u32,
        current_slice: row.get::<_, i64>(3)? as u32,
        bot_id: row.get(4)?,
        bot_version: row.get(5)?,
        costs_usd: json_column(6, row.get(6)?)?,
        cost_saved_usd: row.get(7)?,
        created_ts_ms: row.get(8)?,
        started_ts_ms: row.get(9)?,
        completed_ts_ms: row.get(10)?,
        abandoned_ts_ms: row.get(11)?,
        modified_ts_ms: row.get(12)?,
        exit_code: row.get(13)?,
        duration_secs: row.get(14)?,
        internal_failure: row.get(15)?,
        outputs_ref: row.get(16)?,
        deduped_from: row.get(17)?,
        properties_hash: row.get(18)?,
        children_task_ids: json_column(19, row.get(19)?)?,
    })
}
