//! Run result persistence
//!
//! One row per bot-on-task execution attempt, keyed by `(request, try)`.
//! The `(state, modified_ts_ms)` index backs the dead-bot sweep.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use shared::tasks::{RunResult, TaskState};

use super::{json_column, state_column, to_json};

pub fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS run_results (
            request_id INTEGER NOT NULL REFERENCES task_requests (id),
            try_number INTEGER NOT NULL,
            bot_id TEXT NOT NULL,
            bot_version TEXT NOT NULL,
            bot_capabilities TEXT NOT NULL,
            state INTEGER NOT NULL,
            current_slice INTEGER NOT NULL,
            started_ts_ms INTEGER NOT NULL,
            modified_ts_ms INTEGER NOT NULL,
            completed_ts_ms INTEGER,
            abandoned_ts_ms INTEGER,
            exit_code INTEGER,
            duration_secs REAL,
            internal_failure INTEGER NOT NULL DEFAULT 0,
            killing INTEGER NOT NULL DEFAULT 0,
            cost_usd REAL NOT NULL DEFAULT 0,
            output_chunks INTEGER NOT NULL DEFAULT 0,
            outputs_ref TEXT,
            PRIMARY KEY (request_id, try_number)
        )
        "#,
        [],
    )
    .context("Failed to create run_results table")?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_runs_state_modified ON run_results(state, modified_ts_ms)",
        [],
    )?;

    Ok(())
}

pub fn insert(conn: &Connection, run: &RunResult) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO run_results
            (request_id, try_number, bot_id, bot_version, bot_capabilities,
             state, current_slice, started_ts_ms, modified_ts_ms,
             completed_ts_ms, abandoned_ts_ms, exit_code, duration_secs,
             internal_failure, killing, cost_usd, output_chunks, outputs_ref)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                ?15, ?16, ?17, ?18)
        "#,
        params![
            run.request_id,
            run.try_number as i64,
            run.bot_id,
            run.bot_version,
            to_json(&run.bot_capabilities)?,
            run.state.as_i64(),
            run.current_slice as i64,
            run.started_ts_ms,
            run.modified_ts_ms,
            run.completed_ts_ms,
            run.abandoned_ts_ms,
            run.exit_code,
            run.duration_secs,
            run.internal_failure,
            run.killing,
            run.cost_usd,
            run.output_chunks as i64,
            run.outputs_ref,
        ],
    )
    .context("Failed to insert run result")?;
    Ok(())
}

pub fn update(conn: &Connection, run: &RunResult) -> Result<()> {
    let changed = conn
        .execute(
            r#"
            UPDATE run_results SET
                bot_id = ?3, bot_version = ?4, bot_capabilities = ?5,
                state = ?6, current_slice = ?7, started_ts_ms = ?8,
                modified_ts_ms = ?9, completed_ts_ms = ?10, abandoned_ts_ms = ?11,
                exit_code = ?12, duration_secs = ?13, internal_failure = ?14,
                killing = ?15, cost_usd = ?16, output_chunks = ?17,
                outputs_ref = ?18
            WHERE request_id = ?1 AND try_number = ?2
            "#,
            params![
                run.request_id,
                run.try_number as i64,
                run.bot_id,
                run.bot_version,
                to_json(&run.bot_capabilities)?,
                run.state.as_i64(),
                run.current_slice as i64,
                run.started_ts_ms,
                run.modified_ts_ms,
                run.completed_ts_ms,
                run.abandoned_ts_ms,
                run.exit_code,
                run.duration_secs,
                run.internal_failure,
                run.killing,
                run.cost_usd,
                run.output_chunks as i64,
                run.outputs_ref,
            ],
        )
        .context("Failed to update run result")?;
    if changed != 1 {
        anyhow::bail!(
            "Run result {}-{} missing on update",
            run.request_id,
            run.try_number
        );
    }
    Ok(())
}

pub fn get(conn: &Connection, request_id: i64, try_number: u32) -> Result<Option<RunResult>> {
    conn.query_row(
        &format!(
            "{} WHERE request_id = ?1 AND try_number = ?2",
            SELECT_PREFIX
        ),
        params![request_id, try_number as i64],
        row_to_run,
    )
    .optional()
    .context("Failed to load run result")
}

/// Keys of RUNNING runs whose last bot update is older than `cutoff_ts_ms`.
pub fn stale_running_page(
    conn: &Connection,
    cutoff_ts_ms: i64,
    limit: usize,
) -> Result<Vec<(i64, u32)>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT request_id, try_number FROM run_results
        WHERE state = ?1 AND modified_ts_ms < ?2
        ORDER BY modified_ts_ms ASC
        LIMIT ?3
        "#,
    )?;
    let rows = stmt
        .query_map(
            params![TaskState::Running.as_i64(), cutoff_ts_ms, limit as i64],
            |row| Ok((row.get(0)?, row.get::<_, i64>(1)? as u32)),
        )?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed to scan stale running runs")?;
    Ok(rows)
}

const SELECT_PREFIX: &str = r#"
    SELECT request_id, try_number, bot_id, bot_version, bot_capabilities,
           state, current_slice, started_ts_ms, modified_ts_ms,
           completed_ts_ms, abandoned_ts_ms, exit_code, duration_secs,
           internal_failure, killing, cost_usd, output_chunks, outputs_ref
    FROM run_results
"#;

fn row_to_run(row: &Row) -> rusqlite::Result<RunResult> {
    Ok(RunResult {
        request_id: row.get(0)?,
        try_number: row.get::<_, i64>(1)? as u32,
        bot_id: row.get(2)?,
        bot_version: row.get(3)?,
        bot_capabilities: json_column(4, row.get(4)?)?,
        state: state_column(5, row.get(5)?)?,
        current_slice: row.get::<_, i64>(6)? as u32,
        started_ts_ms: row.get(7)?,
        modified_ts_ms: row.get(8)?,
        completed_ts_ms: row.get(9)?,
        abandoned_ts_ms: row.get(10)?,
        exit_code: row.get(11)?,
        duration_secs: row.get(12)?,
        internal_failure: row.get(13)?,
        killing: row.get(14)?,
        cost_usd: row.get(15)?,
        output_chunks: row.get::<_, i64>(16)? as u32,
        outputs_ref: row.get(17)?,
    })
}
