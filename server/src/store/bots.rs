//! Bot record persistence
//!
//! One row per bot, refreshed on every poll. Capacity checks scan the
//! capability sets of recently seen bots; matching happens in Rust since the
//! subset test does not map onto SQL.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use shared::capabilities::CapabilitySet;
use shared::tasks::BotRecord;

use super::{json_column, to_json};

pub fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS bots (
            bot_id TEXT PRIMARY KEY,
            first_seen_ms INTEGER NOT NULL,
            last_seen_ms INTEGER NOT NULL,
            version TEXT NOT NULL,
            capabilities TEXT NOT NULL,
            active_run TEXT,
            machine_type TEXT,
            lease_slot INTEGER,
            lease_expiration_ts_ms INTEGER,
            leased_indefinitely INTEGER NOT NULL DEFAULT 0
        )
        "#,
        [],
    )
    .context("Failed to create bots table")?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_bots_last_seen ON bots(last_seen_ms)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_bots_machine_type ON bots(machine_type)",
        [],
    )?;

    Ok(())
}

/// Inserts a full bot record; used by the lease manager when it provisions
/// a machine ahead of the bot's first poll.
pub fn insert(conn: &Connection, bot: &BotRecord) -> Result<()> {
    conn.execute(
        r#"
        INSERT OR REPLACE INTO bots
            (bot_id, first_seen_ms, last_seen_ms, version, capabilities,
             active_run, machine_type, lease_slot, lease_expiration_ts_ms,
             leased_indefinitely)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        "#,
        params![
            bot.bot_id,
            bot.first_seen_ms,
            bot.last_seen_ms,
            bot.version,
            to_json(&bot.capabilities)?,
            bot.active_run,
            bot.machine_type,
            bot.lease_slot.map(|s| s as i64),
            bot.lease_expiration_ts_ms,
            bot.leased_indefinitely,
        ],
    )
    .context("Failed to insert bot record")?;
    Ok(())
}

/// Refreshes the poll-visible fields, creating the record on first contact.
/// Lease metadata placed by the lease manager is preserved.
pub fn upsert_seen(
    conn: &Connection,
    bot_id: &str,
    version: &str,
    capabilities: &CapabilitySet,
    now_ms: i64,
) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO bots (bot_id, first_seen_ms, last_seen_ms, version, capabilities)
        VALUES (?1, ?2, ?2, ?3, ?4)
        ON CONFLICT(bot_id) DO UPDATE SET
            last_seen_ms = excluded.last_seen_ms,
            version = excluded.version,
            capabilities = excluded.capabilities
        "#,
        params![bot_id, now_ms, version, to_json(capabilities)?],
    )
    .context("Failed to upsert bot record")?;
    Ok(())
}

pub fn get(conn: &Connection, bot_id: &str) -> Result<Option<BotRecord>> {
    conn.query_row(
        &format!("{} WHERE bot_id = ?1", SELECT_PREFIX),
        params![bot_id],
        row_to_bot,
    )
    .optional()
    .context("Failed to load bot record")
}

pub fn set_active_run(conn: &Connection, bot_id: &str, active_run: Option<&str>) -> Result<()> {
    conn.execute(
        "UPDATE bots SET active_run = ?2 WHERE bot_id = ?1",
        params![bot_id, active_run],
    )
    .context("Failed to update bot active run")?;
    Ok(())
}

pub fn delete(conn: &Connection, bot_id: &str) -> Result<()> {
    conn.execute("DELETE FROM bots WHERE bot_id = ?1", params![bot_id])
        .context("Failed to delete bot record")?;
    Ok(())
}

/// True when any bot seen since `alive_after_ms` satisfies `required`.
pub fn has_capacity(
    conn: &Connection,
    required: &CapabilitySet,
    alive_after_ms: i64,
) -> Result<bool> {
    let mut stmt = conn
        .prepare("SELECT capabilities FROM bots WHERE last_seen_ms >= ?1")
        .context("Failed to prepare capacity scan")?;
    let rows = stmt.query_map(params![alive_after_ms], |row| row.get::<_, String>(0))?;
    for raw in rows {
        let advertised: CapabilitySet = json_column(0, raw?)?;
        if required.is_satisfied_by(&advertised) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Busy and idle counts of live bots belonging to one machine type.
pub fn count_busy_idle(
    conn: &Connection,
    machine_type: &str,
    alive_after_ms: i64,
) -> Result<(u32, u32)> {
    conn.query_row(
        r#"
        SELECT
            COALESCE(SUM(CASE WHEN active_run IS NOT NULL THEN 1 ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN active_run IS NULL THEN 1 ELSE 0 END), 0)
        FROM bots
        WHERE machine_type = ?1 AND last_seen_ms >= ?2
        "#,
        params![machine_type, alive_after_ms],
        |row| {
            Ok((
                row.get::<_, i64>(0)? as u32,
                row.get::<_, i64>(1)? as u32,
            ))
        },
    )
    .context("Failed to count machine type utilization")
}

const SELECT_PREFIX: &str = r#"
    SELECT bot_id, first_seen_ms, last_seen_ms, version, capabilities,
           active_run, machine_type, lease_slot, lease_expiration_ts_ms,
           leased_indefinitely
    FROM bots
"#;

fn row_to_bot(row: &Row) -> rusqlite::Result<BotRecord> {
    Ok(BotRecord {
        bot_id: row.get(0)?,
        first_seen_ms: row.get(1)?,
        last_seen_ms: row.get(2)?,
        version: row.get(3)?,
        capabilities: json_column(4, row.get(4)?)?,
        active_run: row.get(5)?,
        machine_type: row.get(6)?,
        lease_slot: row.get::<_, Option<i64>>(7)?.map(|s| s as u32),
        lease_expiration_ts_ms: row.get(8)?,
        leased_indefinitely: row.get(9)?,
    })
}
