//! Machine lease persistence
//!
//! One row per configured slot of a machine type, plus the per-type
//! utilization summary read by load-based sizing.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use shared::tasks::{MachineLease, MachineUtilization};

use super::{json_column, to_json};

pub fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS machine_leases (
            machine_type TEXT NOT NULL,
            slot INTEGER NOT NULL,
            drained INTEGER NOT NULL DEFAULT 0,
            client_request_id TEXT,
            request_count INTEGER NOT NULL DEFAULT 0,
            hostname TEXT,
            lease_expiration_ts_ms INTEGER,
            leased_indefinitely INTEGER NOT NULL DEFAULT 0,
            lease_duration_secs INTEGER NOT NULL,
            early_release_secs INTEGER NOT NULL DEFAULT 0,
            capabilities TEXT NOT NULL,
            termination_task_id INTEGER,
            instruction_ts_ms INTEGER,
            connection_ts_ms INTEGER,
            PRIMARY KEY (machine_type, slot)
        )
        "#,
        [],
    )
    .context("Failed to create machine_leases table")?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS machine_utilization (
            machine_type TEXT PRIMARY KEY,
            busy INTEGER NOT NULL,
            idle INTEGER NOT NULL,
            computed_ts_ms INTEGER NOT NULL
        )
        "#,
        [],
    )
    .context("Failed to create machine_utilization table")?;

    Ok(())
}

pub fn insert(conn: &Connection, lease: &MachineLease) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO machine_leases
            (machine_type, slot, drained, client_request_id, request_count,
             hostname, lease_expiration_ts_ms, leased_indefinitely,
             lease_duration_secs, early_release_secs, capabilities,
             termination_task_id, instruction_ts_ms, connection_ts_ms)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
        "#,
        params![
            lease.machine_type,
            lease.slot as i64,
            lease.drained,
            lease.client_request_id,
            lease.request_count as i64,
            lease.hostname,
            lease.lease_expiration_ts_ms,
            lease.leased_indefinitely,
            lease.lease_duration_secs as i64,
            lease.early_release_secs as i64,
            to_json(&lease.capabilities)?,
            lease.termination_task_id,
            lease.instruction_ts_ms,
            lease.connection_ts_ms,
        ],
    )
    .context("Failed to insert machine lease")?;
    Ok(())
}

pub fn update(conn: &Connection, lease: &MachineLease) -> Result<()> {
    let changed = conn
        .execute(
            r#"
            UPDATE machine_leases SET
                drained = ?3, client_request_id = ?4, request_count = ?5,
                hostname = ?6, lease_expiration_ts_ms = ?7,
                leased_indefinitely = ?8, lease_duration_secs = ?9,
                early_release_secs = ?10, capabilities = ?11,
                termination_task_id = ?12, instruction_ts_ms = ?13,
                connection_ts_ms = ?14
            WHERE machine_type = ?1 AND slot = ?2
            "#,
            params![
                lease.machine_type,
                lease.slot as i64,
                lease.drained,
                lease.client_request_id,
                lease.request_count as i64,
                lease.hostname,
                lease.lease_expiration_ts_ms,
                lease.leased_indefinitely,
                lease.lease_duration_secs as i64,
                lease.early_release_secs as i64,
                to_json(&lease.capabilities)?,
                lease.termination_task_id,
                lease.instruction_ts_ms,
                lease.connection_ts_ms,
            ],
        )
        .context("Failed to update machine lease")?;
    if changed != 1 {
        anyhow::bail!("Machine lease {} missing on update", lease.lease_key());
    }
    Ok(())
}

pub fn get(conn: &Connection, machine_type: &str, slot: u32) -> Result<Option<MachineLease>> {
    conn.query_row(
        &format!(
            "{} WHERE machine_type = ?1 AND slot = ?2",
            SELECT_PREFIX
        ),
        params![machine_type, slot as i64],
        row_to_lease,
    )
    .optional()
    .context("Failed to load machine lease")
}

pub fn delete(conn: &Connection, machine_type: &str, slot: u32) -> Result<()> {
    conn.execute(
        "DELETE FROM machine_leases WHERE machine_type = ?1 AND slot = ?2",
        params![machine_type, slot as i64],
    )
    .context("Failed to delete machine lease")?;
    Ok(())
}

pub fn list_for_type(conn: &Connection, machine_type: &str) -> Result<Vec<MachineLease>> {
    let mut stmt = conn.prepare(&format!(
        "{} WHERE machine_type = ?1 ORDER BY slot ASC",
        SELECT_PREFIX
    ))?;
    let rows = stmt
        .query_map(params![machine_type], row_to_lease)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed to list machine leases")?;
    Ok(rows)
}

pub fn list_all(conn: &Connection) -> Result<Vec<MachineLease>> {
    let mut stmt = conn.prepare(&format!(
        "{} ORDER BY machine_type ASC, slot ASC",
        SELECT_PREFIX
    ))?;
    let rows = stmt
        .query_map([], row_to_lease)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed to list machine leases")?;
    Ok(rows)
}

pub fn put_utilization(conn: &Connection, utilization: &MachineUtilization) -> Result<()> {
    conn.execute(
        r#"
        INSERT OR REPLACE INTO machine_utilization
            (machine_type, busy, idle, computed_ts_ms)
        VALUES (?1, ?2, ?3, ?4)
        "#,
        params![
            utilization.machine_type,
            utilization.busy as i64,
            utilization.idle as i64,
            utilization.computed_ts_ms,
        ],
    )
    .context("Failed to store machine utilization")?;
    Ok(())
}

pub fn get_utilization(conn: &Connection, machine_type: &str) -> Result<Option<MachineUtilization>> {
    conn.query_row(
        r#"
        SELECT machine_type, busy, idle, computed_ts_ms
        FROM machine_utilization WHERE machine_type = ?1
        "#,
        params![machine_type],
        |row| {
            Ok(MachineUtilization {
                machine_type: row.get(0)?,
                busy: row.get::<_, i64>(1)? as u32,
                idle: row.get::<_, i64>(2)? as u32,
                computed_ts_ms: row.get(3)?,
            })
        },
    )
    .optional()
    .context("Failed to load machine utilization")
}

const SELECT_PREFIX: &str = r#"
    SELECT machine_type, slot, drained, client_request_id, request_count,
           hostname, lease_expiration_ts_ms, leased_indefinitely,
           lease_duration_secs, early_release_secs, capabilities,
           termination_task_id, instruction_ts_ms, connection_ts_ms
    FROM machine_leases
"#;

fn row_to_lease(row: &Row) -> rusqlite::Result<MachineLease> {
    Ok(MachineLease {
        machine_type: row.get(0)?,
        slot: row.get::<_, i64>(1)? as u32,
        drained: row.get(2)?,
        client_request_id: row.get(3)?,
        request_count: row.get::<_, i64>(4)? as u32,
        hostname: row.get(5)?,
        lease_expiration_ts_ms: row.get(6)?,
        leased_indefinitely: row.get(7)?,
        lease_duration_secs: row.get::<_, i64>(8)? as u32,
        early_release_secs: row.get::<_, i64>(9)? as u32,
        capabilities: json_column(10, row.get(10)?)?,
        termination_task_id: row.get(11)?,
        instruction_ts_ms: row.get(12)?,
        connection_ts_ms: row.get(13)?,
    })
}
