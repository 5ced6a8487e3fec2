//! Output chunk persistence
//!
//! Fixed-size chunks of a run's output stream, keyed by chunk index under
//! the run. The gap list is stored alongside each chunk; the append logic
//! that maintains it lives in the `output` module.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{json_column, to_json};

/// One stored chunk of a run's output stream.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputChunk {
    pub request_id: i64,
    pub try_number: u32,
    pub chunk_index: u32,
    pub data: Vec<u8>,
    /// Byte ranges within this chunk that were zero-filled rather than
    /// written, as `(start, end)` pairs relative to the chunk start.
    pub gaps: Vec<(u32, u32)>,
}

pub fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS output_chunks (
            request_id INTEGER NOT NULL,
            try_number INTEGER NOT NULL,
            chunk_index INTEGER NOT NULL,
            data BLOB NOT NULL,
            gaps TEXT NOT NULL,
            PRIMARY KEY (request_id, try_number, chunk_index)
        )
        "#,
        [],
    )
    .context("Failed to create output_chunks table")?;
    Ok(())
}

pub fn get(
    conn: &Connection,
    request_id: i64,
    try_number: u32,
    chunk_index: u32,
) -> Result<Option<OutputChunk>> {
    conn.query_row(
        r#"
        SELECT request_id, try_number, chunk_index, data, gaps
        FROM output_chunks
        WHERE request_id = ?1 AND try_number = ?2 AND chunk_index = ?3
        "#,
        params![request_id, try_number as i64, chunk_index as i64],
        row_to_chunk,
    )
    .optional()
    .context("Failed to load output chunk")
}

/// Saves every chunk touched by one append in a single pass.
pub fn put_many(conn: &Connection, chunks: &[OutputChunk]) -> Result<()> {
    let mut stmt = conn
        .prepare(
            r#"
            INSERT OR REPLACE INTO output_chunks
                (request_id, try_number, chunk_index, data, gaps)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .context("Failed to prepare output chunk write")?;
    for chunk in chunks {
        stmt.execute(params![
            chunk.request_id,
            chunk.try_number as i64,
            chunk.chunk_index as i64,
            chunk.data,
            to_json(&chunk.gaps)?,
        ])
        .context("Failed to write output chunk")?;
    }
    Ok(())
}

/// Loads the first `max_chunks` chunks of a run in stream order.
pub fn get_range(
    conn: &Connection,
    request_id: i64,
    try_number: u32,
    max_chunks: u32,
) -> Result<Vec<OutputChunk>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT request_id, try_number, chunk_index, data, gaps
        FROM output_chunks
        WHERE request_id = ?1 AND try_number = ?2 AND chunk_index < ?3
        ORDER BY chunk_index ASC
        "#,
    )?;
    let rows = stmt
        .query_map(
            params![request_id, try_number as i64, max_chunks as i64],
            row_to_chunk,
        )?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed to load output chunks")?;
    Ok(rows)
}

fn row_to_chunk(row: &Row) -> rusqlite::Result<OutputChunk> {
    Ok(OutputChunk {
        request_id: row.get(0)?,
        try_number: row.get::<_, i64>(1)? as u32,
        chunk_index: row.get::<_, i64>(2)? as u32,
        data: row.get(3)?,
        gaps: json_column(4, row.get(4)?)?,
    })
}
