//! Task output append and reassembly
//!
//! Output arrives from bots as `(bytes, offset)` deltas and is stored in
//! fixed-size chunks under the run. Offsets may arrive out of order or more
//! than once: a write landing past the end of a chunk zero-fills the
//! intervening region and records it as a gap, and a later write covering a
//! gap shrinks or splits it. Appending the same delta twice is a no-op by
//! construction, which is what lets bots retry updates safely.

use crate::store::output::{self as chunk_store, OutputChunk};
use anyhow::Result;
use rusqlite::Connection;
use tracing::warn;

/// Outcome of one append: the updated chunk count and how many bytes were
/// dropped at the storage cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    pub number_chunks: u32,
    pub dropped_bytes: usize,
}

/// Appends `data` at `offset` into the run's chunk series.
///
/// `number_chunks` is the run's current chunk count. Writes past the cap of
/// `max_chunks` chunks are dropped; a write straddling the cap keeps the
/// prefix below the boundary and drops the remainder. The first append that
/// hits the cap logs one warning for the run.
pub fn append(
    conn: &Connection,
    request_id: i64,
    try_number: u32,
    number_chunks: u32,
    data: &[u8],
    offset: u64,
    chunk_size: usize,
    max_chunks: u32,
) -> Result<AppendOutcome> {
    if data.is_empty() {
        return Ok(AppendOutcome {
            number_chunks,
            dropped_bytes: 0,
        });
    }

    // Split the write into per-chunk patches.
    let mut patches: Vec<(u32, usize, &[u8])> = Vec::new();
    let mut new_number_chunks = number_chunks;
    let mut dropped_bytes = 0usize;
    let mut remaining = data;
    let mut cursor = offset as usize;
    while !remaining.is_empty() {
        let chunk_index = (cursor / chunk_size) as u32;
        if chunk_index >= max_chunks {
            dropped_bytes = remaining.len();
            break;
        }
        let start = cursor % chunk_size;
        let take = (chunk_size - start).min(remaining.len());
        patches.push((chunk_index, start, &remaining[..take]));
        remaining = &remaining[take..];
        new_number_chunks = new_number_chunks.max(chunk_index + 1);
        cursor = (chunk_index as usize + 1) * chunk_size;
    }

    if dropped_bytes > 0 && number_chunks < max_chunks {
        warn!(
            request_id,
            try_number, dropped_bytes, "Output cap reached, dropping excess bytes"
        );
    }

    if patches.is_empty() {
        return Ok(AppendOutcome {
            number_chunks: new_number_chunks,
            dropped_bytes,
        });
    }

    let mut to_save = Vec::with_capacity(patches.len());
    for (chunk_index, start, piece) in patches {
        let mut chunk = chunk_store::get(conn, request_id, try_number, chunk_index)?
            .unwrap_or(OutputChunk {
                request_id,
                try_number,
                chunk_index,
                data: Vec::new(),
                gaps: Vec::new(),
            });
        patch_chunk(&mut chunk, start, piece);
        to_save.push(chunk);
    }
    chunk_store::put_many(conn, &to_save)?;

    Ok(AppendOutcome {
        number_chunks: new_number_chunks,
        dropped_bytes,
    })
}

/// Applies one patch to a chunk, zero-filling ahead of the write and
/// maintaining the gap list.
fn patch_chunk(chunk: &mut OutputChunk, start: usize, piece: &[u8]) {
    let end = start + piece.len();

    if chunk.data.len() < start {
        // The write lands past the current end: the skipped region becomes
        // a gap of zeros until something writes into it.
        chunk.gaps.push((chunk.data.len() as u32, start as u32));
        chunk.data.resize(start, 0);
    }

    // Strip or split gaps the write covers. All offsets are relative to the
    // chunk start.
    let start = start as u32;
    let end = end as u32;
    let mut new_gaps = Vec::with_capacity(chunk.gaps.len());
    for &(mut gap_start, mut gap_end) in &chunk.gaps {
        // Write covers the head of the gap.
        if start <= gap_start && gap_start <= end && end <= gap_end {
            gap_start = end;
        }
        // Write covers the tail of the gap.
        if gap_start <= start && start <= gap_end && gap_end <= end {
            gap_end = start;
        }
        // Write covers the whole gap.
        if start <= gap_start && gap_start <= end && start <= gap_end && gap_end <= end {
            continue;
        }
        // Write lands strictly inside the gap: split it.
        if gap_start < start && start < gap_end && gap_start <= end && end <= gap_end {
            new_gaps.push((gap_start, start));
            new_gaps.push((end, gap_end));
        } else {
            new_gaps.push((gap_start, gap_end));
        }
    }
    chunk.gaps = new_gaps;

    let start = start as usize;
    let end = end as usize;
    if chunk.data.len() < end {
        chunk.data.resize(end, 0);
    }
    chunk.data[start..end].copy_from_slice(piece);
}

/// Reassembles a run's output stream.
///
/// Missing chunks and unwritten gap regions read as zero bytes. The result
/// is capped at `max_bytes`.
pub fn assemble(
    conn: &Connection,
    request_id: i64,
    try_number: u32,
    number_chunks: u32,
    chunk_size: usize,
    max_bytes: usize,
) -> Result<Vec<u8>> {
    if number_chunks == 0 {
        return Ok(Vec::new());
    }
    let fetch_chunks = number_chunks.min((max_bytes / chunk_size).max(1) as u32);
    let stored = chunk_store::get_range(conn, request_id, try_number, fetch_chunks)?;

    let mut by_index: Vec<Option<Vec<u8>>> = vec![None; fetch_chunks as usize];
    for chunk in stored {
        if (chunk.chunk_index as usize) < by_index.len() {
            by_index[chunk.chunk_index as usize] = Some(chunk.data);
        }
    }

    let mut assembled = Vec::new();
    let last = by_index.len() - 1;
    for (index, data) in by_index.into_iter().enumerate() {
        match data {
            Some(bytes) => assembled.extend_from_slice(&bytes),
            // A chunk that was never written at all reads as zeros, except
            // a missing trailing chunk which contributes nothing.
            None if index < last => assembled.resize(assembled.len() + chunk_size, 0),
            None => {}
        }
    }
    assembled.truncate(max_bytes);
    Ok(assembled)
}
