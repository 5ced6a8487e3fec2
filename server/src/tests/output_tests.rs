//! Tests for chunked output append, gap tracking and reassembly

use crate::output::{append, assemble};
use crate::store::output::get as get_chunk;
use crate::store::ServerStore;
use tempfile::TempDir;

const CHUNK: usize = 10;
const MAX_CHUNKS: u32 = 4;

fn test_store() -> (ServerStore, TempDir) {
    let temp = TempDir::new().unwrap();
    let mut store = ServerStore::new(temp.path()).unwrap();
    store.initialize().unwrap();
    (store, temp)
}

#[test]
fn test_simple_append_and_assemble() {
    let (mut store, _temp) = test_store();
    let conn = store.get_connection().unwrap();

    let outcome = append(conn, 7, 1, 0, b"hello world", 0, CHUNK, MAX_CHUNKS).unwrap();
    assert_eq!(outcome.number_chunks, 2);
    assert_eq!(outcome.dropped_bytes, 0);

    let assembled = assemble(conn, 7, 1, outcome.number_chunks, CHUNK, 1024).unwrap();
    assert_eq!(assembled, b"hello world");
}

#[test]
fn test_append_is_idempotent() {
    let (mut store, _temp) = test_store();
    let conn = store.get_connection().unwrap();

    let first = append(conn, 7, 1, 0, b"same bytes", 3, CHUNK, MAX_CHUNKS).unwrap();
    let second = append(conn, 7, 1, first.number_chunks, b"same bytes", 3, CHUNK, MAX_CHUNKS)
        .unwrap();
    assert_eq!(first.number_chunks, second.number_chunks);

    let chunk0_a = get_chunk(conn, 7, 1, 0).unwrap().unwrap();
    append(conn, 7, 1, second.number_chunks, b"same bytes", 3, CHUNK, MAX_CHUNKS).unwrap();
    let chunk0_b = get_chunk(conn, 7, 1, 0).unwrap().unwrap();
    assert_eq!(chunk0_a, chunk0_b);
}

#[test]
fn test_write_past_end_creates_gap() {
    let (mut store, _temp) = test_store();
    let conn = store.get_connection().unwrap();

    append(conn, 7, 1, 0, b"late", 6, CHUNK, MAX_CHUNKS).unwrap();

    let chunk = get_chunk(conn, 7, 1, 0).unwrap().unwrap();
    assert_eq!(chunk.gaps, vec![(0, 6)]);
    assert_eq!(&chunk.data[..6], &[0u8; 6]);
    assert_eq!(&chunk.data[6..], b"late");
}

#[test]
fn test_filling_a_gap_clears_it() {
    let (mut store, _temp) = test_store();
    let conn = store.get_connection().unwrap();

    append(conn, 7, 1, 0, b"tail", 6, CHUNK, MAX_CHUNKS).unwrap();
    append(conn, 7, 1, 1, b"front!", 0, CHUNK, MAX_CHUNKS).unwrap();

    let chunk = get_chunk(conn, 7, 1, 0).unwrap().unwrap();
    assert!(chunk.gaps.is_empty());
    assert_eq!(chunk.data, b"front!tail");
}

#[test]
fn test_write_inside_a_gap_splits_it() {
    let (mut store, _temp) = test_store();
    let conn = store.get_connection().unwrap();

    // Bytes land at the chunk end, leaving a gap over [0, 8).
    append(conn, 7, 1, 0, b"zz", 8, CHUNK, MAX_CHUNKS).unwrap();
    // A write strictly inside the gap splits it in two.
    append(conn, 7, 1, 1, b"mid", 3, CHUNK, MAX_CHUNKS).unwrap();

    let chunk = get_chunk(conn, 7, 1, 0).unwrap().unwrap();
    assert_eq!(chunk.gaps, vec![(0, 3), (6, 8)]);
    assert_eq!(&chunk.data[3..6], b"mid");
}

#[test]
fn test_partial_gap_overlap_shrinks_it() {
    let (mut store, _temp) = test_store();
    let conn = store.get_connection().unwrap();

    append(conn, 7, 1, 0, b"z", 8, CHUNK, MAX_CHUNKS).unwrap();
    // Covers the head of the [0, 8) gap.
    append(conn, 7, 1, 1, b"head", 0, CHUNK, MAX_CHUNKS).unwrap();

    let chunk = get_chunk(conn, 7, 1, 0).unwrap().unwrap();
    assert_eq!(chunk.gaps, vec![(4, 8)]);
}

#[test]
fn test_cap_truncates_and_keeps_prefix() {
    let (mut store, _temp) = test_store();
    let conn = store.get_connection().unwrap();

    // Capacity is MAX_CHUNKS * CHUNK = 40 bytes; write 50 starting at 35.
    let payload = vec![7u8; 50];
    let outcome = append(conn, 7, 1, 0, &payload, 35, CHUNK, MAX_CHUNKS).unwrap();

    // The five bytes below the cap boundary are kept, the rest dropped.
    assert_eq!(outcome.number_chunks, MAX_CHUNKS);
    assert_eq!(outcome.dropped_bytes, 45);

    let chunk = get_chunk(conn, 7, 1, 3).unwrap().unwrap();
    assert_eq!(chunk.data.len(), CHUNK);
    assert_eq!(&chunk.data[5..], &[7u8; 5]);

    // Fully past the cap: everything is dropped.
    let outcome = append(conn, 7, 1, MAX_CHUNKS, b"overflow", 100, CHUNK, MAX_CHUNKS).unwrap();
    assert_eq!(outcome.dropped_bytes, 8);
    assert_eq!(outcome.number_chunks, MAX_CHUNKS);
}

#[test]
fn test_assemble_reads_missing_chunks_as_zeros() {
    let (mut store, _temp) = test_store();
    let conn = store.get_connection().unwrap();

    // Only the second chunk is ever written.
    let outcome = append(conn, 7, 1, 0, b"0123456789", 10, CHUNK, MAX_CHUNKS).unwrap();
    assert_eq!(outcome.number_chunks, 2);

    let assembled = assemble(conn, 7, 1, outcome.number_chunks, CHUNK, 1024).unwrap();
    assert_eq!(&assembled[..10], &[0u8; 10]);
    assert_eq!(&assembled[10..], b"0123456789");
}

#[test]
fn test_assemble_respects_fetch_limit() {
    let (mut store, _temp) = test_store();
    let conn = store.get_connection().unwrap();

    let payload = vec![1u8; 35];
    let outcome = append(conn, 7, 1, 0, &payload, 0, CHUNK, MAX_CHUNKS).unwrap();

    let assembled = assemble(conn, 7, 1, outcome.number_chunks, CHUNK, 20).unwrap();
    assert_eq!(assembled.len(), 20);
}

#[test]
fn test_empty_append_is_a_noop() {
    let (mut store, _temp) = test_store();
    let conn = store.get_connection().unwrap();

    let outcome = append(conn, 7, 1, 3, b"", 0, CHUNK, MAX_CHUNKS).unwrap();
    assert_eq!(outcome.number_chunks, 3);
    assert_eq!(outcome.dropped_bytes, 0);
    assert!(get_chunk(conn, 7, 1, 0).unwrap().is_none());
}
