//! Tests for identifier encoding and utility functions

use crate::utils::{
    blake3_hex, compose_request_id, decode_base64, encode_base64, format_run_id, format_task_id,
    pack_queue_number, parse_run_id, parse_task_id, request_id_created_ms, validate_bot_id,
    validate_notify_topic,
};

#[test]
fn test_request_id_round_trips_creation_time() {
    let created_ms = 1_700_000_000_000i64;
    let id = compose_request_id(created_ms, 0x1234);
    assert!(id >= 0);
    assert_eq!(request_id_created_ms(id), created_ms);
}

#[test]
fn test_newer_request_ids_sort_first() {
    let older = compose_request_id(1_700_000_000_000, 7);
    let newer = compose_request_id(1_700_000_060_000, 7);
    // Ascending key order yields newest first.
    assert!(newer < older);
}

#[test]
fn test_task_id_round_trip() {
    let id = compose_request_id(1_700_000_000_000, 42);
    let formatted = format_task_id(id);
    assert_eq!(formatted.len(), 16);
    assert_eq!(parse_task_id(&formatted).unwrap(), id);
}

#[test]
fn test_parse_task_id_rejects_garbage() {
    assert!(parse_task_id("").is_err());
    assert!(parse_task_id("zzzzzzzzzzzzzzzz").is_err());
    assert!(parse_task_id("1234").is_err());
}

#[test]
fn test_run_id_round_trip() {
    let id = compose_request_id(1_700_000_000_000, 3);
    let run_id = format_run_id(id, 2);
    let (parsed_id, try_number) = parse_run_id(&run_id).unwrap();
    assert_eq!(parsed_id, id);
    assert_eq!(try_number, 2);
}

#[test]
fn test_run_id_try_zero_is_invalid() {
    let id = compose_request_id(1_700_000_000_000, 3);
    assert!(parse_run_id(&format!("{:016x}-0", id)).is_err());
}

#[test]
fn test_queue_number_orders_priority_then_age() {
    let urgent_old = pack_queue_number(10, 1_000);
    let urgent_new = pack_queue_number(10, 2_000);
    let relaxed_old = pack_queue_number(50, 1_000);

    assert!(urgent_old < urgent_new);
    assert!(urgent_new < relaxed_old);
}

#[test]
fn test_blake3_hex_shape() {
    let digest = blake3_hex(b"hello");
    assert_eq!(digest.len(), 64);
    assert_eq!(digest, blake3_hex(b"hello"));
    assert_ne!(digest, blake3_hex(b"hello "));
}

#[test]
fn test_validate_bot_id() {
    assert!(validate_bot_id("bot-1.internal").is_ok());
    assert!(validate_bot_id("").is_err());
    assert!(validate_bot_id("-leading").is_err());
    assert!(validate_bot_id("has space").is_err());
    assert!(validate_bot_id(&"x".repeat(129)).is_err());
}

#[test]
fn test_validate_notify_topic() {
    assert!(validate_notify_topic("projects/demo/topics/task-done").is_ok());
    assert!(validate_notify_topic("").is_err());
    assert!(validate_notify_topic("bad topic").is_err());
}

#[test]
fn test_validate_tag() {
    use crate::utils::validate_tag;
    assert!(validate_tag("build:release").is_ok());
    assert!(validate_tag("os:ubuntu-22.04").is_ok());
    assert!(validate_tag("no-colon").is_err());
    assert!(validate_tag("key:with space").is_err());
}

#[test]
fn test_base64_round_trip() {
    let payload = vec![0u8, 1, 2, 253, 254, 255];
    let encoded = encode_base64(&payload);
    assert_eq!(decode_base64(&encoded).unwrap(), payload);
    assert!(decode_base64("not base64!!").is_err());
}
