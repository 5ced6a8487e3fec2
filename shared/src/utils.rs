//! Utility functions for the task scheduling service
//!
//! Identifier encoding, BLAKE3 hashing and input validation shared by the
//! server and API clients. Anything time-dependent in the scheduler goes
//! through the server's injected clock instead of reading wall time here.

use base64::{engine::general_purpose::STANDARD as B64_STANDARD, Engine as _};
use blake3::Hasher;

/// Request ids are 63-bit non-negative integers.
pub const REQUEST_ID_MASK: i64 = 0x7FFF_FFFF_FFFF_FFFF;

// Layout of the raw id: creation time in milliseconds shifted past a 16-bit
// random suffix and a 4-bit version nibble. The stored id is the raw value
// XORed against the 63-bit mask, so newer requests sort FIRST in ascending
// key order. That makes "most recent matching result" queries a plain
// ascending index scan.
const TIMESTAMP_SHIFT: u32 = 20;
const SUFFIX_SHIFT: u32 = 4;
const ID_VERSION: i64 = 0x1;

/// Composes a request id from a creation timestamp and a random suffix.
pub fn compose_request_id(created_ms: i64, suffix: u16) -> i64 {
    let raw = (created_ms << TIMESTAMP_SHIFT) | ((suffix as i64) << SUFFIX_SHIFT) | ID_VERSION;
    REQUEST_ID_MASK ^ raw
}

/// Recovers the creation timestamp (milliseconds) encoded in a request id.
pub fn request_id_created_ms(request_id: i64) -> i64 {
    (REQUEST_ID_MASK ^ request_id) >> TIMESTAMP_SHIFT
}

/// Formats a request id as the external 16-character hex task id.
pub fn format_task_id(request_id: i64) -> String {
    format!("{:016x}", request_id)
}

/// Parses an external task id back into a request id.
pub fn parse_task_id(task_id: &str) -> crate::Result<i64> {
    if task_id.len() != 16 {
        anyhow::bail!("Invalid task id '{}': expected 16 hex characters", task_id);
    }
    let id = i64::from_str_radix(task_id, 16)
        .map_err(|e| anyhow::anyhow!("Invalid task id '{}': {}", task_id, e))?;
    if id < 0 {
        anyhow::bail!("Invalid task id '{}': out of range", task_id);
    }
    Ok(id)
}

/// Formats a run id: the task id plus the 1-based try number.
pub fn format_run_id(request_id: i64, try_number: u32) -> String {
    format!("{:016x}-{}", request_id, try_number)
}

/// Parses a run id into `(request_id, try_number)`.
pub fn parse_run_id(run_id: &str) -> crate::Result<(i64, u32)> {
    let (task_part, try_part) = run_id
        .split_once('-')
        .ok_or_else(|| anyhow::anyhow!("Invalid run id '{}': missing try number", run_id))?;
    let request_id = parse_task_id(task_part)?;
    let try_number: u32 = try_part
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid run id '{}': {}", run_id, e))?;
    if try_number == 0 {
        anyhow::bail!("Invalid run id '{}': try number must be >= 1", run_id);
    }
    Ok((request_id, try_number))
}

// The queue number packs the priority bucket into the high bits and the
// request creation time (milliseconds) into the low 48 bits, so an ascending
// scan serves urgent-then-oldest.
const QUEUE_TIMESTAMP_BITS: u32 = 48;
const QUEUE_TIMESTAMP_MASK: i64 = (1 << QUEUE_TIMESTAMP_BITS) - 1;

/// Packs a priority and creation timestamp into a queue ordering key.
pub fn pack_queue_number(priority: u8, created_ms: i64) -> i64 {
    ((priority as i64) << QUEUE_TIMESTAMP_BITS) | (created_ms & QUEUE_TIMESTAMP_MASK)
}

/// Calculate the BLAKE3 hash of a byte slice as a hex string (64 characters).
pub fn blake3_hex(content: &[u8]) -> String {
    let mut hasher = Hasher::new();
    hasher.update(content);
    hasher.finalize().to_hex().to_string()
}

/// Validate bot ID format
///
/// Bot IDs must contain only alphanumeric characters, hyphens, underscores
/// and dots. They must not be empty and should be reasonable in length.
pub fn validate_bot_id(bot_id: &str) -> crate::Result<()> {
    if bot_id.is_empty() {
        anyhow::bail!("Bot ID cannot be empty");
    }
    if bot_id.len() > 128 {
        anyhow::bail!(
            "Bot ID too long: {} characters (max 128)",
            bot_id.len()
        );
    }
    if !bot_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        anyhow::bail!(
            "Bot ID can only contain alphanumeric characters, hyphens, underscores and dots"
        );
    }
    if bot_id.starts_with('-') || bot_id.ends_with('-') {
        anyhow::bail!("Bot ID cannot start or end with a hyphen");
    }
    Ok(())
}

/// Validate a pub/sub style notification topic.
///
/// Topics look like `projects/<project>/topics/<name>`; we only enforce a
/// conservative character set and length, the sink does the rest.
pub fn validate_notify_topic(topic: &str) -> crate::Result<()> {
    if topic.is_empty() {
        anyhow::bail!("Notification topic cannot be empty");
    }
    if topic.len() > 256 {
        anyhow::bail!("Notification topic too long (max 256 characters)");
    }
    if !topic
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | '%'))
    {
        anyhow::bail!("Notification topic contains invalid characters");
    }
    Ok(())
}

/// Validate a task tag of the form `key:value`.
pub fn validate_tag(tag: &str) -> crate::Result<()> {
    if tag.len() > 256 {
        anyhow::bail!("Tag too long (max 256 characters)");
    }
    let pattern = regex::Regex::new(r"^[a-zA-Z0-9_\-.]+:[^\s]+$")
        .map_err(|e| anyhow::anyhow!("Tag pattern failed to compile: {}", e))?;
    if !pattern.is_match(tag) {
        anyhow::bail!("Invalid tag '{}': expected key:value", tag);
    }
    Ok(())
}

/// Validate a provider or callback URL.
pub fn validate_url(value: &str) -> crate::Result<()> {
    let parsed = url::Url::parse(value)
        .map_err(|e| anyhow::anyhow!("Invalid URL '{}': {}", value, e))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        anyhow::bail!("Invalid URL '{}': only http/https supported", value);
    }
    Ok(())
}

/// Encode bytes to base64
pub fn encode_base64(content: &[u8]) -> String {
    B64_STANDARD.encode(content)
}

/// Decode a base64 string into bytes
pub fn decode_base64(encoded: &str) -> crate::Result<Vec<u8>> {
    B64_STANDARD
        .decode(encoded)
        .map_err(|e| anyhow::anyhow!("Invalid base64 sequence: {}", e))
}
