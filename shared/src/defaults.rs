//! Default values for configuration parameters
//!
//! This module centralizes the default value functions used by the
//! configuration structures. They are referenced by serde when a
//! configuration file omits an optional field.

// Scheduler core defaults

/// Default tolerated silence from a running bot before it is declared dead
/// (6 minutes).
pub fn default_bot_ping_tolerance_secs() -> u32 {
    360
}

/// Default soft TTL of the negative-lookup cache (15 seconds).
pub fn default_negative_cache_ttl_secs() -> u32 {
    15
}

/// Default capacity of the negative-lookup cache.
pub fn default_negative_cache_capacity() -> usize {
    8192
}

/// Default transaction retries for the claim path (no retry: a lost claim
/// just moves on to the next candidate).
pub fn default_claim_retries() -> u32 {
    0
}

/// Default transaction retries for queue-entry expiration.
pub fn default_expire_retries() -> u32 {
    4
}

/// Default cap on inline expirations handled within a single bot poll.
pub fn default_inline_expiration_limit() -> u32 {
    5
}

/// Default wall-clock budget for scanning the queue during one poll.
pub fn default_poll_scan_deadline_secs() -> u32 {
    5
}

/// Default pause a bot is told to take when nothing was reaped.
pub fn default_poll_sleep_secs() -> u32 {
    10
}

// Output storage defaults

/// Default size of one stored output chunk (100 KiB).
pub fn default_output_chunk_size() -> usize {
    100 * 1024
}

/// Default cap on stored output per run (16 MiB).
pub fn default_max_output_bytes() -> usize {
    16 * 1024 * 1024
}

/// Hard ceiling on stored output per run (100 MiB); configuration above this
/// is clamped.
pub const OUTPUT_HARD_LIMIT_BYTES: usize = 100 * 1024 * 1024;

// Deduplication defaults

/// Default window within which a prior successful idempotent result may be
/// reused (7 days).
pub fn default_dedup_window_secs() -> u32 {
    7 * 24 * 3600
}

// Sweep and loop intervals

pub fn default_expire_sweep_interval_secs() -> u64 {
    60
}

pub fn default_dead_bot_sweep_interval_secs() -> u64 {
    60
}

pub fn default_dedup_sweep_interval_secs() -> u64 {
    300
}

pub fn default_utilization_interval_secs() -> u64 {
    60
}

pub fn default_lease_tick_interval_secs() -> u64 {
    60
}

pub fn default_outbox_drain_interval_secs() -> u64 {
    30
}

/// Default WAL checkpoint interval (1 hour).
pub fn default_wal_checkpoint_interval_secs() -> u64 {
    3600
}

// Lease sizing defaults

/// Default multiplier applied to the busy-bot count by load-based sizing.
pub fn default_scale_up_factor() -> f64 {
    1.5
}

/// Default floor, as a fraction of the current target, below which a single
/// tick may not shrink a machine type.
pub fn default_scale_down_dampener() -> f64 {
    0.99
}

/// Default lease duration requested from the provider (1 day).
pub fn default_lease_duration_secs() -> u32 {
    24 * 3600
}

// Request validation defaults

/// Default maximum number of slices per request.
pub fn default_max_slices() -> usize {
    8
}

/// Default ceiling on a slice expiration (7 days).
pub fn default_max_slice_expiration_secs() -> u32 {
    7 * 24 * 3600
}

/// Default ceiling on an execution timeout (3 days).
pub fn default_max_execution_timeout_secs() -> u32 {
    3 * 24 * 3600
}

/// Default expiration of a synthetic bot-termination task (5 days).
pub fn default_termination_expiration_secs() -> u32 {
    5 * 24 * 3600
}

// API surface defaults

/// Default rate limit window for bot polls (seconds).
pub fn default_rate_limit_window_secs() -> u32 {
    60
}

/// Default maximum polls per bot within the rate limit window.
pub fn default_rate_limit_max_requests() -> usize {
    120
}

/// Default wait for in-flight work during shutdown (seconds).
pub fn default_graceful_shutdown_timeout_secs() -> u64 {
    30
}

/// Default data directory for the scheduler database.
pub fn default_data_dir() -> String {
    "./data".to_string()
}
