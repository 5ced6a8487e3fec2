//! Configuration types and validation for the task scheduling service
//!
//! This module defines the configuration structures loaded from
//! `server.toml` and `machine_types.toml`, including validation logic and
//! serialization support.

use crate::capabilities::CapabilitySet;
use crate::defaults::*;
use serde::{Deserialize, Serialize};

/// Main scheduler configuration loaded from server.toml
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    /// Address and port the API listens on
    pub listen_address: String,
    /// Pre-shared secret key for authentication
    pub api_key: String,
    /// Directory holding the scheduler database
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Path to the machine types configuration; lease management is disabled
    /// when unset
    #[serde(default)]
    pub machine_types_file: Option<String>,
    /// Base URL machines are instructed to connect back to
    #[serde(default)]
    pub server_url: Option<String>,
    /// Base URL of the machine provider API
    #[serde(default)]
    pub machine_provider_url: Option<String>,

    // Scheduler core tuning
    /// Seconds of silence from a running bot before it is declared dead
    #[serde(default = "default_bot_ping_tolerance_secs")]
    pub bot_ping_tolerance_secs: u32,
    /// Soft TTL of the negative-lookup cache in seconds
    #[serde(default = "default_negative_cache_ttl_secs")]
    pub negative_cache_ttl_secs: u32,
    /// Capacity of the negative-lookup cache
    #[serde(default = "default_negative_cache_capacity")]
    pub negative_cache_capacity: usize,
    /// Transaction retries when claiming a queue entry
    #[serde(default = "default_claim_retries")]
    pub claim_retries: u32,
    /// Transaction retries when expiring a queue entry
    #[serde(default = "default_expire_retries")]
    pub expire_retries: u32,
    /// Maximum expired entries handled inline within one bot poll
    #[serde(default = "default_inline_expiration_limit")]
    pub inline_expiration_limit: u32,
    /// Wall-clock budget for scanning the queue during one poll, seconds
    #[serde(default = "default_poll_scan_deadline_secs")]
    pub poll_scan_deadline_secs: u32,
    /// Pause a bot is told to take when nothing was reaped, seconds
    #[serde(default = "default_poll_sleep_secs")]
    pub poll_sleep_secs: u32,

    // Output storage
    /// Size of one stored output chunk in bytes
    #[serde(default = "default_output_chunk_size")]
    pub output_chunk_size: usize,
    /// Cap on stored output per run in bytes (clamped to the hard limit)
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    // Deduplication
    /// Age window within which a prior idempotent result may be reused
    #[serde(default = "default_dedup_window_secs")]
    pub dedup_window_secs: u32,

    // Background loop intervals
    #[serde(default = "default_expire_sweep_interval_secs")]
    pub expire_sweep_interval_secs: u64,
    #[serde(default = "default_dead_bot_sweep_interval_secs")]
    pub dead_bot_sweep_interval_secs: u64,
    #[serde(default = "default_dedup_sweep_interval_secs")]
    pub dedup_sweep_interval_secs: u64,
    #[serde(default = "default_utilization_interval_secs")]
    pub utilization_interval_secs: u64,
    #[serde(default = "default_lease_tick_interval_secs")]
    pub lease_tick_interval_secs: u64,
    #[serde(default = "default_outbox_drain_interval_secs")]
    pub outbox_drain_interval_secs: u64,
    #[serde(default = "default_wal_checkpoint_interval_secs")]
    pub wal_checkpoint_interval_secs: u64,

    // Lease sizing policy
    /// Multiplier applied to the busy-bot count by load-based sizing
    #[serde(default = "default_scale_up_factor")]
    pub scale_up_factor: f64,
    /// Floor, as a fraction of the current target, below which one tick may
    /// not shrink a machine type
    #[serde(default = "default_scale_down_dampener")]
    pub scale_down_dampener: f64,

    // Request validation bounds
    #[serde(default = "default_max_slices")]
    pub max_slices: usize,
    #[serde(default = "default_max_slice_expiration_secs")]
    pub max_slice_expiration_secs: u32,
    #[serde(default = "default_max_execution_timeout_secs")]
    pub max_execution_timeout_secs: u32,
    #[serde(default = "default_termination_expiration_secs")]
    pub termination_expiration_secs: u32,

    // API surface
    #[serde(default = "default_rate_limit_window_secs")]
    pub rate_limit_window_secs: u32,
    #[serde(default = "default_rate_limit_max_requests")]
    pub rate_limit_max_requests: usize,
    #[serde(default = "default_graceful_shutdown_timeout_secs")]
    pub graceful_shutdown_timeout_secs: u64,
}

impl SchedulerConfig {
    /// Parses and validates a configuration document.
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        let mut config: SchedulerConfig =
            toml::from_str(content).map_err(|e| anyhow::anyhow!("Invalid server config: {}", e))?;
        config.validate()?;
        if config.max_output_bytes > OUTPUT_HARD_LIMIT_BYTES {
            tracing::warn!(
                configured = config.max_output_bytes,
                clamped = OUTPUT_HARD_LIMIT_BYTES,
                "max_output_bytes exceeds the hard limit, clamping"
            );
            config.max_output_bytes = OUTPUT_HARD_LIMIT_BYTES;
        }
        Ok(config)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.listen_address.is_empty() {
            anyhow::bail!("listen_address cannot be empty");
        }
        if self.api_key.len() < 16 {
            anyhow::bail!("api_key must be at least 16 characters");
        }
        if self.bot_ping_tolerance_secs == 0 {
            anyhow::bail!("bot_ping_tolerance_secs must be positive");
        }
        if self.output_chunk_size == 0 {
            anyhow::bail!("output_chunk_size must be positive");
        }
        if self.max_output_bytes < self.output_chunk_size {
            anyhow::bail!("max_output_bytes must be at least one chunk");
        }
        if self.max_slices == 0 {
            anyhow::bail!("max_slices must be positive");
        }
        if !(1.0..=10.0).contains(&self.scale_up_factor) {
            anyhow::bail!("scale_up_factor must be within [1.0, 10.0]");
        }
        if !(0.0..=1.0).contains(&self.scale_down_dampener) {
            anyhow::bail!("scale_down_dampener must be within [0.0, 1.0]");
        }
        if let Some(url) = &self.server_url {
            crate::utils::validate_url(url)?;
        }
        if let Some(url) = &self.machine_provider_url {
            crate::utils::validate_url(url)?;
        }
        Ok(())
    }
}

/// Machine types configuration loaded from machine_types.toml
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MachineTypesConfig {
    /// Classes of leasable machines the lease manager maintains
    #[serde(default)]
    pub machine_types: Vec<MachineTypeConfig>,
}

impl MachineTypesConfig {
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        let config: MachineTypesConfig = toml::from_str(content)
            .map_err(|e| anyhow::anyhow!("Invalid machine types config: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::Result<()> {
        let mut seen = std::collections::HashSet::new();
        for mt in &self.machine_types {
            mt.validate()?;
            if !seen.insert(mt.name.as_str()) {
                anyhow::bail!("Duplicate machine type '{}'", mt.name);
            }
        }
        Ok(())
    }
}

/// One class of leasable machine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MachineTypeConfig {
    pub name: String,
    /// Disabled machine types have all their slots drained
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Capability template passed to the provider
    pub capabilities: CapabilitySet,
    /// Baseline number of slots, used outside any schedule interval and when
    /// no load-based policy applies
    pub target_size: u32,
    #[serde(default = "default_lease_duration_secs")]
    pub lease_duration_secs: u32,
    /// Release leases this many seconds before their expiration
    #[serde(default)]
    pub early_release_secs: u32,
    /// Request leases with no expiration
    #[serde(default)]
    pub leased_indefinitely: bool,
    /// Daily schedule intervals overriding the target size
    #[serde(default)]
    pub schedule: Vec<ScheduleInterval>,
    /// Load-based sizing bounds; active outside schedule intervals
    #[serde(default)]
    pub load_based: Option<LoadBasedPolicy>,
}

fn default_true() -> bool {
    true
}

impl MachineTypeConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if self.name.is_empty() {
            anyhow::bail!("Machine type name cannot be empty");
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
        {
            anyhow::bail!("Machine type name '{}' contains invalid characters", self.name);
        }
        self.capabilities.validate()?;
        if self.lease_duration_secs == 0 && !self.leased_indefinitely {
            anyhow::bail!(
                "Machine type '{}': lease_duration_secs must be positive",
                self.name
            );
        }
        if self.early_release_secs >= self.lease_duration_secs && !self.leased_indefinitely {
            anyhow::bail!(
                "Machine type '{}': early_release_secs must be below the lease duration",
                self.name
            );
        }
        for interval in &self.schedule {
            interval.validate(&self.name)?;
        }
        if let Some(policy) = &self.load_based {
            policy.validate(&self.name)?;
        }
        Ok(())
    }
}

/// A daily interval during which a machine type has a fixed target size.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduleInterval {
    /// Days of the week this interval applies to, 0 = Monday through
    /// 6 = Sunday. Empty means every day.
    #[serde(default)]
    pub days_of_week: Vec<u8>,
    /// Interval start, "HH:MM" in UTC
    pub start: String,
    /// Interval end, "HH:MM" in UTC, inclusive
    pub end: String,
    pub target_size: u32,
}

impl ScheduleInterval {
    pub fn validate(&self, machine_type: &str) -> crate::Result<()> {
        for day in &self.days_of_week {
            if *day > 6 {
                anyhow::bail!(
                    "Machine type '{}': day of week {} out of range 0-6",
                    machine_type,
                    day
                );
            }
        }
        let start = parse_hh_mm(&self.start)
            .map_err(|e| anyhow::anyhow!("Machine type '{}': {}", machine_type, e))?;
        let end = parse_hh_mm(&self.end)
            .map_err(|e| anyhow::anyhow!("Machine type '{}': {}", machine_type, e))?;
        if start >= end {
            anyhow::bail!(
                "Machine type '{}': schedule interval {}-{} is empty",
                machine_type,
                self.start,
                self.end
            );
        }
        Ok(())
    }
}

/// Bounds for load-based machine type sizing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoadBasedPolicy {
    pub minimum_size: u32,
    pub maximum_size: u32,
}

impl LoadBasedPolicy {
    pub fn validate(&self, machine_type: &str) -> crate::Result<()> {
        if self.minimum_size > self.maximum_size {
            anyhow::bail!(
                "Machine type '{}': minimum_size {} exceeds maximum_size {}",
                machine_type,
                self.minimum_size,
                self.maximum_size
            );
        }
        Ok(())
    }
}

/// Parses "HH:MM" into minutes since midnight.
pub fn parse_hh_mm(value: &str) -> crate::Result<u32> {
    let (h, m) = value
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("Invalid time '{}': expected HH:MM", value))?;
    let hours: u32 = h
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid time '{}': bad hour", value))?;
    let minutes: u32 = m
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid time '{}': bad minute", value))?;
    if hours > 23 || minutes > 59 {
        anyhow::bail!("Invalid time '{}': out of range", value);
    }
    Ok(hours * 60 + minutes)
}
