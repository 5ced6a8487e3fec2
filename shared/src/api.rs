//! API types and structures for client/bot/server communication
//!
//! This module defines the request and response types used by the REST API
//! endpoints between task clients, bots, the cron driver and the scheduler
//! server.

use crate::capabilities::CapabilitySet;
use crate::tasks::{ResultSummary, TaskState};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub mod endpoints {
    pub const TASK_NEW: &str = "/api/v1/tasks/new";
    pub const TASK_CANCEL: &str = "/api/v1/tasks/{task_id}/cancel";
    pub const TASK_RESULT: &str = "/api/v1/tasks/{task_id}/result";
    pub const BOT_POLL: &str = "/api/v1/bot/poll";
    pub const BOT_UPDATE: &str = "/api/v1/bot/update";
    pub const BOT_KILL_TASK: &str = "/api/v1/bot/kill_task";
    pub const CRON_EXPIRE: &str = "/internal/cron/expire_queue";
    pub const CRON_DEAD_BOTS: &str = "/internal/cron/dead_bots";
    pub const CRON_DEDUP_INDEX: &str = "/internal/cron/dedup_index";
    pub const CRON_UTILIZATION: &str = "/internal/cron/utilization";
    pub const CRON_LEASE_TICK: &str = "/internal/cron/lease_tick";
}

pub mod headers {
    pub const API_KEY: &str = "x-api-key";
}

/// One slice of a new task submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSliceSpec {
    pub capabilities: CapabilitySet,
    pub expiration_secs: u32,
    #[serde(default)]
    pub wait_for_capacity: bool,
    #[serde(default)]
    pub idempotent: bool,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub inputs_ref: Option<String>,
    pub execution_timeout_secs: u32,
    #[serde(default)]
    pub io_timeout_secs: u32,
    #[serde(default)]
    pub grace_period_secs: u32,
}

/// Request body for POST /api/v1/tasks/new
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTaskRequest {
    pub name: String,
    /// 0 (most urgent) to 255.
    pub priority: u8,
    /// Alternatives in preferred order; at least one.
    pub slices: Vec<TaskSliceSpec>,
    #[serde(default)]
    pub parent_run_id: Option<String>,
    #[serde(default)]
    pub notify_topic: Option<String>,
    #[serde(default)]
    pub notify_userdata: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Base64 secret input blob handed to the bot with the task.
    #[serde(default)]
    pub secret_bytes: Option<String>,
    /// Caller-supplied idempotency key: resubmitting with the same key
    /// returns the original summary instead of creating a new task.
    #[serde(default)]
    pub request_key: Option<String>,
}

/// Externally visible view of a result summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSummaryView {
    pub task_id: String,
    pub state: TaskState,
    pub try_number: u32,
    pub current_slice: u32,
    pub bot_id: Option<String>,
    pub exit_code: Option<i64>,
    pub duration_secs: Option<f64>,
    pub internal_failure: bool,
    pub deduped_from: Option<String>,
    pub cost_saved_usd: Option<f64>,
    pub costs_usd: Vec<f64>,
    pub created_ts_ms: i64,
    pub started_ts_ms: Option<i64>,
    pub completed_ts_ms: Option<i64>,
    pub abandoned_ts_ms: Option<i64>,
    pub modified_ts_ms: i64,
    pub children_task_ids: Vec<String>,
    /// Base64 of the reassembled output, when requested and available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl TaskSummaryView {
    pub fn from_summary(summary: &ResultSummary) -> Self {
        Self {
            task_id: summary.task_id(),
            state: summary.state,
            try_number: summary.try_number,
            current_slice: summary.current_slice,
            bot_id: summary.bot_id.clone(),
            exit_code: summary.exit_code,
            duration_secs: summary.duration_secs,
            internal_failure: summary.internal_failure,
            deduped_from: summary.deduped_from.clone(),
            cost_saved_usd: summary.cost_saved_usd,
            costs_usd: summary.costs_usd.clone(),
            created_ts_ms: summary.created_ts_ms,
            started_ts_ms: summary.started_ts_ms,
            completed_ts_ms: summary.completed_ts_ms,
            abandoned_ts_ms: summary.abandoned_ts_ms,
            modified_ts_ms: summary.modified_ts_ms,
            children_task_ids: summary.children_task_ids.clone(),
            output: None,
        }
    }
}

/// Request body for POST /api/v1/tasks/{task_id}/cancel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelRequest {
    /// Allow cancelling a task that already started running.
    #[serde(default)]
    pub kill_running: bool,
    /// Only cancel if the task is running on this bot.
    #[serde(default)]
    pub bot_id: Option<String>,
}

/// Response body for POST /api/v1/tasks/{task_id}/cancel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    pub ok: bool,
    pub was_running: bool,
}

/// Request body for POST /api/v1/bot/poll
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollRequest {
    pub bot_id: String,
    pub version: String,
    pub capabilities: CapabilitySet,
}

/// Everything a bot needs to execute one task slice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskManifest {
    pub run_id: String,
    pub task_id: String,
    pub try_number: u32,
    pub slice_index: u32,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub inputs_ref: Option<String>,
    pub execution_timeout_secs: u32,
    pub io_timeout_secs: u32,
    pub grace_period_secs: u32,
    /// Base64 secret input blob, delivered only here.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_bytes: Option<String>,
}

/// Response body for POST /api/v1/bot/poll
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum PollResponse {
    /// Nothing eligible; poll again after the given pause.
    Sleep { duration_secs: u32 },
    /// A task was reaped for this bot.
    Run { manifest: TaskManifest },
    /// The bot must acknowledge the run and then exit.
    Terminate { run_id: String },
    /// The bot's version is stale; it should update before polling again.
    Update { version: String },
}

/// Request body for POST /api/v1/bot/update
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotUpdateRequest {
    pub run_id: String,
    pub bot_id: String,
    /// Base64 chunk of the task's output stream.
    #[serde(default)]
    pub output: Option<String>,
    /// Byte offset of `output` within the stream.
    #[serde(default)]
    pub output_offset: Option<u64>,
    #[serde(default)]
    pub exit_code: Option<i64>,
    #[serde(default)]
    pub duration_secs: Option<f64>,
    #[serde(default)]
    pub hard_timeout: bool,
    #[serde(default)]
    pub io_timeout: bool,
    #[serde(default)]
    pub cost_usd: Option<f64>,
    /// Opaque reference to the uploaded output bundle.
    #[serde(default)]
    pub outputs_ref: Option<String>,
}

/// Response body for POST /api/v1/bot/update
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotUpdateResponse {
    pub ok: bool,
    /// Advisory state after the update was applied.
    pub state: TaskState,
    /// The bot must kill the task and report the stop.
    pub must_stop: bool,
}

/// Request body for POST /api/v1/bot/kill_task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotKillTaskRequest {
    pub run_id: String,
    pub bot_id: String,
    pub reason: String,
}

/// Generic response for the cron sweep endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepResponse {
    /// Number of entities the sweep acted upon.
    pub acted_on: usize,
}
