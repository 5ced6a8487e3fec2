//! Task, run and bot entity types
//!
//! The four-entity chain at the heart of the scheduler: an immutable
//! `TaskRequest` with one or more `TaskSlice` alternatives, a mutable
//! `ResultSummary` tracking the request's outcome, at most one live
//! `TaskToRun` queue entry, and one `RunResult` per bot execution attempt.
//! Bot and machine-lease records used by the dispatch and lease layers live
//! here too so the server and its tests share a single definition.

use crate::capabilities::CapabilitySet;
use crate::utils::{format_run_id, format_task_id, pack_queue_number};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Task lifecycle states stored on the result summary and on each run.
///
/// `Pending` and `Running` are the only non-terminal states. A summary with
/// `try_number == 0` is always a deduplicated `Completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    TimedOut,
    Killed,
    Canceled,
    Expired,
    BotDied,
    NoResource,
}

impl TaskState {
    /// Integer encoding used in storage.
    pub fn as_i64(self) -> i64 {
        match self {
            TaskState::Pending => 1,
            TaskState::Running => 2,
            TaskState::Completed => 3,
            TaskState::TimedOut => 4,
            TaskState::Killed => 5,
            TaskState::Canceled => 6,
            TaskState::Expired => 7,
            TaskState::BotDied => 8,
            TaskState::NoResource => 9,
        }
    }

    pub fn from_i64(value: i64) -> crate::Result<Self> {
        Ok(match value {
            1 => TaskState::Pending,
            2 => TaskState::Running,
            3 => TaskState::Completed,
            4 => TaskState::TimedOut,
            5 => TaskState::Killed,
            6 => TaskState::Canceled,
            7 => TaskState::Expired,
            8 => TaskState::BotDied,
            9 => TaskState::NoResource,
            other => anyhow::bail!("Unknown task state {}", other),
        })
    }

    /// True once the summary can never change state again (the completion
    /// notification may still fire asynchronously).
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskState::Pending | TaskState::Running)
    }

    /// Terminal states other than a clean completion. Used by the lease
    /// manager to decide whether a termination task needs rescheduling.
    pub fn is_exceptional(self) -> bool {
        self.is_terminal() && self != TaskState::Completed
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::TimedOut => "timed_out",
            TaskState::Killed => "killed",
            TaskState::Canceled => "canceled",
            TaskState::Expired => "expired",
            TaskState::BotDied => "bot_died",
            TaskState::NoResource => "no_resource",
        };
        f.write_str(name)
    }
}

/// One alternative capability requirement inside a task request.
///
/// Slices are tried in order: the queue entry for slice `i` is abandoned if
/// no bot claims it within `expiration_secs`, at which point the scheduler
/// falls back to the first later slice with capacity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSlice {
    /// Capability set a bot must advertise to be handed this slice.
    pub capabilities: CapabilitySet,
    /// Seconds this slice's queue entry may wait for a bot before expiring.
    pub expiration_secs: u32,
    /// Treat the slice as having capacity even when no live bot matches.
    #[serde(default)]
    pub wait_for_capacity: bool,
    /// Whether a prior equal successful result may substitute for this one.
    #[serde(default)]
    pub idempotent: bool,
    /// Command line to run. Empty for the synthetic bot-termination task.
    #[serde(default)]
    pub command: Vec<String>,
    /// Extra environment for the command.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Opaque reference to the content-addressed input bundle.
    #[serde(default)]
    pub inputs_ref: Option<String>,
    /// Hard limit on command runtime, seconds.
    pub execution_timeout_secs: u32,
    /// Limit on silence on the command's output stream, seconds.
    #[serde(default)]
    pub io_timeout_secs: u32,
    /// Grace period between SIGTERM and SIGKILL on timeout, seconds.
    #[serde(default)]
    pub grace_period_secs: u32,
}

impl TaskSlice {
    /// Hash of the deterministic content of this slice, used for idempotent
    /// deduplication. Everything that affects the outcome participates:
    /// command, environment, inputs and the capability requirement itself.
    pub fn properties_hash(&self, secret: Option<&[u8]>) -> String {
        #[derive(Serialize)]
        struct Deterministic<'a> {
            command: &'a [String],
            env: &'a BTreeMap<String, String>,
            inputs_ref: &'a Option<String>,
            capabilities: &'a CapabilitySet,
            secret: Option<&'a [u8]>,
        }
        let blob = serde_json::to_vec(&Deterministic {
            command: &self.command,
            env: &self.env,
            inputs_ref: &self.inputs_ref,
            capabilities: &self.capabilities,
            secret,
        })
        .unwrap_or_default();
        crate::utils::blake3_hex(&blob)
    }
}

/// Immutable task descriptor. Created once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    /// 63-bit id encoding creation time; newer ids sort first.
    pub id: i64,
    pub name: String,
    /// Smaller value means more urgent.
    pub priority: u8,
    pub created_ts_ms: i64,
    /// Deadline past which no slice may still be waiting: creation time plus
    /// the sum of all slice expirations.
    pub expiration_ts_ms: i64,
    /// Alternatives in preferred order; never empty.
    pub slices: Vec<TaskSlice>,
    /// Run id of the task that spawned this one, if any.
    #[serde(default)]
    pub parent_run_id: Option<String>,
    /// Completion notification target.
    #[serde(default)]
    pub notify_topic: Option<String>,
    /// Opaque payload echoed in the completion notification.
    #[serde(default)]
    pub notify_userdata: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Whether a secret input blob is stored alongside this request.
    #[serde(default)]
    pub has_secret: bool,
}

impl TaskRequest {
    pub fn task_id(&self) -> String {
        format_task_id(self.id)
    }

    /// Returns the slice at `index`, clamped to the last slice.
    pub fn slice(&self, index: u32) -> &TaskSlice {
        let i = (index as usize).min(self.slices.len().saturating_sub(1));
        &self.slices[i]
    }

    /// A synthetic bot-termination task: no command, pinned to one bot.
    pub fn is_termination(&self) -> bool {
        self.slices.len() == 1
            && self.slices[0].command.is_empty()
            && self.slices[0].capabilities.bot_id().is_some()
    }
}

/// One live queue entry per `(request, try, slice)`.
///
/// A non-null `queue_number` means the entry is claimable; clearing it is
/// the atomic claim/cancel operation. At most one entry per request ever has
/// a non-null queue number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskToRun {
    pub request_id: i64,
    pub try_number: u32,
    pub slice_index: u32,
    pub queue_number: Option<i64>,
    pub created_ts_ms: i64,
    /// Moment this entry expires if still unclaimed.
    pub expiration_ts_ms: i64,
    /// Snapshot of the slice's capability requirement, so the dispatch scan
    /// can match without re-reading the request.
    pub capabilities: CapabilitySet,
}

impl TaskToRun {
    /// Builds the queue entry for one slice of a request.
    ///
    /// The queue number orders by the request's original creation time, not
    /// the enqueue time, so slice fallback does not lose queue position.
    pub fn new(request: &TaskRequest, try_number: u32, slice_index: u32, now_ms: i64) -> Self {
        let slice = request.slice(slice_index);
        Self {
            request_id: request.id,
            try_number,
            slice_index,
            queue_number: Some(pack_queue_number(request.priority, request.created_ts_ms)),
            created_ts_ms: now_ms,
            expiration_ts_ms: now_ms + (slice.expiration_secs as i64) * 1000,
            capabilities: slice.capabilities.clone(),
        }
    }

    pub fn is_claimable(&self) -> bool {
        self.queue_number.is_some()
    }

    /// Stable key used by the negative-lookup cache.
    pub fn cache_key(&self) -> String {
        format!(
            "{}-{}-{}",
            format_task_id(self.request_id),
            self.try_number,
            self.slice_index
        )
    }
}

/// A single bot-on-task execution attempt. Exists iff a bot was handed the
/// task; mutated only by bot updates and the dead-bot sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub request_id: i64,
    /// 1-based attempt number; also the id of this run under the summary.
    pub try_number: u32,
    pub bot_id: String,
    pub bot_version: String,
    /// Snapshot of the bot's capability set at claim time.
    pub bot_capabilities: CapabilitySet,
    pub state: TaskState,
    pub current_slice: u32,
    pub started_ts_ms: i64,
    /// Last update received from the bot.
    pub modified_ts_ms: i64,
    pub completed_ts_ms: Option<i64>,
    pub abandoned_ts_ms: Option<i64>,
    pub exit_code: Option<i64>,
    pub duration_secs: Option<f64>,
    /// Set when the scheduler, not the task, failed the run.
    pub internal_failure: bool,
    /// A cancel request is pending; the bot has not yet confirmed the stop.
    pub killing: bool,
    pub cost_usd: f64,
    /// Number of output chunks stored for this run.
    pub output_chunks: u32,
    /// Opaque reference to the uploaded output bundle in the blob store.
    pub outputs_ref: Option<String>,
}

impl RunResult {
    /// Builds the run record created inside the claim transaction.
    pub fn new(
        request: &TaskRequest,
        to_run: &TaskToRun,
        try_number: u32,
        bot_id: &str,
        bot_version: &str,
        bot_capabilities: &CapabilitySet,
        now_ms: i64,
    ) -> Self {
        Self {
            request_id: request.id,
            try_number,
            bot_id: bot_id.to_string(),
            bot_version: bot_version.to_string(),
            bot_capabilities: bot_capabilities.clone(),
            state: TaskState::Running,
            current_slice: to_run.slice_index,
            started_ts_ms: now_ms,
            modified_ts_ms: now_ms,
            completed_ts_ms: None,
            abandoned_ts_ms: None,
            exit_code: None,
            duration_secs: None,
            internal_failure: false,
            killing: false,
            cost_usd: 0.0,
            output_chunks: 0,
            outputs_ref: None,
        }
    }

    pub fn run_id(&self) -> String {
        format_run_id(self.request_id, self.try_number)
    }

    /// Task-level failure: the command ran and exited non-zero.
    pub fn failure(&self) -> bool {
        self.exit_code.map(|code| code != 0).unwrap_or(false)
    }
}

/// The canonical mutable record of a request's outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultSummary {
    pub request_id: i64,
    pub state: TaskState,
    /// 0 for a deduplicated request, 1 for the first attempt, 2 after an
    /// automatic retry.
    pub try_number: u32,
    /// Index into the request's slice list currently being served.
    pub current_slice: u32,
    pub bot_id: Option<String>,
    pub bot_version: Option<String>,
    /// One cost counter per try; index `try - 1`.
    pub costs_usd: Vec<f64>,
    /// Cost of the reused result when this request was deduplicated.
    pub cost_saved_usd: Option<f64>,
    pub created_ts_ms: i64,
    pub started_ts_ms: Option<i64>,
    pub completed_ts_ms: Option<i64>,
    pub abandoned_ts_ms: Option<i64>,
    pub modified_ts_ms: i64,
    pub exit_code: Option<i64>,
    pub duration_secs: Option<f64>,
    pub internal_failure: bool,
    /// Opaque reference to the uploaded output bundle in the blob store.
    pub outputs_ref: Option<String>,
    /// Run id of another request whose successful result substitutes for
    /// this one.
    pub deduped_from: Option<String>,
    /// Published only for reusable results; never set on a deduplicated
    /// summary, which keeps the substitution depth at one.
    pub properties_hash: Option<String>,
    /// Task ids of child requests that named this task as parent.
    pub children_task_ids: Vec<String>,
}

impl ResultSummary {
    /// The summary created atomically with its request.
    pub fn new(request: &TaskRequest) -> Self {
        Self {
            request_id: request.id,
            state: TaskState::Pending,
            try_number: 0,
            current_slice: 0,
            bot_id: None,
            bot_version: None,
            costs_usd: Vec::new(),
            cost_saved_usd: None,
            created_ts_ms: request.created_ts_ms,
            started_ts_ms: None,
            completed_ts_ms: None,
            abandoned_ts_ms: None,
            modified_ts_ms: request.created_ts_ms,
            exit_code: None,
            duration_secs: None,
            internal_failure: false,
            outputs_ref: None,
            deduped_from: None,
            properties_hash: None,
            children_task_ids: Vec::new(),
        }
    }

    pub fn task_id(&self) -> String {
        format_task_id(self.request_id)
    }

    /// Run id of the currently relevant run: the reused run for a
    /// deduplicated summary, otherwise the active try.
    pub fn run_id(&self) -> Option<String> {
        if let Some(deduped) = &self.deduped_from {
            return Some(deduped.clone());
        }
        if self.try_number == 0 {
            return None;
        }
        Some(format_run_id(self.request_id, self.try_number))
    }

    pub fn can_be_canceled(&self) -> bool {
        matches!(self.state, TaskState::Pending | TaskState::Running)
    }

    pub fn failure(&self) -> bool {
        self.exit_code.map(|code| code != 0).unwrap_or(false)
    }

    /// Reverts the summary to pending ahead of an automatic retry. The bot
    /// id is deliberately kept: it lets the claim path refuse handing the
    /// retry back to the bot that just failed it.
    pub fn reset_to_pending(&mut self) {
        self.state = TaskState::Pending;
        self.exit_code = None;
        self.duration_secs = None;
        self.started_ts_ms = None;
        self.internal_failure = false;
        self.outputs_ref = None;
    }

    /// Copies the relevant fields of a run onto this summary.
    ///
    /// Publishes `properties_hash` when the run is a clean completion of an
    /// idempotent slice and the summary is not itself a dedup, which is the
    /// condition for the result to be reusable.
    pub fn set_from_run_result(&mut self, run: &RunResult, request: &TaskRequest) {
        self.state = run.state;
        self.try_number = run.try_number;
        self.current_slice = run.current_slice;
        self.bot_id = Some(run.bot_id.clone());
        self.bot_version = Some(run.bot_version.clone());
        self.started_ts_ms = Some(run.started_ts_ms);
        self.completed_ts_ms = run.completed_ts_ms;
        self.abandoned_ts_ms = run.abandoned_ts_ms;
        self.modified_ts_ms = run.modified_ts_ms;
        self.exit_code = run.exit_code;
        self.duration_secs = run.duration_secs;
        self.internal_failure = run.internal_failure;
        self.outputs_ref = run.outputs_ref.clone();

        while self.costs_usd.len() < run.try_number as usize {
            self.costs_usd.push(0.0);
        }
        self.costs_usd[run.try_number as usize - 1] = run.cost_usd;

        let slice = request.slice(run.current_slice);
        if self.state == TaskState::Completed
            && !self.failure()
            && !self.internal_failure
            && slice.idempotent
            && self.deduped_from.is_none()
        {
            self.properties_hash = Some(slice.properties_hash(None));
        }
    }
}

/// Per-bot persistent state, updated on every poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotRecord {
    pub bot_id: String,
    pub first_seen_ms: i64,
    pub last_seen_ms: i64,
    pub version: String,
    pub capabilities: CapabilitySet,
    /// Run id currently executing on this bot, if any.
    pub active_run: Option<String>,
    /// Lease metadata when this bot was provisioned by the lease manager.
    pub machine_type: Option<String>,
    pub lease_slot: Option<u32>,
    pub lease_expiration_ts_ms: Option<i64>,
    pub leased_indefinitely: bool,
}

/// One slot of a configured machine type, describing one leased machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineLease {
    pub machine_type: String,
    pub slot: u32,
    /// Slot marked for removal; released as soon as the machine is gone.
    pub drained: bool,
    /// Non-null once a lease request was issued to the provider; cleared
    /// when the machine goes away.
    pub client_request_id: Option<String>,
    /// Number of lease requests issued for this slot; part of the request id
    /// so a fresh attempt never reuses a spent id.
    pub request_count: u32,
    pub hostname: Option<String>,
    pub lease_expiration_ts_ms: Option<i64>,
    pub leased_indefinitely: bool,
    /// Configuration snapshot taken when the slot was created.
    pub lease_duration_secs: u32,
    pub early_release_secs: u32,
    pub capabilities: CapabilitySet,
    /// Request id of the termination task scheduled ahead of release.
    pub termination_task_id: Option<i64>,
    /// When the connect instruction was delivered to the machine.
    pub instruction_ts_ms: Option<i64>,
    /// When the machine's bot first polled after the instruction.
    pub connection_ts_ms: Option<i64>,
}

impl MachineLease {
    pub fn lease_key(&self) -> String {
        format!("{}:{}", self.machine_type, self.slot)
    }

    /// The provider-facing request id for the next/current lease attempt.
    pub fn next_client_request_id(&self) -> String {
        format!("{}-{}-{}", self.machine_type, self.slot, self.request_count)
    }
}

/// Busy/idle counts per machine type, refreshed by a periodic sweep and read
/// by the load-based lease sizing policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineUtilization {
    pub machine_type: String,
    pub busy: u32,
    pub idle: u32,
    pub computed_ts_ms: i64,
}
