//! Task submission
//!
//! Validates a client request, applies idempotent deduplication, decides
//! between PENDING and NO_RESOURCE, and creates the request, summary and
//! first queue entry in one transaction. Also builds the synthetic
//! termination task the lease manager uses to shut a bot down.

use crate::clock::Clock;
use crate::notify::{self, Notifier};
use crate::store::{self, bots, queue, requests, summaries, ServerStore};
use anyhow::Result;
use rand::Rng;
use shared::api::NewTaskRequest;
use shared::capabilities::{CapabilitySet, KEY_BOT_ID, KEY_POOL};
use shared::config::SchedulerConfig;
use shared::tasks::{ResultSummary, TaskRequest, TaskSlice, TaskState, TaskToRun};
use shared::utils::{format_run_id, parse_run_id};
use shared::SchedulerError;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Maximum size of a secret input blob.
const MAX_SECRET_BYTES: usize = 20 * 1024;

/// Maximum number of tags on one request.
const MAX_TAGS: usize = 32;

/// How many dedup candidates to inspect before giving up on a stale index.
const DEDUP_SCAN_LIMIT: usize = 3;

/// How many times to redraw a request id on a creation-time collision.
const ID_ATTEMPTS: u32 = 5;

pub struct SubmissionService {
    store: Arc<Mutex<ServerStore>>,
    clock: Arc<dyn Clock>,
    config: Arc<SchedulerConfig>,
    notifier: Arc<dyn Notifier>,
}

impl SubmissionService {
    pub fn new(
        store: Arc<Mutex<ServerStore>>,
        clock: Arc<dyn Clock>,
        config: Arc<SchedulerConfig>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            clock,
            config,
            notifier,
        }
    }

    /// Creates a new task, returning its summary.
    ///
    /// The summary comes back `Pending` with a live queue entry,
    /// `Completed` with `try_number = 0` when deduplicated against a prior
    /// result, or `NoResource` when no slice has capacity and none waits
    /// for it.
    pub async fn submit(
        &self,
        spec: NewTaskRequest,
        secret: Option<Vec<u8>>,
    ) -> Result<ResultSummary> {
        self.validate_spec(&spec, &secret, false)?;
        self.submit_validated(spec, secret).await
    }

    /// Schedules the synthetic highest-priority task that instructs one bot
    /// to shut down. The poll path recognizes it and answers `terminate`.
    pub async fn terminate_bot(&self, bot_id: &str) -> Result<ResultSummary> {
        shared::utils::validate_bot_id(bot_id)
            .map_err(|e| SchedulerError::Validation(e.to_string()))?;
        let spec = NewTaskRequest {
            name: format!("terminate {}", bot_id),
            priority: 0,
            slices: vec![shared::api::TaskSliceSpec {
                capabilities: CapabilitySet::from_pairs([(KEY_BOT_ID, bot_id)]),
                expiration_secs: self.config.termination_expiration_secs,
                wait_for_capacity: true,
                idempotent: false,
                command: Vec::new(),
                env: Default::default(),
                inputs_ref: None,
                execution_timeout_secs: 300,
                io_timeout_secs: 0,
                grace_period_secs: 0,
            }],
            parent_run_id: None,
            notify_topic: None,
            notify_userdata: None,
            tags: vec![format!("terminate:{}", bot_id)],
            secret_bytes: None,
            request_key: None,
        };
        self.validate_spec(&spec, &None, true)?;
        self.submit_validated(spec, None).await
    }

    /// Read-only lookup of a task's summary.
    pub async fn get_result(&self, request_id: i64) -> Result<Option<ResultSummary>> {
        let mut store = self.store.lock().await;
        let conn = store.get_connection()?;
        summaries::get(conn, request_id)
    }

    /// Reassembles the output of the run backing a summary. For a
    /// deduplicated summary this is the reused run's output. Unwritten
    /// regions read as zero bytes.
    pub async fn get_output(&self, summary: &ResultSummary) -> Result<Option<Vec<u8>>> {
        let Some(run_id) = summary.run_id() else {
            return Ok(None);
        };
        let (request_id, try_number) = parse_run_id(&run_id)?;

        let mut store = self.store.lock().await;
        let conn = store.get_connection()?;
        let Some(run) = crate::store::runs::get(conn, request_id, try_number)? else {
            return Ok(None);
        };
        if run.output_chunks == 0 {
            return Ok(None);
        }
        let output = crate::output::assemble(
            conn,
            request_id,
            try_number,
            run.output_chunks,
            self.config.output_chunk_size,
            self.config.max_output_bytes,
        )?;
        Ok(Some(output))
    }

    async fn submit_validated(
        &self,
        spec: NewTaskRequest,
        secret: Option<Vec<u8>>,
    ) -> Result<ResultSummary> {
        let now = self.clock.now_ms();
        let alive_after = now - (self.config.bot_ping_tolerance_secs as i64) * 1000;

        let slices: Vec<TaskSlice> = spec
            .slices
            .iter()
            .map(|s| TaskSlice {
                capabilities: s.capabilities.clone(),
                expiration_secs: s.expiration_secs,
                wait_for_capacity: s.wait_for_capacity,
                idempotent: s.idempotent,
                command: s.command.clone(),
                env: s.env.clone(),
                inputs_ref: s.inputs_ref.clone(),
                execution_timeout_secs: s.execution_timeout_secs,
                io_timeout_secs: s.io_timeout_secs,
                grace_period_secs: s.grace_period_secs,
            })
            .collect();
        let total_expiration_ms: i64 = slices
            .iter()
            .map(|s| (s.expiration_secs as i64) * 1000)
            .sum();

        let parent_request = match &spec.parent_run_id {
            Some(run_id) => Some(parse_run_id(run_id).map_err(|e| {
                SchedulerError::Validation(format!("Invalid parent_run_id: {}", e))
            })?),
            None => None,
        };

        let (summary, events) = {
            let mut store = self.store.lock().await;
            let conn = store.get_connection()?;

            // Caller-supplied idempotency key: resubmission returns the
            // original summary untouched.
            if let Some(key) = &spec.request_key {
                if let Some(existing_id) = requests::lookup_request_key(conn, key)? {
                    if let Some(existing) = summaries::get(conn, existing_id)? {
                        debug!(
                            task_id = %existing.task_id(),
                            "Submission replay matched request key"
                        );
                        return Ok(existing);
                    }
                }
            }

            // Look for a reusable prior result across the idempotent slices.
            let mut dupe: Option<(u32, ResultSummary)> = None;
            for (index, slice) in slices.iter().enumerate() {
                if !slice.idempotent {
                    continue;
                }
                let hash = slice.properties_hash(secret.as_deref());
                if let Some(found) = self.find_dupe(conn, &hash, now)? {
                    dupe = Some((index as u32, found));
                    break;
                }
            }

            // Without a dupe, the request starts at its preferred slice.
            // NO_RESOURCE applies only when no slice has a matching live
            // bot and none is flagged to wait; otherwise the expiration
            // sweep walks the slice list over time.
            let mut any_slice_has_capacity = false;
            if dupe.is_none() {
                for slice in &slices {
                    if slice.wait_for_capacity
                        || bots::has_capacity(conn, &slice.capabilities, alive_after)?
                    {
                        any_slice_has_capacity = true;
                        break;
                    }
                }
            }

            let retries = self.config.expire_retries;
            store::with_tx(conn, retries, now, |tx, fx| {
                let mut request = TaskRequest {
                    id: 0,
                    name: spec.name.clone(),
                    priority: spec.priority,
                    created_ts_ms: now,
                    expiration_ts_ms: now + total_expiration_ms,
                    slices: slices.clone(),
                    parent_run_id: spec.parent_run_id.clone(),
                    notify_topic: spec.notify_topic.clone(),
                    notify_userdata: spec.notify_userdata.clone(),
                    tags: spec.tags.clone(),
                    has_secret: secret.is_some(),
                };
                request.id = new_request_id(tx, now)?;

                let mut summary = ResultSummary::new(&request);
                let mut to_run = None;
                let mut store_secret = secret.is_some();

                if let Some((slice_index, dupe_summary)) = &dupe {
                    apply_dedup(&mut summary, dupe_summary, *slice_index, now);
                    // The task never runs; the secret would never be read.
                    store_secret = false;
                } else if any_slice_has_capacity {
                    summary.current_slice = 0;
                    to_run = Some(TaskToRun::new(&request, 1, 0, now));
                } else {
                    // Refused instantly: nothing can serve any slice.
                    summary.state = TaskState::NoResource;
                    summary.completed_ts_ms = Some(now);
                    summary.abandoned_ts_ms = Some(now);
                    store_secret = false;
                    request.has_secret = false;
                }

                requests::insert(tx, &request)?;
                summaries::insert(tx, &summary)?;
                if let Some(to_run) = &to_run {
                    queue::insert(tx, to_run)?;
                }
                if store_secret {
                    if let Some(secret) = &secret {
                        requests::insert_secret(tx, request.id, secret)?;
                    }
                }
                if let Some(key) = &spec.request_key {
                    requests::insert_request_key(tx, key, request.id, now)?;
                }

                if let Some((parent_id, _parent_try)) = parent_request {
                    if summaries::get(tx, parent_id)?.is_none() {
                        return Err(SchedulerError::Validation(
                            "Parent task does not exist".to_string(),
                        )
                        .into());
                    }
                    summaries::append_child(tx, parent_id, &summary.task_id())?;
                }

                if summary.state.is_terminal() {
                    fx.notify(&request, &summary);
                }
                Ok(summary)
            })?
        };

        match summary.state {
            TaskState::Completed => info!(
                task_id = %summary.task_id(),
                deduped_from = summary.deduped_from.as_deref().unwrap_or(""),
                "New request reusing a prior result"
            ),
            TaskState::NoResource => warn!(
                task_id = %summary.task_id(),
                "New request denied with no_resource"
            ),
            _ => debug!(task_id = %summary.task_id(), "New request"),
        }

        notify::publish_committed(&self.store, &self.notifier, events).await;
        Ok(summary)
    }

    /// Finds a reusable prior result for a properties hash.
    ///
    /// Tries the sweep-maintained index first, then falls back to a bounded
    /// scan of the summaries. Acceptance requires a clean completion inside
    /// the reuse window.
    fn find_dupe(
        &self,
        conn: &rusqlite::Connection,
        properties_hash: &str,
        now: i64,
    ) -> Result<Option<ResultSummary>> {
        let oldest = now - (self.config.dedup_window_secs as i64) * 1000;

        if let Some(request_id) = summaries::dedup_index_lookup(conn, properties_hash)? {
            if let Some(candidate) = summaries::get(conn, request_id)? {
                if accept_dupe(&candidate, oldest) {
                    return Ok(Some(candidate));
                }
            }
        }

        for candidate in summaries::dedup_candidates(conn, properties_hash, DEDUP_SCAN_LIMIT)? {
            if candidate.state != TaskState::Completed || candidate.failure() {
                // Stale index entry; look a bit further.
                continue;
            }
            if candidate.created_ts_ms <= oldest {
                // Candidates come newest first, everything behind this one
                // is older still.
                return Ok(None);
            }
            return Ok(Some(candidate));
        }
        Ok(None)
    }

    fn validate_spec(
        &self,
        spec: &NewTaskRequest,
        secret: &Option<Vec<u8>>,
        termination: bool,
    ) -> Result<()> {
        let fail = |msg: String| -> anyhow::Error { SchedulerError::Validation(msg).into() };

        if spec.name.is_empty() || spec.name.len() > 256 {
            return Err(fail("Task name must be 1-256 characters".to_string()));
        }
        if spec.slices.is_empty() {
            return Err(fail("At least one task slice is required".to_string()));
        }
        if spec.slices.len() > self.config.max_slices {
            return Err(fail(format!(
                "Too many task slices: {} (max {})",
                spec.slices.len(),
                self.config.max_slices
            )));
        }
        for (index, slice) in spec.slices.iter().enumerate() {
            slice
                .capabilities
                .validate()
                .map_err(|e| fail(format!("Slice {}: {}", index, e)))?;
            if termination {
                if slice.capabilities.bot_id().is_none() {
                    return Err(fail("Termination task must pin a bot id".to_string()));
                }
            } else {
                if slice.command.is_empty() {
                    return Err(fail(format!("Slice {}: command is required", index)));
                }
                if slice.capabilities.single_value(KEY_POOL).is_none()
                    && slice.capabilities.bot_id().is_none()
                {
                    return Err(fail(format!(
                        "Slice {}: a '{}' capability (or a pinned bot id) is required",
                        index, KEY_POOL
                    )));
                }
            }
            if slice.expiration_secs == 0
                || slice.expiration_secs > self.config.max_slice_expiration_secs
            {
                return Err(fail(format!(
                    "Slice {}: expiration_secs out of range 1-{}",
                    index, self.config.max_slice_expiration_secs
                )));
            }
            if slice.execution_timeout_secs == 0
                || slice.execution_timeout_secs > self.config.max_execution_timeout_secs
            {
                return Err(fail(format!(
                    "Slice {}: execution_timeout_secs out of range 1-{}",
                    index, self.config.max_execution_timeout_secs
                )));
            }
        }
        if spec.tags.len() > MAX_TAGS {
            return Err(fail(format!("Too many tags (max {})", MAX_TAGS)));
        }
        for tag in &spec.tags {
            shared::utils::validate_tag(tag).map_err(|e| fail(e.to_string()))?;
        }
        if let Some(topic) = &spec.notify_topic {
            shared::utils::validate_notify_topic(topic).map_err(|e| fail(e.to_string()))?;
        }
        if let Some(secret) = secret {
            if secret.len() > MAX_SECRET_BYTES {
                return Err(fail(format!(
                    "Secret too large: {} bytes (max {})",
                    secret.len(),
                    MAX_SECRET_BYTES
                )));
            }
        }
        if let Some(key) = &spec.request_key {
            if key.is_empty() || key.len() > 128 {
                return Err(fail("request_key must be 1-128 characters".to_string()));
            }
        }
        Ok(())
    }
}

/// Draws a fresh request id, redrawing on the unlikely same-millisecond
/// collision.
fn new_request_id(conn: &rusqlite::Connection, now_ms: i64) -> Result<i64> {
    for _ in 0..ID_ATTEMPTS {
        let suffix: u16 = rand::rng().random();
        let id = shared::utils::compose_request_id(now_ms, suffix);
        if requests::get(conn, id)?.is_none() {
            return Ok(id);
        }
    }
    Err(SchedulerError::Internal("Request id space exhausted".to_string()).into())
}

/// Copies a reusable result onto a fresh summary.
fn apply_dedup(summary: &mut ResultSummary, dupe: &ResultSummary, slice_index: u32, now_ms: i64) {
    summary.state = TaskState::Completed;
    summary.try_number = 0;
    summary.current_slice = slice_index;
    summary.deduped_from = Some(format_run_id(dupe.request_id, dupe.try_number));
    summary.bot_id = dupe.bot_id.clone();
    summary.bot_version = dupe.bot_version.clone();
    summary.exit_code = dupe.exit_code;
    summary.duration_secs = dupe.duration_secs;
    summary.started_ts_ms = dupe.started_ts_ms;
    summary.completed_ts_ms = dupe.completed_ts_ms;
    summary.cost_saved_usd = Some(
        dupe.costs_usd
            .get(dupe.try_number.saturating_sub(1) as usize)
            .copied()
            .unwrap_or(0.0),
    );
    summary.costs_usd = Vec::new();
    // A reused result must never itself be reused.
    summary.properties_hash = None;
    summary.modified_ts_ms = now_ms;
}

/// Acceptance rule shared by the index fast path.
fn accept_dupe(candidate: &ResultSummary, oldest_ts_ms: i64) -> bool {
    candidate.state == TaskState::Completed
        && !candidate.failure()
        && !candidate.internal_failure
        && candidate.created_ts_ms > oldest_ts_ms
}
