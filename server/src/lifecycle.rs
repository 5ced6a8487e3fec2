//! Lifecycle sweeps
//!
//! Three periodic passes keep the queue and the run records honest: expire
//! queued entries past their slice deadline (falling back to a later slice
//! when one has capacity), detect running entries whose bot went silent
//! (retrying the first try when that is safe), and refresh the dedup fast
//! path. Every sweep is idempotent and safe to run concurrently with
//! dispatching; each one re-validates its candidate inside the transaction.

use crate::cache::NegativeCache;
use crate::clock::Clock;
use crate::notify::{self, Notifier};
use crate::store::{self, bots, queue, requests, runs, summaries, ServerStore};
use anyhow::Result;
use shared::config::SchedulerConfig;
use shared::tasks::{ResultSummary, TaskRequest, TaskState, TaskToRun};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Entities examined per sweep batch.
const SWEEP_PAGE_SIZE: usize = 100;

/// Batches processed per sweep invocation; the next run picks up the rest.
const SWEEP_MAX_PAGES: usize = 20;

/// Rows scanned per dedup-index refresh.
const DEDUP_REFRESH_LIMIT: usize = 1000;

pub struct LifecycleManager {
    store: Arc<Mutex<ServerStore>>,
    cache: Arc<NegativeCache>,
    clock: Arc<dyn Clock>,
    config: Arc<SchedulerConfig>,
    notifier: Arc<dyn Notifier>,
}

/// Outcome of one dead-run examination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeadBotOutcome {
    /// A fresh queue entry for try 2 was created.
    Retried,
    /// The task ended as BOT_DIED.
    Killed,
    /// Stale index or a later try took over; nothing summary-visible done.
    Ignored,
}

impl LifecycleManager {
    pub fn new(
        store: Arc<Mutex<ServerStore>>,
        cache: Arc<NegativeCache>,
        clock: Arc<dyn Clock>,
        config: Arc<SchedulerConfig>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            cache,
            clock,
            config,
            notifier,
        }
    }

    /// Sweep 1: expires claimable queue entries past their slice deadline.
    ///
    /// Returns the number of entries acted upon (expired or re-enqueued for
    /// a later slice).
    pub async fn sweep_expired_queue(&self) -> Result<usize> {
        let mut expired = 0usize;
        let mut reenqueued = 0usize;
        let mut skipped = 0usize;

        for _ in 0..SWEEP_MAX_PAGES {
            let now = self.clock.now_ms();
            let page = {
                let mut store = self.store.lock().await;
                let conn = store.get_connection()?;
                queue::expired_page(conn, now, SWEEP_PAGE_SIZE)?
            };
            if page.is_empty() {
                break;
            }
            let page_len = page.len();

            for to_run in page {
                let request = {
                    let mut store = self.store.lock().await;
                    let conn = store.get_connection()?;
                    requests::get(conn, to_run.request_id)?
                };
                let Some(request) = request else {
                    error!(request_id = to_run.request_id, "Queue entry without request");
                    skipped += 1;
                    continue;
                };
                match expire_to_run(
                    &self.store,
                    &self.cache,
                    &self.notifier,
                    &self.clock,
                    &self.config,
                    &request,
                    &to_run,
                    false,
                )
                .await?
                {
                    (Some(_), Some(_)) => reenqueued += 1,
                    (Some(summary), None) => {
                        info!(task_id = %summary.task_id(), state = %summary.state, "Expired");
                        expired += 1;
                    }
                    (None, _) => skipped += 1,
                }
            }

            if page_len < SWEEP_PAGE_SIZE {
                break;
            }
        }

        if expired > 0 || reenqueued > 0 {
            info!(expired, reenqueued, skipped, "Expired-queue sweep complete");
        }
        Ok(expired + reenqueued)
    }

    /// Sweep 2: detects RUNNING entries whose bot went silent past the ping
    /// tolerance. Returns the number of runs acted upon.
    pub async fn sweep_dead_bots(&self) -> Result<usize> {
        let cutoff = self.clock.now_ms() - (self.config.bot_ping_tolerance_secs as i64) * 1000;
        let mut retried = 0usize;
        let mut killed = 0usize;
        let mut ignored = 0usize;

        for _ in 0..SWEEP_MAX_PAGES {
            let page = {
                let mut store = self.store.lock().await;
                let conn = store.get_connection()?;
                runs::stale_running_page(conn, cutoff, SWEEP_PAGE_SIZE)?
            };
            if page.is_empty() {
                break;
            }
            let page_len = page.len();

            for (request_id, try_number) in page {
                match self.handle_dead_run(request_id, try_number, cutoff).await {
                    Ok(DeadBotOutcome::Retried) => retried += 1,
                    Ok(DeadBotOutcome::Killed) => killed += 1,
                    Ok(DeadBotOutcome::Ignored) => ignored += 1,
                    Err(e) if store::is_busy_error(&e) => {
                        debug!(request_id, try_number, "Dead-bot check lost a conflict");
                        ignored += 1;
                    }
                    Err(e) => return Err(e),
                }
            }

            if page_len < SWEEP_PAGE_SIZE {
                break;
            }
        }

        if retried > 0 || killed > 0 {
            warn!(retried, killed, ignored, "Dead-bot sweep complete");
        }
        Ok(retried + killed)
    }

    /// Sweep 3: refreshes the dedup fast-path index from recently published
    /// properties hashes and prunes entries past the reuse window. Skipping
    /// a run costs lookup speed, never correctness.
    pub async fn sweep_dedup_index(&self) -> Result<usize> {
        let now = self.clock.now_ms();
        let window_start = now - (self.config.dedup_window_secs as i64) * 1000;

        let mut store = self.store.lock().await;
        let conn = store.get_connection()?;
        let published = summaries::published_hashes(conn, window_start, DEDUP_REFRESH_LIMIT)?;
        let refreshed = published.len();
        for (hash, request_id, created_ts_ms) in published {
            summaries::dedup_index_upsert(conn, &hash, request_id, created_ts_ms)?;
        }
        let pruned = summaries::dedup_index_prune(conn, window_start)?;

        debug!(refreshed, pruned, "Dedup index sweep complete");
        Ok(refreshed + pruned)
    }

    async fn handle_dead_run(
        &self,
        request_id: i64,
        try_number: u32,
        cutoff_ts_ms: i64,
    ) -> Result<DeadBotOutcome> {
        let request = {
            let mut store = self.store.lock().await;
            let conn = store.get_connection()?;
            requests::get(conn, request_id)?
        };
        let Some(request) = request else {
            // A run without a request is too broken to touch; skip rather
            // than guess.
            error!(request_id, "Run result without request");
            return Ok(DeadBotOutcome::Ignored);
        };

        let now = self.clock.now_ms();
        let (outcome, events) = {
            let mut store = self.store.lock().await;
            let conn = store.get_connection()?;
            store::with_tx(conn, self.config.expire_retries, now, |tx, fx| {
                let Some(mut run) = runs::get(tx, request_id, try_number)? else {
                    return Ok(DeadBotOutcome::Ignored);
                };
                if run.state != TaskState::Running || run.modified_ts_ms >= cutoff_ts_ms {
                    // The bot pinged after the query ran; the index was
                    // stale.
                    return Ok(DeadBotOutcome::Ignored);
                }

                let old_modified = run.modified_ts_ms;
                run.state = TaskState::BotDied;
                run.internal_failure = true;
                run.abandoned_ts_ms = Some(now);
                run.completed_ts_ms = Some(now);
                run.modified_ts_ms = now;

                let Some(mut summary) = summaries::get(tx, request_id)? else {
                    anyhow::bail!("Summary missing for run {}-{}", request_id, try_number);
                };

                if summary.try_number != run.try_number {
                    // The summary moved on to a later try; close this run
                    // without touching it.
                    runs::update(tx, &run)?;
                    bots::set_active_run(tx, &run.bot_id, None)?;
                    return Ok(DeadBotOutcome::Ignored);
                }

                let slice = request.slice(run.current_slice);
                let never_pinged = run.started_ts_ms == old_modified;
                let retryable = run.try_number == 1
                    && now < request.expiration_ts_ms
                    && (slice.idempotent || never_pinged);

                runs::update(tx, &run)?;
                bots::set_active_run(tx, &run.bot_id, None)?;

                if retryable {
                    let to_run = TaskToRun::new(&request, 2, run.current_slice, now);
                    queue::insert(tx, &to_run)?;
                    summary.reset_to_pending();
                    summary.modified_ts_ms = now;
                    summaries::update(tx, &summary)?;
                    Ok(DeadBotOutcome::Retried)
                } else {
                    summary.set_from_run_result(&run, &request);
                    summaries::update(tx, &summary)?;
                    fx.notify(&request, &summary);
                    Ok(DeadBotOutcome::Killed)
                }
            })?
        };

        match outcome {
            DeadBotOutcome::Retried => {
                info!(task_id = %request.task_id(), "Bot died, task re-enqueued for try 2")
            }
            DeadBotOutcome::Killed => {
                warn!(task_id = %request.task_id(), "Bot died, task abandoned")
            }
            DeadBotOutcome::Ignored => {}
        }

        notify::publish_committed(&self.store, &self.notifier, events).await;
        Ok(outcome)
    }
}

/// Expires one claimable queue entry, re-enqueuing the first later slice
/// with capacity.
///
/// Returns `(None, _)` when the entry was already claimed or cancelled,
/// `(Some(summary), Some(new))` when a fallback slice was enqueued, and
/// `(Some(summary), None)` when the task reached a terminal state.
///
/// Shared between sweep 1 and the dispatch engine's inline-expiration path;
/// `inline` trims the retry budget so a bot poll never stalls on a
/// contended entry.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn expire_to_run(
    store: &Arc<Mutex<ServerStore>>,
    cache: &Arc<NegativeCache>,
    notifier: &Arc<dyn Notifier>,
    clock: &Arc<dyn Clock>,
    config: &Arc<SchedulerConfig>,
    request: &TaskRequest,
    to_run: &TaskToRun,
    inline: bool,
) -> Result<(Option<ResultSummary>, Option<TaskToRun>)> {
    // Mark the entry before the transaction: whether it expires or was
    // already reaped, other pollers should stop looking at it.
    cache.mark(&to_run.cache_key());

    let now = clock.now_ms();
    let alive_after = now - (config.bot_ping_tolerance_secs as i64) * 1000;
    let retries = if inline { 1 } else { config.expire_retries };

    // Capacity for the remaining slices, computed before the transaction.
    // There is a small race here and that is acceptable: sweep 1 will redo
    // the decision on its next pass.
    let fallback_start = to_run.slice_index + 1;
    let capacity: Vec<bool> = {
        let mut store = store.lock().await;
        let conn = store.get_connection()?;
        let mut capacity = Vec::new();
        for slice in request.slices.iter().skip(fallback_start as usize) {
            let available = slice.wait_for_capacity
                || bots::has_capacity(conn, &slice.capabilities, alive_after)?;
            capacity.push(available);
        }
        capacity
    };

    let result = {
        let mut store = store.lock().await;
        let conn = store.get_connection()?;
        store::with_tx(conn, retries, now, |tx, fx| {
            let Some(current) =
                queue::get(tx, to_run.request_id, to_run.try_number, to_run.slice_index)?
            else {
                return Ok((None, None));
            };
            if !current.is_claimable() {
                return Ok((None, None));
            }
            queue::claim(tx, current.request_id, current.try_number, current.slice_index)?;

            let Some(mut summary) = summaries::get(tx, request.id)? else {
                anyhow::bail!("Summary missing for request {}", request.id);
            };

            let mut new_to_run = None;
            for (offset, available) in capacity.iter().enumerate() {
                if *available {
                    let slice_index = fallback_start + offset as u32;
                    let replacement =
                        TaskToRun::new(request, current.try_number, slice_index, now);
                    queue::insert(tx, &replacement)?;
                    summary.current_slice = slice_index;
                    new_to_run = Some(replacement);
                    break;
                }
            }

            if new_to_run.is_none() {
                if summary.try_number >= 1 {
                    // A retry expired: restore the first try's terminal
                    // state instead of reporting EXPIRED.
                    match runs::get(tx, request.id, summary.try_number)? {
                        Some(prev_run) => summary.set_from_run_result(&prev_run, request),
                        None => summary.state = TaskState::Expired,
                    }
                } else {
                    summary.state = TaskState::Expired;
                }
                summary.completed_ts_ms = Some(now);
                summary.abandoned_ts_ms = Some(now);
            }
            summary.modified_ts_ms = now;
            summaries::update(tx, &summary)?;

            if summary.state.is_terminal() {
                fx.notify(request, &summary);
            }
            Ok((Some(summary), new_to_run))
        })
    };

    match result {
        Ok((value, events)) => {
            notify::publish_committed(store, notifier, events).await;
            Ok(value)
        }
        Err(e) if store::is_busy_error(&e) => {
            // Lost to a concurrent claim; the next sweep pass will see the
            // final state.
            debug!(cache_key = %to_run.cache_key(), "Expiration lost a conflict");
            Ok((None, None))
        }
        Err(e) => Err(e),
    }
}
