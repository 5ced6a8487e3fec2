//! Dispatch engine
//!
//! The bot-facing half of the scheduler: matching an idle bot against the
//! run-queue and claiming exactly one entry for it, folding bot progress
//! updates into the run and summary, and the two cancellation paths (atomic
//! for pending tasks, two-phase kill for running ones).
//!
//! Claiming is optimistic: candidates come from an index scan that may be
//! stale, so every claim re-reads the entry inside its transaction and the
//! loser of a race simply moves on to the next candidate. The negative
//! cache keeps the losers from re-fighting the same entry for a few
//! seconds.

use crate::cache::NegativeCache;
use crate::clock::Clock;
use crate::lifecycle;
use crate::notify::{self, Notifier};
use crate::output;
use crate::store::{self, bots, queue, requests, runs, summaries, ServerStore};
use anyhow::Result;
use shared::capabilities::CapabilitySet;
use shared::config::SchedulerConfig;
use shared::tasks::{RunResult, TaskRequest, TaskState, TaskToRun};
use shared::utils::parse_run_id;
use shared::SchedulerError;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Queue entries fetched per scan page.
const SCAN_PAGE_SIZE: usize = 64;

/// A successfully claimed task, ready to hand to the bot.
#[derive(Debug)]
pub struct ReapedTask {
    pub request: TaskRequest,
    pub run: RunResult,
    pub secret: Option<Vec<u8>>,
}

/// Fields of one bot progress update.
#[derive(Debug, Default, Clone)]
pub struct UpdateDelta {
    pub output: Option<Vec<u8>>,
    pub output_offset: Option<u64>,
    pub exit_code: Option<i64>,
    pub duration_secs: Option<f64>,
    pub hard_timeout: bool,
    pub io_timeout: bool,
    pub cost_usd: Option<f64>,
    pub outputs_ref: Option<String>,
}

/// Advisory answer to a bot update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub state: TaskState,
    /// The bot must kill the task and report the stop.
    pub must_stop: bool,
}

pub struct DispatchEngine {
    store: Arc<Mutex<ServerStore>>,
    cache: Arc<NegativeCache>,
    clock: Arc<dyn Clock>,
    config: Arc<SchedulerConfig>,
    notifier: Arc<dyn Notifier>,
}

impl DispatchEngine {
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

    /// Refreshes the bot's record on poll: last-seen, version and the
    /// currently advertised capability set.
    pub async fn record_bot_seen(
        &self,
        bot_id: &str,
        bot_version: &str,
        bot_capabilities: &CapabilitySet,
    ) -> Result<()> {
        let now = self.clock.now_ms();
        let mut store = self.store.lock().await;
        let conn = store.get_connection()?;
        bots::upsert_seen(conn, bot_id, bot_version, bot_capabilities, now)
    }

    /// Finds and claims one eligible queue entry for a polling bot.
    ///
    /// Scans candidates in ascending queue-number order until `deadline_ms`,
    /// expiring stale entries inline (up to a small cap per poll) and
    /// skipping entries the negative cache marks as gone. Returns `None`
    /// when nothing was claimable in time.
    pub async fn reap(
        &self,
        bot_id: &str,
        bot_version: &str,
        bot_capabilities: &CapabilitySet,
        deadline_ms: i64,
    ) -> Result<Option<ReapedTask>> {
        let start = self.clock.now_ms();
        let mut iterated = 0usize;
        let mut inline_expired = 0u32;
        let mut failures = 0usize;
        let mut after_queue_number: Option<i64> = None;

        'scan: while self.clock.now_ms() < deadline_ms {
            let page = {
                let mut store = self.store.lock().await;
                let conn = store.get_connection()?;
                queue::claimable_page(conn, after_queue_number, SCAN_PAGE_SIZE)?
            };
            if page.is_empty() {
                break;
            }
            after_queue_number = page.last().and_then(|t| t.queue_number);

            for to_run in page {
                if self.clock.now_ms() >= deadline_ms {
                    break 'scan;
                }
                iterated += 1;
                if self.cache.contains(&to_run.cache_key()) {
                    continue;
                }
                if !to_run.capabilities.is_satisfied_by(bot_capabilities) {
                    continue;
                }

                let request = {
                    let mut store = self.store.lock().await;
                    let conn = store.get_connection()?;
                    requests::get(conn, to_run.request_id)?
                };
                let Some(request) = request else {
                    warn!(request_id = to_run.request_id, "Queue entry without request");
                    continue;
                };

                let mut candidate = to_run;
                if self.clock.now_ms() > candidate.expiration_ts_ms {
                    // The deadline passed while the entry sat in the queue.
                    // Handle it inline so the backlog drains, but never let
                    // a degenerate queue eat the whole poll.
                    if inline_expired >= self.config.inline_expiration_limit {
                        failures += 1;
                        continue;
                    }
                    let (summary, replacement) = lifecycle::expire_to_run(
                        &self.store,
                        &self.cache,
                        &self.notifier,
                        &self.clock,
                        &self.config,
                        &request,
                        &candidate,
                        true,
                    )
                    .await?;
                    if summary.is_some() {
                        inline_expired += 1;
                    }
                    match replacement {
                        Some(next)
                            if next.capabilities.is_satisfied_by(bot_capabilities) =>
                        {
                            // The fallback slice still matches this bot;
                            // try to take it right away.
                            candidate = next;
                        }
                        _ => continue,
                    }
                }

                match self
                    .try_claim(&request, &candidate, bot_id, bot_version, bot_capabilities)
                    .await
                {
                    Ok(Some(reaped)) => {
                        info!(
                            run_id = %reaped.run.run_id(),
                            bot_id = %bot_id,
                            elapsed_ms = self.clock.now_ms() - start,
                            iterated,
                            "Reaped"
                        );
                        return Ok(Some(reaped));
                    }
                    Ok(None) => continue,
                    Err(e) if store::is_busy_error(&e) => {
                        // Lost the race. The negative cache entry stays: a
                        // wrong entry costs latency, clearing it would cost
                        // another round of contention.
                        failures += 1;
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        debug!(
            bot_id = %bot_id,
            iterated,
            inline_expired,
            failures,
            elapsed_ms = self.clock.now_ms() - start,
            "Poll found nothing to reap"
        );
        Ok(None)
    }

    /// One transactional claim attempt for a single queue entry.
    async fn try_claim(
        &self,
        request: &TaskRequest,
        to_run: &TaskToRun,
        bot_id: &str,
        bot_version: &str,
        bot_capabilities: &CapabilitySet,
    ) -> Result<Option<ReapedTask>> {
        // Mark before the transaction so concurrent pollers stop fighting
        // over this entry whether or not the claim succeeds.
        self.cache.mark(&to_run.cache_key());

        let now = self.clock.now_ms();
        let (reaped, events) = {
            let mut store = self.store.lock().await;
            let conn = store.get_connection()?;
            store::with_tx(conn, self.config.claim_retries, now, |tx, fx| {
                let Some(current) =
                    queue::get(tx, to_run.request_id, to_run.try_number, to_run.slice_index)?
                else {
                    return Ok(None);
                };
                if !current.is_claimable() {
                    return Ok(None);
                }

                let Some(mut summary) = summaries::get(tx, request.id)? else {
                    warn!(request_id = request.id, "Queue entry without summary");
                    return Ok(None);
                };
                if summary.bot_id.as_deref() == Some(bot_id) && summary.try_number >= 1 {
                    // The retry of a task this bot already failed. The bot
                    // may be deeply broken; keep it away from the task.
                    debug!(
                        task_id = %summary.task_id(),
                        bot_id = %bot_id,
                        "Refusing to hand a retry back to the same bot"
                    );
                    return Ok(None);
                }

                // The claim must witness the bot as idle.
                if let Some(bot) = bots::get(tx, bot_id)? {
                    if let Some(active) = &bot.active_run {
                        if let Ok((active_id, active_try)) = parse_run_id(active) {
                            if let Some(active_run) = runs::get(tx, active_id, active_try)? {
                                if active_run.state == TaskState::Running {
                                    debug!(bot_id = %bot_id, active_run = %active, "Bot still busy");
                                    return Ok(None);
                                }
                            }
                        }
                    }
                }

                if !queue::claim(tx, current.request_id, current.try_number, current.slice_index)? {
                    return Ok(None);
                }

                let try_number = summary.try_number + 1;
                let run = RunResult::new(
                    request,
                    &current,
                    try_number,
                    bot_id,
                    bot_version,
                    bot_capabilities,
                    now,
                );
                runs::insert(tx, &run)?;

                let orig_state = summary.state;
                summary.set_from_run_result(&run, request);
                summaries::update(tx, &summary)?;
                let run_id = run.run_id();
                bots::set_active_run(tx, bot_id, Some(run_id.as_str()))?;

                if summary.state != orig_state && summary.state.is_terminal() {
                    fx.notify(request, &summary);
                }

                let secret = if request.has_secret {
                    requests::get_secret(tx, request.id)?
                } else {
                    None
                };
                Ok(Some((run, secret)))
            })?
        };

        notify::publish_committed(&self.store, &self.notifier, events).await;
        Ok(reaped.map(|(run, secret)| ReapedTask {
            request: request.clone(),
            run,
            secret,
        }))
    }

    /// Applies one bot progress update to a run in a single transaction.
    ///
    /// Timeout flags move the run to TIMED_OUT (synthesizing exit code and
    /// duration when the bot omitted them), a pending kill acknowledged
    /// with a duration moves it to KILLED, a supplied exit code completes
    /// it. Updates for a try the summary already moved past are absorbed
    /// into that try's cost slot without touching summary state.
    pub async fn update(
        &self,
        request_id: i64,
        try_number: u32,
        bot_id: &str,
        delta: UpdateDelta,
    ) -> Result<UpdateOutcome> {
        if let Some(cost) = delta.cost_usd {
            if cost < 0.0 {
                return Err(
                    SchedulerError::Validation("cost_usd must not be negative".to_string()).into(),
                );
            }
        }
        if let Some(duration) = delta.duration_secs {
            if duration < 0.0 {
                return Err(SchedulerError::Validation(
                    "duration_secs must not be negative".to_string(),
                )
                .into());
            }
        }
        if delta.exit_code.is_some() != delta.duration_secs.is_some() {
            return Err(SchedulerError::BotMisbehavior(
                "exit_code and duration_secs must be supplied together".to_string(),
            )
            .into());
        }

        let now = self.clock.now_ms();
        let (outcome, events) = {
            let mut store = self.store.lock().await;
            let conn = store.get_connection()?;

            let Some(request) = requests::get(conn, request_id)? else {
                return Err(SchedulerError::BotMisbehavior("Unknown run".to_string()).into());
            };

            store::with_tx(conn, self.config.expire_retries, now, |tx, fx| {
                let Some(mut run) = runs::get(tx, request_id, try_number)? else {
                    return Err(
                        SchedulerError::BotMisbehavior("Unknown run".to_string()).into()
                    );
                };
                if run.bot_id != bot_id {
                    return Err(SchedulerError::BotMisbehavior(format!(
                        "Expected bot {} but had update from bot {}",
                        run.bot_id, bot_id
                    ))
                    .into());
                }

                if let (Some(exit_code), Some(duration)) =
                    (delta.exit_code, delta.duration_secs)
                {
                    if let Some(recorded) = run.exit_code {
                        // The bot retried an update whose first attempt
                        // already committed. Identical values are fine;
                        // anything else must not mutate the result.
                        if recorded != exit_code {
                            return Err(SchedulerError::BotMisbehavior(format!(
                                "Got two different exit codes: {} then {}",
                                recorded, exit_code
                            ))
                            .into());
                        }
                        if run.duration_secs != Some(duration) {
                            return Err(SchedulerError::BotMisbehavior(
                                "Got two different durations".to_string(),
                            )
                            .into());
                        }
                    } else {
                        run.exit_code = Some(exit_code);
                        run.duration_secs = Some(duration);
                    }
                }

                if let Some(outputs_ref) = &delta.outputs_ref {
                    run.outputs_ref = Some(outputs_ref.clone());
                }

                if run.state == TaskState::Running {
                    if run.killing {
                        if delta.duration_secs.is_some() {
                            // Cancel acknowledged: the task is stopped.
                            run.killing = false;
                            run.state = TaskState::Killed;
                            run.completed_ts_ms.get_or_insert(now);
                        }
                    } else if delta.hard_timeout || delta.io_timeout {
                        run.state = TaskState::TimedOut;
                        run.completed_ts_ms = Some(now);
                        if run.exit_code.is_none() {
                            run.exit_code = Some(-1);
                        }
                        if run.duration_secs.is_none() {
                            run.duration_secs =
                                Some((now - run.started_ts_ms) as f64 / 1000.0);
                        }
                    } else if run.exit_code.is_some() {
                        run.state = TaskState::Completed;
                        run.completed_ts_ms = Some(now);
                    }
                }

                if let Some(bytes) = &delta.output {
                    let max_chunks = (self.config.max_output_bytes
                        / self.config.output_chunk_size)
                        .max(1) as u32;
                    let appended = output::append(
                        tx,
                        request_id,
                        try_number,
                        run.output_chunks,
                        bytes,
                        delta.output_offset.unwrap_or(0),
                        self.config.output_chunk_size,
                        max_chunks,
                    )?;
                    run.output_chunks = appended.number_chunks;
                }

                if let Some(cost) = delta.cost_usd {
                    run.cost_usd = run.cost_usd.max(cost);
                }
                run.modified_ts_ms = now;
                runs::update(tx, &run)?;

                let Some(mut summary) = summaries::get(tx, request_id)? else {
                    anyhow::bail!("Summary missing for request {}", request_id);
                };
                if summary.try_number >= 1 && summary.try_number > run.try_number {
                    // A previous try's bot reappeared after the retry took
                    // over. Record its cost, nothing else.
                    while summary.costs_usd.len() < run.try_number as usize {
                        summary.costs_usd.push(0.0);
                    }
                    summary.costs_usd[run.try_number as usize - 1] = run.cost_usd;
                    summary.modified_ts_ms = now;
                    summaries::update(tx, &summary)?;
                } else {
                    let orig_state = summary.state;
                    summary.set_from_run_result(&run, &request);
                    summaries::update(tx, &summary)?;
                    if summary.state != orig_state && summary.state.is_terminal() {
                        fx.notify(&request, &summary);
                    }
                }

                if run.state.is_terminal() {
                    bots::set_active_run(tx, bot_id, None)?;
                }

                Ok(UpdateOutcome {
                    state: if run.killing {
                        TaskState::Killed
                    } else {
                        run.state
                    },
                    must_stop: run.killing,
                })
            })?
        };

        notify::publish_committed(&self.store, &self.notifier, events).await;
        Ok(outcome)
    }

    /// Cancels a task.
    ///
    /// A pending task flips to CANCELED atomically with its queue entry. A
    /// running task only has `killing` set; the KILLED transition happens
    /// when the bot acknowledges the stop through [`Self::update`]. With
    /// `bot_id` given, the cancel applies only if the task runs on that bot.
    pub async fn cancel(
        &self,
        request_id: i64,
        kill_running: bool,
        bot_id: Option<&str>,
    ) -> Result<(bool, bool)> {
        if bot_id.is_some() && !kill_running {
            return Err(SchedulerError::Validation(
                "bot_id requires kill_running".to_string(),
            )
            .into());
        }

        let now = self.clock.now_ms();
        let (result, events) = {
            let mut store = self.store.lock().await;
            let conn = store.get_connection()?;

            let Some(request) = requests::get(conn, request_id)? else {
                return Err(SchedulerError::NotFound("Unknown task".to_string()).into());
            };

            store::with_tx(conn, self.config.expire_retries, now, |tx, fx| {
                let Some(mut summary) = summaries::get(tx, request_id)? else {
                    anyhow::bail!("Summary missing for request {}", request_id);
                };
                let was_running = summary.state == TaskState::Running;
                if !summary.can_be_canceled() {
                    return Ok((false, was_running));
                }

                if !was_running {
                    if bot_id.is_some() {
                        // A bot-scoped cancel only applies to a running task.
                        return Ok((false, was_running));
                    }
                    summary.state = TaskState::Canceled;
                    let try_number = summary.try_number.max(1);
                    self.cache.mark(&format!(
                        "{}-{}-{}",
                        summary.task_id(),
                        try_number,
                        summary.current_slice
                    ));
                    queue::claim(tx, request_id, try_number, summary.current_slice)?;
                } else {
                    if !kill_running {
                        return Ok((false, was_running));
                    }
                    if let Some(bot_id) = bot_id {
                        if summary.bot_id.as_deref() != Some(bot_id) {
                            return Ok((false, was_running));
                        }
                    }
                    let Some(mut run) = runs::get(tx, request_id, summary.try_number)? else {
                        anyhow::bail!("Run missing for running task {}", request_id);
                    };
                    run.killing = true;
                    run.abandoned_ts_ms = Some(now);
                    run.completed_ts_ms = Some(now);
                    run.modified_ts_ms = now;
                    runs::update(tx, &run)?;
                }

                summary.abandoned_ts_ms = Some(now);
                summary.completed_ts_ms = Some(now);
                summary.modified_ts_ms = now;
                summaries::update(tx, &summary)?;

                if summary.state.is_terminal() {
                    fx.notify(&request, &summary);
                }
                Ok((true, was_running))
            })?
        };

        notify::publish_committed(&self.store, &self.notifier, events).await;
        Ok(result)
    }

    /// Bot-initiated terminal failure: the bot could not keep running the
    /// task. Ends the run as BOT_DIED with an internal failure.
    pub async fn bot_kill_task(
        &self,
        request_id: i64,
        try_number: u32,
        bot_id: &str,
        reason: &str,
    ) -> Result<()> {
        warn!(request_id, try_number, bot_id = %bot_id, reason = %reason, "Bot killed its task");

        let now = self.clock.now_ms();
        let ((), events) = {
            let mut store = self.store.lock().await;
            let conn = store.get_connection()?;

            let Some(request) = requests::get(conn, request_id)? else {
                return Err(SchedulerError::BotMisbehavior("Unknown run".to_string()).into());
            };

            store::with_tx(conn, self.config.expire_retries, now, |tx, fx| {
                let Some(mut run) = runs::get(tx, request_id, try_number)? else {
                    return Err(
                        SchedulerError::BotMisbehavior("Unknown run".to_string()).into()
                    );
                };
                if run.bot_id != bot_id {
                    return Err(SchedulerError::BotMisbehavior(format!(
                        "Task is owned by bot {}, not {}",
                        run.bot_id, bot_id
                    ))
                    .into());
                }
                if run.state == TaskState::BotDied {
                    return Ok(());
                }

                run.state = TaskState::BotDied;
                run.internal_failure = true;
                run.abandoned_ts_ms = Some(now);
                run.completed_ts_ms = Some(now);
                run.modified_ts_ms = now;
                runs::update(tx, &run)?;
                bots::set_active_run(tx, bot_id, None)?;

                let Some(mut summary) = summaries::get(tx, request_id)? else {
                    anyhow::bail!("Summary missing for request {}", request_id);
                };
                if summary.try_number == run.try_number {
                    summary.set_from_run_result(&run, &request);
                    summaries::update(tx, &summary)?;
                    fx.notify(&request, &summary);
                }
                Ok(())
            })?
        };

        notify::publish_committed(&self.store, &self.notifier, events).await;
        Ok(())
    }
}
