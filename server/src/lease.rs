//! Lease management
//!
//! Maintains a target population of ephemeral machines per configured
//! machine type. Each tick resolves the current target size (schedule
//! intervals first, then load-based sizing, then the configured baseline),
//! reconciles the slot records against it, and advances every lease's state
//! machine by at most one step. Progress comes from the tick frequency, not
//! from retries: a failed provider call simply leaves the lease where it
//! was for the next tick.

use crate::clock::Clock;
use crate::config::ConfigManager;
use crate::provider::{LeaseRequest, LeaseState, MachineProvider};
use crate::store::{bots, leases, ServerStore};
use crate::submission::SubmissionService;
use anyhow::Result;
use chrono::{Datelike, Timelike};
use shared::capabilities::KEY_BOT_ID;
use shared::config::{MachineTypeConfig, SchedulerConfig};
use shared::tasks::{BotRecord, MachineLease, MachineUtilization, TaskState};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

pub struct LeaseManager {
    store: Arc<Mutex<ServerStore>>,
    clock: Arc<dyn Clock>,
    config: Arc<SchedulerConfig>,
    config_manager: Arc<Mutex<ConfigManager>>,
    provider: Arc<dyn MachineProvider>,
    submission: Arc<SubmissionService>,
    /// URL handed to leased machines so their bot connects back here.
    server_url: String,
}

impl LeaseManager {
    pub fn new(
        store: Arc<Mutex<ServerStore>>,
        clock: Arc<dyn Clock>,
        config: Arc<SchedulerConfig>,
        config_manager: Arc<Mutex<ConfigManager>>,
        provider: Arc<dyn MachineProvider>,
        submission: Arc<SubmissionService>,
        server_url: String,
    ) -> Self {
        Self {
            store,
            clock,
            config,
            config_manager,
            provider,
            submission,
            server_url,
        }
    }

    /// One control-loop pass over every machine type and lease slot.
    /// Returns the number of state-advancing operations performed.
    pub async fn tick(&self) -> Result<usize> {
        let machine_types = {
            let mut manager = self.config_manager.lock().await;
            manager.reload_machine_types()?;
            manager.machine_types()
        };
        let by_name: HashMap<&str, &MachineTypeConfig> = machine_types
            .iter()
            .map(|mt| (mt.name.as_str(), mt))
            .collect();

        let mut acted = 0usize;
        for mt in &machine_types {
            let target = if mt.enabled {
                self.resolve_target_size(mt).await?
            } else {
                0
            };
            acted += self.reconcile_slots(mt, target).await?;
        }

        let all_leases = {
            let mut store = self.store.lock().await;
            let conn = store.get_connection()?;
            leases::list_all(conn)?
        };
        for lease in all_leases {
            let configured = by_name
                .get(lease.machine_type.as_str())
                .map(|mt| mt.enabled)
                .unwrap_or(false);
            if !configured && !lease.drained {
                // The machine type left the configuration; drain the slot.
                let mut lease = lease.clone();
                lease.drained = true;
                let mut store = self.store.lock().await;
                let conn = store.get_connection()?;
                leases::update(conn, &lease)?;
                acted += 1;
                continue;
            }
            match self.step(lease.clone()).await {
                Ok(true) => acted += 1,
                Ok(false) => {}
                Err(e) => {
                    // One broken lease must not stall the whole loop.
                    error!(lease = %lease.lease_key(), "Lease step failed: {}", e);
                }
            }
        }
        Ok(acted)
    }

    /// Refreshes the per-machine-type busy/idle counts read by load-based
    /// sizing. Runs on its own interval, decoupled from the lease tick.
    pub async fn compute_utilization(&self) -> Result<usize> {
        let machine_types = {
            let manager = self.config_manager.lock().await;
            manager.machine_types()
        };
        let now = self.clock.now_ms();
        let alive_after = now - (self.config.bot_ping_tolerance_secs as i64) * 1000;

        let mut store = self.store.lock().await;
        let conn = store.get_connection()?;
        let mut refreshed = 0usize;
        for mt in &machine_types {
            let (busy, idle) = bots::count_busy_idle(conn, &mt.name, alive_after)?;
            leases::put_utilization(
                conn,
                &MachineUtilization {
                    machine_type: mt.name.clone(),
                    busy,
                    idle,
                    computed_ts_ms: now,
                },
            )?;
            debug!(machine_type = %mt.name, busy, idle, "Utilization refreshed");
            refreshed += 1;
        }
        Ok(refreshed)
    }

    /// Resolves the target size: a matching schedule interval wins, then
    /// load-based sizing, then the configured baseline.
    async fn resolve_target_size(&self, mt: &MachineTypeConfig) -> Result<u32> {
        let now_ms = self.clock.now_ms();
        if let Some(dt) = chrono::DateTime::from_timestamp_millis(now_ms) {
            let weekday = dt.weekday().num_days_from_monday() as u8;
            let minutes = dt.hour() * 60 + dt.minute();
            for interval in &mt.schedule {
                if !interval.days_of_week.is_empty() && !interval.days_of_week.contains(&weekday) {
                    continue;
                }
                let start = shared::config::parse_hh_mm(&interval.start)?;
                let end = shared::config::parse_hh_mm(&interval.end)?;
                if start <= minutes && minutes <= end {
                    return Ok(interval.target_size);
                }
            }
        }

        let Some(policy) = &mt.load_based else {
            return Ok(mt.target_size);
        };

        let (current, utilization) = {
            let mut store = self.store.lock().await;
            let conn = store.get_connection()?;
            let current = leases::list_for_type(conn, &mt.name)?
                .iter()
                .filter(|l| !l.drained)
                .count() as u32;
            (current, leases::get_utilization(conn, &mt.name)?)
        };
        let Some(utilization) = utilization else {
            return Ok(mt.target_size);
        };

        // Aim above the busy count so load has headroom, but never shrink
        // more than the dampener allows in one tick.
        let mut target = (utilization.busy as f64 * self.config.scale_up_factor).ceil() as u32;
        if target >= policy.maximum_size {
            return Ok(policy.maximum_size);
        }
        let floor = (self.config.scale_down_dampener * current as f64) as u32;
        if target < floor {
            target = floor;
        }
        if target < policy.minimum_size {
            target = policy.minimum_size;
        }
        Ok(target)
    }

    /// Ensures one lease slot exists per index below the target and drains
    /// the rest. Returns the number of slots changed.
    async fn reconcile_slots(&self, mt: &MachineTypeConfig, target: u32) -> Result<usize> {
        let mut store = self.store.lock().await;
        let conn = store.get_connection()?;
        let existing = leases::list_for_type(conn, &mt.name)?;
        let by_slot: HashMap<u32, &MachineLease> =
            existing.iter().map(|l| (l.slot, l)).collect();

        let mut changed = 0usize;
        for slot in 0..target {
            match by_slot.get(&slot) {
                None => {
                    leases::insert(
                        conn,
                        &MachineLease {
                            machine_type: mt.name.clone(),
                            slot,
                            drained: false,
                            client_request_id: None,
                            request_count: 0,
                            hostname: None,
                            lease_expiration_ts_ms: None,
                            leased_indefinitely: mt.leased_indefinitely,
                            lease_duration_secs: mt.lease_duration_secs,
                            early_release_secs: mt.early_release_secs,
                            capabilities: mt.capabilities.clone(),
                            termination_task_id: None,
                            instruction_ts_ms: None,
                            connection_ts_ms: None,
                        },
                    )?;
                    changed += 1;
                }
                Some(lease) if lease.drained => {
                    // The slot came back under the target; reuse it.
                    let mut lease = (*lease).clone();
                    lease.drained = false;
                    if lease.hostname.is_none() && lease.client_request_id.is_none() {
                        // Refresh the config snapshot while nothing is
                        // leased against it.
                        lease.lease_duration_secs = mt.lease_duration_secs;
                        lease.early_release_secs = mt.early_release_secs;
                        lease.leased_indefinitely = mt.leased_indefinitely;
                        lease.capabilities = mt.capabilities.clone();
                    }
                    leases::update(conn, &lease)?;
                    changed += 1;
                }
                Some(_) => {}
            }
        }
        for lease in &existing {
            if lease.slot >= target && !lease.drained {
                let mut lease = lease.clone();
                lease.drained = true;
                leases::update(conn, &lease)?;
                changed += 1;
            }
        }
        if changed > 0 {
            info!(machine_type = %mt.name, target, changed, "Lease slots reconciled");
        }
        Ok(changed)
    }

    /// Advances one lease by at most one state transition.
    async fn step(&self, lease: MachineLease) -> Result<bool> {
        if lease.hostname.is_some() {
            return self.step_leased(lease).await;
        }
        if lease.client_request_id.is_some() {
            return self.step_pending_request(lease).await;
        }
        if !lease.drained {
            // Issue a fresh, never-reused request id; the actual lease call
            // happens on the next tick.
            let mut lease = lease;
            lease.request_count += 1;
            lease.client_request_id = Some(lease.next_client_request_id());
            debug!(
                lease = %lease.lease_key(),
                request_id = lease.client_request_id.as_deref().unwrap_or(""),
                "Lease request id assigned"
            );
            self.save(&lease).await?;
            return Ok(true);
        }
        // Drained and nothing leased: the slot record goes away.
        let mut store = self.store.lock().await;
        let conn = store.get_connection()?;
        leases::delete(conn, &lease.machine_type, lease.slot)?;
        info!(lease = %lease.lease_key(), "Drained lease removed");
        Ok(true)
    }

    /// Drives a lease whose request was sent but not yet fulfilled.
    async fn step_pending_request(&self, mut lease: MachineLease) -> Result<bool> {
        let request_id = lease
            .client_request_id
            .clone()
            .unwrap_or_default();
        let request = LeaseRequest {
            request_id: request_id.clone(),
            capabilities: lease.capabilities.clone(),
            duration_secs: lease.lease_duration_secs,
            indefinite: lease.leased_indefinitely,
        };

        match self.provider.lease_machine(&request).await {
            Err(e) if e.is_transient() => {
                warn!(lease = %lease.lease_key(), "Transient provider failure: {}", e);
                Ok(false)
            }
            Err(e) => {
                error!(lease = %lease.lease_key(), "Lease request failed: {}", e);
                lease.client_request_id = None;
                self.save(&lease).await?;
                Ok(true)
            }
            Ok(response) => match response.state {
                LeaseState::Pending => Ok(false),
                LeaseState::Denied => {
                    warn!(lease = %lease.lease_key(), request_id = %request_id, "Lease denied");
                    lease.client_request_id = None;
                    self.save(&lease).await?;
                    Ok(true)
                }
                LeaseState::Fulfilled => {
                    let Some(hostname) = response.hostname else {
                        // Fulfilled without a machine means the lease
                        // expired before we ever saw it.
                        error!(
                            lease = %lease.lease_key(),
                            request_id = %request_id,
                            "Lease fulfilled without hostname"
                        );
                        lease.client_request_id = None;
                        self.save(&lease).await?;
                        return Ok(true);
                    };
                    info!(
                        lease = %lease.lease_key(),
                        hostname = %hostname,
                        indefinite = response.leased_indefinitely,
                        "Lease fulfilled"
                    );
                    lease.hostname = Some(hostname.clone());
                    lease.lease_expiration_ts_ms = response.lease_expiration_ts_ms;
                    lease.leased_indefinitely = response.leased_indefinitely;
                    self.create_bot_record(&lease, &hostname).await?;
                    match self
                        .provider
                        .instruct_machine(&request_id, &self.server_url)
                        .await
                    {
                        Ok(()) => lease.instruction_ts_ms = Some(self.clock.now_ms()),
                        Err(e) if e.is_transient() => {
                            // The hostname is recorded; the instruction is
                            // retried from step_leased on the next tick.
                            warn!(lease = %lease.lease_key(), "Instruction deferred: {}", e);
                        }
                        Err(e) => {
                            error!(lease = %lease.lease_key(), "Instruction failed: {}", e)
                        }
                    }
                    self.save(&lease).await?;
                    Ok(true)
                }
            },
        }
    }

    /// Drives a lease with a machine attached.
    async fn step_leased(&self, mut lease: MachineLease) -> Result<bool> {
        let now = self.clock.now_ms();
        let hostname = lease.hostname.clone().unwrap_or_default();

        // The connect instruction could not be delivered at fulfillment.
        if lease.instruction_ts_ms.is_none() {
            let request_id = lease.client_request_id.clone().unwrap_or_default();
            match self
                .provider
                .instruct_machine(&request_id, &self.server_url)
                .await
            {
                Ok(()) => {
                    lease.instruction_ts_ms = Some(now);
                    self.save(&lease).await?;
                    return Ok(true);
                }
                Err(e) if e.is_transient() => {
                    warn!(lease = %lease.lease_key(), "Instruction deferred: {}", e);
                    return Ok(false);
                }
                Err(e) => {
                    error!(lease = %lease.lease_key(), "Instruction failed: {}", e);
                    return Ok(false);
                }
            }
        }

        // Instruction sent; wait for the machine's bot to poll.
        if lease.connection_ts_ms.is_none() {
            return self.check_for_connection(lease).await;
        }

        // An expired lease means the provider already reclaimed the
        // machine; only local cleanup remains.
        if !lease.leased_indefinitely {
            if let Some(expiration) = lease.lease_expiration_ts_ms {
                if expiration <= now {
                    info!(lease = %lease.lease_key(), hostname = %hostname, "Lease expired");
                    self.cleanup_bot(&mut lease).await?;
                    return Ok(true);
                }
            }
        }

        // A termination task is in flight; wait for its outcome.
        if let Some(termination_id) = lease.termination_task_id {
            return self.check_termination_task(lease, termination_id).await;
        }

        // Early release window or a drain request.
        let early_release_due = !lease.leased_indefinitely
            && lease.early_release_secs > 0
            && lease
                .lease_expiration_ts_ms
                .map(|exp| now >= exp - (lease.early_release_secs as i64) * 1000)
                .unwrap_or(false);
        if lease.drained || early_release_due {
            info!(
                lease = %lease.lease_key(),
                hostname = %hostname,
                drained = lease.drained,
                "Scheduling termination ahead of release"
            );
            let summary = self.submission.terminate_bot(&hostname).await?;
            lease.termination_task_id = Some(summary.request_id);
            self.save(&lease).await?;
            return Ok(true);
        }

        Ok(false)
    }

    /// Looks for the machine's bot having polled since the instruction.
    async fn check_for_connection(&self, mut lease: MachineLease) -> Result<bool> {
        let now = self.clock.now_ms();
        let hostname = lease.hostname.clone().unwrap_or_default();
        let instruction_ts = lease.instruction_ts_ms.unwrap_or(now);

        let bot = {
            let mut store = self.store.lock().await;
            let conn = store.get_connection()?;
            bots::get(conn, &hostname)?
        };

        match bot {
            Some(bot) if bot.last_seen_ms > instruction_ts => {
                info!(lease = %lease.lease_key(), hostname = %hostname, "Bot connected");
                lease.connection_ts_ms = Some(bot.last_seen_ms);
                self.save(&lease).await?;
                Ok(true)
            }
            Some(_) => {
                let tolerance_ms = (self.config.bot_ping_tolerance_secs as i64) * 1000;
                if now - instruction_ts > tolerance_ms {
                    // The machine never connected. Schedule a termination
                    // task so a late join shuts itself down, then release.
                    warn!(
                        lease = %lease.lease_key(),
                        hostname = %hostname,
                        "Bot failed to connect in time, releasing"
                    );
                    self.submission.terminate_bot(&hostname).await?;
                    if self.release(&lease).await? {
                        self.cleanup_bot(&mut lease).await?;
                    }
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            None => {
                // The bot record placed at fulfillment is gone entirely.
                error!(lease = %lease.lease_key(), hostname = %hostname, "Bot record missing");
                self.submission.terminate_bot(&hostname).await?;
                if self.release(&lease).await? {
                    self.cleanup_bot(&mut lease).await?;
                }
                Ok(true)
            }
        }
    }

    /// Follows a termination task to completion, then releases the lease.
    async fn check_termination_task(
        &self,
        mut lease: MachineLease,
        termination_id: i64,
    ) -> Result<bool> {
        let summary = self.submission.get_result(termination_id).await?;
        match summary {
            None => {
                error!(lease = %lease.lease_key(), "Termination task disappeared");
                lease.termination_task_id = None;
                self.save(&lease).await?;
                Ok(true)
            }
            Some(summary) if summary.state == TaskState::Completed => {
                info!(
                    lease = %lease.lease_key(),
                    hostname = lease.hostname.as_deref().unwrap_or(""),
                    "Termination confirmed, releasing lease"
                );
                if self.release(&lease).await? {
                    self.cleanup_bot(&mut lease).await?;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Some(summary) if summary.state.is_exceptional() => {
                // The termination task died; clear it so the next tick
                // schedules a fresh one.
                warn!(
                    lease = %lease.lease_key(),
                    state = %summary.state,
                    "Termination task failed"
                );
                lease.termination_task_id = None;
                self.save(&lease).await?;
                Ok(true)
            }
            Some(_) => Ok(false),
        }
    }

    /// Releases the lease at the provider. `ALREADY_RECLAIMED` and
    /// `NOT_FOUND` mean the machine is gone and count as success.
    async fn release(&self, lease: &MachineLease) -> Result<bool> {
        let Some(request_id) = &lease.client_request_id else {
            return Ok(true);
        };
        match self.provider.release_machine(request_id).await {
            Ok(()) => Ok(true),
            Err(e) if e.means_released() => Ok(true),
            Err(e) => {
                error!(lease = %lease.lease_key(), "Lease release failed: {}", e);
                Ok(false)
            }
        }
    }

    /// Deletes the bot record and clears every machine-bound field. A
    /// drained slot is then removed by a later tick.
    async fn cleanup_bot(&self, lease: &mut MachineLease) -> Result<()> {
        let mut store = self.store.lock().await;
        let conn = store.get_connection()?;
        if let Some(hostname) = &lease.hostname {
            bots::delete(conn, hostname)?;
        }
        lease.client_request_id = None;
        lease.hostname = None;
        lease.lease_expiration_ts_ms = None;
        lease.termination_task_id = None;
        lease.instruction_ts_ms = None;
        lease.connection_ts_ms = None;
        leases::update(conn, lease)?;
        info!(lease = %lease.lease_key(), "Lease cleared");
        Ok(())
    }

    /// Creates the bot record for a freshly leased machine so capacity
    /// checks and the connection probe can see it.
    async fn create_bot_record(&self, lease: &MachineLease, hostname: &str) -> Result<()> {
        let now = self.clock.now_ms();
        let mut capabilities = lease.capabilities.clone();
        capabilities.insert(KEY_BOT_ID, hostname);

        let mut store = self.store.lock().await;
        let conn = store.get_connection()?;
        bots::insert(
            conn,
            &BotRecord {
                bot_id: hostname.to_string(),
                first_seen_ms: now,
                last_seen_ms: now,
                version: String::new(),
                capabilities,
                active_run: None,
                machine_type: Some(lease.machine_type.clone()),
                lease_slot: Some(lease.slot),
                lease_expiration_ts_ms: lease.lease_expiration_ts_ms,
                leased_indefinitely: lease.leased_indefinitely,
            },
        )
    }

    async fn save(&self, lease: &MachineLease) -> Result<()> {
        let mut store = self.store.lock().await;
        let conn = store.get_connection()?;
        leases::update(conn, lease)
    }
}
