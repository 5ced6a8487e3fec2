//! Tests for the lease manager: sizing, the per-lease state machine and
//! release paths

use crate::clock::Clock;
use crate::config::ConfigManager;
use crate::dispatch::UpdateDelta;
use crate::lease::LeaseManager;
use crate::provider::{LeaseRequest, LeaseResponse, LeaseState, MachineProvider, ProviderError};
use crate::store::leases;
use crate::tests::test_utils::TestEnv;
use async_trait::async_trait;
use shared::tasks::{MachineLease, MachineUtilization, TaskState};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Scripted provider: lease responses pop from a queue (default Pending);
/// release and instruct calls are recorded and succeed.
struct FakeProvider {
    lease_responses: std::sync::Mutex<VecDeque<Result<LeaseResponse, ProviderError>>>,
    released: std::sync::Mutex<Vec<String>>,
    instructed: std::sync::Mutex<Vec<String>>,
}

impl FakeProvider {
    fn new() -> Self {
        Self {
            lease_responses: std::sync::Mutex::new(VecDeque::new()),
            released: std::sync::Mutex::new(Vec::new()),
            instructed: std::sync::Mutex::new(Vec::new()),
        }
    }

    fn push_response(&self, response: Result<LeaseResponse, ProviderError>) {
        self.lease_responses.lock().unwrap().push_back(response);
    }

    fn released(&self) -> Vec<String> {
        self.released.lock().unwrap().clone()
    }

    fn instructed(&self) -> Vec<String> {
        self.instructed.lock().unwrap().clone()
    }
}

#[async_trait]
impl MachineProvider for FakeProvider {
    async fn lease_machine(&self, _request: &LeaseRequest) -> Result<LeaseResponse, ProviderError> {
        self.lease_responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(LeaseResponse {
                state: LeaseState::Pending,
                hostname: None,
                lease_expiration_ts_ms: None,
                leased_indefinitely: false,
            }))
    }

    async fn release_machine(&self, request_id: &str) -> Result<(), ProviderError> {
        self.released.lock().unwrap().push(request_id.to_string());
        Ok(())
    }

    async fn instruct_machine(
        &self,
        request_id: &str,
        _server_url: &str,
    ) -> Result<(), ProviderError> {
        self.instructed.lock().unwrap().push(request_id.to_string());
        Ok(())
    }
}

struct LeaseEnv {
    env: TestEnv,
    lease: Arc<LeaseManager>,
    provider: Arc<FakeProvider>,
    machine_types_path: PathBuf,
}

impl LeaseEnv {
    fn new(machine_types_toml: &str) -> Self {
        let env = TestEnv::new();

        let server_toml = env.temp.path().join("server.toml");
        std::fs::write(
            &server_toml,
            r#"
listen_address = "127.0.0.1:0"
api_key = "test-key-0123456789abcdef"
machine_types_file = "machine_types.toml"
"#,
        )
        .unwrap();
        let machine_types_path = env.temp.path().join("machine_types.toml");
        std::fs::write(&machine_types_path, machine_types_toml).unwrap();

        let config_manager = Arc::new(Mutex::new(ConfigManager::new(&server_toml).unwrap()));
        let provider = Arc::new(FakeProvider::new());
        let lease = Arc::new(LeaseManager::new(
            Arc::clone(&env.store),
            Arc::clone(&env.clock) as Arc<dyn crate::clock::Clock>,
            Arc::clone(&env.config),
            config_manager,
            Arc::clone(&provider) as Arc<dyn MachineProvider>,
            Arc::clone(&env.submission),
            "http://scheduler.test:8600".to_string(),
        ));

        Self {
            env,
            lease,
            provider,
            machine_types_path,
        }
    }

    fn rewrite_machine_types(&self, toml: &str) {
        std::fs::write(&self.machine_types_path, toml).unwrap();
    }

    async fn lease_row(&self, machine_type: &str, slot: u32) -> Option<MachineLease> {
        let mut store = self.env.store.lock().await;
        let conn = store.get_connection().unwrap();
        leases::get(conn, machine_type, slot).unwrap()
    }

    async fn rows_for(&self, machine_type: &str) -> Vec<MachineLease> {
        let mut store = self.env.store.lock().await;
        let conn = store.get_connection().unwrap();
        leases::list_for_type(conn, machine_type).unwrap()
    }

    async fn set_utilization(&self, machine_type: &str, busy: u32, idle: u32) {
        let mut store = self.env.store.lock().await;
        let conn = store.get_connection().unwrap();
        leases::put_utilization(
            conn,
            &MachineUtilization {
                machine_type: machine_type.to_string(),
                busy,
                idle,
                computed_ts_ms: self.env.clock.now_ms(),
            },
        )
        .unwrap();
    }
}

const BASIC_TYPE: &str = r#"
[[machine_types]]
name = "mt1"
target_size = 1
lease_duration_secs = 3600
early_release_secs = 600

[machine_types.capabilities]
pool = ["leased"]
os = ["linux"]
"#;

#[tokio::test]
async fn test_lease_reaches_connected_in_bounded_ticks() {
    let harness = LeaseEnv::new(BASIC_TYPE);

    // Tick 1: the slot record is created and a request id assigned.
    assert!(harness.lease.tick().await.unwrap() >= 2);
    let lease = harness.lease_row("mt1", 0).await.unwrap();
    assert_eq!(lease.client_request_id.as_deref(), Some("mt1-0-1"));
    assert!(lease.hostname.is_none());

    // Tick 2: the provider fulfills; hostname recorded, bot record
    // created, connect instruction delivered.
    let expiration = harness.env.clock.now_ms() + 3_600_000;
    harness.provider.push_response(Ok(LeaseResponse {
        state: LeaseState::Fulfilled,
        hostname: Some("host-1".to_string()),
        lease_expiration_ts_ms: Some(expiration),
        leased_indefinitely: false,
    }));
    assert_eq!(harness.lease.tick().await.unwrap(), 1);
    let lease = harness.lease_row("mt1", 0).await.unwrap();
    assert_eq!(lease.hostname.as_deref(), Some("host-1"));
    assert!(lease.instruction_ts_ms.is_some());
    assert!(lease.connection_ts_ms.is_none());
    assert_eq!(harness.provider.instructed(), vec!["mt1-0-1".to_string()]);
    {
        let mut store = harness.env.store.lock().await;
        let conn = store.get_connection().unwrap();
        let bot = crate::store::bots::get(conn, "host-1").unwrap().unwrap();
        assert_eq!(bot.machine_type.as_deref(), Some("mt1"));
    }

    // Tick 3 without a poll: still waiting for the connection.
    assert_eq!(harness.lease.tick().await.unwrap(), 0);

    // The machine's bot polls; the next tick records the connection.
    harness.env.clock.advance_secs(5);
    harness.env.add_bot("host-1", &["leased"]).await;
    assert_eq!(harness.lease.tick().await.unwrap(), 1);
    let lease = harness.lease_row("mt1", 0).await.unwrap();
    assert!(lease.connection_ts_ms.is_some());

    // Steady state: nothing to do.
    assert_eq!(harness.lease.tick().await.unwrap(), 0);
}

#[tokio::test]
async fn test_early_release_goes_through_termination_task() {
    let harness = LeaseEnv::new(BASIC_TYPE);

    harness.lease.tick().await.unwrap();
    let expiration = harness.env.clock.now_ms() + 3_600_000;
    harness.provider.push_response(Ok(LeaseResponse {
        state: LeaseState::Fulfilled,
        hostname: Some("host-1".to_string()),
        lease_expiration_ts_ms: Some(expiration),
        leased_indefinitely: false,
    }));
    harness.lease.tick().await.unwrap();
    harness.env.clock.advance_secs(5);
    let caps = harness.env.add_bot("host-1", &["leased"]).await;
    harness.lease.tick().await.unwrap();

    // Into the early release window (600s before expiration).
    harness.env.clock.advance_secs(3_600 - 400);
    harness.env.add_bot("host-1", &["leased"]).await;
    assert_eq!(harness.lease.tick().await.unwrap(), 1);
    let lease = harness.lease_row("mt1", 0).await.unwrap();
    let termination_id = lease.termination_task_id.expect("termination scheduled");

    // The termination task is pinned to the machine's bot; it reaps it,
    // acknowledges, and the bot self-exits.
    let reaped = harness.env.reap_as("host-1", &caps).await.unwrap();
    assert!(reaped.request.is_termination());
    assert_eq!(reaped.request.id, termination_id);
    harness
        .env
        .dispatch
        .update(
            termination_id,
            1,
            "host-1",
            UpdateDelta {
                exit_code: Some(0),
                duration_secs: Some(0.5),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(
        harness.env.summary(termination_id).await.state,
        TaskState::Completed
    );

    // Next tick observes the completion, releases and cleans up.
    assert_eq!(harness.lease.tick().await.unwrap(), 1);
    assert_eq!(harness.provider.released(), vec!["mt1-0-1".to_string()]);
    let lease = harness.lease_row("mt1", 0).await.unwrap();
    assert!(lease.hostname.is_none());
    assert!(lease.client_request_id.is_none());
    {
        let mut store = harness.env.store.lock().await;
        let conn = store.get_connection().unwrap();
        assert!(crate::store::bots::get(conn, "host-1").unwrap().is_none());
    }

    // The slot is still wanted, so the next tick issues a fresh request
    // id that never reuses a spent one.
    harness.lease.tick().await.unwrap();
    let lease = harness.lease_row("mt1", 0).await.unwrap();
    assert_eq!(lease.client_request_id.as_deref(), Some("mt1-0-2"));
}

#[tokio::test]
async fn test_machine_failing_to_connect_is_released() {
    let harness = LeaseEnv::new(BASIC_TYPE);

    harness.lease.tick().await.unwrap();
    harness.provider.push_response(Ok(LeaseResponse {
        state: LeaseState::Fulfilled,
        hostname: Some("host-1".to_string()),
        lease_expiration_ts_ms: Some(harness.env.clock.now_ms() + 3_600_000),
        leased_indefinitely: false,
    }));
    harness.lease.tick().await.unwrap();

    // No bot ever polls. Past the tolerance the lease is abandoned.
    harness.env.clock.advance_secs(7 * 60);
    assert_eq!(harness.lease.tick().await.unwrap(), 1);
    assert_eq!(harness.provider.released(), vec!["mt1-0-1".to_string()]);
    let lease = harness.lease_row("mt1", 0).await.unwrap();
    assert!(lease.hostname.is_none());
}

#[tokio::test]
async fn test_denied_request_clears_id_and_drained_slot_is_deleted() {
    let harness = LeaseEnv::new(BASIC_TYPE);

    harness.lease.tick().await.unwrap();
    assert!(harness.lease_row("mt1", 0).await.is_some());

    // The machine type disappears from the configuration.
    harness.rewrite_machine_types("");
    harness.provider.push_response(Ok(LeaseResponse {
        state: LeaseState::Denied,
        hostname: None,
        lease_expiration_ts_ms: None,
        leased_indefinitely: false,
    }));

    // Drain, clear the denied request, then delete the empty slot.
    harness.lease.tick().await.unwrap();
    harness.lease.tick().await.unwrap();
    harness.lease.tick().await.unwrap();
    assert!(harness.lease_row("mt1", 0).await.is_none());
}

#[tokio::test]
async fn test_transient_provider_error_leaves_state_untouched() {
    let harness = LeaseEnv::new(BASIC_TYPE);

    harness.lease.tick().await.unwrap();
    harness
        .provider
        .push_response(Err(ProviderError::DeadlineExceeded));
    assert_eq!(harness.lease.tick().await.unwrap(), 0);

    // The same request id is retried on the next tick.
    let lease = harness.lease_row("mt1", 0).await.unwrap();
    assert_eq!(lease.client_request_id.as_deref(), Some("mt1-0-1"));
}

const LOAD_BASED_TYPE: &str = r#"
[[machine_types]]
name = "elastic"
target_size = 3
lease_duration_secs = 3600

[machine_types.capabilities]
pool = ["leased"]

[machine_types.load_based]
minimum_size = 2
maximum_size = 20
"#;

#[tokio::test]
async fn test_load_based_sizing_scales_with_busy_count() {
    let harness = LeaseEnv::new(LOAD_BASED_TYPE);

    // ceil(4 * 1.5) = 6 slots.
    harness.set_utilization("elastic", 4, 1).await;
    harness.lease.tick().await.unwrap();
    let active = harness
        .rows_for("elastic")
        .await
        .iter()
        .filter(|l| !l.drained)
        .count();
    assert_eq!(active, 6);

    // Load drops sharply, but one tick may only shrink to 99% of the
    // current size.
    harness.set_utilization("elastic", 1, 5).await;
    harness.lease.tick().await.unwrap();
    let active = harness
        .rows_for("elastic")
        .await
        .iter()
        .filter(|l| !l.drained)
        .count();
    assert_eq!(active, 5);
}

const SCHEDULED_TYPE: &str = r#"
[[machine_types]]
name = "clocked"
target_size = 1
lease_duration_secs = 3600

[machine_types.capabilities]
pool = ["leased"]

[[machine_types.schedule]]
start = "00:00"
end = "23:59"
target_size = 4
"#;

#[tokio::test]
async fn test_schedule_interval_overrides_target_size() {
    let harness = LeaseEnv::new(SCHEDULED_TYPE);

    // The all-day interval applies regardless of utilization.
    harness.lease.tick().await.unwrap();
    assert_eq!(harness.rows_for("clocked").await.len(), 4);
}
