//! REST API implementation for the task scheduler server
//!
//! This module provides the HTTP endpoints used by task clients (submit,
//! cancel, result), by bots (poll, update, kill_task) and by the cron
//! driver (the lifecycle sweeps and the lease tick). Handlers decode and
//! authenticate, then delegate to the scheduler components; no scheduling
//! logic lives here.

use crate::clock::Clock;
use crate::dispatch::{DispatchEngine, UpdateDelta};
use crate::lease::LeaseManager;
use crate::lifecycle::LifecycleManager;
use crate::submission::SubmissionService;
use axum::{
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use shared::api::{
    headers, BotKillTaskRequest, BotUpdateRequest, BotUpdateResponse, CancelRequest,
    CancelResponse, NewTaskRequest, PollRequest, PollResponse, SweepResponse, TaskManifest,
    TaskSummaryView,
};
use shared::config::SchedulerConfig;
use shared::utils::{decode_base64, encode_base64, parse_run_id, parse_task_id, validate_bot_id};
use shared::SchedulerError;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Server version reported to bots for self-update decisions.
const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Simple rate limiter per bot ID
///
/// Tracks poll timestamps per bot and enforces a sliding-window limit so a
/// misconfigured bot cannot hammer the queue scan. Old requests outside the
/// window are cleaned up lazily and by a periodic task.
pub struct BotRateLimiter {
    limits: Arc<RwLock<HashMap<String, Vec<Instant>>>>,
    window: Duration,
    max_requests: usize,
}

impl BotRateLimiter {
    pub fn new(window: Duration, max_requests: usize) -> Self {
        Self {
            limits: Arc::new(RwLock::new(HashMap::new())),
            window,
            max_requests,
        }
    }

    /// Returns Ok(()) if allowed, Err(ApiError::TooManyRequests) otherwise.
    pub async fn check_rate_limit(&self, bot_id: &str) -> Result<(), ApiError> {
        let now = Instant::now();
        let mut limits = self.limits.write().await;

        let requests = limits.entry(bot_id.to_string()).or_default();
        requests.retain(|&time| now.duration_since(time) < self.window);

        if requests.len() >= self.max_requests {
            warn!(
                bot_id = %bot_id,
                count = requests.len(),
                max = self.max_requests,
                "Poll rate limit exceeded"
            );
            return Err(ApiError::TooManyRequests);
        }

        requests.push(now);
        Ok(())
    }

    /// Removes entries from bots that stopped polling.
    pub async fn cleanup_stale_entries(&self) {
        let mut limits = self.limits.write().await;
        let now = Instant::now();
        let before = limits.len();
        limits.retain(|_, timestamps| {
            timestamps.retain(|&time| now.duration_since(time) < self.window);
            !timestamps.is_empty()
        });
        let removed = before.saturating_sub(limits.len());
        if removed > 0 {
            debug!(removed, remaining = limits.len(), "Rate limiter cleanup");
        }
    }
}

impl Clone for BotRateLimiter {
    fn clone(&self) -> Self {
        Self {
            limits: Arc::clone(&self.limits),
            window: self.window,
            max_requests: self.max_requests,
        }
    }
}

/// Application state shared across all API handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<SchedulerConfig>,
    pub clock: Arc<dyn Clock>,
    pub rate_limiter: BotRateLimiter,
    pub submission: Arc<SubmissionService>,
    pub dispatch: Arc<DispatchEngine>,
    pub lifecycle: Arc<LifecycleManager>,
    /// Present only when machine types and a provider are configured.
    pub lease: Option<Arc<LeaseManager>>,
}

impl AppState {
    pub fn new(
        config: Arc<SchedulerConfig>,
        clock: Arc<dyn Clock>,
        submission: Arc<SubmissionService>,
        dispatch: Arc<DispatchEngine>,
        lifecycle: Arc<LifecycleManager>,
        lease: Option<Arc<LeaseManager>>,
    ) -> Self {
        let rate_limiter = BotRateLimiter::new(
            Duration::from_secs(config.rate_limit_window_secs as u64),
            config.rate_limit_max_requests,
        );
        Self {
            config,
            clock,
            rate_limiter,
            submission,
            dispatch,
            lifecycle,
            lease,
        }
    }
}

/// Creates the API router. Called once at server startup.
pub fn create_router(state: AppState) -> Router {
    // Bounds request bodies; output deltas dominate and stay well below.
    const MAX_REQUEST_SIZE: usize = 4 * 1024 * 1024;

    Router::new()
        // Unauthenticated liveness probe for load balancers.
        .route("/health", get(health_check))
        .route(shared::api::endpoints::TASK_NEW, post(handle_task_new))
        .route(shared::api::endpoints::TASK_CANCEL, post(handle_task_cancel))
        .route(shared::api::endpoints::TASK_RESULT, get(handle_task_result))
        .route(shared::api::endpoints::BOT_POLL, post(handle_bot_poll))
        .route(shared::api::endpoints::BOT_UPDATE, post(handle_bot_update))
        .route(
            shared::api::endpoints::BOT_KILL_TASK,
            post(handle_bot_kill_task),
        )
        .route(shared::api::endpoints::CRON_EXPIRE, post(handle_cron_expire))
        .route(
            shared::api::endpoints::CRON_DEAD_BOTS,
            post(handle_cron_dead_bots),
        )
        .route(
            shared::api::endpoints::CRON_DEDUP_INDEX,
            post(handle_cron_dedup_index),
        )
        .route(
            shared::api::endpoints::CRON_UTILIZATION,
            post(handle_cron_utilization),
        )
        .route(
            shared::api::endpoints::CRON_LEASE_TICK,
            post(handle_cron_lease_tick),
        )
        .layer(DefaultBodyLimit::max(MAX_REQUEST_SIZE))
        .with_state(state)
}

/// Validates the API key header with a constant-time comparison.
fn validate_api_key(header_map: &HeaderMap, expected_key: &str) -> Result<(), ApiError> {
    use subtle::ConstantTimeEq;

    let provided_key = match header_map.get(headers::API_KEY) {
        Some(key) => key.to_str().map_err(|_| {
            warn!("Invalid API key format in header");
            ApiError::Unauthorized
        })?,
        None => {
            warn!("Missing API key header");
            return Err(ApiError::Unauthorized);
        }
    };

    let provided_bytes = provided_key.as_bytes();
    let expected_bytes = expected_key.as_bytes();
    let keys_match = provided_bytes.len() == expected_bytes.len()
        && bool::from(provided_bytes.ct_eq(expected_bytes));
    if !keys_match {
        warn!("Invalid API key provided");
        return Err(ApiError::Unauthorized);
    }
    Ok(())
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn handle_task_new(
    State(state): State<AppState>,
    header_map: HeaderMap,
    Json(request): Json<NewTaskRequest>,
) -> Result<Json<TaskSummaryView>, ApiError> {
    validate_api_key(&header_map, &state.config.api_key)?;

    let secret = match &request.secret_bytes {
        Some(encoded) => Some(
            decode_base64(encoded)
                .map_err(|e| ApiError::BadRequest(format!("Invalid secret_bytes: {}", e)))?,
        ),
        None => None,
    };

    let summary = state.submission.submit(request, secret).await?;
    Ok(Json(TaskSummaryView::from_summary(&summary)))
}

async fn handle_task_cancel(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    header_map: HeaderMap,
    Json(request): Json<CancelRequest>,
) -> Result<Json<CancelResponse>, ApiError> {
    validate_api_key(&header_map, &state.config.api_key)?;
    let request_id = parse_task_id(&task_id)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let (ok, was_running) = state
        .dispatch
        .cancel(request_id, request.kill_running, request.bot_id.as_deref())
        .await?;
    Ok(Json(CancelResponse { ok, was_running }))
}

#[derive(Deserialize)]
struct ResultQuery {
    #[serde(default)]
    include_output: bool,
}

async fn handle_task_result(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Query(query): Query<ResultQuery>,
    header_map: HeaderMap,
) -> Result<Json<TaskSummaryView>, ApiError> {
    validate_api_key(&header_map, &state.config.api_key)?;
    let request_id = parse_task_id(&task_id)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let summary = state
        .submission
        .get_result(request_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Unknown task".to_string()))?;

    let mut view = TaskSummaryView::from_summary(&summary);
    if query.include_output {
        if let Some(output) = state.submission.get_output(&summary).await? {
            view.output = Some(encode_base64(&output));
        }
    }
    Ok(Json(view))
}

async fn handle_bot_poll(
    State(state): State<AppState>,
    header_map: HeaderMap,
    Json(request): Json<PollRequest>,
) -> Result<Json<PollResponse>, ApiError> {
    validate_api_key(&header_map, &state.config.api_key)?;
    validate_bot_id(&request.bot_id).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    request
        .capabilities
        .validate()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    state.rate_limiter.check_rate_limit(&request.bot_id).await?;

    state
        .dispatch
        .record_bot_seen(&request.bot_id, &request.version, &request.capabilities)
        .await?;

    // A stale bot updates itself before taking any work.
    if request.version != SERVER_VERSION {
        return Ok(Json(PollResponse::Update {
            version: SERVER_VERSION.to_string(),
        }));
    }

    let deadline = state.clock.now_ms() + (state.config.poll_scan_deadline_secs as i64) * 1000;
    let reaped = state
        .dispatch
        .reap(
            &request.bot_id,
            &request.version,
            &request.capabilities,
            deadline,
        )
        .await?;

    let Some(reaped) = reaped else {
        return Ok(Json(PollResponse::Sleep {
            duration_secs: state.config.poll_sleep_secs,
        }));
    };

    if reaped.request.is_termination() {
        return Ok(Json(PollResponse::Terminate {
            run_id: reaped.run.run_id(),
        }));
    }

    let slice = reaped.request.slice(reaped.run.current_slice);
    Ok(Json(PollResponse::Run {
        manifest: TaskManifest {
            run_id: reaped.run.run_id(),
            task_id: reaped.request.task_id(),
            try_number: reaped.run.try_number,
            slice_index: reaped.run.current_slice,
            command: slice.command.clone(),
            env: slice.env.clone(),
            inputs_ref: slice.inputs_ref.clone(),
            execution_timeout_secs: slice.execution_timeout_secs,
            io_timeout_secs: slice.io_timeout_secs,
            grace_period_secs: slice.grace_period_secs,
            secret_bytes: reaped.secret.as_deref().map(encode_base64),
        },
    }))
}

async fn handle_bot_update(
    State(state): State<AppState>,
    header_map: HeaderMap,
    Json(request): Json<BotUpdateRequest>,
) -> Result<Json<BotUpdateResponse>, ApiError> {
    validate_api_key(&header_map, &state.config.api_key)?;
    let (request_id, try_number) = parse_run_id(&request.run_id)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let output = match &request.output {
        Some(encoded) => Some(
            decode_base64(encoded)
                .map_err(|e| ApiError::BadRequest(format!("Invalid output: {}", e)))?,
        ),
        None => None,
    };

    let outcome = state
        .dispatch
        .update(
            request_id,
            try_number,
            &request.bot_id,
            UpdateDelta {
                output,
                output_offset: request.output_offset,
                exit_code: request.exit_code,
                duration_secs: request.duration_secs,
                hard_timeout: request.hard_timeout,
                io_timeout: request.io_timeout,
                cost_usd: request.cost_usd,
                outputs_ref: request.outputs_ref.clone(),
            },
        )
        .await?;

    Ok(Json(BotUpdateResponse {
        ok: true,
        state: outcome.state,
        must_stop: outcome.must_stop,
    }))
}

async fn handle_bot_kill_task(
    State(state): State<AppState>,
    header_map: HeaderMap,
    Json(request): Json<BotKillTaskRequest>,
) -> Result<StatusCode, ApiError> {
    validate_api_key(&header_map, &state.config.api_key)?;
    let (request_id, try_number) = parse_run_id(&request.run_id)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    state
        .dispatch
        .bot_kill_task(request_id, try_number, &request.bot_id, &request.reason)
        .await?;
    Ok(StatusCode::OK)
}

async fn handle_cron_expire(
    State(state): State<AppState>,
    header_map: HeaderMap,
) -> Result<Json<SweepResponse>, ApiError> {
    validate_api_key(&header_map, &state.config.api_key)?;
    let acted_on = state.lifecycle.sweep_expired_queue().await?;
    Ok(Json(SweepResponse { acted_on }))
}

async fn handle_cron_dead_bots(
    State(state): State<AppState>,
    header_map: HeaderMap,
) -> Result<Json<SweepResponse>, ApiError> {
    validate_api_key(&header_map, &state.config.api_key)?;
    let acted_on = state.lifecycle.sweep_dead_bots().await?;
    Ok(Json(SweepResponse { acted_on }))
}

async fn handle_cron_dedup_index(
    State(state): State<AppState>,
    header_map: HeaderMap,
) -> Result<Json<SweepResponse>, ApiError> {
    validate_api_key(&header_map, &state.config.api_key)?;
    let acted_on = state.lifecycle.sweep_dedup_index().await?;
    Ok(Json(SweepResponse { acted_on }))
}

async fn handle_cron_utilization(
    State(state): State<AppState>,
    header_map: HeaderMap,
) -> Result<Json<SweepResponse>, ApiError> {
    validate_api_key(&header_map, &state.config.api_key)?;
    let acted_on = match &state.lease {
        Some(lease) => lease.compute_utilization().await?,
        None => 0,
    };
    Ok(Json(SweepResponse { acted_on }))
}

async fn handle_cron_lease_tick(
    State(state): State<AppState>,
    header_map: HeaderMap,
) -> Result<Json<SweepResponse>, ApiError> {
    validate_api_key(&header_map, &state.config.api_key)?;
    let acted_on = match &state.lease {
        Some(lease) => lease.tick().await?,
        None => 0,
    };
    Ok(Json(SweepResponse { acted_on }))
}

/// Errors surfaced by API handlers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Too many requests")]
    TooManyRequests,
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(scheduler_err) = err.downcast_ref::<SchedulerError>() {
            return match scheduler_err {
                SchedulerError::Validation(msg) => ApiError::BadRequest(msg.clone()),
                SchedulerError::Authorization(msg) => ApiError::Forbidden(msg.clone()),
                SchedulerError::BotMisbehavior(msg) => ApiError::BadRequest(msg.clone()),
                SchedulerError::NotFound(msg) => ApiError::NotFound(msg.clone()),
                SchedulerError::TransactionConflict(msg) => ApiError::Conflict(msg.clone()),
                other => ApiError::Internal(other.to_string()),
            };
        }
        if crate::store::is_busy_error(&err) {
            // The caller (bot or cron) retries the whole operation on its
            // next tick.
            return ApiError::Conflict("Transaction conflict, retry".to_string());
        }
        ApiError::Internal(err.to_string())
    }
}

/// Converts an `ApiError` into an HTTP response with a JSON body.
impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized"),
            ApiError::Forbidden(_) => (StatusCode::FORBIDDEN, "Forbidden"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "Bad Request"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "Not Found"),
            ApiError::TooManyRequests => (StatusCode::TOO_MANY_REQUESTS, "Too Many Requests"),
            ApiError::Conflict(_) => (StatusCode::SERVICE_UNAVAILABLE, "Conflict"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error"),
        };

        let body = Json(serde_json::json!({
            "error": error_message,
            "details": self.to_string()
        }));

        (status, body).into_response()
    }
}
