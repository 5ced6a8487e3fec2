//! Machine provider interface
//!
//! The external service leasing ephemeral machines. Every call is keyed by
//! a client-supplied request id so provider-side retries are idempotent.
//! Error codes split into transient ones (retried on the next lease tick)
//! and permanent ones (the request id is spent and a fresh one is issued);
//! `ALREADY_RECLAIMED` and `NOT_FOUND` on release mean the machine is
//! already gone and count as success.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared::capabilities::CapabilitySet;

/// Lease request sent to the provider.
#[derive(Debug, Clone, Serialize)]
pub struct LeaseRequest {
    pub request_id: String,
    pub capabilities: CapabilitySet,
    pub duration_secs: u32,
    pub indefinite: bool,
}

/// Provider-side state of a lease request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseState {
    Pending,
    Fulfilled,
    Denied,
}

/// Response to a lease request.
#[derive(Debug, Clone, Deserialize)]
pub struct LeaseResponse {
    pub state: LeaseState,
    pub hostname: Option<String>,
    pub lease_expiration_ts_ms: Option<i64>,
    #[serde(default)]
    pub leased_indefinitely: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider deadline exceeded")]
    DeadlineExceeded,
    #[error("provider transient error: {0}")]
    Transient(String),
    #[error("lease already reclaimed")]
    AlreadyReclaimed,
    #[error("lease not found")]
    NotFound,
    #[error("provider permanent error: {0}")]
    Permanent(String),
}

impl ProviderError {
    /// Transient errors leave the lease state untouched for the next tick.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::DeadlineExceeded | ProviderError::Transient(_)
        )
    }

    /// On release these mean the machine is already gone.
    pub fn means_released(&self) -> bool {
        matches!(
            self,
            ProviderError::AlreadyReclaimed | ProviderError::NotFound
        )
    }
}

/// The machine provider consumed by the lease manager.
#[async_trait]
pub trait MachineProvider: Send + Sync {
    async fn lease_machine(&self, request: &LeaseRequest) -> Result<LeaseResponse, ProviderError>;
    async fn release_machine(&self, request_id: &str) -> Result<(), ProviderError>;
    async fn instruct_machine(&self, request_id: &str, server_url: &str)
        -> Result<(), ProviderError>;
}

/// HTTP implementation talking JSON to a provider endpoint.
pub struct HttpMachineProvider {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct ReleaseBody<'a> {
    request_id: &'a str,
}

#[derive(Serialize)]
struct InstructBody<'a> {
    request_id: &'a str,
    server_url: &'a str,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: Option<String>,
}

impl HttpMachineProvider {
    pub fn new(base_url: String) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build provider HTTP client: {}", e))?;
        Ok(Self { base_url, client })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    fn map_error(code: &str, detail: String) -> ProviderError {
        match code {
            "DEADLINE_EXCEEDED" => ProviderError::DeadlineExceeded,
            "TRANSIENT_ERROR" => ProviderError::Transient(detail),
            "ALREADY_RECLAIMED" => ProviderError::AlreadyReclaimed,
            "NOT_FOUND" => ProviderError::NotFound,
            other => ProviderError::Permanent(format!("{}: {}", other, detail)),
        }
    }

    async fn post<B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<reqwest::Response, ProviderError> {
        let response = self
            .client
            .post(self.endpoint(path))
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::DeadlineExceeded
                } else {
                    ProviderError::Transient(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let code = response
            .json::<ErrorBody>()
            .await
            .ok()
            .and_then(|b| b.error)
            .unwrap_or_else(|| status.to_string());
        if status.is_server_error() {
            Err(ProviderError::Transient(code))
        } else {
            Err(Self::map_error(&code, status.to_string()))
        }
    }
}

#[async_trait]
impl MachineProvider for HttpMachineProvider {
    async fn lease_machine(&self, request: &LeaseRequest) -> Result<LeaseResponse, ProviderError> {
        let response = self.post("lease", request).await?;
        response
            .json::<LeaseResponse>()
            .await
            .map_err(|e| ProviderError::Transient(format!("bad lease response: {}", e)))
    }

    async fn release_machine(&self, request_id: &str) -> Result<(), ProviderError> {
        self.post("release", &ReleaseBody { request_id }).await?;
        Ok(())
    }

    async fn instruct_machine(
        &self,
        request_id: &str,
        server_url: &str,
    ) -> Result<(), ProviderError> {
        self.post(
            "instruct",
            &InstructBody {
                request_id,
                server_url,
            },
        )
        .await?;
        Ok(())
    }
}
