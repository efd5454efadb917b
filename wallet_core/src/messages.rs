//! Messages exchanged over the bus between the API boundary, the
//! orchestrator and provider workers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::{Chain, IntegrationProvider, WalletResponse};

/// Lifecycle of an aggregation job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    CompletedWithErrors,
    TimedOut,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed
                | JobStatus::CompletedWithErrors
                | JobStatus::TimedOut
                | JobStatus::Cancelled
        )
    }
}

/// Status reported by a provider worker for a single request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IntegrationStatus {
    Pending,
    InProgress,
    Success,
    Failed,
    TimedOut,
    Cancelled,
}

impl IntegrationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, IntegrationStatus::Pending | IntegrationStatus::InProgress)
    }
}

/// Trigger published by the API boundary
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletAggregationRequested {
    /// Pre-assigned by the caller so it can answer synchronously
    #[serde(default)]
    pub job_id: Option<Uuid>,
    pub accounts: Vec<String>,
    pub chains: Vec<Chain>,
    pub requested_at_utc: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationRequest {
    pub job_id: Uuid,
    pub request_id: Uuid,
    pub account: String,
    pub chains: Vec<Chain>,
    pub provider: IntegrationProvider,
    pub requested_at_utc: DateTime<Utc>,
    pub attempt: u32,
    #[serde(default)]
    pub operation_timeout_seconds: Option<u64>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationResult {
    pub job_id: Uuid,
    pub request_id: Uuid,
    pub account: String,
    pub chains: Vec<Chain>,
    pub provider: IntegrationProvider,
    pub status: IntegrationStatus,
    pub started_at_utc: DateTime<Utc>,
    pub finished_at_utc: DateTime<Utc>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    /// Provider-specific body; successful results carry a list of wallet items
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl IntegrationResult {
    /// Build the result a provider worker answers a request with
    pub fn for_request(
        request: &IntegrationRequest,
        status: IntegrationStatus,
        payload: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            job_id: request.job_id,
            request_id: request.request_id,
            account: request.account.clone(),
            chains: request.chains.clone(),
            provider: request.provider,
            status,
            started_at_utc: request.requested_at_utc,
            finished_at_utc: now,
            error_code: None,
            error_message: None,
            payload,
        }
    }

    pub fn with_error(mut self, code: &str, message: &str) -> Self {
        self.error_code = Some(code.to_string());
        self.error_message = Some(message.to_string());
        self
    }
}

/// Per-request progress entry of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderProgress {
    pub request_id: Uuid,
    pub provider: IntegrationProvider,
    pub chain: Chain,
    pub account: String,
    pub status: IntegrationStatus,
    #[serde(default)]
    pub finished_at_utc: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_code: Option<String>,
}

/// Schema version carried by `WalletAggregationCompleted`
pub const COMPLETED_EVENT_VERSION: u16 = 2;

/// Completion event, emitted at most once per job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletAggregationCompleted {
    pub version: u16,
    pub job_id: Uuid,
    pub status: JobStatus,
    pub accounts: Vec<String>,
    pub chains: Vec<Chain>,
    pub expected_total: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub timed_out: u32,
    pub failed_providers: Vec<String>,
    pub timed_out_providers: Vec<String>,
    pub total_value_usd: rust_decimal::Decimal,
    pub completed_at_utc: DateTime<Utc>,
}

/// Read model for a job: live progress, plus the merged wallet once final
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationStatusResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub is_final: bool,
    pub accounts: Vec<String>,
    pub chains: Vec<Chain>,
    pub expected_total: u32,
    pub processed_count: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub timed_out: u32,
    pub created_at_utc: DateTime<Utc>,
    #[serde(default)]
    pub completed_at_utc: Option<DateTime<Utc>>,
    pub items: Vec<ProviderProgress>,
    #[serde(default)]
    pub wallet: Option<WalletResponse>,
}
