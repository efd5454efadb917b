//! Topic routing keys shared by the orchestrator and provider workers

use uuid::Uuid;

use crate::IntegrationProvider;

pub const AGGREGATION_REQUESTED: &str = "aggregation.requested";
pub const AGGREGATION_COMPLETED: &str = "aggregation.completed";
pub const INTEGRATION_REQUEST_PATTERN: &str = "integration.request.*";
pub const INTEGRATION_RESULT_PATTERN: &str = "integration.result.*";
pub const AGGREGATION_STATUS_PATTERN: &str = "aggregation.status.*";

pub fn request_key(provider: IntegrationProvider) -> String {
    format!("integration.request.{}", provider.slug())
}

pub fn result_key(provider: IntegrationProvider) -> String {
    format!("integration.result.{}", provider.slug())
}

pub fn status_key(job_id: Uuid) -> String {
    format!("aggregation.status.{}", job_id)
}
