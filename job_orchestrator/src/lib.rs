//! Wallet aggregation orchestration: the job store and state machine, the
//! fan-out dispatcher, result collection with dynamic expansion, the
//! timeout sweep and the finalizer that merges, prices and emits.

mod consumer;
pub mod detectors;
pub mod dispatch;
pub mod expansion;
pub mod finalizer;
pub mod job_store;
pub mod result_worker;
pub mod timeout_monitor;

pub use detectors::{
    AaveV3ReserveDetector, DetectorRegistry, RaydiumClmmPositionDetector, Trigger, TriggerDetector,
    UniswapV3PositionDetector,
};
pub use dispatch::{ProviderCatalog, RequestDispatchWorker};
pub use expansion::JobExpansionService;
pub use finalizer::{merge_payloads, JobFinalizer};
pub use job_store::{
    AggregationJobStore, Finalization, InMemoryJobStore, JobSnapshot, PlannedRequest,
    RecordOutcome, ResultRecord,
};
pub use result_worker::ResultAggregationWorker;
pub use timeout_monitor::TimeoutMonitor;

use message_bus::BusError;
use persistence_layer::PersistenceError;
use thiserror::Error;
use uuid::Uuid;

/// Queue names used by the orchestration consumers
pub mod queues {
    pub const AGGREGATION_REQUESTS: &str = "aggregation-requests";
    pub const INTEGRATION_RESULTS: &str = "integration-results";
}

#[derive(Error, Debug, Clone)]
pub enum OrchestratorError {
    #[error("Job {0} not found")]
    JobNotFound(Uuid),
    #[error("Job {0} is already final")]
    JobTerminal(Uuid),
    #[error("Message bus error: {0}")]
    Bus(String),
    #[error("Persistence error: {0}")]
    Persistence(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Invalid message: {0}")]
    InvalidMessage(String),
    #[error("Invalid aggregation request: {0}")]
    InvalidRequest(String),
}

impl From<BusError> for OrchestratorError {
    fn from(err: BusError) -> Self {
        OrchestratorError::Bus(err.to_string())
    }
}

impl From<PersistenceError> for OrchestratorError {
    fn from(err: PersistenceError) -> Self {
        OrchestratorError::Persistence(err.to_string())
    }
}

impl From<config_manager::ConfigurationError> for OrchestratorError {
    fn from(err: config_manager::ConfigurationError) -> Self {
        OrchestratorError::Config(err.to_string())
    }
}

impl From<wallet_core::CoreError> for OrchestratorError {
    fn from(err: wallet_core::CoreError) -> Self {
        OrchestratorError::InvalidMessage(err.to_string())
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        OrchestratorError::InvalidMessage(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
