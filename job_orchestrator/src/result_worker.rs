use message_bus::ReliablePublisher;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;
use wallet_core::routing::{self, INTEGRATION_RESULT_PATTERN};
use wallet_core::IntegrationResult;

use crate::consumer::consume;
use crate::dispatch::ProviderCatalog;
use crate::expansion::JobExpansionService;
use crate::job_store::{
    AggregationJobStore, Finalization, JobSnapshot, PlannedRequest, RecordOutcome, ResultRecord,
};
use crate::{queues, JobFinalizer, Result};

/// Collects provider results into their jobs. Any number of workers may
/// share one store; the finality gate makes sure only one finalizes.
pub struct ResultAggregationWorker {
    store: Arc<dyn AggregationJobStore>,
    expansion: Arc<JobExpansionService>,
    catalog: Arc<ProviderCatalog>,
    publisher: ReliablePublisher,
    finalizer: Arc<JobFinalizer>,
    poll_timeout: Duration,
}

impl ResultAggregationWorker {
    pub fn new(
        store: Arc<dyn AggregationJobStore>,
        expansion: Arc<JobExpansionService>,
        catalog: Arc<ProviderCatalog>,
        publisher: ReliablePublisher,
        finalizer: Arc<JobFinalizer>,
        poll_timeout: Duration,
    ) -> Self {
        Self {
            store,
            expansion,
            catalog,
            publisher,
            finalizer,
            poll_timeout,
        }
    }

    pub async fn handle_result(&self, result: IntegrationResult) -> Result<()> {
        let job_id = result.job_id;
        let additions = self.expansion.plan_expansion(&result);
        let outcome = self
            .store
            .record_result(job_id, ResultRecord::from(&result), additions)
            .await?;

        let snapshot = match outcome {
            RecordOutcome::UnknownJob => {
                info!(
                    "Dropping result {} from {}: job {} is unknown or already reaped",
                    result.request_id, result.provider, job_id
                );
                return Ok(());
            }
            RecordOutcome::UnknownRequest => {
                warn!(
                    "Dropping result {} from {}: not a request of job {}",
                    result.request_id, result.provider, job_id
                );
                return Ok(());
            }
            RecordOutcome::Progress => return Ok(()),
            // a redelivery after a failed finalization gets to retry it
            RecordOutcome::AfterFinal => {
                self.finalizer.resume(job_id).await?;
                return Ok(());
            }
            RecordOutcome::Duplicate { snapshot, follow_ups } => {
                debug!("Duplicate result {} for job {}", result.request_id, job_id);
                if !follow_ups.is_empty() && !snapshot.final_emitted {
                    info!(
                        "Republishing {} unanswered follow-ups of result {} for job {}",
                        follow_ups.len(),
                        result.request_id,
                        job_id
                    );
                    self.publish_planned(job_id, &follow_ups).await?;
                }
                snapshot
            }
            RecordOutcome::Recorded { added, snapshot } => {
                info!(
                    "Recorded {:?} from {} for job {} ({}/{})",
                    result.status,
                    result.provider,
                    job_id,
                    snapshot.processed_count(),
                    snapshot.expected_total
                );
                if !added.is_empty() {
                    info!("Expanded job {} with {} requests", job_id, added.len());
                    self.publish_planned(job_id, &added).await?;
                }
                self.publish_progress(&snapshot).await;
                snapshot
            }
        };

        if snapshot.final_emitted {
            if !snapshot.completion_published {
                self.finalizer.resume(job_id).await?;
            }
            return Ok(());
        }
        if !snapshot.all_processed() {
            return Ok(());
        }
        if let Some(final_snapshot) = self.store.try_mark_final(job_id, Finalization::Natural).await? {
            self.finalizer.finalize(&final_snapshot).await?;
        }
        Ok(())
    }

    async fn publish_planned(&self, job_id: Uuid, planned: &[PlannedRequest]) -> Result<()> {
        for request in planned {
            let message = request.to_request(job_id, self.catalog.operation_timeout(request.provider));
            self.publisher
                .publish_json(&routing::request_key(request.provider), &message)
                .await?;
        }
        Ok(())
    }

    /// Live progress for status subscribers; losing one is harmless
    async fn publish_progress(&self, snapshot: &JobSnapshot) {
        if snapshot.all_processed() {
            return;
        }
        let status = snapshot.to_status_response(None);
        if let Err(e) = self
            .publisher
            .publish_json(&routing::status_key(snapshot.job_id), &status)
            .await
        {
            warn!("Failed to publish progress for job {}: {}", snapshot.job_id, e);
        }
    }

    /// Consume integration results until shutdown
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        consume(
            self.publisher.bus(),
            queues::INTEGRATION_RESULTS,
            INTEGRATION_RESULT_PATTERN,
            self.poll_timeout,
            shutdown,
            |result: IntegrationResult| self.handle_result(result),
        )
        .await
    }
}
