use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;
use wallet_core::{
    AggregationStatusResponse, Chain, IntegrationProvider, IntegrationRequest, IntegrationResult,
    IntegrationStatus, JobStatus, ProviderProgress, WalletResponse,
};

use crate::{OrchestratorError, Result};

const DEADLINE_ERROR_CODE: &str = "deadline_exceeded";

/// A request that belongs to a job but may not be published yet
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedRequest {
    pub request_id: Uuid,
    pub account: String,
    pub provider: IntegrationProvider,
    pub chain: Chain,
    /// Request whose result triggered this one through expansion
    pub origin: Option<Uuid>,
}

impl PlannedRequest {
    pub fn new(account: &str, provider: IntegrationProvider, chain: Chain) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            account: account.to_string(),
            provider,
            chain,
            origin: None,
        }
    }

    pub fn with_origin(mut self, request_id: Uuid) -> Self {
        self.origin = Some(request_id);
        self
    }

    /// EVM addresses are case-insensitive, Solana addresses are not
    fn identity(&self) -> (String, IntegrationProvider, Chain) {
        let account = if self.chain.is_evm() {
            self.account.to_lowercase()
        } else {
            self.account.clone()
        };
        (account, self.provider, self.chain)
    }

    pub fn to_request(&self, job_id: Uuid, operation_timeout_seconds: Option<u64>) -> IntegrationRequest {
        IntegrationRequest {
            job_id,
            request_id: self.request_id,
            account: self.account.clone(),
            chains: vec![self.chain],
            provider: self.provider,
            requested_at_utc: Utc::now(),
            attempt: 1,
            operation_timeout_seconds,
            metadata: HashMap::new(),
        }
    }
}

/// The part of an `IntegrationResult` the store keeps
#[derive(Debug, Clone)]
pub struct ResultRecord {
    pub request_id: Uuid,
    pub provider: IntegrationProvider,
    pub status: IntegrationStatus,
    pub finished_at_utc: DateTime<Utc>,
    pub error_code: Option<String>,
    /// Only kept for successful results
    pub payload: Option<serde_json::Value>,
}

impl From<&IntegrationResult> for ResultRecord {
    fn from(result: &IntegrationResult) -> Self {
        Self {
            request_id: result.request_id,
            provider: result.provider,
            status: result.status,
            finished_at_utc: result.finished_at_utc,
            error_code: result.error_code.clone(),
            payload: (result.status == IntegrationStatus::Success).then(|| result.payload.clone()),
        }
    }
}

/// Why a job is being closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finalization {
    /// Every expected result has been processed
    Natural,
    /// The job outlived its timeout; unanswered requests are timed out
    Deadline,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    UnknownJob,
    UnknownRequest,
    /// The request already has a terminal result. The snapshot lets the
    /// caller re-check finality, `follow_ups` are the still unanswered
    /// requests this result expanded into, for republishing.
    Duplicate {
        snapshot: JobSnapshot,
        follow_ups: Vec<PlannedRequest>,
    },
    /// The job is final; the result is counted for audit only
    AfterFinal,
    /// Non-terminal provider status (pending / in progress)
    Progress,
    Recorded {
        added: Vec<PlannedRequest>,
        snapshot: JobSnapshot,
    },
}

/// Point-in-time copy of a job's counters and progress list
#[derive(Debug, Clone, PartialEq)]
pub struct JobSnapshot {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub accounts: Vec<String>,
    pub chains: Vec<Chain>,
    pub expected_total: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub timed_out: u32,
    pub final_emitted: bool,
    /// Completion event and final status have been published
    pub completion_published: bool,
    pub created_at_utc: DateTime<Utc>,
    pub completed_at_utc: Option<DateTime<Utc>>,
    pub items: Vec<ProviderProgress>,
}

impl JobSnapshot {
    pub fn processed_count(&self) -> u32 {
        self.succeeded + self.failed + self.timed_out
    }

    pub fn all_processed(&self) -> bool {
        self.processed_count() == self.expected_total
    }

    fn providers_with(&self, statuses: &[IntegrationStatus]) -> Vec<String> {
        self.items
            .iter()
            .filter(|item| statuses.contains(&item.status))
            .map(|item| item.provider.slug().to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn failed_providers(&self) -> Vec<String> {
        self.providers_with(&[IntegrationStatus::Failed, IntegrationStatus::Cancelled])
    }

    pub fn timed_out_providers(&self) -> Vec<String> {
        self.providers_with(&[IntegrationStatus::TimedOut])
    }

    /// Items that were planned but have no result yet
    pub fn pending_requests(&self) -> Vec<PlannedRequest> {
        self.items
            .iter()
            .filter(|item| item.status == IntegrationStatus::Pending)
            .map(|item| PlannedRequest {
                request_id: item.request_id,
                account: item.account.clone(),
                provider: item.provider,
                chain: item.chain,
                origin: None,
            })
            .collect()
    }

    pub fn to_status_response(&self, wallet: Option<WalletResponse>) -> AggregationStatusResponse {
        AggregationStatusResponse {
            job_id: self.job_id,
            status: self.status,
            is_final: self.final_emitted,
            accounts: self.accounts.clone(),
            chains: self.chains.clone(),
            expected_total: self.expected_total,
            processed_count: self.processed_count(),
            succeeded: self.succeeded,
            failed: self.failed,
            timed_out: self.timed_out,
            created_at_utc: self.created_at_utc,
            completed_at_utc: self.completed_at_utc,
            items: self.items.clone(),
            wallet,
        }
    }
}

/// Registry of in-flight aggregation jobs. Every mutation of one job is
/// serialized; different jobs never contend.
#[async_trait]
pub trait AggregationJobStore: Send + Sync {
    /// Register a job with one item per planned request. Returns the
    /// snapshot and whether the job was newly created; an existing `job_id`
    /// is left untouched.
    async fn create_job(
        &self,
        job_id: Uuid,
        accounts: Vec<String>,
        chains: Vec<Chain>,
        planned: Vec<PlannedRequest>,
    ) -> Result<(JobSnapshot, bool)>;

    /// Apply one provider result. For successful results `additions` are
    /// added to the job in the same exclusive section, so no finality check
    /// can observe the result without the follow-up work it triggered.
    async fn record_result(
        &self,
        job_id: Uuid,
        record: ResultRecord,
        additions: Vec<PlannedRequest>,
    ) -> Result<RecordOutcome>;

    /// Add requests to an open job; returns the ones that were not already present
    async fn increment_expected(&self, job_id: Uuid, additions: Vec<PlannedRequest>) -> Result<Vec<PlannedRequest>>;

    /// The finality gate. Returns the final snapshot to exactly one caller.
    async fn try_mark_final(&self, job_id: Uuid, reason: Finalization) -> Result<Option<JobSnapshot>>;

    /// The winner of `try_mark_final` owns publication of the completion.
    /// If that publication failed, this hands it to exactly one retrying
    /// caller: returns the snapshot when the job is final, unpublished and
    /// nobody else is publishing it.
    async fn claim_publication(&self, job_id: Uuid) -> Result<Option<JobSnapshot>>;

    /// Release the publication claim; `published` records success
    async fn complete_publication(&self, job_id: Uuid, published: bool) -> Result<()>;

    /// Final jobs whose completion was never published and is not in flight
    async fn list_unpublished_final_jobs(&self) -> Result<Vec<Uuid>>;

    async fn get_snapshot(&self, job_id: Uuid) -> Result<Option<JobSnapshot>>;

    async fn list_open_jobs_older_than(&self, age: Duration) -> Result<Vec<Uuid>>;

    /// Success payloads in arrival order
    async fn successful_payloads(&self, job_id: Uuid) -> Result<Vec<serde_json::Value>>;

    async fn attach_response(&self, job_id: Uuid, response: WalletResponse) -> Result<()>;

    async fn status_response(&self, job_id: Uuid) -> Result<Option<AggregationStatusResponse>>;

    /// Remove final jobs completed more than `retention` ago
    async fn purge_terminal_older_than(&self, retention: Duration) -> Result<usize>;
}

#[derive(Debug, Clone)]
struct JobItem {
    request_id: Uuid,
    account: String,
    provider: IntegrationProvider,
    chain: Chain,
    origin: Option<Uuid>,
    status: IntegrationStatus,
    finished_at_utc: Option<DateTime<Utc>>,
    error_code: Option<String>,
}

impl From<&PlannedRequest> for JobItem {
    fn from(planned: &PlannedRequest) -> Self {
        Self {
            request_id: planned.request_id,
            account: planned.account.clone(),
            provider: planned.provider,
            chain: planned.chain,
            origin: planned.origin,
            status: IntegrationStatus::Pending,
            finished_at_utc: None,
            error_code: None,
        }
    }
}

/// Publication state of a final job's completion event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Publication {
    NotPublished,
    InFlight,
    Published,
}

#[derive(Debug)]
struct AggregationJob {
    job_id: Uuid,
    accounts: Vec<String>,
    chains: Vec<Chain>,
    status: JobStatus,
    created_at_utc: DateTime<Utc>,
    completed_at_utc: Option<DateTime<Utc>>,
    expected_total: u32,
    succeeded: u32,
    failed: u32,
    timed_out: u32,
    final_emitted: bool,
    publication: Publication,
    items: Vec<JobItem>,
    identities: HashSet<(String, IntegrationProvider, Chain)>,
    payloads: Vec<serde_json::Value>,
    late_results: u32,
    wallet: Option<WalletResponse>,
}

impl AggregationJob {
    fn new(job_id: Uuid, accounts: Vec<String>, chains: Vec<Chain>, planned: Vec<PlannedRequest>) -> Self {
        let mut job = Self {
            job_id,
            accounts,
            chains,
            status: JobStatus::Pending,
            created_at_utc: Utc::now(),
            completed_at_utc: None,
            expected_total: 0,
            succeeded: 0,
            failed: 0,
            timed_out: 0,
            final_emitted: false,
            publication: Publication::NotPublished,
            items: Vec::new(),
            identities: HashSet::new(),
            payloads: Vec::new(),
            late_results: 0,
            wallet: None,
        };
        job.add_requests(planned);
        job
    }

    fn processed_count(&self) -> u32 {
        self.succeeded + self.failed + self.timed_out
    }

    fn add_requests(&mut self, additions: Vec<PlannedRequest>) -> Vec<PlannedRequest> {
        let mut added = Vec::new();
        for planned in additions {
            if self.identities.insert(planned.identity()) {
                self.items.push(JobItem::from(&planned));
                added.push(planned);
            }
        }
        self.expected_total += added.len() as u32;
        added
    }

    fn apply_terminal(&mut self, index: usize, record: ResultRecord) {
        let item = &mut self.items[index];
        item.status = record.status;
        item.finished_at_utc = Some(record.finished_at_utc);
        item.error_code = record.error_code;

        match record.status {
            IntegrationStatus::Success => {
                self.succeeded += 1;
                if let Some(payload) = record.payload {
                    self.payloads.push(payload);
                }
            }
            IntegrationStatus::TimedOut => self.timed_out += 1,
            // cancelled counts as failed
            _ => self.failed += 1,
        }
    }

    fn natural_status(&self) -> JobStatus {
        if self.failed + self.timed_out == 0 {
            JobStatus::Completed
        } else {
            JobStatus::CompletedWithErrors
        }
    }

    fn finalize(&mut self, reason: Finalization) -> bool {
        if self.final_emitted {
            return false;
        }

        match reason {
            Finalization::Natural => {
                if self.processed_count() != self.expected_total {
                    return false;
                }
                self.status = self.natural_status();
            }
            Finalization::Deadline => {
                let now = Utc::now();
                let mut forced = 0;
                for item in self.items.iter_mut().filter(|i| !i.status.is_terminal()) {
                    item.status = IntegrationStatus::TimedOut;
                    item.finished_at_utc = Some(now);
                    item.error_code = Some(DEADLINE_ERROR_CODE.to_string());
                    forced += 1;
                }
                self.timed_out += forced;
                self.status = if forced == 0 {
                    self.natural_status()
                } else if self.succeeded == 0 {
                    JobStatus::TimedOut
                } else {
                    JobStatus::CompletedWithErrors
                };
            }
        }

        self.final_emitted = true;
        self.publication = Publication::InFlight;
        self.completed_at_utc = Some(Utc::now());
        true
    }

    /// Unanswered requests that the result of `request_id` expanded into
    fn pending_follow_ups(&self, request_id: Uuid) -> Vec<PlannedRequest> {
        self.items
            .iter()
            .filter(|item| item.origin == Some(request_id) && item.status == IntegrationStatus::Pending)
            .map(|item| PlannedRequest {
                request_id: item.request_id,
                account: item.account.clone(),
                provider: item.provider,
                chain: item.chain,
                origin: item.origin,
            })
            .collect()
    }

    fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            job_id: self.job_id,
            status: self.status,
            accounts: self.accounts.clone(),
            chains: self.chains.clone(),
            expected_total: self.expected_total,
            succeeded: self.succeeded,
            failed: self.failed,
            timed_out: self.timed_out,
            final_emitted: self.final_emitted,
            completion_published: self.publication == Publication::Published,
            created_at_utc: self.created_at_utc,
            completed_at_utc: self.completed_at_utc,
            items: self
                .items
                .iter()
                .map(|item| ProviderProgress {
                    request_id: item.request_id,
                    provider: item.provider,
                    chain: item.chain,
                    account: item.account.clone(),
                    status: item.status,
                    finished_at_utc: item.finished_at_utc,
                    error_code: item.error_code.clone(),
                })
                .collect(),
        }
    }
}

type JobHandle = Arc<Mutex<AggregationJob>>;

/// Process-local job store. The map lock is only held to look up or insert
/// handles; all job mutation happens under the job's own mutex.
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<Uuid, JobHandle>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn job(&self, job_id: Uuid) -> Option<JobHandle> {
        self.jobs.read().await.get(&job_id).cloned()
    }

    async fn handles(&self) -> Vec<(Uuid, JobHandle)> {
        self.jobs
            .read()
            .await
            .iter()
            .map(|(id, handle)| (*id, handle.clone()))
            .collect()
    }

    pub async fn job_count(&self) -> usize {
        self.jobs.read().await.len()
    }

    /// Results that arrived after the job was final
    pub async fn late_result_count(&self, job_id: Uuid) -> Option<u32> {
        let handle = self.job(job_id).await?;
        let job = handle.lock().await;
        Some(job.late_results)
    }
}

fn cutoff(age: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(age).ok().map(|age| Utc::now() - age)
}

#[async_trait]
impl AggregationJobStore for InMemoryJobStore {
    async fn create_job(
        &self,
        job_id: Uuid,
        accounts: Vec<String>,
        chains: Vec<Chain>,
        planned: Vec<PlannedRequest>,
    ) -> Result<(JobSnapshot, bool)> {
        let mut jobs = self.jobs.write().await;
        if let Some(existing) = jobs.get(&job_id).cloned() {
            drop(jobs);
            debug!("Job {} already exists, keeping it", job_id);
            let job = existing.lock().await;
            return Ok((job.snapshot(), false));
        }

        let job = AggregationJob::new(job_id, accounts, chains, planned);
        let snapshot = job.snapshot();
        jobs.insert(job_id, Arc::new(Mutex::new(job)));
        Ok((snapshot, true))
    }

    async fn record_result(
        &self,
        job_id: Uuid,
        record: ResultRecord,
        additions: Vec<PlannedRequest>,
    ) -> Result<RecordOutcome> {
        let Some(handle) = self.job(job_id).await else {
            return Ok(RecordOutcome::UnknownJob);
        };
        let mut job = handle.lock().await;

        if job.final_emitted {
            job.late_results += 1;
            info!(
                "Late result for final job {}: request {} ({}, {:?})",
                job_id, record.request_id, record.provider, record.status
            );
            return Ok(RecordOutcome::AfterFinal);
        }

        let Some(index) = job
            .items
            .iter()
            .position(|item| item.request_id == record.request_id)
        else {
            return Ok(RecordOutcome::UnknownRequest);
        };

        if job.items[index].provider != record.provider {
            warn!(
                "Result for request {} claims provider {} but {} was dispatched",
                record.request_id, record.provider, job.items[index].provider
            );
            return Ok(RecordOutcome::UnknownRequest);
        }

        if job.items[index].status.is_terminal() {
            return Ok(RecordOutcome::Duplicate {
                snapshot: job.snapshot(),
                follow_ups: job.pending_follow_ups(record.request_id),
            });
        }

        if job.status == JobStatus::Pending {
            job.status = JobStatus::Running;
        }

        if !record.status.is_terminal() {
            job.items[index].status = record.status;
            return Ok(RecordOutcome::Progress);
        }

        let succeeded = record.status == IntegrationStatus::Success;
        job.apply_terminal(index, record);
        let added = if succeeded {
            job.add_requests(additions)
        } else {
            Vec::new()
        };

        Ok(RecordOutcome::Recorded {
            added,
            snapshot: job.snapshot(),
        })
    }

    async fn increment_expected(&self, job_id: Uuid, additions: Vec<PlannedRequest>) -> Result<Vec<PlannedRequest>> {
        let handle = self
            .job(job_id)
            .await
            .ok_or(OrchestratorError::JobNotFound(job_id))?;
        let mut job = handle.lock().await;
        if job.final_emitted {
            return Err(OrchestratorError::JobTerminal(job_id));
        }
        Ok(job.add_requests(additions))
    }

    async fn try_mark_final(&self, job_id: Uuid, reason: Finalization) -> Result<Option<JobSnapshot>> {
        let Some(handle) = self.job(job_id).await else {
            return Ok(None);
        };
        let mut job = handle.lock().await;
        if !job.finalize(reason) {
            return Ok(None);
        }
        info!(
            "Job {} final ({:?}): {} ok, {} failed, {} timed out of {}",
            job_id, job.status, job.succeeded, job.failed, job.timed_out, job.expected_total
        );
        Ok(Some(job.snapshot()))
    }

    async fn claim_publication(&self, job_id: Uuid) -> Result<Option<JobSnapshot>> {
        let Some(handle) = self.job(job_id).await else {
            return Ok(None);
        };
        let mut job = handle.lock().await;
        if !job.final_emitted || job.publication != Publication::NotPublished {
            return Ok(None);
        }
        job.publication = Publication::InFlight;
        Ok(Some(job.snapshot()))
    }

    async fn complete_publication(&self, job_id: Uuid, published: bool) -> Result<()> {
        // a job purged in the meantime has nothing left to track
        if let Some(handle) = self.job(job_id).await {
            let mut job = handle.lock().await;
            if job.publication == Publication::InFlight {
                job.publication = if published {
                    Publication::Published
                } else {
                    Publication::NotPublished
                };
            }
        }
        Ok(())
    }

    async fn list_unpublished_final_jobs(&self) -> Result<Vec<Uuid>> {
        let mut unpublished = Vec::new();
        for (job_id, handle) in self.handles().await {
            let job = handle.lock().await;
            if job.final_emitted && job.publication == Publication::NotPublished {
                unpublished.push(job_id);
            }
        }
        Ok(unpublished)
    }

    async fn get_snapshot(&self, job_id: Uuid) -> Result<Option<JobSnapshot>> {
        match self.job(job_id).await {
            Some(handle) => Ok(Some(handle.lock().await.snapshot())),
            None => Ok(None),
        }
    }

    async fn list_open_jobs_older_than(&self, age: Duration) -> Result<Vec<Uuid>> {
        let Some(cutoff) = cutoff(age) else {
            return Ok(Vec::new());
        };
        let mut open = Vec::new();
        for (job_id, handle) in self.handles().await {
            let job = handle.lock().await;
            if !job.final_emitted && job.created_at_utc <= cutoff {
                open.push(job_id);
            }
        }
        Ok(open)
    }

    async fn successful_payloads(&self, job_id: Uuid) -> Result<Vec<serde_json::Value>> {
        let handle = self
            .job(job_id)
            .await
            .ok_or(OrchestratorError::JobNotFound(job_id))?;
        let job = handle.lock().await;
        Ok(job.payloads.clone())
    }

    async fn attach_response(&self, job_id: Uuid, response: WalletResponse) -> Result<()> {
        let handle = self
            .job(job_id)
            .await
            .ok_or(OrchestratorError::JobNotFound(job_id))?;
        handle.lock().await.wallet = Some(response);
        Ok(())
    }

    async fn status_response(&self, job_id: Uuid) -> Result<Option<AggregationStatusResponse>> {
        match self.job(job_id).await {
            Some(handle) => {
                let job = handle.lock().await;
                Ok(Some(job.snapshot().to_status_response(job.wallet.clone())))
            }
            None => Ok(None),
        }
    }

    async fn purge_terminal_older_than(&self, retention: Duration) -> Result<usize> {
        let Some(cutoff) = cutoff(retention) else {
            return Ok(0);
        };
        let mut expired = Vec::new();
        for (job_id, handle) in self.handles().await {
            let job = handle.lock().await;
            if job.final_emitted && job.completed_at_utc.is_some_and(|at| at <= cutoff) {
                expired.push(job_id);
            }
        }

        if !expired.is_empty() {
            let mut jobs = self.jobs.write().await;
            for job_id in &expired {
                jobs.remove(job_id);
            }
            debug!("Purged {} terminal jobs", expired.len());
        }
        Ok(expired.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planned(provider: IntegrationProvider, chain: Chain) -> PlannedRequest {
        PlannedRequest::new("0xAbC", provider, chain)
    }

    fn record(request: &PlannedRequest, status: IntegrationStatus) -> ResultRecord {
        ResultRecord {
            request_id: request.request_id,
            provider: request.provider,
            status,
            finished_at_utc: Utc::now(),
            error_code: (status == IntegrationStatus::Failed).then(|| "boom".to_string()),
            payload: (status == IntegrationStatus::Success).then(|| serde_json::json!([])),
        }
    }

    async fn store_with(requests: &[PlannedRequest]) -> (InMemoryJobStore, Uuid) {
        let store = InMemoryJobStore::new();
        let job_id = Uuid::new_v4();
        store
            .create_job(job_id, vec!["0xAbC".to_string()], vec![Chain::Ethereum], requests.to_vec())
            .await
            .unwrap();
        (store, job_id)
    }

    fn assert_counters(snapshot: &JobSnapshot) {
        assert_eq!(
            snapshot.processed_count(),
            snapshot.succeeded + snapshot.failed + snapshot.timed_out
        );
        assert!(snapshot.processed_count() <= snapshot.expected_total);
    }

    #[tokio::test]
    async fn test_create_job_is_idempotent() {
        let requests = vec![planned(IntegrationProvider::MoralisTokens, Chain::Ethereum)];
        let (store, job_id) = store_with(&requests).await;

        let (snapshot, created) = store
            .create_job(job_id, vec![], vec![], vec![planned(IntegrationProvider::MoralisNfts, Chain::Base)])
            .await
            .unwrap();

        assert!(!created);
        assert_eq!(snapshot.expected_total, 1);
        assert_eq!(snapshot.status, JobStatus::Pending);
        assert_eq!(snapshot.pending_requests(), requests);
    }

    #[tokio::test]
    async fn test_record_result_counts_and_dedups() {
        let requests = vec![
            planned(IntegrationProvider::MoralisTokens, Chain::Ethereum),
            planned(IntegrationProvider::MoralisNfts, Chain::Ethereum),
        ];
        let (store, job_id) = store_with(&requests).await;

        let first = store
            .record_result(job_id, record(&requests[0], IntegrationStatus::Success), vec![])
            .await
            .unwrap();
        let RecordOutcome::Recorded { snapshot, added } = first else {
            panic!("expected Recorded, got {:?}", first);
        };
        assert!(added.is_empty());
        assert_eq!(snapshot.status, JobStatus::Running);
        assert_eq!(snapshot.succeeded, 1);
        assert_counters(&snapshot);

        let again = store
            .record_result(job_id, record(&requests[0], IntegrationStatus::Failed), vec![])
            .await
            .unwrap();
        assert!(matches!(
            again,
            RecordOutcome::Duplicate { ref snapshot, ref follow_ups }
                if snapshot.succeeded == 1 && snapshot.failed == 0 && follow_ups.is_empty()
        ));

        let progress = store
            .record_result(job_id, record(&requests[1], IntegrationStatus::InProgress), vec![])
            .await
            .unwrap();
        assert_eq!(progress, RecordOutcome::Progress);

        let unknown = store
            .record_result(Uuid::new_v4(), record(&requests[1], IntegrationStatus::Success), vec![])
            .await
            .unwrap();
        assert_eq!(unknown, RecordOutcome::UnknownJob);

        let stray = planned(IntegrationProvider::MoralisTokens, Chain::Base);
        let outcome = store
            .record_result(job_id, record(&stray, IntegrationStatus::Success), vec![])
            .await
            .unwrap();
        assert_eq!(outcome, RecordOutcome::UnknownRequest);
    }

    #[tokio::test]
    async fn test_additions_applied_with_success_only() {
        let requests = vec![
            planned(IntegrationProvider::MoralisNfts, Chain::Ethereum),
            planned(IntegrationProvider::MoralisTokens, Chain::Ethereum),
        ];
        let (store, job_id) = store_with(&requests).await;

        let failed = store
            .record_result(
                job_id,
                record(&requests[1], IntegrationStatus::Failed),
                vec![planned(IntegrationProvider::AaveV3Positions, Chain::Ethereum)],
            )
            .await
            .unwrap();
        assert!(matches!(failed, RecordOutcome::Recorded { ref added, .. } if added.is_empty()));

        let outcome = store
            .record_result(
                job_id,
                record(&requests[0], IntegrationStatus::Success),
                vec![
                    planned(IntegrationProvider::UniswapV3Positions, Chain::Ethereum),
                    PlannedRequest::new("0xabc", IntegrationProvider::UniswapV3Positions, Chain::Ethereum),
                    // already dispatched
                    planned(IntegrationProvider::MoralisTokens, Chain::Ethereum),
                ],
            )
            .await
            .unwrap();

        let RecordOutcome::Recorded { added, snapshot } = outcome else {
            panic!("expected Recorded");
        };
        assert_eq!(added.len(), 1);
        assert_eq!(snapshot.expected_total, 3);
        assert!(!snapshot.all_processed());
        assert_eq!(store.try_mark_final(job_id, Finalization::Natural).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_natural_finalization_derives_status() {
        let requests = vec![
            planned(IntegrationProvider::MoralisTokens, Chain::Ethereum),
            planned(IntegrationProvider::MoralisNfts, Chain::Ethereum),
        ];
        let (store, job_id) = store_with(&requests).await;
        store
            .record_result(job_id, record(&requests[0], IntegrationStatus::Success), vec![])
            .await
            .unwrap();
        store
            .record_result(job_id, record(&requests[1], IntegrationStatus::Cancelled), vec![])
            .await
            .unwrap();

        let snapshot = store
            .try_mark_final(job_id, Finalization::Natural)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.status, JobStatus::CompletedWithErrors);
        assert!(snapshot.final_emitted);
        assert_eq!(snapshot.failed_providers(), vec!["moralis-nfts".to_string()]);
        assert_eq!(store.try_mark_final(job_id, Finalization::Natural).await.unwrap(), None);
        assert_eq!(store.try_mark_final(job_id, Finalization::Deadline).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_empty_job_completes_immediately() {
        let (store, job_id) = store_with(&[]).await;
        let snapshot = store
            .try_mark_final(job_id, Finalization::Natural)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.status, JobStatus::Completed);
        assert_eq!(snapshot.expected_total, 0);
    }

    #[tokio::test]
    async fn test_deadline_times_out_pending_items() {
        let requests = vec![
            planned(IntegrationProvider::MoralisTokens, Chain::Ethereum),
            planned(IntegrationProvider::MoralisNfts, Chain::Ethereum),
            planned(IntegrationProvider::AaveV3Positions, Chain::Ethereum),
        ];
        let (store, job_id) = store_with(&requests).await;
        store
            .record_result(job_id, record(&requests[0], IntegrationStatus::Success), vec![])
            .await
            .unwrap();
        store
            .record_result(job_id, record(&requests[1], IntegrationStatus::InProgress), vec![])
            .await
            .unwrap();

        let snapshot = store
            .try_mark_final(job_id, Finalization::Deadline)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(snapshot.status, JobStatus::CompletedWithErrors);
        assert_eq!(snapshot.timed_out, 2);
        assert!(snapshot.all_processed());
        assert_counters(&snapshot);
        assert_eq!(
            snapshot.timed_out_providers(),
            vec!["aave-v3-positions".to_string(), "moralis-nfts".to_string()]
        );
        assert!(snapshot
            .items
            .iter()
            .filter(|i| i.status == IntegrationStatus::TimedOut)
            .all(|i| i.error_code.as_deref() == Some(DEADLINE_ERROR_CODE)));
    }

    #[tokio::test]
    async fn test_deadline_without_success_is_timed_out() {
        let requests = vec![planned(IntegrationProvider::SolanaTokens, Chain::Solana)];
        let (store, job_id) = store_with(&requests).await;

        let snapshot = store
            .try_mark_final(job_id, Finalization::Deadline)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.status, JobStatus::TimedOut);
    }

    #[tokio::test]
    async fn test_results_after_final_are_audited_only() {
        let requests = vec![planned(IntegrationProvider::MoralisTokens, Chain::Ethereum)];
        let (store, job_id) = store_with(&requests).await;
        store.try_mark_final(job_id, Finalization::Deadline).await.unwrap();

        let outcome = store
            .record_result(job_id, record(&requests[0], IntegrationStatus::Success), vec![])
            .await
            .unwrap();
        assert_eq!(outcome, RecordOutcome::AfterFinal);
        assert_eq!(store.late_result_count(job_id).await, Some(1));

        let snapshot = store.get_snapshot(job_id).await.unwrap().unwrap();
        assert_eq!(snapshot.succeeded, 0);
        assert_eq!(snapshot.timed_out, 1);

        let err = store
            .increment_expected(job_id, vec![planned(IntegrationProvider::MoralisNfts, Chain::Ethereum)])
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::JobTerminal(_)));
    }

    #[tokio::test]
    async fn test_open_jobs_and_purge() {
        let requests = vec![planned(IntegrationProvider::MoralisTokens, Chain::Ethereum)];
        let (store, job_id) = store_with(&requests).await;

        assert_eq!(store.list_open_jobs_older_than(Duration::ZERO).await.unwrap(), vec![job_id]);
        assert!(store
            .list_open_jobs_older_than(Duration::from_secs(3600))
            .await
            .unwrap()
            .is_empty());

        assert_eq!(store.purge_terminal_older_than(Duration::ZERO).await.unwrap(), 0);
        store.try_mark_final(job_id, Finalization::Deadline).await.unwrap();
        assert!(store.list_open_jobs_older_than(Duration::ZERO).await.unwrap().is_empty());
        assert_eq!(store.purge_terminal_older_than(Duration::from_secs(3600)).await.unwrap(), 0);
        assert_eq!(store.purge_terminal_older_than(Duration::ZERO).await.unwrap(), 1);
        assert_eq!(store.job_count().await, 0);
    }

    #[tokio::test]
    async fn test_status_response_carries_wallet() {
        let (store, job_id) = store_with(&[]).await;
        store.try_mark_final(job_id, Finalization::Natural).await.unwrap();
        store
            .attach_response(job_id, WalletResponse::default())
            .await
            .unwrap();

        let status = store.status_response(job_id).await.unwrap().unwrap();
        assert!(status.is_final);
        assert_eq!(status.status, JobStatus::Completed);
        assert!(status.wallet.is_some());
    }

    #[tokio::test]
    async fn test_failed_publication_can_be_claimed_once() {
        let (store, job_id) = store_with(&[]).await;

        // the finality winner holds the publication
        let snapshot = store.try_mark_final(job_id, Finalization::Natural).await.unwrap().unwrap();
        assert!(!snapshot.completion_published);
        assert!(store.claim_publication(job_id).await.unwrap().is_none());
        assert!(store.list_unpublished_final_jobs().await.unwrap().is_empty());

        store.complete_publication(job_id, false).await.unwrap();
        assert_eq!(store.list_unpublished_final_jobs().await.unwrap(), vec![job_id]);

        assert!(store.claim_publication(job_id).await.unwrap().is_some());
        assert!(store.claim_publication(job_id).await.unwrap().is_none());

        store.complete_publication(job_id, true).await.unwrap();
        let snapshot = store.get_snapshot(job_id).await.unwrap().unwrap();
        assert!(snapshot.completion_published);
        assert!(store.claim_publication(job_id).await.unwrap().is_none());
        assert!(store.list_unpublished_final_jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_job_cannot_be_claimed() {
        let requests = vec![planned(IntegrationProvider::MoralisTokens, Chain::Ethereum)];
        let (store, job_id) = store_with(&requests).await;
        assert!(store.claim_publication(job_id).await.unwrap().is_none());
        assert!(store.claim_publication(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_returns_unanswered_follow_ups() {
        let requests = vec![
            planned(IntegrationProvider::MoralisNfts, Chain::Ethereum),
            planned(IntegrationProvider::MoralisTokens, Chain::Ethereum),
        ];
        let (store, job_id) = store_with(&requests).await;
        let follow_up = planned(IntegrationProvider::UniswapV3Positions, Chain::Ethereum)
            .with_origin(requests[0].request_id);

        let outcome = store
            .record_result(
                job_id,
                record(&requests[0], IntegrationStatus::Success),
                vec![follow_up.clone()],
            )
            .await
            .unwrap();
        assert!(matches!(outcome, RecordOutcome::Recorded { ref added, .. } if added.len() == 1));

        let again = store
            .record_result(job_id, record(&requests[0], IntegrationStatus::Success), vec![])
            .await
            .unwrap();
        let RecordOutcome::Duplicate { snapshot, follow_ups } = &again else {
            panic!("expected Duplicate, got {:?}", again);
        };
        assert_eq!(snapshot.expected_total, 3);
        assert_eq!(follow_ups, &vec![follow_up.clone()]);

        // once answered it is no longer republished
        store
            .record_result(job_id, record(&follow_up, IntegrationStatus::Success), vec![])
            .await
            .unwrap();
        let third = store
            .record_result(job_id, record(&requests[0], IntegrationStatus::Success), vec![])
            .await
            .unwrap();
        assert!(matches!(third, RecordOutcome::Duplicate { ref follow_ups, .. } if follow_ups.is_empty()));
    }
}
