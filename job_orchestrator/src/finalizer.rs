use chrono::Utc;
use message_bus::ReliablePublisher;
use persistence_layer::RedisClient;
use price_service::PriceService;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use wallet_core::routing::{self, AGGREGATION_COMPLETED};
use wallet_core::{WalletAggregationCompleted, WalletItem, WalletResponse, COMPLETED_EVENT_VERSION};

use crate::job_store::{AggregationJobStore, JobSnapshot};
use crate::Result;

/// Wallet items in one provider payload: either a bare list or an object
/// with an `items` list. Entries that do not parse are skipped.
fn payload_items(payload: &Value) -> Vec<WalletItem> {
    let entries = match payload {
        Value::Array(entries) => entries.as_slice(),
        Value::Object(map) => match map.get("items") {
            Some(Value::Array(entries)) => entries.as_slice(),
            _ => &[],
        },
        _ => &[],
    };

    entries
        .iter()
        .filter_map(|entry| match serde_json::from_value::<WalletItem>(entry.clone()) {
            Ok(item) => Some(item),
            Err(e) => {
                debug!("Skipping malformed wallet item: {}", e);
                None
            }
        })
        .collect()
}

/// Merge success payloads in arrival order. Items with the same key
/// collapse into the last one seen; tokens inside a position likewise.
pub fn merge_payloads(payloads: &[Value]) -> Vec<WalletItem> {
    let mut merged: Vec<WalletItem> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for payload in payloads {
        for mut item in payload_items(payload) {
            item.position.dedup_tokens();
            let key = item.key();
            match index.get(&key) {
                Some(&position) => merged[position] = item,
                None => {
                    index.insert(key, merged.len());
                    merged.push(item);
                }
            }
        }
    }
    merged
}

/// Closes out a job that won the finality gate: merge, price, store and
/// announce. Shared by the result workers and the timeout monitor.
pub struct JobFinalizer {
    store: Arc<dyn AggregationJobStore>,
    prices: Arc<PriceService>,
    publisher: ReliablePublisher,
    read_model: Option<(RedisClient, u64)>,
}

impl JobFinalizer {
    pub fn new(store: Arc<dyn AggregationJobStore>, prices: Arc<PriceService>, publisher: ReliablePublisher) -> Self {
        Self {
            store,
            prices,
            publisher,
            read_model: None,
        }
    }

    /// Also keep the final status response in Redis for `ttl_seconds`
    pub fn with_read_model_cache(mut self, client: RedisClient, ttl_seconds: u64) -> Self {
        self.read_model = Some((client, ttl_seconds));
        self
    }

    /// Publish the outcome of a job whose publication the caller holds,
    /// either by winning `try_mark_final` or through `claim_publication`.
    /// The claim is released either way; on failure the job stays eligible
    /// for `resume`.
    pub async fn finalize(&self, snapshot: &JobSnapshot) -> Result<WalletResponse> {
        let outcome = self.publish_outcome(snapshot).await;
        self.store
            .complete_publication(snapshot.job_id, outcome.is_ok())
            .await?;
        outcome
    }

    /// Retry publication for a final job whose earlier attempt failed.
    /// Returns whether this call published it.
    pub async fn resume(&self, job_id: Uuid) -> Result<bool> {
        let Some(snapshot) = self.store.claim_publication(job_id).await? else {
            return Ok(false);
        };
        warn!("Retrying completion publication for job {}", job_id);
        self.finalize(&snapshot).await?;
        Ok(true)
    }

    async fn publish_outcome(&self, snapshot: &JobSnapshot) -> Result<WalletResponse> {
        let job_id = snapshot.job_id;
        let payloads = self.store.successful_payloads(job_id).await?;
        let mut items = merge_payloads(&payloads);
        let report = self.prices.resolve_prices(&mut items).await;

        let response = WalletResponse {
            accounts: snapshot.accounts.clone(),
            items,
            failed_providers: snapshot.failed_providers(),
            timed_out_providers: snapshot.timed_out_providers(),
            unpriced_symbols: report.unresolved.clone(),
        };
        self.store.attach_response(job_id, response.clone()).await?;

        let completed = WalletAggregationCompleted {
            version: COMPLETED_EVENT_VERSION,
            job_id,
            status: snapshot.status,
            accounts: snapshot.accounts.clone(),
            chains: snapshot.chains.clone(),
            expected_total: snapshot.expected_total,
            succeeded: snapshot.succeeded,
            failed: snapshot.failed,
            timed_out: snapshot.timed_out,
            failed_providers: response.failed_providers.clone(),
            timed_out_providers: response.timed_out_providers.clone(),
            total_value_usd: response.total_value_usd(),
            completed_at_utc: snapshot.completed_at_utc.unwrap_or_else(Utc::now),
        };
        self.publisher.publish_json(AGGREGATION_COMPLETED, &completed).await?;

        // The completion event is out; from here on nothing may fail the
        // publication, or a retry would emit it a second time.
        let status = snapshot.to_status_response(Some(response.clone()));
        if let Err(e) = self
            .publisher
            .publish_json(&routing::status_key(job_id), &status)
            .await
        {
            warn!("Failed to publish final status for job {}: {}", job_id, e);
        }

        if let Some((client, ttl)) = &self.read_model {
            let key = format!("aggregation:status:{}", job_id);
            match serde_json::to_string(&status) {
                Ok(json) => {
                    if let Err(e) = client.set_with_expiry(&key, &json, *ttl).await {
                        warn!("Failed to cache status for job {}: {}", job_id, e);
                    }
                }
                Err(e) => warn!("Failed to serialize status for job {}: {}", job_id, e),
            }
        }

        info!(
            "Job {} finalized as {:?}: {} items, ${} total, {} priced, {} unpriced symbols",
            job_id,
            snapshot.status,
            response.items.len(),
            completed.total_value_usd,
            report.total_resolved(),
            report.unresolved.len()
        );
        Ok(response)
    }
}
