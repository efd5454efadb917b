use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;
use wallet_core::{IntegrationResult, IntegrationStatus};

use crate::detectors::{DetectorRegistry, Trigger};
use crate::dispatch::ProviderCatalog;
use crate::job_store::{AggregationJobStore, PlannedRequest};
use crate::Result;

/// Turns detector triggers into follow-up requests for a running job
pub struct JobExpansionService {
    registry: DetectorRegistry,
    catalog: Arc<ProviderCatalog>,
}

impl JobExpansionService {
    pub fn new(registry: DetectorRegistry, catalog: Arc<ProviderCatalog>) -> Self {
        Self { registry, catalog }
    }

    /// Follow-up requests called for by a successful result. Triggers for
    /// providers disabled on the chain are dropped; duplicates against the
    /// job's existing requests are removed by the job store.
    pub fn plan_expansion(&self, result: &IntegrationResult) -> Vec<PlannedRequest> {
        if result.status != IntegrationStatus::Success {
            return Vec::new();
        }

        let mut triggers: Vec<Trigger> = Vec::new();
        for chain in &result.chains {
            for trigger in self.registry.detect(result.provider, &result.payload, *chain) {
                if !self.catalog.is_enabled(trigger.provider, trigger.chain) {
                    debug!(
                        "Trigger {} on {} ignored: provider disabled on chain",
                        trigger.provider, trigger.chain
                    );
                    continue;
                }
                if !triggers.contains(&trigger) {
                    triggers.push(trigger);
                }
            }
        }

        triggers
            .into_iter()
            .map(|t| PlannedRequest::new(&result.account, t.provider, t.chain).with_origin(result.request_id))
            .collect()
    }

    /// Plan and register follow-ups outside of result recording
    pub async fn expand(
        &self,
        store: &dyn AggregationJobStore,
        job_id: Uuid,
        result: &IntegrationResult,
    ) -> Result<Vec<PlannedRequest>> {
        let planned = self.plan_expansion(result);
        if planned.is_empty() {
            return Ok(planned);
        }
        let added = store.increment_expected(job_id, planned).await?;
        if !added.is_empty() {
            info!("Expanded job {} with {} requests", job_id, added.len());
        }
        Ok(added)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_store::InMemoryJobStore;
    use config_manager::SystemConfig;
    use serde_json::json;
    use wallet_core::{Chain, IntegrationProvider};

    fn service(config: &SystemConfig) -> JobExpansionService {
        let catalog = Arc::new(ProviderCatalog::from_config(config).unwrap());
        JobExpansionService::new(DetectorRegistry::with_defaults(config.position_manager_map()), catalog)
    }

    fn nft_result(job_id: Uuid, chain: Chain) -> IntegrationResult {
        let request = PlannedRequest::new("0xabc", IntegrationProvider::MoralisNfts, chain).to_request(job_id, None);
        IntegrationResult::for_request(
            &request,
            IntegrationStatus::Success,
            json!([{
                "token_address": "0xC36442b4a4522E871399CD717aBDD847Ab11FE88",
                "amount": "1",
                "decimals": 0
            }]),
        )
    }

    #[test]
    fn test_plan_expansion_for_position_nft() {
        let config = SystemConfig::default();
        let result = nft_result(Uuid::new_v4(), Chain::Ethereum);
        let planned = service(&config).plan_expansion(&result);

        assert_eq!(planned.len(), 1);
        assert_eq!(planned[0].provider, IntegrationProvider::UniswapV3Positions);
        assert_eq!(planned[0].chain, Chain::Ethereum);
        assert_eq!(planned[0].account, "0xabc");
        assert_eq!(planned[0].origin, Some(result.request_id));
    }

    #[test]
    fn test_disabled_follow_up_is_dropped() {
        let mut config = SystemConfig::default();
        for provider in config.providers.iter_mut() {
            if provider.provider == "uniswap-v3-positions" {
                provider.chains = vec!["arbitrum".to_string()];
            }
        }
        assert!(service(&config)
            .plan_expansion(&nft_result(Uuid::new_v4(), Chain::Ethereum))
            .is_empty());
    }

    #[test]
    fn test_failed_results_never_expand() {
        let config = SystemConfig::default();
        let mut result = nft_result(Uuid::new_v4(), Chain::Ethereum);
        result.status = IntegrationStatus::Failed;
        assert!(service(&config).plan_expansion(&result).is_empty());
    }

    #[tokio::test]
    async fn test_expand_twice_adds_once() {
        let config = SystemConfig::default();
        let store = InMemoryJobStore::new();
        let job_id = Uuid::new_v4();
        let initial = PlannedRequest::new("0xabc", IntegrationProvider::MoralisNfts, Chain::Ethereum);
        store
            .create_job(job_id, vec!["0xabc".to_string()], vec![Chain::Ethereum], vec![initial])
            .await
            .unwrap();

        let expansion = service(&config);
        let result = nft_result(job_id, Chain::Ethereum);
        let first = expansion.expand(&store, job_id, &result).await.unwrap();
        let second = expansion.expand(&store, job_id, &result).await.unwrap();

        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
        let snapshot = store.get_snapshot(job_id).await.unwrap().unwrap();
        assert_eq!(snapshot.expected_total, 2);
    }
}
