use chrono::Utc;
use config_manager::SystemConfig;
use futures::future::join_all;
use message_bus::ReliablePublisher;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;
use wallet_core::routing::{self, AGGREGATION_REQUESTED};
use wallet_core::{Chain, IntegrationProvider, WalletAggregationRequested};

use crate::consumer::consume;
use crate::job_store::{AggregationJobStore, Finalization, PlannedRequest};
use crate::{queues, JobFinalizer, OrchestratorError, Result};

#[derive(Debug, Clone)]
struct CatalogEntry {
    provider: IntegrationProvider,
    chains: Vec<Chain>,
    on_demand: bool,
    operation_timeout_seconds: u64,
}

/// Which providers are enabled on which chains
#[derive(Debug, Clone, Default)]
pub struct ProviderCatalog {
    entries: Vec<CatalogEntry>,
}

impl ProviderCatalog {
    pub fn from_config(config: &SystemConfig) -> Result<Self> {
        let default_timeout = config.aggregation.default_operation_timeout_seconds;
        let mut entries = Vec::new();
        for provider_config in config.providers.iter().filter(|p| p.enabled) {
            let provider = provider_config.parsed_provider()?;
            let chains = provider_config
                .parsed_chains()?
                .into_iter()
                .filter(|chain| provider.supports(*chain))
                .collect();
            entries.push(CatalogEntry {
                provider,
                chains,
                on_demand: provider_config.on_demand,
                operation_timeout_seconds: provider_config
                    .operation_timeout_seconds
                    .unwrap_or(default_timeout),
            });
        }
        Ok(Self { entries })
    }

    fn entry(&self, provider: IntegrationProvider) -> Option<&CatalogEntry> {
        self.entries.iter().find(|e| e.provider == provider)
    }

    pub fn is_enabled(&self, provider: IntegrationProvider, chain: Chain) -> bool {
        self.entry(provider)
            .is_some_and(|entry| entry.chains.contains(&chain))
    }

    pub fn operation_timeout(&self, provider: IntegrationProvider) -> Option<u64> {
        self.entry(provider).map(|e| e.operation_timeout_seconds)
    }

    /// `(provider, chain)` pairs for the initial fan-out. On-demand
    /// providers are only reached through expansion.
    pub fn fan_out_pairs(&self, chains: &[Chain]) -> Vec<(IntegrationProvider, Chain)> {
        let mut pairs = Vec::new();
        for chain in chains {
            for entry in self.entries.iter().filter(|e| !e.on_demand) {
                if entry.chains.contains(chain) && !pairs.contains(&(entry.provider, *chain)) {
                    pairs.push((entry.provider, *chain));
                }
            }
        }
        pairs
    }
}

/// Turns aggregation triggers into a job plus one published
/// `IntegrationRequest` per account and provider/chain pair
pub struct RequestDispatchWorker {
    store: Arc<dyn AggregationJobStore>,
    catalog: Arc<ProviderCatalog>,
    publisher: ReliablePublisher,
    finalizer: Arc<JobFinalizer>,
    poll_timeout: Duration,
}

impl RequestDispatchWorker {
    pub fn new(
        store: Arc<dyn AggregationJobStore>,
        catalog: Arc<ProviderCatalog>,
        publisher: ReliablePublisher,
        finalizer: Arc<JobFinalizer>,
        poll_timeout: Duration,
    ) -> Self {
        Self {
            store,
            catalog,
            publisher,
            finalizer,
            poll_timeout,
        }
    }

    /// Start an aggregation from inside the process
    pub async fn start_aggregation(&self, accounts: Vec<String>, chains: Vec<Chain>) -> Result<Uuid> {
        self.handle_request(WalletAggregationRequested {
            job_id: None,
            accounts,
            chains,
            requested_at_utc: Utc::now(),
        })
        .await
    }

    pub async fn handle_request(&self, request: WalletAggregationRequested) -> Result<Uuid> {
        let accounts: Vec<String> = request
            .accounts
            .iter()
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let chains: Vec<Chain> = request.chains.iter().copied().collect::<BTreeSet<_>>().into_iter().collect();
        if accounts.is_empty() {
            return Err(OrchestratorError::InvalidRequest("no accounts".to_string()));
        }
        if chains.is_empty() {
            return Err(OrchestratorError::InvalidRequest("no chains".to_string()));
        }

        let job_id = request.job_id.unwrap_or_else(Uuid::new_v4);
        let pairs = self.catalog.fan_out_pairs(&chains);
        let planned: Vec<PlannedRequest> = accounts
            .iter()
            .flat_map(|account| {
                pairs
                    .iter()
                    .map(move |(provider, chain)| PlannedRequest::new(account, *provider, *chain))
            })
            .collect();

        let (snapshot, created) = self
            .store
            .create_job(job_id, accounts.clone(), chains.clone(), planned)
            .await?;

        if !created {
            if snapshot.final_emitted {
                debug!("Trigger for final job {} ignored", job_id);
                if !snapshot.completion_published {
                    self.finalizer.resume(job_id).await?;
                }
                return Ok(job_id);
            }
            let pending = snapshot.pending_requests();
            warn!(
                "Trigger for existing job {} redelivered, republishing {} pending requests",
                job_id,
                pending.len()
            );
            self.publish_requests(job_id, &pending).await?;
            return Ok(job_id);
        }

        info!(
            "Created job {} for {} accounts on {:?}: {} requests",
            job_id,
            accounts.len(),
            chains,
            snapshot.expected_total
        );

        self.publish_requests(job_id, &snapshot.pending_requests()).await?;

        if snapshot.expected_total == 0 {
            info!("Job {} has no enabled providers, completing immediately", job_id);
            if let Some(final_snapshot) = self.store.try_mark_final(job_id, Finalization::Natural).await? {
                self.finalizer.finalize(&final_snapshot).await?;
            }
        }

        Ok(job_id)
    }

    /// Publish all requests concurrently; fails if any publish failed
    pub async fn publish_requests(&self, job_id: Uuid, requests: &[PlannedRequest]) -> Result<()> {
        let publishes = requests.iter().map(|planned| async move {
            let message = planned.to_request(job_id, self.catalog.operation_timeout(planned.provider));
            self.publisher
                .publish_json(&routing::request_key(planned.provider), &message)
                .await?;
            debug!(
                "Published request {} to {} on {} for job {}",
                planned.request_id, planned.provider, planned.chain, job_id
            );
            Ok::<(), OrchestratorError>(())
        });

        join_all(publishes).await.into_iter().collect()
    }

    /// Consume aggregation triggers until shutdown
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        consume(
            self.publisher.bus(),
            queues::AGGREGATION_REQUESTS,
            AGGREGATION_REQUESTED,
            self.poll_timeout,
            shutdown,
            |request: WalletAggregationRequested| async move {
                self.handle_request(request).await.map(|_| ())
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config_manager::ProviderConfig;

    fn provider(slug: &str, chains: &[&str], on_demand: bool, enabled: bool) -> ProviderConfig {
        ProviderConfig {
            provider: slug.to_string(),
            enabled,
            chains: chains.iter().map(|c| c.to_string()).collect(),
            on_demand,
            operation_timeout_seconds: None,
        }
    }

    #[test]
    fn test_fan_out_skips_on_demand_and_disabled() {
        let mut config = SystemConfig::default();
        config.providers = vec![
            provider("moralis-tokens", &["ethereum", "base"], false, true),
            provider("moralis-nfts", &["ethereum"], false, false),
            provider("uniswap-v3-positions", &["ethereum"], true, true),
            provider("solana-tokens", &["solana"], false, true),
        ];
        let catalog = ProviderCatalog::from_config(&config).unwrap();

        assert_eq!(
            catalog.fan_out_pairs(&[Chain::Ethereum]),
            vec![(IntegrationProvider::MoralisTokens, Chain::Ethereum)]
        );
        assert_eq!(catalog.fan_out_pairs(&[Chain::Solana, Chain::Base]).len(), 2);
        assert!(catalog.is_enabled(IntegrationProvider::UniswapV3Positions, Chain::Ethereum));
        assert!(!catalog.is_enabled(IntegrationProvider::MoralisNfts, Chain::Ethereum));
        assert!(catalog.fan_out_pairs(&[Chain::Optimism]).is_empty());
    }

    #[test]
    fn test_default_config_catalog() {
        let config = SystemConfig::default();
        let catalog = ProviderCatalog::from_config(&config).unwrap();

        let ethereum = catalog.fan_out_pairs(&[Chain::Ethereum]);
        assert!(ethereum.contains(&(IntegrationProvider::MoralisTokens, Chain::Ethereum)));
        assert!(!ethereum.iter().any(|(p, _)| *p == IntegrationProvider::UniswapV3Positions));
        assert_eq!(catalog.operation_timeout(IntegrationProvider::UniswapV3Positions), Some(90));
        assert_eq!(
            catalog.operation_timeout(IntegrationProvider::MoralisTokens),
            Some(config.aggregation.default_operation_timeout_seconds)
        );
    }
}
