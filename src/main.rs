use anyhow::Context;
use config_manager::{Backend, SystemConfig};
use futures::future::join_all;
use job_orchestrator::{
    queues, AggregationJobStore, DetectorRegistry, InMemoryJobStore, JobExpansionService, JobFinalizer,
    ProviderCatalog, RequestDispatchWorker, ResultAggregationWorker, TimeoutMonitor,
};
use message_bus::{InMemoryBus, MessageBus, RedisBus, ReliablePublisher};
use persistence_layer::RedisClient;
use price_service::{CoinMarketCapClient, InMemoryPriceCache, PriceCache, PriceService, QuoteProvider, RedisPriceCache};
use retry_utils::RetryPolicy;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

fn init_tracing(json_logs: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,wallet_aggregator=debug,job_orchestrator=debug".into());

    if json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = SystemConfig::load().context("loading configuration")?;
    init_tracing(config.system.json_logs);
    info!("Starting wallet aggregation orchestrator...");
    if config.system.debug_mode {
        debug!("Effective configuration: {}", config.to_json_value());
    }

    let uses_redis = config.bus.backend == Backend::Redis || config.price.cache_backend == Backend::Redis;
    let redis = if uses_redis {
        let client = RedisClient::new(&config.redis.url)
            .await
            .context("connecting to Redis")?;
        let health = client.health_check().await;
        if !health.connected {
            anyhow::bail!("Redis health check failed: {}", health.error.unwrap_or_default());
        }
        info!("Redis connection established ({}ms)", health.latency_ms);
        Some(client)
    } else {
        None
    };

    let bus: Arc<dyn MessageBus> = match (&config.bus.backend, &redis) {
        (Backend::Redis, Some(client)) => {
            let bus = RedisBus::new(client.clone());
            for queue in [queues::AGGREGATION_REQUESTS, queues::INTEGRATION_RESULTS] {
                bus.recover_in_flight(queue).await?;
            }
            Arc::new(bus)
        }
        _ => {
            warn!("Using in-process message bus; deliveries do not survive a restart");
            Arc::new(InMemoryBus::new())
        }
    };
    let publisher = ReliablePublisher::new(bus, RetryPolicy::new(config.bus.publish_retry_attempts));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: Vec<(String, JoinHandle<job_orchestrator::Result<()>>)> = Vec::new();

    let price_cache: Arc<dyn PriceCache> = match (&config.price.cache_backend, &redis) {
        (Backend::Redis, Some(client)) => Arc::new(RedisPriceCache::new(client.clone())),
        _ => {
            let cache = Arc::new(InMemoryPriceCache::new());
            let evicting = cache.clone();
            let mut shutdown = shutdown_rx.clone();
            tasks.push((
                "price-cache-eviction".to_string(),
                tokio::spawn(async move {
                    let mut interval = tokio::time::interval(Duration::from_secs(60));
                    loop {
                        tokio::select! {
                            _ = interval.tick() => {
                                let evicted = evicting.evict_expired().await;
                                if evicted > 0 {
                                    debug!("Evicted {} expired prices", evicted);
                                }
                            }
                            _ = shutdown.changed() => break,
                        }
                    }
                    Ok(())
                }),
            ));
            cache
        }
    };
    let quotes: Option<Arc<dyn QuoteProvider>> = if config.coinmarketcap.enabled {
        let client = CoinMarketCapClient::new(config.coinmarketcap.clone())?;
        info!("CoinMarketCap quotes enabled");
        Some(Arc::new(client))
    } else {
        info!("CoinMarketCap quotes disabled; prices come from peers, cache and heuristics");
        None
    };
    let prices = Arc::new(PriceService::new(config.price.clone(), price_cache, quotes));

    let store: Arc<dyn AggregationJobStore> = Arc::new(InMemoryJobStore::new());
    let mut finalizer = JobFinalizer::new(store.clone(), prices, publisher.clone());
    if let Some(client) = &redis {
        finalizer = finalizer.with_read_model_cache(client.clone(), config.aggregation.wallet_cache_ttl_seconds);
    }
    let finalizer = Arc::new(finalizer);

    let catalog = Arc::new(ProviderCatalog::from_config(&config)?);
    let expansion = Arc::new(JobExpansionService::new(
        DetectorRegistry::with_defaults(config.position_manager_map()),
        catalog.clone(),
    ));
    let poll_timeout = Duration::from_secs(config.bus.consumer_poll_timeout_seconds);

    let dispatcher = Arc::new(RequestDispatchWorker::new(
        store.clone(),
        catalog.clone(),
        publisher.clone(),
        finalizer.clone(),
        poll_timeout,
    ));
    let result_worker = Arc::new(ResultAggregationWorker::new(
        store.clone(),
        expansion,
        catalog,
        publisher,
        finalizer.clone(),
        poll_timeout,
    ));
    let monitor = Arc::new(TimeoutMonitor::from_config(store, finalizer, &config.aggregation));

    {
        let shutdown = shutdown_rx.clone();
        tasks.push((
            "request-dispatch".to_string(),
            tokio::spawn(async move { dispatcher.run(shutdown).await }),
        ));
    }
    for index in 0..config.system.result_workers.max(1) {
        let worker = result_worker.clone();
        let shutdown = shutdown_rx.clone();
        tasks.push((
            format!("result-worker-{}", index),
            tokio::spawn(async move { worker.run(shutdown).await }),
        ));
    }
    {
        let shutdown = shutdown_rx.clone();
        tasks.push((
            "timeout-monitor".to_string(),
            tokio::spawn(async move {
                monitor.run(shutdown).await;
                Ok(())
            }),
        ));
    }
    info!("🚀 Orchestrator running with {} background tasks", tasks.len());

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("Shutdown requested, draining workers...");
    shutdown_tx.send(true)?;

    let (names, handles): (Vec<_>, Vec<_>) = tasks.into_iter().unzip();
    for (name, outcome) in names.into_iter().zip(join_all(handles).await) {
        match outcome {
            Ok(Ok(())) => info!("{} stopped", name),
            Ok(Err(e)) => error!("{} stopped with error: {}", name, e),
            Err(e) => error!("{} panicked: {}", name, e),
        }
    }

    info!("Orchestrator stopped");
    Ok(())
}
