use config::{Config, ConfigError, Environment, File};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};
use wallet_core::{Chain, IntegrationProvider};

#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("Configuration loading error: {0}")]
    ConfigLoad(#[from] ConfigError),
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

pub type Result<T> = std::result::Result<T, ConfigurationError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    /// General system settings
    pub system: SystemSettings,

    /// Redis connection shared by the bus and the price cache
    pub redis: RedisConfig,

    /// Message transport settings
    pub bus: BusConfig,

    /// Job lifecycle timings
    pub aggregation: AggregationConfig,

    /// Which providers run on which chains
    pub providers: Vec<ProviderConfig>,

    /// NFT position-manager contract per chain slug
    pub position_managers: HashMap<String, String>,

    /// Price resolution cascade settings
    pub price: PriceConfig,

    /// CoinMarketCap quote API configuration
    pub coinmarketcap: CoinMarketCapConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemSettings {
    /// Enable debug mode
    pub debug_mode: bool,

    /// Emit logs as JSON lines
    pub json_logs: bool,

    /// Number of concurrent result aggregation consumers
    pub result_workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// `memory` for a single-process deployment, `redis` for durable queues
    pub backend: Backend,

    /// How long a consumer blocks waiting for a delivery before re-checking shutdown
    pub consumer_poll_timeout_seconds: u64,

    /// Publish retry attempts on transient broker errors
    pub publish_retry_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationConfig {
    /// Deadline after which the timeout monitor forces a job terminal
    pub job_timeout_seconds: u64,

    /// Timeout monitor scan period
    pub timeout_scan_interval_seconds: u64,

    /// How long terminal jobs stay queryable before being reaped
    pub job_retention_seconds: u64,

    /// TTL of the finalized wallet response in the read model
    pub wallet_cache_ttl_seconds: u64,

    /// Operation timeout stamped on requests whose provider has no override
    pub default_operation_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider slug, e.g. "moralis-tokens"
    pub provider: String,

    /// Master switch for the provider
    pub enabled: bool,

    /// Chains the provider is enabled on
    pub chains: Vec<String>,

    /// Only dispatched by job expansion, never in the initial fan-out
    #[serde(default)]
    pub on_demand: bool,

    /// Per-request operation timeout override
    #[serde(default)]
    pub operation_timeout_seconds: Option<u64>,
}

impl ProviderConfig {
    pub fn parsed_provider(&self) -> Result<IntegrationProvider> {
        self.provider
            .parse()
            .map_err(|e: wallet_core::CoreError| ConfigurationError::InvalidValue(e.to_string()))
    }

    pub fn parsed_chains(&self) -> Result<Vec<Chain>> {
        self.chains
            .iter()
            .map(|chain| {
                chain.parse().map_err(|e: wallet_core::CoreError| {
                    ConfigurationError::InvalidValue(format!(
                        "provider '{}': {}",
                        self.provider, e
                    ))
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceConfig {
    /// Cache TTL for authoritative quotes
    pub quote_ttl_seconds: u64,

    /// Cache TTL for heuristic fallbacks
    pub heuristic_ttl_seconds: u64,

    /// Protocol ids whose unit prices are not trusted for peer inference
    pub excluded_peer_sources: Vec<String>,

    /// Wrapper/staking prefixes stripped to find a base token
    pub wrapper_prefixes: Vec<String>,

    /// `memory` or `redis`
    pub cache_backend: Backend,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoinMarketCapConfig {
    /// Enable the external quote lookup
    pub enabled: bool,

    /// CoinMarketCap API key
    pub api_key: String,

    /// CoinMarketCap API base URL
    pub api_base_url: String,

    /// Request timeout in seconds
    pub request_timeout_seconds: u64,

    /// Symbols per quote request
    pub batch_size: usize,
}

const EVM_CHAINS: [&str; 6] = [
    "ethereum",
    "base",
    "arbitrum",
    "optimism",
    "polygon",
    "binance-smart-chain",
];

fn provider(slug: &str, chains: &[&str], on_demand: bool, timeout: Option<u64>) -> ProviderConfig {
    ProviderConfig {
        provider: slug.to_string(),
        enabled: true,
        chains: chains.iter().map(|c| c.to_string()).collect(),
        on_demand,
        operation_timeout_seconds: timeout,
    }
}

impl Default for SystemConfig {
    fn default() -> Self {
        let position_manager = "0xC36442b4a4522E871399CD717aBDD847Ab11FE88".to_string();
        Self {
            system: SystemSettings {
                debug_mode: false,
                json_logs: false,
                result_workers: 2,
            },
            redis: RedisConfig {
                url: "redis://127.0.0.1:6379".to_string(),
            },
            bus: BusConfig {
                backend: Backend::Memory,
                consumer_poll_timeout_seconds: 1,
                publish_retry_attempts: 3,
            },
            aggregation: AggregationConfig {
                job_timeout_seconds: 120,
                timeout_scan_interval_seconds: 5,
                job_retention_seconds: 900,
                wallet_cache_ttl_seconds: 300,
                default_operation_timeout_seconds: 60,
            },
            providers: vec![
                provider("moralis-tokens", &EVM_CHAINS, false, None),
                provider("moralis-nfts", &EVM_CHAINS[..5], false, None),
                provider("aave-v3-positions", &EVM_CHAINS[..5], true, None),
                provider("uniswap-v3-positions", &EVM_CHAINS[..5], true, Some(90)),
                provider("solana-tokens", &["solana"], false, None),
                provider("raydium-clmm-positions", &["solana"], true, Some(90)),
                provider("kamino-lending", &["solana"], false, None),
            ],
            position_managers: HashMap::from([
                ("ethereum".to_string(), position_manager.clone()),
                ("arbitrum".to_string(), position_manager.clone()),
                ("optimism".to_string(), position_manager.clone()),
                ("polygon".to_string(), position_manager),
                (
                    "base".to_string(),
                    "0x03a520b32C04BF3bEEf7BEb72E919cf822Ed34f1".to_string(),
                ),
            ]),
            price: PriceConfig {
                quote_ttl_seconds: 3600,
                heuristic_ttl_seconds: 1800,
                excluded_peer_sources: vec![],
                wrapper_prefixes: vec![
                    "ve".to_string(),
                    "locked".to_string(),
                    "staked".to_string(),
                    "st".to_string(),
                ],
                cache_backend: Backend::Memory,
            },
            coinmarketcap: CoinMarketCapConfig {
                enabled: false, // Disabled by default until API key is provided
                api_key: "".to_string(),
                api_base_url: "https://pro-api.coinmarketcap.com".to_string(),
                request_timeout_seconds: 15,
                batch_size: 50,
            },
        }
    }
}

impl CoinMarketCapConfig {
    /// Validate CoinMarketCap configuration
    pub fn validate(&self) -> Result<()> {
        if self.enabled && self.api_key.is_empty() {
            return Err(ConfigurationError::InvalidValue(
                "CoinMarketCap API key is required when CoinMarketCap is enabled".to_string(),
            ));
        }

        if self.request_timeout_seconds == 0 {
            return Err(ConfigurationError::InvalidValue(
                "Request timeout must be greater than 0".to_string(),
            ));
        }

        if self.batch_size == 0 {
            return Err(ConfigurationError::InvalidValue(
                "CoinMarketCap batch size must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

impl AggregationConfig {
    /// Validate job timing configuration
    pub fn validate(&self) -> Result<()> {
        let checks = [
            ("job_timeout_seconds", self.job_timeout_seconds),
            ("timeout_scan_interval_seconds", self.timeout_scan_interval_seconds),
            ("default_operation_timeout_seconds", self.default_operation_timeout_seconds),
        ];
        for (name, value) in checks {
            if value == 0 {
                return Err(ConfigurationError::InvalidValue(format!(
                    "aggregation.{} must be greater than 0",
                    name
                )));
            }
        }
        Ok(())
    }
}

impl SystemConfig {
    /// Load configuration from file and environment variables
    pub fn load() -> Result<Self> {
        Self::load_from_path("config.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from_path<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config_builder = Config::builder()
            // Start with defaults
            .add_source(Config::try_from(&SystemConfig::default())?);

        // Add config file if it exists
        if config_path.as_ref().exists() {
            info!(
                "Loading configuration from: {}",
                config_path.as_ref().display()
            );
            config_builder = config_builder.add_source(File::from(config_path.as_ref()));
        } else {
            debug!("Config file not found, using defaults and environment variables");
        }

        // Add environment variables with prefix
        config_builder = config_builder.add_source(
            Environment::with_prefix("AGG")
                .try_parsing(true)
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("price.excluded_peer_sources")
                .with_list_parse_key("price.wrapper_prefixes"),
        );

        let mut system_config: SystemConfig = config_builder.build()?.try_deserialize()?;

        // Normalize provider chain names so aliases like "bsc" reach the
        // orchestrator in canonical form
        for provider in system_config.providers.iter_mut() {
            let original = provider.chains.clone();
            provider.chains = original
                .iter()
                .map(|chain| match normalize_chain(chain) {
                    Ok(slug) => slug,
                    Err(e) => {
                        warn!("Keeping unrecognized chain for {}: {}", provider.provider, e);
                        chain.clone()
                    }
                })
                .collect();

            if original != provider.chains {
                info!(
                    "Normalized chains for provider {}: {:?} -> {:?}",
                    provider.provider, original, provider.chains
                );
            }
        }

        system_config.position_managers = system_config
            .position_managers
            .into_iter()
            .map(|(chain, address)| (normalize_chain(&chain).unwrap_or(chain), address))
            .collect();

        // Validate configuration
        system_config.validate()?;

        Ok(system_config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        self.aggregation.validate()?;
        self.coinmarketcap.validate()?;

        if self.system.result_workers == 0 {
            return Err(ConfigurationError::InvalidValue(
                "system.result_workers must be at least 1".to_string(),
            ));
        }

        for provider in &self.providers {
            let parsed = provider.parsed_provider()?;
            for chain in provider.parsed_chains()? {
                if !parsed.supports(chain) {
                    return Err(ConfigurationError::InvalidValue(format!(
                        "provider '{}' cannot run on chain '{}'",
                        provider.provider, chain
                    )));
                }
            }
        }

        let address_pattern = Regex::new(r"^0x[0-9a-fA-F]{40}$")
            .map_err(|e| ConfigurationError::InvalidValue(e.to_string()))?;
        for (chain, address) in &self.position_managers {
            let parsed: Chain = chain.parse().map_err(|e: wallet_core::CoreError| {
                ConfigurationError::InvalidValue(format!("position_managers: {}", e))
            })?;
            if parsed.is_evm() && !address_pattern.is_match(address) {
                return Err(ConfigurationError::InvalidValue(format!(
                    "position manager for {} is not a valid address: '{}'",
                    chain, address
                )));
            }
        }

        Ok(())
    }

    /// Position-manager contracts keyed by parsed chain
    pub fn position_manager_map(&self) -> HashMap<Chain, String> {
        self.position_managers
            .iter()
            .filter_map(|(chain, address)| {
                chain
                    .parse::<Chain>()
                    .ok()
                    .map(|chain| (chain, address.to_lowercase()))
            })
            .collect()
    }

    /// Configuration as JSON with secrets masked, for startup diagnostics
    pub fn to_json_value(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        if let Some(key) = value.pointer_mut("/coinmarketcap/api_key") {
            if key.as_str().is_some_and(|k| !k.is_empty()) {
                *key = serde_json::Value::String("***".to_string());
            }
        }
        value
    }
}

/// Normalize a chain name to its canonical slug
pub fn normalize_chain(input: &str) -> std::result::Result<String, String> {
    input
        .parse::<Chain>()
        .map(|chain| chain.slug().to_string())
        .map_err(|e| e.to_string())
}
