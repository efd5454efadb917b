use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{routing, Chain, CoreError};

/// A single upstream data source. Each provider has its own worker pool
/// listening on `integration.request.<slug>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IntegrationProvider {
    MoralisTokens,
    MoralisNfts,
    AaveV3Positions,
    UniswapV3Positions,
    SolanaTokens,
    RaydiumClmmPositions,
    KaminoLending,
}

impl IntegrationProvider {
    pub const ALL: [IntegrationProvider; 7] = [
        IntegrationProvider::MoralisTokens,
        IntegrationProvider::MoralisNfts,
        IntegrationProvider::AaveV3Positions,
        IntegrationProvider::UniswapV3Positions,
        IntegrationProvider::SolanaTokens,
        IntegrationProvider::RaydiumClmmPositions,
        IntegrationProvider::KaminoLending,
    ];

    pub fn slug(&self) -> &'static str {
        match self {
            IntegrationProvider::MoralisTokens => "moralis-tokens",
            IntegrationProvider::MoralisNfts => "moralis-nfts",
            IntegrationProvider::AaveV3Positions => "aave-v3-positions",
            IntegrationProvider::UniswapV3Positions => "uniswap-v3-positions",
            IntegrationProvider::SolanaTokens => "solana-tokens",
            IntegrationProvider::RaydiumClmmPositions => "raydium-clmm-positions",
            IntegrationProvider::KaminoLending => "kamino-lending",
        }
    }

    /// Whether the provider can serve the given chain at all. Configuration
    /// narrows this further per deployment.
    pub fn supports(&self, chain: Chain) -> bool {
        match self {
            IntegrationProvider::SolanaTokens
            | IntegrationProvider::RaydiumClmmPositions
            | IntegrationProvider::KaminoLending => chain == Chain::Solana,
            _ => chain.is_evm(),
        }
    }

    pub fn request_routing_key(&self) -> String {
        routing::request_key(*self)
    }

    pub fn result_routing_key(&self) -> String {
        routing::result_key(*self)
    }
}

impl fmt::Display for IntegrationProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

impl FromStr for IntegrationProvider {
    type Err = CoreError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase().replace('_', "-");
        IntegrationProvider::ALL
            .into_iter()
            .find(|provider| provider.slug() == normalized)
            .ok_or_else(|| CoreError::UnknownProvider(input.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_parse_accepts_snake_case() {
        assert_eq!(
            "uniswap_v3_positions".parse::<IntegrationProvider>().unwrap(),
            IntegrationProvider::UniswapV3Positions
        );
        assert!("zapper".parse::<IntegrationProvider>().is_err());
    }

    #[test]
    fn test_provider_chain_support() {
        assert!(IntegrationProvider::MoralisTokens.supports(Chain::Base));
        assert!(!IntegrationProvider::MoralisTokens.supports(Chain::Solana));
        assert!(IntegrationProvider::KaminoLending.supports(Chain::Solana));
    }
}
