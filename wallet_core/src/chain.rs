use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::CoreError;

/// Blockchain networks an aggregation can span
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Chain {
    Ethereum,
    Base,
    Arbitrum,
    Optimism,
    Polygon,
    BinanceSmartChain,
    Solana,
}

impl Chain {
    pub const ALL: [Chain; 7] = [
        Chain::Ethereum,
        Chain::Base,
        Chain::Arbitrum,
        Chain::Optimism,
        Chain::Polygon,
        Chain::BinanceSmartChain,
        Chain::Solana,
    ];

    pub fn slug(&self) -> &'static str {
        match self {
            Chain::Ethereum => "ethereum",
            Chain::Base => "base",
            Chain::Arbitrum => "arbitrum",
            Chain::Optimism => "optimism",
            Chain::Polygon => "polygon",
            Chain::BinanceSmartChain => "binance-smart-chain",
            Chain::Solana => "solana",
        }
    }

    pub fn is_evm(&self) -> bool {
        !matches!(self, Chain::Solana)
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

impl FromStr for Chain {
    type Err = CoreError;

    /// Accepts the canonical slug plus the common short names used by
    /// upstream data providers ("eth", "bsc", "arb", ...)
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "ethereum" | "eth" | "mainnet" => Ok(Chain::Ethereum),
            "base" => Ok(Chain::Base),
            "arbitrum" | "arb" | "arbitrum-one" => Ok(Chain::Arbitrum),
            "optimism" | "op" => Ok(Chain::Optimism),
            "polygon" | "matic" => Ok(Chain::Polygon),
            "binance" | "bsc" | "bnb" | "binance-smart-chain" | "binance smart chain" => {
                Ok(Chain::BinanceSmartChain)
            }
            "solana" | "sol" => Ok(Chain::Solana),
            _ => Err(CoreError::UnsupportedChain(input.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_aliases() {
        assert_eq!("BSC".parse::<Chain>().unwrap(), Chain::BinanceSmartChain);
        assert_eq!(" sol ".parse::<Chain>().unwrap(), Chain::Solana);
        assert!("cosmos".parse::<Chain>().is_err());
    }

    #[test]
    fn test_chain_serde_matches_slug() {
        for chain in Chain::ALL {
            let json = serde_json::to_string(&chain).unwrap();
            assert_eq!(json, format!("\"{}\"", chain.slug()));
        }
    }
}
